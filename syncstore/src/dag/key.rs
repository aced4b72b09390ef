//! Layout of dag entries in the key-value table.
//!
//! | key              | value                              |
//! |------------------|------------------------------------|
//! | `c/<hash>/d`     | chunk data, JSON text              |
//! | `c/<hash>/m`     | chunk refs, postcard `Vec<Hash>`   |
//! | `c/<hash>/r`     | ref count, JSON integer text       |
//! | `h/<name>`       | head target, 32 raw hash bytes     |
#![allow(missing_docs)]

use syncstore_base::Hash;

pub(crate) const CHUNK_PREFIX: &str = "c/";
pub(crate) const HEAD_PREFIX: &str = "h/";

pub fn chunk_data_key(hash: &Hash) -> String {
    format!("{CHUNK_PREFIX}{hash}/d")
}

pub fn chunk_meta_key(hash: &Hash) -> String {
    format!("{CHUNK_PREFIX}{hash}/m")
}

pub fn chunk_ref_count_key(hash: &Hash) -> String {
    format!("{CHUNK_PREFIX}{hash}/r")
}

pub fn head_key(name: &str) -> String {
    format!("{HEAD_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_distinct_per_kind() {
        let h = Hash::fake("a");
        let keys = [
            chunk_data_key(&h),
            chunk_meta_key(&h),
            chunk_ref_count_key(&h),
            head_key(&h.to_string()),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(chunk_data_key(&h).starts_with(CHUNK_PREFIX));
        assert_eq!(head_key("main"), "h/main");
    }
}
