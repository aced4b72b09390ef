//! Immutable content addressed chunks.

use std::sync::Arc;

use serde_json::Value;
use syncstore_base::{Hash, InvalidHashError};

/// Computes the hash of a chunk from its data.
pub type ChunkHasher = Arc<dyn Fn(&Value) -> Hash + Send + Sync + 'static>;

/// Decides whether a hash may be written to the store.
pub type HashValidator = Arc<dyn Fn(&Hash) -> Result<(), InvalidHashError> + Send + Sync + 'static>;

/// Hashes the canonical JSON text of the data.
///
/// Objects in [`serde_json::Value`] keep their keys sorted, so equal values
/// always produce equal text.
pub fn default_chunk_hasher(data: &Value) -> Hash {
    Hash::new(data.to_string())
}

/// The hasher used by [`crate::dag::Store::new`] unless another one is given.
pub fn default_hasher() -> ChunkHasher {
    Arc::new(default_chunk_hasher)
}

/// The validator used by [`crate::dag::Store::new`] unless another one is given.
pub fn default_validator() -> HashValidator {
    Arc::new(syncstore_base::assert_not_temp_hash)
}

/// A unit of storage: a JSON payload plus the hashes of the chunks it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    hash: Hash,
    data: Value,
    refs: Vec<Hash>,
}

impl Chunk {
    /// Creates a chunk with an already known hash.
    pub fn with_hash(hash: Hash, data: Value, refs: Vec<Hash>) -> Self {
        Self { hash, data, refs }
    }

    /// Creates a chunk, hashing `data` with `hasher`.
    pub fn new(data: Value, refs: Vec<Hash>, hasher: &ChunkHasher) -> Self {
        let hash = hasher(&data);
        Self { hash, data, refs }
    }

    /// The chunk hash.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The payload.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Outgoing references, in insertion order.
    pub fn refs(&self) -> &[Hash] {
        &self.refs
    }

    /// Consumes the chunk, returning its payload.
    pub fn into_data(self) -> Value {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn equal_data_gives_equal_hash() {
        let hasher = default_hasher();
        let a = Chunk::new(json!({"b": 1, "a": [true, null]}), vec![], &hasher);
        let b = Chunk::new(json!({"a": [true, null], "b": 1}), vec![], &hasher);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);

        let c = Chunk::new(json!({"a": [true, null], "b": 2}), vec![], &hasher);
        assert_ne!(a.hash(), c.hash());
    }
}
