//! The blake3 hash used to address chunks.

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use nested_enum_utils::common_fields;
use postcard::experimental::max_size::MaxSize;
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, SeqAccess},
    ser::SerializeTuple,
};
use snafu::{Backtrace, ResultExt, Snafu, ensure};

/// Hash type used throughout.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash(blake3::Hash);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_temp() {
            f.debug_tuple("TempHash").field(&DD(self.temp_counter())).finish()
        } else {
            f.debug_tuple("Hash").field(&DD(self.fmt_short())).finish()
        }
    }
}

struct DD<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DD<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Marker occupying the first bytes of every temporary hash.
///
/// A blake3 output starting with these 12 bytes is practically impossible.
const TEMP_PREFIX: [u8; 12] = *b"\0\0synctemp\0\0";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Hash {
    /// The hash for the empty byte range (`b""`).
    pub const EMPTY: Hash = Hash::from_bytes([
        175, 19, 73, 185, 245, 249, 161, 166, 160, 64, 77, 234, 54, 220, 201, 73, 155, 203, 37,
        201, 173, 193, 18, 183, 204, 154, 147, 202, 228, 31, 50, 98,
    ]);

    /// Calculate the hash of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        let val = blake3::hash(buf.as_ref());
        Hash(val)
    }

    /// Creates a fresh temporary hash.
    ///
    /// Temporary hashes are unique within the process but are not derived
    /// from any content. They may be used for chunks that never reach a
    /// persistent head.
    pub fn new_temp() -> Self {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 32];
        bytes[..12].copy_from_slice(&TEMP_PREFIX);
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        Self::from_bytes(bytes)
    }

    /// A deterministic hash derived from a label, for tests and fixtures.
    pub fn fake(label: &str) -> Self {
        Self::new(format!("fake/{label}"))
    }

    /// Whether this hash was created by [`Hash::new_temp`].
    pub fn is_temp(&self) -> bool {
        self.as_bytes()[..12] == TEMP_PREFIX
    }

    fn temp_counter(&self) -> u64 {
        let mut n = [0u8; 8];
        n.copy_from_slice(&self.as_bytes()[24..]);
        u64::from_be_bytes(n)
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create a `Hash` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Convert the hash to a hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Convert to a base32 string limited to the first 10 bytes for a friendly string
    /// representation of the hash.
    pub fn fmt_short(&self) -> String {
        data_encoding::BASE32_NOPAD
            .encode(&self.as_bytes()[..10])
            .to_ascii_lowercase()
    }
}

/// Rejects temporary hashes.
///
/// This is the validator used for every persistent store.
pub fn assert_not_temp_hash(hash: &Hash) -> Result<(), InvalidHashError> {
    ensure!(!hash.is_temp(), UnexpectedTempSnafu);
    Ok(())
}

/// A hash was rejected by a store's validator.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum InvalidHashError {
    #[snafu(display("Unexpected temp hash"))]
    UnexpectedTemp {},
    #[snafu(display("Unexpected hash {hash}"))]
    Unexpected { hash: Hash },
}

impl InvalidHashError {
    /// Builds the error a custom validator reports for a hash it does not accept.
    pub fn unexpected(hash: Hash) -> Self {
        UnexpectedSnafu { hash }.build()
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<Hash> for blake3::Hash {
    fn from(value: Hash) -> Self {
        value.0
    }
}

impl From<blake3::Hash> for Hash {
    fn from(value: blake3::Hash) -> Self {
        Hash(value)
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(blake3::Hash::from(value))
    }
}

impl From<Hash> for [u8; 32] {
    fn from(value: Hash) -> Self {
        *value.as_bytes()
    }
}

impl From<&[u8; 32]> for Hash {
    fn from(value: &[u8; 32]) -> Self {
        Hash(blake3::Hash::from(*value))
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // result will be 52 bytes
        let mut res = [b'b'; 52];
        data_encoding::BASE32_NOPAD.encode_mut(self.as_bytes(), &mut res);
        res.make_ascii_lowercase();
        // base32 output is always ascii
        match std::str::from_utf8(&res) {
            Ok(t) => f.write_str(t),
            Err(_) => Err(fmt::Error),
        }
    }
}

/// Error parsing a [`Hash`] from a string.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum HashParseError {
    #[snafu(display("invalid length {len}, expected 52 base32 or 64 hex characters"))]
    Length { len: usize },
    #[snafu(display("invalid encoding"))]
    Decode { source: data_encoding::DecodeError },
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        let res = match s.len() {
            64 => data_encoding::HEXLOWER_PERMISSIVE.decode_mut(s.as_bytes(), &mut bytes),
            52 => data_encoding::BASE32_NOPAD
                .decode_mut(s.to_ascii_uppercase().as_bytes(), &mut bytes),
            len => return Err(LengthSnafu { len }.build()),
        };
        res.map_err(|partial| partial.error).context(DecodeSnafu)?;
        Ok(Self::from(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            // Fixed-length structures, including arrays, are supported in Serde as tuples
            // See: https://serde.rs/impl-serialize.html#serializing-a-tuple
            let mut s = serializer.serialize_tuple(32)?;
            for item in self.0.as_bytes() {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_tuple(32, HashVisitor)
        }
    }
}

struct HashVisitor;

impl<'de> de::Visitor<'de> for HashVisitor {
    type Value = Hash;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array of 32 bytes containing hash data")
    }

    /// Process a sequence into an array
    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut arr = [0u8; 32];
        for (i, slot) in arr.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(Hash::from(arr))
    }
}

impl MaxSize for Hash {
    const POSTCARD_MAX_SIZE: usize = 32;
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_test::{Configure, Token, assert_tokens};

    use super::*;

    #[test]
    fn test_display_parse_roundtrip() {
        for i in 0..100 {
            let hash: Hash = blake3::hash(&[i]).into();
            let text = hash.to_string();
            let hash1 = text.parse::<Hash>().unwrap();
            assert_eq!(hash, hash1);

            let text = hash.to_hex();
            let hash1 = Hash::from_str(&text).unwrap();
            assert_eq!(hash, hash1);
        }
    }

    #[test]
    fn test_empty_hash() {
        let hash = Hash::new(b"");
        assert_eq!(hash, Hash::EMPTY);
    }

    #[test]
    fn test_parse_bad_length() {
        let err = "abc".parse::<Hash>().unwrap_err();
        assert!(matches!(err, HashParseError::Length { len: 3, .. }));
    }

    #[test]
    fn test_temp_hash() {
        let a = Hash::new_temp();
        let b = Hash::new_temp();
        assert_ne!(a, b);
        assert!(a.is_temp());
        assert!(b.is_temp());
        assert!(!Hash::new("hello").is_temp());
        assert!(!Hash::fake("a").is_temp());

        let err = assert_not_temp_hash(&a).unwrap_err();
        assert_eq!(err.to_string(), "Unexpected temp hash");
        assert_not_temp_hash(&Hash::fake("a")).unwrap();
    }

    #[test]
    fn test_fake_is_deterministic() {
        assert_eq!(Hash::fake("r"), Hash::fake("r"));
        assert_ne!(Hash::fake("r"), Hash::fake("s"));
    }

    #[test]
    fn test_hash_serde() {
        let hash = Hash::new("hello");

        // Hashes are serialized as 32 tuples
        let mut tokens = Vec::new();
        tokens.push(Token::Tuple { len: 32 });
        for byte in hash.as_bytes() {
            tokens.push(Token::U8(*byte));
        }
        tokens.push(Token::TupleEnd);
        assert_eq!(tokens.len(), 34);

        assert_tokens(&hash.compact(), &tokens);

        let tokens = vec![Token::String(
            "5khrmpntq2bjexseshc6ldklwnig56gbj23yvbxjbdcwestheahq",
        )];
        assert_tokens(&hash.readable(), &tokens);
    }

    #[test]
    fn test_hash_postcard() {
        let hash = Hash::new("hello");
        let ser = postcard::to_stdvec(&hash).unwrap();
        let de = postcard::from_bytes(&ser).unwrap();
        assert_eq!(hash, de);

        assert_eq!(ser.len(), 32);
    }

    #[test]
    fn test_hash_json() {
        let hash = Hash::new("hello");
        let ser = serde_json::to_string(&hash).unwrap();
        let de = serde_json::from_str(&ser).unwrap();
        assert_eq!(hash, de);
        // 52 bytes of base32 + 2 quotes
        assert_eq!(ser.len(), 54);
    }

    proptest! {
        #[test]
        fn hash_is_content_addressed(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(Hash::new(&data), Hash::new(data.clone()));
        }
    }
}
