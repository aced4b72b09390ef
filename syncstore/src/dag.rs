//! Content addressed chunk storage with reference counted garbage collection.
//!
//! Chunks are immutable JSON payloads with a list of outgoing refs. Heads are
//! named pointers into the graph. Every chunk reachable from a head carries a
//! ref count equal to the number of reachable chunks (and heads) pointing at
//! it; a chunk whose count drops to zero is deleted when the write commits.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use syncstore_base::{Hash, InvalidHashError};

use crate::kv::StorageError;

mod chunk;
mod gc;
pub mod key;
mod store;

pub use self::{
    chunk::{
        Chunk, ChunkHasher, HashValidator, default_chunk_hasher, default_hasher,
        default_validator,
    },
    store::{Read, Readable, Store, Write},
};

/// Errors from the chunk store.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum DagError {
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(transparent)]
    InvalidHash { source: InvalidHashError },
    #[snafu(display("Invalid ref count {value}. We expect the value to be a Uint16"))]
    InvalidRefCount { value: String },
    #[snafu(display("Ref count for chunk {hash} would underflow"))]
    RefCountUnderflow { hash: Hash },
    #[snafu(display("Ref count for chunk {hash} would overflow"))]
    RefCountOverflow { hash: Hash },
    #[snafu(display("Chunk {hash} not found"))]
    ChunkNotFound { hash: Hash },
    #[snafu(display("Chunk {hash} has invalid data"))]
    DecodeData {
        hash: Hash,
        source: serde_json::Error,
    },
    #[snafu(display("Chunk {hash} has invalid refs"))]
    DecodeMeta { hash: Hash, source: postcard::Error },
    #[snafu(display("failed to encode chunk refs"))]
    EncodeMeta { source: postcard::Error },
    #[snafu(display("Head {name} does not hold a hash"))]
    DecodeHead { name: String },
}
