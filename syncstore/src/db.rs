//! Commits, value maps and indexes on top of the chunk store.

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};
use syncstore_base::Hash;

use crate::dag::DagError;

mod commit;
mod index;
mod map;
mod read;
mod write;

pub use self::{
    commit::{
        Commit, CommitData, DEFAULT_HEAD_NAME, LocalMetaDd31, LocalMetaSdd, LocalParts, Meta,
        SnapshotMetaDd31, SnapshotMetaSdd, base_snapshot_from_commit, base_snapshot_from_hash,
        commit_chain, commit_from_hash, commit_from_head, local_mutations,
    },
    index::{IndexDefinition, IndexRecord, decode_index_key, encode_index_key, get_index_keys},
    map::{DiffOperation, ValueMap},
    read::{IndexEntry, ReadSnapshot, read_commit_for_head},
    write::{IndexWrite, Write},
};
pub(crate) use self::{index::create_index_map, write::read_indexes_for_write};

/// The two generations of the persisted format.
///
/// `Sdd` records a single client per store and a single last mutation id per
/// snapshot. `Dd31` shares a store between the clients of a client group and
/// records one last mutation id per client.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FormatVersion {
    /// One client per store.
    Sdd,
    /// Client groups sharing a store.
    #[default]
    Dd31,
}

/// Errors reading or writing commits.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum DbError {
    #[snafu(transparent)]
    Dag { source: DagError },
    #[snafu(display("Unknown head: {name}"))]
    MissingHead { name: String },
    #[snafu(display("Chunk {hash} is not a commit"))]
    DecodeCommit {
        hash: Hash,
        source: serde_json::Error,
    },
    #[snafu(display("Chunk {hash} is not a value map"))]
    DecodeMap {
        hash: Hash,
        source: serde_json::Error,
    },
    #[snafu(display("failed to encode commit"))]
    EncodeCommit { source: serde_json::Error },
    #[snafu(display(
        "Mutation id gap for client {client_id:?}: expected {expected}, got {actual}"
    ))]
    MutationIdGap {
        client_id: String,
        expected: u64,
        actual: u64,
    },
    #[snafu(display(
        "Inconsistent mutation id for client {client_id:?}: expected {expected}, got {actual}"
    ))]
    InconsistentMutationId {
        client_id: String,
        expected: u64,
        actual: u64,
    },
    #[snafu(display("Commit {hash} does not use the {expected} format"))]
    WrongFormat { hash: Hash, expected: FormatVersion },
    #[snafu(display("Invalid index key: {message}"))]
    InvalidIndexKey { message: String },
    #[snafu(display("Unknown index name: {name}"))]
    UnknownIndex { name: String },
}
