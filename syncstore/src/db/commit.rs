//! Commits and walking the commit chain.
//!
//! A commit is a chunk whose data is a [`CommitData`]. Local commits point
//! at their basis with a strong ref; snapshots keep their basis hash only as
//! a weak reference so that old history can be collected once main moves
//! past it.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use syncstore_base::Hash;

use super::{
    DbError, DecodeCommitSnafu, EncodeCommitSnafu, MissingHeadSnafu, MutationIdGapSnafu,
    index::IndexRecord,
};
use crate::{
    dag::{Chunk, Readable},
    sync::{ClientId, Cookie},
};

/// Name of the head tracking the client's current state.
pub const DEFAULT_HEAD_NAME: &str = "main";

/// A local mutation, single client format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMetaSdd {
    /// The commit this mutation was applied on top of.
    pub basis_hash: Hash,
    /// Per client counter, starting at 1.
    #[serde(rename = "mutationID")]
    pub mutation_id: u64,
    /// Name of the mutator that ran.
    pub mutator_name: String,
    /// Arguments the mutator ran with.
    pub mutator_args: Value,
    /// The commit this one was rebased from, if it is a replay.
    pub original_hash: Option<Hash>,
    /// Milliseconds since the Unix epoch when the mutation first ran.
    pub timestamp: u64,
}

/// A local mutation, client group format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMetaDd31 {
    /// The commit this mutation was applied on top of.
    pub basis_hash: Hash,
    /// Counter of `client_id`, starting at 1.
    #[serde(rename = "mutationID")]
    pub mutation_id: u64,
    /// Name of the mutator that ran.
    pub mutator_name: String,
    /// Arguments the mutator ran with.
    pub mutator_args: Value,
    /// The commit this one was rebased from, if it is a replay.
    pub original_hash: Option<Hash>,
    /// Milliseconds since the Unix epoch when the mutation first ran.
    pub timestamp: u64,
    /// The client that ran the mutation.
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
}

/// A snapshot, single client format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetaSdd {
    /// The main commit the snapshot replaced, kept as a weak reference.
    pub basis_hash: Option<Hash>,
    /// The last mutation of the client the server has applied.
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
    /// The server version of the state.
    pub cookie: Cookie,
}

/// A snapshot, client group format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetaDd31 {
    /// The main commit the snapshot replaced, kept as a weak reference.
    pub basis_hash: Option<Hash>,
    /// The last mutation the server has applied, per client.
    #[serde(rename = "lastMutationIDs")]
    pub last_mutation_ids: BTreeMap<ClientId, u64>,
    /// The server version of the state.
    pub cookie: Cookie,
}

/// The kind specific part of a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_more::From)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Meta {
    /// A local mutation of a single client store.
    LocalSdd(LocalMetaSdd),
    /// A local mutation of a client in a group.
    LocalDd31(LocalMetaDd31),
    /// Server state of a single client store.
    SnapshotSdd(SnapshotMetaSdd),
    /// Server state of a client group.
    SnapshotDd31(SnapshotMetaDd31),
}

impl Meta {
    /// The previous commit in the chain.
    pub fn basis_hash(&self) -> Option<Hash> {
        match self {
            Meta::LocalSdd(m) => Some(m.basis_hash),
            Meta::LocalDd31(m) => Some(m.basis_hash),
            Meta::SnapshotSdd(m) => m.basis_hash,
            Meta::SnapshotDd31(m) => m.basis_hash,
        }
    }

    /// Whether this is a local mutation.
    pub fn is_local(&self) -> bool {
        matches!(self, Meta::LocalSdd(_) | Meta::LocalDd31(_))
    }

    /// Whether this is a server snapshot.
    pub fn is_snapshot(&self) -> bool {
        !self.is_local()
    }

    /// The cookie of a snapshot.
    pub fn cookie(&self) -> Option<&Cookie> {
        match self {
            Meta::SnapshotSdd(m) => Some(&m.cookie),
            Meta::SnapshotDd31(m) => Some(&m.cookie),
            _ => None,
        }
    }

    /// Mutator name, args and id of a local commit.
    pub fn local_parts(&self) -> Option<LocalParts<'_>> {
        match self {
            Meta::LocalSdd(m) => Some(LocalParts {
                mutation_id: m.mutation_id,
                mutator_name: &m.mutator_name,
                mutator_args: &m.mutator_args,
                timestamp: m.timestamp,
                client_id: None,
            }),
            Meta::LocalDd31(m) => Some(LocalParts {
                mutation_id: m.mutation_id,
                mutator_name: &m.mutator_name,
                mutator_args: &m.mutator_args,
                timestamp: m.timestamp,
                client_id: Some(&m.client_id),
            }),
            _ => None,
        }
    }
}

/// Borrowed view of the fields shared by both local formats.
#[derive(Debug, Clone, Copy)]
pub struct LocalParts<'a> {
    /// The mutation id.
    pub mutation_id: u64,
    /// Name of the mutator.
    pub mutator_name: &'a str,
    /// Arguments of the mutator.
    pub mutator_args: &'a Value,
    /// When the mutation first ran.
    pub timestamp: u64,
    /// Only set for the client group format.
    pub client_id: Option<&'a str>,
}

/// The payload of a commit chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitData {
    /// What kind of commit this is.
    pub meta: Meta,
    /// The value map after this commit.
    pub value_hash: Hash,
    /// The index maps after this commit.
    pub indexes: Vec<IndexRecord>,
}

impl CommitData {
    /// Refs the commit chunk holds: the value map, the basis of a local
    /// commit and every index map.
    pub fn refs(&self) -> Vec<Hash> {
        let mut refs = vec![self.value_hash];
        if self.meta.is_local() {
            refs.extend(self.meta.basis_hash());
        }
        refs.extend(self.indexes.iter().map(|i| i.value_hash));
        refs
    }

    /// Builds the chunk for this commit.
    pub fn to_chunk(&self, read: &(impl Readable + ?Sized)) -> Result<Chunk, DbError> {
        let data = serde_json::to_value(self).context(EncodeCommitSnafu)?;
        Ok(read.create_chunk(data, self.refs()))
    }
}

/// A commit loaded from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    hash: Hash,
    data: CommitData,
}

impl Commit {
    /// Decodes a commit chunk.
    pub fn from_chunk(chunk: Chunk) -> Result<Self, DbError> {
        let hash = chunk.hash();
        let data = serde_json::from_value(chunk.into_data()).context(DecodeCommitSnafu { hash })?;
        Ok(Self { hash, data })
    }

    pub(crate) fn from_parts(hash: Hash, data: CommitData) -> Self {
        Self { hash, data }
    }

    /// The hash of the commit chunk.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// What kind of commit this is.
    pub fn meta(&self) -> &Meta {
        &self.data.meta
    }

    /// The decoded chunk data.
    pub fn data(&self) -> &CommitData {
        &self.data
    }

    /// The value map after this commit.
    pub fn value_hash(&self) -> Hash {
        self.data.value_hash
    }

    /// The index maps after this commit.
    pub fn indexes(&self) -> &[IndexRecord] {
        &self.data.indexes
    }

    /// Whether this is a local mutation.
    pub fn is_local(&self) -> bool {
        self.data.meta.is_local()
    }

    /// Whether this is a server snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.data.meta.is_snapshot()
    }

    /// The last mutation id of `client_id` included in this commit.
    ///
    /// Local commits of other clients are skipped by walking to their basis.
    pub fn mutation_id(
        &self,
        client_id: &str,
        read: &(impl Readable + ?Sized),
    ) -> Result<u64, DbError> {
        let mut commit = self.clone();
        loop {
            match commit.meta() {
                Meta::SnapshotDd31(m) => {
                    return Ok(m.last_mutation_ids.get(client_id).copied().unwrap_or(0));
                }
                Meta::SnapshotSdd(m) => return Ok(m.last_mutation_id),
                Meta::LocalSdd(m) => return Ok(m.mutation_id),
                Meta::LocalDd31(m) if m.client_id == client_id => return Ok(m.mutation_id),
                Meta::LocalDd31(m) => {
                    commit = commit_from_hash(&m.basis_hash, read)?;
                }
            }
        }
    }

    /// The id the next local mutation of `client_id` on top of this commit gets.
    pub fn next_mutation_id(
        &self,
        client_id: &str,
        read: &(impl Readable + ?Sized),
    ) -> Result<u64, DbError> {
        Ok(self.mutation_id(client_id, read)? + 1)
    }
}

/// Loads the commit stored in chunk `hash`.
pub fn commit_from_hash(
    hash: &Hash,
    read: &(impl Readable + ?Sized),
) -> Result<Commit, DbError> {
    let chunk = read.must_get_chunk(hash)?;
    Commit::from_chunk(chunk)
}

/// Loads the commit the head `name` points at.
pub fn commit_from_head(name: &str, read: &(impl Readable + ?Sized)) -> Result<Commit, DbError> {
    let hash = read.get_head(name)?.context(MissingHeadSnafu { name })?;
    commit_from_hash(&hash, read)
}

/// Walks basis links from `hash` to the first snapshot.
pub fn base_snapshot_from_hash(
    hash: &Hash,
    read: &(impl Readable + ?Sized),
) -> Result<Commit, DbError> {
    let commit = commit_from_hash(hash, read)?;
    base_snapshot_from_commit(commit, read)
}

/// Walks basis links from `commit` to the first snapshot.
pub fn base_snapshot_from_commit(
    mut commit: Commit,
    read: &(impl Readable + ?Sized),
) -> Result<Commit, DbError> {
    while let Some(basis) = commit.is_local().then(|| commit.meta().basis_hash()).flatten() {
        commit = commit_from_hash(&basis, read)?;
    }
    Ok(commit)
}

/// All commits from `hash` down to and including the base snapshot,
/// newest first.
///
/// Fails when the local mutation ids of a client are not consecutive.
pub fn commit_chain(
    hash: &Hash,
    read: &(impl Readable + ?Sized),
) -> Result<Vec<Commit>, DbError> {
    let mut chain = vec![commit_from_hash(hash, read)?];
    while let Some(basis) = chain
        .last()
        .filter(|c| c.is_local())
        .and_then(|c| c.meta().basis_hash())
    {
        chain.push(commit_from_hash(&basis, read)?);
    }
    check_mutation_ids(&chain)?;
    Ok(chain)
}

/// The local commits on top of the base snapshot, newest first.
pub fn local_mutations(
    hash: &Hash,
    read: &(impl Readable + ?Sized),
) -> Result<Vec<Commit>, DbError> {
    let mut chain = commit_chain(hash, read)?;
    chain.pop();
    Ok(chain)
}

/// Verifies that every client's local ids step by exactly one, starting
/// right after the id the base snapshot recorded for that client.
fn check_mutation_ids(chain: &[Commit]) -> Result<(), DbError> {
    let Some(snapshot) = chain.last().filter(|c| c.is_snapshot()) else {
        return Ok(());
    };
    let mut expected: HashMap<&str, u64> = HashMap::new();
    for commit in chain.iter().rev().skip(1) {
        let Some(parts) = commit.meta().local_parts() else {
            continue;
        };
        let client = parts.client_id.unwrap_or("");
        let next = match expected.get(client) {
            Some(next) => *next,
            None => {
                let base = match snapshot.meta() {
                    Meta::SnapshotSdd(m) => m.last_mutation_id,
                    Meta::SnapshotDd31(m) => m.last_mutation_ids.get(client).copied().unwrap_or(0),
                    _ => 0,
                };
                base + 1
            }
        };
        if parts.mutation_id != next {
            return MutationIdGapSnafu {
                client_id: client.to_string(),
                expected: next,
                actual: parts.mutation_id,
            }
            .fail();
        }
        expected.insert(client, parts.mutation_id + 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{dag, db::Write, kv};

    #[test]
    fn meta_serializes_with_type_tag() {
        let meta = Meta::SnapshotDd31(SnapshotMetaDd31 {
            basis_hash: None,
            last_mutation_ids: BTreeMap::from([("c1".to_string(), 3)]),
            cookie: Cookie::from("c"),
        });
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "snapshotDd31",
                "basisHash": null,
                "lastMutationIDs": {"c1": 3},
                "cookie": "c",
            })
        );
        let back: Meta = serde_json::from_value(value).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn refs_skip_snapshot_basis() {
        let value_hash = Hash::fake("v");
        let basis = Hash::fake("b");
        let snapshot = CommitData {
            meta: SnapshotMetaSdd {
                basis_hash: Some(basis),
                last_mutation_id: 0,
                cookie: Cookie::NULL,
            }
            .into(),
            value_hash,
            indexes: vec![],
        };
        assert_eq!(snapshot.refs(), vec![value_hash]);

        let local = CommitData {
            meta: LocalMetaSdd {
                basis_hash: basis,
                mutation_id: 1,
                mutator_name: "m".into(),
                mutator_args: json!(null),
                original_hash: None,
                timestamp: 0,
            }
            .into(),
            value_hash,
            indexes: vec![],
        };
        assert_eq!(local.refs(), vec![value_hash, basis]);
    }

    #[test]
    fn skipped_mutation_id_breaks_the_chain() {
        let store = dag::Store::new(kv::Store::in_memory().unwrap());
        let mut dag_write = store.write().unwrap();
        let snapshot = Write::new_snapshot_dd31(
            None,
            BTreeMap::from([("c1".to_string(), 0)]),
            Cookie::NULL,
            &mut dag_write,
            "c1",
        )
        .unwrap()
        .commit(DEFAULT_HEAD_NAME)
        .unwrap();
        let value_hash = commit_from_hash(&snapshot, &dag_write).unwrap().value_hash();

        // The first local mutation of c1 claims id 3 instead of 1.
        let local = CommitData {
            meta: LocalMetaDd31 {
                basis_hash: snapshot,
                mutation_id: 3,
                mutator_name: "put".into(),
                mutator_args: json!({"key": "a", "value": 1}),
                original_hash: None,
                timestamp: 0,
                client_id: "c1".into(),
            }
            .into(),
            value_hash,
            indexes: vec![],
        };
        let chunk = local.to_chunk(&dag_write).unwrap();
        dag_write.put_chunk(&chunk).unwrap();
        dag_write.set_head(DEFAULT_HEAD_NAME, chunk.hash()).unwrap();
        dag_write.commit().unwrap();

        let read = store.read().unwrap();
        let err = commit_chain(&chunk.hash(), &read).unwrap_err();
        match err {
            DbError::MutationIdGap {
                client_id,
                expected,
                actual,
                ..
            } => {
                assert_eq!(client_id, "c1");
                assert_eq!((expected, actual), (1, 3));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            local_mutations(&chunk.hash(), &read),
            Err(DbError::MutationIdGap { .. })
        ));
        assert_eq!(read.get_head(DEFAULT_HEAD_NAME).unwrap(), Some(chunk.hash()));
        // The snapshot itself is still a valid chain.
        assert_eq!(commit_chain(&snapshot, &read).unwrap().len(), 1);
    }
}
