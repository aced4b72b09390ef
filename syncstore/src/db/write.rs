use std::collections::BTreeMap;

use serde_json::Value;
use syncstore_base::Hash;
use tracing::trace;

use super::{
    DbError,
    commit::{
        Commit, CommitData, LocalMetaDd31, LocalMetaSdd, Meta, SnapshotMetaDd31, SnapshotMetaSdd,
        commit_from_hash,
    },
    index::{IndexDefinition, IndexOperation, IndexRecord, create_index_map, index_value},
    map::ValueMap,
};
use crate::{
    dag::{self, Readable},
    db::FormatVersion,
    sync::{ClientId, Cookie, DiffComputationConfig, DiffsMap},
};

/// An index being written alongside the value map.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexWrite {
    /// How the index is built.
    pub definition: IndexDefinition,
    /// The index entries.
    pub map: ValueMap,
}

impl IndexWrite {
    /// Builds the index for `definition` over `map`.
    pub fn create(definition: IndexDefinition, map: &ValueMap) -> Self {
        let index = create_index_map(&definition, map);
        Self {
            definition,
            map: index,
        }
    }

    fn update(&mut self, key: &str, old: Option<&Value>, new: Option<&Value>) {
        if !key.starts_with(&self.definition.key_prefix) {
            return;
        }
        if let Some(old) = old {
            index_value(&mut self.map, &self.definition, IndexOperation::Remove, key, old);
        }
        if let Some(new) = new {
            index_value(&mut self.map, &self.definition, IndexOperation::Add, key, new);
        }
    }
}

/// Loads the indexes recorded in `commit` for writing.
pub(crate) fn read_indexes_for_write(
    commit: &Commit,
    read: &(impl Readable + ?Sized),
) -> Result<BTreeMap<String, IndexWrite>, DbError> {
    commit
        .indexes()
        .iter()
        .map(|record| {
            let map = ValueMap::load(&record.value_hash, read)?;
            Ok((
                record.definition.name.clone(),
                IndexWrite {
                    definition: record.definition.clone(),
                    map,
                },
            ))
        })
        .collect()
}

/// Builds a new commit on top of the dag write transaction.
///
/// Nothing is stored until [`Write::commit`] or [`Write::put_commit`]; the
/// dag transaction itself is committed by the caller.
#[derive(Debug)]
pub struct Write<'a> {
    dag: &'a mut dag::Write,
    meta: Meta,
    basis_map: ValueMap,
    basis_indexes: BTreeMap<String, ValueMap>,
    map: ValueMap,
    indexes: BTreeMap<String, IndexWrite>,
    client_id: ClientId,
    format_version: FormatVersion,
}

impl<'a> Write<'a> {
    /// Starts a local mutation on top of `basis_hash`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_local(
        basis_hash: Hash,
        mutator_name: &str,
        mutator_args: Value,
        original_hash: Option<Hash>,
        dag: &'a mut dag::Write,
        timestamp: u64,
        client_id: &str,
        format_version: FormatVersion,
    ) -> Result<Self, DbError> {
        let basis = commit_from_hash(&basis_hash, &*dag)?;
        let mutation_id = basis.next_mutation_id(client_id, &*dag)?;
        let map = ValueMap::load(&basis.value_hash(), &*dag)?;
        let indexes = read_indexes_for_write(&basis, &*dag)?;
        let meta = match format_version {
            FormatVersion::Sdd => LocalMetaSdd {
                basis_hash,
                mutation_id,
                mutator_name: mutator_name.to_string(),
                mutator_args,
                original_hash,
                timestamp,
            }
            .into(),
            FormatVersion::Dd31 => LocalMetaDd31 {
                basis_hash,
                mutation_id,
                mutator_name: mutator_name.to_string(),
                mutator_args,
                original_hash,
                timestamp,
                client_id: client_id.to_string(),
            }
            .into(),
        };
        Ok(Self::from_parts(dag, meta, map, indexes, client_id, format_version))
    }

    /// Starts a single client snapshot whose map starts from the basis.
    pub fn new_snapshot_sdd(
        basis_hash: Option<Hash>,
        last_mutation_id: u64,
        cookie: Cookie,
        dag: &'a mut dag::Write,
        indexes: BTreeMap<String, IndexWrite>,
        client_id: &str,
    ) -> Result<Self, DbError> {
        let map = match &basis_hash {
            Some(hash) => {
                let basis = commit_from_hash(hash, &*dag)?;
                ValueMap::load(&basis.value_hash(), &*dag)?
            }
            None => ValueMap::new(),
        };
        let meta = SnapshotMetaSdd {
            basis_hash,
            last_mutation_id,
            cookie,
        }
        .into();
        Ok(Self::from_parts(
            dag,
            meta,
            map,
            indexes,
            client_id,
            FormatVersion::Sdd,
        ))
    }

    /// Starts a client group snapshot whose map and indexes start from the
    /// basis.
    pub fn new_snapshot_dd31(
        basis_hash: Option<Hash>,
        last_mutation_ids: BTreeMap<ClientId, u64>,
        cookie: Cookie,
        dag: &'a mut dag::Write,
        client_id: &str,
    ) -> Result<Self, DbError> {
        let (map, indexes) = match &basis_hash {
            Some(hash) => {
                let basis = commit_from_hash(hash, &*dag)?;
                (
                    ValueMap::load(&basis.value_hash(), &*dag)?,
                    read_indexes_for_write(&basis, &*dag)?,
                )
            }
            None => (ValueMap::new(), BTreeMap::new()),
        };
        let meta = SnapshotMetaDd31 {
            basis_hash,
            last_mutation_ids,
            cookie,
        }
        .into();
        Ok(Self::from_parts(
            dag,
            meta,
            map,
            indexes,
            client_id,
            FormatVersion::Dd31,
        ))
    }

    fn from_parts(
        dag: &'a mut dag::Write,
        meta: Meta,
        map: ValueMap,
        indexes: BTreeMap<String, IndexWrite>,
        client_id: &str,
        format_version: FormatVersion,
    ) -> Self {
        let basis_indexes = indexes
            .iter()
            .map(|(name, index)| (name.clone(), index.map.clone()))
            .collect();
        Self {
            dag,
            meta,
            basis_map: map.clone(),
            basis_indexes,
            map,
            indexes,
            client_id: client_id.to_string(),
            format_version,
        }
    }

    /// The meta the commit will be written with.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The value map as written so far.
    pub fn map(&self) -> &ValueMap {
        &self.map
    }

    /// The indexes, by name.
    pub fn indexes(&self) -> &BTreeMap<String, IndexWrite> {
        &self.indexes
    }

    /// The client writing the commit.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The format the commit is written in.
    pub fn format_version(&self) -> FormatVersion {
        self.format_version
    }

    /// The dag transaction this commit is written to.
    pub fn dag(&self) -> &dag::Write {
        &*self.dag
    }

    /// The current value of `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// Whether `key` has a value.
    pub fn has(&self, key: &str) -> bool {
        self.map.has(key)
    }

    /// Stores `value` under `key` and updates every index covering `key`.
    pub fn put(&mut self, key: &str, value: Value) {
        let old = self.map.put(key.to_string(), value.clone());
        self.update_indexes(key, old.as_ref(), Some(&value));
    }

    /// Removes `key`; returns whether it was present.
    pub fn del(&mut self, key: &str) -> bool {
        let old = self.map.del(key);
        self.update_indexes(key, old.as_ref(), None);
        old.is_some()
    }

    /// Removes every entry and empties every index.
    pub fn clear(&mut self) {
        self.map.clear();
        for index in self.indexes.values_mut() {
            index.map.clear();
        }
    }

    /// Replays a change to `key` into the indexes only.
    pub(crate) fn update_indexes(&mut self, key: &str, old: Option<&Value>, new: Option<&Value>) {
        for index in self.indexes.values_mut() {
            index.update(key, old, new);
        }
    }

    /// Stores the value map, index maps and commit chunk.
    pub fn put_commit(&mut self) -> Result<Commit, DbError> {
        let value_hash = self.map.flush(self.dag)?;
        let mut indexes = Vec::with_capacity(self.indexes.len());
        for index in self.indexes.values() {
            indexes.push(IndexRecord {
                definition: index.definition.clone(),
                value_hash: index.map.flush(self.dag)?,
            });
        }
        let data = CommitData {
            meta: self.meta.clone(),
            value_hash,
            indexes,
        };
        let chunk = data.to_chunk(&*self.dag)?;
        self.dag.put_chunk(&chunk)?;
        trace!(hash = %chunk.hash().fmt_short(), "put commit");
        Ok(Commit::from_parts(chunk.hash(), data))
    }

    /// Stores the commit and points `head_name` at it.
    pub fn commit(mut self, head_name: &str) -> Result<Hash, DbError> {
        let commit = self.put_commit()?;
        self.dag.set_head(head_name, commit.hash())?;
        Ok(commit.hash())
    }

    /// Like [`Write::commit`], also returning what changed since the basis.
    pub fn commit_with_diffs(
        mut self,
        head_name: &str,
        config: &DiffComputationConfig,
    ) -> Result<(Hash, DiffsMap), DbError> {
        let diffs = self.diffs(config);
        let commit = self.put_commit()?;
        self.dag.set_head(head_name, commit.hash())?;
        Ok((commit.hash(), diffs))
    }

    /// The changes to the value map and indexes since the basis.
    pub fn diffs(&self, config: &DiffComputationConfig) -> DiffsMap {
        let mut diffs = DiffsMap::default();
        if config.values {
            diffs.set("", ValueMap::diff(&self.basis_map, &self.map));
        }
        let empty = ValueMap::new();
        for (name, index) in &self.indexes {
            if config.should_compute_diffs_for_index(name) {
                let old = self.basis_indexes.get(name).unwrap_or(&empty);
                diffs.set(name, ValueMap::diff(old, &index.map));
            }
        }
        diffs
    }
}
