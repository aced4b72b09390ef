use std::collections::BTreeMap;

use serde_json::Value;

use super::{
    DbError, UnknownIndexSnafu,
    commit::{Commit, commit_from_head},
    index::{IndexDefinition, decode_index_key},
    map::ValueMap,
};
use crate::dag::Readable;

/// The value map and indexes of one commit, loaded for reading.
#[derive(Debug, Clone)]
pub struct ReadSnapshot {
    map: ValueMap,
    indexes: BTreeMap<String, (IndexDefinition, ValueMap)>,
}

/// An entry found through an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry<'a> {
    /// The key derived from the value.
    pub secondary: &'a str,
    /// The key of the entry in the value map.
    pub primary: &'a str,
    /// The value.
    pub value: &'a Value,
}

impl ReadSnapshot {
    /// Loads the maps of `commit`.
    pub fn load(commit: &Commit, read: &(impl Readable + ?Sized)) -> Result<Self, DbError> {
        let map = ValueMap::load(&commit.value_hash(), read)?;
        let indexes = commit
            .indexes()
            .iter()
            .map(|record| {
                let index = ValueMap::load(&record.value_hash, read)?;
                Ok((
                    record.definition.name.clone(),
                    (record.definition.clone(), index),
                ))
            })
            .collect::<Result<_, DbError>>()?;
        Ok(Self { map, indexes })
    }

    /// The value map.
    pub fn map(&self) -> &ValueMap {
        &self.map
    }

    /// The value of `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// Whether `key` has a value.
    pub fn has(&self, key: &str) -> bool {
        self.map.has(key)
    }

    /// Definitions of the indexes of this snapshot.
    pub fn index_definitions(&self) -> impl Iterator<Item = &IndexDefinition> {
        self.indexes.values().map(|(definition, _)| definition)
    }

    /// Entries of index `name` whose secondary key starts with `prefix`, in
    /// index order.
    pub fn scan_index(&self, name: &str, prefix: &str) -> Result<Vec<IndexEntry<'_>>, DbError> {
        let (_, index) = self
            .indexes
            .get(name)
            .ok_or_else(|| UnknownIndexSnafu { name }.build())?;
        let start = format!("\0{prefix}");
        index
            .scan(&start)
            .map(|(key, value)| {
                let (secondary, primary) = decode_index_key(key)?;
                Ok(IndexEntry {
                    secondary,
                    primary,
                    value,
                })
            })
            .collect()
    }
}

/// Loads the commit `name` points at together with its maps.
pub fn read_commit_for_head(
    name: &str,
    read: &(impl Readable + ?Sized),
) -> Result<(Commit, ReadSnapshot), DbError> {
    let commit = commit_from_head(name, read)?;
    let snapshot = ReadSnapshot::load(&commit, read)?;
    Ok((commit, snapshot))
}
