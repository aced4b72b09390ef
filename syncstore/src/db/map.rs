//! Sorted key to JSON value maps, persisted as a single chunk.

use std::{
    collections::{BTreeMap, btree_map},
    ops::Bound,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use syncstore_base::Hash;

use super::{DbError, DecodeMapSnafu};
use crate::dag::{self, Chunk, Readable};

/// A change between two maps, in key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DiffOperation {
    /// The key was added.
    #[serde(rename_all = "camelCase")]
    Add {
        /// The added key.
        key: String,
        /// Its value in the new map.
        new_value: Value,
    },
    /// The key was removed.
    #[serde(rename_all = "camelCase")]
    Del {
        /// The removed key.
        key: String,
        /// Its value in the old map.
        old_value: Value,
    },
    /// The key exists in both maps with different values.
    #[serde(rename_all = "camelCase")]
    Change {
        /// The changed key.
        key: String,
        /// Its value in the old map.
        old_value: Value,
        /// Its value in the new map.
        new_value: Value,
    },
}

impl DiffOperation {
    /// The key the operation applies to.
    pub fn key(&self) -> &str {
        match self {
            Self::Add { key, .. } | Self::Del { key, .. } | Self::Change { key, .. } => key,
        }
    }

    /// The value before the change, if any.
    pub fn old_value(&self) -> Option<&Value> {
        match self {
            Self::Add { .. } => None,
            Self::Del { old_value, .. } | Self::Change { old_value, .. } => Some(old_value),
        }
    }

    /// The value after the change, if any.
    pub fn new_value(&self) -> Option<&Value> {
        match self {
            Self::Del { .. } => None,
            Self::Add { new_value, .. } | Self::Change { new_value, .. } => Some(new_value),
        }
    }
}

/// In-memory copy of a value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMap {
    entries: BTreeMap<String, Value>,
}

impl ValueMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the map stored in chunk `hash`.
    pub fn load(hash: &Hash, read: &(impl Readable + ?Sized)) -> Result<Self, DbError> {
        let chunk = read.must_get_chunk(hash)?;
        let pairs: Vec<(String, Value)> =
            serde_json::from_value(chunk.into_data()).context(DecodeMapSnafu { hash: *hash })?;
        Ok(Self {
            entries: pairs.into_iter().collect(),
        })
    }

    /// Stores the map as a chunk and returns its hash.
    pub fn flush(&self, write: &mut dag::Write) -> Result<Hash, DbError> {
        let chunk = self.to_chunk(&*write);
        write.put_chunk(&chunk)?;
        Ok(chunk.hash())
    }

    fn to_chunk(&self, read: &impl Readable) -> Chunk {
        let data = Value::Array(
            self.entries
                .iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        );
        read.create_chunk(data, Vec::new())
    }

    /// The value of `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Whether `key` has a value.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or replaces a value, returning the previous one.
    pub fn put(&mut self, key: String, value: Value) -> Option<Value> {
        self.entries.insert(key, value)
    }

    /// Removes a key, returning the previous value.
    pub fn del(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with keys starting with `prefix`, in key order.
    pub fn scan<'a>(
        &'a self,
        prefix: &str,
    ) -> impl Iterator<Item = (&'a str, &'a Value)> + use<'a> {
        self.scan_from(prefix, prefix)
    }

    /// Entries with keys starting with `prefix` and not before `start`.
    pub fn scan_from<'a>(
        &'a self,
        prefix: &str,
        start: &str,
    ) -> impl Iterator<Item = (&'a str, &'a Value)> + use<'a> {
        let lower = if start > prefix { start } else { prefix };
        let prefix = prefix.to_string();
        self.entries
            .range::<str, _>((Bound::Included(lower), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix.as_str()))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// All entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.entries.iter()
    }

    /// The operations that turn `old` into `new`, in key order.
    pub fn diff(old: &ValueMap, new: &ValueMap) -> Vec<DiffOperation> {
        let mut res = Vec::new();
        let mut old_iter = old.entries.iter().peekable();
        let mut new_iter = new.entries.iter().peekable();
        loop {
            match (old_iter.peek(), new_iter.peek()) {
                (None, None) => break,
                (Some((k, v)), None) => {
                    res.push(DiffOperation::Del {
                        key: (*k).clone(),
                        old_value: (*v).clone(),
                    });
                    old_iter.next();
                }
                (None, Some((k, v))) => {
                    res.push(DiffOperation::Add {
                        key: (*k).clone(),
                        new_value: (*v).clone(),
                    });
                    new_iter.next();
                }
                (Some((ok, ov)), Some((nk, nv))) => match ok.cmp(nk) {
                    std::cmp::Ordering::Less => {
                        res.push(DiffOperation::Del {
                            key: (*ok).clone(),
                            old_value: (*ov).clone(),
                        });
                        old_iter.next();
                    }
                    std::cmp::Ordering::Greater => {
                        res.push(DiffOperation::Add {
                            key: (*nk).clone(),
                            new_value: (*nv).clone(),
                        });
                        new_iter.next();
                    }
                    std::cmp::Ordering::Equal => {
                        if ov != nv {
                            res.push(DiffOperation::Change {
                                key: (*ok).clone(),
                                old_value: (*ov).clone(),
                                new_value: (*nv).clone(),
                            });
                        }
                        old_iter.next();
                        new_iter.next();
                    }
                },
            }
        }
        res
    }
}

impl FromIterator<(String, Value)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
