use std::collections::{BTreeMap, BTreeSet};

use crate::{
    dag::Readable,
    db::{Commit, DbError, DiffOperation, IndexRecord, ValueMap},
};

/// Changes per map: `""` for the value map, otherwise the index name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffsMap(BTreeMap<String, Vec<DiffOperation>>);

impl DiffsMap {
    /// Records the changes for `name`; empty diffs are not stored.
    pub fn set(&mut self, name: &str, diff: Vec<DiffOperation>) {
        if diff.is_empty() {
            self.0.remove(name);
        } else {
            self.0.insert(name.to_string(), diff);
        }
    }

    /// The diff of the map `name`. The value map is named `""`.
    pub fn get(&self, name: &str) -> Option<&Vec<DiffOperation>> {
        self.0.get(name)
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of maps that changed.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Diffs by map name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[DiffOperation])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Which diffs observers are interested in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffComputationConfig {
    /// Compute the value map diff.
    pub values: bool,
    /// Indexes to compute diffs for; `None` means every index.
    pub indexes: Option<BTreeSet<String>>,
}

impl DiffComputationConfig {
    /// Value map and every index.
    pub fn all() -> Self {
        Self {
            values: true,
            indexes: None,
        }
    }

    /// Nothing at all.
    pub fn none() -> Self {
        Self {
            values: false,
            indexes: Some(BTreeSet::new()),
        }
    }

    /// Whether any diff is wanted.
    pub fn should_compute_diffs(&self) -> bool {
        self.values || self.indexes.as_ref().is_none_or(|i| !i.is_empty())
    }

    /// Whether the diff of index `name` is wanted.
    pub fn should_compute_diffs_for_index(&self, name: &str) -> bool {
        match &self.indexes {
            None => true,
            Some(indexes) => indexes.contains(name),
        }
    }
}

/// The changes between two commits for the maps `config` selects.
pub fn diff_commits(
    old: &Commit,
    new: &Commit,
    read: &(impl Readable + ?Sized),
    config: &DiffComputationConfig,
) -> Result<DiffsMap, DbError> {
    let mut diffs = DiffsMap::default();
    if !config.should_compute_diffs() {
        return Ok(diffs);
    }
    if config.values {
        let old_map = ValueMap::load(&old.value_hash(), read)?;
        let new_map = ValueMap::load(&new.value_hash(), read)?;
        diffs.set("", ValueMap::diff(&old_map, &new_map));
    }
    add_diffs_for_indexes(old, new, read, &mut diffs, config)?;
    Ok(diffs)
}

fn add_diffs_for_indexes(
    old: &Commit,
    new: &Commit,
    read: &(impl Readable + ?Sized),
    diffs: &mut DiffsMap,
    config: &DiffComputationConfig,
) -> Result<(), DbError> {
    let by_name = |records: &[IndexRecord]| -> BTreeMap<String, IndexRecord> {
        records
            .iter()
            .map(|r| (r.definition.name.clone(), r.clone()))
            .collect()
    };
    let mut old_indexes = by_name(old.indexes());
    let new_indexes = by_name(new.indexes());
    let empty = ValueMap::new();

    for (name, new_index) in new_indexes {
        if !config.should_compute_diffs_for_index(&name) {
            continue;
        }
        let new_map = ValueMap::load(&new_index.value_hash, read)?;
        let diff = match old_indexes.remove(&name) {
            Some(old_index) if old_index.definition == new_index.definition => {
                if old_index.value_hash == new_index.value_hash {
                    continue;
                }
                let old_map = ValueMap::load(&old_index.value_hash, read)?;
                ValueMap::diff(&old_map, &new_map)
            }
            // a redefined index is reported as a full replacement
            Some(old_index) => {
                let old_map = ValueMap::load(&old_index.value_hash, read)?;
                let mut diff = ValueMap::diff(&old_map, &empty);
                diff.extend(ValueMap::diff(&empty, &new_map));
                diff
            }
            None => ValueMap::diff(&empty, &new_map),
        };
        diffs.set(&name, diff);
    }
    for (name, old_index) in old_indexes {
        if config.should_compute_diffs_for_index(&name) {
            let old_map = ValueMap::load(&old_index.value_hash, read)?;
            diffs.set(&name, ValueMap::diff(&old_map, &empty));
        }
    }
    Ok(())
}
