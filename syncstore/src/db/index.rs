//! Secondary indexes over the value map.
//!
//! An index map is a [`ValueMap`] whose keys are `"\0{secondary}\0{primary}"`
//! and whose values are copies of the indexed values. The secondary key is
//! read from the indexed value at a JSON pointer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ensure;
use syncstore_base::Hash;
use tracing::info;

use super::{DbError, InvalidIndexKeySnafu, map::ValueMap};

const KEY_SEPARATOR: char = '\0';

/// Describes which entries an index covers and how their secondary keys are
/// derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    /// Unique among the indexes of a store.
    pub name: String,
    /// Only primary keys starting with this prefix are indexed.
    #[serde(default)]
    pub key_prefix: String,
    /// Points at the secondary key inside each value.
    pub json_pointer: String,
    /// Entries without a value at the pointer are skipped instead of
    /// reported.
    #[serde(default)]
    pub allow_empty: bool,
}

/// An index as recorded in a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    /// How the index is built.
    pub definition: IndexDefinition,
    /// The map from composite index key to value.
    pub value_hash: Hash,
}

/// Encodes the index map key for a secondary and primary key.
pub fn encode_index_key(secondary: &str, primary: &str) -> Result<String, DbError> {
    ensure!(
        !secondary.contains(KEY_SEPARATOR),
        InvalidIndexKeySnafu {
            message: "Secondary key cannot contain null byte",
        }
    );
    Ok(format!("{KEY_SEPARATOR}{secondary}{KEY_SEPARATOR}{primary}"))
}

/// Splits an index map key into its secondary and primary parts.
pub fn decode_index_key(key: &str) -> Result<(&str, &str), DbError> {
    let rest = key
        .strip_prefix(KEY_SEPARATOR)
        .ok_or_else(|| {
            InvalidIndexKeySnafu {
                message: format!("Invalid version in {key:?}"),
            }
            .build()
        })?;
    rest.split_once(KEY_SEPARATOR).ok_or_else(|| {
        InvalidIndexKeySnafu {
            message: format!("Invalid formatting in {key:?}"),
        }
        .build()
    })
}

/// The index map keys `value` stored under `primary` contributes.
pub fn get_index_keys(
    primary: &str,
    value: &Value,
    json_pointer: &str,
    allow_empty: bool,
) -> Result<Vec<String>, DbError> {
    let Some(target) = value.pointer(json_pointer) else {
        if allow_empty {
            return Ok(Vec::new());
        }
        return InvalidIndexKeySnafu {
            message: format!("No value at path: {json_pointer}"),
        }
        .fail();
    };
    match target {
        Value::String(secondary) => Ok(vec![encode_index_key(secondary, primary)?]),
        Value::Array(values) => values
            .iter()
            .map(|v| match v {
                Value::String(secondary) => encode_index_key(secondary, primary),
                _ => InvalidIndexKeySnafu {
                    message: "Not all values are strings",
                }
                .fail(),
            })
            .collect(),
        _ => InvalidIndexKeySnafu {
            message: "Unsupported target type",
        }
        .fail(),
    }
}

/// Adds or removes the entries of `value` in `index`.
///
/// Entries without a usable secondary key are skipped and logged; they never
/// fail the write.
pub(crate) fn index_value(
    index: &mut ValueMap,
    definition: &IndexDefinition,
    op: IndexOperation,
    key: &str,
    value: &Value,
) {
    let keys = match get_index_keys(key, value, &definition.json_pointer, definition.allow_empty) {
        Ok(keys) => keys,
        Err(err) => {
            info!(index = %definition.name, %key, "Not indexing value: {err}");
            return;
        }
    };
    for index_key in keys {
        match op {
            IndexOperation::Add => {
                index.put(index_key, value.clone());
            }
            IndexOperation::Remove => {
                index.del(&index_key);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexOperation {
    Add,
    Remove,
}

/// Builds an index from scratch over every matching entry of `map`.
pub(crate) fn create_index_map(definition: &IndexDefinition, map: &ValueMap) -> ValueMap {
    let mut index = ValueMap::new();
    for (key, value) in map.scan(&definition.key_prefix) {
        index_value(&mut index, definition, IndexOperation::Add, key, value);
    }
    index
}
