use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::db::Write;

/// One operation of a server patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Sets `key` to `value`.
    Put {
        /// The key to set.
        key: String,
        /// The new value.
        value: Value,
    },
    /// Removes `key`.
    Del {
        /// The key to remove.
        key: String,
    },
    /// Removes every key.
    Clear,
}

/// Applies `patch` in order to the commit being written.
pub fn apply_patch(write: &mut Write<'_>, patch: &[PatchOperation]) {
    for op in patch {
        match op {
            PatchOperation::Put { key, value } => write.put(key, value.clone()),
            PatchOperation::Del { key } => {
                write.del(key);
            }
            PatchOperation::Clear => write.clear(),
        }
    }
    trace!(ops = patch.len(), "applied patch");
}
