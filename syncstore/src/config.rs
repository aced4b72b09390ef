//! Configuration of a replica.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{db::FormatVersion, transaction::TransactionEnvironment};

/// The configuration for a replica and its store.
///
/// [`Default`] gives an in-memory store of the current format, suitable for
/// tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// The location of the database file. In memory when `None`.
    pub path: Option<PathBuf>,
    /// Name of the store, used in logs and recovery.
    pub name: String,
    /// Sent along with every pull and push so the server can tell apart
    /// clients running different versions of the app.
    pub schema_version: String,
    /// The persisted format, which also picks the pull and push protocol.
    pub format_version: FormatVersion,
    /// Identifies the browser profile or device the store lives in.
    #[serde(rename = "profileID")]
    pub profile_id: String,
    /// Whether mutation recovery pulls for acknowledged ids after pushing.
    pub recovery_pull_enabled: bool,
    /// Where the replica's mutators run.
    pub environment: TransactionEnvironment,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            name: "default".to_string(),
            schema_version: String::new(),
            format_version: FormatVersion::default(),
            profile_id: String::new(),
            recovery_pull_enabled: true,
            environment: TransactionEnvironment::Client,
        }
    }
}

impl Config {
    /// A configuration for a store at `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = serde_json::from_value(json!({
            "name": "todo",
            "formatVersion": "sdd",
            "profileID": "p1",
        }))
        .unwrap();
        assert_eq!(config.name, "todo");
        assert_eq!(config.format_version, FormatVersion::Sdd);
        assert_eq!(config.profile_id, "p1");
        assert_eq!(config.path, None);
        assert!(config.recovery_pull_enabled);
        assert_eq!(config.environment, TransactionEnvironment::Client);

        let config: Config = serde_json::from_value(json!({"environment": "server"})).unwrap();
        assert_eq!(config.environment, TransactionEnvironment::Server);
    }
}
