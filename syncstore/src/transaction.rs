//! Transactions handed to mutators.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db;

/// Where a mutator runs. Some mutators behave differently on the server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionEnvironment {
    /// A client running mutations optimistically.
    #[default]
    Client,
    /// The server, whose results are authoritative.
    Server,
}

impl TransactionEnvironment {
    /// Why a mutation runs the first time in this environment.
    pub fn initial_reason(self) -> TransactionReason {
        match self {
            TransactionEnvironment::Client => TransactionReason::Initial,
            TransactionEnvironment::Server => TransactionReason::Authoritative,
        }
    }
}

/// Why a mutator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransactionReason {
    /// The first run, on the client's own main head.
    Initial,
    /// A replay on top of a newer snapshot.
    Rebase,
    /// Run by the server.
    Authoritative,
}

/// Error returned by a mutator.
pub type MutatorError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Read and write access to the value map for the duration of one mutation.
#[derive(Debug)]
pub struct WriteTransaction<'a, 'b> {
    write: &'b mut db::Write<'a>,
    environment: TransactionEnvironment,
    reason: TransactionReason,
    mutation_id: u64,
    client_id: String,
}

impl<'a, 'b> WriteTransaction<'a, 'b> {
    pub(crate) fn new(
        write: &'b mut db::Write<'a>,
        environment: TransactionEnvironment,
        reason: TransactionReason,
        mutation_id: u64,
        client_id: &str,
    ) -> Self {
        Self {
            write,
            environment,
            reason,
            mutation_id,
            client_id: client_id.to_string(),
        }
    }

    /// Where the mutation runs.
    pub fn environment(&self) -> TransactionEnvironment {
        self.environment
    }

    /// Why the mutation runs.
    pub fn reason(&self) -> TransactionReason {
        self.reason
    }

    /// The id of the mutation being run.
    pub fn mutation_id(&self) -> u64 {
        self.mutation_id
    }

    /// The client the mutation belongs to.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The current value of `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.write.get(key)
    }

    /// Whether `key` has a value.
    pub fn has(&self, key: &str) -> bool {
        self.write.has(key)
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn scan(&self, prefix: &str) -> Vec<(String, Value)> {
        self.write
            .map()
            .scan(prefix)
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Stores `value` under `key`.
    pub fn set(&mut self, key: &str, value: Value) {
        self.write.put(key, value);
    }

    /// Removes `key`; returns whether it was present.
    pub fn del(&mut self, key: &str) -> bool {
        self.write.del(key)
    }
}

/// A named, deterministic change to the value map.
pub trait Mutator: Send + Sync + 'static {
    /// Applies the mutation for `args` through `tx`.
    ///
    /// An error discards every change made through `tx`.
    fn mutate(&self, tx: &mut WriteTransaction<'_, '_>, args: &Value) -> Result<(), MutatorError>;
}

impl<F> Mutator for F
where
    F: Fn(&mut WriteTransaction<'_, '_>, &Value) -> Result<(), MutatorError>
        + Send
        + Sync
        + 'static,
{
    fn mutate(&self, tx: &mut WriteTransaction<'_, '_>, args: &Value) -> Result<(), MutatorError> {
        self(tx, args)
    }
}

/// The mutators known to a replica, by name.
#[derive(Clone, Default)]
pub struct MutatorRegistry {
    mutators: BTreeMap<String, Arc<dyn Mutator>>,
}

impl std::fmt::Debug for MutatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.mutators.keys()).finish()
    }
}

impl MutatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure under `name`, replacing any previous mutator.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut WriteTransaction<'_, '_>, &Value) -> Result<(), MutatorError>
            + Send
            + Sync
            + 'static,
    {
        self.register_mutator(name, f)
    }

    /// Registers `mutator` under `name`, replacing any previous one.
    pub fn register_mutator(
        &mut self,
        name: impl Into<String>,
        mutator: impl Mutator,
    ) -> &mut Self {
        self.mutators.insert(name.into(), Arc::new(mutator));
        self
    }

    /// The mutator registered under `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Mutator>> {
        self.mutators.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.mutators.keys().map(|k| k.as_str())
    }
}
