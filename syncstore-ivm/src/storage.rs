//! State storage for operators.

use std::{collections::BTreeMap, fmt};

use serde_json::Value;

/// A storage key: a list of values, compared element by element.
pub type StorageKey = Vec<Value>;

/// Key-value storage an operator keeps its state in.
///
/// Every operator gets its own storage; keys only need to be unique within
/// one operator.
pub trait Storage: fmt::Debug {
    /// The value stored under `key`.
    fn get(&self, key: &[Value]) -> Option<Value>;
    /// Stores `value` under `key`.
    fn set(&mut self, key: &[Value], value: Value);
    /// Removes `key`.
    fn del(&mut self, key: &[Value]);
    /// Entries whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &[Value]) -> Vec<(StorageKey, Value)>;
}

/// In-memory [`Storage`].
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: BTreeMap<String, (StorageKey, Value)>,
}

impl MemoryStorage {
    /// An empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn encode(key: &[Value]) -> String {
    Value::Array(key.to_vec()).to_string()
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[Value]) -> Option<Value> {
        self.entries.get(&encode(key)).map(|(_, v)| v.clone())
    }

    fn set(&mut self, key: &[Value], value: Value) {
        self.entries.insert(encode(key), (key.to_vec(), value));
    }

    fn del(&mut self, key: &[Value]) {
        self.entries.remove(&encode(key));
    }

    fn scan(&self, prefix: &[Value]) -> Vec<(StorageKey, Value)> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|(key, _)| key.starts_with(prefix))
            .cloned()
            .collect();
        entries.sort_by(|(a, _), (b, _)| {
            crate::data::compare_values(&Value::Array(a.clone()), &Value::Array(b.clone()))
        });
        entries
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn get(&self, key: &[Value]) -> Option<Value> {
        (**self).get(key)
    }

    fn set(&mut self, key: &[Value], value: Value) {
        (**self).set(key, value)
    }

    fn del(&mut self, key: &[Value]) {
        (**self).del(key)
    }

    fn scan(&self, prefix: &[Value]) -> Vec<(StorageKey, Value)> {
        (**self).scan(prefix)
    }
}
