//! The canonical key-value state mapping.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::action::ChangeEvent;

/// A copy of the full state, ordered by key.
pub type StateMap = BTreeMap<String, Value>;

/// A single write produced by the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Overwrite one key.
    Set(String, Value),
    /// Delete one key if present.
    Remove(String),
    /// Delete every key.
    Clear,
}

/// Owns the key-value mapping.
///
/// Every operation is a plain data operation: nothing here notifies
/// subscribers. The store's drain loop is the only writer, so reads made
/// while subscribers run always see a fully applied dispatch.
#[derive(Debug, Default, Clone)]
pub struct StateStore {
    entries: StateMap,
}

impl StateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite `key` and return the previous value, if any.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    /// Returns a copy of the value under `key`, or `None` if absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    /// Returns an independent copy of the whole mapping.
    pub fn get_all(&self) -> StateMap {
        self.entries.clone()
    }

    /// Delete `key`, returning its value. No-op if absent.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Delete every key.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a reducer mutation and describe what changed.
    ///
    /// `Set` always yields one event. `Remove` yields a `Null` event only
    /// when the key existed. `Clear` yields one `Null` event per removed
    /// key, in key order.
    pub(crate) fn apply(&mut self, mutation: Mutation) -> Vec<ChangeEvent> {
        match mutation {
            Mutation::Set(key, value) => {
                self.set(key.clone(), value.clone());
                vec![ChangeEvent::new(key, value)]
            }
            Mutation::Remove(key) => match self.remove(&key) {
                Some(_) => vec![ChangeEvent::new(key, Value::Null)],
                None => Vec::new(),
            },
            Mutation::Clear => std::mem::take(&mut self.entries)
                .into_keys()
                .map(|key| ChangeEvent::new(key, Value::Null))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_returns_previous_value() {
        let mut store = StateStore::new();
        assert_eq!(store.set("count", json!(0)), None);
        assert_eq!(store.set("count", json!(1)), Some(json!(0)));
        assert_eq!(store.get("count"), Some(json!(1)));
    }

    #[test]
    fn get_missing_key_is_none() {
        let store = StateStore::new();
        assert_eq!(store.get("nope"), None);
    }

    #[test]
    fn remove_absent_key_is_noop() {
        let mut store = StateStore::new();
        store.set("a", json!(1));
        assert_eq!(store.remove("b"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_all_is_an_independent_copy() {
        let mut store = StateStore::new();
        store.set("a", json!({"nested": [1, 2]}));
        let copy = store.get_all();

        store.set("a", json!("changed"));
        assert_eq!(copy["a"], json!({"nested": [1, 2]}));
    }

    #[test]
    fn clear_then_get_all_is_empty() {
        let mut store = StateStore::new();
        store.set("a", json!(1));
        store.set("b", json!(2));
        store.clear();
        assert!(store.get_all().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn apply_remove_reports_only_existing_keys() {
        let mut store = StateStore::new();
        store.set("a", json!(1));

        let events = store.apply(Mutation::Remove("a".into()));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "a");
        assert_eq!(events[0].value, Value::Null);

        assert!(store.apply(Mutation::Remove("a".into())).is_empty());
    }

    #[test]
    fn apply_clear_reports_each_key_in_order() {
        let mut store = StateStore::new();
        store.set("b", json!(2));
        store.set("a", json!(1));

        let keys: Vec<String> = store
            .apply(Mutation::Clear)
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(store.is_empty());
    }
}
