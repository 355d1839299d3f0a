// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ancillary key/value state kept per logical session
//!
//! Entries survive reconnects and are dropped together with the session.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct UserSessionStore {
    entries: RwLock<HashMap<String, Map<String, Value>>>,
}

impl UserSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_session(&self, session_id: &str) -> Option<Map<String, Value>> {
        self.entries.read().get(session_id).cloned()
    }

    /// Set one key of the session's state, creating it if needed.
    pub fn set(&self, session_id: &str, key: impl Into<String>, value: Value) {
        self.entries
            .write()
            .entry(session_id.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn get(&self, session_id: &str, key: &str) -> Option<Value> {
        self.entries.read().get(session_id).and_then(|state| state.get(key).cloned())
    }

    pub fn set_session(&self, session_id: &str, state: Map<String, Value>) {
        self.entries.write().insert(session_id.to_string(), state);
    }

    pub fn remove_session(&self, session_id: &str) -> Option<Map<String, Value>> {
        self.entries.write().remove(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_is_per_session() {
        let store = UserSessionStore::new();
        store.set("s-1", "theme", json!("dark"));
        store.set("s-2", "theme", json!("light"));

        assert_eq!(store.get("s-1", "theme"), Some(json!("dark")));
        assert_eq!(store.get("s-2", "theme"), Some(json!("light")));
        assert!(store.remove_session("s-1").is_some());
        assert!(store.get_session("s-1").is_none());
        assert!(store.get_session("s-2").is_some());
    }
}
