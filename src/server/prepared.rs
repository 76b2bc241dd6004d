//! Prepared-statement cache.
//!
//! Plans survive for the life of the process (no persistence across
//! restarts). Entries are immutable; re-preparing a name replaces its
//! entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::auth::Privileges;
use crate::errors::{Error, Result};
use crate::plan::PlanNode;

/// An immutable prepared entry.
pub struct Prepared {
    pub name: String,
    pub text: String,
    pub plan: Arc<PlanNode>,
    pub signature: serde_json::Value,
    pub privileges: Privileges,
    pub readonly: bool,
}

#[derive(Default)]
pub struct PreparedCache {
    entries: Mutex<HashMap<String, Arc<Prepared>>>,
}

impl PreparedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, prepared: Prepared) -> Arc<Prepared> {
        let prepared = Arc::new(prepared);
        self.entries
            .lock()
            .unwrap()
            .insert(prepared.name.clone(), prepared.clone());
        prepared
    }

    pub fn get(&self, name: &str) -> Result<Arc<Prepared>> {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::plan(format!("prepared statement {} not found", name)))
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries.lock().unwrap().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> Prepared {
        Prepared {
            name: name.to_string(),
            text: "SELECT 1".to_string(),
            plan: Arc::new(PlanNode::DummyScan),
            signature: serde_json::json!({}),
            privileges: Privileges::new(),
            readonly: true,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let cache = PreparedCache::new();
        cache.put(entry("q1"));
        assert!(cache.get("q1").is_ok());
        assert!(cache.get("q2").is_err());
        assert!(cache.remove("q1"));
        assert!(cache.get("q1").is_err());
    }

    #[test]
    fn test_reprepare_replaces() {
        let cache = PreparedCache::new();
        cache.put(entry("q"));
        let mut second = entry("q");
        second.text = "SELECT 2".to_string();
        cache.put(second);
        assert_eq!(cache.get("q").unwrap().text, "SELECT 2");
        assert_eq!(cache.names(), vec!["q"]);
    }
}
