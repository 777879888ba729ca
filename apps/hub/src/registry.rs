//! Bundler registry (§3 BundlerInstance, §4.2.1): a keyed map of per-instance records plus the
//! child-process handles spawned instances own. Exclusively owned by the Operations Hub.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BundlerStatus {
    Up,
    Down,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePolicy {
    pub strict: bool,
    pub min_priority_fee_gwei: u64,
    pub min_max_fee_gwei: u64,
    pub min_valid_until_secs: u64,
    pub delay_ms: u64,
    pub failure_rate: f64,
}

impl Default for InstancePolicy {
    fn default() -> Self {
        Self {
            strict: false,
            min_priority_fee_gwei: 0,
            min_max_fee_gwei: 0,
            min_valid_until_secs: 30,
            delay_ms: 0,
            failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlerInstance {
    pub id: String,
    pub label: String,
    pub rpc_url: String,
    pub status: BundlerStatus,
    pub policy: InstancePolicy,
    pub spawned: bool,
    pub spawned_at_ms: Option<u64>,
    pub last_seen_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
}

/// Everything `upsert` needs that the registry doesn't derive itself.
pub struct NewInstance {
    pub id: String,
    pub label: String,
    pub rpc_url: String,
    pub policy: InstancePolicy,
    pub spawned: bool,
    pub config_path: Option<PathBuf>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<HashMap<String, BundlerInstance>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for `new.id` (§4.2.1 *upsert*). Spawned-at and last-seen
    /// are reset to "now" and "never" respectively.
    pub fn upsert(&self, new: NewInstance) -> BundlerInstance {
        let instance = BundlerInstance {
            id: new.id.clone(),
            label: new.label,
            rpc_url: new.rpc_url,
            status: BundlerStatus::Down,
            policy: new.policy,
            spawned: new.spawned,
            spawned_at_ms: new.spawned.then(now_ms),
            last_seen_ms: None,
            config_path: new.config_path,
        };
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.insert(new.id, instance.clone());
        instance
    }

    pub fn get(&self, id: &str) -> Option<BundlerInstance> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<BundlerInstance> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.remove(id)
    }

    /// All instances (§4.2.1 *listPublic* strips nothing extra here since process handles live
    /// in the supervisor, not this store; kept as the name the spec uses).
    pub fn list_public(&self) -> Vec<BundlerInstance> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        let mut list: Vec<_> = inner.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn update_status(&self, id: &str, status: BundlerStatus) -> bool {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        match inner.get_mut(id) {
            Some(instance) => {
                instance.status = status;
                instance.last_seen_ms = Some(now_ms());
                true
            }
            None => false,
        }
    }

    pub fn update_policy(&self, id: &str, policy: InstancePolicy) -> bool {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        match inner.get_mut(id) {
            Some(instance) => {
                instance.policy = policy;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> NewInstance {
        NewInstance {
            id: id.to_string(),
            label: "demo".to_string(),
            rpc_url: "http://localhost:4337/rpc".to_string(),
            policy: InstancePolicy::default(),
            spawned: false,
            config_path: None,
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let registry = Registry::new();
        registry.upsert(sample("a"));
        let got = registry.get("a").unwrap();
        assert_eq!(got.id, "a");
        assert_eq!(got.status, BundlerStatus::Down);
    }

    #[test]
    fn upsert_is_idempotent_by_id_and_replaces() {
        let registry = Registry::new();
        registry.upsert(sample("a"));
        registry.update_status("a", BundlerStatus::Up);
        registry.upsert(sample("a"));
        // A fresh upsert resets status to DOWN, it does not merge.
        assert_eq!(registry.get("a").unwrap().status, BundlerStatus::Down);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_status_is_a_noop_on_unknown_id() {
        let registry = Registry::new();
        assert!(!registry.update_status("missing", BundlerStatus::Up));
    }

    #[test]
    fn list_public_is_sorted_by_id() {
        let registry = Registry::new();
        registry.upsert(sample("b"));
        registry.upsert(sample("a"));
        let ids: Vec<_> = registry.list_public().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn remove_returns_the_removed_instance() {
        let registry = Registry::new();
        registry.upsert(sample("a"));
        let removed = registry.remove("a").unwrap();
        assert_eq!(removed.id, "a");
        assert!(registry.is_empty());
    }
}
