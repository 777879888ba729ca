//! Telemetry aggregator (§4.2.4): session/owner/sender presence maps plus named counters,
//! fed by `POST /telemetry/session` and `POST /telemetry/event`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeartbeat {
    pub session_id: String,
    pub app: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    app: String,
    owner: Option<String>,
    sender: Option<String>,
    last_seen_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OwnerRecord {
    owner: String,
    first_seen_ms: u64,
    last_seen_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SenderRecord {
    sender: String,
    owner: Option<String>,
    first_seen_ms: u64,
    last_seen_ms: u64,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    owners: HashMap<String, OwnerRecord>,
    senders: HashMap<String, SenderRecord>,
    owner_senders: HashMap<String, HashSet<String>>,
    counters: HashMap<String, u64>,
}

pub struct TelemetryStore {
    inner: Mutex<Inner>,
    active_window: Duration,
}

impl TelemetryStore {
    pub fn new(active_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            active_window,
        }
    }

    /// Records a session heartbeat, bumping owner/sender presence maps (§4.2.4 merge rules: the
    /// earliest seen timestamp for an owner/sender never regresses, only last-seen advances).
    /// Owner and sender addresses are lowercased before use as map keys or stored values, since
    /// callers may submit mixed-case checksummed addresses for the same underlying account.
    pub fn record_session(&self, heartbeat: SessionHeartbeat) {
        let now = now_ms();
        let session_id = heartbeat.session_id.to_lowercase();
        let owner = heartbeat.owner.map(|o| o.to_lowercase());
        let sender = heartbeat.sender.map(|s| s.to_lowercase());
        let mut inner = self.inner.lock().expect("telemetry mutex poisoned");

        inner.sessions.insert(
            session_id,
            SessionRecord {
                app: heartbeat.app,
                owner: owner.clone(),
                sender: sender.clone(),
                last_seen_ms: now,
            },
        );

        if let Some(owner) = &owner {
            inner
                .owners
                .entry(owner.clone())
                .and_modify(|r| r.last_seen_ms = now)
                .or_insert_with(|| OwnerRecord {
                    owner: owner.clone(),
                    first_seen_ms: now,
                    last_seen_ms: now,
                });
        }

        if let Some(sender) = &sender {
            inner
                .senders
                .entry(sender.clone())
                .and_modify(|r| {
                    r.last_seen_ms = now;
                    if r.owner.is_none() {
                        r.owner = owner.clone();
                    }
                })
                .or_insert_with(|| SenderRecord {
                    sender: sender.clone(),
                    owner: owner.clone(),
                    first_seen_ms: now,
                    last_seen_ms: now,
                });

            if let Some(owner) = &owner {
                inner
                    .owner_senders
                    .entry(owner.clone())
                    .or_default()
                    .insert(sender.clone());
            }
        }
    }

    /// Bumps a named counter (paid_fallback_attempt/success/failure, §4.2.4).
    pub fn record_event(&self, name: &str) {
        let mut inner = self.inner.lock().expect("telemetry mutex poisoned");
        *inner.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn active_session_count(&self) -> usize {
        let now = now_ms();
        let window_ms = self.active_window.as_millis() as u64;
        let inner = self.inner.lock().expect("telemetry mutex poisoned");
        inner
            .sessions
            .values()
            .filter(|s| now.saturating_sub(s.last_seen_ms) <= window_ms)
            .count()
    }

    pub fn owner_count(&self) -> usize {
        self.inner.lock().expect("telemetry mutex poisoned").owners.len()
    }

    pub fn sender_count(&self) -> usize {
        self.inner.lock().expect("telemetry mutex poisoned").senders.len()
    }

    pub fn owners(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("telemetry mutex poisoned");
        let mut v: Vec<_> = inner.owners.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn senders(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("telemetry mutex poisoned");
        let mut v: Vec<_> = inner.senders.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn senders_for_owner(&self, owner: &str) -> Vec<String> {
        let owner = owner.to_lowercase();
        let inner = self.inner.lock().expect("telemetry mutex poisoned");
        inner
            .owner_senders
            .get(&owner)
            .map(|set| {
                let mut v: Vec<_> = set.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().expect("telemetry mutex poisoned");
        inner.counters.get(name).copied().unwrap_or(0)
    }

    pub fn counters_snapshot(&self) -> HashMap<String, u64> {
        self.inner.lock().expect("telemetry mutex poisoned").counters.clone()
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

    fn heartbeat(session: &str, owner: Option<&str>, sender: Option<&str>) -> SessionHeartbeat {
        SessionHeartbeat {
            session_id: session.to_string(),
            app: "widget".to_string(),
            owner: owner.map(str::to_string),
            sender: sender.map(str::to_string),
        }
    }

    #[test]
    fn session_heartbeat_populates_owner_and_sender_maps() {
        let store = TelemetryStore::new(Duration::from_secs(30));
        store.record_session(heartbeat("s1", Some("0xowner"), Some("0xsender")));
        assert_eq!(store.owner_count(), 1);
        assert_eq!(store.sender_count(), 1);
        assert_eq!(store.senders_for_owner("0xowner"), vec!["0xsender".to_string()]);
    }

    #[test]
    fn active_session_count_respects_window() {
        let store = TelemetryStore::new(Duration::from_secs(30));
        store.record_session(heartbeat("s1", None, None));
        assert_eq!(store.active_session_count(), 1);
    }

    #[test]
    fn counters_accumulate_by_name() {
        let store = TelemetryStore::new(Duration::from_secs(30));
        store.record_event("paid_fallback_attempt");
        store.record_event("paid_fallback_attempt");
        store.record_event("paid_fallback_success");
        assert_eq!(store.counter("paid_fallback_attempt"), 2);
        assert_eq!(store.counter("paid_fallback_success"), 1);
        assert_eq!(store.counter("paid_fallback_failure"), 0);
    }

    #[test]
    fn owner_and_sender_keys_are_lowercased() {
        let store = TelemetryStore::new(Duration::from_secs(30));
        store.record_session(heartbeat("s1", Some("0xOWNER"), Some("0xSENDER")));
        assert_eq!(store.owner_count(), 1);
        assert_eq!(store.senders_for_owner("0xowner"), vec!["0xsender".to_string()]);
        assert_eq!(store.senders_for_owner("0xOWNER"), vec!["0xsender".to_string()]);
    }

    #[test]
    fn owners_and_senders_list_all_known_keys_sorted() {
        let store = TelemetryStore::new(Duration::from_secs(30));
        store.record_session(heartbeat("s1", Some("0xbbb"), Some("0xsender2")));
        store.record_session(heartbeat("s2", Some("0xaaa"), Some("0xsender1")));
        assert_eq!(store.owners(), vec!["0xaaa".to_string(), "0xbbb".to_string()]);
        assert_eq!(store.senders(), vec!["0xsender1".to_string(), "0xsender2".to_string()]);
    }

    #[test]
    fn sender_keeps_first_owner_seen() {
        let store = TelemetryStore::new(Duration::from_secs(30));
        store.record_session(heartbeat("s1", Some("0xowner1"), Some("0xsender")));
        store.record_session(heartbeat("s2", Some("0xowner2"), Some("0xsender")));
        let inner = store.inner.lock().unwrap();
        assert_eq!(
            inner.senders.get("0xsender").unwrap().owner.as_deref(),
            Some("0xowner1")
        );
    }
}
