//! The structured log ingest schema (§3 LogEvent, §9 "log correlation across services").
//!
//! Both services speak this exact shape: the bundler engine constructs it locally and ships it
//! to the hub's `/logs/ingest` endpoint; the hub's log store accepts it at that boundary and
//! ring-buffers/persists it verbatim. Keeping one definition here means neither side can drift
//! on field names or on what counts as a valid severity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity is closed (§3): unknown values must fail deserialization rather than silently
/// degrading, since `/logs/ingest` rejects unrecognized levels at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// A single structured log event (§3, §6 `POST /logs/ingest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Unix seconds.
    pub timestamp: u64,
    pub level: Severity,
    pub service: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl LogEvent {
    pub fn new(service: impl Into<String>, level: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: now_secs(),
            level,
            service: service.into(),
            message: message.into(),
            request_id: None,
            session_id: None,
            quote_id: None,
            intent_hash: None,
            sender: None,
            owner: None,
            tx_hash: None,
            chain_id: None,
            metadata: None,
        }
    }

    pub fn with_intent_hash(mut self, intent_hash: impl Into<String>) -> Self {
        self.intent_hash = Some(intent_hash.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// Either one [`LogEvent`] or a batch — `POST /logs/ingest` accepts both shapes (§6).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LogIngestBody {
    One(LogEvent),
    Many(Vec<LogEvent>),
}

impl LogIngestBody {
    pub fn into_vec(self) -> Vec<LogEvent> {
        match self {
            LogIngestBody::One(e) => vec![e],
            LogIngestBody::Many(events) => events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_severity_is_rejected() {
        let raw = serde_json::json!({
            "timestamp": 1,
            "level": "TRACE",
            "service": "bundler-1",
            "message": "hi"
        });
        let result: Result<LogEvent, _> = serde_json::from_value(raw);
        assert!(result.is_err());
    }

    #[test]
    fn single_and_batch_ingest_bodies_both_parse() {
        let one = serde_json::json!({
            "timestamp": 1,
            "level": "INFO",
            "service": "bundler-1",
            "message": "hi"
        });
        let parsed: LogIngestBody = serde_json::from_value(one).unwrap();
        assert_eq!(parsed.into_vec().len(), 1);

        let many = serde_json::json!([
            {"timestamp": 1, "level": "INFO", "service": "bundler-1", "message": "a"},
            {"timestamp": 2, "level": "WARN", "service": "bundler-1", "message": "b"}
        ]);
        let parsed: LogIngestBody = serde_json::from_value(many).unwrap();
        assert_eq!(parsed.into_vec().len(), 2);
    }

    #[test]
    fn builder_sets_correlation_ids() {
        let event = LogEvent::new("bundler-1", Severity::Warn, "intent rejected")
            .with_intent_hash("0xabc")
            .with_sender("0xdef")
            .with_chain_id(1);
        assert_eq!(event.intent_hash.as_deref(), Some("0xabc"));
        assert_eq!(event.sender.as_deref(), Some("0xdef"));
        assert_eq!(event.chain_id, Some(1));
    }
}
