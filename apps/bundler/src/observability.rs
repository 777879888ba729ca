//! Structured-event emission (§4.1.6): every lifecycle moment becomes a [`chain::LogEvent`],
//! always written to this process's own `tracing` output, and additionally shipped to the
//! Operations Hub's `/logs/ingest` endpoint on a fire-and-forget task when a hub URL is
//! configured, so a slow or unreachable hub never blocks the RPC handler or the bundling loop.

use crate::metrics::BundlerTelemetry;
use chain::{LogEvent, Severity};
use std::time::Instant;

#[derive(Clone)]
pub struct Observability {
    service: String,
    hub_ingest_url: Option<String>,
    http: reqwest::Client,
    telemetry: BundlerTelemetry,
}

impl Observability {
    pub fn new(instance_id: &str, hub_ingest_url: Option<String>, telemetry: BundlerTelemetry) -> Self {
        Self {
            service: format!("bundler:{instance_id}"),
            hub_ingest_url,
            http: reqwest::Client::new(),
            telemetry,
        }
    }

    pub fn emit_startup(&self, instance_id: &str) {
        let event = LogEvent::new(&self.service, Severity::Info, format!("bundler {instance_id} starting"));
        tracing::info!(service = %self.service, "bundler starting");
        self.ship(event);
    }

    pub fn emit_accept(&self, intent_hash: &str, sender: &str, chain_id: u64) {
        let event = LogEvent::new(&self.service, Severity::Info, "intent accepted")
            .with_intent_hash(intent_hash)
            .with_sender(sender)
            .with_chain_id(chain_id);
        tracing::info!(%intent_hash, %sender, chain_id, "intent accepted");
        self.ship(event);
    }

    pub fn emit_reject(&self, sender: &str, reason: &str, policy: serde_json::Value) {
        let mut metadata = serde_json::Map::new();
        metadata.insert("reason".to_string(), serde_json::Value::String(reason.to_string()));
        metadata.insert("policy".to_string(), policy);
        let event = LogEvent::new(&self.service, Severity::Warn, "intent rejected")
            .with_sender(sender)
            .with_metadata(metadata);
        tracing::warn!(%sender, reason, "intent rejected");
        self.ship(event);
    }

    pub fn emit_bundle_attempt(&self, count: usize) {
        let event = LogEvent::new(&self.service, Severity::Info, format!("bundle attempt with {count} intents"));
        tracing::info!(count, "bundle attempt");
        self.ship(event);
    }

    pub fn emit_bundle_submit(&self, tx_hash: &str, chain_id: u64) {
        let event = LogEvent::new(&self.service, Severity::Info, "bundle submitted")
            .with_tx_hash(tx_hash)
            .with_chain_id(chain_id);
        tracing::info!(%tx_hash, chain_id, "bundle submitted");
        self.ship(event);
    }

    pub fn emit_bundle_fail(&self, reason: &str) {
        let mut metadata = serde_json::Map::new();
        metadata.insert("reason".to_string(), serde_json::Value::String(reason.to_string()));
        let event = LogEvent::new(&self.service, Severity::Warn, "bundle submission failed")
            .with_metadata(metadata);
        tracing::warn!(reason, "bundle submission failed");
        self.ship(event);
    }

    pub fn emit_intent_mined(&self, intent_hash: &str, sender: &str, tx_hash: &str, success: bool, chain_id: u64) {
        let level = if success { Severity::Info } else { Severity::Warn };
        let message = if success { "intent mined: success" } else { "intent mined: failed" };
        let event = LogEvent::new(&self.service, level, message)
            .with_intent_hash(intent_hash)
            .with_sender(sender)
            .with_tx_hash(tx_hash)
            .with_chain_id(chain_id);
        if success {
            tracing::info!(%intent_hash, %sender, %tx_hash, chain_id, "intent mined: success");
        } else {
            tracing::warn!(%intent_hash, %sender, %tx_hash, chain_id, "intent mined: failed");
        }
        self.ship(event);
    }

    fn ship(&self, event: LogEvent) {
        let Some(url) = self.hub_ingest_url.clone() else {
            return;
        };
        let http = self.http.clone();
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = http.post(format!("{url}/logs/ingest")).json(&event).send().await;
            let ok = matches!(result, Ok(resp) if resp.status().is_success());
            telemetry.hub_log_ship_ms(ok, started.elapsed().as_millis() as u64);
            if !ok {
                tracing::warn!(?result, "failed to ship log event to hub");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ship_is_a_noop_without_a_configured_hub_url() {
        let obs = Observability::new("test", None, BundlerTelemetry::new());
        // Should not panic or spawn anything observable; absence of a hub URL means local
        // tracing output is the only effect.
        obs.emit_startup("test");
    }
}
