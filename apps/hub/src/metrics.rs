use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct HubTelemetry {
    inner: Arc<Inner>,
}

struct Inner {
    logs_ingested_total: Counter<u64>,
    indexer_events_total: Counter<u64>,
    indexer_reorgs_total: Counter<u64>,
    bundler_health_checks_total: Counter<u64>,
    telemetry_events_total: Counter<u64>,

    indexer_scan_ms: Histogram<u64>,
    health_probe_ms: Histogram<u64>,
    http_ms: Histogram<u64>,
}

impl HubTelemetry {
    pub fn new() -> Self {
        let meter = global::meter("hub");

        let logs_ingested_total = meter
            .u64_counter("hub.logs_ingested_total")
            .with_description("Total LogEvents accepted at /logs/ingest")
            .build();
        let indexer_events_total = meter
            .u64_counter("hub.indexer_events_total")
            .with_description("Total chain events decoded by the indexer")
            .build();
        let indexer_reorgs_total = meter
            .u64_counter("hub.indexer_reorgs_total")
            .with_description("Total reorgs detected by the indexer")
            .build();
        let bundler_health_checks_total = meter
            .u64_counter("hub.bundler_health_checks_total")
            .with_description("Total health probes issued against registered bundlers")
            .build();
        let telemetry_events_total = meter
            .u64_counter("hub.telemetry_events_total")
            .with_description("Total named telemetry counter events ingested")
            .build();

        let indexer_scan_ms = meter
            .u64_histogram("hub.indexer_scan_ms")
            .with_description("Indexer scan-window runtime")
            .with_unit("ms")
            .build();
        let health_probe_ms = meter
            .u64_histogram("hub.health_probe_ms")
            .with_description("Bundler health probe runtime")
            .with_unit("ms")
            .build();
        let http_ms = meter
            .u64_histogram("hub.http_ms")
            .with_description("HTTP handler runtime")
            .with_unit("ms")
            .build();

        Self {
            inner: Arc::new(Inner {
                logs_ingested_total,
                indexer_events_total,
                indexer_reorgs_total,
                bundler_health_checks_total,
                telemetry_events_total,
                indexer_scan_ms,
                health_probe_ms,
                http_ms,
            }),
        }
    }

    pub fn logs_ingested(&self, count: u64) {
        self.inner.logs_ingested_total.add(count, &[]);
    }

    pub fn indexer_event(&self, variant: &'static str) {
        let attrs = [KeyValue::new("variant", variant)];
        self.inner.indexer_events_total.add(1, &attrs);
    }

    pub fn indexer_reorg(&self) {
        self.inner.indexer_reorgs_total.add(1, &[]);
    }

    pub fn indexer_scan_ms(&self, ms: u64) {
        self.inner.indexer_scan_ms.record(ms, &[]);
    }

    pub fn bundler_health_check(&self, up: bool) {
        let attrs = [KeyValue::new("status", if up { "up" } else { "down" })];
        self.inner.bundler_health_checks_total.add(1, &attrs);
    }

    pub fn health_probe_ms(&self, ms: u64) {
        self.inner.health_probe_ms.record(ms, &[]);
    }

    pub fn telemetry_event(&self, name: &str) {
        let attrs = [KeyValue::new("name", name.to_string())];
        self.inner.telemetry_events_total.add(1, &attrs);
    }

    pub fn http_ms(&self, route: &'static str, ms: u64) {
        let attrs = [KeyValue::new("route", route)];
        self.inner.http_ms.record(ms, &attrs);
    }
}

impl Default for HubTelemetry {
    fn default() -> Self {
        Self::new()
    }
}
