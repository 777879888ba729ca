use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct BundlerTelemetry {
    inner: Arc<Inner>,
}

struct Inner {
    intents_accepted_total: Counter<u64>,
    intents_rejected_total: Counter<u64>,
    bundles_attempted_total: Counter<u64>,
    bundles_submitted_total: Counter<u64>,
    bundles_failed_total: Counter<u64>,
    intents_mined_total: Counter<u64>,

    rpc_ms: Histogram<u64>,
    bundle_submit_ms: Histogram<u64>,
    hub_log_ship_ms: Histogram<u64>,
}

impl BundlerTelemetry {
    pub fn new() -> Self {
        let meter = global::meter("bundler");

        let intents_accepted_total = meter
            .u64_counter("bundler.intents_accepted_total")
            .with_description("Total intents admitted into the mempool")
            .build();
        let intents_rejected_total = meter
            .u64_counter("bundler.intents_rejected_total")
            .with_description("Total intents rejected during admission")
            .build();
        let bundles_attempted_total = meter
            .u64_counter("bundler.bundles_attempted_total")
            .with_description("Total bundling attempts")
            .build();
        let bundles_submitted_total = meter
            .u64_counter("bundler.bundles_submitted_total")
            .with_description("Total bundle submission transactions sent")
            .build();
        let bundles_failed_total = meter
            .u64_counter("bundler.bundles_failed_total")
            .with_description("Total bundle submissions that errored or reverted")
            .build();
        let intents_mined_total = meter
            .u64_counter("bundler.intents_mined_total")
            .with_description("Total intents reaching a mined outcome")
            .build();

        let rpc_ms = meter
            .u64_histogram("bundler.rpc_ms")
            .with_description("JSON-RPC handler runtime")
            .with_unit("ms")
            .build();
        let bundle_submit_ms = meter
            .u64_histogram("bundler.bundle_submit_ms")
            .with_description("Bundle submission transaction runtime")
            .with_unit("ms")
            .build();
        let hub_log_ship_ms = meter
            .u64_histogram("bundler.hub_log_ship_ms")
            .with_description("Log event shipping to the operations hub")
            .with_unit("ms")
            .build();

        Self {
            inner: Arc::new(Inner {
                intents_accepted_total,
                intents_rejected_total,
                bundles_attempted_total,
                bundles_submitted_total,
                bundles_failed_total,
                intents_mined_total,
                rpc_ms,
                bundle_submit_ms,
                hub_log_ship_ms,
            }),
        }
    }

    pub fn intent_accepted(&self) {
        self.inner.intents_accepted_total.add(1, &[]);
    }

    pub fn intent_rejected(&self, reason: &'static str) {
        let attrs = [KeyValue::new("reason", reason)];
        self.inner.intents_rejected_total.add(1, &attrs);
    }

    pub fn bundle_attempted(&self) {
        self.inner.bundles_attempted_total.add(1, &[]);
    }

    pub fn bundle_submitted(&self, ms: u64) {
        self.inner.bundles_submitted_total.add(1, &[]);
        self.inner.bundle_submit_ms.record(ms, &[KeyValue::new("status", "ok")]);
    }

    pub fn bundle_failed(&self, ms: u64) {
        self.inner.bundles_failed_total.add(1, &[]);
        self.inner.bundle_submit_ms.record(ms, &[KeyValue::new("status", "err")]);
    }

    pub fn intent_mined(&self, success: bool) {
        let attrs = [KeyValue::new("success", success)];
        self.inner.intents_mined_total.add(1, &attrs);
    }

    pub fn rpc_ms(&self, method: &'static str, ok: bool, ms: u64) {
        let attrs = [
            KeyValue::new("method", method),
            KeyValue::new("status", if ok { "ok" } else { "err" }),
        ];
        self.inner.rpc_ms.record(ms, &attrs);
    }

    pub fn hub_log_ship_ms(&self, ok: bool, ms: u64) {
        let attrs = [KeyValue::new("status", if ok { "ok" } else { "err" })];
        self.inner.hub_log_ship_ms.record(ms, &attrs);
    }
}

impl Default for BundlerTelemetry {
    fn default() -> Self {
        Self::new()
    }
}
