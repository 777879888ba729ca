//! User-op analytics (§4.2.5): merges entry-point and paymaster chain events into a single
//! IntentSummary map, with eviction and the derived queries `/metrics/*` and `/userops` serve.

use alloy::primitives::{Address, B256, U256};
use chain::abi::PostOpMode;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// One decoded `IntentOutcome` log (§3).
#[derive(Debug, Clone)]
pub struct IntentOutcomeEvent {
    pub intent_hash: B256,
    pub sender: Address,
    pub paymaster: Address,
    pub nonce: U256,
    pub success: bool,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub bundler: Address,
    pub timestamp: u64,
    pub chain_id: u64,
    pub revert_reason: Option<String>,
}

/// One decoded `PaymasterPostOp` log (§3).
#[derive(Debug, Clone)]
pub struct PaymasterPostOpEvent {
    pub intent_hash: B256,
    pub sender: Address,
    pub mode: PostOpMode,
    pub actual_gas_cost: U256,
    pub actual_user_op_fee_per_gas: U256,
    pub fee_amount: U256,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub timestamp: u64,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentSummary {
    pub intent_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_gas_cost: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_gas_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_op_mode: Option<PostOpMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
    pub block_number: u64,
    pub timestamp: u64,
    #[serde(skip)]
    dedup_keys: std::collections::HashSet<(B256, u64)>,
}

impl IntentSummary {
    fn empty(intent_hash: B256) -> Self {
        Self {
            intent_hash: format!("{intent_hash:#x}"),
            sender: None,
            paymaster: None,
            nonce: None,
            success: false,
            actual_gas_cost: None,
            actual_gas_used: None,
            fee_amount: None,
            post_op_mode: None,
            revert_reason: None,
            block_number: 0,
            timestamp: 0,
            dedup_keys: std::collections::HashSet::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub unique_senders: usize,
    pub total_gas_cost: String,
    pub total_fee_amount: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderMetrics {
    pub sender: String,
    pub count: usize,
    pub success: usize,
    pub failure: usize,
    pub last_op_timestamp: u64,
    pub total_gas_cost: String,
    pub total_fee_amount: String,
}

struct Inner {
    summaries: HashMap<B256, IntentSummary>,
}

pub struct AnalyticsStore {
    inner: Mutex<Inner>,
    cap: usize,
}

impl AnalyticsStore {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                summaries: HashMap::new(),
            }),
            cap,
        }
    }

    /// Entry-point ingestion (§4.2.5): sets sender/paymaster/nonce/success/gas costs, preserves
    /// any previously-set feeAmount/postOpMode, dedupes on {txHash, blockNumber}.
    pub fn ingest_outcome(&self, event: IntentOutcomeEvent) {
        let mut inner = self.inner.lock().expect("analytics mutex poisoned");
        let entry = inner
            .summaries
            .entry(event.intent_hash)
            .or_insert_with(|| IntentSummary::empty(event.intent_hash));

        if !entry.dedup_keys.insert((event.tx_hash, event.block_number)) {
            return;
        }

        entry.sender = Some(format!("{:#x}", event.sender));
        entry.paymaster = Some(format!("{:#x}", event.paymaster));
        entry.nonce = Some(event.nonce.to_string());
        entry.success = event.success;
        entry.actual_gas_cost = Some(event.actual_gas_cost.to_string());
        entry.actual_gas_used = Some(event.actual_gas_used.to_string());
        entry.revert_reason = event.revert_reason;
        entry.block_number = event.block_number;
        entry.timestamp = event.timestamp;

        evict_if_over_cap(&mut inner.summaries, self.cap);
    }

    /// Paymaster ingestion (§4.2.5): sets feeAmount/postOpMode; creates a partial record with
    /// success = (mode == SUCCEEDED) if none exists yet.
    pub fn ingest_post_op(&self, event: PaymasterPostOpEvent) {
        let mut inner = self.inner.lock().expect("analytics mutex poisoned");
        let is_new = !inner.summaries.contains_key(&event.intent_hash);
        let entry = inner
            .summaries
            .entry(event.intent_hash)
            .or_insert_with(|| IntentSummary::empty(event.intent_hash));

        if !entry.dedup_keys.insert((event.tx_hash, event.block_number)) {
            return;
        }

        entry.fee_amount = Some(event.fee_amount.to_string());
        entry.post_op_mode = Some(event.mode);
        if is_new {
            entry.success = event.mode == PostOpMode::Succeeded;
            entry.sender = Some(format!("{:#x}", event.sender));
        }
        if entry.block_number == 0 || event.block_number > entry.block_number {
            entry.block_number = event.block_number;
            entry.timestamp = event.timestamp;
        }

        evict_if_over_cap(&mut inner.summaries, self.cap);
    }

    pub fn get(&self, intent_hash: B256) -> Option<IntentSummary> {
        self.inner
            .lock()
            .expect("analytics mutex poisoned")
            .summaries
            .get(&intent_hash)
            .cloned()
    }

    pub fn list(&self, limit: usize, sender: Option<&str>, success: Option<bool>) -> Vec<IntentSummary> {
        let inner = self.inner.lock().expect("analytics mutex poisoned");
        let mut list: Vec<_> = inner
            .summaries
            .values()
            .filter(|s| sender.map(|v| s.sender.as_deref() == Some(v)).unwrap_or(true))
            .filter(|s| success.map(|v| s.success == v).unwrap_or(true))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.block_number.cmp(&a.block_number)));
        list.truncate(limit.min(2000));
        list
    }

    pub fn summary(&self) -> AnalyticsSummary {
        let inner = self.inner.lock().expect("analytics mutex poisoned");
        let mut total_gas = U256::ZERO;
        let mut total_fee = U256::ZERO;
        let mut success = 0usize;
        let mut senders = std::collections::HashSet::new();

        for s in inner.summaries.values() {
            if s.success {
                success += 1;
            }
            if let Some(gas) = &s.actual_gas_cost {
                total_gas += gas.parse::<U256>().unwrap_or(U256::ZERO);
            }
            if let Some(fee) = &s.fee_amount {
                total_fee += fee.parse::<U256>().unwrap_or(U256::ZERO);
            }
            if let Some(sender) = &s.sender {
                senders.insert(sender.clone());
            }
        }

        let total = inner.summaries.len();
        AnalyticsSummary {
            total,
            success,
            failure: total - success,
            unique_senders: senders.len(),
            total_gas_cost: total_gas.to_string(),
            total_fee_amount: total_fee.to_string(),
        }
    }

    pub fn sender_metrics(&self, sender: &str) -> SenderMetrics {
        let inner = self.inner.lock().expect("analytics mutex poisoned");
        let mut metrics = SenderMetrics {
            sender: sender.to_string(),
            count: 0,
            success: 0,
            failure: 0,
            last_op_timestamp: 0,
            total_gas_cost: "0".to_string(),
            total_fee_amount: "0".to_string(),
        };
        let mut total_gas = U256::ZERO;
        let mut total_fee = U256::ZERO;

        for s in inner.summaries.values() {
            if s.sender.as_deref() != Some(sender) {
                continue;
            }
            metrics.count += 1;
            if s.success {
                metrics.success += 1;
            } else {
                metrics.failure += 1;
            }
            metrics.last_op_timestamp = metrics.last_op_timestamp.max(s.timestamp);
            if let Some(gas) = &s.actual_gas_cost {
                total_gas += gas.parse::<U256>().unwrap_or(U256::ZERO);
            }
            if let Some(fee) = &s.fee_amount {
                total_fee += fee.parse::<U256>().unwrap_or(U256::ZERO);
            }
        }
        metrics.total_gas_cost = total_gas.to_string();
        metrics.total_fee_amount = total_fee.to_string();
        metrics
    }

    /// Groups failures by `revertReason` (§4.2.5).
    pub fn failure_reasons(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock().expect("analytics mutex poisoned");
        let mut grouped = HashMap::new();
        for s in inner.summaries.values().filter(|s| !s.success) {
            let reason = s.revert_reason.clone().unwrap_or_else(|| "unknown".to_string());
            *grouped.entry(reason).or_insert(0) += 1;
        }
        grouped
    }

    /// Bucketed counts within `window_secs`, bucket width `bucket_secs` (§4.2.5).
    pub fn timeseries(&self, now: u64, window_secs: u64, bucket_secs: u64) -> Vec<(u64, usize)> {
        let bucket_secs = bucket_secs.max(1);
        let start = now.saturating_sub(window_secs);
        let inner = self.inner.lock().expect("analytics mutex poisoned");
        let mut buckets: HashMap<u64, usize> = HashMap::new();
        for s in inner.summaries.values() {
            if s.timestamp < start || s.timestamp > now {
                continue;
            }
            let bucket = start + ((s.timestamp - start) / bucket_secs) * bucket_secs;
            *buckets.entry(bucket).or_insert(0) += 1;
        }
        let mut out: Vec<_> = buckets.into_iter().collect();
        out.sort_by_key(|(t, _)| *t);
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("analytics mutex poisoned").summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_if_over_cap(summaries: &mut HashMap<B256, IntentSummary>, cap: usize) {
    if summaries.len() <= cap {
        return;
    }
    let mut ordered: Vec<_> = summaries
        .iter()
        .map(|(hash, s)| (*hash, s.timestamp, s.block_number))
        .collect();
    ordered.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
    let overflow = summaries.len() - cap;
    for (hash, _, _) in ordered.into_iter().take(overflow) {
        summaries.remove(&hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(hash: B256, tx: B256, block: u64, success: bool) -> IntentOutcomeEvent {
        IntentOutcomeEvent {
            intent_hash: hash,
            sender: Address::repeat_byte(0x11),
            paymaster: Address::repeat_byte(0x22),
            nonce: U256::from(1u64),
            success,
            actual_gas_cost: U256::from(1000u64),
            actual_gas_used: U256::from(500u64),
            block_number: block,
            tx_hash: tx,
            log_index: 0,
            bundler: Address::repeat_byte(0x33),
            timestamp: block,
            chain_id: 1,
            revert_reason: if success { None } else { Some("AA23".to_string()) },
        }
    }

    fn post_op(hash: B256, tx: B256, block: u64, mode: PostOpMode) -> PaymasterPostOpEvent {
        PaymasterPostOpEvent {
            intent_hash: hash,
            sender: Address::repeat_byte(0x11),
            mode,
            actual_gas_cost: U256::from(1000u64),
            actual_user_op_fee_per_gas: U256::from(1u64),
            fee_amount: U256::from(50u64),
            block_number: block,
            tx_hash: tx,
            log_index: 0,
            timestamp: block,
            chain_id: 1,
        }
    }

    #[test]
    fn outcome_then_post_op_merges_into_one_summary() {
        let store = AnalyticsStore::new(100);
        let hash = B256::repeat_byte(0xAA);
        store.ingest_outcome(outcome(hash, B256::repeat_byte(0x01), 10, true));
        store.ingest_post_op(post_op(hash, B256::repeat_byte(0x02), 11, PostOpMode::Succeeded));

        let summary = store.get(hash).unwrap();
        assert!(summary.success);
        assert_eq!(summary.fee_amount.as_deref(), Some("50"));
        assert_eq!(summary.actual_gas_cost.as_deref(), Some("1000"));
    }

    #[test]
    fn post_op_before_outcome_creates_partial_record() {
        let store = AnalyticsStore::new(100);
        let hash = B256::repeat_byte(0xBB);
        store.ingest_post_op(post_op(hash, B256::repeat_byte(0x03), 5, PostOpMode::Reverted));

        let summary = store.get(hash).unwrap();
        assert!(!summary.success);
        assert_eq!(summary.post_op_mode, Some(PostOpMode::Reverted));
    }

    #[test]
    fn duplicate_tx_block_pair_is_ignored() {
        let store = AnalyticsStore::new(100);
        let hash = B256::repeat_byte(0xCC);
        let tx = B256::repeat_byte(0x04);
        store.ingest_outcome(outcome(hash, tx, 20, true));
        store.ingest_outcome(outcome(hash, tx, 20, false));

        // Second call shares {txHash, blockNumber} with the first and must be a no-op.
        assert!(store.get(hash).unwrap().success);
    }

    #[test]
    fn eviction_drops_oldest_by_timestamp_then_block() {
        let store = AnalyticsStore::new(2);
        store.ingest_outcome(outcome(B256::repeat_byte(0x01), B256::repeat_byte(0x10), 1, true));
        store.ingest_outcome(outcome(B256::repeat_byte(0x02), B256::repeat_byte(0x11), 2, true));
        store.ingest_outcome(outcome(B256::repeat_byte(0x03), B256::repeat_byte(0x12), 3, true));

        assert_eq!(store.len(), 2);
        assert!(store.get(B256::repeat_byte(0x01)).is_none());
        assert!(store.get(B256::repeat_byte(0x03)).is_some());
    }

    #[test]
    fn failure_reasons_group_by_revert_reason() {
        let store = AnalyticsStore::new(100);
        store.ingest_outcome(outcome(B256::repeat_byte(0x01), B256::repeat_byte(0x10), 1, false));
        store.ingest_outcome(outcome(B256::repeat_byte(0x02), B256::repeat_byte(0x11), 2, false));
        let grouped = store.failure_reasons();
        assert_eq!(grouped.get("AA23"), Some(&2));
    }
}
