//! In-process mempool: one [`MempoolEntry`] per admitted intent, state machine
//! PENDING -> SENT -> MINED|FAILED (§3 MempoolEntry, §8 monotonicity invariant).

use alloy::primitives::{Address, B256, TxHash, U256};
use chain::{Intent, PackedIntent};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MempoolState {
    Pending,
    Sent,
    Mined,
    Failed,
}

#[derive(Debug, Clone)]
pub struct IntentReceipt {
    pub sender: Address,
    pub nonce: U256,
    pub success: bool,
    pub actual_gas_cost: alloy::primitives::U256,
    pub actual_gas_used: alloy::primitives::U256,
    pub logs: Vec<alloy::rpc::types::Log>,
    pub tx_receipt: Option<alloy::rpc::types::TransactionReceipt>,
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub intent: Intent,
    pub packed: PackedIntent,
    pub intent_hash: B256,
    pub received_at_ms: u64,
    pub state: MempoolState,
    pub submission_tx_hash: Option<TxHash>,
    pub receipt: Option<IntentReceipt>,
}

/// Whether `insert` admitted a new entry or matched one already on record (§3 idempotency).
pub enum Admission {
    New(B256),
    Existing(B256),
}

#[derive(Default)]
pub struct Mempool {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<B256, MempoolEntry>,
    /// Insertion order, oldest first; never reordered or pruned (accept order == reception
    /// order per §5).
    order: Vec<B256>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, intent: Intent, packed: PackedIntent, intent_hash: B256) -> Admission {
        let mut inner = self.inner.lock().expect("mempool mutex poisoned");
        if inner.entries.contains_key(&intent_hash) {
            return Admission::Existing(intent_hash);
        }
        let received_at_ms = now_ms();
        inner.entries.insert(
            intent_hash,
            MempoolEntry {
                intent,
                packed,
                intent_hash,
                received_at_ms,
                state: MempoolState::Pending,
                submission_tx_hash: None,
                receipt: None,
            },
        );
        inner.order.push(intent_hash);
        Admission::New(intent_hash)
    }

    pub fn get(&self, hash: &B256) -> Option<MempoolEntry> {
        let inner = self.inner.lock().expect("mempool mutex poisoned");
        inner.entries.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("mempool mutex poisoned");
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().expect("mempool mutex poisoned");
        inner
            .order
            .iter()
            .filter(|h| {
                inner
                    .entries
                    .get(*h)
                    .is_some_and(|e| e.state == MempoolState::Pending)
            })
            .count()
    }

    /// Oldest-first PENDING entries, capped at `n` (§4.1.3 bundle selection).
    pub fn select_pending(&self, n: usize) -> Vec<B256> {
        let inner = self.inner.lock().expect("mempool mutex poisoned");
        inner
            .order
            .iter()
            .filter(|h| {
                inner
                    .entries
                    .get(*h)
                    .is_some_and(|e| e.state == MempoolState::Pending)
            })
            .take(n)
            .copied()
            .collect()
    }

    /// PENDING -> SENT. No-op (returns false) if the entry isn't PENDING; enforces the DAG
    /// with no back-edges (§8).
    pub fn mark_sent(&self, hash: &B256, tx_hash: TxHash) -> bool {
        let mut inner = self.inner.lock().expect("mempool mutex poisoned");
        match inner.entries.get_mut(hash) {
            Some(e) if e.state == MempoolState::Pending => {
                e.state = MempoolState::Sent;
                e.submission_tx_hash = Some(tx_hash);
                true
            }
            _ => false,
        }
    }

    /// SENT -> MINED, attaching the decoded receipt.
    pub fn mark_mined(&self, hash: &B256, receipt: IntentReceipt) -> bool {
        let mut inner = self.inner.lock().expect("mempool mutex poisoned");
        match inner.entries.get_mut(hash) {
            Some(e) if e.state == MempoolState::Sent => {
                e.state = MempoolState::Mined;
                e.receipt = Some(receipt);
                true
            }
            _ => false,
        }
    }

    /// PENDING or SENT -> FAILED, depending on where the attempt broke down.
    pub fn mark_failed(&self, hash: &B256) -> bool {
        let mut inner = self.inner.lock().expect("mempool mutex poisoned");
        match inner.entries.get_mut(hash) {
            Some(e) if e.state == MempoolState::Pending || e.state == MempoolState::Sent => {
                e.state = MempoolState::Failed;
                true
            }
            _ => false,
        }
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
    use alloy::primitives::{Address, Bytes, U256};

    fn sample_intent(nonce: u64) -> Intent {
        Intent {
            sender: Address::repeat_byte(0xAA),
            nonce: U256::from(nonce),
            factory: None,
            factory_data: None,
            call_data: Bytes::new(),
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(100_000u64),
            pre_verification_gas: U256::from(21_000u64),
            max_fee_per_gas: U256::from(2_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            paymaster: None,
            paymaster_verification_gas_limit: None,
            paymaster_post_op_gas_limit: None,
            paymaster_data: None,
            signature: Bytes::new(),
            delegation_authorization: None,
        }
    }

    fn packed_and_hash(intent: &Intent) -> (PackedIntent, B256) {
        let packed = chain::pack_intent(intent);
        let hash = chain::intent_hash(&packed, Address::repeat_byte(0xEE), 1);
        (packed, hash)
    }

    #[test]
    fn insert_is_idempotent_by_intent_hash() {
        let mempool = Mempool::new();
        let intent = sample_intent(0);
        let (packed, hash) = packed_and_hash(&intent);

        match mempool.insert(intent.clone(), packed.clone(), hash) {
            Admission::New(h) => assert_eq!(h, hash),
            Admission::Existing(_) => panic!("expected first insert to be new"),
        }
        assert_eq!(mempool.len(), 1);

        match mempool.insert(intent, packed, hash) {
            Admission::Existing(h) => assert_eq!(h, hash),
            Admission::New(_) => panic!("expected re-insert to be idempotent"),
        }
        assert_eq!(mempool.len(), 1, "mempool count must not grow on idempotent re-send");
    }

    #[test]
    fn state_transitions_follow_the_dag_with_no_back_edges() {
        let mempool = Mempool::new();
        let intent = sample_intent(1);
        let (packed, hash) = packed_and_hash(&intent);
        mempool.insert(intent, packed, hash);

        assert!(mempool.mark_sent(&hash, TxHash::ZERO));
        assert_eq!(mempool.get(&hash).unwrap().state, MempoolState::Sent);

        // Can't re-send what's already SENT.
        assert!(!mempool.mark_sent(&hash, TxHash::ZERO));

        let receipt = IntentReceipt {
            sender: Address::repeat_byte(0xAA),
            nonce: U256::from(1u64),
            success: true,
            actual_gas_cost: U256::from(1u64),
            actual_gas_used: U256::from(1u64),
            logs: Vec::new(),
            tx_receipt: None,
        };
        assert!(mempool.mark_mined(&hash, receipt));
        assert_eq!(mempool.get(&hash).unwrap().state, MempoolState::Mined);

        // MINED is terminal: no back-edge to PENDING/SENT/FAILED.
        assert!(!mempool.mark_sent(&hash, TxHash::ZERO));
        assert!(!mempool.mark_failed(&hash));
    }

    #[test]
    fn pending_failed_directly_without_passing_through_sent() {
        let mempool = Mempool::new();
        let intent = sample_intent(2);
        let (packed, hash) = packed_and_hash(&intent);
        mempool.insert(intent, packed, hash);

        assert!(mempool.mark_failed(&hash));
        assert_eq!(mempool.get(&hash).unwrap().state, MempoolState::Failed);
        assert!(!mempool.mark_sent(&hash, TxHash::ZERO));
    }

    #[test]
    fn select_pending_is_oldest_first_and_excludes_non_pending() {
        let mempool = Mempool::new();
        let a = sample_intent(10);
        let b = sample_intent(11);
        let (packed_a, hash_a) = packed_and_hash(&a);
        let (packed_b, hash_b) = packed_and_hash(&b);
        mempool.insert(a, packed_a, hash_a);
        mempool.insert(b, packed_b, hash_b);

        mempool.mark_sent(&hash_a, TxHash::ZERO);

        let selected = mempool.select_pending(10);
        assert_eq!(selected, vec![hash_b]);
    }

    #[test]
    fn count_is_monotone_non_decreasing_under_send() {
        let mempool = Mempool::new();
        let before = mempool.len();
        let intent = sample_intent(42);
        let (packed, hash) = packed_and_hash(&intent);
        mempool.insert(intent, packed, hash);
        assert!(mempool.len() >= before);
    }
}
