//! The bundling engine (§4.1, §4.1.3, §5): owns the mempool, runs admission, and drives the
//! interval/size-triggered bundling loop with a single re-entrancy guard.

use crate::config::InstanceConfig;
use crate::errors::BundlerError;
use crate::mempool::{Admission, IntentReceipt, Mempool, MempoolState};
use crate::metrics::BundlerTelemetry;
use crate::observability::Observability;
use crate::receipts;
use alloy::eips::eip7702::{Authorization, SignedAuthorization};
use alloy::network::{EthereumWallet, TransactionBuilder, TransactionBuilder7702};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::Signer;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolEvent};
use anyhow::{Context, Result};
use chain::abi::EntryPoint;
use chain::{Intent, PackedIntent, pack_intent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

/// `select_pending`'s upper bound regardless of the configured size trigger (§4.1.3).
const MAX_BUNDLE_SIZE: usize = 25;

/// Result of `estimateIntentGas` (§4.1 exposed operations). The validity window is only
/// populated in strict mode, since non-strict instances never run `simulateValidation`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub call_gas_limit: U256,
    #[serde(rename = "verifyGasLimit")]
    pub verification_gas_limit: U256,
    #[serde(rename = "preVerifyGas")]
    pub pre_verification_gas: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<u64>,
}

/// Result of `getIntentByHash` (§4.1 exposed operations).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentByHash {
    pub intent: Intent,
    pub state: MempoolState,
    pub submission_tx_hash: Option<B256>,
}

#[derive(Clone)]
pub struct Engine {
    pub config: Arc<InstanceConfig>,
    pub observability: Observability,
    mempool: Arc<Mempool>,
    provider: DynProvider,
    wallet_address: Address,
    chain_id: u64,
    pub telemetry: BundlerTelemetry,
    bundling_in_flight: Arc<AtomicBool>,
    bundle_notify: Arc<Notify>,
    /// Remembered start block for late receipt lookups (§4.1.4).
    start_block: Arc<AtomicU64>,
}

impl Engine {
    pub async fn new(cfg: InstanceConfig, telemetry: BundlerTelemetry) -> Result<Self> {
        let url: Url = cfg.chain_rpc_url.parse().context("parse chain rpc url")?;
        let key = cfg
            .wallet_private_key
            .clone()
            .context("wallet private key must be configured to submit bundles")?;
        let signer: PrivateKeySigner = key.parse().context("invalid wallet private key")?;
        let wallet_address = signer.address();

        let unsigned_provider = ProviderBuilder::new().connect_http(url.clone());
        let unsigned_provider = DynProvider::new(unsigned_provider);
        let chain_id = unsigned_provider
            .get_chain_id()
            .await
            .context("eth_chainId")?;

        let signer = signer.with_chain_id(Some(chain_id));
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(url);
        let provider = DynProvider::new(provider);

        let start_block = provider.get_block_number().await.unwrap_or(0);
        let observability = Observability::new(&cfg.instance_id, cfg.hub_ingest_url.clone(), telemetry.clone());

        Ok(Self {
            config: Arc::new(cfg),
            observability,
            mempool: Arc::new(Mempool::new()),
            provider,
            wallet_address,
            chain_id,
            telemetry,
            bundling_in_flight: Arc::new(AtomicBool::new(false)),
            bundle_notify: Arc::new(Notify::new()),
            start_block: Arc::new(AtomicU64::new(start_block)),
        })
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn supported_entry_points(&self) -> Vec<Address> {
        vec![self.config.entry_point]
    }

    pub fn client_version(&self) -> String {
        format!("gasless-swap-bundler/{}", env!("CARGO_PKG_VERSION"))
    }

    /// Estimates gas limits for an unsent intent; never mutates the mempool (§4.1 exposed
    /// operations). When strict mode is configured, also reports the simulated validity window.
    pub async fn estimate_intent_gas(&self, intent: &Intent, entry_point: Address) -> Result<GasEstimate, BundlerError> {
        if entry_point != self.config.entry_point {
            return Err(BundlerError::Validation(format!(
                "unsupported entryPoint {entry_point}, this instance serves {}",
                self.config.entry_point
            )));
        }
        intent
            .check_paired_fields()
            .map_err(|m| BundlerError::Validation(m.to_string()))?;

        let mut estimate = GasEstimate {
            call_gas_limit: intent.call_gas_limit,
            verification_gas_limit: intent.verification_gas_limit,
            pre_verification_gas: intent.pre_verification_gas,
            valid_after: None,
            valid_until: None,
        };

        if self.config.strict {
            match crate::admission::simulate_validation_window(intent, &self.config, &self.provider).await {
                Ok(window) => {
                    estimate.valid_after = Some(window.valid_after);
                    estimate.valid_until = Some(window.valid_until);
                }
                Err(err) => {
                    tracing::warn!(err = %err, "estimateIntentGas: simulation failed, omitting validity window");
                }
            }
        }

        Ok(estimate)
    }

    /// Looks up a mempool entry's decoded receipt, falling back to a late on-chain lookup when
    /// the engine holds no cached entry for this hash (§4.1.4).
    pub async fn get_intent_receipt(&self, intent_hash: B256) -> Result<Option<IntentReceipt>> {
        if let Some(entry) = self.mempool.get(&intent_hash) {
            if entry.state == MempoolState::Mined {
                return Ok(entry.receipt);
            }
        }
        self.late_lookup_receipt(intent_hash).await
    }

    /// Returns the unpacked intent plus its inclusion location, if known (§4.1 exposed
    /// operations).
    pub fn get_intent_by_hash(&self, intent_hash: B256) -> Option<IntentByHash> {
        let entry = self.mempool.get(&intent_hash)?;
        Some(IntentByHash {
            intent: entry.intent,
            state: entry.state,
            submission_tx_hash: entry.submission_tx_hash,
        })
    }

    /// Admits an intent (§4.1.1) and returns its intentHash, idempotently (§3).
    pub async fn send_intent(&self, intent: Intent, entry_point: Address) -> Result<B256, BundlerError> {
        if entry_point != self.config.entry_point {
            return Err(BundlerError::Validation(format!(
                "unsupported entryPoint {entry_point}, this instance serves {}",
                self.config.entry_point
            )));
        }

        let sender_str = format!("{:#x}", intent.sender);

        let admit_result = crate::admission::admit(&intent, &self.config, &self.provider).await;
        if let Err(err) = &admit_result {
            let policy = serde_json::json!({
                "strict": self.config.strict,
                "minPriorityFeeGwei": self.config.min_priority_fee_gwei,
                "minMaxFeeGwei": self.config.min_max_fee_gwei,
                "minValidUntilSecs": self.config.min_valid_until_secs,
            });
            self.observability.emit_reject(&sender_str, &err.to_string(), policy);
            self.telemetry.intent_rejected(reject_reason_label(err));
        }
        admit_result?;

        let packed = pack_intent(&intent);
        let hash = chain::intent_hash(&packed, self.config.entry_point, self.chain_id);

        match self.mempool.insert(intent, packed, hash) {
            Admission::New(h) => {
                self.telemetry.intent_accepted();
                self.observability.emit_accept(&format!("{h:#x}"), &sender_str, self.chain_id);
                if self.config.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(self.config.delay_ms)).await;
                }
                self.maybe_trigger_bundle();
                Ok(h)
            }
            Admission::Existing(h) => Ok(h),
        }
    }

    fn maybe_trigger_bundle(&self) {
        if self.mempool.pending_count() >= self.config.mempool_size_trigger {
            self.bundle_notify.notify_one();
        }
    }

    /// The interval/size-triggered scheduler (§4.1.3, §5). Interval ticks are checked first in
    /// the `select!` arm order, so a simultaneous fire with the size-trigger notification biases
    /// toward the timer (§9 Open Question, documented in DESIGN.md).
    pub async fn run_bundling_loop(self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.bundling_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.try_bundle().await;
                }
                _ = self.bundle_notify.notified() => {
                    self.try_bundle().await;
                }
            }
        }
    }

    /// Runs one bundling attempt under the re-entrancy guard; a no-op if one is already in
    /// flight (§4.1.3).
    async fn try_bundle(&self) {
        if self.bundling_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = self.attempt_bundle().await;
        self.bundling_in_flight.store(false, Ordering::SeqCst);
        if let Err(err) = result {
            tracing::warn!(err = %err, "bundle attempt failed");
        }
    }

    async fn attempt_bundle(&self) -> Result<()> {
        let n = (self.config.mempool_size_trigger).clamp(1, MAX_BUNDLE_SIZE);
        let hashes = self.mempool.select_pending(n);
        if hashes.is_empty() {
            return Ok(());
        }

        self.telemetry.bundle_attempted();
        self.observability.emit_bundle_attempt(hashes.len());

        let entries: Vec<_> = hashes
            .iter()
            .filter_map(|h| self.mempool.get(h))
            .collect();
        let packed: Vec<PackedIntent> = entries.iter().map(|e| e.packed.clone()).collect();
        let beneficiary = if self.config.beneficiary == Address::ZERO {
            self.wallet_address
        } else {
            self.config.beneficiary
        };

        let started = std::time::Instant::now();
        let submission = self.submit_bundle(packed, beneficiary, &entries).await;

        match submission {
            Ok(tx_hash) => {
                for hash in &hashes {
                    self.mempool.mark_sent(hash, tx_hash);
                }
                self.telemetry.bundle_submitted(started.elapsed().as_millis() as u64);
                self.observability.emit_bundle_submit(&format!("{tx_hash:#x}"), self.chain_id);
                self.await_inclusion_and_decode(tx_hash, &hashes).await?;
            }
            Err(err) => {
                let message = decode_submission_error(&err);
                for hash in &hashes {
                    self.mempool.mark_failed(hash);
                }
                self.telemetry.bundle_failed(started.elapsed().as_millis() as u64);
                self.observability.emit_bundle_fail(&message);
            }
        }

        Ok(())
    }

    async fn submit_bundle(
        &self,
        packed: Vec<PackedIntent>,
        beneficiary: Address,
        entries: &[crate::mempool::MempoolEntry],
    ) -> Result<B256> {
        let delegation_entries: Vec<_> = entries
            .iter()
            .filter_map(|e| e.intent.delegation_authorization.as_ref())
            .collect();

        if delegation_entries.is_empty() {
            let contract = EntryPoint::new(self.config.entry_point, &self.provider);
            let pending = contract
                .handleOps(packed, beneficiary)
                .gas(self.config.bundle_gas_limit)
                .send()
                .await
                .context("handleOps send")?;
            Ok(*pending.tx_hash())
        } else {
            let call = EntryPoint::handleOpsCall {
                intents: packed,
                beneficiary,
            };
            let signed_auths: Vec<SignedAuthorization> =
                delegation_entries.into_iter().map(to_signed_authorization).collect();

            let tx = TransactionRequest::default()
                .with_to(self.config.entry_point)
                .with_input(call.abi_encode())
                .with_gas_limit(self.config.bundle_gas_limit)
                .with_authorization_list(signed_auths);

            let pending = self
                .provider
                .send_transaction(tx)
                .await
                .context("delegation-aware handleOps send")?;
            Ok(*pending.tx_hash())
        }
    }

    async fn await_inclusion_and_decode(&self, tx_hash: B256, hashes: &[B256]) -> Result<()> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .context("eth_getTransactionReceipt")?
            .context("bundle transaction receipt missing after send")?;

        let logs: Vec<_> = receipt.inner.logs().to_vec();
        let windows = receipts::decode_receipt_windows(&logs, self.config.entry_point);

        for hash in hashes {
            let Some(outcome) = windows.get(hash) else {
                continue;
            };
            let intent_receipt = IntentReceipt {
                sender: outcome.sender,
                nonce: outcome.nonce,
                success: outcome.success,
                actual_gas_cost: outcome.actual_gas_cost,
                actual_gas_used: outcome.actual_gas_used,
                logs: outcome.logs.clone(),
                tx_receipt: Some(receipt.clone()),
            };
            self.mempool.mark_mined(hash, intent_receipt);
            self.telemetry.intent_mined(outcome.success);
            self.observability.emit_intent_mined(
                &format!("{hash:#x}"),
                &format!("{:#x}", outcome.sender),
                &format!("{tx_hash:#x}"),
                outcome.success,
                self.chain_id,
            );
        }

        Ok(())
    }

    /// For hashes the engine has never cached a receipt for: re-derives the window by scanning
    /// the entry-point's logs from the remembered start block (§4.1.4).
    pub async fn late_lookup_receipt(&self, intent_hash: B256) -> Result<Option<IntentReceipt>> {
        use alloy::rpc::types::Filter;

        let start = self.start_block.load(Ordering::Relaxed);
        let head = self.provider.get_block_number().await.context("eth_blockNumber")?;
        let filter = Filter::new()
            .address(self.config.entry_point)
            .event_signature(EntryPoint::IntentOutcome::SIGNATURE_HASH)
            .topic1(intent_hash)
            .from_block(start)
            .to_block(head);

        let outcome_logs = self.provider.get_logs(&filter).await.context("eth_getLogs")?;
        let Some(outcome_log) = outcome_logs.into_iter().next() else {
            return Ok(None);
        };
        let Some(tx_hash) = outcome_log.transaction_hash else {
            return Ok(None);
        };
        let Some(receipt) = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .context("eth_getTransactionReceipt")?
        else {
            return Ok(None);
        };

        let logs: Vec<_> = receipt.inner.logs().to_vec();
        let windows = receipts::decode_receipt_windows(&logs, self.config.entry_point);
        Ok(windows.get(&intent_hash).map(|outcome| IntentReceipt {
            sender: outcome.sender,
            nonce: outcome.nonce,
            success: outcome.success,
            actual_gas_cost: outcome.actual_gas_cost,
            actual_gas_used: outcome.actual_gas_used,
            logs: outcome.logs.clone(),
            tx_receipt: Some(receipt),
        }))
    }
}

/// Normalizes a bundle-submission failure to a decoded string for observability (§4.1.5).
/// Best-effort: alloy surfaces revert data on the transport error when the node returns one;
/// otherwise the raw error message is all that's available (the 3-second re-execution fallback
/// lives in `chain::errors::recover_revert_data` for callers that hold a provider + calldata).
fn decode_submission_error(err: &anyhow::Error) -> String {
    for cause in err.chain() {
        if let Some(rpc_err) =
            cause.downcast_ref::<alloy::transports::RpcError<alloy::transports::TransportErrorKind>>()
        {
            if let Some(data) = rpc_err.as_error_resp().and_then(|e| e.as_revert_data()) {
                return chain::parse_error(&data).to_string();
            }
        }
    }
    err.to_string()
}

fn to_signed_authorization(auth: &chain::DelegationAuthorization) -> SignedAuthorization {
    let inner = Authorization {
        chain_id: U256::from(auth.chain_id),
        address: auth.address,
        nonce: auth.nonce,
    };
    SignedAuthorization::new_unchecked(
        inner,
        auth.y_parity,
        U256::from_be_bytes(auth.r.0),
        U256::from_be_bytes(auth.s.0),
    )
}

fn reject_reason_label(err: &BundlerError) -> &'static str {
    match err {
        BundlerError::Validation(_) => "validation",
        BundlerError::AdmissionDenied(_) => "admission_denied",
        BundlerError::SimulationFailure(_) => "simulation_failure",
        BundlerError::Transient(_) => "transient",
        BundlerError::ChainRevert(_) => "chain_revert",
        BundlerError::Internal(_) => "internal",
        BundlerError::NotFound(_) => "not_found",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_size_is_capped_at_25_regardless_of_config() {
        let n = 1_000usize.clamp(1, MAX_BUNDLE_SIZE);
        assert_eq!(n, MAX_BUNDLE_SIZE);
    }

    #[test]
    fn bundle_size_respects_small_configured_trigger() {
        let n = 3usize.clamp(1, MAX_BUNDLE_SIZE);
        assert_eq!(n, 3);
    }
}
