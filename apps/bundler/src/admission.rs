//! Admission policy (§4.1.1): fee floors, injected failure, strict-mode simulation.

use crate::config::InstanceConfig;
use crate::errors::BundlerError;
use alloy::network::TransactionBuilder;
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::types::TransactionRequest;
use alloy::sol_types::{SolCall, SolInterface};
use chain::abi::EntryPoint;
use chain::{Intent, pack_intent, unpack_validation_data};
use rand::Rng;

const GWEI: u64 = 1_000_000_000;

/// Runs every admission check in order, short-circuiting on the first rejection (§4.1.1, S2, S3).
pub async fn admit(intent: &Intent, cfg: &InstanceConfig, provider: &DynProvider) -> Result<(), BundlerError> {
    intent
        .check_paired_fields()
        .map_err(|m| BundlerError::Validation(m.to_string()))?;

    check_fee_floors(intent, cfg)?;
    roll_injected_failure(cfg)?;

    if cfg.strict {
        simulate_validation(intent, cfg, provider).await?;
    }

    Ok(())
}

fn check_fee_floors(intent: &Intent, cfg: &InstanceConfig) -> Result<(), BundlerError> {
    let min_priority_wei = alloy::primitives::U256::from(cfg.min_priority_fee_gwei) * alloy::primitives::U256::from(GWEI);
    let min_max_wei = alloy::primitives::U256::from(cfg.min_max_fee_gwei) * alloy::primitives::U256::from(GWEI);

    if intent.max_priority_fee_per_gas < min_priority_wei {
        return Err(BundlerError::Validation(format!(
            "maxPriorityFeePerGas {} is below this instance's priority floor {}",
            intent.max_priority_fee_per_gas, min_priority_wei
        )));
    }
    if intent.max_fee_per_gas < min_max_wei {
        return Err(BundlerError::Validation(format!(
            "maxFeePerGas {} is below this instance's fee floor {}",
            intent.max_fee_per_gas, min_max_wei
        )));
    }
    Ok(())
}

fn roll_injected_failure(cfg: &InstanceConfig) -> Result<(), BundlerError> {
    if cfg.failure_rate <= 0.0 {
        return Ok(());
    }
    let roll: f64 = rand::thread_rng().gen_range(0.0..1.0);
    if roll < cfg.failure_rate {
        return Err(BundlerError::Internal("injected failure roll triggered".to_string()));
    }
    Ok(())
}

/// Runs `simulateValidation` and returns the combined {validAfter, validUntil} window for both
/// the account and the paymaster (the narrower of the two, per §4.1.1's `min(validUntil)` rule).
/// Shared by [`admit`]'s strict-mode check and `estimateIntentGas` (§4.1 exposed operations),
/// which needs the same window without enforcing the floor.
pub async fn simulate_validation_window(
    intent: &Intent,
    cfg: &InstanceConfig,
    provider: &DynProvider,
) -> Result<chain::ValidationWindow, BundlerError> {
    let packed = pack_intent(intent);
    let call = EntryPoint::simulateValidationCall { intent: packed };
    let calldata = call.abi_encode();

    let tx = TransactionRequest::default()
        .with_to(cfg.entry_point)
        .with_input(calldata);

    let result = provider.call(tx).await;

    let revert_data = match result {
        Ok(_) => {
            return Err(BundlerError::SimulationFailure(
                "simulateValidation returned without reverting".to_string(),
            ));
        }
        Err(err) => extract_revert_bytes(&err).ok_or_else(|| {
            BundlerError::Transient(format!("simulateValidation call failed: {err}"))
        })?,
    };

    let decoded = EntryPoint::EntryPointErrors::abi_decode(&revert_data)
        .map_err(|e| BundlerError::SimulationFailure(format!("undecodable simulation result: {e}")))?;

    let EntryPoint::EntryPointErrors::ValidationResult(result) = decoded else {
        return Err(BundlerError::SimulationFailure(
            chain::parse_error(&revert_data).to_string(),
        ));
    };

    let account_window = unpack_validation_data(result.accountValidationData);
    let paymaster_window = unpack_validation_data(result.paymasterValidationData);

    if account_window.sig_failed || paymaster_window.sig_failed {
        return Err(BundlerError::SimulationFailure("signature validation failed".to_string()));
    }

    let valid_until = account_window.valid_until.min(paymaster_window.valid_until);
    let valid_after = account_window.valid_after.max(paymaster_window.valid_after);

    Ok(chain::ValidationWindow {
        sig_failed: false,
        valid_after,
        valid_until,
    })
}

async fn simulate_validation(
    intent: &Intent,
    cfg: &InstanceConfig,
    provider: &DynProvider,
) -> Result<(), BundlerError> {
    let window = simulate_validation_window(intent, cfg, provider).await?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs();

    if window.valid_until < now.saturating_add(cfg.min_valid_until_secs) {
        return Err(BundlerError::Validation("expires too soon".to_string()));
    }

    Ok(())
}

/// Pulls the raw revert payload out of a transport error, if any was attached (§4.1.5).
fn extract_revert_bytes(
    err: &alloy::transports::RpcError<alloy::transports::TransportErrorKind>,
) -> Option<alloy::primitives::Bytes> {
    err.as_error_resp()?.as_revert_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, Bytes, U256};
    use std::time::Duration;

    fn cfg(strict: bool, min_prio_gwei: u64, min_max_gwei: u64, failure_rate: f64) -> InstanceConfig {
        InstanceConfig {
            instance_id: "test".to_string(),
            bind_addr: "0.0.0.0:0".to_string(),
            chain_rpc_url: "http://localhost:8545".to_string(),
            entry_point: Address::repeat_byte(0xEE),
            beneficiary: Address::ZERO,
            policy: crate::config::Policy {
                strict,
                min_priority_fee_gwei: min_prio_gwei,
                min_max_fee_gwei: min_max_gwei,
                min_valid_until_secs: 60,
                delay_ms: 0,
                failure_rate,
            },
            bundling_interval: Duration::from_secs(1),
            mempool_size_trigger: 1,
            bundle_gas_limit: 10_000_000,
            hub_ingest_url: None,
            wallet_private_key: None,
        }
    }

    fn intent_with_fees(priority_gwei: u64, max_gwei: u64) -> Intent {
        Intent {
            sender: Address::repeat_byte(0xAA),
            nonce: U256::ZERO,
            factory: None,
            factory_data: None,
            call_data: Bytes::new(),
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(100_000u64),
            pre_verification_gas: U256::from(21_000u64),
            max_fee_per_gas: U256::from(max_gwei) * U256::from(GWEI),
            max_priority_fee_per_gas: U256::from(priority_gwei) * U256::from(GWEI),
            paymaster: None,
            paymaster_verification_gas_limit: None,
            paymaster_post_op_gas_limit: None,
            paymaster_data: None,
            signature: Bytes::new(),
            delegation_authorization: None,
        }
    }

    #[test]
    fn fee_floors_reject_low_priority_fee() {
        let cfg = cfg(false, 1, 1, 0.0);
        let intent = intent_with_fees(0, 2);
        let err = check_fee_floors(&intent, &cfg).unwrap_err();
        assert!(matches!(err, BundlerError::Validation(m) if m.contains("priority")));
    }

    #[test]
    fn fee_floors_accept_fees_at_or_above_both_floors() {
        let cfg = cfg(false, 1, 1, 0.0);
        let intent = intent_with_fees(1, 1);
        assert!(check_fee_floors(&intent, &cfg).is_ok());
    }

    #[test]
    fn zero_failure_rate_never_rejects() {
        let cfg = cfg(false, 0, 0, 0.0);
        for _ in 0..50 {
            assert!(roll_injected_failure(&cfg).is_ok());
        }
    }

    #[test]
    fn full_failure_rate_always_rejects() {
        let cfg = cfg(false, 0, 0, 1.0);
        assert!(roll_injected_failure(&cfg).is_err());
    }
}
