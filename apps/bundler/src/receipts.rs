//! Per-intent receipt decoding (§4.1.4): slices a bundle transaction's log array into the
//! window each pooled intent owns, and decodes its `IntentOutcome`.

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use chain::abi::EntryPoint;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct DecodedOutcome {
    pub sender: Address,
    pub paymaster: Address,
    pub nonce: alloy::primitives::U256,
    pub success: bool,
    pub actual_gas_cost: alloy::primitives::U256,
    pub actual_gas_used: alloy::primitives::U256,
    pub logs: Vec<Log>,
}

/// Walks a bundle transaction receipt's logs in order, opening a window at each
/// `BeforeExecution` marker and closing it at the next `IntentOutcome`, whose window then
/// belongs to that intentHash (§4.1.4). Callers pass `receipt.logs()` directly.
pub fn decode_receipt_windows(logs: &[Log], entry_point: Address) -> HashMap<B256, DecodedOutcome> {
    let mut windows = HashMap::new();
    let mut window_start = 0usize;

    for (i, log) in logs.iter().enumerate() {
        if log.address() != entry_point {
            continue;
        }
        let Some(topic0) = log.topics().first() else {
            continue;
        };

        if *topic0 == EntryPoint::BeforeExecution::SIGNATURE_HASH {
            window_start = i + 1;
            continue;
        }

        if *topic0 == EntryPoint::IntentOutcome::SIGNATURE_HASH {
            let decoded = match EntryPoint::IntentOutcome::decode_raw_log(
                log.topics().iter().copied(),
                &log.data().data,
            ) {
                Ok(ev) => ev,
                Err(_) => {
                    window_start = i + 1;
                    continue;
                }
            };

            let window_logs = logs[window_start..i].to_vec();
            windows.insert(
                decoded.intentHash,
                DecodedOutcome {
                    sender: decoded.sender,
                    paymaster: decoded.paymaster,
                    nonce: decoded.nonce,
                    success: decoded.success,
                    actual_gas_cost: decoded.actualGasCost,
                    actual_gas_used: decoded.actualGasUsed,
                    logs: window_logs,
                },
            );
            window_start = i + 1;
        }
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData, U256};
    use alloy::rpc::types::Log as RpcLog;

    fn raw_log(address: Address, topics: Vec<B256>, data: Bytes) -> RpcLog {
        RpcLog {
            inner: alloy::primitives::Log {
                address,
                data: LogData::new_unchecked(topics, data),
            },
            ..Default::default()
        }
    }

    fn outcome_log(entry_point: Address, intent_hash: B256, sender: Address, success: bool) -> RpcLog {
        let event = EntryPoint::IntentOutcome {
            intentHash: intent_hash,
            sender,
            paymaster: Address::ZERO,
            nonce: U256::ZERO,
            success,
            actualGasCost: U256::from(1000u64),
            actualGasUsed: U256::from(500u64),
        };
        let encoded = alloy::sol_types::SolEvent::encode_log_data(&event);
        raw_log(entry_point, encoded.topics().to_vec(), encoded.data)
    }

    fn before_execution_log(entry_point: Address) -> RpcLog {
        let event = EntryPoint::BeforeExecution {};
        let encoded = alloy::sol_types::SolEvent::encode_log_data(&event);
        raw_log(entry_point, encoded.topics().to_vec(), encoded.data)
    }

    fn misc_log(address: Address) -> RpcLog {
        raw_log(address, vec![B256::repeat_byte(0x77)], Bytes::from(vec![1, 2, 3]))
    }

    #[test]
    fn splits_logs_into_per_intent_windows_s4() {
        let entry_point = Address::repeat_byte(0xEE);
        let h1 = B256::repeat_byte(0x01);
        let h2 = B256::repeat_byte(0x02);

        let logs = vec![
            before_execution_log(entry_point),
            misc_log(entry_point), // L1a
            misc_log(entry_point), // L1b
            outcome_log(entry_point, h1, Address::repeat_byte(0xAA), true),
            misc_log(entry_point), // L2a
            outcome_log(entry_point, h2, Address::repeat_byte(0xBB), true),
        ];

        let windows = decode_receipt_windows(&logs, entry_point);
        assert_eq!(windows.get(&h1).unwrap().logs.len(), 2);
        assert_eq!(windows.get(&h2).unwrap().logs.len(), 1);
        assert!(windows.get(&h1).unwrap().success);
    }

    #[test]
    fn logs_from_other_addresses_are_ignored_as_window_markers() {
        let entry_point = Address::repeat_byte(0xEE);
        let other = Address::repeat_byte(0x99);
        let h1 = B256::repeat_byte(0x01);

        let logs = vec![
            before_execution_log(entry_point),
            misc_log(other),
            outcome_log(entry_point, h1, Address::repeat_byte(0xAA), false),
        ];

        let windows = decode_receipt_windows(&logs, entry_point);
        let outcome = windows.get(&h1).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.logs.len(), 1);
    }
}
