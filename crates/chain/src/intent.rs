//! Unpacked, wire-facing representation of an intent (§3, §6).
//!
//! This mirrors `alloy::rpc::types::eth::erc4337::PackedUserOperation`'s field set — the same
//! fields a bundler already speaks over JSON-RPC — plus the delegation-authorization block this
//! system's intents carry on top of plain ERC-4337 user operations.

use alloy::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};

/// An EIP-7702-style authorization letting `address` temporarily run code at the signer's EOA
/// for the duration of the bundling transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationAuthorization {
    pub chain_id: u64,
    pub address: Address,
    pub nonce: u64,
    pub y_parity: u8,
    pub r: B256,
    pub s: B256,
}

/// The user-signed off-chain message a bundler admits and submits on the sender's behalf (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    pub signature: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_authorization: Option<DelegationAuthorization>,
}

impl Intent {
    /// Returns `true` when this intent carries an authorization and the bundle submitting it
    /// must therefore be a delegation-aware transaction (§4.1.3, §9).
    pub fn is_delegation_aware(&self) -> bool {
        self.delegation_authorization.is_some()
    }

    /// `factory`/`factory_data` and `paymaster`/`paymaster_data` (+ gas limits) must each be
    /// present together. Returns the first missing-pair violation, if any.
    pub fn check_paired_fields(&self) -> Result<(), &'static str> {
        if self.factory.is_some() != self.factory_data.is_some() {
            return Err("factory and factoryData must be set together");
        }
        let paymaster_fields = [
            self.paymaster.is_some(),
            self.paymaster_verification_gas_limit.is_some(),
            self.paymaster_post_op_gas_limit.is_some(),
            self.paymaster_data.is_some(),
        ];
        if paymaster_fields.iter().any(|&b| b) && !paymaster_fields.iter().all(|&b| b) {
            return Err(
                "paymaster, paymasterData, paymasterVerificationGasLimit and paymasterPostOpGasLimit must be set together",
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_intent() -> Intent {
        Intent {
            sender: Address::repeat_byte(0xAA),
            nonce: U256::ZERO,
            factory: None,
            factory_data: None,
            call_data: Bytes::new(),
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(100_000u64),
            pre_verification_gas: U256::from(50_000u64),
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

    #[test]
    fn paired_fields_ok_when_both_absent() {
        assert!(base_intent().check_paired_fields().is_ok());
    }

    #[test]
    fn paired_fields_reject_factory_without_data() {
        let mut intent = base_intent();
        intent.factory = Some(Address::repeat_byte(0x11));
        assert!(intent.check_paired_fields().is_err());
    }

    #[test]
    fn paired_fields_reject_partial_paymaster_block() {
        let mut intent = base_intent();
        intent.paymaster = Some(Address::repeat_byte(0x22));
        intent.paymaster_verification_gas_limit = Some(U256::from(50_000u64));
        assert!(intent.check_paired_fields().is_err());
    }

    #[test]
    fn paired_fields_reject_paymaster_without_paymaster_data() {
        let mut intent = base_intent();
        intent.paymaster = Some(Address::repeat_byte(0x22));
        intent.paymaster_verification_gas_limit = Some(U256::from(50_000u64));
        intent.paymaster_post_op_gas_limit = Some(U256::from(20_000u64));
        assert!(intent.check_paired_fields().is_err());
    }

    #[test]
    fn paired_fields_ok_with_full_paymaster_block() {
        let mut intent = base_intent();
        intent.paymaster = Some(Address::repeat_byte(0x22));
        intent.paymaster_verification_gas_limit = Some(U256::from(50_000u64));
        intent.paymaster_post_op_gas_limit = Some(U256::from(20_000u64));
        intent.paymaster_data = Some(Bytes::from_static(&[0xAB]));
        assert!(intent.check_paired_fields().is_ok());
    }

    #[test]
    fn delegation_aware_flag() {
        let mut intent = base_intent();
        assert!(!intent.is_delegation_aware());
        intent.delegation_authorization = Some(DelegationAuthorization {
            chain_id: 1,
            address: Address::repeat_byte(0x33),
            nonce: 0,
            y_parity: 0,
            r: B256::ZERO,
            s: B256::ZERO,
        });
        assert!(intent.is_delegation_aware());
    }
}
