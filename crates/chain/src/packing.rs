//! Bit-packing, on-chain tuple assembly, and intent-hash derivation (§4.1.2).
//!
//! The two capabilities an alternate chain backend needs to substitute are [`pack_intent`]
//! (builds the packed on-chain tuple) and [`intent_hash`] (the pure function the on-chain
//! contract's `getUserOpHash` view method computes). Both are kept behind this narrow module so
//! tests never have to spin up a provider to exercise packing/hashing invariants.

use crate::abi::EntryPoint::PackedIntentTuple;
use crate::intent::Intent;
use alloy::primitives::{Address, B256, Bytes, U256, keccak256};

/// The packed on-chain tuple an `EntryPoint`-style contract consumes.
pub type PackedIntent = PackedIntentTuple;

fn high128_low128(high: U256, low: U256) -> B256 {
    let mut out = [0u8; 32];
    out[0..16].copy_from_slice(&high.to_be_bytes::<32>()[16..32]);
    out[16..32].copy_from_slice(&low.to_be_bytes::<32>()[16..32]);
    B256::from(out)
}

/// `accountGasLimits = high128(verificationGasLimit) ∥ low128(callGasLimit)`.
pub fn pack_account_gas_limits(verification_gas_limit: U256, call_gas_limit: U256) -> B256 {
    high128_low128(verification_gas_limit, call_gas_limit)
}

/// `gasFees = high128(maxPriorityFeePerGas) ∥ low128(maxFeePerGas)`.
pub fn pack_gas_fees(max_priority_fee_per_gas: U256, max_fee_per_gas: U256) -> B256 {
    high128_low128(max_priority_fee_per_gas, max_fee_per_gas)
}

/// `initCode = factory ∥ factoryData`, or empty when no factory is set.
pub fn pack_init_code(factory: Option<Address>, factory_data: Option<&Bytes>) -> Bytes {
    match factory {
        Some(addr) => {
            let mut out = Vec::with_capacity(20 + factory_data.map(|d| d.len()).unwrap_or(0));
            out.extend_from_slice(addr.as_slice());
            if let Some(data) = factory_data {
                out.extend_from_slice(data);
            }
            Bytes::from(out)
        }
        None => Bytes::new(),
    }
}

/// `paymasterAndData = paymaster ∥ pad16(verifGas) ∥ pad16(postOpGas) ∥ data`, or empty when the
/// paymaster is absent / the zero address.
pub fn pack_paymaster_and_data(
    paymaster: Option<Address>,
    verification_gas_limit: Option<U256>,
    post_op_gas_limit: Option<U256>,
    data: Option<&Bytes>,
) -> Bytes {
    let Some(paymaster) = paymaster.filter(|a| *a != Address::ZERO) else {
        return Bytes::new();
    };
    let mut out = Vec::with_capacity(20 + 16 + 16 + data.map(|d| d.len()).unwrap_or(0));
    out.extend_from_slice(paymaster.as_slice());
    out.extend_from_slice(&verification_gas_limit.unwrap_or_default().to_be_bytes::<32>()[16..32]);
    out.extend_from_slice(&post_op_gas_limit.unwrap_or_default().to_be_bytes::<32>()[16..32]);
    if let Some(data) = data {
        out.extend_from_slice(data);
    }
    Bytes::from(out)
}

/// Builds the packed on-chain tuple from an unpacked [`Intent`]. Does not validate paired
/// fields — callers run [`Intent::check_paired_fields`] during admission (§4.1.1) before calling
/// this.
pub fn pack_intent(intent: &Intent) -> PackedIntent {
    PackedIntent {
        sender: intent.sender,
        nonce: intent.nonce,
        initCode: pack_init_code(intent.factory, intent.factory_data.as_ref()),
        callData: intent.call_data.clone(),
        accountGasLimits: pack_account_gas_limits(
            intent.verification_gas_limit,
            intent.call_gas_limit,
        ),
        preVerificationGas: intent.pre_verification_gas,
        gasFees: pack_gas_fees(intent.max_priority_fee_per_gas, intent.max_fee_per_gas),
        paymasterAndData: pack_paymaster_and_data(
            intent.paymaster,
            intent.paymaster_verification_gas_limit,
            intent.paymaster_post_op_gas_limit,
            intent.paymaster_data.as_ref(),
        ),
        signature: intent.signature.clone(),
    }
}

fn word_address(a: Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..32].copy_from_slice(a.as_slice());
    out
}

fn word_u256(v: U256) -> [u8; 32] {
    v.to_be_bytes::<32>()
}

/// Pure function of every packed field except the signature: the same `getUserOpHash` computation
/// the on-chain `EntryPoint`-style contract performs. intentHash is the chain-derived identifier
/// clients and the indexer correlate on (§3, glossary).
pub fn intent_hash(packed: &PackedIntent, entry_point: Address, chain_id: u64) -> B256 {
    let init_code_hash = keccak256(packed.initCode.as_ref());
    let call_data_hash = keccak256(packed.callData.as_ref());
    let paymaster_and_data_hash = keccak256(packed.paymasterAndData.as_ref());

    let mut inner = Vec::with_capacity(32 * 8);
    inner.extend_from_slice(&word_address(packed.sender));
    inner.extend_from_slice(&word_u256(packed.nonce));
    inner.extend_from_slice(init_code_hash.as_slice());
    inner.extend_from_slice(call_data_hash.as_slice());
    inner.extend_from_slice(packed.accountGasLimits.as_slice());
    inner.extend_from_slice(&word_u256(packed.preVerificationGas));
    inner.extend_from_slice(packed.gasFees.as_slice());
    inner.extend_from_slice(paymaster_and_data_hash.as_slice());
    let inner_hash = keccak256(&inner);

    let mut outer = Vec::with_capacity(32 * 3);
    outer.extend_from_slice(inner_hash.as_slice());
    outer.extend_from_slice(&word_address(entry_point));
    outer.extend_from_slice(&word_u256(U256::from(chain_id)));
    keccak256(&outer)
}

/// Convenience: pack then hash an [`Intent`] directly, mirroring a client computing its own
/// intentHash before signing.
pub fn intent_hash_of(intent: &Intent, entry_point: Address, chain_id: u64) -> B256 {
    intent_hash(&pack_intent(intent), entry_point, chain_id)
}

/// Unpacks `accountGasLimits` back into `(verificationGasLimit, callGasLimit)`.
pub fn unpack_account_gas_limits(packed: B256) -> (U256, U256) {
    let bytes = packed.as_slice();
    let verification = U256::from_be_slice(&bytes[0..16]);
    let call = U256::from_be_slice(&bytes[16..32]);
    (verification, call)
}

/// Unpacks `gasFees` back into `(maxPriorityFeePerGas, maxFeePerGas)`.
pub fn unpack_gas_fees(packed: B256) -> (U256, U256) {
    let bytes = packed.as_slice();
    let priority = U256::from_be_slice(&bytes[0..16]);
    let max_fee = U256::from_be_slice(&bytes[16..32]);
    (priority, max_fee)
}

/// A simulation-time validity window, unpacked from a `validationData` word (§4.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationWindow {
    pub sig_failed: bool,
    pub valid_after: u64,
    pub valid_until: u64,
}

/// `validationData = validAfter(48) ∥ validUntil(48) ∥ aggregator-or-sigFailed(160)`, the layout
/// `simulateValidation` packs into a single word for both the account and the paymaster.
/// `validUntil = 0` means "no expiry"; callers treat that as `u64::MAX`.
pub fn unpack_validation_data(value: U256) -> ValidationWindow {
    let bytes = value.to_be_bytes::<32>();
    // Low 160 bits (bytes[12..32]): aggregator address, or bit 0 as the sigFailed flag for EOA
    // accounts/paymasters with no aggregator.
    let sig_failed = bytes[31] & 1 != 0;
    // Next 48 bits (bytes[6..12]): validUntil.
    let mut valid_until_buf = [0u8; 8];
    valid_until_buf[2..8].copy_from_slice(&bytes[6..12]);
    let valid_until_raw = u64::from_be_bytes(valid_until_buf);
    // Top 48 bits (bytes[0..6]): validAfter.
    let mut valid_after_buf = [0u8; 8];
    valid_after_buf[2..8].copy_from_slice(&bytes[0..6]);
    let valid_after = u64::from_be_bytes(valid_after_buf);
    let valid_until = if valid_until_raw == 0 { u64::MAX } else { valid_until_raw };
    ValidationWindow { sig_failed, valid_after, valid_until }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Intent;

    fn sample_intent() -> Intent {
        Intent {
            sender: Address::repeat_byte(0xAA),
            nonce: U256::from(7u64),
            factory: None,
            factory_data: None,
            call_data: Bytes::from(vec![1, 2, 3]),
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(200_000u64),
            pre_verification_gas: U256::from(50_000u64),
            max_fee_per_gas: U256::from(2_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            paymaster: None,
            paymaster_verification_gas_limit: None,
            paymaster_post_op_gas_limit: None,
            paymaster_data: None,
            signature: Bytes::from(vec![9, 9, 9]),
            delegation_authorization: None,
        }
    }

    #[test]
    fn account_gas_limits_round_trip() {
        let verify = U256::from(200_000u64);
        let call = U256::from(100_000u64);
        let packed = pack_account_gas_limits(verify, call);
        assert_eq!(unpack_account_gas_limits(packed), (verify, call));
    }

    #[test]
    fn gas_fees_round_trip() {
        let prio = U256::from(1_500_000_000u64);
        let max_fee = U256::from(3_000_000_000u64);
        let packed = pack_gas_fees(prio, max_fee);
        assert_eq!(unpack_gas_fees(packed), (prio, max_fee));
    }

    #[test]
    fn init_code_empty_when_no_factory() {
        assert_eq!(pack_init_code(None, None), Bytes::new());
    }

    #[test]
    fn init_code_concatenates_factory_and_data() {
        let factory = Address::repeat_byte(0x11);
        let data = Bytes::from(vec![0xde, 0xad]);
        let packed = pack_init_code(Some(factory), Some(&data));
        assert_eq!(&packed[0..20], factory.as_slice());
        assert_eq!(&packed[20..], &[0xde, 0xad]);
    }

    #[test]
    fn paymaster_and_data_empty_when_zero_address() {
        let packed = pack_paymaster_and_data(Some(Address::ZERO), None, None, None);
        assert_eq!(packed, Bytes::new());
    }

    #[test]
    fn intent_hash_is_deterministic_and_signature_independent() {
        let entry_point = Address::repeat_byte(0xEE);
        let mut a = sample_intent();
        let mut b = sample_intent();
        b.signature = Bytes::from(vec![0xff; 65]);

        let hash_a = intent_hash_of(&a, entry_point, 1);
        let hash_b = intent_hash_of(&b, entry_point, 1);
        assert_eq!(hash_a, hash_b, "signature must not affect intentHash");

        a.nonce = U256::from(8u64);
        let hash_c = intent_hash_of(&a, entry_point, 1);
        assert_ne!(hash_a, hash_c, "differing non-signature fields must change the hash");
    }

    #[test]
    fn validation_data_round_trips_valid_until_and_valid_after() {
        let packed =
            (U256::from(1_700_000_100u64) << 208) | (U256::from(1_700_000_000u64) << 160);
        let window = unpack_validation_data(packed);
        assert!(!window.sig_failed);
        assert_eq!(window.valid_until, 1_700_000_000);
        assert_eq!(window.valid_after, 1_700_000_100);
    }

    #[test]
    fn validation_data_zero_valid_until_means_no_expiry() {
        let window = unpack_validation_data(U256::ZERO);
        assert_eq!(window.valid_until, u64::MAX);
        assert!(!window.sig_failed);
    }

    #[test]
    fn validation_data_sig_failed_bit() {
        let window = unpack_validation_data(U256::from(1u64));
        assert!(window.sig_failed);
    }

    #[test]
    fn intent_hash_varies_by_chain_and_entry_point() {
        let intent = sample_intent();
        let ep_a = Address::repeat_byte(0xEE);
        let ep_b = Address::repeat_byte(0xFF);
        assert_ne!(
            intent_hash_of(&intent, ep_a, 1),
            intent_hash_of(&intent, ep_b, 1)
        );
        assert_ne!(
            intent_hash_of(&intent, ep_a, 1),
            intent_hash_of(&intent, ep_a, 2)
        );
    }
}
