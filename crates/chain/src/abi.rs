//! ABI surface for the entry-point and paymaster contracts this system depends on.
//!
//! The core never implements these contracts (out of scope, §1); it only needs their call
//! signatures, event shapes, and custom errors to admit, submit, and decode intents.

use alloy::sol;

sol! {
    #[sol(rpc)]
    interface EntryPoint {
        struct PackedIntentTuple {
            address sender;
            uint256 nonce;
            bytes initCode;
            bytes callData;
            bytes32 accountGasLimits;
            uint256 preVerificationGas;
            bytes32 gasFees;
            bytes paymasterAndData;
            bytes signature;
        }

        struct UserOpsPerAggregator {
            PackedIntentTuple[] intents;
            address aggregator;
            bytes signature;
        }

        function getUserOpHash(PackedIntentTuple calldata intent) external view returns (bytes32);
        function simulateValidation(PackedIntentTuple calldata intent) external;
        function handleOps(PackedIntentTuple[] calldata intents, address payable beneficiary) external;
        function handleAggregatedOps(UserOpsPerAggregator[] calldata opsPerAggregator, address payable beneficiary) external;
        function getNonce(address sender, uint192 key) external view returns (uint256 nonce);
        function balanceOf(address account) external view returns (uint256);

        event BeforeExecution();
        event IntentOutcome(bytes32 indexed intentHash, address indexed sender, address indexed paymaster, uint256 nonce, bool success, uint256 actualGasCost, uint256 actualGasUsed);
        event PaymasterPostOp(address indexed sender, bytes32 indexed intentHash, uint8 mode, uint256 actualGasCost, uint256 actualUserOpFeePerGas, uint256 feeAmount);

        error FailedOp(uint256 opIndex, string reason);
        error FailedOpWithRevert(uint256 opIndex, string reason, bytes inner);

        /// `simulateValidation` never returns normally; a successful simulation reverts carrying
        /// this payload (§4.1.1). `accountValidationData`/`paymasterValidationData` are packed
        /// words decoded with [`crate::unpack_validation_data`].
        error ValidationResult(uint256 accountValidationData, uint256 paymasterValidationData, uint256 preOpGas, uint256 prefund);
    }
}

/// Post-op execution mode reported by [`EntryPoint::PaymasterPostOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostOpMode {
    Succeeded,
    Reverted,
    PostOpReverted,
    Unknown,
}

impl From<u8> for PostOpMode {
    fn from(value: u8) -> Self {
        match value {
            0 => PostOpMode::Succeeded,
            1 => PostOpMode::Reverted,
            2 => PostOpMode::PostOpReverted,
            _ => PostOpMode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_op_mode_from_u8() {
        assert_eq!(PostOpMode::from(0), PostOpMode::Succeeded);
        assert_eq!(PostOpMode::from(1), PostOpMode::Reverted);
        assert_eq!(PostOpMode::from(2), PostOpMode::PostOpReverted);
        assert_eq!(PostOpMode::from(7), PostOpMode::Unknown);
    }
}
