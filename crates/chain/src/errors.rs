//! Revert-payload decoding (§4.1.5): the second of `crates/chain`'s two adapter capabilities,
//! `parse_error`, alongside [`crate::packing::pack_intent`].

use crate::abi::EntryPoint;
use alloy::primitives::{Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolError;
use std::fmt;

sol! {
    error Error(string message);
    error Panic(uint256 code);
}

/// A revert payload normalized into one of the taxonomy's `ChainRevert` shapes (§7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedRevert {
    FailedOp { op_index: U256, reason: String },
    FailedOpWithRevert { op_index: U256, reason: String, inner: Bytes },
    Error { message: String },
    Panic { code: U256 },
    Unknown { data: Bytes },
}

impl fmt::Display for DecodedRevert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedRevert::FailedOp { op_index, reason } => {
                write!(f, "FailedOp(opIndex={op_index}, reason={reason:?})")
            }
            DecodedRevert::FailedOpWithRevert {
                op_index,
                reason,
                inner,
            } => {
                let inner_decoded = parse_error(inner);
                write!(
                    f,
                    "FailedOpWithRevert(opIndex={op_index}, reason={reason:?}, inner={inner_decoded})"
                )
            }
            DecodedRevert::Error { message } => write!(f, "Error({message:?})"),
            DecodedRevert::Panic { code } => write!(f, "Panic({code})"),
            DecodedRevert::Unknown { data } => write!(f, "Unknown(0x{})", hex::encode(data)),
        }
    }
}

/// Decodes a revert payload recognizing `FailedOp`, `FailedOpWithRevert`, `Error(string)` and
/// `Panic(uint256)`, falling back to [`DecodedRevert::Unknown`] for anything else.
pub fn parse_error(data: &[u8]) -> DecodedRevert {
    if let Ok(decoded) = EntryPoint::FailedOp::abi_decode(data) {
        return DecodedRevert::FailedOp {
            op_index: decoded.opIndex,
            reason: decoded.reason,
        };
    }
    if let Ok(decoded) = EntryPoint::FailedOpWithRevert::abi_decode(data) {
        return DecodedRevert::FailedOpWithRevert {
            op_index: decoded.opIndex,
            reason: decoded.reason,
            inner: decoded.inner,
        };
    }
    if let Ok(decoded) = Error::abi_decode(data) {
        return DecodedRevert::Error {
            message: decoded.message,
        };
    }
    if let Ok(decoded) = Panic::abi_decode(data) {
        return DecodedRevert::Panic { code: decoded.code };
    }
    DecodedRevert::Unknown {
        data: Bytes::copy_from_slice(data),
    }
}

/// Best-effort recovery of revert data when none was surfaced by the original call: re-executes
/// `make_call` (expected to be a view call at the receipt's block) under a 3-second cap (§4.1.5).
pub async fn recover_revert_data<F, Fut>(make_call: F) -> Option<Bytes>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Bytes>>,
{
    match tokio::time::timeout(std::time::Duration::from_secs(3), make_call()).await {
        Ok(Ok(data)) => Some(data),
        Ok(Err(err)) => {
            tracing::warn!(err = %err, "best-effort revert re-execution failed");
            None
        }
        Err(_) => {
            tracing::warn!("best-effort revert re-execution timed out after 3s");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolError;

    #[test]
    fn decodes_error_string() {
        let encoded = Error {
            message: "insufficient funds".to_string(),
        }
        .abi_encode();
        match parse_error(&encoded) {
            DecodedRevert::Error { message } => assert_eq!(message, "insufficient funds"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn decodes_panic() {
        let encoded = Panic {
            code: U256::from(0x11u64),
        }
        .abi_encode();
        match parse_error(&encoded) {
            DecodedRevert::Panic { code } => assert_eq!(code, U256::from(0x11u64)),
            other => panic!("expected Panic, got {other:?}"),
        }
    }

    #[test]
    fn decodes_failed_op() {
        let encoded = EntryPoint::FailedOp {
            opIndex: U256::from(0u64),
            reason: "AA21 didn't pay prefund".to_string(),
        }
        .abi_encode();
        match parse_error(&encoded) {
            DecodedRevert::FailedOp { op_index, reason } => {
                assert_eq!(op_index, U256::ZERO);
                assert_eq!(reason, "AA21 didn't pay prefund");
            }
            other => panic!("expected FailedOp, got {other:?}"),
        }
    }

    #[test]
    fn decodes_failed_op_with_revert() {
        let inner = Error {
            message: "inner revert".to_string(),
        }
        .abi_encode();
        let encoded = EntryPoint::FailedOpWithRevert {
            opIndex: U256::from(1u64),
            reason: "AA23 reverted".to_string(),
            inner: Bytes::from(inner),
        }
        .abi_encode();
        match parse_error(&encoded) {
            DecodedRevert::FailedOpWithRevert {
                op_index, reason, ..
            } => {
                assert_eq!(op_index, U256::from(1u64));
                assert_eq!(reason, "AA23 reverted");
            }
            other => panic!("expected FailedOpWithRevert, got {other:?}"),
        }
    }

    #[test]
    fn unknown_payload_falls_back() {
        let data = vec![0xde, 0xad, 0xbe, 0xef];
        match parse_error(&data) {
            DecodedRevert::Unknown { data: got } => assert_eq!(got.as_ref(), data.as_slice()),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recover_revert_data_returns_some_on_success() {
        let data = recover_revert_data(|| async { Ok(Bytes::from(vec![1, 2, 3])) }).await;
        assert_eq!(data, Some(Bytes::from(vec![1, 2, 3])));
    }

    #[tokio::test]
    async fn recover_revert_data_returns_none_on_error() {
        let data: Option<Bytes> =
            recover_revert_data(|| async { Err(anyhow::anyhow!("boom")) }).await;
        assert_eq!(data, None);
    }
}
