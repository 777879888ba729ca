//! The error taxonomy (§7) as it applies to the bundler's JSON-RPC surface.

use std::fmt;

/// JSON-RPC 2.0 reserved error codes used at the `/rpc` boundary (§6).
pub const JSON_RPC_INVALID_PARAMS: i64 = -32602;
pub const JSON_RPC_METHOD_NOT_FOUND: i64 = -32601;
pub const JSON_RPC_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone)]
pub enum BundlerError {
    /// Malformed intent, bad JSON, unknown method, unsupported entry-point, fees below floors,
    /// paired fields incomplete.
    Validation(String),
    /// Injected failure, strict-mode validity window too short.
    AdmissionDenied(String),
    /// Contract simulate-validation revert.
    SimulationFailure(String),
    /// Chain RPC network error, bundler RPC network error.
    Transient(String),
    /// FailedOp / FailedOpWithRevert / Panic / Error(string).
    ChainRevert(String),
    /// Unexpected internal failure (policy check threw, etc).
    Internal(String),
    NotFound(String),
}

impl fmt::Display for BundlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundlerError::Validation(m)
            | BundlerError::AdmissionDenied(m)
            | BundlerError::SimulationFailure(m)
            | BundlerError::Transient(m)
            | BundlerError::ChainRevert(m)
            | BundlerError::Internal(m)
            | BundlerError::NotFound(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for BundlerError {}

impl BundlerError {
    /// Maps the taxonomy onto the JSON-RPC reserved codes this service exposes (§6, §7).
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            BundlerError::Validation(_)
            | BundlerError::AdmissionDenied(_)
            | BundlerError::SimulationFailure(_)
            | BundlerError::ChainRevert(_) => JSON_RPC_INVALID_PARAMS,
            BundlerError::NotFound(_) => JSON_RPC_METHOD_NOT_FOUND,
            BundlerError::Transient(_) | BundlerError::Internal(_) => JSON_RPC_INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_invalid_params() {
        assert_eq!(
            BundlerError::Validation("bad".into()).json_rpc_code(),
            JSON_RPC_INVALID_PARAMS
        );
    }

    #[test]
    fn internal_maps_to_internal_error() {
        assert_eq!(
            BundlerError::Internal("boom".into()).json_rpc_code(),
            JSON_RPC_INTERNAL_ERROR
        );
    }
}
