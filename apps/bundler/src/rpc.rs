//! The `/rpc` JSON-RPC surface (§6): a single `axum` `POST /rpc` handler dispatching on the
//! `method` field of a `{jsonrpc, id, method, params}` envelope, the same shape the reference
//! mock-bundler proxy speaks.

use crate::bundler::Engine;
use crate::errors::BundlerError;
use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, routing::post};
use chain::Intent;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub async fn serve(engine: Engine, shutdown: CancellationToken) -> Result<()> {
    let bind_addr = engine.config.bind_addr.clone();
    let app = Router::new().route("/rpc", post(handle)).with_state(engine);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind rpc listener on {bind_addr}"))?;

    tracing::info!(%bind_addr, "rpc listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("rpc server")?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

async fn handle(State(engine): State<Engine>, Json(req): Json<RpcRequest>) -> Json<Value> {
    let id = req.id.clone();
    let method = method_label(&req.method);
    let started = std::time::Instant::now();
    let result = dispatch(&engine, &req.method, req.params).await;
    engine
        .telemetry
        .rpc_ms(method, result.is_ok(), started.elapsed().as_millis() as u64);
    match result {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })),
        Err(err) => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": err.json_rpc_code(),
                "message": err.to_string(),
            }
        })),
    }
}

/// `BundlerTelemetry::rpc_ms` takes a `&'static str`; unrecognized methods still need a label, so
/// they collapse to one `"other"` bucket instead of leaking unbounded cardinality into the metric.
fn method_label(method: &str) -> &'static str {
    match method {
        "supportedEntryPoints" => "supportedEntryPoints",
        "clientVersion" => "clientVersion",
        "sendIntent" => "sendIntent",
        "estimateIntentGas" => "estimateIntentGas",
        "getIntentReceipt" => "getIntentReceipt",
        "getIntentByHash" => "getIntentByHash",
        _ => "other",
    }
}

async fn dispatch(engine: &Engine, method: &str, params: Value) -> Result<Value, BundlerError> {
    match method {
        "supportedEntryPoints" => Ok(json!(engine.supported_entry_points())),
        "clientVersion" => Ok(json!(engine.client_version())),
        "sendIntent" => {
            let (intent, entry_point) = parse_intent_and_entry_point(params)?;
            let hash = engine.send_intent(intent, entry_point).await?;
            Ok(json!(format!("{hash:#x}")))
        }
        "estimateIntentGas" => {
            let (intent, entry_point) = parse_intent_and_entry_point(params)?;
            let estimate = engine.estimate_intent_gas(&intent, entry_point).await?;
            Ok(json!(estimate))
        }
        "getIntentReceipt" => {
            let hash = parse_single_hash(params)?;
            let receipt = engine
                .get_intent_receipt(hash)
                .await
                .map_err(|e| BundlerError::Internal(e.to_string()))?;
            Ok(match receipt {
                Some(r) => json!(ReceiptView::from(&r)),
                None => Value::Null,
            })
        }
        "getIntentByHash" => {
            let hash = parse_single_hash(params)?;
            Ok(match engine.get_intent_by_hash(hash) {
                Some(v) => json!(v),
                None => Value::Null,
            })
        }
        other => Err(BundlerError::NotFound(format!("unknown method {other}"))),
    }
}

fn parse_intent_and_entry_point(params: Value) -> Result<(Intent, alloy::primitives::Address), BundlerError> {
    #[derive(Deserialize)]
    struct Params {
        intent: Intent,
        entry_point: alloy::primitives::Address,
    }
    let params: Params = serde_json::from_value(params)
        .map_err(|e| BundlerError::Validation(format!("invalid params: {e}")))?;
    Ok((params.intent, params.entry_point))
}

fn parse_single_hash(params: Value) -> Result<alloy::primitives::B256, BundlerError> {
    #[derive(Deserialize)]
    struct Params {
        intent_hash: alloy::primitives::B256,
    }
    // Accept either a bare array-of-one-string or a {intentHash} object, matching how a JSON-RPC
    // client most naturally sends a single positional hash.
    if let Some(s) = params.as_str() {
        return s
            .parse()
            .map_err(|e| BundlerError::Validation(format!("invalid intentHash: {e}")));
    }
    if let Some(arr) = params.as_array() {
        if let Some(first) = arr.first().and_then(Value::as_str) {
            return first
                .parse()
                .map_err(|e| BundlerError::Validation(format!("invalid intentHash: {e}")));
        }
    }
    let params: Params = serde_json::from_value(params)
        .map_err(|e| BundlerError::Validation(format!("invalid params: {e}")))?;
    Ok(params.intent_hash)
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptView {
    sender: alloy::primitives::Address,
    nonce: alloy::primitives::U256,
    success: bool,
    actual_gas_cost: alloy::primitives::U256,
    actual_gas_used: alloy::primitives::U256,
    logs: Vec<alloy::rpc::types::Log>,
    tx_receipt: Option<alloy::rpc::types::TransactionReceipt>,
}

impl From<&crate::mempool::IntentReceipt> for ReceiptView {
    fn from(r: &crate::mempool::IntentReceipt) -> Self {
        Self {
            sender: r.sender,
            nonce: r.nonce,
            success: r.success,
            actual_gas_cost: r.actual_gas_cost,
            actual_gas_used: r.actual_gas_used,
            logs: r.logs.clone(),
            tx_receipt: r.tx_receipt.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_method_maps_to_method_not_found() {
        let err = BundlerError::NotFound("unknown method foo".to_string());
        assert_eq!(err.json_rpc_code(), crate::errors::JSON_RPC_METHOD_NOT_FOUND);
    }

    #[test]
    fn parse_single_hash_accepts_bare_string() {
        let hash = alloy::primitives::B256::repeat_byte(0xAB);
        let params = json!(format!("{hash:#x}"));
        assert_eq!(parse_single_hash(params).unwrap(), hash);
    }

    #[test]
    fn parse_single_hash_accepts_array_form() {
        let hash = alloy::primitives::B256::repeat_byte(0xCD);
        let params = json!([format!("{hash:#x}")]);
        assert_eq!(parse_single_hash(params).unwrap(), hash);
    }
}
