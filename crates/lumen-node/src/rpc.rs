//! The JSON-RPC 2.0 front-end.
//!
//! One POST endpoint, four methods, HTTP 200 regardless of outcome. The
//! core's concern is method dispatch only: each method is forwarded to a
//! [`ContractGateway`], and faults map to the two stable error codes
//! (−1 handler error, −2 bad request).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use lumen_core::BoxFuture;
use lumen_core::error::CoreError;
use lumen_core::id::{ObjectId, Reference};
use lumen_core::pulse::PulseLog;
use lumen_core::record::{IncomingRequest, ReturnMode};
use lumen_core::requester::{CallOptions, CallOutcome, ContractRequester};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handler fault: the method ran and failed.
pub const ERR_HANDLER: i64 = -1;

/// Bad request: malformed envelope, unknown method, bad params.
pub const ERR_BAD_REQUEST: i64 = -2;

/// The methods this surface dispatches.
pub const RPC_METHODS: [&str; 4] = [
    "contract.createMember",
    "wallet.transfer",
    "wallet.getBalance",
    "migration.addBurnAddresses",
];

/// A gateway fault, rendered as code −1.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GatewayError {
    /// The fault description returned to the client.
    pub message: String,
}

impl GatewayError {
    /// Builds a gateway error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Where dispatched methods go.
pub trait ContractGateway: Send + Sync {
    /// Executes `method` with its JSON params and returns the JSON result.
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, GatewayError>>;
}

/// Dispatches one JSON-RPC envelope. Always yields a response envelope.
pub async fn dispatch_rpc(gateway: &dyn ContractGateway, body: &Value) -> Value {
    let id = body.get("id").cloned().unwrap_or(Value::Null);

    if body.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return error_envelope(id, ERR_BAD_REQUEST, "jsonrpc must be \"2.0\"");
    }
    let Some(method) = body.get("method").and_then(Value::as_str) else {
        return error_envelope(id, ERR_BAD_REQUEST, "method is required");
    };
    if !RPC_METHODS.contains(&method) {
        return error_envelope(id, ERR_BAD_REQUEST, &format!("unknown method {method}"));
    }
    let params = body.get("params").cloned().unwrap_or_else(|| json!({}));
    if !params.is_object() {
        return error_envelope(id, ERR_BAD_REQUEST, "params must be an object");
    }

    debug!(method, "rpc dispatch");
    match gateway.call(method, params).await {
        Ok(result) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }),
        Err(err) => error_envelope(id, ERR_HANDLER, &err.message),
    }
}

fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

#[derive(Clone)]
struct RpcState {
    gateway: Arc<dyn ContractGateway>,
}

/// Builds the HTTP router serving the RPC surface.
pub fn router(gateway: Arc<dyn ContractGateway>) -> Router {
    Router::new()
        .route("/api/rpc", post(handle))
        .with_state(RpcState { gateway })
}

async fn handle(State(state): State<RpcState>, body: String) -> Json<Value> {
    match serde_json::from_str::<Value>(&body) {
        Ok(envelope) => Json(dispatch_rpc(state.gateway.as_ref(), &envelope).await),
        Err(_) => Json(error_envelope(
            Value::Null,
            ERR_BAD_REQUEST,
            "request body is not valid JSON",
        )),
    }
}

/// The production gateway: methods become contract calls through the
/// requester, results come back as JSON.
pub struct RequesterGateway {
    requester: Arc<ContractRequester>,
    pulses: Arc<PulseLog>,
    root_domain: Reference,
    shutdown: CancellationToken,
}

impl RequesterGateway {
    /// Builds the gateway. `root_domain` anchors caller and reason
    /// references for API-originated requests.
    #[must_use]
    pub fn new(
        requester: Arc<ContractRequester>,
        pulses: Arc<PulseLog>,
        root_domain: Reference,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            requester,
            pulses,
            root_domain,
            shutdown,
        }
    }
}

impl ContractGateway for RequesterGateway {
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, GatewayError>> {
        Box::pin(async move {
            let pulse = self
                .pulses
                .latest()
                .map_err(|err| GatewayError::new(err.to_string()))?;
            let arguments = serde_json::to_vec(&params)
                .map_err(|err| GatewayError::new(err.to_string()))?;
            let request = IncomingRequest {
                caller: self.root_domain,
                object: None,
                method: method.to_owned(),
                arguments,
                reason: self.root_domain,
                api_request_id: format!("api-{}", pulse.number),
                return_mode: ReturnMode::NoWait,
                nonce: 0,
            };

            let outcome = self
                .requester
                .call(request, CallOptions::default(), &self.shutdown)
                .await
                .map_err(|err: CoreError| GatewayError::new(err.to_string()))?;
            match outcome {
                CallOutcome::Registered(ack) => Ok(json!({
                    "requestId": object_id_hex(&ack.request_id),
                })),
                CallOutcome::Returned(results) => {
                    if !results.error.is_empty() {
                        return Err(GatewayError::new(results.error));
                    }
                    let reply = if results.payload.is_empty() {
                        Value::Null
                    } else {
                        serde_json::from_slice(&results.payload)
                            .unwrap_or(Value::Null)
                    };
                    Ok(reply)
                }
            }
        })
    }
}

fn object_id_hex(id: &ObjectId) -> String {
    id.as_bytes().iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoGateway;

    impl ContractGateway for EchoGateway {
        fn call<'a>(
            &'a self,
            method: &'a str,
            params: Value,
        ) -> BoxFuture<'a, Result<Value, GatewayError>> {
            Box::pin(async move {
                if method == "wallet.transfer" {
                    return Err(GatewayError::new("insufficient balance"));
                }
                Ok(json!({ "method": method, "params": params }))
            })
        }
    }

    fn envelope(method: &str, params: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": method,
            "params": params,
        })
    }

    #[tokio::test]
    async fn known_methods_dispatch_to_the_gateway() {
        for method in [
            "contract.createMember",
            "wallet.getBalance",
            "migration.addBurnAddresses",
        ] {
            let reply = dispatch_rpc(
                &EchoGateway,
                &envelope(method, json!({ "key": "value" })),
            )
            .await;
            assert_eq!(reply["jsonrpc"], "2.0");
            assert_eq!(reply["id"], 7);
            assert_eq!(reply["result"]["method"], method);
            assert!(reply.get("error").is_none());
        }
    }

    #[tokio::test]
    async fn handler_fault_maps_to_minus_one() {
        let reply = dispatch_rpc(
            &EchoGateway,
            &envelope("wallet.transfer", json!({ "amount": "10" })),
        )
        .await;
        assert_eq!(reply["error"]["code"], ERR_HANDLER);
        assert_eq!(reply["error"]["message"], "insufficient balance");
        assert_eq!(reply["id"], 7);
    }

    #[tokio::test]
    async fn unknown_method_is_a_bad_request() {
        let reply = dispatch_rpc(&EchoGateway, &envelope("wallet.mint", json!({}))).await;
        assert_eq!(reply["error"]["code"], ERR_BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_envelopes_are_bad_requests() {
        // wrong version
        let reply = dispatch_rpc(
            &EchoGateway,
            &json!({ "jsonrpc": "1.0", "id": 1, "method": "wallet.getBalance" }),
        )
        .await;
        assert_eq!(reply["error"]["code"], ERR_BAD_REQUEST);

        // no method
        let reply = dispatch_rpc(&EchoGateway, &json!({ "jsonrpc": "2.0", "id": 1 })).await;
        assert_eq!(reply["error"]["code"], ERR_BAD_REQUEST);

        // params not an object
        let reply = dispatch_rpc(
            &EchoGateway,
            &json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "wallet.getBalance",
                "params": [1, 2],
            }),
        )
        .await;
        assert_eq!(reply["error"]["code"], ERR_BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_params_default_to_empty_object() {
        let reply = dispatch_rpc(
            &EchoGateway,
            &json!({ "jsonrpc": "2.0", "id": 2, "method": "wallet.getBalance" }),
        )
        .await;
        assert_eq!(reply["result"]["params"], json!({}));
    }
}
