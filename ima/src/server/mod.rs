// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC 2.0 front end of the agent.

use crate::with_metrics;
use crate::{
    error::{ImaError, ImaResult},
    metrics::ImaMetrics,
    pending_txns::BroadcastAction,
    server::handler::ImaRequestHandlerTrait,
};
use axum::{extract::State, http::StatusCode, routing::get, routing::post, Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, instrument};

pub mod handler;

#[cfg(test)]
pub(crate) mod mock_handler;

pub const PING_PATH: &str = "/ping";

pub const VERIFY_AND_SIGN_METHOD: &str = "skale_imaVerifyAndSign";
pub const BSU256_METHOD: &str = "skale_imaBSU256";
pub const BROADCAST_TXN_INSERT_METHOD: &str = "skale_imaBroadcastTxnInsert";
pub const BROADCAST_TXN_ERASE_METHOD: &str = "skale_imaBroadcastTxnErase";
pub const TXN_INSERT_METHOD: &str = "skale_imaTxnInsert";
pub const TXN_ERASE_METHOD: &str = "skale_imaTxnErase";
pub const TXN_CLEAR_METHOD: &str = "skale_imaTxnClear";
pub const TXN_FIND_METHOD: &str = "skale_imaTxnFind";
pub const TXN_LIST_ALL_METHOD: &str = "skale_imaTxnListAll";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const SERVER_ERROR: i64 = -32000;

// Public node metadata served on `/ping`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImaNodePublicMetadata {
    pub version: &'static str,
    pub chain_name: String,
    pub node_id: Option<u64>,
}

impl ImaNodePublicMetadata {
    pub fn empty_for_testing() -> Self {
        Self {
            version: "testing",
            chain_name: "testing".to_string(),
            node_id: None,
        }
    }
}

#[derive(Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<ImaError> for JsonRpcError {
    fn from(err: ImaError) -> Self {
        let code = if err.is_client_error() {
            INVALID_PARAMS
        } else {
            SERVER_ERROR
        };
        Self {
            code,
            message: err.to_string(),
            data: Some(json!({ "type": err.error_type() })),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn new(id: Value, outcome: Result<Value, JsonRpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result,
            error,
        }
    }
}

// Methods without parameters accept `{}`, `[]` or nothing.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoParams {}

/// Params are an object or a one-element array holding that object.
pub(crate) fn request_params<T: DeserializeOwned>(params: Value) -> ImaResult<T> {
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        Value::Array(mut items) if items.len() <= 1 => {
            items.pop().unwrap_or_else(|| Value::Object(Default::default()))
        }
        Value::Array(items) => {
            return Err(ImaError::InvalidRequest(format!(
                "expected a single params object, got {} items",
                items.len()
            )))
        }
        other => other,
    };
    serde_json::from_value(params).map_err(|e| ImaError::InvalidRequest(e.to_string()))
}

pub fn run_server(
    socket_address: &SocketAddr,
    handler: Arc<impl ImaRequestHandlerTrait + Sync + Send + 'static>,
    metrics: Arc<ImaMetrics>,
    metadata: Arc<ImaNodePublicMetadata>,
) -> tokio::task::JoinHandle<()> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(socket_address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind JSON-RPC server to {}: {}", socket_address, e);
                return;
            }
        };
        info!("JSON-RPC server listening on {}", socket_address);
        if let Err(e) = axum::serve(
            listener,
            make_router(handler, metrics, metadata).into_make_service(),
        )
        .await
        {
            error!("JSON-RPC server stopped: {}", e);
        }
    })
}

pub(crate) fn make_router(
    handler: Arc<impl ImaRequestHandlerTrait + Sync + Send + 'static>,
    metrics: Arc<ImaMetrics>,
    metadata: Arc<ImaNodePublicMetadata>,
) -> Router {
    Router::new()
        .route("/", post(handle_json_rpc))
        .route("/health", get(health_check))
        .route(PING_PATH, get(ping))
        .with_state((handler, metrics, metadata))
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn ping(
    State((_, _, metadata)): State<(
        Arc<impl ImaRequestHandlerTrait + Sync + Send>,
        Arc<ImaMetrics>,
        Arc<ImaNodePublicMetadata>,
    )>,
) -> Json<Arc<ImaNodePublicMetadata>> {
    Json(metadata)
}

async fn handle_json_rpc(
    State((handler, metrics, _)): State<(
        Arc<impl ImaRequestHandlerTrait + Sync + Send>,
        Arc<ImaMetrics>,
        Arc<ImaNodePublicMetadata>,
    )>,
    body: String,
) -> Json<JsonRpcResponse> {
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            return Json(JsonRpcResponse::new(
                Value::Null,
                Err(JsonRpcError {
                    code: PARSE_ERROR,
                    message: format!("parse error: {}", e),
                    data: None,
                }),
            ))
        }
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return Json(JsonRpcResponse::new(
                id,
                Err(JsonRpcError {
                    code: INVALID_REQUEST,
                    message: format!("invalid request: {}", e),
                    data: None,
                }),
            ))
        }
    };
    let outcome = dispatch_method(&*handler, metrics, &request.method, request.params).await;
    Json(JsonRpcResponse::new(request.id, outcome))
}

async fn call<T, F, Fut>(
    metrics: Arc<ImaMetrics>,
    method: &'static str,
    params: Value,
    f: F,
) -> Result<Value, JsonRpcError>
where
    T: DeserializeOwned,
    F: FnOnce(T) -> Fut,
    Fut: Future<Output = ImaResult<Value>>,
{
    let future = async move {
        let request = request_params::<T>(params)?;
        f(request).await
    };
    with_metrics!(metrics, method, future)
        .await
        .map_err(JsonRpcError::from)
}

#[instrument(level = "error", skip_all, fields(method = method))]
async fn dispatch_method(
    handler: &(impl ImaRequestHandlerTrait + Sync + Send),
    metrics: Arc<ImaMetrics>,
    method: &str,
    params: Value,
) -> Result<Value, JsonRpcError> {
    match method {
        VERIFY_AND_SIGN_METHOD => {
            call(metrics, VERIFY_AND_SIGN_METHOD, params, |r| {
                handler.handle_verify_and_sign(r)
            })
            .await
        }
        BSU256_METHOD => call(metrics, BSU256_METHOD, params, |r| handler.handle_bsu256(r)).await,
        BROADCAST_TXN_INSERT_METHOD => {
            call(metrics, BROADCAST_TXN_INSERT_METHOD, params, |r| {
                handler.handle_broadcast_txn(BroadcastAction::Insert, r)
            })
            .await
        }
        BROADCAST_TXN_ERASE_METHOD => {
            call(metrics, BROADCAST_TXN_ERASE_METHOD, params, |r| {
                handler.handle_broadcast_txn(BroadcastAction::Erase, r)
            })
            .await
        }
        TXN_INSERT_METHOD => {
            call(metrics, TXN_INSERT_METHOD, params, |r| handler.handle_txn_insert(r)).await
        }
        TXN_ERASE_METHOD => {
            call(metrics, TXN_ERASE_METHOD, params, |r| handler.handle_txn_erase(r)).await
        }
        TXN_FIND_METHOD => {
            call(metrics, TXN_FIND_METHOD, params, |r| handler.handle_txn_find(r)).await
        }
        TXN_CLEAR_METHOD => {
            call(metrics, TXN_CLEAR_METHOD, params, |_: NoParams| {
                handler.handle_txn_clear()
            })
            .await
        }
        TXN_LIST_ALL_METHOD => {
            call(metrics, TXN_LIST_ALL_METHOD, params, |_: NoParams| {
                handler.handle_txn_list_all()
            })
            .await
        }
        other => Err(JsonRpcError {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {}", other),
            data: None,
        }),
    }
}

#[macro_export]
macro_rules! with_metrics {
    ($metrics:expr, $type_:expr, $func:expr) => {
        async move {
            info!("Received {} request", $type_);
            $metrics
                .requests_received
                .with_label_values(&[$type_])
                .inc();
            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .inc();

            let result = $func.await;

            match &result {
                Ok(_) => {
                    info!("{} request succeeded", $type_);
                    $metrics.requests_ok.with_label_values(&[$type_]).inc();
                }
                Err(e) => {
                    info!("{} request failed: {:?}", $type_, e);
                    $metrics.err_requests.with_label_values(&[$type_]).inc();
                }
            }

            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .dec();
            result
        }
    };
}

#[cfg(test)]
mod tests {
    use super::mock_handler::{run_mock_server, ImaRequestMockHandler};
    use super::*;
    use ima_agent_config::local_ip_utils::get_available_port;
    use std::net::{IpAddr, Ipv4Addr};

    async fn rpc(address: SocketAddr, body: Value) -> JsonRpcResponse {
        reqwest::Client::new()
            .post(format!("http://{}/", address))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    fn start(handler: ImaRequestMockHandler) -> SocketAddr {
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let address = SocketAddr::new(host, get_available_port(&host));
        run_mock_server(address, handler);
        address
    }

    #[test]
    fn test_request_params_shapes() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct P {
            a: u64,
        }
        assert_eq!(request_params::<P>(json!({"a": 1})).unwrap(), P { a: 1 });
        assert_eq!(request_params::<P>(json!([{"a": 2}])).unwrap(), P { a: 2 });
        assert!(request_params::<P>(json!([{"a": 2}, {"a": 3}])).is_err());
        assert!(request_params::<P>(json!({"b": 1})).is_err());
        assert!(request_params::<NoParams>(Value::Null).is_ok());
        assert!(request_params::<NoParams>(json!([])).is_ok());
    }

    #[test]
    fn test_error_codes() {
        let client: JsonRpcError = ImaError::InvalidRequest("bad".into()).into();
        assert_eq!(client.code, INVALID_PARAMS);
        let server: JsonRpcError = ImaError::OracleTransport("down".into()).into();
        assert_eq!(server.code, SERVER_ERROR);
        assert_eq!(server.data, Some(json!({"type": "oracle_transport"})));
    }

    #[tokio::test]
    async fn test_json_rpc_round_trip() {
        let handler = ImaRequestMockHandler::default();
        handler.set_response(TXN_FIND_METHOD, Ok(json!({"success": true})));
        handler.set_response(
            BSU256_METHOD,
            Err(ImaError::OracleError("status 5".to_string())),
        );
        let address = start(handler.clone());

        let response = rpc(
            address,
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": TXN_FIND_METHOD,
                "params": [{"hash": format!("0x{:064x}", 1)}]
            }),
        )
        .await;
        assert_eq!(response.id, json!(7));
        assert_eq!(response.result, Some(json!({"success": true})));
        assert!(response.error.is_none());

        let response = rpc(
            address,
            json!({
                "jsonrpc": "2.0",
                "id": "a",
                "method": BSU256_METHOD,
                "params": {"valueToSign": "0x10"}
            }),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, SERVER_ERROR);
        assert_eq!(error.message, "signing oracle error: status 5");

        // hash is mandatory
        let response = rpc(
            address,
            json!({"jsonrpc": "2.0", "id": 1, "method": TXN_ERASE_METHOD, "params": {}}),
        )
        .await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);

        let response = rpc(
            address,
            json!({"jsonrpc": "2.0", "id": 1, "method": "skale_nope"}),
        )
        .await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

        assert_eq!(handler.calls(TXN_FIND_METHOD), 1);
        assert_eq!(handler.calls(BSU256_METHOD), 1);
        assert_eq!(handler.calls(TXN_ERASE_METHOD), 0);
    }

    #[tokio::test]
    async fn test_parse_error_and_ping() {
        let address = start(ImaRequestMockHandler::default());
        let response: JsonRpcResponse = reqwest::Client::new()
            .post(format!("http://{}/", address))
            .body("{not json")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);

        let ping: Value = reqwest::get(format!("http://{}{}", address, PING_PATH))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ping["version"], "testing");
    }
}
