// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC client for the SGX wallet that holds this node's key share.

use crate::error::{ImaError, ImaResult};
use async_trait::async_trait;
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tap::TapFallible;
use url::Url;

const ORACLE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SgxWalletConfig {
    pub url: String,
    pub key_share_name: String,
    pub n: u64,
    pub t: u64,
    /// Key used for broadcast signatures when no local broadcast key is configured
    #[serde(default)]
    pub ecdsa_key_name: Option<String>,
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

/// Parameters of a `blsSignMessageHash` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlsSignRequest {
    pub key_share_name: String,
    /// Lowercase hex without 0x
    pub message_hash: String,
    pub n: u64,
    pub t: u64,
    pub signer_index: u64,
}

#[async_trait]
pub trait SigningOracle: Send + Sync {
    /// Returns the oracle's `result` object untouched.
    async fn bls_sign_message_hash(&self, request: &BlsSignRequest) -> ImaResult<Value>;

    /// Returns the 65 byte `r || s || v` signature with `v` in {0, 1}.
    async fn ecdsa_sign_message_hash(&self, key_name: &str, hash: &H256) -> ImaResult<[u8; 65]>;
}

/// Extracts `result` from an oracle response, rejecting errors and empty answers.
pub fn oracle_result(method: &str, response: Value) -> ImaResult<Value> {
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        return Err(ImaError::OracleError(format!("{} failed: {}", method, error)));
    }
    let result = match response.get("result") {
        None | Some(Value::Null) => {
            return Err(ImaError::OracleError(format!(
                "{} returned an empty result",
                method
            )))
        }
        Some(Value::Object(map)) if map.is_empty() => {
            return Err(ImaError::OracleError(format!(
                "{} returned an empty result",
                method
            )))
        }
        Some(result) => result.clone(),
    };
    if let Some(status) = result.get("status") {
        if status.as_i64() != Some(0) {
            let message = result
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            return Err(ImaError::OracleError(format!(
                "{} returned status {}: {}",
                method, status, message
            )));
        }
    }
    Ok(result)
}

fn hex_field(result: &Value, name: &str) -> ImaResult<Vec<u8>> {
    let text = result
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ImaError::OracleError(format!("ECDSA signature has no {}", name)))?;
    let text = text.trim_start_matches("0x");
    hex::decode(text)
        .map_err(|e| ImaError::OracleError(format!("ECDSA signature {} is not hex: {}", name, e)))
}

/// Turns an `ecdsaSignMessageHash` result into `r || s || v`.
pub fn parse_ecdsa_result(result: &Value) -> ImaResult<[u8; 65]> {
    let r = hex_field(result, "signature_r")?;
    let s = hex_field(result, "signature_s")?;
    if r.len() > 32 || s.len() > 32 {
        return Err(ImaError::OracleError(
            "ECDSA signature component longer than 32 bytes".to_string(),
        ));
    }
    let v = match result.get("signature_v") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ImaError::OracleError("ECDSA signature has no signature_v".to_string()))?;
    let recovery_id = match v {
        0 | 1 => v as u8,
        27 | 28 => (v - 27) as u8,
        other => {
            return Err(ImaError::OracleError(format!(
                "ECDSA signature_v {} out of range",
                other
            )))
        }
    };
    let mut signature = [0u8; 65];
    signature[32 - r.len()..32].copy_from_slice(&r);
    signature[64 - s.len()..64].copy_from_slice(&s);
    signature[64] = recovery_id;
    Ok(signature)
}

pub struct SgxWalletClient {
    http_client: reqwest::Client,
    url: Url,
    request_id: AtomicU64,
}

impl SgxWalletClient {
    pub fn new(config: &SgxWalletConfig) -> anyhow::Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| anyhow::anyhow!("invalid sgx-wallet url {:?}: {}", config.url, e))?;
        match url.scheme() {
            "http" | "https" => {}
            "zmq" => anyhow::bail!(
                "sgx-wallet url {}: zmq transport is not supported, use http or https",
                config.url
            ),
            other => anyhow::bail!("sgx-wallet url {}: unsupported scheme {}", config.url, other),
        }

        let mut builder = reqwest::Client::builder().timeout(ORACLE_REQUEST_TIMEOUT);
        match (&config.client_cert_path, &config.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let mut pem = std::fs::read(cert_path).map_err(|e| {
                    anyhow::anyhow!("cannot read client cert {}: {}", cert_path.display(), e)
                })?;
                pem.push(b'\n');
                pem.extend(std::fs::read(key_path).map_err(|e| {
                    anyhow::anyhow!("cannot read client key {}: {}", key_path.display(), e)
                })?);
                builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
            }
            (None, None) => {}
            _ => anyhow::bail!("client-cert-path and client-key-path must be set together"),
        }
        if let Some(ca_path) = &config.ca_cert_path {
            let pem = std::fs::read(ca_path)
                .map_err(|e| anyhow::anyhow!("cannot read CA cert {}: {}", ca_path.display(), e))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(Self {
            http_client: builder.build()?,
            url,
            request_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> ImaResult<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.request_id.fetch_add(1, Ordering::SeqCst),
            "method": method,
            "params": params,
        });
        let response = self
            .http_client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| ImaError::OracleTransport(format!("{} to {}: {}", method, self.url, e)))
            .tap_err(|e| tracing::error!("{}", e))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ImaError::OracleTransport(format!("{} response: {}", method, e)))?;
        oracle_result(method, body).tap_err(|e| tracing::error!("{}", e))
    }
}

#[async_trait]
impl SigningOracle for SgxWalletClient {
    async fn bls_sign_message_hash(&self, request: &BlsSignRequest) -> ImaResult<Value> {
        let params = serde_json::to_value(request)
            .map_err(|e| ImaError::Internal(format!("cannot encode sign request: {}", e)))?;
        self.call("blsSignMessageHash", params).await
    }

    async fn ecdsa_sign_message_hash(&self, key_name: &str, hash: &H256) -> ImaResult<[u8; 65]> {
        let result = self
            .call(
                "ecdsaSignMessageHash",
                json!({
                    "keyName": key_name,
                    "messageHash": hex::encode(hash.as_bytes()),
                    "base": 16,
                }),
            )
            .await?;
        parse_ecdsa_result(&result)
    }
}
