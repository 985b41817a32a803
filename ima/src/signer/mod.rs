// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Builds the canonical bytes of a verified batch and asks the key-share
//! oracle for this node's BLS signature share.

use crate::error::{ImaError, ImaResult};
use crate::metrics::ImaMetrics;
use crate::types::ImaMessageInput;
use crate::verifier::VerifiedMessage;
use ethers::types::{H256, U256};
use ethers::utils::keccak256;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub mod oracle;

pub use oracle::{BlsSignRequest, SgxWalletClient, SgxWalletConfig, SigningOracle};

/// Sender word, destination word, then the raw data of every message in order.
/// Addresses are right-aligned in their 32 byte word.
pub fn canonical_sign_buffer<'a>(messages: impl IntoIterator<Item = &'a ImaMessageInput>) -> Vec<u8> {
    let mut buffer = Vec::new();
    for message in messages {
        buffer.extend_from_slice(H256::from(message.sender).as_bytes());
        buffer.extend_from_slice(H256::from(message.destination_contract).as_bytes());
        buffer.extend_from_slice(&message.data);
    }
    buffer
}

pub fn batch_hash<'a>(messages: impl IntoIterator<Item = &'a ImaMessageInput>) -> H256 {
    H256::from(keccak256(canonical_sign_buffer(messages)))
}

pub fn u256_hash(value: U256) -> H256 {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    H256::from(keccak256(word))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdParams {
    pub key_share_name: String,
    pub n: u64,
    pub t: u64,
    /// 1-based
    pub signer_index: u64,
}

pub struct ThresholdSigner {
    oracle: Arc<dyn SigningOracle>,
    params: ThresholdParams,
    metrics: Arc<ImaMetrics>,
}

impl ThresholdSigner {
    pub fn new(
        oracle: Arc<dyn SigningOracle>,
        params: ThresholdParams,
        metrics: Arc<ImaMetrics>,
    ) -> Self {
        Self {
            oracle,
            params,
            metrics,
        }
    }

    pub fn params(&self) -> &ThresholdParams {
        &self.params
    }

    pub fn oracle(&self) -> &Arc<dyn SigningOracle> {
        &self.oracle
    }

    /// Signs a verified batch. Returns the oracle's result object.
    pub async fn sign_messages(&self, messages: &[VerifiedMessage]) -> ImaResult<Value> {
        if messages.is_empty() {
            return Err(ImaError::InvalidRequest(
                "nothing to sign in an empty batch".to_string(),
            ));
        }
        let hash = batch_hash(messages.iter().map(|m| &m.input));
        info!(
            first_message_index = messages[0].message_index,
            count = messages.len(),
            message_hash = ?hash,
            "Requesting BLS signature share for IMA messages"
        );
        self.sign_hash("messages", hash).await
    }

    /// Signs an arbitrary 256-bit protocol value.
    pub async fn sign_u256(&self, value: U256, reason: Option<&str>) -> ImaResult<Value> {
        let hash = u256_hash(value);
        info!(
            reason = reason.unwrap_or(""),
            value = %value,
            message_hash = ?hash,
            "Requesting BLS signature share for u256 value"
        );
        self.sign_hash("u256", hash).await
    }

    async fn sign_hash(&self, kind: &str, hash: H256) -> ImaResult<Value> {
        let request = BlsSignRequest {
            key_share_name: self.params.key_share_name.clone(),
            message_hash: hex::encode(hash.as_bytes()),
            n: self.params.n,
            t: self.params.t,
            signer_index: self.params.signer_index,
        };
        let result = {
            let _timer = self
                .metrics
                .sign_latency
                .with_label_values(&[kind])
                .start_timer();
            self.oracle.bls_sign_message_hash(&request).await
        };
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.metrics
            .sign_requests
            .with_label_values(&[kind, outcome])
            .inc();
        result
    }
}


#[cfg(test)]
mod tests {
    use super::mock_oracle::MockSigningOracle;
    use super::*;
    use crate::message::ImaMessage;
    use ethers::types::{Address, Bytes};
    use hex_literal::hex;

    fn params() -> ThresholdParams {
        ThresholdParams {
            key_share_name: "BLS_KEY:SCHAIN_ID:1:NODE_ID:2:DKG_ID:0".to_string(),
            n: 4,
            t: 3,
            signer_index: 2,
        }
    }

    fn verified(data: &[u8]) -> VerifiedMessage {
        let input = ImaMessageInput {
            sender: Address::from(hex!("52d8b8a2c6f05a0c3b6c3d1f61e66a0f0bd8a4a9")),
            destination_contract: Address::from(hex!("8d4f6d2a1a3a36b3a0a7c8f3c1a1dc2d5b3f7e11")),
            data: Bytes::from(data.to_vec()),
        };
        VerifiedMessage {
            message_index: 0,
            message: ImaMessage::decode(data).unwrap(),
            input,
            tx_hash: H256::zero(),
        }
    }

    fn interchain_connection() -> Vec<u8> {
        let mut data = vec![0u8; 64];
        data[31] = 8;
        data[63] = 1;
        data
    }

    #[test]
    fn test_canonical_buffer_layout() {
        let message = verified(&interchain_connection());
        let buffer = canonical_sign_buffer([&message.input, &message.input]);
        assert_eq!(buffer.len(), 2 * (64 + 64));
        assert_eq!(&buffer[..12], &[0u8; 12]);
        assert_eq!(&buffer[12..32], message.input.sender.as_bytes());
        assert_eq!(&buffer[44..64], message.input.destination_contract.as_bytes());
        assert_eq!(&buffer[64..128], &interchain_connection()[..]);
        assert_eq!(&buffer[128..160], &buffer[..32]);
    }

    #[tokio::test]
    async fn test_sign_messages_request() {
        let oracle = Arc::new(MockSigningOracle::default());
        let signer = ThresholdSigner::new(
            oracle.clone(),
            params(),
            Arc::new(ImaMetrics::new_for_testing()),
        );
        let message = verified(&interchain_connection());
        let result = signer.sign_messages(&[message.clone()]).await.unwrap();
        assert!(result["signatureShare"].as_str().unwrap().ends_with(":0:2"));

        let requests = oracle.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].key_share_name, params().key_share_name);
        assert_eq!((requests[0].n, requests[0].t), (4, 3));
        assert_eq!(
            requests[0].message_hash,
            hex::encode(keccak256(canonical_sign_buffer([&message.input])))
        );
    }

    #[tokio::test]
    async fn test_sign_u256_and_failures() {
        let oracle = Arc::new(MockSigningOracle::default());
        let metrics = Arc::new(ImaMetrics::new_for_testing());
        let signer = ThresholdSigner::new(oracle.clone(), params(), metrics.clone());
        signer.sign_u256(U256::from(7), Some("test")).await.unwrap();
        assert_eq!(
            oracle.requests.lock().unwrap()[0].message_hash,
            hex::encode(u256_hash(U256::from(7)).as_bytes())
        );

        oracle.fail_with(ImaError::OracleError("empty result".to_string()));
        let err = signer.sign_u256(U256::from(7), None).await.unwrap_err();
        assert_eq!(err.error_type(), "oracle_error");
        assert_eq!(
            metrics
                .sign_requests
                .with_label_values(&["u256", "error"])
                .get(),
            1
        );

        assert_eq!(
            signer.sign_messages(&[]).await.unwrap_err().error_type(),
            "invalid_request"
        );
    }
}
