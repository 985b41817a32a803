// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Signed gossip of tracker insert/erase events between nodes.

use super::types::TrackedTxnEntry;
use crate::error::{ImaError, ImaResult};
use crate::metrics::ImaMetrics;
use crate::retry_with_max_elapsed_time;
use crate::signer::SigningOracle;
use crate::types::{format_txn_hash, BroadcastTxnRequest};
use async_trait::async_trait;
use ethers::types::{H256, U256};
use ethers::utils::keccak256;
use fastcrypto::hash::Keccak256;
use fastcrypto::secp256k1::recoverable::Secp256k1RecoverableSignature;
use fastcrypto::traits::{RecoverableSigner, ToFromBytes, VerifyRecoverable};
use ima_agent_keys::{BroadcastKeyPair, BroadcastPublicKey};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const BROADCAST_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BroadcastAction {
    Insert,
    Erase,
}

impl BroadcastAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastAction::Insert => "insert",
            BroadcastAction::Erase => "erase",
        }
    }

    pub fn rpc_method(&self) -> &'static str {
        match self {
            BroadcastAction::Insert => "skale_imaBroadcastTxnInsert",
            BroadcastAction::Erase => "skale_imaBroadcastTxnErase",
        }
    }
}

impl Display for BroadcastAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The text every node signs: `"<action>:<0x-prefixed 64 digit hash>"`.
pub fn broadcast_message(action: BroadcastAction, hash: &U256) -> String {
    format!("{}:{}", action, format_txn_hash(hash))
}

pub fn broadcast_txn_sign(key: &BroadcastKeyPair, action: BroadcastAction, hash: &U256) -> String {
    let message = broadcast_message(action, hash);
    let signature = key.sign_recoverable_with_hash::<Keccak256>(message.as_bytes());
    hex::encode(signature.as_bytes())
}

#[derive(Clone, Debug)]
pub struct PeerNode {
    pub node_id: u64,
    pub url: Url,
    pub public_key: BroadcastPublicKey,
}

/// Every node of the chain, keyed by id, including this one.
#[derive(Clone, Debug)]
pub struct NodeDirectory {
    own_node_id: u64,
    nodes: BTreeMap<u64, PeerNode>,
}

impl NodeDirectory {
    pub fn new(own_node_id: u64, nodes: impl IntoIterator<Item = PeerNode>) -> Self {
        Self {
            own_node_id,
            nodes: nodes.into_iter().map(|n| (n.node_id, n)).collect(),
        }
    }

    pub fn own_node_id(&self) -> u64 {
        self.own_node_id
    }

    pub fn get(&self, node_id: u64) -> Option<&PeerNode> {
        self.nodes.get(&node_id)
    }

    /// Every node except this one.
    pub fn peers(&self) -> impl Iterator<Item = &PeerNode> {
        let own = self.own_node_id;
        self.nodes.values().filter(move |n| n.node_id != own)
    }
}

pub fn verify_broadcast_signature(
    nodes: &NodeDirectory,
    from_node: u64,
    action: BroadcastAction,
    hash: &U256,
    signature_hex: &str,
) -> ImaResult<()> {
    let node = nodes.get(from_node).ok_or(ImaError::UnknownNode(from_node))?;
    let invalid = || ImaError::BroadcastSignatureInvalid {
        node_id: from_node,
        action: action.to_string(),
        hash: format_txn_hash(hash),
    };
    let bytes = hex::decode(signature_hex.trim_start_matches("0x")).map_err(|_| invalid())?;
    let signature = Secp256k1RecoverableSignature::from_bytes(&bytes).map_err(|_| invalid())?;
    let message = broadcast_message(action, hash);
    node.public_key
        .verify_recoverable_with_hash::<Keccak256>(message.as_bytes(), &signature)
        .map_err(|_| invalid())
}

pub fn broadcast_txn_verify_signature(
    nodes: &NodeDirectory,
    from_node: u64,
    action: BroadcastAction,
    hash: &U256,
    signature_hex: &str,
) -> bool {
    verify_broadcast_signature(nodes, from_node, action, hash, signature_hex).is_ok()
}

/// Produces this node's broadcast signatures.
pub enum BroadcastSigner {
    Local(Arc<BroadcastKeyPair>),
    /// ECDSA key held by the wallet, which signs the keccak256 digest as is
    Oracle {
        oracle: Arc<dyn SigningOracle>,
        key_name: String,
    },
}

impl BroadcastSigner {
    pub async fn sign(&self, action: BroadcastAction, hash: &U256) -> ImaResult<String> {
        match self {
            BroadcastSigner::Local(key) => Ok(broadcast_txn_sign(key, action, hash)),
            BroadcastSigner::Oracle { oracle, key_name } => {
                let digest = H256::from(keccak256(broadcast_message(action, hash).as_bytes()));
                let signature = oracle.ecdsa_sign_message_hash(key_name, &digest).await?;
                Ok(hex::encode(signature))
            }
        }
    }
}

#[async_trait]
pub trait TxnBroadcastSink: Send + Sync {
    async fn send(
        &self,
        peer: &PeerNode,
        action: BroadcastAction,
        request: &BroadcastTxnRequest,
    ) -> ImaResult<()>;
}

/// Posts broadcasts to peers' JSON-RPC endpoints, retrying until `max_elapsed_time`.
pub struct HttpBroadcastSink {
    http_client: reqwest::Client,
    request_id: AtomicU64,
    max_elapsed_time: Duration,
}

impl HttpBroadcastSink {
    pub fn new(max_elapsed_time: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http_client: reqwest::Client::builder()
                .timeout(BROADCAST_REQUEST_TIMEOUT)
                .build()?,
            request_id: AtomicU64::new(1),
            max_elapsed_time,
        })
    }

    async fn send_once(
        &self,
        peer: &PeerNode,
        action: BroadcastAction,
        request: &BroadcastTxnRequest,
    ) -> anyhow::Result<()> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.request_id.fetch_add(1, Ordering::SeqCst),
            "method": action.rpc_method(),
            "params": request,
        });
        let response: Value = self
            .http_client
            .post(peer.url.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            anyhow::bail!("node {} answered {}", peer.node_id, error);
        }
        Ok(())
    }
}

#[async_trait]
impl TxnBroadcastSink for HttpBroadcastSink {
    async fn send(
        &self,
        peer: &PeerNode,
        action: BroadcastAction,
        request: &BroadcastTxnRequest,
    ) -> ImaResult<()> {
        retry_with_max_elapsed_time!(
            self.send_once(peer, action, request),
            self.max_elapsed_time,
            peer.url
        )
        .map_err(|e| {
            ImaError::Internal(format!(
                "{} broadcast to node {} at {} failed: {:#}",
                action, peer.node_id, peer.url, e
            ))
        })
    }
}

pub struct TxnBroadcaster {
    signer: BroadcastSigner,
    nodes: Arc<NodeDirectory>,
    sink: Arc<dyn TxnBroadcastSink>,
    metrics: Arc<ImaMetrics>,
}

impl TxnBroadcaster {
    pub fn new(
        signer: BroadcastSigner,
        nodes: Arc<NodeDirectory>,
        sink: Arc<dyn TxnBroadcastSink>,
        metrics: Arc<ImaMetrics>,
    ) -> Self {
        Self {
            signer,
            nodes,
            sink,
            metrics,
        }
    }

    pub fn nodes(&self) -> &Arc<NodeDirectory> {
        &self.nodes
    }

    /// Signs once and sends to every peer. Failures are logged and counted.
    /// Returns the number of peers that accepted the broadcast.
    pub async fn broadcast(&self, action: BroadcastAction, entry: &TrackedTxnEntry) -> usize {
        let label = [action.as_str()];
        let signature = match self.signer.sign(action, &entry.hash).await {
            Ok(signature) => signature,
            Err(e) => {
                warn!(tx_hash = entry.hash_hex().as_str(), "Cannot sign {} broadcast: {}", action, e);
                self.metrics.broadcasts_failed.with_label_values(&label).inc();
                return 0;
            }
        };
        let request = BroadcastTxnRequest {
            hash: entry.hash,
            timestamp: entry.timestamp,
            broadcast_signature: signature,
            broadcast_from_node: self.nodes.own_node_id(),
        };
        let results = futures::future::join_all(
            self.nodes
                .peers()
                .map(|peer| self.sink.send(peer, action, &request)),
        )
        .await;
        let mut sent = 0;
        for result in results {
            match result {
                Ok(()) => {
                    sent += 1;
                    self.metrics.broadcasts_sent.with_label_values(&label).inc();
                }
                Err(e) => {
                    warn!(tx_hash = entry.hash_hex().as_str(), "{}", e);
                    self.metrics.broadcasts_failed.with_label_values(&label).inc();
                }
            }
        }
        debug!(
            tx_hash = entry.hash_hex().as_str(),
            sent, "Broadcast {} done", action
        );
        sent
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use crate::signer::mock_oracle::MockSigningOracle;
    use axum::routing::post;
    use axum::{Json, Router};
    use ethers::core::k256::ecdsa::SigningKey;
    use fastcrypto::traits::KeyPair;
    use ima_agent_config::local_ip_utils::{get_available_port, localhost_for_testing};
    use std::net::SocketAddr;
    use std::sync::Mutex;

    #[test]
    fn test_broadcast_message_format() {
        assert_eq!(
            broadcast_message(BroadcastAction::Insert, &U256::from(0xab)),
            format!("insert:0x{:064x}", 0xab)
        );
        assert_eq!(
            BroadcastAction::Erase.rpc_method(),
            "skale_imaBroadcastTxnErase"
        );
    }

    #[test]
    fn test_signature_round_trip() {
        let (nodes, keys) = directory(1, 3);
        let hash = U256::from(0x1234_5678u64);
        let signature = broadcast_txn_sign(&keys[1], BroadcastAction::Insert, &hash);
        assert_eq!(signature.len(), 130);
        assert!(broadcast_txn_verify_signature(
            &nodes,
            2,
            BroadcastAction::Insert,
            &hash,
            &signature
        ));
        assert!(broadcast_txn_verify_signature(
            &nodes,
            2,
            BroadcastAction::Insert,
            &hash,
            &format!("0x{}", signature)
        ));

        // wrong node, action or hash
        assert!(!broadcast_txn_verify_signature(&nodes, 3, BroadcastAction::Insert, &hash, &signature));
        assert!(!broadcast_txn_verify_signature(&nodes, 2, BroadcastAction::Erase, &hash, &signature));
        assert!(!broadcast_txn_verify_signature(
            &nodes,
            2,
            BroadcastAction::Insert,
            &(hash + 1),
            &signature
        ));
        assert_eq!(
            verify_broadcast_signature(&nodes, 9, BroadcastAction::Insert, &hash, &signature),
            Err(ImaError::UnknownNode(9))
        );
        assert!(!broadcast_txn_verify_signature(&nodes, 2, BroadcastAction::Insert, &hash, "zz"));
    }

    #[test]
    fn test_any_bit_flip_fails_verification() {
        let (nodes, keys) = directory(1, 2);
        let hash = U256::from(42);
        let signature = hex::decode(broadcast_txn_sign(&keys[0], BroadcastAction::Erase, &hash)).unwrap();
        for byte in 0..signature.len() {
            for bit in 0..8 {
                let mut mutated = signature.clone();
                mutated[byte] ^= 1 << bit;
                assert!(
                    !broadcast_txn_verify_signature(
                        &nodes,
                        1,
                        BroadcastAction::Erase,
                        &hash,
                        &hex::encode(&mutated)
                    ),
                    "flip of bit {} in byte {} verified",
                    bit,
                    byte
                );
            }
        }
    }

    #[tokio::test]
    async fn test_oracle_signer_matches_local_verification() {
        let key = keypair_from_secret(&TEST_SECRET);
        let nodes = NodeDirectory::new(
            4,
            vec![PeerNode {
                node_id: 4,
                url: Url::parse("http://127.0.0.1:1").unwrap(),
                public_key: key.public().clone(),
            }],
        );
        let oracle = Arc::new(MockSigningOracle::with_ecdsa_key(
            SigningKey::from_slice(&TEST_SECRET).unwrap(),
        ));
        let signer = BroadcastSigner::Oracle {
            oracle,
            key_name: "NEK:abc".to_string(),
        };
        let hash = U256::from(77);
        let signature = signer.sign(BroadcastAction::Insert, &hash).await.unwrap();
        verify_broadcast_signature(&nodes, 4, BroadcastAction::Insert, &hash, &signature).unwrap();

        let local = BroadcastSigner::Local(Arc::new(key));
        let signature = local.sign(BroadcastAction::Insert, &hash).await.unwrap();
        verify_broadcast_signature(&nodes, 4, BroadcastAction::Insert, &hash, &signature).unwrap();
    }

    #[tokio::test]
    async fn test_broadcaster_skips_self_and_counts_failures() {
        let (nodes, keys) = directory(2, 4);
        let sink = Arc::new(RecordingSink::default());
        sink.failing_nodes.lock().unwrap().push(4);
        let metrics = Arc::new(ImaMetrics::new_for_testing());
        let broadcaster = TxnBroadcaster::new(
            BroadcastSigner::Local(keys[1].clone()),
            Arc::new(nodes),
            sink.clone(),
            metrics.clone(),
        );
        let entry = TrackedTxnEntry::new(U256::from(5), 1_700_000_000).unwrap();
        assert_eq!(broadcaster.broadcast(BroadcastAction::Insert, &entry).await, 2);

        let sent = sink.sent();
        let targets: Vec<_> = sent.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(targets, vec![1, 3]);
        let request = &sent[0].2;
        assert_eq!(request.broadcast_from_node, 2);
        assert_eq!(request.timestamp, 1_700_000_000);
        assert!(broadcast_txn_verify_signature(
            broadcaster.nodes(),
            2,
            BroadcastAction::Insert,
            &request.hash,
            &request.broadcast_signature
        ));
        assert_eq!(
            metrics
                .broadcasts_failed
                .with_label_values(&["insert"])
                .get(),
            1
        );
        assert_eq!(metrics.broadcasts_sent.with_label_values(&["insert"]).get(), 2);
    }

    #[tokio::test]
    async fn test_http_sink_posts_json_rpc() {
        let received = Arc::new(Mutex::new(Vec::<Value>::new()));
        let received_clone = received.clone();
        let app = Router::new().route(
            "/",
            post(move |Json(request): Json<Value>| {
                let received = received_clone.clone();
                async move {
                    received.lock().unwrap().push(request.clone());
                    Json(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"success": true}}))
                }
            }),
        );
        let host = localhost_for_testing();
        let port = get_available_port(&host);
        let listener = tokio::net::TcpListener::bind(SocketAddr::new(host, port))
            .await
            .unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let key = random_keypair();
        let peer = PeerNode {
            node_id: 3,
            url: Url::parse(&format!("http://{}:{}", host, port)).unwrap(),
            public_key: key.public().clone(),
        };
        let request = BroadcastTxnRequest {
            hash: U256::from(0xabc),
            timestamp: 10,
            broadcast_signature: broadcast_txn_sign(&key, BroadcastAction::Erase, &U256::from(0xabc)),
            broadcast_from_node: 1,
        };
        let sink = HttpBroadcastSink::new(Duration::from_secs(5)).unwrap();
        sink.send(&peer, BroadcastAction::Erase, &request).await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received[0]["method"], "skale_imaBroadcastTxnErase");
        let params: BroadcastTxnRequest =
            serde_json::from_value(received[0]["params"].clone()).unwrap();
        assert_eq!(params, request);
    }

    #[tokio::test]
    async fn test_http_sink_retries_until_peer_accepts() {
        crate::test_utils::init_for_testing();
        let attempts = Arc::new(AtomicU64::new(0));
        let attempts_clone = attempts.clone();
        let app = Router::new().route(
            "/",
            post(move |Json(request): Json<Value>| {
                let attempts = attempts_clone.clone();
                async move {
                    // the first two attempts are refused by the peer
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Json(json!({
                            "jsonrpc": "2.0",
                            "id": request["id"],
                            "error": {"code": -32000, "message": "busy"}
                        }))
                    } else {
                        Json(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"success": true}}))
                    }
                }
            }),
        );
        let host = localhost_for_testing();
        let port = get_available_port(&host);
        let listener = tokio::net::TcpListener::bind(SocketAddr::new(host, port))
            .await
            .unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let key = random_keypair();
        let peer = PeerNode {
            node_id: 4,
            url: Url::parse(&format!("http://{}:{}", host, port)).unwrap(),
            public_key: key.public().clone(),
        };
        let request = BroadcastTxnRequest {
            hash: U256::from(0xdef),
            timestamp: 10,
            broadcast_signature: broadcast_txn_sign(&key, BroadcastAction::Insert, &U256::from(0xdef)),
            broadcast_from_node: 1,
        };
        let sink = HttpBroadcastSink::new(Duration::from_secs(30)).unwrap();
        sink.send(&peer, BroadcastAction::Insert, &request)
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_http_sink_gives_up() {
        let host = localhost_for_testing();
        let port = get_available_port(&host);
        let peer = PeerNode {
            node_id: 3,
            url: Url::parse(&format!("http://{}:{}", host, port)).unwrap(),
            public_key: random_keypair().public().clone(),
        };
        let request = BroadcastTxnRequest {
            hash: U256::from(1),
            timestamp: 10,
            broadcast_signature: "00".to_string(),
            broadcast_from_node: 1,
        };
        let sink = HttpBroadcastSink::new(Duration::from_millis(500)).unwrap();
        let err = sink
            .send(&peer, BroadcastAction::Insert, &request)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("node 3"), "{}", err);
    }
}
