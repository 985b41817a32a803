// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_client::{ChainRegistry, ImaEthClient};
use crate::metered_eth_provider::MeteredEthHttpProvider;
use crate::metrics::ImaMetrics;
use crate::pending_txns::{BroadcastSigner, NodeDirectory, PeerNode, PendingTxnsConfig};
use crate::signer::oracle::{SgxWalletClient, SgxWalletConfig, SigningOracle};
use crate::signer::ThresholdParams;
use crate::verifier::{LogSearchConfig, MessageProxyContracts, DEFAULT_SIDE_CHAIN_MESSAGE_PROXY};
use anyhow::anyhow;
use ethers::providers::Provider;
use ethers::types::Address as EthAddress;
use ima_agent_config::Config;
use ima_agent_keys::keypair_file::read_key;
use ima_agent_keys::public_key_from_hex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use url::Url;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeIdentityConfig {
    pub node_id: u64,
    // 1-based index of this node's key share
    pub signer_index: u64,
    // Name of the side-chain this node runs on
    pub chain_name: String,
    // Path of the broadcast key (secp256k1). Falls back to the wallet's ECDSA key when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_key_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerNodeConfig {
    pub node_id: u64,
    // JSON-RPC endpoint of the peer's agent
    pub url: String,
    // Hex encoded compressed secp256k1 key
    pub broadcast_public_key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainsConfig {
    pub local_rpc_url: String,
    pub main_net_rpc_url: String,
    #[serde(default)]
    pub side_chains: BTreeMap<String, String>,
}

fn default_side_chain_message_proxy() -> String {
    DEFAULT_SIDE_CHAIN_MESSAGE_PROXY.to_string()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContractsConfig {
    pub main_net_message_proxy: String,
    #[serde(default = "default_side_chain_message_proxy")]
    pub side_chain_message_proxy: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImaNodeConfig {
    // The port that the JSON-RPC server listens on.
    pub server_listen_port: u16,
    // The port for the metrics server.
    pub metrics_port: u16,
    pub node: NodeIdentityConfig,
    #[serde(default)]
    pub nodes: Vec<PeerNodeConfig>,
    pub chains: ChainsConfig,
    pub contracts: ContractsConfig,
    pub sgx_wallet: SgxWalletConfig,
    #[serde(default)]
    pub log_search: LogSearchConfig,
    #[serde(default)]
    pub pending_txns: PendingTxnsConfig,
}

impl Config for ImaNodeConfig {}

impl ImaNodeConfig {
    pub async fn validate(&self, metrics: Arc<ImaMetrics>) -> anyhow::Result<ImaServerConfig> {
        info!("Starting config validation");
        let threshold = self.threshold_params()?;
        self.log_search.validate()?;
        self.pending_txns.validate()?;
        if self.node.chain_name.is_empty() {
            return Err(anyhow!("node.chain-name must not be empty"));
        }

        let contracts = MessageProxyContracts {
            main_net: parse_address("contracts.main-net-message-proxy", &self.contracts.main_net_message_proxy)?,
            side_chain: parse_address(
                "contracts.side-chain-message-proxy",
                &self.contracts.side_chain_message_proxy,
            )?,
        };

        let nodes = Arc::new(self.node_directory()?);
        let oracle: Arc<dyn SigningOracle> = Arc::new(SgxWalletClient::new(&self.sgx_wallet)?);
        let broadcast_signer = self.broadcast_signer(&nodes, oracle.clone())?;
        let chains = Arc::new(self.chain_registry(metrics)?);

        info!(
            node_id = self.node.node_id,
            chain_name = self.node.chain_name.as_str(),
            peers = nodes.peers().count(),
            "Config validation complete"
        );
        Ok(ImaServerConfig {
            server_listen_port: self.server_listen_port,
            metrics_port: self.metrics_port,
            node_id: self.node.node_id,
            chain_name: self.node.chain_name.clone(),
            chains,
            contracts,
            oracle,
            threshold,
            broadcast_signer,
            nodes,
            log_search: self.log_search.clone(),
            pending_txns: self.pending_txns.clone(),
        })
    }

    fn threshold_params(&self) -> anyhow::Result<ThresholdParams> {
        let (n, t) = (self.sgx_wallet.n, self.sgx_wallet.t);
        if t < 1 || t > n {
            return Err(anyhow!(
                "sgx-wallet.t must be between 1 and n ({}), got {}",
                n,
                t
            ));
        }
        let signer_index = self.node.signer_index;
        if signer_index < 1 || signer_index > n {
            return Err(anyhow!(
                "node.signer-index must be between 1 and n ({}), got {}",
                n,
                signer_index
            ));
        }
        if self.sgx_wallet.key_share_name.is_empty() {
            return Err(anyhow!("sgx-wallet.key-share-name must not be empty"));
        }
        Ok(ThresholdParams {
            key_share_name: self.sgx_wallet.key_share_name.clone(),
            n,
            t,
            signer_index,
        })
    }

    fn node_directory(&self) -> anyhow::Result<NodeDirectory> {
        let mut seen = HashSet::new();
        let mut peers = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(node.node_id) {
                return Err(anyhow!("nodes: duplicate node-id {}", node.node_id));
            }
            let url = Url::parse(&node.url)
                .map_err(|e| anyhow!("nodes: invalid url {:?} for node {}: {}", node.url, node.node_id, e))?;
            let public_key = public_key_from_hex(&node.broadcast_public_key)
                .map_err(|e| anyhow!("nodes: node {}: {}", node.node_id, e))?;
            peers.push(PeerNode {
                node_id: node.node_id,
                url,
                public_key,
            });
        }
        Ok(NodeDirectory::new(self.node.node_id, peers))
    }

    fn broadcast_signer(
        &self,
        nodes: &NodeDirectory,
        oracle: Arc<dyn SigningOracle>,
    ) -> anyhow::Result<Option<BroadcastSigner>> {
        if !self.pending_txns.enabled || !self.pending_txns.broadcast {
            return Ok(None);
        }
        if nodes.get(self.node.node_id).is_none() {
            return Err(anyhow!(
                "broadcasting is enabled but node {} is not listed in nodes",
                self.node.node_id
            ));
        }
        if let Some(path) = &self.node.broadcast_key_path {
            let key = read_key(path)
                .map_err(|e| anyhow!("Failed to read broadcast key from {:?}: {}", path, e))?;
            info!("Loaded broadcast key from {:?}", path);
            return Ok(Some(BroadcastSigner::Local(Arc::new(key))));
        }
        match &self.sgx_wallet.ecdsa_key_name {
            Some(key_name) => Ok(Some(BroadcastSigner::Oracle {
                oracle,
                key_name: key_name.clone(),
            })),
            None => Err(anyhow!(
                "broadcasting requires node.broadcast-key-path or sgx-wallet.ecdsa-key-name"
            )),
        }
    }

    fn chain_registry(
        &self,
        metrics: Arc<ImaMetrics>,
    ) -> anyhow::Result<ChainRegistry<Provider<MeteredEthHttpProvider>>> {
        let local = Arc::new(ImaEthClient::new(
            &self.chains.local_rpc_url,
            &self.node.chain_name,
            metrics.clone(),
        )?);
        let main_net = Arc::new(ImaEthClient::new(
            &self.chains.main_net_rpc_url,
            "Mainnet",
            metrics.clone(),
        )?);
        let mut side_chains = HashMap::new();
        for (name, rpc_url) in &self.chains.side_chains {
            side_chains.insert(
                name.clone(),
                Arc::new(ImaEthClient::new(rpc_url, name, metrics.clone())?),
            );
        }
        Ok(ChainRegistry::new(
            &self.node.chain_name,
            local,
            main_net,
            side_chains,
        ))
    }
}

fn parse_address(field: &str, value: &str) -> anyhow::Result<EthAddress> {
    EthAddress::from_str(value).map_err(|e| anyhow!("{}: invalid address {:?}: {}", field, value, e))
}

pub struct ImaServerConfig {
    pub server_listen_port: u16,
    pub metrics_port: u16,
    pub node_id: u64,
    pub chain_name: String,
    pub chains: Arc<ChainRegistry<Provider<MeteredEthHttpProvider>>>,
    pub contracts: MessageProxyContracts,
    pub oracle: Arc<dyn SigningOracle>,
    pub threshold: ThresholdParams,
    pub broadcast_signer: Option<BroadcastSigner>,
    pub nodes: Arc<NodeDirectory>,
    pub log_search: LogSearchConfig,
    pub pending_txns: PendingTxnsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ima_agent_keys::keygen::generate_broadcast_key_and_write_to_file;

    const YAML: &str = r#"
server-listen-port: 1031
metrics-port: 9191
node:
  node-id: 1
  signer-index: 1
  chain-name: Bob
chains:
  local-rpc-url: http://127.0.0.1:15000
  main-net-rpc-url: http://127.0.0.1:8545
  side-chains:
    Alice: http://127.0.0.1:15100
contracts:
  main-net-message-proxy: "0x7777777777777777777777777777777777777777"
sgx-wallet:
  url: http://127.0.0.1:1028
  key-share-name: "BLS_KEY:SCHAIN_ID:1:NODE_ID:1:DKG_ID:0"
  n: 2
  t: 2
  ecdsa-key-name: "NEK:0001"
pending-txns:
  max-txns: 16
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        config: ImaNodeConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ima.yaml");
        std::fs::write(&path, YAML).unwrap();
        let mut config = ImaNodeConfig::load(&path).unwrap();
        for node_id in 1..=2 {
            let key_path = dir.path().join(format!("node{}.key", node_id));
            let public_hex = generate_broadcast_key_and_write_to_file(&key_path).unwrap();
            if node_id == 1 {
                config.node.broadcast_key_path = Some(key_path);
            }
            config.nodes.push(PeerNodeConfig {
                node_id,
                url: format!("http://127.0.0.1:{}", 1030 + node_id),
                broadcast_public_key: public_hex,
            });
        }
        Fixture { dir, config }
    }

    async fn validate(config: &ImaNodeConfig) -> anyhow::Result<ImaServerConfig> {
        config
            .validate(Arc::new(ImaMetrics::new_for_testing()))
            .await
    }

    #[tokio::test]
    async fn test_load_and_validate() {
        let fixture = fixture();
        let config = &fixture.config;
        assert_eq!(config.log_search, LogSearchConfig::default());
        assert_eq!(config.pending_txns.max_txns, 16);
        assert!(config.pending_txns.enabled);
        assert_eq!(
            config.contracts.side_chain_message_proxy,
            DEFAULT_SIDE_CHAIN_MESSAGE_PROXY
        );

        let server_config = validate(config).await.unwrap();
        assert_eq!(server_config.chain_name, "Bob");
        assert_eq!(server_config.threshold.signer_index, 1);
        assert_eq!(server_config.nodes.peers().count(), 1);
        assert!(matches!(
            server_config.broadcast_signer,
            Some(BroadcastSigner::Local(_))
        ));
        assert_eq!(server_config.chains.own_chain_name(), "Bob");
        assert_eq!(
            server_config.contracts.main_net,
            EthAddress::repeat_byte(0x77)
        );

        // JSON round trip through the same trait
        let json_path = fixture.dir.path().join("ima.json");
        config.save(&json_path).unwrap();
        let reloaded = ImaNodeConfig::load(&json_path).unwrap();
        assert_eq!(reloaded.nodes.len(), 2);
        assert_eq!(reloaded.node.broadcast_key_path, config.node.broadcast_key_path);
    }

    #[tokio::test]
    async fn test_oracle_broadcast_signer_fallback() {
        let fixture = fixture();
        let mut config = fixture.config.clone();
        config.node.broadcast_key_path = None;
        let server_config = validate(&config).await.unwrap();
        assert!(matches!(
            server_config.broadcast_signer,
            Some(BroadcastSigner::Oracle { ref key_name, .. }) if key_name == "NEK:0001"
        ));

        config.sgx_wallet.ecdsa_key_name = None;
        let err = validate(&config).await.err().unwrap();
        assert!(err.to_string().contains("broadcast-key-path"), "{}", err);

        config.pending_txns.broadcast = false;
        assert!(validate(&config).await.unwrap().broadcast_signer.is_none());
    }

    #[tokio::test]
    async fn test_threshold_bounds() {
        let fixture = fixture();
        let mut config = fixture.config.clone();
        config.sgx_wallet.t = 3;
        let err = validate(&config).await.err().unwrap();
        assert!(err.to_string().contains("sgx-wallet.t"), "{}", err);

        config.sgx_wallet.t = 0;
        assert!(validate(&config).await.is_err());

        config.sgx_wallet.t = 1;
        config.node.signer_index = 3;
        let err = validate(&config).await.err().unwrap();
        assert!(err.to_string().contains("node.signer-index"), "{}", err);

        config.node.signer_index = 0;
        assert!(validate(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_bad_peers_and_transport() {
        let fixture = fixture();
        let mut config = fixture.config.clone();
        config.nodes.retain(|node| node.node_id != 1);
        let err = validate(&config).await.err().unwrap();
        assert!(err.to_string().contains("not listed in nodes"), "{}", err);

        let mut config = fixture.config.clone();
        config.nodes[1].broadcast_public_key = "0x1234".to_string();
        assert!(validate(&config).await.is_err());

        let mut config = fixture.config.clone();
        config.nodes[1].node_id = 1;
        let err = validate(&config).await.err().unwrap();
        assert!(err.to_string().contains("duplicate node-id"), "{}", err);

        let mut config = fixture.config.clone();
        config.sgx_wallet.url = "zmq://127.0.0.1:1031".to_string();
        let err = validate(&config).await.err().unwrap();
        assert!(err.to_string().contains("zmq"), "{}", err);

        let mut config = fixture.config.clone();
        config.contracts.main_net_message_proxy = "0xnope".to_string();
        assert!(validate(&config).await.is_err());
    }
}
