// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ImaError, ImaResult};
use crate::metered_eth_provider::{new_metered_eth_provider, MeteredEthHttpProvider};
use crate::metrics::ImaMetrics;
use crate::types::Direction;
use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, Middleware, Provider, ProviderError};
use ethers::types::{Filter, Log, Transaction, TransactionReceipt, TxHash, H256};
use std::collections::HashMap;
use std::sync::Arc;
use tap::TapFallible;

pub type ImaEthClient = ImaChainClient<Provider<MeteredEthHttpProvider>>;

// Abstracts over a real JSON-RPC provider and the in-memory mock used by tests.
#[async_trait]
pub trait ImaChainClientInner: Send + Sync {
    type Error: Into<anyhow::Error> + Send + Sync + std::error::Error + 'static;

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, Self::Error>;

    async fn get_transaction_by_hash(
        &self,
        hash: TxHash,
    ) -> Result<Option<Transaction>, Self::Error>;

    async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, Self::Error>;

    async fn block_number(&self) -> Result<u64, Self::Error>;

    async fn is_known_transaction(&self, hash: TxHash) -> Result<bool, Self::Error> {
        Ok(self.get_transaction_by_hash(hash).await?.is_some())
    }
}

#[async_trait]
impl<P> ImaChainClientInner for Provider<P>
where
    P: JsonRpcClient + 'static,
{
    type Error = ProviderError;

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, Self::Error> {
        Middleware::get_logs(self, filter).await
    }

    async fn get_transaction_by_hash(
        &self,
        hash: TxHash,
    ) -> Result<Option<Transaction>, Self::Error> {
        Middleware::get_transaction(self, hash).await
    }

    async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, Self::Error> {
        Middleware::get_transaction_receipt(self, hash).await
    }

    async fn block_number(&self) -> Result<u64, Self::Error> {
        Ok(Middleware::get_block_number(self).await?.as_u64())
    }
}

/// A chain endpoint labelled with the chain's name.
pub struct ImaChainClient<C> {
    inner: C,
    chain_name: String,
}

impl ImaEthClient {
    pub fn new(rpc_url: &str, chain_name: &str, metrics: Arc<ImaMetrics>) -> anyhow::Result<Self> {
        let provider = new_metered_eth_provider(rpc_url, chain_name, metrics)
            .map_err(|e| anyhow::anyhow!("invalid rpc url {:?} for chain {}: {}", rpc_url, chain_name, e))?;
        Ok(Self::new_with_inner(provider, chain_name))
    }
}

impl<C> ImaChainClient<C>
where
    C: ImaChainClientInner,
{
    pub fn new_with_inner(inner: C, chain_name: &str) -> Self {
        Self {
            inner,
            chain_name: chain_name.to_string(),
        }
    }

    pub fn chain_name(&self) -> &str {
        &self.chain_name
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn rpc_error(&self, call: &str, e: C::Error) -> ImaError {
        let e: anyhow::Error = e.into();
        ImaError::ChainRpcError(format!("{} {} failed: {:#}", self.chain_name, call, e))
    }

    /// Logs matching `[topic0, topic1, topic2]` in the inclusive block range.
    pub async fn get_logs_in_range(
        &self,
        topics: &[H256; 3],
        from_block: u64,
        to_block: u64,
    ) -> ImaResult<Vec<Log>> {
        let filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .topic0(topics[0])
            .topic1(topics[1])
            .topic2(topics[2]);
        self.inner
            .get_logs(&filter)
            .await
            .map_err(|e| self.rpc_error("eth_getLogs", e))
            .tap_err(|e| tracing::warn!(from_block, to_block, "{}", e))
    }

    pub async fn latest_block_number(&self) -> ImaResult<u64> {
        self.inner
            .block_number()
            .await
            .map_err(|e| self.rpc_error("eth_blockNumber", e))
            .tap_err(|e| tracing::warn!("{}", e))
    }

    pub async fn get_transaction(&self, hash: TxHash) -> ImaResult<Option<Transaction>> {
        self.inner
            .get_transaction_by_hash(hash)
            .await
            .map_err(|e| self.rpc_error("eth_getTransactionByHash", e))
            .tap_err(|e| tracing::warn!(tx_hash = ?hash, "{}", e))
    }

    pub async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> ImaResult<Option<TransactionReceipt>> {
        self.inner
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.rpc_error("eth_getTransactionReceipt", e))
            .tap_err(|e| tracing::warn!(tx_hash = ?hash, "{}", e))
    }

    pub async fn is_known_transaction(&self, hash: TxHash) -> ImaResult<bool> {
        self.inner
            .is_known_transaction(hash)
            .await
            .map_err(|e| self.rpc_error("eth_getTransactionByHash", e))
    }

    /// A transaction counts as mined once its receipt carries hash, block number and gas used.
    pub async fn is_mined(&self, hash: TxHash) -> ImaResult<bool> {
        Ok(self
            .get_transaction_receipt(hash)
            .await?
            .map(|receipt| is_well_formed_receipt(&receipt))
            .unwrap_or(false))
    }
}

pub fn is_well_formed_receipt(receipt: &TransactionReceipt) -> bool {
    !receipt.transaction_hash.is_zero()
        && receipt.block_number.is_some()
        && receipt.gas_used.is_some()
}

/// The chain endpoints a node can prove messages against.
pub struct ChainRegistry<C> {
    own_chain_name: String,
    local: Arc<ImaChainClient<C>>,
    main_net: Arc<ImaChainClient<C>>,
    side_chains: HashMap<String, Arc<ImaChainClient<C>>>,
}

/// Which client a message must be proven against.
pub struct SourceChain<C> {
    pub client: Arc<ImaChainClient<C>>,
    pub is_local: bool,
}

impl<C> Clone for SourceChain<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            is_local: self.is_local,
        }
    }
}

impl<C> ChainRegistry<C>
where
    C: ImaChainClientInner,
{
    pub fn new(
        own_chain_name: &str,
        local: Arc<ImaChainClient<C>>,
        main_net: Arc<ImaChainClient<C>>,
        side_chains: HashMap<String, Arc<ImaChainClient<C>>>,
    ) -> Self {
        Self {
            own_chain_name: own_chain_name.to_string(),
            local,
            main_net,
            side_chains,
        }
    }

    pub fn own_chain_name(&self) -> &str {
        &self.own_chain_name
    }

    pub fn local(&self) -> &Arc<ImaChainClient<C>> {
        &self.local
    }

    pub fn main_net(&self) -> &Arc<ImaChainClient<C>> {
        &self.main_net
    }

    pub fn source_for(&self, direction: Direction, src_chain_name: &str) -> ImaResult<SourceChain<C>> {
        let local = || SourceChain {
            client: self.local.clone(),
            is_local: true,
        };
        match direction {
            Direction::M2S => Ok(SourceChain {
                client: self.main_net.clone(),
                is_local: false,
            }),
            Direction::S2M => Ok(local()),
            Direction::S2S if src_chain_name == self.own_chain_name => Ok(local()),
            Direction::S2S => self
                .side_chains
                .get(src_chain_name)
                .map(|client| SourceChain {
                    client: client.clone(),
                    is_local: false,
                })
                .ok_or_else(|| ImaError::UnknownChain(src_chain_name.to_string())),
        }
    }
}
