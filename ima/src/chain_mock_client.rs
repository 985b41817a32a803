// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! An in-memory chain used in test environments.

use crate::chain_client::ImaChainClientInner;
use async_trait::async_trait;
use ethers::types::{Filter, Log, Topic, Transaction, TransactionReceipt, TxHash, ValueOrArray, H256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
#[error("mock chain error: {0}")]
pub struct MockChainError(String);

#[derive(Clone, Debug, Default)]
pub struct ChainMockClient {
    latest_block_number: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
    logs: Arc<Mutex<Vec<Log>>>,
    transactions: Arc<Mutex<HashMap<TxHash, Transaction>>>,
    receipts: Arc<Mutex<HashMap<TxHash, TransactionReceipt>>>,
    log_queries: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl ChainMockClient {
    pub fn set_latest_block_number(&self, block: u64) {
        self.latest_block_number.store(block, Ordering::SeqCst);
    }

    pub fn latest_block(&self) -> u64 {
        self.latest_block_number.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn add_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn add_transaction(&self, transaction: Transaction) {
        self.transactions
            .lock()
            .unwrap()
            .insert(transaction.hash, transaction);
    }

    pub fn add_receipt(&self, receipt: TransactionReceipt) {
        self.receipts
            .lock()
            .unwrap()
            .insert(receipt.transaction_hash, receipt);
    }

    pub fn remove_receipt(&self, hash: &TxHash) {
        self.receipts.lock().unwrap().remove(hash);
    }

    /// Block ranges of every `get_logs` call so far, in call order.
    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.log_queries.lock().unwrap().clone()
    }

    fn check_failing(&self) -> Result<(), MockChainError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MockChainError("endpoint unavailable".to_string()));
        }
        Ok(())
    }
}

fn topic_matches(expected: &Option<Topic>, actual: Option<&H256>) -> bool {
    match expected {
        None => true,
        Some(ValueOrArray::Value(None)) => true,
        Some(ValueOrArray::Value(Some(topic))) => actual == Some(topic),
        Some(ValueOrArray::Array(options)) => options
            .iter()
            .any(|option| option.is_none() || option.as_ref() == actual),
    }
}

#[async_trait]
impl ImaChainClientInner for ChainMockClient {
    type Error = MockChainError;

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, Self::Error> {
        self.check_failing()?;
        let from = filter.get_from_block().map(|b| b.as_u64()).unwrap_or(0);
        let to = filter
            .get_to_block()
            .map(|b| b.as_u64())
            .unwrap_or_else(|| self.latest_block_number.load(Ordering::SeqCst));
        self.log_queries.lock().unwrap().push((from, to));
        let logs = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                let block = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
                block >= from
                    && block <= to
                    && filter
                        .topics
                        .iter()
                        .enumerate()
                        .all(|(i, expected)| topic_matches(expected, log.topics.get(i)))
            })
            .cloned()
            .collect();
        Ok(logs)
    }

    async fn get_transaction_by_hash(
        &self,
        hash: TxHash,
    ) -> Result<Option<Transaction>, Self::Error> {
        self.check_failing()?;
        Ok(self.transactions.lock().unwrap().get(&hash).cloned())
    }

    async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, Self::Error> {
        self.check_failing()?;
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    async fn block_number(&self) -> Result<u64, Self::Error> {
        self.check_failing()?;
        Ok(self.latest_block_number.load(Ordering::SeqCst))
    }
}
