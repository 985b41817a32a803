// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Proves that IMA messages were emitted as `OutgoingMessage` events on their source chain.

use crate::chain_client::{ChainRegistry, ImaChainClientInner, SourceChain};
use crate::error::{ImaError, ImaResult};
use crate::message::ImaMessage;
use crate::metrics::ImaMetrics;
use crate::types::{Direction, ImaMessageInput, VerifyAndSignRequest};
use ethers::types::{Address, Log, TransactionReceipt, H256, U256};
use ethers::utils::keccak256;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod log_search;

pub use log_search::{LogSearchConfig, LogSearcher};

pub const OUTGOING_MESSAGE_EVENT: &str = "OutgoingMessage(bytes32,uint256,address,address,bytes)";

/// Predeployed message proxy on every side-chain
pub const DEFAULT_SIDE_CHAIN_MESSAGE_PROXY: &str = "0xd2AAa00100000000000000000000000000000000";

pub fn outgoing_message_topic() -> H256 {
    H256::from(keccak256(OUTGOING_MESSAGE_EVENT.as_bytes()))
}

pub fn chain_name_topic(chain_name: &str) -> H256 {
    H256::from(keccak256(chain_name.as_bytes()))
}

pub fn message_counter_topic(counter: u64) -> H256 {
    let mut word = [0u8; 32];
    U256::from(counter).to_big_endian(&mut word);
    H256::from(word)
}

/// Topics `[signature, keccak(dst chain), counter]` of one message's event.
pub fn expected_topics(dst_chain_name: &str, counter: u64) -> [H256; 3] {
    [
        outgoing_message_topic(),
        chain_name_topic(dst_chain_name),
        message_counter_topic(counter),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageProxyContracts {
    pub main_net: Address,
    pub side_chain: Address,
}

impl MessageProxyContracts {
    /// The proxy that emits the event on the chain a message leaves from.
    pub fn for_direction(&self, direction: Direction) -> Address {
        match direction {
            Direction::M2S => self.main_net,
            Direction::S2M | Direction::S2S => self.side_chain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Decoded,
    LogSearchPending,
    LogMatchFound,
    LogSearchExhausted,
    ReceiptCrossChecked,
    ReceiptMismatch,
    Verified,
    Rejected,
}

impl VerificationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VerificationState::Verified | VerificationState::Rejected)
    }
}

impl Display for VerificationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub message_index: u64,
    pub state: VerificationState,
    pub tx_hash: Option<H256>,
    pub reason: Option<String>,
}

impl VerificationOutcome {
    pub fn is_verified(&self) -> bool {
        self.state == VerificationState::Verified
    }
}

/// A message that decoded cleanly and was proven on its source chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMessage {
    pub message_index: u64,
    pub input: ImaMessageInput,
    pub message: ImaMessage,
    pub tx_hash: H256,
}

struct MessageProbe<'a> {
    message_index: u64,
    state: VerificationState,
    input: &'a ImaMessageInput,
}

impl MessageProbe<'_> {
    fn advance(&mut self, next: VerificationState) {
        debug!(
            message_index = self.message_index,
            "IMA message verification {} -> {}", self.state, next
        );
        self.state = next;
    }

    fn finish(mut self, tx_hash: Option<H256>) -> VerificationOutcome {
        let reason = match tx_hash {
            Some(_) => {
                self.advance(VerificationState::Verified);
                None
            }
            None => {
                self.advance(VerificationState::Rejected);
                Some(no_transaction_found(self.message_index))
            }
        };
        VerificationOutcome {
            message_index: self.message_index,
            state: self.state,
            tx_hash,
            reason,
        }
    }
}

pub fn no_transaction_found(message_index: u64) -> String {
    format!(
        "no transaction was found in logs for IMA message {}",
        message_index
    )
}

/// Rejects a batch whose message counters would run past `u64::MAX`.
pub fn check_message_range(start_message_idx: u64, count: usize) -> ImaResult<()> {
    let Some(last_offset) = (count as u64).checked_sub(1) else {
        return Ok(());
    };
    match start_message_idx.checked_add(last_offset) {
        Some(_) => Ok(()),
        None => Err(ImaError::InvalidRequest(format!(
            "startMessageIdx {} with {} messages overflows the message counter",
            start_message_idx, count
        ))),
    }
}

/// Decodes every message of a batch, failing on the first malformed one.
pub fn decode_batch(
    start_message_idx: u64,
    messages: &[ImaMessageInput],
) -> ImaResult<Vec<ImaMessage>> {
    check_message_range(start_message_idx, messages.len())?;
    messages
        .iter()
        .enumerate()
        .map(|(position, input)| {
            ImaMessage::decode(&input.data).map_err(|source| ImaError::Decode {
                message_index: start_message_idx + position as u64,
                source,
            })
        })
        .collect()
}

/// Whether one receipt log is the proxy's event for this message.
pub fn receipt_log_matches(
    log: &Log,
    proxy: Address,
    topics: &[H256; 3],
    input: &ImaMessageInput,
) -> bool {
    if log.address != proxy {
        return false;
    }
    if !topics.iter().all(|topic| log.topics.contains(topic)) {
        return false;
    }
    let destination = H256::from(input.destination_contract);
    if !log
        .data
        .chunks(32)
        .any(|chunk| chunk == destination.as_bytes())
    {
        return false;
    }
    hex::encode(&log.data).contains(&hex::encode(&input.data))
}

pub fn receipt_matches(
    receipt: &TransactionReceipt,
    proxy: Address,
    topics: &[H256; 3],
    input: &ImaMessageInput,
) -> bool {
    receipt
        .logs
        .iter()
        .any(|log| receipt_log_matches(log, proxy, topics, input))
}

pub struct ImaVerifier<C> {
    chains: Arc<ChainRegistry<C>>,
    contracts: MessageProxyContracts,
    searcher: LogSearcher,
    metrics: Arc<ImaMetrics>,
}

impl<C> ImaVerifier<C>
where
    C: ImaChainClientInner,
{
    pub fn new(
        chains: Arc<ChainRegistry<C>>,
        contracts: MessageProxyContracts,
        log_search: LogSearchConfig,
        metrics: Arc<ImaMetrics>,
    ) -> Self {
        Self {
            chains,
            contracts,
            searcher: LogSearcher::new(log_search, metrics.clone()),
            metrics,
        }
    }

    pub fn chains(&self) -> &Arc<ChainRegistry<C>> {
        &self.chains
    }

    /// Decodes and proves a whole batch. The first malformed or unproven message
    /// aborts the batch.
    pub async fn verify_batch(
        &self,
        request: &VerifyAndSignRequest,
    ) -> ImaResult<Vec<VerifiedMessage>> {
        if request.messages.is_empty() {
            return Err(ImaError::InvalidRequest(
                "messages array is empty".to_string(),
            ));
        }
        check_message_range(request.start_message_idx, request.messages.len())?;
        let decoded = decode_batch(request.start_message_idx, &request.messages)?;
        let source = self
            .chains
            .source_for(request.direction, &request.src_chain_name)?;
        let proxy = self.contracts.for_direction(request.direction);
        info!(
            direction = %request.direction,
            src_chain = request.src_chain_name.as_str(),
            dst_chain = request.dst_chain_name.as_str(),
            start_message_idx = request.start_message_idx,
            count = decoded.len(),
            "Verifying IMA message batch"
        );

        let mut verified = Vec::with_capacity(decoded.len());
        for (position, (input, message)) in request.messages.iter().zip(decoded).enumerate() {
            let message_index = request.start_message_idx + position as u64;
            debug!(
                message_index,
                message_type = %message.message_type(),
                "IMA message decoded"
            );
            let outcome = self
                .verify_message(
                    &source,
                    proxy,
                    &request.dst_chain_name,
                    message_index,
                    input,
                )
                .await?;
            let label = [request.direction.as_str()];
            match (outcome.tx_hash, outcome.reason) {
                (Some(tx_hash), _) => {
                    self.metrics.messages_verified.with_label_values(&label).inc();
                    verified.push(VerifiedMessage {
                        message_index,
                        input: input.clone(),
                        message,
                        tx_hash,
                    });
                }
                (None, reason) => {
                    self.metrics.messages_rejected.with_label_values(&label).inc();
                    let reason = reason.unwrap_or_else(|| no_transaction_found(message_index));
                    warn!(message_index, "{}", reason);
                    return Err(ImaError::VerificationFailed(reason));
                }
            }
        }
        Ok(verified)
    }

    /// Runs one message through log search and receipt cross-checks.
    pub async fn verify_message(
        &self,
        source: &SourceChain<C>,
        proxy: Address,
        dst_chain_name: &str,
        message_index: u64,
        input: &ImaMessageInput,
    ) -> ImaResult<VerificationOutcome> {
        let mut probe = MessageProbe {
            message_index,
            state: VerificationState::Decoded,
            input,
        };
        let topics = expected_topics(dst_chain_name, message_index);
        probe.advance(VerificationState::LogSearchPending);
        let logs = self.searcher.search(&source.client, &topics).await?;
        if logs.is_empty() {
            probe.advance(VerificationState::LogSearchExhausted);
            return Ok(probe.finish(None));
        }
        probe.advance(VerificationState::LogMatchFound);

        for log in logs {
            let Some(tx_hash) = log.transaction_hash else {
                continue;
            };
            let known = if source.is_local {
                source.client.is_known_transaction(tx_hash).await?
            } else {
                source.client.get_transaction(tx_hash).await?.is_some()
            };
            if !known {
                debug!(message_index, tx_hash = ?tx_hash, "Log references unknown transaction");
                continue;
            }
            let Some(receipt) = source.client.get_transaction_receipt(tx_hash).await? else {
                debug!(message_index, tx_hash = ?tx_hash, "No receipt for transaction");
                continue;
            };
            if receipt_matches(&receipt, proxy, &topics, probe.input) {
                probe.advance(VerificationState::ReceiptCrossChecked);
                return Ok(probe.finish(Some(tx_hash)));
            }
            probe.advance(VerificationState::ReceiptMismatch);
        }
        Ok(probe.finish(None))
    }
}
