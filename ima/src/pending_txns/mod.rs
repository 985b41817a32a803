// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cross-chain transactions this node is waiting to see mined.

pub mod broadcast;
pub mod tracker;
pub mod types;

pub use broadcast::{
    broadcast_txn_sign, broadcast_txn_verify_signature, BroadcastAction, BroadcastSigner,
    HttpBroadcastSink, NodeDirectory, PeerNode, TxnBroadcastSink, TxnBroadcaster,
};
pub use tracker::{PendingTxnTracker, BROADCAST_QUEUE, PENDING_TXNS_QUEUE};
pub use types::{PendingSet, TrackedTxnEntry};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PendingTxnsConfig {
    pub enabled: bool,
    pub max_txns: usize,
    pub check_interval_secs: u64,
    /// End a mined-check pass at the first transaction that is not mined yet
    pub stop_at_first_pending: bool,
    pub broadcast: bool,
}

impl Default for PendingTxnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_txns: 1024,
            check_interval_secs: 90,
            stop_at_first_pending: true,
            broadcast: true,
        }
    }
}

impl PendingTxnsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_txns == 0 {
            anyhow::bail!("pending-txns.max-txns must be positive");
        }
        if self.check_interval_secs == 0 {
            anyhow::bail!("pending-txns.check-interval-secs must be positive");
        }
        Ok(())
    }
}
