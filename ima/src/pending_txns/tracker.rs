// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::broadcast::{verify_broadcast_signature, BroadcastAction, NodeDirectory, TxnBroadcaster};
use super::types::{validate_txn_hash, PendingSet, TrackedTxnEntry};
use super::PendingTxnsConfig;
use crate::chain_client::{ImaChainClient, ImaChainClientInner};
use crate::dispatch::{priority, DispatchHandle, JobId};
use crate::error::{ImaError, ImaResult};
use crate::metrics::ImaMetrics;
use crate::types::BroadcastTxnRequest;
use ethers::types::U256;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

pub const PENDING_TXNS_QUEUE: &str = "ima-pending-txns";
pub const BROADCAST_QUEUE: &str = "ima-broadcast";

struct TrackerState {
    pending: PendingSet,
    max_txns: usize,
    tracking_job: Option<JobId>,
}

/// Bounded FIFO of transactions awaiting mining on the watched chain.
///
/// A periodic mined-check runs on [`PENDING_TXNS_QUEUE`] exactly while the set
/// is non-empty. Broadcasts are posted to [`BROADCAST_QUEUE`] after the state
/// lock is released.
pub struct PendingTxnTracker<C> {
    state: ReentrantMutex<RefCell<TrackerState>>,
    config: PendingTxnsConfig,
    chain: Arc<ImaChainClient<C>>,
    nodes: Arc<NodeDirectory>,
    broadcaster: Option<Arc<TxnBroadcaster>>,
    dispatch: DispatchHandle,
    runtime: tokio::runtime::Handle,
    metrics: Arc<ImaMetrics>,
    weak_self: Weak<Self>,
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl<C> PendingTxnTracker<C>
where
    C: ImaChainClientInner + 'static,
{
    pub fn new(
        config: PendingTxnsConfig,
        chain: Arc<ImaChainClient<C>>,
        nodes: Arc<NodeDirectory>,
        broadcaster: Option<Arc<TxnBroadcaster>>,
        dispatch: DispatchHandle,
        runtime: tokio::runtime::Handle,
        metrics: Arc<ImaMetrics>,
    ) -> Arc<Self> {
        dispatch.add(PENDING_TXNS_QUEUE, Some(priority::NORMAL));
        dispatch.add(BROADCAST_QUEUE, Some(priority::HIGH));
        let broadcaster = broadcaster.filter(|_| config.broadcast);
        Arc::new_cyclic(|weak_self| Self {
            state: ReentrantMutex::new(RefCell::new(TrackerState {
                pending: PendingSet::default(),
                max_txns: config.max_txns,
                tracking_job: None,
            })),
            config,
            chain,
            nodes,
            broadcaster,
            dispatch,
            runtime,
            metrics,
            weak_self: weak_self.clone(),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let result = f(&mut state);
        self.metrics.pending_txns.set(state.pending.len() as i64);
        result
    }

    /// Tracks `hash`. Returns false when it is already tracked.
    pub fn insert(&self, hash: U256, timestamp: Option<u64>, broadcast: bool) -> ImaResult<bool> {
        let entry = TrackedTxnEntry::new(hash, timestamp.unwrap_or_else(now_unix_secs))?;
        let evicted = self.with_state(|state| {
            if !state.pending.insert(entry) {
                return None;
            }
            let evicted = self.evict_over_limit(state);
            self.update_tracking(state);
            Some(evicted)
        });
        let Some(evicted) = evicted else {
            debug!(tx_hash = entry.hash_hex().as_str(), "Transaction already tracked");
            return Ok(false);
        };
        debug!(tx_hash = entry.hash_hex().as_str(), "Tracking transaction");
        if broadcast {
            self.post_broadcast(BroadcastAction::Insert, entry);
        }
        for entry in evicted {
            self.post_broadcast(BroadcastAction::Erase, entry);
        }
        Ok(true)
    }

    /// Stops tracking `hash`. Returns false when it was not tracked.
    pub fn erase(&self, hash: U256, broadcast: bool) -> ImaResult<bool> {
        validate_txn_hash(&hash)?;
        let erased = self.with_state(|state| {
            let erased = state.pending.erase(&hash);
            if erased.is_some() {
                self.update_tracking(state);
            }
            erased
        });
        match erased {
            Some(entry) => {
                debug!(tx_hash = entry.hash_hex().as_str(), "Transaction no longer tracked");
                if broadcast {
                    self.post_broadcast(BroadcastAction::Erase, entry);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn find(&self, hash: U256) -> ImaResult<bool> {
        validate_txn_hash(&hash)?;
        Ok(self.with_state(|state| state.pending.contains(&hash)))
    }

    /// Oldest first
    pub fn list_all(&self) -> Vec<TrackedTxnEntry> {
        self.with_state(|state| state.pending.iter().copied().collect())
    }

    pub fn clear(&self) {
        self.with_state(|state| {
            state.pending.clear();
            self.update_tracking(state);
        });
        info!("Pending transaction tracker cleared");
    }

    /// Applies a new bound, evicting the oldest entries right away.
    pub fn adjust_limits(&self, max_txns: usize) -> ImaResult<()> {
        if max_txns == 0 {
            return Err(ImaError::InvalidRequest(
                "max pending transactions must be positive".to_string(),
            ));
        }
        let evicted = self.with_state(|state| {
            state.max_txns = max_txns;
            let evicted = self.evict_over_limit(state);
            self.update_tracking(state);
            evicted
        });
        for entry in evicted {
            self.post_broadcast(BroadcastAction::Erase, entry);
        }
        Ok(())
    }

    pub fn is_tracking(&self) -> bool {
        self.with_state(|state| state.tracking_job.is_some())
    }

    pub fn size(&self) -> usize {
        self.with_state(|state| state.pending.len())
    }

    pub fn max_txns(&self) -> usize {
        self.with_state(|state| state.max_txns)
    }

    /// Applies an insert or erase received from another node after checking its signature.
    pub fn apply_broadcast(
        &self,
        action: BroadcastAction,
        request: &BroadcastTxnRequest,
    ) -> ImaResult<bool> {
        if let Err(e) = verify_broadcast_signature(
            &self.nodes,
            request.broadcast_from_node,
            action,
            &request.hash,
            &request.broadcast_signature,
        ) {
            warn!("Rejected {} broadcast: {}", action, e);
            self.metrics.broadcasts_rejected.inc();
            return Err(e);
        }
        match action {
            BroadcastAction::Insert => self.insert(request.hash, Some(request.timestamp), false),
            BroadcastAction::Erase => self.erase(request.hash, false),
        }
    }

    /// One pass of the periodic job: erases mined transactions, oldest first.
    /// Chain errors end the pass and are only logged. Returns how many were mined.
    pub fn check_mined(&self) -> usize {
        let mut mined = 0;
        for entry in self.list_all() {
            match self.runtime.block_on(self.chain.is_mined(entry.tx_hash())) {
                Ok(true) => {
                    info!(tx_hash = entry.hash_hex().as_str(), "Tracked transaction mined");
                    self.metrics.pending_txns_mined.inc();
                    mined += 1;
                    if let Err(e) = self.erase(entry.hash, true) {
                        warn!(tx_hash = entry.hash_hex().as_str(), "Cannot erase mined transaction: {}", e);
                    }
                }
                Ok(false) => {
                    if self.config.stop_at_first_pending {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        tx_hash = entry.hash_hex().as_str(),
                        "Mined check failed, retrying next tick: {}", e
                    );
                    break;
                }
            }
        }
        mined
    }

    fn evict_over_limit(&self, state: &mut TrackerState) -> Vec<TrackedTxnEntry> {
        let mut evicted = vec![];
        while state.pending.len() > state.max_txns {
            let Some(entry) = state.pending.pop_oldest() else {
                break;
            };
            info!(tx_hash = entry.hash_hex().as_str(), "Evicting oldest tracked transaction");
            self.metrics.pending_txns_evicted.inc();
            evicted.push(entry);
        }
        evicted
    }

    // Keeps the periodic job running exactly while something is tracked.
    fn update_tracking(&self, state: &mut TrackerState) {
        if state.pending.is_empty() {
            if let Some(job) = state.tracking_job.take() {
                self.dispatch.stop(job);
                info!("Pending transaction tracking stopped");
            }
            return;
        }
        if state.tracking_job.is_some() {
            return;
        }
        let weak = self.weak_self.clone();
        let interval = Duration::from_secs(self.config.check_interval_secs);
        match self.dispatch.repeat(
            PENDING_TXNS_QUEUE,
            move || {
                if let Some(tracker) = weak.upgrade() {
                    tracker.check_mined();
                }
            },
            interval,
        ) {
            Ok(job) => {
                info!(?interval, "Pending transaction tracking started");
                state.tracking_job = Some(job);
            }
            Err(e) => error!("Cannot start pending transaction tracking: {}", e),
        }
    }

    fn post_broadcast(&self, action: BroadcastAction, entry: TrackedTxnEntry) {
        let Some(broadcaster) = self.broadcaster.clone() else {
            return;
        };
        let runtime = self.runtime.clone();
        if let Err(e) = self.dispatch.post(BROADCAST_QUEUE, move || {
            runtime.block_on(broadcaster.broadcast(action, &entry));
        }) {
            warn!(
                tx_hash = entry.hash_hex().as_str(),
                "Cannot schedule {} broadcast: {}", action, e
            );
        }
    }
}
