// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ImaError, ImaResult};
use crate::types::format_txn_hash;
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};
use std::hash::{Hash, Hasher};

/// A transaction awaiting mining. Compared and ordered by hash only.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TrackedTxnEntry {
    pub hash: U256,
    pub timestamp: u64,
}

/// Zero marks an empty entry and is never tracked.
pub fn validate_txn_hash(hash: &U256) -> ImaResult<()> {
    if hash.is_zero() {
        return Err(ImaError::InvalidRequest(
            "transaction hash must not be zero".to_string(),
        ));
    }
    Ok(())
}

impl TrackedTxnEntry {
    pub fn new(hash: U256, timestamp: u64) -> ImaResult<Self> {
        validate_txn_hash(&hash)?;
        Ok(Self { hash, timestamp })
    }

    fn probe(hash: U256) -> Self {
        Self { hash, timestamp: 0 }
    }

    pub fn hash_hex(&self) -> String {
        format_txn_hash(&self.hash)
    }

    pub fn tx_hash(&self) -> H256 {
        let mut word = [0u8; 32];
        self.hash.to_big_endian(&mut word);
        H256::from(word)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "hash": self.hash_hex(),
            "timestamp": self.timestamp,
        })
    }
}

impl PartialEq for TrackedTxnEntry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for TrackedTxnEntry {}

impl PartialOrd for TrackedTxnEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TrackedTxnEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl Hash for TrackedTxnEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

/// Lookup set plus insertion-ordered list over the same entries.
#[derive(Debug, Default)]
pub struct PendingSet {
    set: BTreeSet<TrackedTxnEntry>,
    list: VecDeque<TrackedTxnEntry>,
}

impl PendingSet {
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn contains(&self, hash: &U256) -> bool {
        self.set.contains(&TrackedTxnEntry::probe(*hash))
    }

    /// Appends the entry unless its hash is already tracked.
    pub fn insert(&mut self, entry: TrackedTxnEntry) -> bool {
        if !self.set.insert(entry) {
            return false;
        }
        self.list.push_back(entry);
        true
    }

    pub fn erase(&mut self, hash: &U256) -> Option<TrackedTxnEntry> {
        let entry = self.set.take(&TrackedTxnEntry::probe(*hash))?;
        if let Some(position) = self.list.iter().position(|e| e.hash == *hash) {
            self.list.remove(position);
        }
        Some(entry)
    }

    pub fn pop_oldest(&mut self) -> Option<TrackedTxnEntry> {
        let entry = self.list.pop_front()?;
        self.set.remove(&entry);
        Some(entry)
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &TrackedTxnEntry> {
        self.list.iter()
    }

    pub fn clear(&mut self) {
        self.set.clear();
        self.list.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        self.set.len() == self.list.len() && self.list.iter().all(|e| self.set.contains(e))
    }
}
