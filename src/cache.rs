/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The state-change cache.
//!
//! Execution is deterministic given a trie snapshot, so the leader's build pass, each follower's
//! verification pass, and the commit pass over the same transaction batch all compute the same
//! result. The cache keys that result by `(chain_id, tx_batch_hash)` and keeps one entry per
//! chain, which is exactly the window between building/verifying a block and committing it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::basic::{ChainId, CryptoHash};
use crate::types::transaction::{StateChange, TxResult};

#[derive(Clone)]
pub struct CacheEntry {
    pub merkle_root: CryptoHash,
    pub tx_results: Vec<TxResult>,
    pub state_changes: Vec<StateChange>,
}

pub struct StateChangeCache {
    entries: Mutex<HashMap<ChainId, (CryptoHash, CacheEntry)>>,
}

impl StateChangeCache {
    pub fn new() -> StateChangeCache {
        StateChangeCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, chain_id: &ChainId, tx_batch_hash: &CryptoHash) -> Option<CacheEntry> {
        let entries = self.entries.lock().unwrap();
        let (key, entry) = entries.get(chain_id)?;
        if key == tx_batch_hash {
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn update(&self, chain_id: ChainId, tx_batch_hash: CryptoHash, entry: CacheEntry) {
        self.entries
            .lock()
            .unwrap()
            .insert(chain_id, (tx_batch_hash, entry));
    }

    pub fn invalidate(&self, chain_id: &ChainId) {
        self.entries.lock().unwrap().remove(chain_id);
    }
}

impl Default for StateChangeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_and_miss() {
        let cache = StateChangeCache::new();
        let chain = ChainId::new([1u8; 32]);
        let key = CryptoHash::new([2u8; 32]);
        assert!(cache.get(&chain, &key).is_none());

        cache.update(
            chain,
            key,
            CacheEntry {
                merkle_root: CryptoHash::new([3u8; 32]),
                tx_results: Vec::new(),
                state_changes: Vec::new(),
            },
        );
        assert!(cache.get(&chain, &key).is_some());
        assert!(cache.get(&chain, &CryptoHash::new([9u8; 32])).is_none());

        // A newer batch replaces the chain's single slot.
        let newer = CryptoHash::new([4u8; 32]);
        cache.update(
            chain,
            newer,
            CacheEntry {
                merkle_root: CryptoHash::new([5u8; 32]),
                tx_results: Vec::new(),
                state_changes: Vec::new(),
            },
        );
        assert!(cache.get(&chain, &key).is_none());
        assert!(cache.get(&chain, &newer).is_some());
    }
}
