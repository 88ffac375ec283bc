/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The instance-version history: an append-only log of every state change, indexed by instance
//! ID, for historical queries. Not part of consensus; it is rebuilt from incoming blocks and
//! bounded per chain.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::basic::{BlockIndex, ChainId, InstanceId};
use crate::types::transaction::StateChange;

/// Newest entries kept per chain; the oldest are trimmed beyond this.
const MAX_ENTRIES_PER_CHAIN: usize = 4096;

#[derive(Clone, Debug)]
pub struct StateChangeEntry {
    pub state_change: StateChange,
    pub block_index: BlockIndex,
}

struct ChainHistory {
    /// All entries in append order, for trimming and by-block queries.
    log: Vec<StateChangeEntry>,
    by_instance: HashMap<InstanceId, Vec<usize>>,
}

pub struct StateChangeStorage {
    chains: Mutex<HashMap<ChainId, ChainHistory>>,
}

impl StateChangeStorage {
    pub fn new() -> StateChangeStorage {
        StateChangeStorage {
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Append the state changes of one committed block.
    pub fn append(&self, chain_id: ChainId, scs: &[StateChange], block_index: BlockIndex) {
        let mut chains = self.chains.lock().unwrap();
        let history = chains.entry(chain_id).or_insert_with(|| ChainHistory {
            log: Vec::new(),
            by_instance: HashMap::new(),
        });
        for sc in scs {
            let position = history.log.len();
            history.log.push(StateChangeEntry {
                state_change: sc.clone(),
                block_index,
            });
            history
                .by_instance
                .entry(sc.instance_id)
                .or_default()
                .push(position);
        }
        if history.log.len() > MAX_ENTRIES_PER_CHAIN {
            let cut = history.log.len() - MAX_ENTRIES_PER_CHAIN;
            history.log.drain(..cut);
            let mut by_instance: HashMap<InstanceId, Vec<usize>> = HashMap::new();
            for (position, entry) in history.log.iter().enumerate() {
                by_instance
                    .entry(entry.state_change.instance_id)
                    .or_default()
                    .push(position);
            }
            history.by_instance = by_instance;
        }
    }

    /// The state change that set an instance to a specific version.
    pub fn get_by_version(
        &self,
        chain_id: &ChainId,
        instance_id: &InstanceId,
        version: u64,
    ) -> Option<StateChangeEntry> {
        let chains = self.chains.lock().unwrap();
        let history = chains.get(chain_id)?;
        history
            .by_instance
            .get(instance_id)?
            .iter()
            .map(|&i| &history.log[i])
            .find(|e| e.state_change.version == version)
            .cloned()
    }

    /// The newest state change of an instance.
    pub fn get_last(
        &self,
        chain_id: &ChainId,
        instance_id: &InstanceId,
    ) -> Option<StateChangeEntry> {
        let chains = self.chains.lock().unwrap();
        let history = chains.get(chain_id)?;
        let last = history.by_instance.get(instance_id)?.last()?;
        Some(history.log[*last].clone())
    }

    /// All recorded state changes of an instance, oldest first.
    pub fn get_all(&self, chain_id: &ChainId, instance_id: &InstanceId) -> Vec<StateChangeEntry> {
        let chains = self.chains.lock().unwrap();
        let Some(history) = chains.get(chain_id) else {
            return Vec::new();
        };
        history
            .by_instance
            .get(instance_id)
            .map(|positions| positions.iter().map(|&i| history.log[i].clone()).collect())
            .unwrap_or_default()
    }

    /// All state changes recorded for one block.
    pub fn get_by_block(&self, chain_id: &ChainId, block_index: BlockIndex) -> Vec<StateChangeEntry> {
        let chains = self.chains.lock().unwrap();
        let Some(history) = chains.get(chain_id) else {
            return Vec::new();
        };
        history
            .log
            .iter()
            .filter(|e| e.block_index == block_index)
            .cloned()
            .collect()
    }

    pub fn remove_chain(&self, chain_id: &ChainId) {
        self.chains.lock().unwrap().remove(chain_id);
    }
}

impl Default for StateChangeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::darc::DarcId;
    use crate::types::transaction::StateAction;

    fn sc(id: u8, version: u64) -> StateChange {
        let mut change = StateChange::new(
            StateAction::Update,
            InstanceId::new([id; 32]),
            "test",
            vec![version as u8],
            DarcId::zero(),
        );
        change.version = version;
        change
    }

    #[test]
    fn queries_by_version_last_and_block() {
        let storage = StateChangeStorage::new();
        let chain = ChainId::new([1u8; 32]);
        storage.append(chain, &[sc(1, 0), sc(2, 0)], BlockIndex::new(0));
        storage.append(chain, &[sc(1, 1)], BlockIndex::new(1));

        let v0 = storage
            .get_by_version(&chain, &InstanceId::new([1u8; 32]), 0)
            .unwrap();
        assert_eq!(v0.block_index, BlockIndex::new(0));

        let last = storage.get_last(&chain, &InstanceId::new([1u8; 32])).unwrap();
        assert_eq!(last.state_change.version, 1);
        assert_eq!(last.block_index, BlockIndex::new(1));

        assert_eq!(storage.get_all(&chain, &InstanceId::new([1u8; 32])).len(), 2);
        assert_eq!(storage.get_by_block(&chain, BlockIndex::new(0)).len(), 2);
        assert!(storage
            .get_by_version(&chain, &InstanceId::new([9u8; 32]), 0)
            .is_none());
    }

    #[test]
    fn trimming_keeps_the_newest_entries() {
        let storage = StateChangeStorage::new();
        let chain = ChainId::new([1u8; 32]);
        for i in 0..(MAX_ENTRIES_PER_CHAIN + 10) {
            storage.append(chain, &[sc(1, i as u64)], BlockIndex::new(i as u64));
        }
        assert!(storage
            .get_by_version(&chain, &InstanceId::new([1u8; 32]), 0)
            .is_none());
        let last = storage.get_last(&chain, &InstanceId::new([1u8; 32])).unwrap();
        assert_eq!(last.state_change.version, (MAX_ENTRIES_PER_CHAIN + 9) as u64);
    }
}
