/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definitions for the two external collaborators of the service: the durable block store
//! (the lower skip-chain layer) and the collective-signing primitive.
//!
//! The service never walks forward links or aggregates BLS signatures itself; it stores blocks
//! through [BlockStore] and runs signing rounds through [CollectiveSigner]. A [MemBlockStore] is
//! provided for tests and single-process deployments.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Mutex;

use crate::types::basic::{BlockId, BlockIndex, ChainId, SignatureBytes};
use crate::types::block::{Block, Roster};

#[derive(Debug)]
pub enum BlockStoreError {
    /// The block does not link onto the stored chain.
    Unlinkable,
    /// The chain of the block is not known to the store.
    UnknownChain,
    /// A chain with this genesis already exists.
    ChainExists,
}

impl Display for BlockStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockStoreError::Unlinkable => write!(f, "block does not link onto the chain"),
            BlockStoreError::UnknownChain => write!(f, "unknown chain"),
            BlockStoreError::ChainExists => write!(f, "chain already exists"),
        }
    }
}

/// The durable, ordered log of blocks, with the linkage checks of the skip-chain layer.
///
/// Storing a block is what commits it: implementations must invoke every registered commit
/// callback, on the storing node, after the block is durably stored. The service registers its
/// trie-update pipeline as such a callback.
pub trait BlockStore: Send + Sync + 'static {
    fn get(&self, id: &BlockId) -> Option<Block>;

    fn genesis(&self, chain: &ChainId) -> Option<Block>;

    fn latest(&self, chain: &ChainId) -> Option<Block>;

    fn by_index(&self, chain: &ChainId, index: BlockIndex) -> Option<Block>;

    /// Append a block. Genesis blocks (index 0, zero prev) create a chain. Returns the block's
    /// id.
    fn store(&self, block: Block) -> Result<BlockId, BlockStoreError>;

    /// All chains known to this store.
    fn chain_ids(&self) -> Vec<ChainId>;

    /// Forget a chain and all its blocks.
    fn remove_chain(&self, chain: &ChainId);

    /// Register a callback invoked after every stored block.
    fn register_commit_callback(&self, callback: Box<dyn Fn(&Block) + Send + Sync>);
}

#[derive(Debug)]
pub enum CoSiError {
    /// Fewer than the threshold of nodes signed off.
    ThresholdNotReached,
    /// The signing round could not run.
    Failed(String),
}

impl Display for CoSiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CoSiError::ThresholdNotReached => write!(f, "signing threshold not reached"),
            CoSiError::Failed(why) => write!(f, "collective signing failed: {}", why),
        }
    }
}

/// The collective-signing primitive: produces a signature over a message on behalf of a roster,
/// and verifies one against a roster with a signer threshold.
pub trait CollectiveSigner: Send + Sync + 'static {
    fn collective_sign(&self, roster: &Roster, msg: &[u8]) -> Result<SignatureBytes, CoSiError>;

    fn verify(
        &self,
        roster: &Roster,
        threshold: usize,
        msg: &[u8],
        sig: &SignatureBytes,
    ) -> bool;
}

struct MemChain {
    by_index: std::collections::BTreeMap<u64, BlockId>,
}

/// An in-memory [BlockStore]. Performs the linkage checks but provides no durability.
pub struct MemBlockStore {
    blocks: Mutex<HashMap<BlockId, Block>>,
    chains: Mutex<HashMap<ChainId, MemChain>>,
    callbacks: Mutex<Vec<std::sync::Arc<dyn Fn(&Block) + Send + Sync>>>,
}

impl MemBlockStore {
    pub fn new() -> MemBlockStore {
        MemBlockStore {
            blocks: Mutex::new(HashMap::new()),
            chains: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn run_callbacks(&self, block: &Block) {
        // Snapshot the list first: callbacks may themselves store blocks (on this store or on
        // another node's), and must not run under the lock.
        let callbacks = self.callbacks.lock().unwrap().clone();
        for cb in callbacks.iter() {
            cb(block);
        }
    }
}

impl Default for MemBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemBlockStore {
    fn get(&self, id: &BlockId) -> Option<Block> {
        self.blocks.lock().unwrap().get(id).cloned()
    }

    fn genesis(&self, chain: &ChainId) -> Option<Block> {
        self.by_index(chain, BlockIndex::new(0))
    }

    fn latest(&self, chain: &ChainId) -> Option<Block> {
        let chains = self.chains.lock().unwrap();
        let id = chains.get(chain)?.by_index.values().next_back()?.to_owned();
        drop(chains);
        self.get(&id)
    }

    fn by_index(&self, chain: &ChainId, index: BlockIndex) -> Option<Block> {
        let chains = self.chains.lock().unwrap();
        let id = chains.get(chain)?.by_index.get(&index.int())?.to_owned();
        drop(chains);
        self.get(&id)
    }

    fn store(&self, block: Block) -> Result<BlockId, BlockStoreError> {
        let id = block.hash();
        let chain_id = block.chain_id();
        {
            let mut chains = self.chains.lock().unwrap();
            match chains.get_mut(&chain_id) {
                None => {
                    // A genesis block creates the chain. A later block for an unknown chain
                    // opens the chain at its index: this is the catch-up bootstrap after a
                    // full-state download, where the durable skip-chain implementation would
                    // verify forward links instead.
                    let mut by_index = std::collections::BTreeMap::new();
                    by_index.insert(block.index.int(), id);
                    chains.insert(chain_id, MemChain { by_index });
                }
                Some(chain) => {
                    if block.index.int() == 0 {
                        return Err(BlockStoreError::ChainExists);
                    }
                    match chain.by_index.get(&block.index.int()) {
                        Some(existing) if *existing != id => {
                            // A different block at an occupied index is a fork.
                            return Err(BlockStoreError::Unlinkable);
                        }
                        Some(_) => {
                            // Replay of an already-stored block: the callbacks still run, so a
                            // lagging trie gets a chance to apply it.
                        }
                        None => {
                            if let Some(prev_id) = chain.by_index.get(&(block.index.int() - 1)) {
                                if block.prev != *prev_id {
                                    return Err(BlockStoreError::Unlinkable);
                                }
                            }
                            // When the predecessor is absent locally the block is accepted on
                            // the strength of its forward links, which the durable skip-chain
                            // implementation verifies. This is what lets a node resume a chain
                            // mid-stream after a full-state download.
                            chain.by_index.insert(block.index.int(), id);
                        }
                    }
                }
            }
            self.blocks.lock().unwrap().insert(id, block.clone());
        }
        self.run_callbacks(&block);
        Ok(id)
    }

    fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.lock().unwrap().keys().cloned().collect()
    }

    fn remove_chain(&self, chain: &ChainId) {
        let mut chains = self.chains.lock().unwrap();
        if let Some(removed) = chains.remove(chain) {
            let mut blocks = self.blocks.lock().unwrap();
            for id in removed.by_index.values() {
                blocks.remove(id);
            }
        }
    }

    fn register_commit_callback(&self, callback: Box<dyn Fn(&Block) + Send + Sync>) {
        self.callbacks.lock().unwrap().push(callback.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::{CryptoHash, Timestamp};
    use crate::types::block::BlockHeader;

    fn header() -> BlockHeader {
        BlockHeader {
            trie_root: CryptoHash::new([1u8; 32]),
            client_tx_hash: CryptoHash::zero(),
            state_changes_hash: CryptoHash::zero(),
            timestamp: Timestamp::new(1),
        }
    }

    fn genesis_block() -> Block {
        Block {
            index: BlockIndex::new(0),
            prev: BlockId::zero(),
            genesis: BlockId::zero(),
            roster: Roster::new(vec![]),
            header: header(),
            body: Vec::new(),
        }
    }

    #[test]
    fn store_links_blocks() {
        let store = MemBlockStore::new();
        let genesis = genesis_block();
        let genesis_id = store.store(genesis.clone()).unwrap();
        let chain = genesis.chain_id();

        let block_1 = Block {
            index: BlockIndex::new(1),
            prev: genesis_id,
            genesis: genesis_id,
            roster: Roster::new(vec![]),
            header: header(),
            body: Vec::new(),
        };
        store.store(block_1.clone()).unwrap();

        assert_eq!(store.latest(&chain).unwrap().index, BlockIndex::new(1));
        assert_eq!(store.genesis(&chain).unwrap().hash(), genesis_id);
        assert_eq!(
            store.by_index(&chain, BlockIndex::new(1)).unwrap().hash(),
            block_1.hash()
        );

        // A block whose predecessor is present must link onto it.
        let fork = Block {
            index: BlockIndex::new(2),
            prev: genesis_id,
            genesis: genesis_id,
            roster: Roster::new(vec![]),
            header: header(),
            body: Vec::new(),
        };
        assert!(matches!(
            store.store(fork),
            Err(BlockStoreError::Unlinkable)
        ));
    }

    #[test]
    fn commit_callbacks_fire_per_stored_block() {
        let store = MemBlockStore::new();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = seen.clone();
        store.register_commit_callback(Box::new(move |b: &Block| {
            seen_in_cb.lock().unwrap().push(b.index);
        }));
        store.store(genesis_block()).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![BlockIndex::new(0)]);
    }
}
