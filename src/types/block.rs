/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Blocks, rosters, and the chain configuration instance.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::types::basic::{BlockId, BlockIndex, ChainId, CryptoHash, NodeId, Timestamp};
use crate::types::transaction::TxResult;

/// The block interval used when the genesis request does not set one.
pub const DEFAULT_BLOCK_INTERVAL: Duration = Duration::from_secs(5);

/// The maximum block size used when the genesis request does not set one.
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 4_000_000;

/// Bounds enforced on `max_block_size` by configuration updates.
pub const MIN_BLOCK_SIZE: u64 = 16_000;
pub const MAX_BLOCK_SIZE: u64 = 8_000_000;

/// The ordered list of nodes maintaining a chain. Index 0 is the leader.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Roster {
    pub list: Vec<NodeId>,
}

impl Roster {
    pub fn new(list: Vec<NodeId>) -> Self {
        Self { list }
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.list.first()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.list.contains(node)
    }

    pub fn position(&self, node: &NodeId) -> Option<usize> {
        self.list.iter().position(|n| n == node)
    }

    /// The roster rotated so that `list[k mod len]` becomes the leader.
    pub fn rotated(&self, k: usize) -> Roster {
        if self.list.is_empty() {
            return self.clone();
        }
        let k = k % self.list.len();
        let mut list = self.list.clone();
        list.rotate_left(k);
        Roster { list }
    }

    /// The fault threshold `f = ⌊(n − 1) / 3⌋` of this roster.
    pub fn fault_threshold(&self) -> usize {
        self.list.len().saturating_sub(1) / 3
    }

    /// Whether `new` differs from this roster by at most one step: identical, a rotation of the
    /// same membership (leader change), or a single addition or removal.
    pub fn is_one_step_from(&self, new: &Roster) -> bool {
        if self.list == new.list {
            return true;
        }
        if self.list.len() == new.list.len() {
            // Same membership, rotated: a leader change.
            return (0..self.list.len()).any(|k| self.rotated(k).list == new.list);
        }
        let (longer, shorter) = if self.list.len() == new.list.len() + 1 {
            (&self.list, &new.list)
        } else if new.list.len() == self.list.len() + 1 {
            (&new.list, &self.list)
        } else {
            return false;
        };
        // The shorter roster must be the longer one with exactly one member removed, with the
        // relative order of the remaining members preserved.
        let mut it = shorter.iter();
        let mut pending = it.next();
        let mut skipped = 0;
        for node in longer.iter() {
            match pending {
                Some(expected) if node == expected => pending = it.next(),
                _ => skipped += 1,
            }
        }
        pending.is_none() && skipped == 1
    }
}

/// The chain configuration, stored under the all-zero instance ID from block 0 onward.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct ChainConfig {
    /// The target interval between blocks, in nanoseconds.
    pub block_interval_ns: u64,
    /// The maximum serialized size of a block body, in bytes.
    pub max_block_size: u64,
    pub roster: Roster,
    /// The contract IDs that are allowed to hold DARCs.
    pub darc_contract_ids: Vec<String>,
}

impl ChainConfig {
    pub fn block_interval(&self) -> Duration {
        Duration::from_nanos(self.block_interval_ns)
    }

    /// Sanity checks applied to a new configuration before it replaces the current one.
    pub fn sanity_check(&self) -> Result<(), ConfigError> {
        if self.block_interval_ns == 0 {
            return Err(ConfigError::ZeroBlockInterval);
        }
        if self.max_block_size < MIN_BLOCK_SIZE || self.max_block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::BlockSizeOutOfBounds(self.max_block_size));
        }
        if self.roster.is_empty() {
            return Err(ConfigError::EmptyRoster);
        }
        if self.darc_contract_ids.is_empty() {
            return Err(ConfigError::NoDarcContracts);
        }
        Ok(())
    }

    /// Check that a proposed roster is a one-step successor of the configured one.
    pub fn check_new_roster(&self, new: &Roster) -> Result<(), ConfigError> {
        if self.roster.is_one_step_from(new) {
            Ok(())
        } else {
            Err(ConfigError::RosterTransitionTooLarge)
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.try_to_vec().expect("config serialization is infallible")
    }

    pub fn from_bytes(buf: &[u8]) -> Result<ChainConfig, ConfigError> {
        ChainConfig::try_from_slice(buf).map_err(|_| ConfigError::Malformed)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Malformed,
    ZeroBlockInterval,
    BlockSizeOutOfBounds(u64),
    EmptyRoster,
    NoDarcContracts,
    RosterTransitionTooLarge,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Malformed => write!(f, "malformed chain config"),
            ConfigError::ZeroBlockInterval => write!(f, "block interval must be positive"),
            ConfigError::BlockSizeOutOfBounds(size) => {
                write!(f, "max block size {} outside allowed bounds", size)
            }
            ConfigError::EmptyRoster => write!(f, "roster must not be empty"),
            ConfigError::NoDarcContracts => {
                write!(f, "at least one darc contract ID is required")
            }
            ConfigError::RosterTransitionTooLarge => {
                write!(f, "roster changes by more than one step")
            }
        }
    }
}

/// The part of a block that commits to its contents: the trie root after applying the block, the
/// hash of the transaction results, the hash of the produced state changes, and the proposal
/// timestamp.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct BlockHeader {
    pub trie_root: CryptoHash,
    pub client_tx_hash: CryptoHash,
    pub state_changes_hash: CryptoHash,
    pub timestamp: Timestamp,
}

/// A block of the ledger. Linked into a chain by the external block store; the link fields kept
/// here are the ones the service itself needs.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Block {
    pub index: BlockIndex,
    /// Hash of the predecessor block. Zero for the genesis block.
    pub prev: BlockId,
    /// Hash of the genesis block. Zero inside the genesis block itself.
    pub genesis: BlockId,
    pub roster: Roster,
    pub header: BlockHeader,
    pub body: Vec<TxResult>,
}

impl Block {
    /// The identifier of this block: SHA-256 over its linking fields and header. The body is
    /// committed through `header.client_tx_hash`.
    pub fn hash(&self) -> BlockId {
        let mut h = Sha256::new();
        h.update(self.index.int().to_le_bytes());
        h.update(self.prev.bytes());
        h.update(self.genesis.bytes());
        for node in &self.roster.list {
            h.update(node.bytes());
        }
        h.update(self.header.trie_root.bytes());
        h.update(self.header.client_tx_hash.bytes());
        h.update(self.header.state_changes_hash.bytes());
        h.update(self.header.timestamp.nanos().to_le_bytes());
        BlockId::new(h.finalize().into())
    }

    /// The chain this block belongs to: its genesis link, or its own hash for the genesis block.
    pub fn chain_id(&self) -> ChainId {
        if self.genesis.is_zero() {
            ChainId::from(self.hash())
        } else {
            ChainId::from(self.genesis)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId::new([b; 32])
    }

    fn roster(bytes: &[u8]) -> Roster {
        Roster::new(bytes.iter().map(|b| node(*b)).collect())
    }

    #[test]
    fn rotation_is_one_step() {
        let old = roster(&[1, 2, 3, 4]);
        assert!(old.is_one_step_from(&roster(&[2, 3, 4, 1])));
        assert!(old.is_one_step_from(&roster(&[4, 1, 2, 3])));
        assert!(old.is_one_step_from(&old.clone()));
    }

    #[test]
    fn single_addition_and_removal_are_one_step() {
        let old = roster(&[1, 2, 3]);
        assert!(old.is_one_step_from(&roster(&[1, 2, 3, 4])));
        assert!(old.is_one_step_from(&roster(&[1, 3])));
    }

    #[test]
    fn larger_transitions_are_rejected() {
        let old = roster(&[1, 2, 3, 4]);
        // Two removals.
        assert!(!old.is_one_step_from(&roster(&[1, 2])));
        // Replacement of a member.
        assert!(!old.is_one_step_from(&roster(&[1, 2, 3, 5])));
        // Arbitrary permutation that is not a rotation.
        assert!(!old.is_one_step_from(&roster(&[2, 1, 3, 4])));
    }

    #[test]
    fn fault_threshold() {
        assert_eq!(roster(&[1]).fault_threshold(), 0);
        assert_eq!(roster(&[1, 2, 3, 4]).fault_threshold(), 1);
        assert_eq!(roster(&[1, 2, 3, 4, 5, 6, 7]).fault_threshold(), 2);
    }

    #[test]
    fn block_hash_covers_header() {
        let block = Block {
            index: BlockIndex::new(1),
            prev: BlockId::new([1u8; 32]),
            genesis: BlockId::new([2u8; 32]),
            roster: roster(&[1, 2, 3]),
            header: BlockHeader {
                trie_root: CryptoHash::new([3u8; 32]),
                client_tx_hash: CryptoHash::new([4u8; 32]),
                state_changes_hash: CryptoHash::new([5u8; 32]),
                timestamp: Timestamp::new(42),
            },
            body: Vec::new(),
        };
        let mut other = block.clone();
        other.header.trie_root = CryptoHash::new([6u8; 32]);
        assert_ne!(block.hash(), other.hash());
    }
}
