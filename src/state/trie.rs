/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A nonce-seeded binary Merkle trie over 32-byte keys.
//!
//! ## Structure
//!
//! The trie branches on the bits of the key, most significant bit first. Three node kinds exist:
//! *interior* nodes with a left (bit 0) and right (bit 1) child, *leaf* nodes carrying a full key
//! and its value, and *empty* nodes marking an absent subtree. Leaf and empty nodes record the bit
//! path to their position, and their hashes are seeded with the trie's nonce, so two tries with
//! different nonces commit to different roots even when empty.
//!
//! Nodes are content-addressed: each node is stored in the backing bucket under its own hash, and
//! the root hash commits to every current key/value pair. A [Proof] carries the interior hash
//! pairs along one path plus the terminal node, and proves either the presence of a key with a
//! specific value or its absence.
//!
//! ## Staging
//!
//! All mutation goes through a [StagingTrie]: a copy-on-write overlay of node writes over the
//! committed bucket. Cloning a staging trie clones only the overlay, which is what makes
//! speculative per-transaction execution cheap. The overlay's operations are extracted with
//! [StagingTrie::into_ops] and committed atomically by the caller.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use super::kv::{Bucket, KVStore};
use crate::types::basic::{CryptoHash, Nonce};

const TAG_EMPTY: u8 = 1;
const TAG_INTERIOR: u8 = 2;
const TAG_LEAF: u8 = 3;

/// The bit of a 32-byte key at the given depth, most significant bit first.
fn bit(key: &[u8; 32], depth: usize) -> bool {
    (key[depth / 8] >> (7 - depth % 8)) & 1 == 1
}

/// The bit path of a key down to (excluding) the given depth.
fn bits_of(key: &[u8; 32], depth: usize) -> Vec<bool> {
    (0..depth).map(|i| bit(key, i)).collect()
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (i, b) in bits.iter().enumerate() {
        if *b {
            out[i / 8] |= 1 << (7 - i % 8);
        }
    }
    out
}

fn unpack_bits(bytes: &[u8], len: usize) -> Vec<bool> {
    (0..len)
        .map(|i| (bytes[i / 8] >> (7 - i % 8)) & 1 == 1)
        .collect()
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) enum Node {
    Empty {
        prefix: Vec<bool>,
    },
    Interior {
        left: CryptoHash,
        right: CryptoHash,
    },
    Leaf {
        prefix: Vec<bool>,
        key: [u8; 32],
        value: Vec<u8>,
    },
}

impl Node {
    pub(crate) fn hash(&self, nonce: &Nonce) -> CryptoHash {
        let mut h = Sha256::new();
        match self {
            Node::Empty { prefix } => {
                h.update([TAG_EMPTY]);
                h.update(nonce.bytes());
                h.update((prefix.len() as u32).to_le_bytes());
                h.update(pack_bits(prefix));
            }
            Node::Interior { left, right } => {
                h.update([TAG_INTERIOR]);
                h.update(left.bytes());
                h.update(right.bytes());
            }
            Node::Leaf { prefix, key, value } => {
                h.update([TAG_LEAF]);
                h.update(nonce.bytes());
                h.update((prefix.len() as u32).to_le_bytes());
                h.update(pack_bits(prefix));
                h.update(key);
                h.update(value);
            }
        }
        CryptoHash::new(h.finalize().into())
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Node::Empty { prefix } => {
                out.push(TAG_EMPTY);
                out.extend_from_slice(&(prefix.len() as u32).to_le_bytes());
                out.extend_from_slice(&pack_bits(prefix));
            }
            Node::Interior { left, right } => {
                out.push(TAG_INTERIOR);
                out.extend_from_slice(&left.bytes());
                out.extend_from_slice(&right.bytes());
            }
            Node::Leaf { prefix, key, value } => {
                out.push(TAG_LEAF);
                out.extend_from_slice(&(prefix.len() as u32).to_le_bytes());
                out.extend_from_slice(&pack_bits(prefix));
                out.extend_from_slice(key);
                out.extend_from_slice(value);
            }
        }
        out
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> Result<Node, TrieError> {
        let (&tag, rest) = buf.split_first().ok_or(TrieError::MalformedNode)?;
        match tag {
            TAG_EMPTY => {
                let (len, rest) = read_u32(rest)?;
                let nbytes = (len as usize + 7) / 8;
                if rest.len() < nbytes {
                    return Err(TrieError::MalformedNode);
                }
                Ok(Node::Empty {
                    prefix: unpack_bits(rest, len as usize),
                })
            }
            TAG_INTERIOR => {
                if rest.len() != 64 {
                    return Err(TrieError::MalformedNode);
                }
                let mut left = [0u8; 32];
                let mut right = [0u8; 32];
                left.copy_from_slice(&rest[..32]);
                right.copy_from_slice(&rest[32..]);
                Ok(Node::Interior {
                    left: CryptoHash::new(left),
                    right: CryptoHash::new(right),
                })
            }
            TAG_LEAF => {
                let (len, rest) = read_u32(rest)?;
                let nbytes = (len as usize + 7) / 8;
                if rest.len() < nbytes + 32 {
                    return Err(TrieError::MalformedNode);
                }
                let prefix = unpack_bits(&rest[..nbytes], len as usize);
                let mut key = [0u8; 32];
                key.copy_from_slice(&rest[nbytes..nbytes + 32]);
                Ok(Node::Leaf {
                    prefix,
                    key,
                    value: rest[nbytes + 32..].to_vec(),
                })
            }
            _ => Err(TrieError::MalformedNode),
        }
    }
}

fn read_u32(buf: &[u8]) -> Result<(u32, &[u8]), TrieError> {
    if buf.len() < 4 {
        return Err(TrieError::MalformedNode);
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&buf[..4]);
    Ok((u32::from_le_bytes(len), &buf[4..]))
}

#[derive(Debug, PartialEq, Eq)]
pub enum TrieError {
    /// A node referenced along a path is not present in storage.
    MissingNode(CryptoHash),
    /// A stored node could not be decoded.
    MalformedNode,
    /// A trie already exists in this bucket.
    AlreadyExists,
    /// No trie exists in this bucket.
    NoTrie,
    /// The root after a verified commit did not match the expected root.
    RootMismatch {
        computed: CryptoHash,
        expected: CryptoHash,
    },
    /// A proof failed verification.
    InvalidProof,
}

impl Display for TrieError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TrieError::MissingNode(h) => write!(f, "trie node {} not found", h),
            TrieError::MalformedNode => write!(f, "malformed trie node"),
            TrieError::AlreadyExists => write!(f, "trie already exists in this bucket"),
            TrieError::NoTrie => write!(f, "no trie exists in this bucket"),
            TrieError::RootMismatch { computed, expected } => {
                write!(f, "root verification failed: {} != {}", computed, expected)
            }
            TrieError::InvalidProof => write!(f, "invalid proof"),
        }
    }
}

/// A copy-on-write overlay over the committed trie nodes in a bucket. See the module docs.
#[derive(Clone)]
pub struct StagingTrie<K: KVStore> {
    db: Bucket<K>,
    nonce: Nonce,
    root: CryptoHash,
    overlay: HashMap<CryptoHash, Option<Vec<u8>>>,
}

impl<K: KVStore> StagingTrie<K> {
    pub(crate) fn new(db: Bucket<K>, nonce: Nonce, root: CryptoHash) -> Self {
        Self {
            db,
            nonce,
            root,
            overlay: HashMap::new(),
        }
    }

    pub fn root(&self) -> CryptoHash {
        self.root
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    fn node(&self, hash: &CryptoHash) -> Result<Node, TrieError> {
        match self.overlay.get(hash) {
            Some(Some(bytes)) => Node::from_bytes(bytes),
            Some(None) => Err(TrieError::MissingNode(*hash)),
            None => match self.db.get(&hash.bytes()) {
                Some(bytes) => Node::from_bytes(&bytes),
                None => Err(TrieError::MissingNode(*hash)),
            },
        }
    }

    fn put_node(&mut self, node: Node) -> CryptoHash {
        let hash = node.hash(&self.nonce);
        self.overlay.insert(hash, Some(node.to_bytes()));
        hash
    }

    fn del_node(&mut self, hash: &CryptoHash) {
        self.overlay.insert(*hash, None);
    }

    fn put_interior(&mut self, left: CryptoHash, right: CryptoHash) -> CryptoHash {
        self.put_node(Node::Interior { left, right })
    }

    pub fn get(&self, key: &[u8; 32]) -> Result<Option<Vec<u8>>, TrieError> {
        let mut cursor = self.root;
        let mut depth = 0;
        loop {
            match self.node(&cursor)? {
                Node::Empty { .. } => return Ok(None),
                Node::Leaf { key: k2, value, .. } => {
                    return Ok(if &k2 == key { Some(value) } else { None })
                }
                Node::Interior { left, right } => {
                    cursor = if bit(key, depth) { right } else { left };
                    depth += 1;
                }
            }
        }
    }

    pub fn set(&mut self, key: &[u8; 32], value: &[u8]) -> Result<(), TrieError> {
        let root = self.root;
        self.root = self.insert_at(root, 0, key, value)?;
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8; 32]) -> Result<(), TrieError> {
        let root = self.root;
        self.root = self.delete_at(root, 0, key)?;
        Ok(())
    }

    fn insert_at(
        &mut self,
        node_hash: CryptoHash,
        depth: usize,
        key: &[u8; 32],
        value: &[u8],
    ) -> Result<CryptoHash, TrieError> {
        let node = self.node(&node_hash)?;
        match node {
            Node::Empty { prefix } => {
                self.del_node(&node_hash);
                Ok(self.put_node(Node::Leaf {
                    prefix,
                    key: *key,
                    value: value.to_vec(),
                }))
            }
            Node::Leaf {
                prefix,
                key: other_key,
                value: other_value,
            } => {
                self.del_node(&node_hash);
                if &other_key == key {
                    return Ok(self.put_node(Node::Leaf {
                        prefix,
                        key: *key,
                        value: value.to_vec(),
                    }));
                }
                // Split: descend until the keys' bits diverge, then hang both leaves off one
                // interior node and chain interiors (with empty siblings) back up to this depth.
                let mut diverge = depth;
                while bit(key, diverge) == bit(&other_key, diverge) {
                    diverge += 1;
                }
                let new_leaf = self.put_node(Node::Leaf {
                    prefix: bits_of(key, diverge + 1),
                    key: *key,
                    value: value.to_vec(),
                });
                let old_leaf = self.put_node(Node::Leaf {
                    prefix: bits_of(&other_key, diverge + 1),
                    key: other_key,
                    value: other_value,
                });
                let mut child = if bit(key, diverge) {
                    self.put_interior(old_leaf, new_leaf)
                } else {
                    self.put_interior(new_leaf, old_leaf)
                };
                for level in (depth..diverge).rev() {
                    let shared_bit = bit(key, level);
                    let mut empty_prefix = bits_of(key, level);
                    empty_prefix.push(!shared_bit);
                    let empty = self.put_node(Node::Empty {
                        prefix: empty_prefix,
                    });
                    child = if shared_bit {
                        self.put_interior(empty, child)
                    } else {
                        self.put_interior(child, empty)
                    };
                }
                Ok(child)
            }
            Node::Interior { left, right } => {
                self.del_node(&node_hash);
                if bit(key, depth) {
                    let new_right = self.insert_at(right, depth + 1, key, value)?;
                    Ok(self.put_interior(left, new_right))
                } else {
                    let new_left = self.insert_at(left, depth + 1, key, value)?;
                    Ok(self.put_interior(new_left, right))
                }
            }
        }
    }

    fn delete_at(
        &mut self,
        node_hash: CryptoHash,
        depth: usize,
        key: &[u8; 32],
    ) -> Result<CryptoHash, TrieError> {
        let node = self.node(&node_hash)?;
        match node {
            Node::Empty { .. } => Ok(node_hash),
            Node::Leaf {
                prefix,
                key: other_key,
                ..
            } => {
                if &other_key == key {
                    self.del_node(&node_hash);
                    Ok(self.put_node(Node::Empty { prefix }))
                } else {
                    Ok(node_hash)
                }
            }
            Node::Interior { left, right } => {
                let (old_child, sibling, goes_right) = if bit(key, depth) {
                    (right, left, true)
                } else {
                    (left, right, false)
                };
                let new_child = self.delete_at(old_child, depth + 1, key)?;
                if new_child == old_child {
                    return Ok(node_hash);
                }
                self.del_node(&node_hash);
                // Keep the trie shape canonical: an interior node whose children have collapsed
                // to a single leaf (or nothing) is itself collapsed, so the shape stays a pure
                // function of the current key set.
                let new_child_node = self.node(&new_child)?;
                let sibling_node = self.node(&sibling)?;
                match (&new_child_node, &sibling_node) {
                    (Node::Empty { .. }, Node::Empty { .. }) => {
                        self.del_node(&new_child);
                        self.del_node(&sibling);
                        Ok(self.put_node(Node::Empty {
                            prefix: bits_of(key, depth),
                        }))
                    }
                    (Node::Empty { .. }, Node::Leaf { key: k2, value, .. }) => {
                        let (k2, value) = (*k2, value.clone());
                        self.del_node(&new_child);
                        self.del_node(&sibling);
                        Ok(self.put_node(Node::Leaf {
                            prefix: bits_of(&k2, depth),
                            key: k2,
                            value,
                        }))
                    }
                    (Node::Leaf { key: k2, value, .. }, Node::Empty { .. }) => {
                        let (k2, value) = (*k2, value.clone());
                        self.del_node(&new_child);
                        self.del_node(&sibling);
                        Ok(self.put_node(Node::Leaf {
                            prefix: bits_of(&k2, depth),
                            key: k2,
                            value,
                        }))
                    }
                    _ => Ok(if goes_right {
                        self.put_interior(sibling, new_child)
                    } else {
                        self.put_interior(new_child, sibling)
                    }),
                }
            }
        }
    }

    /// Produce an inclusion or absence proof for a key.
    pub fn proof(&self, key: &[u8; 32]) -> Result<Proof, TrieError> {
        let mut interiors = Vec::new();
        let mut cursor = self.root;
        let mut depth = 0;
        loop {
            match self.node(&cursor)? {
                Node::Empty { prefix } => {
                    return Ok(Proof {
                        nonce: self.nonce,
                        interiors,
                        terminal: TerminalNode::Empty { prefix },
                        key: *key,
                    })
                }
                Node::Leaf { prefix, key: k2, value } => {
                    return Ok(Proof {
                        nonce: self.nonce,
                        interiors,
                        terminal: TerminalNode::Leaf {
                            prefix,
                            key: k2,
                            value,
                        },
                        key: *key,
                    })
                }
                Node::Interior { left, right } => {
                    interiors.push((left, right));
                    cursor = if bit(key, depth) { right } else { left };
                    depth += 1;
                }
            }
        }
    }

    /// Visit every key/value pair, in ascending key order.
    pub fn for_each<F: FnMut(&[u8; 32], &[u8])>(&self, f: &mut F) -> Result<(), TrieError> {
        self.for_each_at(self.root, f)
    }

    fn for_each_at<F: FnMut(&[u8; 32], &[u8])>(
        &self,
        node_hash: CryptoHash,
        f: &mut F,
    ) -> Result<(), TrieError> {
        match self.node(&node_hash)? {
            Node::Empty { .. } => Ok(()),
            Node::Leaf { key, value, .. } => {
                f(&key, &value);
                Ok(())
            }
            Node::Interior { left, right } => {
                self.for_each_at(left, f)?;
                self.for_each_at(right, f)
            }
        }
    }

    /// Extract the staged node operations (keyed by node hash) and the resulting root. Consumes
    /// the overlay; the caller commits the operations atomically.
    pub fn into_ops(self) -> (CryptoHash, Vec<(Vec<u8>, Option<Vec<u8>>)>) {
        let ops = self
            .overlay
            .into_iter()
            .map(|(hash, value)| (hash.bytes().to_vec(), value))
            .collect();
        (self.root, ops)
    }
}

impl StagingTrie<super::kv::MemKVStore> {
    /// A staging trie over a fresh, empty in-memory trie. Used to execute the genesis block
    /// before any state exists on disk.
    pub fn in_memory(nonce: Nonce) -> Self {
        let db = Bucket::new(
            super::kv::MemKVStore::new(),
            &crate::types::basic::ChainId::new([0u8; 32]),
        );
        let mut trie = StagingTrie {
            db,
            nonce,
            root: CryptoHash::zero(),
            overlay: HashMap::new(),
        };
        trie.root = trie.put_node(Node::Empty { prefix: Vec::new() });
        trie
    }
}

/// A terminal node of a proof path: what sits at the end of the key's path.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub enum TerminalNode {
    Empty {
        prefix: Vec<bool>,
    },
    Leaf {
        prefix: Vec<bool>,
        key: [u8; 32],
        value: Vec<u8>,
    },
}

impl TerminalNode {
    fn prefix_len(&self) -> usize {
        match self {
            TerminalNode::Empty { prefix } => prefix.len(),
            TerminalNode::Leaf { prefix, .. } => prefix.len(),
        }
    }

    fn prefix_bit(&self, i: usize) -> bool {
        match self {
            TerminalNode::Empty { prefix } => prefix[i],
            TerminalNode::Leaf { prefix, .. } => prefix[i],
        }
    }

    fn hash(&self, nonce: &Nonce) -> CryptoHash {
        let node = match self {
            TerminalNode::Empty { prefix } => Node::Empty {
                prefix: prefix.clone(),
            },
            TerminalNode::Leaf { prefix, key, value } => Node::Leaf {
                prefix: prefix.clone(),
                key: *key,
                value: value.clone(),
            },
        };
        node.hash(nonce)
    }
}

/// What a verified proof asserts about its key.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ProofResult {
    Present(Vec<u8>),
    Absent,
}

/// A verifiable path through the trie: the interior child-hash pairs from the root down, plus the
/// terminal node. Proves either the presence of `key` with a specific value, or its absence.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Proof {
    pub nonce: Nonce,
    pub interiors: Vec<(CryptoHash, CryptoHash)>,
    pub terminal: TerminalNode,
    pub key: [u8; 32],
}

impl Proof {
    /// Verify this proof against a trie root.
    pub fn verify(&self, expected_root: &CryptoHash) -> Result<ProofResult, TrieError> {
        let depth = self.interiors.len();
        if self.terminal.prefix_len() != depth {
            return Err(TrieError::InvalidProof);
        }
        for i in 0..depth {
            if self.terminal.prefix_bit(i) != bit(&self.key, i) {
                return Err(TrieError::InvalidProof);
            }
        }
        let mut hash = self.terminal.hash(&self.nonce);
        for (i, (left, right)) in self.interiors.iter().enumerate().rev() {
            let child = if bit(&self.key, i) { right } else { left };
            if *child != hash {
                return Err(TrieError::InvalidProof);
            }
            let mut h = Sha256::new();
            h.update([TAG_INTERIOR]);
            h.update(left.bytes());
            h.update(right.bytes());
            hash = CryptoHash::new(h.finalize().into());
        }
        if hash != *expected_root {
            return Err(TrieError::InvalidProof);
        }
        Ok(match &self.terminal {
            TerminalNode::Leaf { key, value, .. } if key == &self.key => {
                ProofResult::Present(value.clone())
            }
            _ => ProofResult::Absent,
        })
    }

    /// The key/value pair of the terminal leaf, if the terminal is a leaf for the proven key.
    pub fn key_value(&self) -> Option<(&[u8; 32], &[u8])> {
        match &self.terminal {
            TerminalNode::Leaf { key, value, .. } if key == &self.key => {
                Some((key, value.as_slice()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::kv::MemKVStore;

    fn fresh() -> StagingTrie<MemKVStore> {
        StagingTrie::<MemKVStore>::in_memory(Nonce::new([9u8; 32]))
    }

    fn key(b: u8) -> [u8; 32] {
        [b; 32]
    }

    #[test]
    fn set_get_delete() {
        let mut trie = fresh();
        assert_eq!(trie.get(&key(1)).unwrap(), None);

        trie.set(&key(1), b"one").unwrap();
        trie.set(&key(2), b"two").unwrap();
        assert_eq!(trie.get(&key(1)).unwrap(), Some(b"one".to_vec()));
        assert_eq!(trie.get(&key(2)).unwrap(), Some(b"two".to_vec()));

        trie.set(&key(1), b"uno").unwrap();
        assert_eq!(trie.get(&key(1)).unwrap(), Some(b"uno".to_vec()));

        trie.delete(&key(1)).unwrap();
        assert_eq!(trie.get(&key(1)).unwrap(), None);
        assert_eq!(trie.get(&key(2)).unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn root_is_deterministic_and_order_independent_content() {
        let mut a = fresh();
        a.set(&key(1), b"one").unwrap();
        a.set(&key(2), b"two").unwrap();
        a.set(&key(3), b"three").unwrap();

        let mut b = fresh();
        b.set(&key(3), b"three").unwrap();
        b.set(&key(1), b"one").unwrap();
        b.set(&key(2), b"two").unwrap();

        assert_eq!(a.root(), b.root());

        b.set(&key(2), b"other").unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn nonce_seeds_the_root() {
        let a = StagingTrie::<MemKVStore>::in_memory(Nonce::new([1u8; 32]));
        let b = StagingTrie::<MemKVStore>::in_memory(Nonce::new([2u8; 32]));
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn delete_restores_previous_root() {
        let mut trie = fresh();
        trie.set(&key(1), b"one").unwrap();
        let before = trie.root();
        trie.set(&key(2), b"two").unwrap();
        trie.delete(&key(2)).unwrap();
        assert_eq!(trie.root(), before);
    }

    #[test]
    fn clone_isolates_changes() {
        let mut trie = fresh();
        trie.set(&key(1), b"one").unwrap();

        let mut fork = trie.clone();
        fork.set(&key(2), b"two").unwrap();

        assert_eq!(trie.get(&key(2)).unwrap(), None);
        assert_eq!(fork.get(&key(2)).unwrap(), Some(b"two".to_vec()));
        assert_ne!(trie.root(), fork.root());
    }

    #[test]
    fn proofs_of_presence_and_absence() {
        let mut trie = fresh();
        for b in [1u8, 2, 3, 0x81] {
            trie.set(&key(b), format!("value-{}", b).as_bytes()).unwrap();
        }
        let root = trie.root();

        let proof = trie.proof(&key(2)).unwrap();
        assert_eq!(
            proof.verify(&root).unwrap(),
            ProofResult::Present(b"value-2".to_vec())
        );
        assert_eq!(proof.key_value().unwrap().1, b"value-2");

        let absent = trie.proof(&key(7)).unwrap();
        assert_eq!(absent.verify(&root).unwrap(), ProofResult::Absent);
        assert!(absent.key_value().is_none());

        // A proof does not verify against another root.
        let mut other = trie.clone();
        other.set(&key(9), b"nine").unwrap();
        assert!(proof.verify(&other.root()).is_err());
    }

    #[test]
    fn tampered_proof_rejected() {
        let mut trie = fresh();
        trie.set(&key(1), b"one").unwrap();
        trie.set(&key(2), b"two").unwrap();
        let root = trie.root();

        let mut proof = trie.proof(&key(1)).unwrap();
        if let TerminalNode::Leaf { value, .. } = &mut proof.terminal {
            *value = b"forged".to_vec();
        }
        assert!(proof.verify(&root).is_err());
    }

    #[test]
    fn for_each_visits_in_key_order() {
        let mut trie = fresh();
        for b in [5u8, 1, 9, 3] {
            trie.set(&key(b), &[b]).unwrap();
        }
        let mut seen = Vec::new();
        trie.for_each(&mut |k, _| seen.push(k[0])).unwrap();
        assert_eq!(seen, vec![1, 3, 5, 9]);
    }

    #[test]
    fn proof_round_trips_through_borsh() {
        let mut trie = fresh();
        trie.set(&key(1), b"one").unwrap();
        let proof = trie.proof(&key(1)).unwrap();
        let bytes = proof.try_to_vec().unwrap();
        let decoded = Proof::try_from_slice(&bytes).unwrap();
        assert_eq!(proof, decoded);
    }
}
