/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The ledger-facing wrappers around the Merkle trie.
//!
//! A [StateTrie] is the committed, persistent trie of one chain: its bucket holds the trie nodes
//! plus three metadata entries (the nonce, the root, and the index of the last applied block).
//! A [StagingStateTrie] is the copy-on-write overlay used for all speculative execution: block
//! building, block verification and recovery all run on one.
//!
//! Values stored under an instance ID are serialized [StateChangeBody]s; [get_values]
//! (ReadOnlyStateTrie::get_values) decodes them into a [StateEntry].

use std::fmt::{self, Display, Formatter};

use super::kv::{Bucket, KVStore, MemKVStore};
use super::trie::{Proof, StagingTrie, TrieError};
use crate::types::basic::{BlockIndex, CryptoHash, InstanceId, Nonce};
use crate::types::transaction::{StateAction, StateChange, StateChangeBody};

/// Metadata keys inside a chain's bucket. Trie nodes are stored under their 32-byte hashes, so
/// these short names cannot collide with them.
const NONCE_KEY: &[u8] = b"nonce";
const ROOT_KEY: &[u8] = b"root";
const TRIE_INDEX_KEY: &[u8] = b"trieIndexKey";

/// The decoded value stored under an instance ID.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StateEntry {
    pub value: Vec<u8>,
    pub version: u64,
    pub contract_id: String,
    pub darc_id: crate::darc::DarcId,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StateTrieError {
    /// The key is not set in the trie.
    KeyNotSet,
    /// The stored value could not be decoded into a state change body.
    MalformedBody,
    Trie(TrieError),
}

impl Display for StateTrieError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StateTrieError::KeyNotSet => write!(f, "key not set"),
            StateTrieError::MalformedBody => write!(f, "malformed state change body"),
            StateTrieError::Trie(e) => write!(f, "{}", e),
        }
    }
}

impl From<TrieError> for StateTrieError {
    fn from(e: TrieError) -> Self {
        StateTrieError::Trie(e)
    }
}

/// The read-only interface shared by [StateTrie] and [StagingStateTrie]. Contracts and the
/// executor only ever see this.
pub trait ReadOnlyStateTrie {
    /// The raw bytes stored under a key, if any.
    fn get_raw(&self, key: &InstanceId) -> Result<Option<Vec<u8>>, StateTrieError>;

    /// The index of the last applied block. None on a staging trie or a trie that has not applied
    /// any block yet.
    fn get_index(&self) -> Option<BlockIndex>;

    fn get_nonce(&self) -> Nonce;

    /// Visit every key/value pair in ascending key order.
    fn for_each(&self, f: &mut dyn FnMut(&InstanceId, &[u8])) -> Result<(), StateTrieError>;

    /// The decoded value, version, contract ID and DARC ID stored under a key.
    fn get_values(&self, key: &InstanceId) -> Result<StateEntry, StateTrieError> {
        let buf = self.get_raw(key)?.ok_or(StateTrieError::KeyNotSet)?;
        let body =
            StateChangeBody::from_bytes(&buf).map_err(|_| StateTrieError::MalformedBody)?;
        Ok(StateEntry {
            value: body.value,
            version: body.version,
            contract_id: body.contract_id,
            darc_id: body.darc_id,
        })
    }
}

/// The committed state trie of one chain.
#[derive(Clone)]
pub struct StateTrie<K: KVStore> {
    db: Bucket<K>,
    nonce: Nonce,
}

impl<K: KVStore> StateTrie<K> {
    /// Create a fresh trie in the bucket, seeded with the nonce. Fails if the bucket already
    /// holds one.
    pub fn create(mut db: Bucket<K>, nonce: Nonce) -> Result<StateTrie<K>, TrieError> {
        if db.get(ROOT_KEY).is_some() {
            return Err(TrieError::AlreadyExists);
        }
        let staging = StagingTrie::in_memory(nonce);
        let (root, mut ops) = staging.into_ops();
        ops.push((NONCE_KEY.to_vec(), Some(nonce.bytes().to_vec())));
        ops.push((ROOT_KEY.to_vec(), Some(root.bytes().to_vec())));
        db.write(ops);
        Ok(StateTrie { db, nonce })
    }

    /// Load the trie that exists in the bucket. Fails if none does.
    pub fn load(db: Bucket<K>) -> Result<StateTrie<K>, TrieError> {
        let nonce = db.get(NONCE_KEY).ok_or(TrieError::NoTrie)?;
        if db.get(ROOT_KEY).is_none() {
            return Err(TrieError::NoTrie);
        }
        Ok(StateTrie {
            db,
            nonce: Nonce::from_slice(&nonce),
        })
    }

    pub fn root(&self) -> CryptoHash {
        let bytes = self
            .db
            .get(ROOT_KEY)
            .expect("a loaded state trie always has a root");
        let mut root = [0u8; 32];
        root.copy_from_slice(&bytes);
        CryptoHash::new(root)
    }

    /// A staging overlay positioned at the current root.
    pub fn staging(&self) -> StagingStateTrie<K> {
        StagingStateTrie {
            trie: StagingTrie::new(self.db.clone(), self.nonce, self.root()),
            nonce: self.nonce,
        }
    }

    pub fn get_proof(&self, key: &InstanceId) -> Result<Proof, TrieError> {
        self.staging().trie.proof(&key.bytes())
    }

    /// Apply state changes and set the block index, without checking the resulting root.
    pub fn commit(&mut self, scs: &[StateChange], index: BlockIndex) -> Result<(), TrieError> {
        self.commit_inner(scs, index, None)
    }

    /// Apply state changes and set the block index, but only if the resulting root equals
    /// `expected_root`; otherwise fail without writing anything.
    pub fn verified_commit(
        &mut self,
        scs: &[StateChange],
        index: BlockIndex,
        expected_root: &CryptoHash,
    ) -> Result<(), TrieError> {
        self.commit_inner(scs, index, Some(expected_root))
    }

    fn commit_inner(
        &mut self,
        scs: &[StateChange],
        index: BlockIndex,
        expected_root: Option<&CryptoHash>,
    ) -> Result<(), TrieError> {
        let mut staging = self.staging();
        staging.store_all(scs)?;
        let (root, mut ops) = staging.trie.into_ops();
        if let Some(expected) = expected_root {
            if root != *expected {
                return Err(TrieError::RootMismatch {
                    computed: root,
                    expected: *expected,
                });
            }
        }
        ops.push((ROOT_KEY.to_vec(), Some(root.bytes().to_vec())));
        ops.push((
            TRIE_INDEX_KEY.to_vec(),
            Some((index.int() as u32).to_le_bytes().to_vec()),
        ));
        self.db.write(ops);
        Ok(())
    }

    /// The raw bucket entries (nodes and metadata), for full-state download.
    pub fn raw_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.db.entries()
    }
}

impl<K: KVStore> ReadOnlyStateTrie for StateTrie<K> {
    fn get_raw(&self, key: &InstanceId) -> Result<Option<Vec<u8>>, StateTrieError> {
        Ok(self.staging().trie.get(&key.bytes())?)
    }

    fn get_index(&self) -> Option<BlockIndex> {
        let buf = self.db.get(TRIE_INDEX_KEY)?;
        let bytes: [u8; 4] = buf.try_into().ok()?;
        Some(BlockIndex::new(u32::from_le_bytes(bytes) as u64))
    }

    fn get_nonce(&self) -> Nonce {
        self.nonce
    }

    fn for_each(&self, f: &mut dyn FnMut(&InstanceId, &[u8])) -> Result<(), StateTrieError> {
        self.staging()
            .trie
            .for_each(&mut |k, v| f(&InstanceId::new(*k), v))?;
        Ok(())
    }
}

/// A staging overlay storing [StateChange]s over a [StateTrie]. Cloning is cheap (only the
/// overlay is copied), which is what per-transaction speculative execution relies on.
#[derive(Clone)]
pub struct StagingStateTrie<K: KVStore> {
    pub(crate) trie: StagingTrie<K>,
    nonce: Nonce,
}

impl StagingStateTrie<MemKVStore> {
    /// An in-memory staging trie with no backing chain, seeded with the nonce. Used for genesis
    /// execution.
    pub fn in_memory(nonce: Nonce) -> Self {
        StagingStateTrie {
            trie: StagingTrie::in_memory(nonce),
            nonce,
        }
    }
}

impl<K: KVStore> StagingStateTrie<K> {
    pub fn root(&self) -> CryptoHash {
        self.trie.root()
    }

    /// Apply a batch of state changes to the staging area.
    pub fn store_all(&mut self, scs: &[StateChange]) -> Result<(), TrieError> {
        for sc in scs {
            match sc.action {
                StateAction::Create | StateAction::Update => {
                    self.trie.set(&sc.key().bytes(), &sc.body().to_bytes())?
                }
                StateAction::Remove => self.trie.delete(&sc.key().bytes())?,
            }
        }
        Ok(())
    }
}

impl<K: KVStore> ReadOnlyStateTrie for StagingStateTrie<K> {
    fn get_raw(&self, key: &InstanceId) -> Result<Option<Vec<u8>>, StateTrieError> {
        Ok(self.trie.get(&key.bytes())?)
    }

    fn get_index(&self) -> Option<BlockIndex> {
        None
    }

    fn get_nonce(&self) -> Nonce {
        self.nonce
    }

    fn for_each(&self, f: &mut dyn FnMut(&InstanceId, &[u8])) -> Result<(), StateTrieError> {
        self.trie.for_each(&mut |k, v| f(&InstanceId::new(*k), v))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::darc::DarcId;
    use crate::state::kv::Bucket;
    use crate::types::basic::ChainId;

    fn sc(action: StateAction, id: u8, value: &[u8], version: u64) -> StateChange {
        let mut change = StateChange::new(
            action,
            InstanceId::new([id; 32]),
            "test",
            value.to_vec(),
            DarcId::new([0xdd; 32]),
        );
        change.version = version;
        change
    }

    fn fresh() -> StateTrie<MemKVStore> {
        let bucket = Bucket::new(MemKVStore::new(), &ChainId::new([0xaa; 32]));
        StateTrie::create(bucket, Nonce::new([7u8; 32])).unwrap()
    }

    #[test]
    fn create_then_load() {
        let store = MemKVStore::new();
        let chain = ChainId::new([0xaa; 32]);
        let trie = StateTrie::create(Bucket::new(store.clone(), &chain), Nonce::new([7u8; 32]))
            .unwrap();
        assert!(
            StateTrie::create(Bucket::new(store.clone(), &chain), Nonce::new([7u8; 32])).is_err()
        );
        let loaded = StateTrie::load(Bucket::new(store, &chain)).unwrap();
        assert_eq!(trie.root(), loaded.root());
        assert_eq!(loaded.get_index(), None);
    }

    #[test]
    fn commit_sets_index_and_values() {
        let mut trie = fresh();
        trie.commit(&[sc(StateAction::Create, 1, b"one", 0)], BlockIndex::new(0))
            .unwrap();

        assert_eq!(trie.get_index(), Some(BlockIndex::new(0)));
        let entry = trie.get_values(&InstanceId::new([1u8; 32])).unwrap();
        assert_eq!(entry.value, b"one");
        assert_eq!(entry.version, 0);
        assert_eq!(entry.contract_id, "test");
    }

    #[test]
    fn verified_commit_rejects_wrong_root_atomically() {
        let mut trie = fresh();
        let before = trie.root();
        let err = trie.verified_commit(
            &[sc(StateAction::Create, 1, b"one", 0)],
            BlockIndex::new(0),
            &CryptoHash::new([0xff; 32]),
        );
        assert!(matches!(err, Err(TrieError::RootMismatch { .. })));
        // Nothing was written.
        assert_eq!(trie.root(), before);
        assert_eq!(trie.get_index(), None);
        assert_eq!(
            trie.get_values(&InstanceId::new([1u8; 32])).unwrap_err(),
            StateTrieError::KeyNotSet
        );
    }

    #[test]
    fn verified_commit_accepts_matching_root() {
        let mut trie = fresh();
        let mut staging = trie.staging();
        let changes = [sc(StateAction::Create, 1, b"one", 0)];
        staging.store_all(&changes).unwrap();
        let expected = staging.root();

        trie.verified_commit(&changes, BlockIndex::new(0), &expected)
            .unwrap();
        assert_eq!(trie.root(), expected);
    }

    #[test]
    fn staging_changes_invisible_until_commit() {
        let trie = fresh();
        let mut staging = trie.staging();
        staging
            .store_all(&[sc(StateAction::Create, 1, b"one", 0)])
            .unwrap();
        assert!(staging.get_values(&InstanceId::new([1u8; 32])).is_ok());
        assert_eq!(
            trie.get_values(&InstanceId::new([1u8; 32])).unwrap_err(),
            StateTrieError::KeyNotSet
        );
    }

    #[test]
    fn proof_against_committed_root() {
        let mut trie = fresh();
        trie.commit(&[sc(StateAction::Create, 1, b"one", 0)], BlockIndex::new(0))
            .unwrap();
        let proof = trie.get_proof(&InstanceId::new([1u8; 32])).unwrap();
        assert!(proof.verify(&trie.root()).is_ok());
        assert!(proof.key_value().is_some());
    }

    #[test]
    fn raw_entries_rebuild_identical_trie() {
        let mut trie = fresh();
        trie.commit(
            &[
                sc(StateAction::Create, 1, b"one", 0),
                sc(StateAction::Create, 2, b"two", 0),
            ],
            BlockIndex::new(0),
        )
        .unwrap();

        // Copy the raw pages into a different backing store, as a full-state download does.
        let other_store = MemKVStore::new();
        let mut other_bucket = Bucket::new(other_store.clone(), &ChainId::new([0xaa; 32]));
        for (k, v) in trie.raw_entries() {
            other_bucket.put_raw(&k, &v);
        }
        let rebuilt = StateTrie::load(other_bucket).unwrap();
        assert_eq!(rebuilt.root(), trie.root());
        assert_eq!(rebuilt.get_index(), trie.get_index());
        let entry = rebuilt.get_values(&InstanceId::new([2u8; 32])).unwrap();
        assert_eq!(entry.value, b"two");
    }
}
