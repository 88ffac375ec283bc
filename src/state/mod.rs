/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The authenticated state of a chain.
//!
//! [kv] defines the [KVStore](kv::KVStore) trait family that backs persistence; [trie] implements
//! the nonce-seeded binary Merkle trie over 32-byte keys, including proofs and the copy-on-write
//! staging overlay; [store] wraps the trie into the ledger-facing
//! [StateTrie](store::StateTrie)/[StagingStateTrie](store::StagingStateTrie) pair that stores
//! state change bodies and the applied block index.

pub mod kv;

pub mod trie;

pub mod store;

pub use kv::{Bucket, KVGet, KVStore, MemKVStore, WriteBatch};
pub use store::{ReadOnlyStateTrie, StagingStateTrie, StateEntry, StateTrie};
pub use trie::{Proof, ProofResult, TrieError};
