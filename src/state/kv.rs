/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definitions for the pluggable key-value store that backs the state tries, an in-memory
//! implementation, and the per-chain bucket layout.
//!
//! The service keeps one *bucket* per chain, named `ByzCoin_<chain id hex>`, holding the trie's
//! internal pages plus its metadata entries. Buckets are realized as key prefixes over the
//! underlying store, so a full-state download can copy a bucket entry by entry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::types::basic::ChainId;

/// A key-value store provided by the library user. Writes are applied atomically through a
/// [WriteBatch]. Cloning must yield a handle onto the same underlying data.
pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    fn write(&mut self, wb: Self::WriteBatch);

    /// Delete every entry whose key starts with the given prefix.
    fn clear_prefix(&mut self, prefix: &[u8]);
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// All entries whose key starts with the given prefix, in ascending key order.
    fn prefix_entries(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// An in-memory [KVStore] over a BTreeMap, so prefix iteration is ordered. Used by the test
/// suites; deployments plug in a durable store.
#[derive(Clone)]
pub struct MemKVStore(Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>);

impl MemKVStore {
    pub fn new() -> MemKVStore {
        MemKVStore(Arc::new(Mutex::new(BTreeMap::new())))
    }
}

impl Default for MemKVStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KVStore for MemKVStore {
    type WriteBatch = MemWriteBatch;

    fn write(&mut self, wb: MemWriteBatch) {
        let mut map = self.0.lock().unwrap();
        for (key, value) in wb.ops {
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }

    fn clear_prefix(&mut self, prefix: &[u8]) {
        let mut map = self.0.lock().unwrap();
        let keys: Vec<Vec<u8>> = map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            map.remove(&key);
        }
    }
}

impl KVGet for MemKVStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }

    fn prefix_entries(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.0
            .lock()
            .unwrap()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A write batch that preserves operation order, so a set and a delete of the same key within one
/// batch resolve to whichever came last.
pub struct MemWriteBatch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch { ops: Vec::new() }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push((key.to_vec(), Some(value.to_vec())));
    }

    fn delete(&mut self, key: &[u8]) {
        self.ops.push((key.to_vec(), None));
    }
}

/// The name of the bucket holding a chain's trie: `ByzCoin_<chain id hex>`.
pub fn bucket_name(chain_id: &ChainId) -> Vec<u8> {
    format!("ByzCoin_{}", chain_id.hex()).into_bytes()
}

/// Returns whether a key names a ByzCoin bucket: `ByzCoin_` followed by lowercase hex.
pub fn is_bucket_name(name: &[u8]) -> bool {
    let Some(rest) = name.strip_prefix(b"ByzCoin_") else {
        return false;
    };
    !rest.is_empty() && rest.iter().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
}

/// A view of a [KVStore] restricted to one bucket: every key is transparently prefixed with the
/// bucket name.
#[derive(Clone)]
pub struct Bucket<K: KVStore> {
    inner: K,
    prefix: Vec<u8>,
}

impl<K: KVStore> Bucket<K> {
    pub fn new(inner: K, chain_id: &ChainId) -> Bucket<K> {
        Bucket {
            inner,
            prefix: bucket_name(chain_id),
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.prefix
    }

    fn prefixed(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + key.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(key);
        out
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.get(&self.prefixed(key))
    }

    /// All entries of the bucket, with the bucket prefix stripped, in ascending key order.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inner
            .prefix_entries(&self.prefix)
            .into_iter()
            .map(|(k, v)| (k[self.prefix.len()..].to_vec(), v))
            .collect()
    }

    pub fn write(&mut self, ops: Vec<(Vec<u8>, Option<Vec<u8>>)>) {
        let mut wb = K::WriteBatch::new();
        for (key, value) in ops {
            let key = self.prefixed(&key);
            match value {
                Some(value) => wb.set(&key, &value),
                None => wb.delete(&key),
            }
        }
        self.inner.write(wb);
    }

    /// Store a raw entry, as received from a full-state download.
    pub fn put_raw(&mut self, key: &[u8], value: &[u8]) {
        let mut wb = K::WriteBatch::new();
        wb.set(&self.prefixed(key), value);
        self.inner.write(wb);
    }

    /// Delete the whole bucket.
    pub fn clear(&mut self) {
        self.inner.clear_prefix(&self.prefix.clone());
    }
}

/// Key under which the database format version is stored, outside any bucket.
const DB_VERSION_KEY: &[u8] = b"__byzcoin_db_version";

#[derive(Debug, PartialEq, Eq)]
pub enum DbVersionError {
    /// The database carries buckets from a version we cannot migrate.
    TooOld,
    /// The stored version number is not one this build understands.
    Unknown(u32),
}

impl std::fmt::Display for DbVersionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbVersionError::TooOld => write!(
                f,
                "database format is too old; remove it to lose all data and make a new database"
            ),
            DbVersionError::Unknown(v) => write!(f, "unknown db version number {}", v),
        }
    }
}

/// The migration gate: a store whose version metadata is 0 (unset) while `ByzCoin_*` buckets
/// already exist must be refused. Otherwise the version is stamped to 1.
pub fn check_db_version<K: KVStore>(store: &mut K) -> Result<(), DbVersionError> {
    let version = store
        .get(DB_VERSION_KEY)
        .and_then(|buf| buf.try_into().ok().map(u32::from_le_bytes))
        .unwrap_or(0);
    match version {
        0 => {
            let has_buckets = store
                .prefix_entries(b"ByzCoin_")
                .iter()
                .any(|(k, _)| is_bucket_name(&k[..k.len().min(8 + 64)]));
            if has_buckets {
                return Err(DbVersionError::TooOld);
            }
            let mut wb = K::WriteBatch::new();
            wb.set(DB_VERSION_KEY, &1u32.to_le_bytes());
            store.write(wb);
            Ok(())
        }
        1 => Ok(()),
        other => Err(DbVersionError::Unknown(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_prefixing_is_transparent() {
        let store = MemKVStore::new();
        let chain = ChainId::new([0xabu8; 32]);
        let mut bucket = Bucket::new(store.clone(), &chain);
        bucket.write(vec![(b"key".to_vec(), Some(b"value".to_vec()))]);

        assert_eq!(bucket.get(b"key"), Some(b"value".to_vec()));
        assert_eq!(store.get(b"key"), None);

        let other = Bucket::new(store, &ChainId::new([0xcdu8; 32]));
        assert_eq!(other.get(b"key"), None);
    }

    #[test]
    fn bucket_names() {
        assert!(is_bucket_name(b"ByzCoin_0a1b"));
        assert!(!is_bucket_name(b"ByzCoin_"));
        assert!(!is_bucket_name(b"ByzCoin_0A1B"));
        assert!(!is_bucket_name(b"Other_0a1b"));
    }

    #[test]
    fn version_gate_refuses_unstamped_buckets() {
        let mut store = MemKVStore::new();
        let chain = ChainId::new([1u8; 32]);
        let mut bucket = Bucket::new(store.clone(), &chain);
        bucket.write(vec![(b"node".to_vec(), Some(b"x".to_vec()))]);

        assert_eq!(check_db_version(&mut store), Err(DbVersionError::TooOld));
    }

    #[test]
    fn version_gate_stamps_fresh_database() {
        let mut store = MemKVStore::new();
        check_db_version(&mut store).unwrap();
        // Buckets created after stamping are fine.
        let chain = ChainId::new([1u8; 32]);
        let mut bucket = Bucket::new(store.clone(), &chain);
        bucket.write(vec![(b"node".to_vec(), Some(b"x".to_vec()))]);
        check_db_version(&mut store).unwrap();
    }
}
