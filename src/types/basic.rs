/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Inert newtypes used throughout the crate.
//!
//! These follow the newtype pattern: each wraps a primitive representation and exposes a small,
//! deliberate API instead of the raw value.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// Output of the crate-wide hash function (SHA-256). Identifies transactions, blocks and trie
/// roots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// Identifier of a block: the hash of its header fields.
pub type BlockId = CryptoHash;

/// Identifier of a chain: the hash of its genesis block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct ChainId([u8; 32]);

impl ChainId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl From<BlockId> for ChainId {
    fn from(id: BlockId) -> Self {
        Self(id.bytes())
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl Debug for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// Unique identifier of one instance of a contract. The all-zero instance ID names the chain
/// configuration instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct InstanceId([u8; 32]);

/// The instance ID under which the chain configuration is stored.
pub const CONFIG_INSTANCE_ID: InstanceId = InstanceId([0u8; 32]);

impl InstanceId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn slice(&self) -> &[u8] {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Seed of the state trie's authenticated hashing. Fixed 32 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Nonce([u8; 32]);

impl Nonce {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Converts a byte slice into a Nonce. A slice that is not exactly 32 bytes long yields the
    /// zero nonce.
    pub fn from_slice(buf: &[u8]) -> Self {
        if buf.len() != 32 {
            return Self([0u8; 32]);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(buf);
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

/// Position of a block in its chain. The genesis block has index 0.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BlockIndex(u64);

impl BlockIndex {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for BlockIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for BlockIndex {
    type Output = BlockIndex;
    fn add(self, rhs: u64) -> Self::Output {
        BlockIndex(self.0 + rhs)
    }
}

impl AddAssign<u64> for BlockIndex {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs
    }
}

impl Sub<BlockIndex> for BlockIndex {
    type Output = u64;
    fn sub(self, rhs: BlockIndex) -> Self::Output {
        self.0 - rhs.0
    }
}

/// A point in time, as nanoseconds since the Unix epoch. Block headers carry one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn now() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self(nanos)
    }

    pub const fn nanos(&self) -> u64 {
        self.0
    }

    /// The absolute difference between two timestamps, as a Duration.
    pub fn abs_diff(&self, other: Timestamp) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.abs_diff(other.0))
    }
}

/// Identity of a node in a roster: the bytes of its Ed25519 public key.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize,
)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for b in self.0.iter().take(4) {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Signature represented in bytes.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for b in self.0.iter().take(8) {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "…")
    }
}

/// Version tag carried by every client-facing request and response.
pub type MessageVersion = u32;

/// The current version of the client-facing message format.
pub const CURRENT_VERSION: MessageVersion = 1;
