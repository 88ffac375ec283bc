/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of the ByzCoin permissioned ledger service.
//!
//! A ledger (a *chain*) is maintained by a fixed-membership roster of nodes. Each node runs one
//! [Service](crate::service::Service), which:
//! 1. Accepts and buffers client transactions ([buffer]),
//! 2. As the leader, collects buffered transactions from all followers and executes them against a
//!    staging copy of the chain's authenticated state trie to build the next block ([execution]),
//! 3. As a follower, re-executes a proposed block and checks that the leader's header hashes match
//!    ([Service::verify_proposal](crate::service::Service::verify_proposal)),
//! 4. Detects leader failure through heartbeats and rotates leadership through a two-phase view
//!    change ([heartbeat], [viewchange]),
//! 5. Catches up with the rest of the roster by pulling blocks, or by downloading the full state
//!    trie when it is too far behind.
//!
//! Storage, networking, the durable block store, and the collective-signing primitive are pluggable
//! through the [KVStore](crate::state::KVStore), [Network](crate::networking::Network),
//! [BlockStore](crate::block_store::BlockStore) and
//! [CollectiveSigner](crate::block_store::CollectiveSigner) traits.

pub mod types;

pub mod darc;

pub mod state;

pub mod contracts;

pub mod execution;

pub mod buffer;

pub mod cache;

pub mod history;

pub mod notifications;

pub mod heartbeat;

pub mod viewchange;

pub mod messages;

pub mod networking;

pub mod block_store;

pub mod config;

pub mod service;

mod catchup;

pub mod events;

pub mod event_bus;

pub mod logging;
