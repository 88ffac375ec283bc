/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration of a single service instance.

use ed25519_dalek::SigningKey;
use std::time::Duration;

use crate::types::basic::NodeId;

/// Parameters of one node's service. The catch-up and view-change tunables default to the
/// production values; tests shrink them.
#[derive(Clone)]
pub struct Configuration {
    /// The node's long-term keypair. Its public key is the node's identity in rosters.
    pub keypair: SigningKey,

    /// Log events through the default logging handlers.
    pub log_events: bool,

    /// Full-state download kicks in when we are more than this many blocks behind.
    pub catchup_download_all: u64,

    /// How many blocks to pull in one catch-up request.
    pub catchup_fetch_blocks: u32,

    /// How many raw entries to download in one state-download page.
    pub catchup_fetch_db_entries: u32,

    /// Minimum time between two catch-ups of the same chain.
    pub catchup_min_interval: Duration,

    /// The heartbeat window, as a multiple of the block interval.
    pub rotation_window: u32,

    /// Floor of the acceptable block timestamp window, for very short block intervals.
    pub min_timestamp_window: Duration,

    /// How long the leader waits for collect-tx responses in one poll round.
    pub collect_tx_window: Duration,

    /// How long to wait for a block-sync or state-download response.
    pub sync_response_timeout: Duration,

    /// A state-download stream expires when no page is requested for this long.
    pub download_page_timeout: Duration,
}

impl Configuration {
    pub fn new(keypair: SigningKey) -> Configuration {
        Configuration {
            keypair,
            log_events: false,
            catchup_download_all: 100,
            catchup_fetch_blocks: 10,
            catchup_fetch_db_entries: 100,
            catchup_min_interval: Duration::from_secs(600),
            rotation_window: 10,
            min_timestamp_window: Duration::from_secs(10),
            collect_tx_window: Duration::from_millis(500),
            sync_response_timeout: Duration::from_secs(10),
            download_page_timeout: Duration::from_secs(60),
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.keypair.verifying_key().to_bytes())
    }
}
