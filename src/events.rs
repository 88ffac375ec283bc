/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local service.
//!
//! Each variant of the [Event] enum wraps an inner struct carrying a timestamp of when the
//! occurence happened plus the information summarizing it. Events are emitted **after** the
//! corresponding occurence completed; the commit event, for example, fires only after the state
//! changes are persisted in the trie.
//!
//! Library users can register one handler closure per event type when starting the service, and
//! can enable the default logging handlers defined in [logging](crate::logging) through the
//! [configuration](crate::config::Configuration).

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::basic::{BlockId, BlockIndex, ChainId, NodeId};

/// Enumerates all events defined for the service.
pub enum Event {
    CommitBlock(CommitBlockEvent),
    ProposeBlock(ProposeBlockEvent),
    VerifyBlock(VerifyBlockEvent),
    CollectTx(CollectTxEvent),
    ViewChangeStart(ViewChangeStartEvent),
    ViewChangeComplete(ViewChangeCompleteEvent),
    StartCatchUp(StartCatchUpEvent),
    EndCatchUp(EndCatchUpEvent),
}

impl Event {
    /// Publishes the event on the event publisher channel, if the channel is defined.
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A block was committed: its state changes were applied to the chain's trie.
pub struct CommitBlockEvent {
    pub timestamp: SystemTime,
    pub chain_id: ChainId,
    pub block: BlockId,
    pub index: BlockIndex,
}

/// This node, as the leader, built and proposed a block.
pub struct ProposeBlockEvent {
    pub timestamp: SystemTime,
    pub chain_id: ChainId,
    pub index: BlockIndex,
    pub tx_count: usize,
}

/// This node, as a follower, verified a proposed block.
pub struct VerifyBlockEvent {
    pub timestamp: SystemTime,
    pub chain_id: ChainId,
    pub index: BlockIndex,
    pub valid: bool,
}

/// The leader polled the roster for pending transactions.
pub struct CollectTxEvent {
    pub timestamp: SystemTime,
    pub chain_id: ChainId,
    pub collected: usize,
}

/// This node joined a view change: it is now waiting for the leader at the given index to take
/// over.
pub struct ViewChangeStartEvent {
    pub timestamp: SystemTime,
    pub chain_id: ChainId,
    pub leader_index: u32,
}

/// A view-change block committed and rotated leadership.
pub struct ViewChangeCompleteEvent {
    pub timestamp: SystemTime,
    pub chain_id: ChainId,
    pub new_leader: NodeId,
}

/// This node fell behind and started catching up, either by pulling blocks or by downloading the
/// full state.
pub struct StartCatchUpEvent {
    pub timestamp: SystemTime,
    pub chain_id: ChainId,
    pub from: Option<BlockIndex>,
    pub to: BlockIndex,
    pub download: bool,
}

/// Catch-up for a chain finished.
pub struct EndCatchUpEvent {
    pub timestamp: SystemTime,
    pub chain_id: ChainId,
    pub reached: Option<BlockIndex>,
}
