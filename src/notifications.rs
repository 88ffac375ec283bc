/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-transaction inclusion/rejection wait channels and per-chain new-block subscriptions.
//!
//! A wait channel must be created *before* the transaction enters the buffer: otherwise a block
//! could commit between insertion and channel creation, and the waiter would miss its
//! notification.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::types::basic::{BlockId, ChainId, CryptoHash};

pub struct Notifications {
    wait_channels: Mutex<HashMap<CryptoHash, Sender<bool>>>,
    block_subscribers: Mutex<HashMap<ChainId, Vec<Sender<BlockId>>>>,
}

impl Notifications {
    pub fn new() -> Notifications {
        Notifications {
            wait_channels: Mutex::new(HashMap::new()),
            block_subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Create the one-shot wait channel for a transaction hash. Replaces any previous channel for
    /// the same hash.
    pub fn create_wait_channel(&self, tx_hash: CryptoHash) -> Receiver<bool> {
        let (sender, receiver) = mpsc::channel();
        self.wait_channels.lock().unwrap().insert(tx_hash, sender);
        receiver
    }

    pub fn delete_wait_channel(&self, tx_hash: &CryptoHash) {
        self.wait_channels.lock().unwrap().remove(tx_hash);
    }

    /// Deliver the accept bit to the waiter of a transaction, if any, and drop the channel.
    pub fn inform_wait_channel(&self, tx_hash: &CryptoHash, accepted: bool) {
        if let Some(sender) = self.wait_channels.lock().unwrap().remove(tx_hash) {
            let _ = sender.send(accepted);
        }
    }

    /// Subscribe to new-block notifications of a chain.
    pub fn register_for_blocks(&self, chain_id: ChainId) -> Receiver<BlockId> {
        let (sender, receiver) = mpsc::channel();
        self.block_subscribers
            .lock()
            .unwrap()
            .entry(chain_id)
            .or_default()
            .push(sender);
        receiver
    }

    /// Broadcast a new block id to the chain's subscribers. Subscribers whose receiving end is
    /// gone are dropped.
    pub fn inform_block(&self, chain_id: &ChainId, block_id: BlockId) {
        let mut subscribers = self.block_subscribers.lock().unwrap();
        if let Some(senders) = subscribers.get_mut(chain_id) {
            senders.retain(|sender| sender.send(block_id).is_ok());
        }
    }

    pub fn remove_chain(&self, chain_id: &ChainId) {
        self.block_subscribers.lock().unwrap().remove(chain_id);
    }
}

impl Default for Notifications {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_channel_delivers_once() {
        let notifications = Notifications::new();
        let hash = CryptoHash::new([1u8; 32]);
        let receiver = notifications.create_wait_channel(hash);

        notifications.inform_wait_channel(&hash, true);
        assert_eq!(receiver.recv().unwrap(), true);

        // The channel is consumed; a second inform is a no-op.
        notifications.inform_wait_channel(&hash, false);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn inform_without_waiter_is_noop() {
        let notifications = Notifications::new();
        notifications.inform_wait_channel(&CryptoHash::new([1u8; 32]), true);
    }

    #[test]
    fn block_subscribers_receive_broadcasts() {
        let notifications = Notifications::new();
        let chain = ChainId::new([1u8; 32]);
        let a = notifications.register_for_blocks(chain);
        let b = notifications.register_for_blocks(chain);

        notifications.inform_block(&chain, BlockId::new([7u8; 32]));
        assert_eq!(a.recv().unwrap(), BlockId::new([7u8; 32]));
        assert_eq!(b.recv().unwrap(), BlockId::new([7u8; 32]));

        // A dropped subscriber is pruned on the next broadcast.
        drop(a);
        notifications.inform_block(&chain, BlockId::new([8u8; 32]));
        assert_eq!(b.recv().unwrap(), BlockId::new([8u8; 32]));
    }
}
