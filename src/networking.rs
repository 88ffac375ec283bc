/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definition for pluggable peer-to-peer networking.
//!
//! Each peer is reachable by its [NodeId] (the bytes of its Ed25519 public key). The service's
//! message-loop thread polls [Network::recv] and dispatches; outgoing messages go through a
//! [SenderHandle], which any thread of the service can use.

use std::sync::Mutex;

use crate::messages::Message;
use crate::types::basic::NodeId;

pub trait Network: Clone + Send + 'static {
    /// Send a message to the specified peer without blocking. Sends to unknown peers are
    /// dropped.
    fn send(&mut self, peer: NodeId, message: Message);

    /// Send a message to all known peers without blocking.
    fn broadcast(&mut self, message: Message);

    /// Receive a message from any peer. Returns None immediately if no message is available.
    fn recv(&mut self) -> Option<(NodeId, Message)>;
}

/// Handle for sending and broadcasting messages from any thread.
pub struct SenderHandle<N: Network> {
    network: Mutex<N>,
}

impl<N: Network> SenderHandle<N> {
    pub fn new(network: N) -> SenderHandle<N> {
        SenderHandle {
            network: Mutex::new(network),
        }
    }

    pub fn send<M: Into<Message>>(&self, peer: NodeId, msg: M) {
        self.network.lock().unwrap().send(peer, msg.into())
    }

    pub fn broadcast<M: Into<Message>>(&self, msg: M) {
        self.network.lock().unwrap().broadcast(msg.into())
    }
}
