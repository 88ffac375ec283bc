/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-chain transaction buffer.
//!
//! Clients add transactions here; the collect-tx round drains them. The leader's planning pass
//! returns transactions that did not fit the block, and those go back to the front so arrival
//! order is preserved.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::basic::ChainId;
use crate::types::transaction::ClientTransaction;

pub struct TxBuffer {
    txs: Mutex<HashMap<ChainId, VecDeque<ClientTransaction>>>,
}

impl TxBuffer {
    pub fn new() -> TxBuffer {
        TxBuffer {
            txs: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, chain_id: ChainId, tx: ClientTransaction) {
        self.txs
            .lock()
            .unwrap()
            .entry(chain_id)
            .or_default()
            .push_back(tx);
    }

    /// Drain and return the chain's buffered transactions, oldest first.
    pub fn take(&self, chain_id: &ChainId) -> Vec<ClientTransaction> {
        match self.txs.lock().unwrap().remove(chain_id) {
            Some(queue) => queue.into(),
            None => Vec::new(),
        }
    }

    /// Put transactions back at the front of the queue, preserving their order.
    pub fn put_back(&self, chain_id: ChainId, txs: Vec<ClientTransaction>) {
        let mut map = self.txs.lock().unwrap();
        let queue = map.entry(chain_id).or_default();
        for tx in txs.into_iter().rev() {
            queue.push_front(tx);
        }
    }

    pub fn len(&self, chain_id: &ChainId) -> usize {
        self.txs
            .lock()
            .unwrap()
            .get(chain_id)
            .map_or(0, |q| q.len())
    }
}

impl Default for TxBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::InstanceId;
    use crate::types::transaction::{Delete, Instruction, InstructionBody};

    fn tx(byte: u8) -> ClientTransaction {
        ClientTransaction::new(vec![Instruction::new(
            InstanceId::new([byte; 32]),
            InstructionBody::Delete(Delete {
                contract_id: "test".to_string(),
            }),
        )])
    }

    #[test]
    fn take_drains_in_arrival_order() {
        let buffer = TxBuffer::new();
        let chain = ChainId::new([1u8; 32]);
        buffer.add(chain, tx(1));
        buffer.add(chain, tx(2));

        let taken = buffer.take(&chain);
        assert_eq!(taken, vec![tx(1), tx(2)]);
        assert!(buffer.take(&chain).is_empty());
    }

    #[test]
    fn put_back_preserves_order() {
        let buffer = TxBuffer::new();
        let chain = ChainId::new([1u8; 32]);
        buffer.add(chain, tx(3));
        buffer.put_back(chain, vec![tx(1), tx(2)]);
        assert_eq!(buffer.take(&chain), vec![tx(1), tx(2), tx(3)]);
    }

    #[test]
    fn chains_are_isolated() {
        let buffer = TxBuffer::new();
        buffer.add(ChainId::new([1u8; 32]), tx(1));
        assert!(buffer.take(&ChainId::new([2u8; 32])).is_empty());
        assert_eq!(buffer.len(&ChainId::new([1u8; 32])), 1);
    }
}
