/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages.
//!
//! [Message] is what travels between nodes: the collect-tx round, view-change requests, block
//! sync, and state download. The remaining types are the client-facing request/response pairs of
//! the service API; every client-facing message carries the current format version.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::darc::{Darc, DarcId, Identity};
use crate::state::trie;
use crate::types::basic::{
    BlockId, BlockIndex, ChainId, InstanceId, MessageVersion, NodeId,
};
use crate::types::block::{Block, BlockHeader, Roster};
use crate::types::transaction::{ClientTransaction, StateChange, StateChangeBody};

/// A message sent between nodes.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum Message {
    CollectTxRequest(CollectTxRequest),
    CollectTxResponse(CollectTxResponse),
    ViewChangeInit(crate::viewchange::InitReq),
    BlockSyncRequest(BlockSyncRequest),
    BlockSyncResponse(BlockSyncResponse),
    DownloadStateRequest(DownloadStateRequest),
    DownloadStateResponse(DownloadStateResponse),
}

/// The leader's one-round pull for pending transactions. Doubles as the leader's heartbeat.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CollectTxRequest {
    pub chain_id: ChainId,
    pub leader: NodeId,
    pub roster: Roster,
    pub latest_block_id: BlockId,
    /// Correlates responses with one poll round.
    pub nonce: u64,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CollectTxResponse {
    pub chain_id: ChainId,
    pub nonce: u64,
    pub txs: Vec<ClientTransaction>,
}

/// A request for committed blocks, used by block-pull catch-up.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct BlockSyncRequest {
    pub chain_id: ChainId,
    pub from_index: BlockIndex,
    pub limit: u32,
    pub nonce: u64,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct BlockSyncResponse {
    pub chain_id: ChainId,
    pub nonce: u64,
    pub blocks: Vec<Block>,
}

impl From<CollectTxRequest> for Message {
    fn from(value: CollectTxRequest) -> Self {
        Message::CollectTxRequest(value)
    }
}

impl From<CollectTxResponse> for Message {
    fn from(value: CollectTxResponse) -> Self {
        Message::CollectTxResponse(value)
    }
}

impl From<crate::viewchange::InitReq> for Message {
    fn from(value: crate::viewchange::InitReq) -> Self {
        Message::ViewChangeInit(value)
    }
}

impl From<BlockSyncRequest> for Message {
    fn from(value: BlockSyncRequest) -> Self {
        Message::BlockSyncRequest(value)
    }
}

impl From<BlockSyncResponse> for Message {
    fn from(value: BlockSyncResponse) -> Self {
        Message::BlockSyncResponse(value)
    }
}

impl From<DownloadStateRequest> for Message {
    fn from(value: DownloadStateRequest) -> Self {
        Message::DownloadStateRequest(value)
    }
}

impl From<DownloadStateResponse> for Message {
    fn from(value: DownloadStateResponse) -> Self {
        Message::DownloadStateResponse(value)
    }
}

/* ↓↓↓ Client-facing requests and responses ↓↓↓ */

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CreateGenesisBlockRequest {
    pub version: MessageVersion,
    pub roster: Roster,
    pub genesis_darc: Darc,
    /// Block interval in nanoseconds; defaults to 5 s when zero.
    pub block_interval_ns: u64,
    /// Maximum serialized block body size; defaults to 4 MB when zero.
    pub max_block_size: u64,
    /// Contract IDs allowed to hold DARCs. At least one is required.
    pub darc_contract_ids: Vec<String>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CreateGenesisBlockResponse {
    pub version: MessageVersion,
    pub chain_id: ChainId,
    pub genesis_block: Block,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct AddTxRequest {
    pub version: MessageVersion,
    pub chain_id: ChainId,
    pub transaction: ClientTransaction,
    /// 0 returns immediately; N blocks until the transaction is included or rejected, or
    /// `2 × N × block_interval` elapses.
    pub inclusion_wait: u32,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct AddTxResponse {
    pub version: MessageVersion,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetProofRequest {
    pub version: MessageVersion,
    pub chain_id: ChainId,
    pub block_id: BlockId,
    pub key: InstanceId,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetProofResponse {
    pub version: MessageVersion,
    pub proof: StateProof,
}

/// An authenticated statement about one key of a chain's state: the trie path for the key plus
/// the header of the block whose trie root the path verifies against.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct StateProof {
    pub trie_proof: trie::Proof,
    pub block_id: BlockId,
    pub header: BlockHeader,
}

impl StateProof {
    /// Check the proof's internal consistency: the trie path must verify against the block
    /// header's trie root. Returns what the proof asserts about the key.
    pub fn verify(&self, chain_id: &ChainId) -> Result<trie::ProofResult, trie::TrieError> {
        // The block id is bound to the chain by the block store's linkage; an all-zero id would
        // escape that binding.
        if self.block_id.is_zero() && !chain_id.bytes().iter().all(|b| *b == 0) {
            return Err(trie::TrieError::InvalidProof);
        }
        self.trie_proof.verify(&self.header.trie_root)
    }

    /// The proven key/value pair, when the proof proves presence.
    pub fn key_value(&self) -> Option<(&[u8; 32], &[u8])> {
        self.trie_proof.key_value()
    }
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CheckAuthorizationRequest {
    pub version: MessageVersion,
    pub chain_id: ChainId,
    pub darc_id: DarcId,
    pub identities: Vec<Identity>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CheckAuthorizationResponse {
    /// The actions of the DARC that the given identities together satisfy.
    pub actions: Vec<String>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetSignerCountersRequest {
    pub chain_id: ChainId,
    pub signer_ids: Vec<Identity>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetSignerCountersResponse {
    pub counters: Vec<u64>,
}

/// Starts or continues a paged full-state download. `nonce = 0` opens a new stream; subsequent
/// requests replay the nonce returned by the first page.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DownloadStateRequest {
    pub chain_id: ChainId,
    pub nonce: u64,
    pub length: u32,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DownloadStateResponse {
    pub nonce: u64,
    /// Raw bucket entries. A page shorter than the requested length ends the stream.
    pub key_values: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetInstanceVersionRequest {
    pub chain_id: ChainId,
    pub instance_id: InstanceId,
    pub version: u64,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetLastInstanceVersionRequest {
    pub chain_id: ChainId,
    pub instance_id: InstanceId,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetAllInstanceVersionRequest {
    pub chain_id: ChainId,
    pub instance_id: InstanceId,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetInstanceVersionResponse {
    pub state_change: StateChange,
    pub block_index: BlockIndex,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetAllInstanceVersionResponse {
    pub state_changes: Vec<GetInstanceVersionResponse>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CheckStateChangeValidityRequest {
    pub chain_id: ChainId,
    pub instance_id: InstanceId,
    pub version: u64,
}

/// The full state-change list of the block that produced a given instance version, plus the
/// block's id, so an external auditor can recompute the header's state-changes hash.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CheckStateChangeValidityResponse {
    pub state_changes: Vec<StateChange>,
    pub block_id: BlockId,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DebugRequest {
    /// Dump one chain's instances when set; list all chains otherwise.
    pub chain_id: Option<ChainId>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DebugResponseChain {
    pub chain_id: ChainId,
    pub genesis: Option<Block>,
    pub latest: Option<Block>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DebugResponseState {
    pub key: InstanceId,
    pub state: StateChangeBody,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DebugResponse {
    pub chains: Vec<DebugResponseChain>,
    pub dump: Vec<DebugResponseState>,
}

/// Removes a chain from this node. Requires a signature over the chain id verifiable under the
/// node's own public key.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DebugRemoveRequest {
    pub chain_id: ChainId,
    pub signature: Vec<u8>,
}
