/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-node ledger service.
//!
//! One [Service] maintains every chain its node is part of: it buffers client transactions,
//! polls the roster for pending transactions when it leads, verifies proposals when it follows,
//! applies committed blocks to the per-chain state tries, monitors the leader's liveness, and
//! catches up when it falls behind.
//!
//! ## Ownership and threads
//!
//! The service owns its per-chain subsystems (tries, buffers, monitors); cross-calls go through
//! narrow handles, not back-pointers. Long-lived threads (the message loop, the heartbeat-timeout
//! monitor, per-chain polling, the event bus) hold only a `Weak` reference and check the close
//! flag, so shutdown is deterministic: [Service::close] flips the flag, stops the monitors, and
//! joins every thread.
//!
//! ## Locking
//!
//! Writes to a chain's state trie are serialized by `update_trie_lock`; blocks are applied in
//! strict index order. Read-only queries snapshot the trie under the same lock and fail fast with
//! [ServiceError::CatchingUp] while a catch-up is rebuilding the state. All other shared maps
//! carry their own mutex and are held only briefly.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use rand::RngCore;

use crate::block_store::{BlockStore, BlockStoreError, CoSiError, CollectiveSigner};
use crate::buffer::TxBuffer;
use crate::cache::StateChangeCache;
use crate::config::Configuration;
use crate::contracts::config::{get_instance_darc, load_config_from_trie, load_darc_from_trie};
use crate::contracts::{ContractRegistry, CONTRACT_CONFIG_ID};
use crate::darc::{expression, Darc, DarcId};
use crate::event_bus::{start_event_bus, EventHandlers};
use crate::events::*;
use crate::execution::{create_state_changes, signer_counter};
use crate::heartbeat::Heartbeats;
use crate::history::StateChangeStorage;
use crate::messages::*;
use crate::networking::Network;
use crate::notifications::Notifications;
use crate::state::kv::{check_db_version, Bucket, DbVersionError, KVStore};
use crate::state::store::{ReadOnlyStateTrie, StagingStateTrie, StateTrie, StateTrieError};
use crate::state::trie::TrieError;
use crate::state::MemKVStore;
use crate::types::basic::{
    BlockId, ChainId, InstanceId, MessageVersion, NodeId, Nonce, Timestamp, CONFIG_INSTANCE_ID,
    CURRENT_VERSION,
};
use crate::types::block::{
    Block, BlockHeader, ChainConfig, Roster, DEFAULT_BLOCK_INTERVAL, DEFAULT_MAX_BLOCK_SIZE,
};
use crate::types::transaction::{
    new_tx_results, state_changes_hash, tx_results_hash, tx_size, Argument, Arguments,
    ClientTransaction, Instruction, InstructionBody, Invoke, Spawn, TxResult,
};
use crate::viewchange::{InitReq, NewViewReq, View, ViewChangeManager};

#[derive(Debug)]
pub enum ServiceError {
    VersionMismatch { got: MessageVersion, need: MessageVersion },
    InvalidInput(String),
    Unauthorized(String),
    UnknownChain(ChainId),
    CatchingUp,
    Consensus(String),
    Storage(String),
    Timeout(String),
    Closed,
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::VersionMismatch { got, need } => {
                write!(f, "version mismatch - got {} but need {}", got, need)
            }
            ServiceError::InvalidInput(why) => write!(f, "invalid input: {}", why),
            ServiceError::Unauthorized(why) => write!(f, "unauthorized: {}", why),
            ServiceError::UnknownChain(chain) => write!(f, "unknown chain {}", chain),
            ServiceError::CatchingUp => write!(f, "currently catching up on our state"),
            ServiceError::Consensus(why) => write!(f, "consensus failure: {}", why),
            ServiceError::Storage(why) => write!(f, "storage failure: {}", why),
            ServiceError::Timeout(why) => write!(f, "timed out: {}", why),
            ServiceError::Closed => write!(f, "service is closed"),
        }
    }
}

impl From<TrieError> for ServiceError {
    fn from(e: TrieError) -> Self {
        ServiceError::Storage(e.to_string())
    }
}

impl From<StateTrieError> for ServiceError {
    fn from(e: StateTrieError) -> Self {
        ServiceError::Storage(e.to_string())
    }
}

impl From<BlockStoreError> for ServiceError {
    fn from(e: BlockStoreError) -> Self {
        ServiceError::Storage(e.to_string())
    }
}

impl From<CoSiError> for ServiceError {
    fn from(e: CoSiError) -> Self {
        ServiceError::Consensus(e.to_string())
    }
}

impl From<DbVersionError> for ServiceError {
    fn from(e: DbVersionError) -> Self {
        ServiceError::Storage(e.to_string())
    }
}

pub(crate) struct PollHandle {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct DownloadStream {
    chain_id: ChainId,
    nonce: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    cursor: usize,
    last_read: Instant,
}

pub struct Service<K: KVStore, N: Network> {
    pub(crate) config: Configuration,
    pub(crate) registry: ContractRegistry,
    pub(crate) kv: Mutex<K>,
    pub(crate) block_store: Arc<dyn BlockStore>,
    pub(crate) cosigner: Arc<dyn CollectiveSigner>,
    pub(crate) network: Mutex<N>,
    pub(crate) weak: Weak<Service<K, N>>,

    pub(crate) state_tries: Mutex<HashMap<ChainId, StateTrie<K>>>,
    pub(crate) update_trie_lock: Mutex<()>,
    pub(crate) catching_up: Mutex<HashSet<ChainId>>,

    pub(crate) tx_buffer: TxBuffer,
    pub(crate) cache: StateChangeCache,
    pub(crate) history: StateChangeStorage,
    pub(crate) notifications: Notifications,
    pub(crate) heartbeats: Heartbeats,
    pub(crate) viewchange: ViewChangeManager,

    pub(crate) poll_chans: Mutex<HashMap<ChainId, PollHandle>>,
    pub(crate) darc_to_chain: Mutex<HashMap<DarcId, ChainId>>,
    pub(crate) catchup_history: Mutex<HashMap<ChainId, Instant>>,
    pub(crate) unknown_chains: Mutex<HashSet<ChainId>>,
    pub(crate) download_stream: Mutex<Option<DownloadStream>>,

    pub(crate) closed: Mutex<bool>,
    pub(crate) threads: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) event_publisher: Option<Sender<Event>>,
    pub(crate) event_bus: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,

    pub(crate) collect_tx_responses: Mutex<Option<(u64, Sender<(NodeId, CollectTxResponse)>)>>,
    pub(crate) sync_responses: Mutex<Option<(u64, Sender<BlockSyncResponse>)>>,
    pub(crate) download_responses: Mutex<Option<Sender<DownloadStateResponse>>>,
    pub(crate) next_nonce: AtomicU64,
}

impl<K: KVStore, N: Network> Service<K, N> {
    /// Create and start a service: check the database version, register the commit callback with
    /// the block store, spawn the long-lived threads, and restart every stored chain.
    pub fn start(
        config: Configuration,
        registry: ContractRegistry,
        mut kv: K,
        block_store: Arc<dyn BlockStore>,
        cosigner: Arc<dyn CollectiveSigner>,
        network: N,
        handlers: EventHandlers,
    ) -> Result<Arc<Service<K, N>>, ServiceError> {
        check_db_version(&mut kv)?;

        let (heartbeats, heartbeat_timeouts) = Heartbeats::new();
        let me = config.node_id();

        let (event_publisher, event_bus) = if handlers.is_empty() {
            (None, None)
        } else {
            let (publisher, subscriber) = mpsc::channel();
            let (shutdown, shutdown_receiver) = mpsc::channel();
            let handle = start_event_bus(handlers, subscriber, shutdown_receiver);
            (Some(publisher), Some((shutdown, handle)))
        };

        let service = Arc::new_cyclic(|weak: &Weak<Service<K, N>>| Service {
            config,
            registry,
            kv: Mutex::new(kv),
            block_store,
            cosigner,
            network: Mutex::new(network),
            weak: weak.clone(),
            state_tries: Mutex::new(HashMap::new()),
            update_trie_lock: Mutex::new(()),
            catching_up: Mutex::new(HashSet::new()),
            tx_buffer: TxBuffer::new(),
            cache: StateChangeCache::new(),
            history: StateChangeStorage::new(),
            notifications: Notifications::new(),
            heartbeats,
            viewchange: ViewChangeManager::new(me),
            poll_chans: Mutex::new(HashMap::new()),
            darc_to_chain: Mutex::new(HashMap::new()),
            catchup_history: Mutex::new(HashMap::new()),
            unknown_chains: Mutex::new(HashSet::new()),
            download_stream: Mutex::new(None),
            closed: Mutex::new(false),
            threads: Mutex::new(Vec::new()),
            event_publisher,
            event_bus: Mutex::new(event_bus),
            collect_tx_responses: Mutex::new(None),
            sync_responses: Mutex::new(None),
            download_responses: Mutex::new(None),
            next_nonce: AtomicU64::new(1),
        });

        // The block store drives the commit pipeline: every stored block flows into update_trie.
        let weak = service.weak.clone();
        service
            .block_store
            .register_commit_callback(Box::new(move |block: &Block| {
                if let Some(service) = weak.upgrade() {
                    if let Err(e) = service.update_trie(block) {
                        log::error!("failed to update trie for block {}: {}", block.index, e);
                    }
                }
            }));

        service.spawn_message_loop();
        service.spawn_heartbeat_monitor(heartbeat_timeouts);
        service.start_all_chains();

        Ok(service)
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    pub(crate) fn kv_handle(&self) -> K {
        self.kv.lock().unwrap().clone()
    }

    pub(crate) fn next_nonce(&self) -> u64 {
        self.next_nonce.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn publish(&self, event: Event) {
        event.publish(&self.event_publisher);
    }

    pub(crate) fn send(&self, peer: NodeId, msg: Message) {
        self.network.lock().unwrap().send(peer, msg);
    }

    pub(crate) fn broadcast(&self, msg: Message) {
        self.network.lock().unwrap().broadcast(msg);
    }

    /// Quiesce all threads and monitors. Deterministic: returns once everything is joined.
    pub fn close(&self) {
        {
            let mut closed = self.closed.lock().unwrap();
            if *closed {
                return;
            }
            *closed = true;
        }
        log::info!("closing service threads");
        self.heartbeats.close_all();
        self.viewchange.close_all();
        // Drain the poll handles out of the map before joining: a poll thread committing its
        // last block takes the same map when leadership rotates.
        let polls: Vec<PollHandle> = {
            let mut polls = self.poll_chans.lock().unwrap();
            polls.drain().map(|(_, poll)| poll).collect()
        };
        for mut poll in polls {
            let _ = poll.stop.send(());
            if let Some(handle) = poll.handle.take() {
                let _ = handle.join();
            }
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        if let Some((shutdown, handle)) = self.event_bus.lock().unwrap().take() {
            let _ = shutdown.send(());
            let _ = handle.join();
        }
    }

    /* ↓↓↓ Chain registries ↓↓↓ */

    pub(crate) fn has_state_trie(&self, chain_id: &ChainId) -> bool {
        if self.state_tries.lock().unwrap().contains_key(chain_id) {
            return true;
        }
        StateTrie::load(Bucket::new(self.kv_handle(), chain_id)).is_ok()
    }

    pub(crate) fn get_state_trie(&self, chain_id: &ChainId) -> Result<StateTrie<K>, ServiceError> {
        let mut tries = self.state_tries.lock().unwrap();
        if let Some(trie) = tries.get(chain_id) {
            return Ok(trie.clone());
        }
        let bucket = Bucket::new(self.kv_handle(), chain_id);
        let trie = StateTrie::load(bucket).map_err(|_| ServiceError::UnknownChain(*chain_id))?;
        tries.insert(*chain_id, trie.clone());
        Ok(trie)
    }

    pub(crate) fn create_state_trie(
        &self,
        chain_id: &ChainId,
        nonce: Nonce,
    ) -> Result<StateTrie<K>, ServiceError> {
        let mut tries = self.state_tries.lock().unwrap();
        if tries.contains_key(chain_id) {
            return Err(ServiceError::Storage("state trie already exists".to_string()));
        }
        let bucket = Bucket::new(self.kv_handle(), chain_id);
        let trie = StateTrie::create(bucket, nonce)?;
        tries.insert(*chain_id, trie.clone());
        Ok(trie)
    }

    pub(crate) fn is_catching_up(&self, chain_id: &ChainId) -> bool {
        self.catching_up.lock().unwrap().contains(chain_id)
    }

    pub(crate) fn set_catching_up(&self, chain_id: &ChainId) -> bool {
        self.catching_up.lock().unwrap().insert(*chain_id)
    }

    pub(crate) fn clear_catching_up(&self, chain_id: &ChainId) {
        self.catching_up.lock().unwrap().remove(chain_id);
    }

    /// The block interval and maximum block size of a chain, or the defaults when its
    /// configuration cannot be loaded.
    pub fn load_block_info(&self, chain_id: &ChainId) -> (Duration, u64) {
        if let Ok(trie) = self.get_state_trie(chain_id) {
            if let Ok(config) = load_config_from_trie(&trie) {
                return (config.block_interval(), config.max_block_size);
            }
        }
        (DEFAULT_BLOCK_INTERVAL, DEFAULT_MAX_BLOCK_SIZE)
    }

    pub fn load_config(&self, chain_id: &ChainId) -> Result<ChainConfig, ServiceError> {
        let trie = self.get_state_trie(chain_id)?;
        Ok(load_config_from_trie(&trie)?)
    }

    pub fn load_genesis_darc(&self, chain_id: &ChainId) -> Result<Darc, ServiceError> {
        let trie = self.get_state_trie(chain_id)?;
        let config = load_config_from_trie(&trie)?;
        get_instance_darc(&trie, &CONFIG_INSTANCE_ID, &config.darc_contract_ids)
            .map_err(|e| ServiceError::Storage(e.to_string()))
    }

    /* ↓↓↓ Client API ↓↓↓ */

    /// Create a new chain. The genesis DARC governs the configuration instance; this node must
    /// be the leader of the given roster.
    pub fn create_genesis_block(
        &self,
        req: CreateGenesisBlockRequest,
    ) -> Result<CreateGenesisBlockResponse, ServiceError> {
        if req.version != CURRENT_VERSION {
            return Err(ServiceError::VersionMismatch {
                got: req.version,
                need: CURRENT_VERSION,
            });
        }
        if req.roster.is_empty() {
            return Err(ServiceError::InvalidInput("must provide a roster".to_string()));
        }
        if req.roster.leader() != Some(&self.node_id()) {
            return Err(ServiceError::InvalidInput(
                "genesis blocks are created on the roster's leader".to_string(),
            ));
        }
        if req.genesis_darc.rules.count() == 0
            || !req.genesis_darc.rules.contains(crate::darc::SIGN_ACTION)
        {
            return Err(ServiceError::InvalidInput("invalid genesis darc".to_string()));
        }
        if req.darc_contract_ids.is_empty() {
            return Err(ServiceError::InvalidInput(
                "must provide at least one DARC contract".to_string(),
            ));
        }
        for contract_id in &req.darc_contract_ids {
            if !self.registry.contains(contract_id) {
                return Err(ServiceError::InvalidInput(format!(
                    "the given contract \"{}\" does not exist",
                    contract_id
                )));
            }
        }

        let block_interval_ns = if req.block_interval_ns == 0 {
            DEFAULT_BLOCK_INTERVAL.as_nanos() as u64
        } else {
            req.block_interval_ns
        };
        let max_block_size = if req.max_block_size == 0 {
            DEFAULT_MAX_BLOCK_SIZE
        } else {
            req.max_block_size
        };

        let mut nonce_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let args = Arguments::new(vec![
            Argument {
                name: "darc".to_string(),
                value: req.genesis_darc.to_bytes(),
            },
            Argument {
                name: "block_interval".to_string(),
                value: block_interval_ns.to_le_bytes().to_vec(),
            },
            Argument {
                name: "max_block_size".to_string(),
                value: max_block_size.to_le_bytes().to_vec(),
            },
            Argument {
                name: "roster".to_string(),
                value: borsh::BorshSerialize::try_to_vec(&req.roster)
                    .expect("roster serialization is infallible"),
            },
            Argument {
                name: "trie_nonce".to_string(),
                value: nonce_bytes.to_vec(),
            },
            Argument {
                name: "darc_contracts".to_string(),
                value: borsh::BorshSerialize::try_to_vec(&req.darc_contract_ids)
                    .expect("string list serialization is infallible"),
            },
        ]);
        let ctx = ClientTransaction::new(vec![Instruction::new(
            CONFIG_INSTANCE_ID,
            InstructionBody::Spawn(Spawn {
                contract_id: CONTRACT_CONFIG_ID.to_string(),
                args,
            }),
        )]);

        let block = self.create_new_block(None, &req.roster, new_tx_results(vec![ctx]))?;
        Ok(CreateGenesisBlockResponse {
            version: CURRENT_VERSION,
            chain_id: block.chain_id(),
            genesis_block: block,
        })
    }

    /// Apply a new transaction to the ledger. With `inclusion_wait = N`, blocks until the
    /// transaction is included (or rejected, or `2 × N × interval` elapses).
    pub fn add_transaction(&self, req: AddTxRequest) -> Result<AddTxResponse, ServiceError> {
        if req.version != CURRENT_VERSION {
            return Err(ServiceError::VersionMismatch {
                got: req.version,
                need: CURRENT_VERSION,
            });
        }
        if req.transaction.instructions.is_empty() {
            return Err(ServiceError::InvalidInput("no transactions to add".to_string()));
        }
        if self.block_store.genesis(&req.chain_id).is_none() {
            return Err(ServiceError::UnknownChain(req.chain_id));
        }
        let latest = self
            .block_store
            .latest(&req.chain_id)
            .ok_or(ServiceError::UnknownChain(req.chain_id))?;
        if !latest.roster.contains(&self.node_id()) {
            return Err(ServiceError::InvalidInput(
                "refusing to accept transaction for a chain we're not part of".to_string(),
            ));
        }
        let (interval, max_size) = self.load_block_info(&req.chain_id);
        let size = tx_size(&TxResult {
            client_transaction: req.transaction.clone(),
            accepted: false,
        });
        if size > max_size {
            return Err(ServiceError::InvalidInput("transaction too large".to_string()));
        }
        for (i, instr) in req.transaction.instructions.iter().enumerate() {
            log::debug!("Instruction[{}]: {}", i, instr.action());
        }

        if req.inclusion_wait > 0 {
            // The wait channel must exist before the transaction enters the buffer, or a fast
            // commit could slip between insertion and channel creation.
            let tx_hash = req.transaction.hash();
            let wait = self.notifications.create_wait_channel(tx_hash);
            let blocks = self.notifications.register_for_blocks(req.chain_id);
            self.tx_buffer.add(req.chain_id, req.transaction);
            let result = self.wait_for_inclusion(wait, blocks, req.inclusion_wait, interval);
            self.notifications.delete_wait_channel(&tx_hash);
            result?;
        } else {
            self.tx_buffer.add(req.chain_id, req.transaction);
        }
        Ok(AddTxResponse {
            version: CURRENT_VERSION,
        })
    }

    fn wait_for_inclusion(
        &self,
        wait: Receiver<bool>,
        blocks: Receiver<BlockId>,
        inclusion_wait: u32,
        interval: Duration,
    ) -> Result<(), ServiceError> {
        let too_long = 2 * inclusion_wait * interval;
        let deadline = Instant::now() + too_long;
        let mut blocks_left = inclusion_wait;
        loop {
            if let Ok(accepted) = wait.try_recv() {
                return if accepted {
                    Ok(())
                } else {
                    Err(ServiceError::Unauthorized(
                        "transaction is in block, but got refused".to_string(),
                    ))
                };
            }
            if Instant::now() >= deadline {
                return Err(ServiceError::Timeout(format!(
                    "transaction didn't get included after {:?} (2 * t_block * {})",
                    too_long, inclusion_wait
                )));
            }
            match blocks.recv_timeout(Duration::from_millis(50)) {
                Ok(_) => {
                    // The commit path informs the wait channel before the block channel.
                    if let Ok(accepted) = wait.try_recv() {
                        return if accepted {
                            Ok(())
                        } else {
                            Err(ServiceError::Unauthorized(
                                "transaction is in block, but got refused".to_string(),
                            ))
                        };
                    }
                    blocks_left -= 1;
                    if blocks_left == 0 {
                        return Err(ServiceError::Timeout(format!(
                            "did not find transaction after {} blocks",
                            inclusion_wait
                        )));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(ServiceError::Closed),
            }
        }
    }

    /// A proof of presence or absence of a key, verifiable against the header of the block the
    /// chain's trie currently sits at.
    pub fn get_proof(&self, req: GetProofRequest) -> Result<GetProofResponse, ServiceError> {
        let _guard = self.update_trie_lock.lock().unwrap();
        if self.is_catching_up(&req.chain_id) {
            return Err(ServiceError::CatchingUp);
        }
        if req.version != CURRENT_VERSION {
            return Err(ServiceError::VersionMismatch {
                got: req.version,
                need: CURRENT_VERSION,
            });
        }
        log::debug!("returning proof for {} from chain {}", req.key, req.chain_id);

        if self.block_store.get(&req.block_id).is_none() {
            return Err(ServiceError::InvalidInput(
                "cannot find block while getting proof".to_string(),
            ));
        }
        let trie = self.get_state_trie(&req.chain_id)?;
        let index = trie
            .get_index()
            .ok_or_else(|| ServiceError::Storage("trie has no applied block".to_string()))?;
        let block = self
            .block_store
            .by_index(&req.chain_id, index)
            .ok_or_else(|| ServiceError::Storage("no block at the trie's index".to_string()))?;
        let proof = StateProof {
            trie_proof: trie.get_proof(&req.key)?,
            block_id: block.hash(),
            header: block.header,
        };
        // Sanity check before handing it out.
        proof
            .verify(&req.chain_id)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok(GetProofResponse {
            version: CURRENT_VERSION,
            proof,
        })
    }

    /// The actions of a DARC that a set of identities together satisfies.
    pub fn check_authorization(
        &self,
        req: CheckAuthorizationRequest,
    ) -> Result<CheckAuthorizationResponse, ServiceError> {
        if req.version != CURRENT_VERSION {
            return Err(ServiceError::VersionMismatch {
                got: req.version,
                need: CURRENT_VERSION,
            });
        }
        let _guard = self.update_trie_lock.lock().unwrap();
        if self.is_catching_up(&req.chain_id) {
            return Err(ServiceError::CatchingUp);
        }
        let trie = self.get_state_trie(&req.chain_id)?;
        let darc = load_darc_from_trie(&trie, &req.darc_id)
            .map_err(|e| ServiceError::InvalidInput(format!("couldn't find darc: {}", e)))?;

        let resolver = |atom: &str| -> Option<Darc> {
            let hex = atom.strip_prefix("darc:")?;
            let id = DarcId::from_hex(hex)?;
            load_darc_from_trie(&trie, &id).ok()
        };
        let identities: Vec<String> = req.identities.iter().map(|i| i.string()).collect();
        let mut actions = Vec::new();
        for rule in darc.rules.iter() {
            if expression::eval_expr(&rule.expr, &resolver, &identities).is_ok() {
                actions.push(rule.action.clone());
            }
        }
        Ok(CheckAuthorizationResponse { actions })
    }

    /// The latest signer counters of the given identities.
    pub fn get_signer_counters(
        &self,
        req: GetSignerCountersRequest,
    ) -> Result<GetSignerCountersResponse, ServiceError> {
        let _guard = self.update_trie_lock.lock().unwrap();
        if self.is_catching_up(&req.chain_id) {
            return Err(ServiceError::CatchingUp);
        }
        let trie = self.get_state_trie(&req.chain_id)?;
        let mut counters = Vec::with_capacity(req.signer_ids.len());
        for identity in &req.signer_ids {
            counters.push(signer_counter(&trie, identity)?);
        }
        Ok(GetSignerCountersResponse { counters })
    }

    /// Serve one page of a full-state download. `nonce = 0` snapshots the chain's raw bucket and
    /// opens a new stream; replaying the returned nonce serves consecutive pages.
    pub fn download_state(
        &self,
        req: DownloadStateRequest,
    ) -> Result<DownloadStateResponse, ServiceError> {
        let _guard = self.update_trie_lock.lock().unwrap();
        if req.length == 0 {
            return Err(ServiceError::InvalidInput(
                "length must be bigger than 0".to_string(),
            ));
        }
        let mut stream_slot = self.download_stream.lock().unwrap();
        if req.nonce == 0 {
            log::debug!("creating new download for {}", req.chain_id);
            if self.block_store.genesis(&req.chain_id).is_none() {
                return Err(ServiceError::UnknownChain(req.chain_id));
            }
            let trie = self.get_state_trie(&req.chain_id)?;
            let mut nonce = rand::rngs::OsRng.next_u64();
            if nonce == 0 {
                nonce = 1;
            }
            *stream_slot = Some(DownloadStream {
                chain_id: req.chain_id,
                nonce,
                entries: trie.raw_entries(),
                cursor: 0,
                last_read: Instant::now(),
            });
        }
        let stream = stream_slot.as_mut().ok_or_else(|| {
            ServiceError::InvalidInput("no download stream open".to_string())
        })?;
        if stream.chain_id != req.chain_id || stream.nonce != req.nonce && req.nonce != 0 {
            return Err(ServiceError::InvalidInput(
                "download has been aborted in favor of another download".to_string(),
            ));
        }
        if stream.last_read.elapsed() > self.config.download_page_timeout {
            *stream_slot = None;
            return Err(ServiceError::Timeout(
                "download stream expired".to_string(),
            ));
        }
        let end = (stream.cursor + req.length as usize).min(stream.entries.len());
        let key_values = stream.entries[stream.cursor..end].to_vec();
        stream.cursor = end;
        stream.last_read = Instant::now();
        Ok(DownloadStateResponse {
            nonce: stream.nonce,
            key_values,
        })
    }

    /* ↓↓↓ Historical queries ↓↓↓ */

    pub fn get_instance_version(
        &self,
        req: GetInstanceVersionRequest,
    ) -> Result<GetInstanceVersionResponse, ServiceError> {
        self.history
            .get_by_version(&req.chain_id, &req.instance_id, req.version)
            .map(|entry| GetInstanceVersionResponse {
                state_change: entry.state_change,
                block_index: entry.block_index,
            })
            .ok_or_else(|| ServiceError::InvalidInput("key not set".to_string()))
    }

    pub fn get_last_instance_version(
        &self,
        req: GetLastInstanceVersionRequest,
    ) -> Result<GetInstanceVersionResponse, ServiceError> {
        self.history
            .get_last(&req.chain_id, &req.instance_id)
            .map(|entry| GetInstanceVersionResponse {
                state_change: entry.state_change,
                block_index: entry.block_index,
            })
            .ok_or_else(|| ServiceError::InvalidInput("key not set".to_string()))
    }

    pub fn get_all_instance_version(
        &self,
        req: GetAllInstanceVersionRequest,
    ) -> Result<GetAllInstanceVersionResponse, ServiceError> {
        let state_changes = self
            .history
            .get_all(&req.chain_id, &req.instance_id)
            .into_iter()
            .map(|entry| GetInstanceVersionResponse {
                state_change: entry.state_change,
                block_index: entry.block_index,
            })
            .collect();
        Ok(GetAllInstanceVersionResponse { state_changes })
    }

    /// The full state-change list of the block that produced a given instance version, for
    /// external auditors to check against the block's state-changes hash.
    pub fn check_state_change_validity(
        &self,
        req: CheckStateChangeValidityRequest,
    ) -> Result<CheckStateChangeValidityResponse, ServiceError> {
        let entry = self
            .history
            .get_by_version(&req.chain_id, &req.instance_id, req.version)
            .ok_or_else(|| ServiceError::InvalidInput("key not set".to_string()))?;
        let block = self
            .block_store
            .by_index(&req.chain_id, entry.block_index)
            .ok_or_else(|| ServiceError::Storage("block not found".to_string()))?;
        let state_changes = self
            .history
            .get_by_block(&req.chain_id, entry.block_index)
            .into_iter()
            .map(|e| e.state_change)
            .collect();
        Ok(CheckStateChangeValidityResponse {
            state_changes,
            block_id: block.hash(),
        })
    }

    /// Server-push of every committed block id of a chain.
    pub fn stream_transactions(&self, chain_id: ChainId) -> Receiver<BlockId> {
        self.notifications.register_for_blocks(chain_id)
    }

    /* ↓↓↓ Debug API (loopback-only at the transport layer) ↓↓↓ */

    pub fn debug_dump(&self, req: DebugRequest) -> Result<DebugResponse, ServiceError> {
        let mut resp = DebugResponse {
            chains: Vec::new(),
            dump: Vec::new(),
        };
        match req.chain_id {
            None => {
                for chain_id in self.block_store.chain_ids() {
                    resp.chains.push(DebugResponseChain {
                        chain_id,
                        genesis: self.block_store.genesis(&chain_id),
                        latest: self.block_store.latest(&chain_id),
                    });
                }
            }
            Some(chain_id) => {
                let trie = self.get_state_trie(&chain_id)?;
                let mut dump = Vec::new();
                trie.for_each(&mut |key: &InstanceId, value: &[u8]| {
                    if let Ok(state) =
                        crate::types::transaction::StateChangeBody::from_bytes(value)
                    {
                        dump.push(DebugResponseState { key: *key, state });
                    }
                })?;
                resp.dump = dump;
            }
        }
        Ok(resp)
    }

    /// Remove a chain from this node. The request must carry a signature over the chain id
    /// verifiable under this node's own public key.
    pub fn debug_remove(&self, req: DebugRemoveRequest) -> Result<(), ServiceError> {
        let me = crate::darc::Identity::Ed25519(self.node_id().bytes());
        me.verify(&req.chain_id.bytes(), &req.signature)
            .map_err(|_| ServiceError::Unauthorized("signature failure".to_string()))?;

        let chain_id = req.chain_id;
        self.heartbeats.stop(&chain_id);
        self.viewchange.stop(&chain_id);
        {
            let mut polls = self.poll_chans.lock().unwrap();
            if let Some(poll) = polls.remove(&chain_id) {
                let _ = poll.stop.send(());
            }
        }
        {
            let _guard = self.update_trie_lock.lock().unwrap();
            self.state_tries.lock().unwrap().remove(&chain_id);
            Bucket::new(self.kv_handle(), &chain_id).clear();
        }
        self.block_store.remove_chain(&chain_id);
        self.history.remove_chain(&chain_id);
        self.notifications.remove_chain(&chain_id);
        self.cache.invalidate(&chain_id);
        {
            let mut mapping = self.darc_to_chain.lock().unwrap();
            mapping.retain(|_, chain| chain != &chain_id);
        }
        log::info!("removed chain {}", chain_id);
        Ok(())
    }

    /* ↓↓↓ Block building (leader) ↓↓↓ */

    /// Build, collectively sign and store the next block of a chain (or a genesis block when
    /// `chain_id` is None). Storing the block drives the commit pipeline on every node.
    pub(crate) fn create_new_block(
        &self,
        chain_id: Option<ChainId>,
        roster: &Roster,
        txs: Vec<TxResult>,
    ) -> Result<Block, ServiceError> {
        let (result, index, prev, genesis) = match chain_id {
            None => {
                let nonce = load_nonce_from_txs(&txs)?;
                let sst = StagingStateTrie::<MemKVStore>::in_memory(nonce);
                let (result, _) = create_state_changes(
                    &sst,
                    &ChainId::new([0u8; 32]),
                    &self.registry,
                    &txs,
                    None,
                    DEFAULT_MAX_BLOCK_SIZE,
                    &self.cache,
                );
                (
                    result,
                    crate::types::basic::BlockIndex::new(0),
                    BlockId::zero(),
                    BlockId::zero(),
                )
            }
            Some(chain_id) => {
                let latest = self
                    .block_store
                    .latest(&chain_id)
                    .ok_or(ServiceError::UnknownChain(chain_id))?;
                log::debug!(
                    "creating block #{} with {} transactions",
                    latest.index + 1,
                    txs.len()
                );
                let trie = self.get_state_trie(&chain_id)?;
                let sst = trie.staging();
                let (_, max_size) = self.load_block_info(&chain_id);
                let (result, _) = create_state_changes(
                    &sst,
                    &chain_id,
                    &self.registry,
                    &txs,
                    None,
                    max_size,
                    &self.cache,
                );
                (
                    result,
                    latest.index + 1,
                    latest.hash(),
                    BlockId::new(chain_id.bytes()),
                )
            }
        };
        if result.tx_results.is_empty() {
            return Err(ServiceError::InvalidInput("no transactions".to_string()));
        }

        let header = BlockHeader {
            trie_root: result.merkle_root,
            client_tx_hash: tx_results_hash(&result.tx_results),
            state_changes_hash: state_changes_hash(&result.state_changes),
            timestamp: Timestamp::now(),
        };
        let block = Block {
            index,
            prev,
            genesis,
            roster: roster.clone(),
            header,
            body: result.tx_results,
        };

        // The collective signature becomes the forward link held by the block store.
        self.cosigner
            .collective_sign(roster, &block.hash().bytes())?;
        self.block_store.store(block.clone())?;
        Ok(block)
    }

    /* ↓↓↓ Leader polling ↓↓↓ */

    pub(crate) fn start_polling(&self, chain_id: ChainId) {
        let mut polls = self.poll_chans.lock().unwrap();
        if polls.contains_key(&chain_id) {
            return;
        }
        log::info!("started polling for {}", chain_id);
        let (stop, stop_receiver) = mpsc::channel();
        let weak = self.weak.clone();
        let handle = std::thread::spawn(move || loop {
            let interval = match weak.upgrade() {
                Some(service) => service.load_block_info(&chain_id).0,
                None => return,
            };
            match stop_receiver.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let Some(service) = weak.upgrade() else { return };
            if service.is_closed() {
                return;
            }
            if let Err(e) = service.poll_and_propose(&chain_id) {
                log::error!("poll for {} failed: {}", chain_id, e);
            }
        });
        polls.insert(
            chain_id,
            PollHandle {
                stop,
                handle: Some(handle),
            },
        );
    }

    pub(crate) fn stop_polling(&self, chain_id: &ChainId) {
        let mut polls = self.poll_chans.lock().unwrap();
        if let Some(poll) = polls.remove(chain_id) {
            log::info!("stopped polling for {}", chain_id);
            let _ = poll.stop.send(());
            // The thread is joined at close; joining here could deadlock when the poll thread
            // itself commits the block that rotates leadership away.
            if let Some(handle) = poll.handle {
                self.threads.lock().unwrap().push(handle);
            }
        }
    }

    fn poll_and_propose(&self, chain_id: &ChainId) -> Result<(), ServiceError> {
        let trie = self.get_state_trie(chain_id)?;
        let config = load_config_from_trie(&trie)?;
        if config.roster.leader() != Some(&self.node_id()) {
            return Ok(());
        }
        let latest = self
            .block_store
            .latest(chain_id)
            .ok_or(ServiceError::UnknownChain(*chain_id))?;

        let txs = self.collect_txs(chain_id, &config, &latest);
        self.publish(Event::CollectTx(CollectTxEvent {
            timestamp: SystemTime::now(),
            chain_id: *chain_id,
            collected: txs.len(),
        }));
        if txs.is_empty() {
            return Ok(());
        }

        // Planning pass: run transactions under half the block interval and the byte budget;
        // what does not fit goes back into the buffer. The polling and commit paths are mutually
        // exclusive on one chain, so the staging trie sees a stable snapshot.
        let (result, leftover) = {
            let _guard = self.update_trie_lock.lock().unwrap();
            let sst = trie.staging();
            create_state_changes(
                &sst,
                chain_id,
                &self.registry,
                &new_tx_results(txs),
                Some(config.block_interval() / 2),
                config.max_block_size,
                &self.cache,
            )
        };
        if !leftover.is_empty() {
            self.tx_buffer.put_back(
                *chain_id,
                leftover.into_iter().map(|t| t.client_transaction).collect(),
            );
        }
        if result.tx_results.is_empty() {
            return Ok(());
        }

        self.publish(Event::ProposeBlock(ProposeBlockEvent {
            timestamp: SystemTime::now(),
            chain_id: *chain_id,
            index: latest.index + 1,
            tx_count: result.tx_results.len(),
        }));
        match self.create_new_block(Some(*chain_id), &config.roster, result.tx_results.clone()) {
            Ok(_) => Ok(()),
            Err(e) => {
                // The collective sign or store failed: re-buffer and retry next interval.
                self.tx_buffer.put_back(
                    *chain_id,
                    result
                        .tx_results
                        .into_iter()
                        .map(|t| t.client_transaction)
                        .collect(),
                );
                Err(e)
            }
        }
    }

    /// The leader's side of the collect-tx round: drain our own buffer, then poll every other
    /// roster member and concatenate their answers, preserving per-follower order.
    fn collect_txs(
        &self,
        chain_id: &ChainId,
        config: &ChainConfig,
        latest: &Block,
    ) -> Vec<ClientTransaction> {
        let me = self.node_id();
        let nonce = self.next_nonce();
        let req = CollectTxRequest {
            chain_id: *chain_id,
            leader: me,
            roster: config.roster.clone(),
            latest_block_id: latest.hash(),
            nonce,
        };
        let mut txs = self.get_txs(&me, &req);

        let others: Vec<NodeId> = config
            .roster
            .list
            .iter()
            .filter(|node| **node != me)
            .cloned()
            .collect();
        if others.is_empty() {
            return txs;
        }

        let (sender, receiver) = mpsc::channel();
        *self.collect_tx_responses.lock().unwrap() = Some((nonce, sender));
        for peer in &others {
            self.send(*peer, Message::CollectTxRequest(req.clone()));
        }

        let deadline = Instant::now() + self.config.collect_tx_window;
        let mut seen: HashSet<NodeId> = HashSet::new();
        while seen.len() < others.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match receiver.recv_timeout(remaining) {
                Ok((origin, resp)) if resp.nonce == nonce => {
                    if seen.insert(origin) {
                        txs.extend(resp.txs);
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        *self.collect_tx_responses.lock().unwrap() = None;
        txs
    }

    /// The follower's side of the collect-tx round. Checks that we know the chain, that the
    /// claimed latest block is our latest (otherwise triggers catch-up and answers empty), and
    /// that the claimed leader is our configured leader; then beats the heartbeat and drains the
    /// buffer.
    pub(crate) fn get_txs(
        &self,
        claimed_leader: &NodeId,
        req: &CollectTxRequest,
    ) -> Vec<ClientTransaction> {
        if self.is_closed() {
            return Vec::new();
        }
        let chain_id = req.chain_id;
        if self.block_store.genesis(&chain_id).is_none() {
            let mut unknown = self.unknown_chains.lock().unwrap();
            if unknown.insert(chain_id) {
                log::warn!("got asked for an unknown chain: {}", chain_id);
            }
            return Vec::new();
        }
        let Some(latest) = self.block_store.latest(&chain_id) else {
            return Vec::new();
        };
        if latest.hash() != req.latest_block_id {
            if self.block_store.get(&req.latest_block_id).is_none() {
                // The leader knows a block we do not: catch up (rate-limited) and answer empty
                // until we are back in sync.
                self.catchup_from_id(&req.roster, chain_id, req.latest_block_id);
            }
            return Vec::new();
        }
        let Ok(trie) = self.get_state_trie(&chain_id) else {
            return Vec::new();
        };
        let Ok(config) = load_config_from_trie(&trie) else {
            return Vec::new();
        };
        if config.roster.leader() != Some(claimed_leader) {
            log::warn!(
                "collect-tx came from a wrong leader {}, should be {:?}",
                claimed_leader,
                config.roster.leader()
            );
            return Vec::new();
        }
        self.heartbeats.beat(&chain_id);
        self.tx_buffer.take(&chain_id)
    }

    /* ↓↓↓ Block verification (follower) ↓↓↓ */

    /// Re-execute a proposed block and check that the leader's header commits to exactly what we
    /// compute. Run by the external consensus pipeline before this node signs off on a proposal.
    pub fn verify_proposal(&self, block: &Block) -> bool {
        let valid = self.verify_proposal_inner(block);
        self.publish(Event::VerifyBlock(VerifyBlockEvent {
            timestamp: SystemTime::now(),
            chain_id: block.chain_id(),
            index: block.index,
            valid,
        }));
        valid
    }

    fn verify_proposal_inner(&self, block: &Block) -> bool {
        let chain_id = block.chain_id();
        if self.viewchange.waiting(&chain_id) && is_view_change_tx(&block.body).is_none() {
            log::error!("not accepting blocks while a view-change is in progress");
            return false;
        }
        if block.index.int() == 0 {
            let Ok(nonce) = load_nonce_from_txs(&block.body) else {
                log::error!("genesis proposal carries no trie nonce");
                return false;
            };
            let sst = StagingStateTrie::<MemKVStore>::in_memory(nonce);
            self.verify_on(&sst, &chain_id, block)
        } else {
            let Ok(trie) = self.get_state_trie(&chain_id) else {
                log::error!("no state trie for proposed block's chain {}", chain_id);
                return false;
            };
            // Hold the trie write lock so a concurrent commit cannot mutate the snapshot under
            // the re-execution.
            let _guard = self.update_trie_lock.lock().unwrap();
            let sst = trie.staging();
            self.verify_on(&sst, &chain_id, block)
        }
    }

    fn verify_on<S: KVStore>(
        &self,
        sst: &StagingStateTrie<S>,
        chain_id: &ChainId,
        block: &Block,
    ) -> bool {
        let (result, _) = create_state_changes(
            sst,
            chain_id,
            &self.registry,
            &block.body,
            None,
            u64::MAX,
            &self.cache,
        );

        if result.tx_results.len() != block.body.len() {
            log::warn!("transaction list length mismatch after execution");
            return false;
        }
        for (ours, proposed) in result.tx_results.iter().zip(&block.body) {
            if ours.accepted != proposed.accepted {
                log::warn!("client transaction accept mismatch");
                return false;
            }
        }
        if tx_results_hash(&result.tx_results) != block.header.client_tx_hash {
            log::warn!("client transaction hash doesn't verify");
            return false;
        }
        if result.merkle_root != block.header.trie_root {
            log::warn!("trie root doesn't verify");
            return false;
        }
        if state_changes_hash(&result.state_changes) != block.header.state_changes_hash {
            log::warn!("state changes hash doesn't verify");
            return false;
        }

        // Load the configuration from the post-state and check the roster transition and the
        // timestamp window it defines.
        let mut post = sst.clone();
        if post.store_all(&result.state_changes).is_err() {
            return false;
        }
        let Ok(config) = load_config_from_trie(&post) else {
            log::warn!("no chain config in the block's post-state");
            return false;
        };
        if block.index.int() > 0 {
            if let Err(e) = config.check_new_roster(&block.roster) {
                log::error!("didn't accept the new roster: {}", e);
                return false;
            }
        }
        let window = std::cmp::max(4 * config.block_interval(), self.config.min_timestamp_window);
        if Timestamp::now().abs_diff(block.header.timestamp) > window {
            log::error!("block timestamp is outside the acceptable window");
            return false;
        }
        true
    }

    /* ↓↓↓ Commit pipeline ↓↓↓ */

    /// Apply a committed block to the chain's state. Invoked by the block store's commit
    /// callback; also the entry point for blocks arriving through catch-up.
    pub fn update_trie(&self, block: &Block) -> Result<(), ServiceError> {
        let _guard = self.update_trie_lock.lock().unwrap();
        if self.is_closed() {
            return Ok(());
        }
        let chain_id = block.chain_id();

        if block.index.int() == 0 && !self.has_state_trie(&chain_id) {
            let nonce = load_nonce_from_txs(&block.body)?;
            self.create_state_trie(&chain_id, nonce)?;
        }

        let mut trie = self.get_state_trie(&chain_id)?;
        let next = trie.get_index().map_or(0, |index| index.int() + 1);
        if block.index.int() < next {
            // A forward-link update of an already-applied block.
            return Ok(());
        }
        if block.index.int() > next {
            if self.is_catching_up(&chain_id) {
                log::warn!("got new block while catching up - ignoring block for now");
                return Ok(());
            }
            self.set_catching_up(&chain_id);
            let weak = self.weak.clone();
            let reference = block.clone();
            let handle = std::thread::spawn(move || {
                if let Some(service) = weak.upgrade() {
                    service.catch_up(reference);
                }
            });
            self.threads.lock().unwrap().push(handle);
            return Ok(());
        }

        log::debug!("updating transactions for {} on index {}", chain_id, block.index);
        let sst = trie.staging();
        let (_, max_size) = self.load_block_info(&chain_id);
        let (result, _) = create_state_changes(
            &sst,
            &chain_id,
            &self.registry,
            &block.body,
            None,
            max_size,
            &self.cache,
        );
        // The block store holds a collectively signed block here; failing to reproduce its root
        // means our state diverged, which is fatal for this chain.
        trie.verified_commit(&result.state_changes, block.index, &block.header.trie_root)
            .map_err(|e| {
                log::error!("halting chain {}: verified commit failed: {}", chain_id, e);
                ServiceError::Storage(e.to_string())
            })?;

        self.history
            .append(chain_id, &result.state_changes, block.index);

        // Wake the waiters before announcing the block, so inclusion waits cannot miss their
        // transaction.
        for tx in &block.body {
            self.notifications
                .inform_wait_channel(&tx.client_transaction.hash(), tx.accepted);
        }
        self.notifications.inform_block(&chain_id, block.hash());

        if block.index.int() == 0 {
            if let Ok(darc) = self.load_genesis_darc(&chain_id) {
                self.darc_to_chain
                    .lock()
                    .unwrap()
                    .insert(darc.base_id(), chain_id);
            }
        }

        self.after_commit_control(&chain_id, block, &trie);

        self.publish(Event::CommitBlock(CommitBlockEvent {
            timestamp: SystemTime::now(),
            chain_id,
            block: block.hash(),
            index: block.index,
        }));
        log::debug!(
            "updated trie for {} with root {}",
            chain_id,
            block.header.trie_root
        );
        Ok(())
    }

    /// Adjust the control plane after a commit: leader polling, heartbeats, and the view-change
    /// monitor, according to the (possibly rotated) roster in the new configuration.
    fn after_commit_control(&self, chain_id: &ChainId, block: &Block, trie: &StateTrie<K>) {
        let Ok(config) = load_config_from_trie(trie) else {
            log::error!("couldn't get configuration of the block");
            return;
        };
        let me = self.node_id();
        let node_in_new = config.roster.contains(&me);
        let node_is_leader = config.roster.leader() == Some(&me);
        let interval = config.block_interval();

        if node_is_leader {
            self.start_polling(*chain_id);
        } else {
            self.stop_polling(chain_id);
        }

        if node_in_new {
            self.heartbeats
                .start(*chain_id, interval * self.config.rotation_window);

            match is_view_change_tx(&block.body) {
                Some(view) if self.viewchange.started(chain_id) => {
                    self.viewchange.done(view);
                    if let Some(new_leader) = config.roster.leader() {
                        self.publish(Event::ViewChangeComplete(ViewChangeCompleteEvent {
                            timestamp: SystemTime::now(),
                            chain_id: *chain_id,
                            new_leader: *new_leader,
                        }));
                    }
                }
                _ => {
                    // A fresh block invalidates any accumulated view-change state.
                    self.start_viewchange_monitor(*chain_id, interval, &config.roster);
                }
            }
        } else {
            self.heartbeats.stop(chain_id);
            if self.viewchange.started(chain_id) {
                self.viewchange.stop(chain_id);
            }
        }
    }

    /* ↓↓↓ View change wiring ↓↓↓ */

    pub(crate) fn start_viewchange_monitor(
        &self,
        chain_id: ChainId,
        interval: Duration,
        roster: &Roster,
    ) {
        let initial = std::cmp::min(interval * self.config.rotation_window, 2 * interval);
        let weak_send = self.weak.clone();
        let weak_new_view = self.weak.clone();
        let weak_leader = self.weak.clone();
        self.viewchange.start(
            chain_id,
            initial,
            roster.fault_threshold(),
            Box::new(move |req: &InitReq| {
                if let Some(service) = weak_send.upgrade() {
                    // The monitor hands us an unsigned stub; sign it before broadcasting.
                    let signed = InitReq::new(req.signer, req.view, &service.config.keypair);
                    service.publish(Event::ViewChangeStart(ViewChangeStartEvent {
                        timestamp: SystemTime::now(),
                        chain_id: req.view.chain_id,
                        leader_index: req.view.leader_index,
                    }));
                    service.broadcast(Message::ViewChangeInit(signed));
                }
            }),
            Box::new(move |view: &View| {
                // Run the candidate's phase two off the monitor thread: it commits a block and
                // must not hold the monitor up.
                let weak = weak_new_view.clone();
                let view = *view;
                std::thread::spawn(move || {
                    if let Some(service) = weak.upgrade() {
                        if let Err(e) = service.propose_view_change(&view) {
                            log::error!("view-change proposal failed: {}", e);
                        }
                    }
                });
            }),
            Box::new(move |view: &View| {
                weak_leader
                    .upgrade()
                    .map(|service| service.is_candidate_leader(view))
                    .unwrap_or(false)
            }),
        );
    }

    fn is_candidate_leader(&self, view: &View) -> bool {
        let Some(block) = self.block_store.get(&view.latest_block_id) else {
            return false;
        };
        if block.roster.is_empty() {
            return false;
        }
        let index = (view.leader_index as usize) % block.roster.len();
        block.roster.list[index] == self.node_id()
    }

    /// Phase two of the view change, run by the candidate leader: collectively sign the view
    /// over the rotated roster and commit it as a single-instruction transaction.
    fn propose_view_change(&self, view: &View) -> Result<(), ServiceError> {
        let trie = self.get_state_trie(&view.chain_id)?;
        let config = load_config_from_trie(&trie)?;
        let rotated = config.roster.rotated(view.leader_index as usize);
        let signature = self.cosigner.collective_sign(&rotated, &view.bytes())?;
        let req = NewViewReq {
            view: *view,
            signature,
        };
        let instruction = Instruction::new(
            CONFIG_INSTANCE_ID,
            InstructionBody::Invoke(Invoke {
                contract_id: CONTRACT_CONFIG_ID.to_string(),
                command: "view_change".to_string(),
                args: Arguments::new(vec![Argument {
                    name: "newview".to_string(),
                    value: req.to_bytes(),
                }]),
            }),
        );
        let ctx = ClientTransaction::new(vec![instruction]);
        self.create_new_block(Some(view.chain_id), &rotated, new_tx_results(vec![ctx]))?;
        Ok(())
    }

    pub(crate) fn on_heartbeat_timeout(&self, chain_id: ChainId) {
        log::debug!("missed heartbeat for {}", chain_id);
        let Some(latest) = self.block_store.latest(&chain_id) else {
            log::error!(
                "heartbeat monitors are started after the creation of the genesis block, \
                 so the block should always exist"
            );
            self.heartbeats.stop(&chain_id);
            return;
        };
        let view = View {
            chain_id,
            latest_block_id: latest.hash(),
            leader_index: 1,
        };
        let req = InitReq::new(self.node_id(), view, &self.config.keypair);
        self.broadcast(Message::ViewChangeInit(req.clone()));
        self.viewchange.add_req(req);
    }

    /* ↓↓↓ Message loop ↓↓↓ */

    fn spawn_message_loop(&self) {
        let weak = self.weak.clone();
        let handle = std::thread::spawn(move || loop {
            let Some(service) = weak.upgrade() else { return };
            if service.is_closed() {
                return;
            }
            let received = service.network.lock().unwrap().recv();
            match received {
                Some((origin, message)) => service.handle_message(origin, message),
                None => {
                    drop(service);
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        });
        self.threads.lock().unwrap().push(handle);
    }

    fn spawn_heartbeat_monitor(&self, timeouts: Receiver<ChainId>) {
        let weak = self.weak.clone();
        let handle = std::thread::spawn(move || loop {
            let Some(service) = weak.upgrade() else { return };
            if service.is_closed() {
                return;
            }
            drop(service);
            match timeouts.recv_timeout(Duration::from_millis(200)) {
                Ok(chain_id) => {
                    if let Some(service) = weak.upgrade() {
                        service.on_heartbeat_timeout(chain_id);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        });
        self.threads.lock().unwrap().push(handle);
    }

    pub(crate) fn handle_message(&self, origin: NodeId, message: Message) {
        match message {
            Message::CollectTxRequest(req) => {
                let txs = self.get_txs(&origin, &req);
                let resp = CollectTxResponse {
                    chain_id: req.chain_id,
                    nonce: req.nonce,
                    txs,
                };
                self.send(origin, Message::CollectTxResponse(resp));
            }
            Message::CollectTxResponse(resp) => {
                let slot = self.collect_tx_responses.lock().unwrap();
                if let Some((nonce, sender)) = &*slot {
                    if resp.nonce == *nonce {
                        let _ = sender.send((origin, resp));
                    }
                }
            }
            Message::ViewChangeInit(req) => {
                if !req.is_correct() {
                    log::warn!("dropping view-change request with a bad signature");
                    return;
                }
                if req.signer != origin {
                    log::warn!("dropping relayed view-change request");
                    return;
                }
                self.viewchange.add_req(req);
            }
            Message::BlockSyncRequest(req) => {
                let blocks = self.serve_blocks(&req);
                let resp = BlockSyncResponse {
                    chain_id: req.chain_id,
                    nonce: req.nonce,
                    blocks,
                };
                self.send(origin, Message::BlockSyncResponse(resp));
            }
            Message::BlockSyncResponse(resp) => {
                let slot = self.sync_responses.lock().unwrap();
                if let Some((nonce, sender)) = &*slot {
                    if resp.nonce == *nonce {
                        let _ = sender.send(resp);
                    }
                }
            }
            Message::DownloadStateRequest(req) => {
                let resp = match self.download_state(req) {
                    Ok(resp) => resp,
                    Err(e) => {
                        log::warn!("state download request failed: {}", e);
                        DownloadStateResponse {
                            nonce: 0,
                            key_values: Vec::new(),
                        }
                    }
                };
                self.send(origin, Message::DownloadStateResponse(resp));
            }
            Message::DownloadStateResponse(resp) => {
                let slot = self.download_responses.lock().unwrap();
                if let Some(sender) = &*slot {
                    let _ = sender.send(resp);
                }
            }
        }
    }

    fn serve_blocks(&self, req: &BlockSyncRequest) -> Vec<Block> {
        if req.from_index.int() == u64::MAX {
            return self
                .block_store
                .latest(&req.chain_id)
                .into_iter()
                .collect();
        }
        let mut blocks = Vec::new();
        for i in 0..req.limit as u64 {
            match self
                .block_store
                .by_index(&req.chain_id, req.from_index + i)
            {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        blocks
    }

    /* ↓↓↓ Startup ↓↓↓ */

    /// Reload every stored chain: restart polling where we lead, heartbeats and view-change
    /// monitors where we follow, then catch up all chains in the background.
    fn start_all_chains(&self) {
        let me = self.node_id();
        for chain_id in self.block_store.chain_ids() {
            if self.block_store.genesis(&chain_id).is_none() {
                log::error!("ignoring chain with missing genesis block {}", chain_id);
                continue;
            }
            let (interval, _) = self.load_block_info(&chain_id);
            if let Ok(trie) = self.get_state_trie(&chain_id) {
                if let Ok(config) = load_config_from_trie(&trie) {
                    if config.roster.leader() == Some(&me) {
                        log::debug!("starting as a leader for chain {}", chain_id);
                        self.start_polling(chain_id);
                    }
                    if config.roster.contains(&me) {
                        self.heartbeats
                            .start(chain_id, interval * self.config.rotation_window);
                        self.start_viewchange_monitor(chain_id, interval, &config.roster);
                    }
                }
                if let Ok(darc) = self.load_genesis_darc(&chain_id) {
                    self.darc_to_chain
                        .lock()
                        .unwrap()
                        .insert(darc.base_id(), chain_id);
                }
            }
        }

        // Catching up all chains runs in the background so it doesn't hold up startup.
        let weak = self.weak.clone();
        let handle = std::thread::spawn(move || {
            let chains = match weak.upgrade() {
                Some(service) => service.block_store.chain_ids(),
                None => return,
            };
            for chain_id in chains {
                let Some(service) = weak.upgrade() else { return };
                if service.is_closed() {
                    return;
                }
                if let Some(latest) = service.block_store.latest(&chain_id) {
                    if service.set_catching_up(&chain_id) {
                        service.catch_up(latest);
                    }
                }
            }
        });
        self.threads.lock().unwrap().push(handle);
    }
}

/// The trie nonce of a genesis block, read from the bootstrap spawn's arguments.
pub(crate) fn load_nonce_from_txs(txs: &[TxResult]) -> Result<Nonce, ServiceError> {
    let first = txs
        .first()
        .ok_or_else(|| ServiceError::InvalidInput("no transactions".to_string()))?;
    let instructions = &first.client_transaction.instructions;
    if instructions.len() != 1 {
        return Err(ServiceError::InvalidInput(format!(
            "expected 1 instruction, got {}",
            instructions.len()
        )));
    }
    let InstructionBody::Spawn(spawn) = &instructions[0].body else {
        return Err(ServiceError::InvalidInput(
            "first instruction is not a Spawn".to_string(),
        ));
    };
    match spawn.args.search("trie_nonce") {
        Some(nonce) if !nonce.is_empty() => Ok(Nonce::from_slice(nonce)),
        _ => Err(ServiceError::InvalidInput("nonce is empty".to_string())),
    }
}

/// Whether a block body is exactly one view-change transaction, and if so, which view it
/// installs.
pub(crate) fn is_view_change_tx(body: &[TxResult]) -> Option<View> {
    if body.len() != 1 {
        // A view-change block must only have this one transaction.
        return None;
    }
    let instructions = &body[0].client_transaction.instructions;
    if instructions.len() != 1 {
        return None;
    }
    let InstructionBody::Invoke(invoke) = &instructions[0].body else {
        return None;
    };
    if invoke.command != "view_change" {
        return None;
    }
    let req = NewViewReq::from_bytes(invoke.args.search("newview")?)?;
    Some(req.view)
}

/// A helper for building the signature required by [Service::debug_remove]: sign the chain id
/// with the node's own key.
pub fn sign_debug_remove(keypair: &ed25519_dalek::SigningKey, chain_id: &ChainId) -> Vec<u8> {
    use ed25519_dalek::Signer;
    keypair.sign(&chain_id.bytes()).to_bytes().to_vec()
}
