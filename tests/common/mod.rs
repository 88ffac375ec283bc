/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The shared test harness: a cluster of in-process services wired together with a channel-based
//! network stub, in-memory block stores, and a mock collective signer.
//!
//! Block distribution mirrors the production pipeline: when one node stores a block, the harness
//! runs the follower verifier on every other in-sync, online node and stores the block there on
//! success. Taking a node offline cuts both its network traffic and its block deliveries, so it
//! genuinely falls behind and has to catch up.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use byzcoin_rs::block_store::{BlockStore, CoSiError, CollectiveSigner, MemBlockStore};
use byzcoin_rs::config::Configuration;
use byzcoin_rs::contracts::ContractRegistry;
use byzcoin_rs::darc::{Darc, DarcSigner, Identity};
use byzcoin_rs::event_bus::EventHandlers;
use byzcoin_rs::messages::*;
use byzcoin_rs::networking::Network;
use byzcoin_rs::service::Service;
use byzcoin_rs::state::MemKVStore;
use byzcoin_rs::types::basic::{
    ChainId, InstanceId, NodeId, SignatureBytes, CURRENT_VERSION,
};
use byzcoin_rs::types::block::{Block, Roster};
use byzcoin_rs::types::transaction::{
    Argument, Arguments, ClientTransaction, Instruction, InstructionBody, Invoke, Spawn,
};

pub type TestService = Service<MemKVStore, NetworkStub>;

static LOGGER_INIT: Once = Once::new();

/// Set up a logger that prints all messages with level Debug and above.
pub fn setup_logger() {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    message
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stdout())
            .apply()
            .unwrap();
    })
}

/// A mock network which passes messages from and to services using channels. Messages from or to
/// offline nodes are dropped.
#[derive(Clone)]
pub struct NetworkStub {
    my_id: NodeId,
    all_peers: Arc<Mutex<HashMap<NodeId, Sender<(NodeId, Message)>>>>,
    inbox: Arc<Mutex<Receiver<(NodeId, Message)>>>,
    online: Arc<Mutex<HashSet<NodeId>>>,
}

impl Network for NetworkStub {
    fn send(&mut self, peer: NodeId, message: Message) {
        {
            let online = self.online.lock().unwrap();
            if !online.contains(&self.my_id) || !online.contains(&peer) {
                return;
            }
        }
        if let Some(sender) = self.all_peers.lock().unwrap().get(&peer) {
            let _ = sender.send((self.my_id, message));
        }
    }

    fn broadcast(&mut self, message: Message) {
        let peers: Vec<NodeId> = self.all_peers.lock().unwrap().keys().cloned().collect();
        for peer in peers {
            if peer != self.my_id {
                self.send(peer, message.clone());
            }
        }
    }

    fn recv(&mut self) -> Option<(NodeId, Message)> {
        self.inbox.lock().unwrap().try_recv().ok()
    }
}

fn mock_network(
    ids: &[NodeId],
    online: Arc<Mutex<HashSet<NodeId>>>,
) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let mut inboxes = Vec::new();
    for id in ids {
        let (sender, receiver) = mpsc::channel();
        all_peers.insert(*id, sender);
        inboxes.push((*id, receiver));
    }
    let all_peers = Arc::new(Mutex::new(all_peers));
    inboxes
        .into_iter()
        .map(|(my_id, inbox)| NetworkStub {
            my_id,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            online: online.clone(),
        })
        .collect()
}

/// A deterministic stand-in for the BLS collective signature: a hash over the sorted roster
/// members and the message. Order-insensitive in the roster, so a signature made over a rotated
/// roster verifies against the pre-rotation one.
pub struct TestCoSigner;

fn mock_cosign(roster: &Roster, msg: &[u8]) -> SignatureBytes {
    let mut members: Vec<[u8; 32]> = roster.list.iter().map(|n| n.bytes()).collect();
    members.sort();
    let mut out = [0u8; 64];
    for (round, chunk) in out.chunks_mut(32).enumerate() {
        let mut hasher = Sha256::new();
        hasher.update([round as u8]);
        for member in &members {
            hasher.update(member);
        }
        hasher.update(msg);
        chunk.copy_from_slice(&hasher.finalize());
    }
    SignatureBytes::new(out)
}

impl CollectiveSigner for TestCoSigner {
    fn collective_sign(&self, roster: &Roster, msg: &[u8]) -> Result<SignatureBytes, CoSiError> {
        Ok(mock_cosign(roster, msg))
    }

    fn verify(
        &self,
        roster: &Roster,
        _threshold: usize,
        msg: &[u8],
        sig: &SignatureBytes,
    ) -> bool {
        *sig == mock_cosign(roster, msg)
    }
}

pub struct Cluster {
    pub nodes: Vec<Arc<TestService>>,
    pub node_keys: Vec<SigningKey>,
    pub stores: Vec<Arc<MemBlockStore>>,
    pub online: Arc<Mutex<HashSet<NodeId>>>,
}

impl Cluster {
    /// Create a cluster of `n` services with test-friendly timings; `tweak` can adjust each
    /// node's configuration further.
    pub fn new(n: usize, tweak: impl Fn(&mut Configuration)) -> Cluster {
        setup_logger();

        let mut csprng = OsRng;
        let node_keys: Vec<SigningKey> =
            (0..n).map(|_| SigningKey::generate(&mut csprng)).collect();
        let ids: Vec<NodeId> = node_keys
            .iter()
            .map(|k| NodeId::new(k.verifying_key().to_bytes()))
            .collect();
        let online = Arc::new(Mutex::new(ids.iter().cloned().collect::<HashSet<_>>()));
        let stubs = mock_network(&ids, online.clone());
        let cosigner: Arc<dyn CollectiveSigner> = Arc::new(TestCoSigner);

        let mut nodes = Vec::new();
        let mut stores = Vec::new();
        for (key, stub) in node_keys.iter().zip(stubs) {
            let store = Arc::new(MemBlockStore::new());
            let mut config = Configuration::new(key.clone());
            config.log_events = true;
            config.catchup_min_interval = Duration::from_millis(100);
            config.collect_tx_window = Duration::from_millis(150);
            config.sync_response_timeout = Duration::from_secs(2);
            tweak(&mut config);
            let service = Service::start(
                config,
                ContractRegistry::standard(cosigner.clone()),
                MemKVStore::new(),
                store.clone() as Arc<dyn BlockStore>,
                cosigner.clone(),
                stub,
                EventHandlers::default_handlers(true),
            )
            .unwrap();
            nodes.push(service);
            stores.push(store);
        }

        // Block distribution: a block stored on one node is verified and stored on every other
        // online, in-sync node.
        for i in 0..n {
            let targets: Vec<(NodeId, std::sync::Weak<TestService>, Arc<MemBlockStore>)> = (0..n)
                .filter(|j| *j != i)
                .map(|j| (ids[j], Arc::downgrade(&nodes[j]), stores[j].clone()))
                .collect();
            let online = online.clone();
            stores[i].register_commit_callback(Box::new(move |block: &Block| {
                for (id, service, store) in &targets {
                    if !online.lock().unwrap().contains(id) {
                        continue;
                    }
                    if store.get(&block.hash()).is_some() {
                        continue;
                    }
                    let next = store
                        .latest(&block.chain_id())
                        .map_or(0, |latest| latest.index.int() + 1);
                    if block.index.int() != next {
                        // The node is behind; it catches up on its own.
                        continue;
                    }
                    let Some(service) = service.upgrade() else { continue };
                    if service.verify_proposal(block) {
                        let _ = store.store(block.clone());
                    } else {
                        log::error!(
                            "follower {} refused block {} of chain {}",
                            id,
                            block.index,
                            block.chain_id()
                        );
                    }
                }
            }));
        }

        Cluster {
            nodes,
            node_keys,
            stores,
            online,
        }
    }

    pub fn roster(&self) -> Roster {
        Roster::new(
            self.node_keys
                .iter()
                .map(|k| NodeId::new(k.verifying_key().to_bytes()))
                .collect(),
        )
    }

    pub fn node_id(&self, i: usize) -> NodeId {
        NodeId::new(self.node_keys[i].verifying_key().to_bytes())
    }

    pub fn set_offline(&self, i: usize) {
        self.online.lock().unwrap().remove(&self.node_id(i));
    }

    pub fn set_online(&self, i: usize) {
        self.online.lock().unwrap().insert(self.node_id(i));
    }

    /// Create a ledger with a genesis DARC held by `signer`, granting the extra rules on top of
    /// the administrative ones.
    pub fn create_ledger(
        &self,
        signer: &DarcSigner,
        extra_rules: &[&str],
        interval: Duration,
    ) -> (ChainId, Darc) {
        let mut genesis_darc = Darc::genesis(&[signer.identity()], b"genesis darc");
        for rule in extra_rules {
            genesis_darc.rules.set(rule, &signer.identity().string());
        }
        let resp = self.nodes[0]
            .create_genesis_block(CreateGenesisBlockRequest {
                version: CURRENT_VERSION,
                roster: self.roster(),
                genesis_darc: genesis_darc.clone(),
                block_interval_ns: interval.as_nanos() as u64,
                max_block_size: 0,
                darc_contract_ids: vec!["darc".to_string()],
            })
            .unwrap();
        (resp.chain_id, genesis_darc)
    }

    pub fn close(&self) {
        for node in &self.nodes {
            node.close();
        }
    }
}

/// Poll a condition until it holds or the timeout expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// A client with a signer and its monotonically increasing counter.
pub struct Client {
    pub signer: DarcSigner,
    counter: u64,
}

impl Client {
    pub fn new() -> Client {
        Client {
            signer: DarcSigner::new(SigningKey::generate(&mut OsRng)),
            counter: 0,
        }
    }

    pub fn identity(&self) -> Identity {
        self.signer.identity()
    }

    fn next_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Build and sign a transaction from (instance, body) pairs, assigning consecutive counters.
    pub fn transaction(&mut self, parts: Vec<(InstanceId, InstructionBody)>) -> ClientTransaction {
        let instructions = parts
            .into_iter()
            .map(|(instance_id, body)| {
                let mut instr = Instruction::new(instance_id, body);
                instr.signer_counters = vec![self.next_counter()];
                instr
            })
            .collect();
        let mut ct = ClientTransaction::new(instructions);
        ct.fill_signers_and_sign_with(std::slice::from_ref(&self.signer))
            .unwrap();
        ct
    }
}

/// The coin instance id spawned with a `coinID` seed: SHA-256 over the contract name and the
/// seed.
pub fn coin_instance_id(seed: &[u8]) -> InstanceId {
    let mut hasher = Sha256::new();
    hasher.update(b"coin");
    hasher.update(seed);
    InstanceId::new(hasher.finalize().into())
}

pub fn spawn_coin(darc_instance: InstanceId, seed: &[u8]) -> (InstanceId, InstructionBody) {
    (
        darc_instance,
        InstructionBody::Spawn(Spawn {
            contract_id: "coin".to_string(),
            args: Arguments::new(vec![Argument {
                name: "coinID".to_string(),
                value: seed.to_vec(),
            }]),
        }),
    )
}

pub fn mint_coin(coin: InstanceId, amount: u64) -> (InstanceId, InstructionBody) {
    (
        coin,
        InstructionBody::Invoke(Invoke {
            contract_id: "coin".to_string(),
            command: "mint".to_string(),
            args: Arguments::new(vec![Argument {
                name: "coins".to_string(),
                value: amount.to_le_bytes().to_vec(),
            }]),
        }),
    )
}

pub fn transfer_coin(
    from: InstanceId,
    to: InstanceId,
    amount: u64,
) -> (InstanceId, InstructionBody) {
    (
        from,
        InstructionBody::Invoke(Invoke {
            contract_id: "coin".to_string(),
            command: "transfer".to_string(),
            args: Arguments::new(vec![
                Argument {
                    name: "coins".to_string(),
                    value: amount.to_le_bytes().to_vec(),
                },
                Argument {
                    name: "destination".to_string(),
                    value: to.bytes().to_vec(),
                },
            ]),
        }),
    )
}

/// Read a coin's value through a proof from the given node.
pub fn coin_value(node: &Arc<TestService>, chain_id: ChainId, coin: InstanceId) -> Option<u64> {
    let block = node
        .get_proof(GetProofRequest {
            version: CURRENT_VERSION,
            chain_id,
            block_id: latest_block_id(node, &chain_id)?,
            key: coin,
        })
        .ok()?;
    let (_, value) = block.proof.key_value()?;
    let body =
        byzcoin_rs::types::transaction::StateChangeBody::from_bytes(value).ok()?;
    let coin: byzcoin_rs::contracts::Coin =
        borsh::BorshDeserialize::try_from_slice(&body.value).ok()?;
    Some(coin.value)
}

/// Read a coin's value straight out of a node's trie dump. Unlike [coin_value] this works even
/// when the node has no block matching its trie index yet (right after a full-state download).
pub fn coin_value_from_dump(
    node: &Arc<TestService>,
    chain_id: ChainId,
    coin: InstanceId,
) -> Option<u64> {
    let dump = node
        .debug_dump(DebugRequest {
            chain_id: Some(chain_id),
        })
        .ok()?;
    let entry = dump.dump.into_iter().find(|entry| entry.key == coin)?;
    let coin: byzcoin_rs::contracts::Coin =
        borsh::BorshDeserialize::try_from_slice(&entry.state.value).ok()?;
    Some(coin.value)
}

pub fn latest_block_id(
    node: &Arc<TestService>,
    chain_id: &ChainId,
) -> Option<byzcoin_rs::types::basic::BlockId> {
    node.debug_dump(DebugRequest { chain_id: None })
        .ok()?
        .chains
        .iter()
        .find(|c| c.chain_id == *chain_id)?
        .latest
        .as_ref()
        .map(|b| b.hash())
}
