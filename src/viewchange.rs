/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The view-change sub-protocol that replaces an unresponsive leader.
//!
//! Each node runs one monitor per chain. A missed heartbeat makes the node broadcast an
//! [InitReq] for the view with `leader_index = 1`. The monitor accumulates equal requests from
//! distinct signers:
//! - at `f + 1` requests it joins in (broadcasts its own request, if it has not already) and
//!   enters the *waiting* state, during which the block verifier rejects any block that is not
//!   itself a view-change transaction;
//! - at `2f + 1` requests it escalates to phase two: the candidate leader
//!   (`roster[leader_index mod n]`) runs a collective-signing round over the [NewViewReq] and
//!   submits it as a single-instruction `invoke:config.view_change` transaction, which rotates
//!   the roster once committed in a block.
//!
//! If the waiting deadline expires before the new-view block commits, the leader index is
//! incremented and phase one restarts; the round duration doubles each retry, up to a cap of 8×
//! the initial duration.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::types::basic::{BlockId, ChainId, NodeId, SignatureBytes};

/// Growth cap for the per-round waiting duration, as a multiple of the initial duration.
const MAX_ROUND_GROWTH: u32 = 8;

/// The view a node wants to move to: the chain, the latest block it knows, and the index of the
/// roster member that should lead next.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, BorshDeserialize, BorshSerialize)]
pub struct View {
    pub chain_id: ChainId,
    pub latest_block_id: BlockId,
    pub leader_index: u32,
}

impl View {
    /// The canonical bytes signed by both phases of the protocol.
    pub fn bytes(&self) -> Vec<u8> {
        self.try_to_vec().expect("view serialization is infallible")
    }
}

/// Phase-one message: one node's signed request to move to a view.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct InitReq {
    pub signer: NodeId,
    pub view: View,
    pub signature: Vec<u8>,
}

impl InitReq {
    pub fn new(signer: NodeId, view: View, signing_key: &ed25519_dalek::SigningKey) -> InitReq {
        use ed25519_dalek::Signer;
        let signature = signing_key.sign(&view.bytes()).to_bytes().to_vec();
        InitReq {
            signer,
            view,
            signature,
        }
    }

    /// Verify the signature against the signer's public key.
    pub fn is_correct(&self) -> bool {
        use ed25519_dalek::Verifier;
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&self.signer.bytes()) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(self.signature.as_slice()) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify(&self.view.bytes(), &signature).is_ok()
    }
}

/// Phase-two message: the collectively signed decision to move to a view. Submitted on-chain as
/// the argument of an `invoke:config.view_change` instruction.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct NewViewReq {
    pub view: View,
    pub signature: SignatureBytes,
}

impl NewViewReq {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.try_to_vec()
            .expect("new view request serialization is infallible")
    }

    pub fn from_bytes(buf: &[u8]) -> Option<NewViewReq> {
        NewViewReq::try_from_slice(buf).ok()
    }
}

/// Broadcasts an [InitReq] to the other members of the roster.
pub type SendInitReqFn = Box<dyn Fn(&InitReq) + Send>;

/// Runs phase two as the candidate leader: collective-sign the view and submit the view-change
/// transaction.
pub type StartNewViewFn = Box<dyn Fn(&View) + Send>;

/// Whether this node is the candidate leader of a view.
pub type IsLeaderFn = Box<dyn Fn(&View) -> bool + Send>;

enum Command {
    AddReq(InitReq),
    Done(View),
    Stop,
}

struct Monitor {
    sender: Sender<Command>,
    waiting: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// The per-chain view-change monitors of one node.
pub struct ViewChangeManager {
    me: NodeId,
    monitors: Mutex<HashMap<ChainId, Monitor>>,
}

impl ViewChangeManager {
    pub fn new(me: NodeId) -> ViewChangeManager {
        ViewChangeManager {
            me,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Start the monitor for a chain. An already-running monitor for the chain is stopped first,
    /// which resets its state; the service calls this after every committed block.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        chain_id: ChainId,
        initial_duration: Duration,
        fault_threshold: usize,
        send_req: SendInitReqFn,
        start_new_view: StartNewViewFn,
        is_leader: IsLeaderFn,
    ) {
        self.stop(&chain_id);
        let waiting = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel();
        let me = self.me;
        let waiting_in_thread = waiting.clone();
        let handle = std::thread::spawn(move || {
            let mut state = MonitorState {
                me,
                chain_id,
                fault_threshold,
                initial_duration,
                round_duration: initial_duration,
                requests: HashMap::new(),
                current_view: None,
                sent_own: false,
                escalated: false,
                deadline: None,
                waiting: waiting_in_thread,
                send_req,
                start_new_view,
                is_leader,
            };
            loop {
                let timeout = match state.deadline {
                    Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                    None => Duration::from_secs(3600),
                };
                match receiver.recv_timeout(timeout) {
                    Ok(Command::AddReq(req)) => state.add_req(req),
                    Ok(Command::Done(view)) => {
                        if state.done(view) {
                            return;
                        }
                    }
                    Ok(Command::Stop) => return,
                    Err(RecvTimeoutError::Timeout) => state.on_timeout(),
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        });
        self.monitors.lock().unwrap().insert(
            chain_id,
            Monitor {
                sender,
                waiting,
                handle: Some(handle),
            },
        );
    }

    /// Feed a (verified) view-change request into the chain's monitor.
    pub fn add_req(&self, req: InitReq) {
        let monitors = self.monitors.lock().unwrap();
        if let Some(monitor) = monitors.get(&req.view.chain_id) {
            let _ = monitor.sender.send(Command::AddReq(req));
        }
    }

    /// Inform the monitor that a view-change block for this view was committed.
    pub fn done(&self, view: View) {
        let monitors = self.monitors.lock().unwrap();
        if let Some(monitor) = monitors.get(&view.chain_id) {
            let _ = monitor.sender.send(Command::Done(view));
        }
    }

    /// Whether the chain's monitor is currently waiting for a view change to complete. While
    /// waiting, only view-change blocks are accepted.
    pub fn waiting(&self, chain_id: &ChainId) -> bool {
        let monitors = self.monitors.lock().unwrap();
        monitors
            .get(chain_id)
            .map(|m| m.waiting.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn started(&self, chain_id: &ChainId) -> bool {
        self.monitors.lock().unwrap().contains_key(chain_id)
    }

    pub fn stop(&self, chain_id: &ChainId) {
        let monitor = self.monitors.lock().unwrap().remove(chain_id);
        if let Some(mut monitor) = monitor {
            let _ = monitor.sender.send(Command::Stop);
            if let Some(handle) = monitor.handle.take() {
                let _ = handle.join();
            }
        }
    }

    pub fn close_all(&self) {
        let chains: Vec<ChainId> = self.monitors.lock().unwrap().keys().cloned().collect();
        for chain in chains {
            self.stop(&chain);
        }
    }
}

struct MonitorState {
    me: NodeId,
    chain_id: ChainId,
    fault_threshold: usize,
    initial_duration: Duration,
    round_duration: Duration,
    requests: HashMap<View, HashSet<NodeId>>,
    current_view: Option<View>,
    sent_own: bool,
    escalated: bool,
    deadline: Option<Instant>,
    waiting: Arc<AtomicBool>,
    send_req: SendInitReqFn,
    start_new_view: StartNewViewFn,
    is_leader: IsLeaderFn,
}

impl MonitorState {
    fn add_req(&mut self, req: InitReq) {
        if req.view.chain_id != self.chain_id {
            return;
        }
        if !self.requests.entry(req.view).or_default().insert(req.signer) {
            return;
        }
        if req.signer == self.me && !self.sent_own {
            self.sent_own = true;
            self.enter_waiting(req.view);
        }
        // Phase 1 amplification: join the view change once f+1 distinct signers ask for the same
        // view, even if our own heartbeat has not fired.
        let count = self.requests.get(&req.view).map_or(0, |s| s.len());
        if count >= self.fault_threshold + 1 && !self.sent_own {
            self.sent_own = true;
            self.enter_waiting(req.view);
            (self.send_req)(&own_req(self.me, req.view));
            self.requests.entry(req.view).or_default().insert(self.me);
        }
        // Phase 2: with 2f+1 distinct signers, the candidate leader runs the collective signing
        // round and submits the view-change transaction.
        let count = self.requests.get(&req.view).map_or(0, |s| s.len());
        if count >= 2 * self.fault_threshold + 1 && !self.escalated && (self.is_leader)(&req.view)
        {
            self.escalated = true;
            log::info!(
                "ViewChangeEscalate, {}, {}",
                req.view.chain_id,
                req.view.leader_index
            );
            (self.start_new_view)(&req.view);
        }
    }

    fn enter_waiting(&mut self, view: View) {
        self.current_view = Some(view);
        self.waiting.store(true, Ordering::SeqCst);
        self.deadline = Some(Instant::now() + self.round_duration);
    }

    fn on_timeout(&mut self) {
        let Some(view) = self.current_view else {
            self.deadline = None;
            return;
        };
        // The candidate did not get its block committed in time: rotate further and restart
        // phase 1 with a doubled round duration.
        let next = View {
            chain_id: view.chain_id,
            latest_block_id: view.latest_block_id,
            leader_index: view.leader_index + 1,
        };
        let cap = self.initial_duration * MAX_ROUND_GROWTH;
        self.round_duration = (self.round_duration * 2).min(cap);
        self.requests.clear();
        self.escalated = false;
        self.sent_own = true;
        self.enter_waiting(next);
        (self.send_req)(&own_req(self.me, next));
        self.requests.entry(next).or_default().insert(self.me);
    }

    /// Any committed view change of this chain ends the current round: leadership rotated, so
    /// the accumulated state is stale regardless of which view won. Returns true when the
    /// monitor should shut down (it never does on done; the service restarts monitors per
    /// block).
    fn done(&mut self, _view: View) -> bool {
        self.requests.clear();
        self.current_view = None;
        self.sent_own = false;
        self.escalated = false;
        self.deadline = None;
        self.round_duration = self.initial_duration;
        self.waiting.store(false, Ordering::SeqCst);
        false
    }
}

/// The monitor thread holds no keypair; the service's send callback re-signs the request before
/// broadcasting. This stub carries the signer and view only.
fn own_req(signer: NodeId, view: View) -> InitReq {
    InitReq {
        signer,
        view,
        signature: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(leader_index: u32) -> View {
        View {
            chain_id: ChainId::new([1u8; 32]),
            latest_block_id: BlockId::new([2u8; 32]),
            leader_index,
        }
    }

    fn req(signer_byte: u8, v: View) -> InitReq {
        InitReq {
            signer: NodeId::new([signer_byte; 32]),
            view: v,
            signature: Vec::new(),
        }
    }

    fn manager_with_counters(
        fault_threshold: usize,
        is_leader: bool,
    ) -> (
        ViewChangeManager,
        Arc<Mutex<Vec<InitReq>>>,
        Arc<Mutex<Vec<View>>>,
    ) {
        let me = NodeId::new([0xee; 32]);
        let manager = ViewChangeManager::new(me);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let escalated = Arc::new(Mutex::new(Vec::new()));
        let sent_cb = sent.clone();
        let escalated_cb = escalated.clone();
        manager.start(
            view(1).chain_id,
            Duration::from_secs(60),
            fault_threshold,
            Box::new(move |r: &InitReq| sent_cb.lock().unwrap().push(r.clone())),
            Box::new(move |v: &View| escalated_cb.lock().unwrap().push(*v)),
            Box::new(move |_| is_leader),
        );
        (manager, sent, escalated)
    }

    fn settle() {
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn joins_at_f_plus_one_and_escalates_at_two_f_plus_one() {
        // f = 2: join at 3 equal requests (our own then counts too), escalate at 5.
        let (manager, sent, escalated) = manager_with_counters(2, true);
        let v = view(1);

        manager.add_req(req(1, v));
        manager.add_req(req(2, v));
        settle();
        assert!(sent.lock().unwrap().is_empty());
        assert!(!manager.waiting(&v.chain_id));

        manager.add_req(req(3, v));
        settle();
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert!(manager.waiting(&v.chain_id));
        assert!(escalated.lock().unwrap().is_empty());

        manager.add_req(req(4, v));
        settle();
        assert_eq!(escalated.lock().unwrap().as_slice(), &[v]);
        manager.close_all();
    }

    #[test]
    fn non_candidate_does_not_escalate() {
        let (manager, _sent, escalated) = manager_with_counters(1, false);
        let v = view(1);
        for signer in 1..=4 {
            manager.add_req(req(signer, v));
        }
        settle();
        assert!(escalated.lock().unwrap().is_empty());
        manager.close_all();
    }

    #[test]
    fn requests_for_different_views_do_not_mix() {
        let (manager, sent, _escalated) = manager_with_counters(1, true);
        manager.add_req(req(1, view(1)));
        manager.add_req(req(2, view(2)));
        settle();
        assert!(sent.lock().unwrap().is_empty());
        manager.close_all();
    }

    #[test]
    fn done_clears_waiting() {
        let (manager, _sent, _escalated) = manager_with_counters(1, true);
        let v = view(1);
        manager.add_req(req(1, v));
        manager.add_req(req(2, v));
        settle();
        assert!(manager.waiting(&v.chain_id));

        manager.done(v);
        settle();
        assert!(!manager.waiting(&v.chain_id));
        manager.close_all();
    }

    #[test]
    fn timeout_rotates_leader_index_and_restarts() {
        let me = NodeId::new([0xee; 32]);
        let manager = ViewChangeManager::new(me);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_cb = sent.clone();
        manager.start(
            view(1).chain_id,
            Duration::from_millis(50),
            1,
            Box::new(move |r: &InitReq| sent_cb.lock().unwrap().push(r.clone())),
            Box::new(|_| {}),
            Box::new(|_| false),
        );
        let v = view(1);
        manager.add_req(req(1, v));
        manager.add_req(req(2, v));
        std::thread::sleep(Duration::from_millis(200));
        let sent = sent.lock().unwrap();
        // First the join at f+1, then at least one retry with the next leader index.
        assert!(sent.len() >= 2);
        assert_eq!(sent[0].view.leader_index, 1);
        assert!(sent[1..].iter().any(|r| r.view.leader_index >= 2));
        manager.close_all();
    }
}
