/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The execution engine: runs transaction batches against a staging trie.
//!
//! [create_state_changes] is the single routine behind block building, block verification and
//! commit. The leader runs it with a planning deadline and the block byte budget; followers and
//! the commit pipeline run it without either. Determinism is what makes this sharing sound:
//! given the same pre-state and the same batch, every pass computes the same accept/reject
//! vector, state changes, and trie root.
//!
//! [process_one_tx] executes one transaction against a *clone* of the staging trie, so a failed
//! transaction leaves no residue. Signer counters are verified and incremented inside the same
//! clone, which is what prevents two transactions from the same signer with equal counters from
//! both committing.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::cache::{CacheEntry, StateChangeCache};
use crate::contracts::config::{get_instance_darc, load_config_from_trie};
use crate::contracts::{
    Coin, ContractContext, ContractError, ContractRegistry, CONTRACT_CONFIG_ID,
};
use crate::darc::{expression, DarcId, Identity};
use crate::state::kv::KVStore;
use crate::state::store::{ReadOnlyStateTrie, StagingStateTrie, StateTrieError};
use crate::state::trie::TrieError;
use crate::types::basic::{ChainId, CryptoHash, InstanceId, CONFIG_INSTANCE_ID};
use crate::types::transaction::{
    tx_results_hash, tx_size, ClientTransaction, Instruction, StateAction, StateChange, TxResult,
};

/// Why a transaction was rejected. The kinds mirror the outward error taxonomy: invalid input and
/// authorization failures are reported distinctly from contract-level execution failures.
#[derive(Debug)]
pub enum ExecutionError {
    InvalidInput(String),
    Unauthorized(String),
    ExecutionFailure(String),
    State(StateTrieError),
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::InvalidInput(why) => write!(f, "invalid input: {}", why),
            ExecutionError::Unauthorized(why) => write!(f, "unauthorized: {}", why),
            ExecutionError::ExecutionFailure(why) => write!(f, "execution failure: {}", why),
            ExecutionError::State(e) => write!(f, "state error: {}", e),
        }
    }
}

impl From<StateTrieError> for ExecutionError {
    fn from(e: StateTrieError) -> Self {
        ExecutionError::State(e)
    }
}

impl From<TrieError> for ExecutionError {
    fn from(e: TrieError) -> Self {
        ExecutionError::State(StateTrieError::from(e))
    }
}

impl From<ContractError> for ExecutionError {
    fn from(e: ContractError) -> Self {
        match e {
            ContractError::Unauthorized(why) => ExecutionError::Unauthorized(why),
            ContractError::UnknownContract(id) => {
                ExecutionError::InvalidInput(format!("unknown contract \"{}\"", id))
            }
            other => ExecutionError::ExecutionFailure(other.to_string()),
        }
    }
}

/// The trie key under which an identity's signer counter is stored.
pub fn public_version_key(identity: &Identity) -> InstanceId {
    let mut h = Sha256::new();
    h.update(b"signercounter:");
    h.update(identity.string().as_bytes());
    InstanceId::new(h.finalize().into())
}

/// The stored signer counter of an identity; 0 if the identity has never signed.
pub fn signer_counter(
    st: &dyn ReadOnlyStateTrie,
    identity: &Identity,
) -> Result<u64, StateTrieError> {
    match st.get_values(&public_version_key(identity)) {
        Ok(entry) => {
            let bytes: [u8; 8] = entry
                .value
                .as_slice()
                .try_into()
                .map_err(|_| StateTrieError::MalformedBody)?;
            Ok(u64::from_le_bytes(bytes))
        }
        Err(StateTrieError::KeyNotSet) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Every counter must be the stored counter plus one; a replayed counter is rejected.
pub fn verify_signer_counters(
    st: &dyn ReadOnlyStateTrie,
    counters: &[u64],
    identities: &[Identity],
) -> Result<(), ExecutionError> {
    if counters.len() != identities.len() {
        return Err(ExecutionError::Unauthorized(
            "number of counters does not match number of identities".to_string(),
        ));
    }
    for (counter, identity) in counters.iter().zip(identities) {
        let stored = signer_counter(st, identity)?;
        let expected = stored
            .checked_add(1)
            .ok_or_else(|| ExecutionError::Unauthorized("counter overflow".to_string()))?;
        if *counter != expected {
            return Err(ExecutionError::Unauthorized(format!(
                "counter for identity {} is {}, expected {}",
                identity, counter, expected
            )));
        }
    }
    Ok(())
}

/// State changes that bump every signer's counter by one.
pub fn increment_signer_counters(
    st: &dyn ReadOnlyStateTrie,
    identities: &[Identity],
) -> Result<Vec<StateChange>, ExecutionError> {
    let mut changes = Vec::with_capacity(identities.len());
    for identity in identities {
        let key = public_version_key(identity);
        let (action, version, counter) = match st.get_values(&key) {
            Ok(entry) => {
                let bytes: [u8; 8] = entry
                    .value
                    .as_slice()
                    .try_into()
                    .map_err(|_| StateTrieError::MalformedBody)?;
                (
                    StateAction::Update,
                    entry.version + 1,
                    u64::from_le_bytes(bytes) + 1,
                )
            }
            Err(StateTrieError::KeyNotSet) => (StateAction::Create, 0, 1),
            Err(e) => return Err(e.into()),
        };
        let mut change = StateChange::new(
            action,
            key,
            "",
            counter.to_le_bytes().to_vec(),
            DarcId::zero(),
        );
        change.version = version;
        changes.push(change);
    }
    Ok(changes)
}

/// The default authorization check run for every instruction: signature counts, signer counters,
/// signatures over the containing transaction's digest, and the governing DARC's rule for the
/// instruction's action.
pub fn verify_instruction_default(
    st: &dyn ReadOnlyStateTrie,
    instr: &Instruction,
    tx_digest: &CryptoHash,
) -> Result<(), ContractError> {
    if instr.signer_identities.len() != instr.signatures.len() {
        return Err(ContractError::Unauthorized(
            "length of identities does not match the length of signatures".to_string(),
        ));
    }
    if instr.signatures.is_empty() {
        return Err(ContractError::Unauthorized(
            "no signatures - nothing to verify".to_string(),
        ));
    }
    verify_signer_counters(st, &instr.signer_counters, &instr.signer_identities).map_err(|e| {
        ContractError::Unauthorized(e.to_string())
    })?;

    let config = load_config_from_trie(st)?;
    let darc = get_instance_darc(st, &instr.instance_id, &config.darc_contract_ids)
        .map_err(|e| ContractError::Unauthorized(format!("darc not found: {}", e)))?;

    let action = instr.action();
    let Some(expr) = darc.rules.get(&action) else {
        return Err(ContractError::Unauthorized(format!(
            "action '{}' does not exist",
            action
        )));
    };

    for (identity, signature) in instr.signer_identities.iter().zip(&instr.signatures) {
        identity
            .verify(&tx_digest.bytes(), signature)
            .map_err(|e| ContractError::Unauthorized(e.to_string()))?;
    }

    let resolver = |atom: &str| -> Option<crate::darc::Darc> {
        let hex = atom.strip_prefix("darc:")?;
        let id = DarcId::from_hex(hex)?;
        crate::contracts::config::load_darc_from_trie(st, &id).ok()
    };
    expression::eval_expr(expr, &resolver, &instr.identity_strings())
        .map_err(ContractError::from)
}

/// Execute one instruction: resolve its contract, run the authorization check, dispatch by
/// variant, and assign versions to the produced state changes. A contract panic is caught and
/// surfaced as an execution failure on this one transaction.
fn execute_instruction<K: KVStore>(
    sst: &StagingStateTrie<K>,
    registry: &ContractRegistry,
    coins: Vec<Coin>,
    instr: &Instruction,
    tx_hash: &CryptoHash,
) -> Result<(Vec<StateChange>, Vec<Coin>), ExecutionError> {
    let (contract_id, contents) = match sst.get_values(&instr.instance_id) {
        Ok(entry) => (entry.contract_id, entry.value),
        Err(StateTrieError::KeyNotSet) => (String::new(), Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let constructor = registry
        .get(&contract_id)
        .or_else(|| {
            // Bootstrap: the first spawn against the config instance resolves to the config
            // contract even though nothing is stored there yet.
            if instr.instance_id == CONFIG_INSTANCE_ID {
                registry.get(CONTRACT_CONFIG_ID)
            } else {
                None
            }
        })
        .ok_or_else(|| {
            ExecutionError::InvalidInput(format!(
                "dropping instruction of unknown contract \"{}\" on instance \"{}\"",
                contract_id, instr.instance_id
            ))
        })?;

    let contract = constructor(&contents).map_err(ExecutionError::from)?;
    let ctx = ContractContext {
        registry,
        tx_hash: *tx_hash,
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        contract.verify_instruction(sst, &ctx, instr)?;
        match &instr.body {
            crate::types::transaction::InstructionBody::Spawn(_) => {
                contract.spawn(sst, &ctx, instr, coins)
            }
            crate::types::transaction::InstructionBody::Invoke(_) => {
                contract.invoke(sst, &ctx, instr, coins)
            }
            crate::types::transaction::InstructionBody::Delete(_) => {
                contract.delete(sst, &ctx, instr, coins)
            }
        }
    }));
    let (mut changes, coins_out) = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(contract_err)) => return Err(contract_err.into()),
        Err(_) => {
            return Err(ExecutionError::ExecutionFailure(format!(
                "contract \"{}\" panicked while executing {}",
                contract_id, instr
            )))
        }
    };

    // The state changes need not target the instruction's own instance, so each change's version
    // is looked up in the trie, or continued from an earlier change to the same instance.
    let mut versions: HashMap<InstanceId, u64> = HashMap::new();
    for change in changes.iter_mut() {
        let version = match versions.get(&change.instance_id) {
            Some(version) => version + 1,
            None => match sst.get_values(&change.instance_id) {
                Ok(entry) => entry.version + 1,
                Err(StateTrieError::KeyNotSet) => 0,
                Err(e) => return Err(e.into()),
            },
        };
        change.version = version;
        versions.insert(change.instance_id, version);
    }

    Ok((changes, coins_out))
}

/// Execute all instructions of one transaction atomically against a clone of the staging trie.
/// On success, returns the produced state changes (contract changes plus counter bumps) and the
/// clone with them applied; on failure, the clone is discarded and the pre-state is untouched.
pub fn process_one_tx<K: KVStore>(
    sst: &StagingStateTrie<K>,
    registry: &ContractRegistry,
    tx: &ClientTransaction,
) -> Result<(Vec<StateChange>, StagingStateTrie<K>), ExecutionError> {
    if tx.instructions.is_empty() {
        return Err(ExecutionError::InvalidInput(
            "transaction has no instructions".to_string(),
        ));
    }
    let mut sst = sst.clone();
    let tx_hash = tx.hash();
    let mut produced = Vec::new();
    let mut coins: Vec<Coin> = Vec::new();

    for instr in &tx.instructions {
        let (changes, coins_out) = execute_instruction(&sst, registry, coins, instr, &tx_hash)?;
        let counter_changes = increment_signer_counters(&sst, &instr.signer_identities)?;

        for change in &changes {
            let present = sst.get_raw(&change.instance_id)?.is_some();
            let reason = match change.action {
                StateAction::Create if present => Some("tried to create existing instanceID"),
                StateAction::Update if !present => Some("tried to update non-existing instanceID"),
                StateAction::Remove if !present => Some("tried to remove non-existing instanceID"),
                StateAction::Remove if change.instance_id == CONFIG_INSTANCE_ID => {
                    Some("the chain configuration cannot be removed")
                }
                _ => None,
            };
            if let Some(reason) = reason {
                return Err(ExecutionError::ExecutionFailure(format!(
                    "contract {}: {}",
                    change.contract_id, reason
                )));
            }
            sst.store_all(std::slice::from_ref(change))?;
        }
        sst.store_all(&counter_changes)?;
        produced.extend(changes);
        produced.extend(counter_changes);
        coins = coins_out;
    }

    if !coins.is_empty() {
        log::warn!("leftover coins detected, discarding");
    }
    Ok((produced, sst))
}

/// Reject a transaction that re-creates an instance removed earlier in the same batch (or
/// removed and re-created within itself).
fn check_remove_create<K: KVStore>(
    removed: &std::collections::HashSet<InstanceId>,
    ok: (Vec<StateChange>, StagingStateTrie<K>),
) -> Result<(Vec<StateChange>, StagingStateTrie<K>), ExecutionError> {
    let mut removed_so_far = removed.clone();
    for change in &ok.0 {
        match change.action {
            StateAction::Create if removed_so_far.contains(&change.instance_id) => {
                return Err(ExecutionError::ExecutionFailure(
                    "tried to re-create an instance removed in the same batch".to_string(),
                ));
            }
            StateAction::Remove => {
                removed_so_far.insert(change.instance_id);
            }
            _ => {}
        }
    }
    Ok(ok)
}

/// The output of one execution pass over a batch.
pub struct ExecutionResult {
    pub merkle_root: CryptoHash,
    pub tx_results: Vec<TxResult>,
    pub state_changes: Vec<StateChange>,
}

/// Run a batch of transactions against a staging trie, in arrival order.
///
/// With `timeout` set (the leader's planning pass), the routine stops early when the deadline or
/// the block byte budget would be exceeded by the next transaction, and the unprocessed tail is
/// returned for re-buffering. Without it (verification and commit), every transaction is
/// processed.
///
/// A cache hit by the batch's hash skips execution entirely.
pub fn create_state_changes<K: KVStore>(
    sst: &StagingStateTrie<K>,
    chain_id: &ChainId,
    registry: &ContractRegistry,
    tx_in: &[TxResult],
    timeout: Option<Duration>,
    max_block_size: u64,
    cache: &StateChangeCache,
) -> (ExecutionResult, Vec<TxResult>) {
    if let Some(hit) = cache.get(chain_id, &tx_results_hash(tx_in)) {
        log::debug!("StateChangeCache, hit, {}", chain_id);
        return (
            ExecutionResult {
                merkle_root: hit.merkle_root,
                tx_results: hit.tx_results,
                state_changes: hit.state_changes,
            },
            Vec::new(),
        );
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut sst_temp = sst.clone();
    let mut tx_results = Vec::new();
    let mut state_changes = Vec::new();
    let mut block_size = 0u64;
    let mut leftover = Vec::new();
    // Instances removed earlier in this batch: re-creating one inside the same batch is illegal.
    let mut removed: std::collections::HashSet<InstanceId> = std::collections::HashSet::new();

    for (position, tx) in tx_in.iter().enumerate() {
        let size = tx_size(tx);
        match process_one_tx(&sst_temp, registry, &tx.client_transaction)
            .and_then(|ok| check_remove_create(&removed, ok))
        {
            Err(why) => {
                log::info!("RejectTransaction, {}, {}", chain_id, why);
                tx_results.push(TxResult {
                    client_transaction: tx.client_transaction.clone(),
                    accepted: false,
                });
            }
            Ok((changes, sst_next)) => {
                if let Some(deadline) = deadline {
                    if Instant::now() > deadline {
                        log::warn!("ran out of time planning a block, returning what fits");
                        leftover = tx_in[position..].to_vec();
                        break;
                    }
                    if block_size + size > max_block_size {
                        log::debug!(
                            "stopping block creation at {} bytes with {} transactions",
                            block_size,
                            tx_results.len()
                        );
                        leftover = tx_in[position..].to_vec();
                        break;
                    }
                }
                for change in &changes {
                    if change.action == StateAction::Remove {
                        removed.insert(change.instance_id);
                    }
                }
                sst_temp = sst_next;
                block_size += size;
                state_changes.extend(changes);
                tx_results.push(TxResult {
                    client_transaction: tx.client_transaction.clone(),
                    accepted: true,
                });
            }
        }
    }

    let merkle_root = sst_temp.root();
    if !state_changes.is_empty() && !tx_results.is_empty() {
        cache.update(
            *chain_id,
            tx_results_hash(&tx_results),
            CacheEntry {
                merkle_root,
                tx_results: tx_results.clone(),
                state_changes: state_changes.clone(),
            },
        );
    }
    (
        ExecutionResult {
            merkle_root,
            tx_results,
            state_changes,
        },
        leftover,
    )
}
