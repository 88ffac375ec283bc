/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Contract dispatch.
//!
//! A [ContractRegistry] maps contract ID strings to constructors. It is created once at startup
//! and handed to the service as a read-only snapshot; execution resolves the string once, at
//! dispatch time, into a typed [Contract] handle, and that handle drives execution.
//!
//! Contracts are pure: they receive a read-only view of the staging state, the instruction, and
//! the coins flowing through the transaction, and return state changes plus the coins they pass
//! on. Leftover coins at the end of a transaction are discarded with a warning.

pub mod coin;

pub mod config;

pub mod darc;

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use crate::block_store::CollectiveSigner;
use crate::darc::DarcError;
use crate::state::store::{ReadOnlyStateTrie, StateTrieError};
use crate::types::basic::{CryptoHash, InstanceId};
use crate::types::transaction::{Instruction, StateChange};

/// The contract ID of the built-in chain configuration contract.
pub const CONTRACT_CONFIG_ID: &str = "config";

/// The contract ID of the built-in DARC contract.
pub const CONTRACT_DARC_ID: &str = "darc";

/// The contract ID of the built-in coin contract.
pub const CONTRACT_COIN_ID: &str = "coin";

/// A typed amount of coins of one coin type, threaded through the instructions of a transaction.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Coin {
    /// The instance ID of the coin type.
    pub name: InstanceId,
    pub value: u64,
}

#[derive(Debug)]
pub enum ContractError {
    UnknownContract(String),
    UnknownCommand(String),
    MissingArgument(&'static str),
    Malformed(&'static str),
    /// The instruction failed its authorization checks: DARC expression unsatisfied, bad
    /// signature, or stale counter.
    Unauthorized(String),
    /// The contract itself refused the instruction.
    Execution(String),
    State(StateTrieError),
}

impl Display for ContractError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ContractError::UnknownContract(id) => write!(f, "unknown contract \"{}\"", id),
            ContractError::UnknownCommand(cmd) => write!(f, "unknown command \"{}\"", cmd),
            ContractError::MissingArgument(name) => write!(f, "missing argument \"{}\"", name),
            ContractError::Malformed(what) => write!(f, "malformed {}", what),
            ContractError::Unauthorized(why) => write!(f, "unauthorized: {}", why),
            ContractError::Execution(why) => write!(f, "execution failure: {}", why),
            ContractError::State(e) => write!(f, "state error: {}", e),
        }
    }
}

impl From<StateTrieError> for ContractError {
    fn from(e: StateTrieError) -> Self {
        ContractError::State(e)
    }
}

impl From<DarcError> for ContractError {
    fn from(e: DarcError) -> Self {
        ContractError::Unauthorized(e.to_string())
    }
}

/// Context handed to contract calls: the registry (so contracts can delegate spawns) and the
/// digest of the containing transaction (so contracts can check signatures over it).
pub struct ContractContext<'a> {
    pub registry: &'a ContractRegistry,
    pub tx_hash: CryptoHash,
}

/// One instantiated contract, constructed from the current value bytes of the instance an
/// instruction targets.
pub trait Contract {
    /// Authorization check, run before dispatch. The default checks signature counts, signer
    /// counters, signatures over the transaction digest, and the governing DARC's rule for the
    /// instruction's action.
    fn verify_instruction(
        &self,
        st: &dyn ReadOnlyStateTrie,
        ctx: &ContractContext,
        instr: &Instruction,
    ) -> Result<(), ContractError> {
        crate::execution::verify_instruction_default(st, instr, &ctx.tx_hash)
    }

    fn spawn(
        &self,
        st: &dyn ReadOnlyStateTrie,
        ctx: &ContractContext,
        instr: &Instruction,
        coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError>;

    fn invoke(
        &self,
        st: &dyn ReadOnlyStateTrie,
        ctx: &ContractContext,
        instr: &Instruction,
        coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError>;

    fn delete(
        &self,
        st: &dyn ReadOnlyStateTrie,
        ctx: &ContractContext,
        instr: &Instruction,
        coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError>;
}

/// Builds a [Contract] from the current value bytes of the targeted instance (empty for an
/// instance that does not exist yet).
pub type ContractConstructor =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn Contract>, ContractError> + Send + Sync>;

/// The process-lifetime table of registered contracts.
#[derive(Clone)]
pub struct ContractRegistry {
    map: HashMap<String, ContractConstructor>,
}

impl ContractRegistry {
    pub fn empty() -> ContractRegistry {
        ContractRegistry {
            map: HashMap::new(),
        }
    }

    /// The registry with the built-in contracts: config, darc, and coin.
    pub fn standard(signer: Arc<dyn CollectiveSigner>) -> ContractRegistry {
        let mut registry = ContractRegistry::empty();
        let config_constructor: ContractConstructor = Arc::new(move |_contents: &[u8]| {
            Ok(Box::new(config::ConfigContract::new(signer.clone())) as Box<dyn Contract>)
        });
        registry.register(CONTRACT_CONFIG_ID, config_constructor);
        let darc_constructor: ContractConstructor = Arc::new(|contents: &[u8]| {
            Ok(Box::new(darc::DarcContract::new(contents)) as Box<dyn Contract>)
        });
        registry.register(CONTRACT_DARC_ID, darc_constructor);
        let coin_constructor: ContractConstructor = Arc::new(|contents: &[u8]| {
            Ok(Box::new(coin::CoinContract::new(contents)?) as Box<dyn Contract>)
        });
        registry.register(CONTRACT_COIN_ID, coin_constructor);
        registry
    }

    pub fn register(&mut self, contract_id: &str, constructor: ContractConstructor) {
        self.map.insert(contract_id.to_string(), constructor);
    }

    pub fn get(&self, contract_id: &str) -> Option<ContractConstructor> {
        self.map.get(contract_id).cloned()
    }

    pub fn contains(&self, contract_id: &str) -> bool {
        self.map.contains_key(contract_id)
    }
}
