/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The built-in DARC contract.
//!
//! A spawn of contract ID `darc` creates a new DARC instance; a spawn of any other contract ID
//! against a darc instance is delegated to that contract's constructor, so DARCs act as the
//! spawning authority for the instances they govern. `evolve` replaces a DARC with its next
//! version.

use super::{Coin, Contract, ContractContext, ContractError, CONTRACT_DARC_ID};
use crate::darc::Darc;
use crate::state::store::ReadOnlyStateTrie;
use crate::types::basic::InstanceId;
use crate::types::transaction::{Instruction, InstructionBody, StateAction, StateChange};

pub struct DarcContract {
    contents: Vec<u8>,
}

impl DarcContract {
    pub fn new(contents: &[u8]) -> DarcContract {
        DarcContract {
            contents: contents.to_vec(),
        }
    }
}

impl Contract for DarcContract {
    fn spawn(
        &self,
        st: &dyn ReadOnlyStateTrie,
        ctx: &ContractContext,
        instr: &Instruction,
        coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError> {
        let InstructionBody::Spawn(spawn) = &instr.body else {
            return Err(ContractError::Execution("not a spawn".to_string()));
        };
        if spawn.contract_id != CONTRACT_DARC_ID {
            // Spawning any other contract through this darc: delegate to that contract.
            let constructor = ctx
                .registry
                .get(&spawn.contract_id)
                .ok_or_else(|| ContractError::UnknownContract(spawn.contract_id.clone()))?;
            let contract = constructor(&[])?;
            return contract.spawn(st, ctx, instr, coins);
        }

        let buf = spawn
            .args
            .search("darc")
            .ok_or(ContractError::MissingArgument("darc"))?;
        let darc = Darc::from_bytes(buf).map_err(|_| ContractError::Malformed("darc"))?;
        if darc.version != 0 {
            return Err(ContractError::Execution(
                "spawned darc must have version 0".to_string(),
            ));
        }
        if darc.rules.get(crate::darc::SIGN_ACTION).is_none() {
            return Err(ContractError::Execution(
                "spawned darc must carry a sign rule".to_string(),
            ));
        }

        let darc_id = darc.base_id();
        let changes = vec![StateChange::new(
            StateAction::Create,
            InstanceId::new(darc_id.bytes()),
            CONTRACT_DARC_ID,
            darc.to_bytes(),
            darc_id,
        )];
        Ok((changes, coins))
    }

    fn invoke(
        &self,
        _st: &dyn ReadOnlyStateTrie,
        _ctx: &ContractContext,
        instr: &Instruction,
        coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError> {
        let InstructionBody::Invoke(invoke) = &instr.body else {
            return Err(ContractError::Execution("not an invoke".to_string()));
        };
        match invoke.command.as_str() {
            "evolve" => {
                let old = Darc::from_bytes(&self.contents)
                    .map_err(|_| ContractError::Malformed("stored darc"))?;
                let buf = invoke
                    .args
                    .search("darc")
                    .ok_or(ContractError::MissingArgument("darc"))?;
                let new = Darc::from_bytes(buf).map_err(|_| ContractError::Malformed("darc"))?;
                old.verify_evolution(&new)?;

                let changes = vec![StateChange::new(
                    StateAction::Update,
                    instr.instance_id,
                    CONTRACT_DARC_ID,
                    new.to_bytes(),
                    new.base_id(),
                )];
                Ok((changes, coins))
            }
            other => Err(ContractError::UnknownCommand(other.to_string())),
        }
    }

    fn delete(
        &self,
        _st: &dyn ReadOnlyStateTrie,
        _ctx: &ContractContext,
        _instr: &Instruction,
        _coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError> {
        Err(ContractError::Execution(
            "darcs cannot be deleted, evolve them instead".to_string(),
        ))
    }
}
