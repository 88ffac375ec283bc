/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The built-in chain configuration contract.
//!
//! Its spawn bootstraps a chain: it creates the configuration instance under the all-zero
//! instance ID and the genesis DARC instance, from the arguments assembled by
//! `create_genesis_block`. Its `update_config` command replaces the configuration (subject to the
//! sanity and one-step-roster checks), and its `view_change` command rotates the leader when
//! presented with a collectively signed [NewViewReq](crate::viewchange::NewViewReq).

use std::sync::Arc;

use super::{
    Coin, Contract, ContractContext, ContractError, CONTRACT_CONFIG_ID, CONTRACT_DARC_ID,
};
use crate::block_store::CollectiveSigner;
use crate::darc::{Darc, DarcId};
use crate::state::store::{ReadOnlyStateTrie, StateTrieError};
use crate::types::basic::{InstanceId, CONFIG_INSTANCE_ID};
use crate::types::block::{ChainConfig, Roster};
use crate::types::transaction::{Instruction, InstructionBody, StateAction, StateChange};
use crate::viewchange::NewViewReq;

/// Load the chain configuration stored under the all-zero instance ID.
pub fn load_config_from_trie(st: &dyn ReadOnlyStateTrie) -> Result<ChainConfig, StateTrieError> {
    let entry = st.get_values(&CONFIG_INSTANCE_ID)?;
    ChainConfig::from_bytes(&entry.value).map_err(|_| StateTrieError::MalformedBody)
}

/// Load a DARC stored in the trie under its base ID.
pub fn load_darc_from_trie(
    st: &dyn ReadOnlyStateTrie,
    darc_id: &DarcId,
) -> Result<Darc, StateTrieError> {
    let entry = st.get_values(&InstanceId::new(darc_id.bytes()))?;
    Darc::from_bytes(&entry.value).map_err(|_| StateTrieError::MalformedBody)
}

/// Load the DARC governing an instance: follow the instance's `darc_id` to the DARC instance,
/// whose contract must be one of the configured darc-capable contracts.
pub fn get_instance_darc(
    st: &dyn ReadOnlyStateTrie,
    instance_id: &InstanceId,
    darc_contract_ids: &[String],
) -> Result<Darc, ContractError> {
    let entry = st.get_values(instance_id)?;
    let darc_entry = st.get_values(&InstanceId::new(entry.darc_id.bytes()))?;
    if !darc_contract_ids.contains(&darc_entry.contract_id) {
        return Err(ContractError::Unauthorized(format!(
            "contract \"{}\" may not hold darcs",
            darc_entry.contract_id
        )));
    }
    Darc::from_bytes(&darc_entry.value).map_err(|_| ContractError::Malformed("darc"))
}

pub struct ConfigContract {
    signer: Arc<dyn CollectiveSigner>,
}

impl ConfigContract {
    pub fn new(signer: Arc<dyn CollectiveSigner>) -> ConfigContract {
        ConfigContract { signer }
    }

    fn verify_view_change(
        &self,
        st: &dyn ReadOnlyStateTrie,
        instr: &Instruction,
    ) -> Result<(), ContractError> {
        let args = instr.args().ok_or(ContractError::MissingArgument("newview"))?;
        let buf = args
            .search("newview")
            .ok_or(ContractError::MissingArgument("newview"))?;
        let req =
            NewViewReq::from_bytes(buf).ok_or(ContractError::Malformed("new view request"))?;
        let config = load_config_from_trie(st)?;
        let threshold = 2 * config.roster.fault_threshold() + 1;
        if !self
            .signer
            .verify(&config.roster, threshold, &req.view.bytes(), &req.signature)
        {
            return Err(ContractError::Unauthorized(
                "new view request carries no valid collective signature".to_string(),
            ));
        }
        Ok(())
    }
}

impl Contract for ConfigContract {
    fn verify_instruction(
        &self,
        st: &dyn ReadOnlyStateTrie,
        ctx: &ContractContext,
        instr: &Instruction,
    ) -> Result<(), ContractError> {
        match &instr.body {
            // The genesis spawn runs before any DARC exists; the caller of create_genesis_block
            // has validated the genesis darc already.
            InstructionBody::Spawn(_)
                if matches!(
                    st.get_values(&CONFIG_INSTANCE_ID),
                    Err(StateTrieError::KeyNotSet)
                ) =>
            {
                Ok(())
            }
            // A view change is authorized by its collective signature, not by a DARC.
            InstructionBody::Invoke(invoke) if invoke.command == "view_change" => {
                self.verify_view_change(st, instr)
            }
            _ => crate::execution::verify_instruction_default(st, instr, &ctx.tx_hash),
        }
    }

    fn spawn(
        &self,
        st: &dyn ReadOnlyStateTrie,
        _ctx: &ContractContext,
        instr: &Instruction,
        coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError> {
        if st.get_values(&CONFIG_INSTANCE_ID).is_ok() {
            return Err(ContractError::Execution(
                "chain configuration already exists".to_string(),
            ));
        }
        let args = instr.args().ok_or(ContractError::MissingArgument("darc"))?;

        let darc_buf = args.search("darc").ok_or(ContractError::MissingArgument("darc"))?;
        let genesis_darc =
            Darc::from_bytes(darc_buf).map_err(|_| ContractError::Malformed("genesis darc"))?;
        if genesis_darc.rules.count() == 0 {
            return Err(ContractError::Execution("genesis darc has no rules".to_string()));
        }

        let interval_buf = args
            .search("block_interval")
            .ok_or(ContractError::MissingArgument("block_interval"))?;
        let block_interval_ns = decode_u64(interval_buf, "block_interval")?;

        let size_buf = args
            .search("max_block_size")
            .ok_or(ContractError::MissingArgument("max_block_size"))?;
        let max_block_size = decode_u64(size_buf, "max_block_size")?;

        let roster_buf = args
            .search("roster")
            .ok_or(ContractError::MissingArgument("roster"))?;
        let roster: Roster = borsh::BorshDeserialize::try_from_slice(roster_buf)
            .map_err(|_| ContractError::Malformed("roster"))?;

        let darc_contracts_buf = args
            .search("darc_contracts")
            .ok_or(ContractError::MissingArgument("darc_contracts"))?;
        let darc_contract_ids: Vec<String> =
            borsh::BorshDeserialize::try_from_slice(darc_contracts_buf)
                .map_err(|_| ContractError::Malformed("darc contract IDs"))?;

        let config = ChainConfig {
            block_interval_ns,
            max_block_size,
            roster,
            darc_contract_ids,
        };
        config
            .sanity_check()
            .map_err(|e| ContractError::Execution(e.to_string()))?;

        let darc_id = genesis_darc.base_id();
        let changes = vec![
            StateChange::new(
                StateAction::Create,
                CONFIG_INSTANCE_ID,
                CONTRACT_CONFIG_ID,
                config.to_bytes(),
                darc_id,
            ),
            StateChange::new(
                StateAction::Create,
                InstanceId::new(darc_id.bytes()),
                CONTRACT_DARC_ID,
                genesis_darc.to_bytes(),
                darc_id,
            ),
        ];
        Ok((changes, coins))
    }

    fn invoke(
        &self,
        st: &dyn ReadOnlyStateTrie,
        _ctx: &ContractContext,
        instr: &Instruction,
        coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError> {
        let InstructionBody::Invoke(invoke) = &instr.body else {
            return Err(ContractError::Execution("not an invoke".to_string()));
        };
        let entry = st.get_values(&CONFIG_INSTANCE_ID)?;
        let old = ChainConfig::from_bytes(&entry.value)
            .map_err(|_| ContractError::Malformed("stored chain config"))?;

        let new = match invoke.command.as_str() {
            "update_config" => {
                let buf = invoke
                    .args
                    .search("config")
                    .ok_or(ContractError::MissingArgument("config"))?;
                let new = ChainConfig::from_bytes(buf)
                    .map_err(|_| ContractError::Malformed("chain config"))?;
                new.sanity_check()
                    .map_err(|e| ContractError::Execution(e.to_string()))?;
                old.check_new_roster(&new.roster)
                    .map_err(|e| ContractError::Execution(e.to_string()))?;
                new
            }
            "view_change" => {
                let buf = invoke
                    .args
                    .search("newview")
                    .ok_or(ContractError::MissingArgument("newview"))?;
                let req = NewViewReq::from_bytes(buf)
                    .ok_or(ContractError::Malformed("new view request"))?;
                let mut new = old.clone();
                new.roster = old.roster.rotated(req.view.leader_index as usize);
                new
            }
            other => return Err(ContractError::UnknownCommand(other.to_string())),
        };

        let changes = vec![StateChange::new(
            StateAction::Update,
            CONFIG_INSTANCE_ID,
            CONTRACT_CONFIG_ID,
            new.to_bytes(),
            entry.darc_id,
        )];
        Ok((changes, coins))
    }

    fn delete(
        &self,
        _st: &dyn ReadOnlyStateTrie,
        _ctx: &ContractContext,
        _instr: &Instruction,
        _coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError> {
        Err(ContractError::Execution(
            "the chain configuration cannot be removed".to_string(),
        ))
    }
}

fn decode_u64(buf: &[u8], what: &'static str) -> Result<u64, ContractError> {
    let bytes: [u8; 8] = buf.try_into().map_err(|_| ContractError::Malformed(what))?;
    Ok(u64::from_le_bytes(bytes))
}
