/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The built-in coin contract: typed coin instances with mint, transfer, fetch and store.
//!
//! `fetch` moves coins out of an instance into the transaction's coin flow; `store` absorbs
//! matching coins from the flow back into an instance. Together they let one transaction pay
//! another instruction with coins.

use borsh::BorshDeserialize;
use sha2::{Digest, Sha256};

use super::{Coin, Contract, ContractContext, ContractError, CONTRACT_COIN_ID};
use crate::state::store::ReadOnlyStateTrie;
use crate::types::basic::InstanceId;
use crate::types::transaction::{Instruction, InstructionBody, StateAction, StateChange};

pub struct CoinContract {
    state: Coin,
}

impl CoinContract {
    pub fn new(contents: &[u8]) -> Result<CoinContract, ContractError> {
        let state = if contents.is_empty() {
            Coin {
                name: InstanceId::new([0u8; 32]),
                value: 0,
            }
        } else {
            Coin::try_from_slice(contents).map_err(|_| ContractError::Malformed("coin"))?
        };
        Ok(CoinContract { state })
    }

    fn coins_arg(instr: &Instruction) -> Result<u64, ContractError> {
        let args = instr.args().ok_or(ContractError::MissingArgument("coins"))?;
        let buf = args
            .search("coins")
            .ok_or(ContractError::MissingArgument("coins"))?;
        let bytes: [u8; 8] = buf
            .try_into()
            .map_err(|_| ContractError::Malformed("coins"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn updated(&self, instr: &Instruction, entry_darc: crate::darc::DarcId) -> StateChange {
        StateChange::new(
            StateAction::Update,
            instr.instance_id,
            CONTRACT_COIN_ID,
            borsh::BorshSerialize::try_to_vec(&self.state)
                .expect("coin serialization is infallible"),
            entry_darc,
        )
    }
}

impl Contract for CoinContract {
    fn spawn(
        &self,
        st: &dyn ReadOnlyStateTrie,
        _ctx: &ContractContext,
        instr: &Instruction,
        coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError> {
        let InstructionBody::Spawn(spawn) = &instr.body else {
            return Err(ContractError::Execution("not a spawn".to_string()));
        };
        // Spawns arrive through the governing darc instance; the new coin inherits its darc.
        let darc_id = st.get_values(&instr.instance_id)?.darc_id;

        let instance_id = match spawn.args.search("coinID") {
            Some(seed) => {
                let mut h = Sha256::new();
                h.update(CONTRACT_COIN_ID.as_bytes());
                h.update(seed);
                InstanceId::new(h.finalize().into())
            }
            None => instr.derive_id(""),
        };
        let name = match spawn.args.search("type") {
            Some(buf) => {
                let bytes: [u8; 32] = buf
                    .try_into()
                    .map_err(|_| ContractError::Malformed("coin type"))?;
                InstanceId::new(bytes)
            }
            None => InstanceId::new([0u8; 32]),
        };

        let coin = Coin { name, value: 0 };
        let changes = vec![StateChange::new(
            StateAction::Create,
            instance_id,
            CONTRACT_COIN_ID,
            borsh::BorshSerialize::try_to_vec(&coin).expect("coin serialization is infallible"),
            darc_id,
        )];
        Ok((changes, coins))
    }

    fn invoke(
        &self,
        st: &dyn ReadOnlyStateTrie,
        _ctx: &ContractContext,
        instr: &Instruction,
        mut coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError> {
        let InstructionBody::Invoke(invoke) = &instr.body else {
            return Err(ContractError::Execution("not an invoke".to_string()));
        };
        let entry = st.get_values(&instr.instance_id)?;
        let mut this = CoinContract {
            state: self.state.clone(),
        };

        match invoke.command.as_str() {
            "mint" => {
                let amount = Self::coins_arg(instr)?;
                this.state.value = this
                    .state
                    .value
                    .checked_add(amount)
                    .ok_or_else(|| ContractError::Execution("coin overflow".to_string()))?;
                Ok((vec![this.updated(instr, entry.darc_id)], coins))
            }
            "transfer" => {
                let amount = Self::coins_arg(instr)?;
                let dest_buf = invoke
                    .args
                    .search("destination")
                    .ok_or(ContractError::MissingArgument("destination"))?;
                let dest_bytes: [u8; 32] = dest_buf
                    .try_into()
                    .map_err(|_| ContractError::Malformed("destination"))?;
                let dest_id = InstanceId::new(dest_bytes);

                let dest_entry = st.get_values(&dest_id)?;
                if dest_entry.contract_id != CONTRACT_COIN_ID {
                    return Err(ContractError::Execution(
                        "destination is not a coin".to_string(),
                    ));
                }
                let mut dest = Coin::try_from_slice(&dest_entry.value)
                    .map_err(|_| ContractError::Malformed("destination coin"))?;
                if dest.name != this.state.name {
                    return Err(ContractError::Execution(
                        "coin types do not match".to_string(),
                    ));
                }

                this.state.value = this
                    .state
                    .value
                    .checked_sub(amount)
                    .ok_or_else(|| ContractError::Execution("insufficient coins".to_string()))?;
                dest.value = dest
                    .value
                    .checked_add(amount)
                    .ok_or_else(|| ContractError::Execution("coin overflow".to_string()))?;

                let changes = vec![
                    this.updated(instr, entry.darc_id),
                    StateChange::new(
                        StateAction::Update,
                        dest_id,
                        CONTRACT_COIN_ID,
                        borsh::BorshSerialize::try_to_vec(&dest)
                            .expect("coin serialization is infallible"),
                        dest_entry.darc_id,
                    ),
                ];
                Ok((changes, coins))
            }
            "fetch" => {
                let amount = Self::coins_arg(instr)?;
                this.state.value = this
                    .state
                    .value
                    .checked_sub(amount)
                    .ok_or_else(|| ContractError::Execution("insufficient coins".to_string()))?;
                coins.push(Coin {
                    name: this.state.name,
                    value: amount,
                });
                Ok((vec![this.updated(instr, entry.darc_id)], coins))
            }
            "store" => {
                let mut rest = Vec::new();
                for coin in coins {
                    if coin.name == this.state.name {
                        this.state.value =
                            this.state.value.checked_add(coin.value).ok_or_else(|| {
                                ContractError::Execution("coin overflow".to_string())
                            })?;
                    } else {
                        rest.push(coin);
                    }
                }
                Ok((vec![this.updated(instr, entry.darc_id)], rest))
            }
            other => Err(ContractError::UnknownCommand(other.to_string())),
        }
    }

    fn delete(
        &self,
        st: &dyn ReadOnlyStateTrie,
        _ctx: &ContractContext,
        instr: &Instruction,
        coins: Vec<Coin>,
    ) -> Result<(Vec<StateChange>, Vec<Coin>), ContractError> {
        let entry = st.get_values(&instr.instance_id)?;
        if self.state.value != 0 {
            return Err(ContractError::Execution(
                "cannot delete a coin that still holds value".to_string(),
            ));
        }
        let changes = vec![StateChange::new(
            StateAction::Remove,
            instr.instance_id,
            CONTRACT_COIN_ID,
            Vec::new(),
            entry.darc_id,
        )];
        Ok((changes, coins))
    }
}
