/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Client transactions, instructions, and state changes.
//!
//! ## Hashing discipline
//!
//! The digest of an [Instruction] is SHA-256 over a domain-separated concatenation of its
//! canonical bytes (target instance ID, variant tag, contract ID, command, length-prefixed
//! arguments, signer counters, length-prefixed signer identities). The digest of a transaction is
//! SHA-256 over the concatenation of its instructions' digests, and every signature on an
//! instruction is over the digest of the *containing transaction*, binding the instructions
//! together.
//!
//! [Instruction::derive_id] mints deterministic child instance IDs from an instruction's digest
//! and its signatures; contracts use it to name the instances they spawn.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};

use crate::darc::{DarcId, DarcSigner, Identity};
use crate::types::basic::{CryptoHash, InstanceId};

/// A named argument of a Spawn or Invoke instruction.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Argument {
    pub name: String,
    pub value: Vec<u8>,
}

/// A searchable, ordered list of arguments.
#[derive(Clone, PartialEq, Eq, Debug, Default, BorshDeserialize, BorshSerialize)]
pub struct Arguments(Vec<Argument>);

impl Arguments {
    pub fn new(args: Vec<Argument>) -> Self {
        Self(args)
    }

    /// The value of the named argument. An argument stored with an empty value yields
    /// `Some(&[])`, which is distinguishable from an absent argument.
    pub fn search(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_slice())
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Argument> {
        self.0.iter()
    }
}

/// Creates a new instance governed by a contract.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Spawn {
    pub contract_id: String,
    pub args: Arguments,
}

/// Calls a command of the contract governing an existing instance.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Invoke {
    pub contract_id: String,
    pub command: String,
    pub args: Arguments,
}

/// Removes an existing instance.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Delete {
    pub contract_id: String,
}

/// Exactly one of Spawn, Invoke or Delete.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub enum InstructionBody {
    Spawn(Spawn),
    Invoke(Invoke),
    Delete(Delete),
}

/// One operation on one instance, together with the identities that authorize it.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Instruction {
    /// The instance this instruction targets.
    pub instance_id: InstanceId,
    pub body: InstructionBody,
    /// The identities signing this instruction. One counter and, after signing, one signature per
    /// identity.
    pub signer_identities: Vec<Identity>,
    pub signer_counters: Vec<u64>,
    pub signatures: Vec<Vec<u8>>,
}

impl Instruction {
    pub fn new(instance_id: InstanceId, body: InstructionBody) -> Self {
        Self {
            instance_id,
            body,
            signer_identities: Vec::new(),
            signer_counters: Vec::new(),
            signatures: Vec::new(),
        }
    }

    /// The contract ID named by the instruction body.
    pub fn contract_id(&self) -> &str {
        match &self.body {
            InstructionBody::Spawn(s) => &s.contract_id,
            InstructionBody::Invoke(i) => &i.contract_id,
            InstructionBody::Delete(d) => &d.contract_id,
        }
    }

    /// The arguments of the instruction body. Delete carries none.
    pub fn args(&self) -> Option<&Arguments> {
        match &self.body {
            InstructionBody::Spawn(s) => Some(&s.args),
            InstructionBody::Invoke(i) => Some(&i.args),
            InstructionBody::Delete(_) => None,
        }
    }

    /// The action string checked against the governing DARC: `spawn:<contract>`,
    /// `invoke:<contract>.<command>`, or `delete:<contract>`.
    pub fn action(&self) -> String {
        match &self.body {
            InstructionBody::Spawn(s) => format!("spawn:{}", s.contract_id),
            InstructionBody::Invoke(i) => format!("invoke:{}.{}", i.contract_id, i.command),
            InstructionBody::Delete(d) => format!("delete:{}", d.contract_id),
        }
    }

    /// The domain-separated digest of this instruction.
    pub fn hash(&self) -> CryptoHash {
        let mut h = Sha256::new();
        h.update(self.instance_id.bytes());
        let args = match &self.body {
            InstructionBody::Spawn(s) => {
                h.update([0u8]);
                h.update(s.contract_id.as_bytes());
                Some(&s.args)
            }
            InstructionBody::Invoke(i) => {
                h.update([1u8]);
                h.update(i.contract_id.as_bytes());
                h.update(i.command.as_bytes());
                Some(&i.args)
            }
            InstructionBody::Delete(d) => {
                h.update([2u8]);
                h.update(d.contract_id.as_bytes());
                None
            }
        };
        if let Some(args) = args {
            for a in args.iter() {
                h.update((a.name.len() as u64).to_le_bytes());
                h.update(a.name.as_bytes());
                h.update((a.value.len() as u64).to_le_bytes());
                h.update(&a.value);
            }
        }
        for ctr in &self.signer_counters {
            h.update(ctr.to_le_bytes());
        }
        for id in &self.signer_identities {
            let buf = id.public_bytes();
            h.update((buf.len() as u64).to_le_bytes());
            h.update(&buf);
        }
        CryptoHash::new(h.finalize().into())
    }

    /// Derive a new instance ID from the digest of this instruction, its signatures, and `what`.
    ///
    /// The signature lengths are length-prefixed so that moving bytes between neighboring
    /// signatures cannot produce a colliding derivation.
    pub fn derive_id(&self, what: &str) -> InstanceId {
        let mut h = Sha256::new();
        h.update(self.hash().bytes());
        h.update((self.signatures.len() as u32).to_le_bytes());
        for sig in &self.signatures {
            h.update((sig.len() as u32).to_le_bytes());
            h.update(sig);
        }
        h.update(what.as_bytes());
        InstanceId::new(h.finalize().into())
    }

    /// Sign this instruction. `msg` must be the digest of the containing transaction, otherwise
    /// verification fails on the other nodes.
    pub fn sign_with(&mut self, msg: &[u8], signers: &[DarcSigner]) -> Result<(), SignError> {
        if signers.len() != self.signer_identities.len() {
            return Err(SignError::IdentityCountMismatch);
        }
        if signers.len() != self.signer_counters.len() {
            return Err(SignError::CounterCountMismatch);
        }
        self.signatures = Vec::with_capacity(signers.len());
        for (i, signer) in signers.iter().enumerate() {
            if self.signer_identities[i] != signer.identity() {
                return Err(SignError::WrongIdentity);
            }
            self.signatures.push(signer.sign(msg));
        }
        Ok(())
    }

    /// Identity strings of the signers, as matched against DARC expressions.
    pub fn identity_strings(&self) -> Vec<String> {
        self.signer_identities.iter().map(|id| id.string()).collect()
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instr {} on {} ({} signers)",
            self.action(),
            self.instance_id,
            self.signer_identities.len()
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SignError {
    IdentityCountMismatch,
    CounterCountMismatch,
    WrongIdentity,
}

/// A non-empty ordered list of instructions, executed atomically.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct ClientTransaction {
    pub instructions: Vec<Instruction>,
}

impl ClientTransaction {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    /// SHA-256 over the concatenation of every instruction's digest.
    pub fn hash(&self) -> CryptoHash {
        let mut h = Sha256::new();
        for instr in &self.instructions {
            h.update(instr.hash().bytes());
        }
        CryptoHash::new(h.finalize().into())
    }

    /// Sign every instruction with the same set of signers.
    pub fn sign_with(&mut self, signers: &[DarcSigner]) -> Result<(), SignError> {
        let digest = self.hash();
        for instr in &mut self.instructions {
            instr.sign_with(&digest.bytes(), signers)?;
        }
        Ok(())
    }

    /// Fill every instruction's signer identities from the signers, then sign.
    pub fn fill_signers_and_sign_with(&mut self, signers: &[DarcSigner]) -> Result<(), SignError> {
        let ids: Vec<Identity> = signers.iter().map(|s| s.identity()).collect();
        for instr in &mut self.instructions {
            instr.signer_identities = ids.clone();
        }
        self.sign_with(signers)
    }
}

/// A client transaction together with whether it was accepted into the ledger.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct TxResult {
    pub client_transaction: ClientTransaction,
    pub accepted: bool,
}

/// Wrap client transactions into TxResults with `accepted` unset.
pub fn new_tx_results(cts: Vec<ClientTransaction>) -> Vec<TxResult> {
    cts.into_iter()
        .map(|ct| TxResult {
            client_transaction: ct,
            accepted: false,
        })
        .collect()
}

/// SHA-256 over every transaction's digest followed by its accept bit.
pub fn tx_results_hash(txs: &[TxResult]) -> CryptoHash {
    let mut h = Sha256::new();
    for tx in txs {
        h.update(tx.client_transaction.hash().bytes());
        h.update([tx.accepted as u8]);
    }
    CryptoHash::new(h.finalize().into())
}

/// The serialized size of a TxResult, as counted against the block byte budget.
pub fn tx_size(tx: &TxResult) -> u64 {
    tx.try_to_vec().map_or(u64::MAX, |buf| buf.len() as u64)
}

/// How a state change modifies the trie.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub enum StateAction {
    /// Insert a new key/value association.
    Create,
    /// Change the value of an existing key.
    Update,
    /// Delete an existing key/value association.
    Remove,
}

impl Display for StateAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StateAction::Create => write!(f, "Create"),
            StateAction::Update => write!(f, "Update"),
            StateAction::Remove => write!(f, "Remove"),
        }
    }
}

/// One mutation of one instance, as recorded in a block. The version is assigned at execution
/// time: 0 for a new instance, previous + 1 for updates.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct StateChange {
    pub action: StateAction,
    pub instance_id: InstanceId,
    pub contract_id: String,
    pub value: Vec<u8>,
    pub darc_id: DarcId,
    pub version: u64,
}

impl StateChange {
    pub fn new(
        action: StateAction,
        instance_id: InstanceId,
        contract_id: &str,
        value: Vec<u8>,
        darc_id: DarcId,
    ) -> Self {
        Self {
            action,
            instance_id,
            contract_id: contract_id.to_string(),
            value,
            darc_id,
            version: 0,
        }
    }

    /// The key under which this state change is stored in the trie.
    pub fn key(&self) -> InstanceId {
        self.instance_id
    }

    /// The value stored in the trie for this state change.
    pub fn body(&self) -> StateChangeBody {
        StateChangeBody {
            action: self.action,
            contract_id: self.contract_id.clone(),
            value: self.value.clone(),
            version: self.version,
            darc_id: self.darc_id,
        }
    }
}

impl Display for StateChange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (contract: {}, version: {})",
            self.action, self.instance_id, self.contract_id, self.version
        )
    }
}

/// What the trie stores under an instance ID.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct StateChangeBody {
    pub action: StateAction,
    pub contract_id: String,
    pub value: Vec<u8>,
    pub version: u64,
    pub darc_id: DarcId,
}

impl StateChangeBody {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.try_to_vec()
            .expect("state change body serialization is infallible")
    }

    pub fn from_bytes(buf: &[u8]) -> Result<StateChangeBody, std::io::Error> {
        StateChangeBody::try_from_slice(buf)
    }
}

/// SHA-256 over the serialization of every state change.
pub fn state_changes_hash(scs: &[StateChange]) -> CryptoHash {
    let mut h = Sha256::new();
    for sc in scs {
        let buf = sc.try_to_vec().expect("state change serialization is infallible");
        h.update(&buf);
    }
    CryptoHash::new(h.finalize().into())
}
