/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Distributed access-right contracts (DARCs) and the identities that satisfy them.
//!
//! A DARC is a versioned, evolvable access-control document. It carries a set of
//! [rules](Rules): each rule maps an action string (`"spawn:coin"`, `"invoke:config.
//! update_config"`, the special sign action `"_sign"`, ...) to a boolean
//! [expression](expression) over identities. An instruction is authorized when the DARC governing
//! its target instance has a rule for the instruction's action whose expression is satisfied by
//! the instruction's signer identities.
//!
//! DARCs evolve: version `n+1` of a DARC carries the same base ID as version `n` and the hash of
//! version `n` as its `prev_id`. The base ID of a version-0 DARC is its own hash.

pub mod expression;

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signer as DalekSigner, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt::{self, Debug, Display, Formatter};

use crate::types::basic::CryptoHash;

/// The action every DARC must have a rule for: it gates signing on behalf of the DARC, and is the
/// rule followed when resolving a `darc:<hex>` atom in an expression.
pub const SIGN_ACTION: &str = "_sign";

/// The base identifier of a DARC. Stays fixed across evolutions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct DarcId([u8; 32]);

impl DarcId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Option<DarcId> {
        if s.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for i in 0..32 {
            bytes[i] = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
        }
        Some(DarcId(bytes))
    }
}

impl Display for DarcId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl Debug for DarcId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// An identity that can appear in a DARC expression or sign an instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub enum Identity {
    /// An Ed25519 public key.
    Ed25519([u8; 32]),
    /// A reference to another DARC: satisfied by any identity set that satisfies that DARC's sign
    /// rule.
    Darc(DarcId),
}

impl Identity {
    /// The canonical string form, used in rule expressions: `ed25519:<hex>` or `darc:<hex>`.
    pub fn string(&self) -> String {
        match self {
            Identity::Ed25519(pk) => {
                let hex: String = pk.iter().map(|b| format!("{:02x}", b)).collect();
                format!("ed25519:{}", hex)
            }
            Identity::Darc(id) => format!("darc:{}", id.hex()),
        }
    }

    /// The raw public bytes of the identity, as hashed into instruction digests.
    pub fn public_bytes(&self) -> Vec<u8> {
        match self {
            Identity::Ed25519(pk) => pk.to_vec(),
            Identity::Darc(id) => id.bytes().to_vec(),
        }
    }

    /// Verify a signature over msg. Only Ed25519 identities can verify directly; a Darc identity
    /// never verifies (it is satisfied through expression evaluation instead).
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<(), DarcError> {
        match self {
            Identity::Ed25519(pk) => {
                let key =
                    VerifyingKey::from_bytes(pk).map_err(|_| DarcError::InvalidSignature)?;
                let sig_bytes: [u8; 64] =
                    sig.try_into().map_err(|_| DarcError::InvalidSignature)?;
                let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
                key.verify(msg, &signature)
                    .map_err(|_| DarcError::InvalidSignature)
            }
            Identity::Darc(_) => Err(DarcError::InvalidSignature),
        }
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Holds an Ed25519 keypair and produces signatures over instruction digests.
#[derive(Clone)]
pub struct DarcSigner {
    signing_key: SigningKey,
}

impl DarcSigner {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn identity(&self) -> Identity {
        Identity::Ed25519(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key.sign(msg).to_bytes().to_vec()
    }
}

/// One rule of a DARC: an action string paired with an expression over identities.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Rule {
    pub action: String,
    pub expr: String,
}

/// The ordered rule set of a DARC.
#[derive(Clone, PartialEq, Eq, Debug, Default, BorshDeserialize, BorshSerialize)]
pub struct Rules(Vec<Rule>);

impl Rules {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Add or replace the rule for an action.
    pub fn set(&mut self, action: &str, expr: &str) {
        if let Some(rule) = self.0.iter_mut().find(|r| r.action == action) {
            rule.expr = expr.to_string();
        } else {
            self.0.push(Rule {
                action: action.to_string(),
                expr: expr.to_string(),
            });
        }
    }

    pub fn get(&self, action: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|r| r.action == action)
            .map(|r| r.expr.as_str())
    }

    pub fn contains(&self, action: &str) -> bool {
        self.get(action).is_some()
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.0.iter()
    }
}

/// A versioned access-control document.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Darc {
    pub version: u64,
    pub description: Vec<u8>,
    /// The base ID as stored. Zero for a version-0 DARC, whose base ID is its own hash.
    base_id: DarcId,
    /// Hash of the previous version. Zero for a version-0 DARC.
    pub prev_id: CryptoHash,
    pub rules: Rules,
}

impl Darc {
    /// Create a fresh version-0 DARC.
    pub fn new(rules: Rules, description: &[u8]) -> Self {
        Self {
            version: 0,
            description: description.to_vec(),
            base_id: DarcId::zero(),
            prev_id: CryptoHash::zero(),
            rules,
        }
    }

    /// A genesis DARC for the given owner identities: grants the sign rule and the rules needed
    /// to administer the chain configuration and spawn further DARCs.
    pub fn genesis(owners: &[Identity], description: &[u8]) -> Self {
        let expr = owners
            .iter()
            .map(|id| id.string())
            .collect::<Vec<_>>()
            .join(" | ");
        let mut rules = Rules::new();
        rules.set(SIGN_ACTION, &expr);
        rules.set("invoke:config.update_config", &expr);
        rules.set("spawn:darc", &expr);
        rules.set("invoke:darc.evolve", &expr);
        Self::new(rules, description)
    }

    /// The hash of this version of the DARC.
    pub fn id(&self) -> CryptoHash {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update((self.description.len() as u64).to_le_bytes());
        hasher.update(&self.description);
        hasher.update(self.base_id.bytes());
        hasher.update(self.prev_id.bytes());
        for rule in self.rules.iter() {
            hasher.update((rule.action.len() as u64).to_le_bytes());
            hasher.update(rule.action.as_bytes());
            hasher.update((rule.expr.len() as u64).to_le_bytes());
            hasher.update(rule.expr.as_bytes());
        }
        CryptoHash::new(hasher.finalize().into())
    }

    /// The immutable base ID: the stored base for an evolved DARC, the document's own hash for a
    /// version-0 DARC.
    pub fn base_id(&self) -> DarcId {
        if self.version == 0 {
            DarcId::new(self.id().bytes())
        } else {
            self.base_id
        }
    }

    /// Produce the next version of this DARC with a new rule set.
    pub fn evolve(&self, rules: Rules) -> Darc {
        Darc {
            version: self.version + 1,
            description: self.description.clone(),
            base_id: self.base_id(),
            prev_id: self.id(),
            rules,
        }
    }

    /// Check that `new` is a valid direct successor of `self`.
    pub fn verify_evolution(&self, new: &Darc) -> Result<(), DarcError> {
        if new.version != self.version + 1 {
            return Err(DarcError::BadEvolution("version must increase by one"));
        }
        if new.base_id() != self.base_id() {
            return Err(DarcError::BadEvolution("base ID must not change"));
        }
        if new.prev_id != self.id() {
            return Err(DarcError::BadEvolution("prev ID must be the previous hash"));
        }
        if !new.rules.contains(SIGN_ACTION) {
            return Err(DarcError::BadEvolution("sign rule is mandatory"));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.try_to_vec().expect("darc serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Darc, DarcError> {
        Darc::try_from_slice(bytes).map_err(|_| DarcError::Malformed)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DarcError {
    /// The DARC bytes could not be decoded.
    Malformed,
    /// An expression could not be parsed.
    MalformedExpression,
    /// A signature did not verify under the claimed identity.
    InvalidSignature,
    /// An action has no rule in the governing DARC.
    MissingRule(String),
    /// The rule's expression was not satisfied by the presented identities.
    ExpressionUnsatisfied,
    /// A proposed evolution broke an invariant.
    BadEvolution(&'static str),
}

impl Display for DarcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DarcError::Malformed => write!(f, "malformed darc"),
            DarcError::MalformedExpression => write!(f, "malformed rule expression"),
            DarcError::InvalidSignature => write!(f, "invalid signature"),
            DarcError::MissingRule(action) => write!(f, "action '{}' does not exist", action),
            DarcError::ExpressionUnsatisfied => write!(f, "expression not satisfied"),
            DarcError::BadEvolution(why) => write!(f, "invalid darc evolution: {}", why),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn signer() -> DarcSigner {
        DarcSigner::new(SigningKey::generate(&mut OsRng))
    }

    #[test]
    fn base_id_is_stable_across_evolutions() {
        let s = signer();
        let d0 = Darc::genesis(&[s.identity()], b"genesis");
        let mut rules = d0.rules.clone();
        rules.set("spawn:coin", &s.identity().string());
        let d1 = d0.evolve(rules);

        assert_eq!(d0.base_id(), d1.base_id());
        assert_eq!(d1.prev_id, d0.id());
        d0.verify_evolution(&d1).unwrap();
    }

    #[test]
    fn evolution_must_keep_sign_rule() {
        let s = signer();
        let d0 = Darc::genesis(&[s.identity()], b"");
        let d1 = d0.evolve(Rules::new());
        assert!(d0.verify_evolution(&d1).is_err());
    }

    #[test]
    fn signatures_round_trip() {
        let s = signer();
        let msg = b"a message";
        let sig = s.sign(msg);
        s.identity().verify(msg, &sig).unwrap();
        assert!(s.identity().verify(b"another message", &sig).is_err());
    }

    #[test]
    fn darc_encoding_round_trips() {
        let s = signer();
        let d = Darc::genesis(&[s.identity()], b"genesis");
        let decoded = Darc::from_bytes(&d.to_bytes()).unwrap();
        assert_eq!(d, decoded);
    }
}
