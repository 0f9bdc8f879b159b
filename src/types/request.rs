/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for requests: units of work addressed to a contract entry point.
//!
//! A [`Request`] is either:
//! 1. An [`OffLedgerRequest`], submitted directly to committee members and authenticated by the
//!    sender's signature over its contents (including a per-sender nonce), or
//! 2. An [`OnLedgerRequest`], observed as an output sent to the chain's address on the base ledger.
//!
//! Both variants share one capability set ([`Request::id`], [`Request::allowance`], [`Request::params`],
//! [`Request::gas_budget`], [`Request::sender_account`], [`Request::target`]), dispatched by pattern
//! matching.
//!
//! Consensus refers to requests by [`RequestRef`], which binds a request's identity to a digest of its
//! full contents, so that a faulty node cannot substitute a different request under the same ID.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    time::Duration,
};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    anchor::{Address, OutputID},
    crypto_primitives::{verify_signature, Keypair},
    data_types::{ChainID, CryptoHash, GasUnits, Hname, NodeID, SignatureBytes, Timestamp},
};

/// Identity of a request. Derived from nonce, sender, and chain for off-ledger requests, and from the
/// output ID for on-ledger requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct RequestID(pub CryptoHash);

impl RequestID {
    /// The ID of the on-ledger request held by the output `output_id`.
    pub fn of_output(output_id: &OutputID) -> RequestID {
        RequestID(CryptoHash::of(&[b"on-ledger", &output_id.bytes()]))
    }
}

impl Display for RequestID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A reference to a request: its ID and the hash of its full contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct RequestRef {
    pub id: RequestID,
    pub hash: CryptoHash,
}

impl RequestRef {
    pub fn as_key(&self) -> RequestRefKey {
        let mut key = [0u8; 64];
        key[0..32].copy_from_slice(&self.id.0.bytes());
        key[32..64].copy_from_slice(&self.hash.bytes());
        RequestRefKey(key)
    }
}

/// Stable key under which pools and decision functions deduplicate requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestRefKey([u8; 64]);

/// Contract and entry point that a request calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CallTarget {
    pub contract: Hname,
    pub entry_point: Hname,
}

impl CallTarget {
    pub const fn new(contract: Hname, entry_point: Hname) -> Self {
        Self { contract, entry_point }
    }
}

/// Named call arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Params(BTreeMap<Vec<u8>, Vec<u8>>);

impl Params {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, key: &[u8], value: &[u8]) -> Self {
        self.0.insert(key.to_vec(), value.to_vec());
        self
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.0.get(key)
    }
}

/// Assets that a request authorizes the called contract to take from the sender's account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Assets {
    pub base_tokens: u64,
}

/// An account on the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub enum AgentID {
    /// An account controlled by an Ed25519 key.
    Key(NodeID),
    /// An account controlled by a base-ledger address.
    Address(Address),
}

impl AgentID {
    pub fn bytes(&self) -> Vec<u8> {
        self.try_to_vec().unwrap()
    }
}

/// The signed part of an [`OffLedgerRequest`].
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OffLedgerRequestEssence {
    pub chain_id: ChainID,
    pub target: CallTarget,
    pub params: Params,
    pub nonce: u64,
    pub gas_budget: GasUnits,
    pub allowance: Assets,
    pub sender: NodeID,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OffLedgerRequest {
    pub essence: OffLedgerRequestEssence,
    pub signature: SignatureBytes,
}

impl OffLedgerRequest {
    /// Sign `essence` with `keypair`. The essence's `sender` is overwritten with the keypair's identity.
    pub fn new_signed(mut essence: OffLedgerRequestEssence, keypair: &Keypair) -> OffLedgerRequest {
        essence.sender = keypair.node_id();
        let signature = keypair.sign(&essence.try_to_vec().unwrap());
        OffLedgerRequest { essence, signature }
    }

    pub fn verify_signature(&self) -> bool {
        verify_signature(
            &self.essence.sender,
            &self.essence.try_to_vec().unwrap(),
            &self.signature,
        )
    }

    pub fn id(&self) -> RequestID {
        RequestID(CryptoHash::of(&[
            b"off-ledger",
            &self.essence.chain_id.bytes(),
            &self.essence.sender.bytes(),
            &self.essence.nonce.to_le_bytes(),
        ]))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OnLedgerRequest {
    pub output_id: OutputID,
    pub sender: AgentID,
    pub target: CallTarget,
    pub params: Params,
    /// Assets carried by the output itself, credited to the sender before the call.
    pub assets: Assets,
    pub allowance: Assets,
    pub gas_budget: GasUnits,
    /// The request may not be processed before this time.
    pub time_lock: Option<Timestamp>,
    /// The request may not be processed after this time.
    pub expiration: Option<Timestamp>,
}

impl OnLedgerRequest {
    pub fn id(&self) -> RequestID {
        RequestID::of_output(&self.output_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Request {
    OffLedger(OffLedgerRequest),
    OnLedger(OnLedgerRequest),
}

impl Request {
    pub fn id(&self) -> RequestID {
        match self {
            Request::OffLedger(req) => req.id(),
            Request::OnLedger(req) => req.id(),
        }
    }

    /// Hash of the full contents of the request.
    pub fn hash(&self) -> CryptoHash {
        CryptoHash::of(&[&self.try_to_vec().unwrap()])
    }

    pub fn request_ref(&self) -> RequestRef {
        RequestRef {
            id: self.id(),
            hash: self.hash(),
        }
    }

    pub fn target(&self) -> CallTarget {
        match self {
            Request::OffLedger(req) => req.essence.target,
            Request::OnLedger(req) => req.target,
        }
    }

    pub fn params(&self) -> &Params {
        match self {
            Request::OffLedger(req) => &req.essence.params,
            Request::OnLedger(req) => &req.params,
        }
    }

    pub fn allowance(&self) -> Assets {
        match self {
            Request::OffLedger(req) => req.essence.allowance,
            Request::OnLedger(req) => req.allowance,
        }
    }

    pub fn gas_budget(&self) -> GasUnits {
        match self {
            Request::OffLedger(req) => req.essence.gas_budget,
            Request::OnLedger(req) => req.gas_budget,
        }
    }

    pub fn sender_account(&self) -> AgentID {
        match self {
            Request::OffLedger(req) => AgentID::Key(req.essence.sender),
            Request::OnLedger(req) => req.sender,
        }
    }

    pub fn is_off_ledger(&self) -> bool {
        matches!(self, Request::OffLedger(_))
    }

    /// Time before which the request must not be processed, if any.
    pub fn time_lock(&self) -> Option<Timestamp> {
        match self {
            Request::OffLedger(_) => None,
            Request::OnLedger(req) => req.time_lock,
        }
    }

    /// Whether the request can no longer be processed at `now`. A request is treated as expired
    /// `window` before its actual expiration, so that it cannot expire while a batch containing it is
    /// still in flight.
    pub fn is_expired(&self, now: Timestamp, window: Duration) -> bool {
        match self {
            Request::OffLedger(_) => false,
            Request::OnLedger(req) => match req.expiration {
                Some(expiration) => now + window >= expiration,
                None => false,
            },
        }
    }
}
