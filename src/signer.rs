/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](ThresholdSigner) for the pluggable threshold signature provider, and the
//! [`CommonCoin`] that binary agreement flips.
//!
//! The threshold signer is an external collaborator: it holds this node's share of the committee's
//! signing key, exchanges partial signatures with the rest of the committee, and returns the aggregated
//! signature once a quorum of shares is collected. Aggregated threshold signatures are unique for a given
//! payload, so every correct node obtains the same bytes. This is what lets signatures double as a
//! source of committee-wide randomness.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use borsh::BorshSerialize;

use crate::types::{
    anchor::{Address, OutputID},
    crypto_primitives::{CryptoHasher, Digest},
    data_types::{ChainID, CryptoHash, LogIndex, NodeID},
};

pub trait ThresholdSigner: Send + 'static {
    /// The committee address that signatures produced by this signer unlock.
    fn address(&self) -> Address;

    /// This node's proposal of the distributed key shares to use when signing.
    fn index_proposal(&self) -> Vec<u16>;

    /// Produce the aggregated committee signature over `request.payload`. Blocks until a quorum of
    /// partial signatures is collected, or until `request.timeout` has passed.
    fn sign(&mut self, request: SignRequest) -> Result<Vec<u8>, SignError>;
}

#[derive(Clone, Debug)]
pub struct SignRequest {
    pub chain_id: ChainID,
    pub log_index: LogIndex,
    pub payload: Vec<u8>,
    /// The decided index proposals, sorted by node.
    pub dss_index_proposals: BTreeMap<NodeID, Vec<u16>>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignError {
    QuorumNotReached,
    Timeout,
    Rejected(String),
}

impl Display for SignError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SignError::QuorumNotReached => write!(f, "signature quorum not reached"),
            SignError::Timeout => write!(f, "signing timed out"),
            SignError::Rejected(reason) => write!(f, "signing rejected: {}", reason),
        }
    }
}

/// A source of random bits that every correct committee member observes identically, and that no
/// member can predict before a quorum has decided to flip it.
pub trait CommonCoin {
    fn flip(&mut self, instance: u16, round: u32) -> Result<bool, SignError>;
}

/// Payload signed to derive the randomness of the consensus instance building on `base`.
pub(crate) fn randomness_payload(base: &OutputID) -> Vec<u8> {
    let mut payload = b"rnd".to_vec();
    payload.extend(base.bytes());
    payload
}

/// Hash an aggregated signature into 32 bytes of randomness.
pub(crate) fn randomness_from_signature(signature: &[u8]) -> CryptoHash {
    CryptoHash::of(&[signature])
}

/// A [`CommonCoin`] whose flips are the low bit of the hash of the committee's threshold signature over
/// the flip's coordinates.
pub(crate) struct SignerCoin<'a, S: ThresholdSigner> {
    signer: &'a mut S,
    chain_id: ChainID,
    log_index: LogIndex,
    timeout: Duration,
}

impl<'a, S: ThresholdSigner> SignerCoin<'a, S> {
    pub(crate) fn new(signer: &'a mut S, chain_id: ChainID, log_index: LogIndex, timeout: Duration) -> Self {
        Self { signer, chain_id, log_index, timeout }
    }
}

impl<'a, S: ThresholdSigner> CommonCoin for SignerCoin<'a, S> {
    fn flip(&mut self, instance: u16, round: u32) -> Result<bool, SignError> {
        let payload = (b"coin".to_vec(), self.log_index, instance, round)
            .try_to_vec()
            .unwrap();
        let signature = self.signer.sign(SignRequest {
            chain_id: self.chain_id,
            log_index: self.log_index,
            payload,
            dss_index_proposals: BTreeMap::new(),
            timeout: self.timeout,
        })?;
        let digest = CryptoHasher::digest(&signature);
        Ok(digest[0] & 1 == 1)
    }
}
