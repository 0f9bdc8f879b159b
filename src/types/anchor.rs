/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the anchor: the base-ledger output that commits to the chain's current state.
//!
//! A chain advances by consuming its current [`AliasOutputWithID`] in a transaction that produces the
//! next one, whose state index is exactly one higher and whose state metadata is the
//! [`L1Commitment`] of the new state.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{CryptoHash, StateIndex};

/// Identifies a state snapshot: the root of the state trie together with the hash of the block that
/// produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct L1Commitment {
    pub trie_root: CryptoHash,
    pub block_hash: CryptoHash,
}

impl L1Commitment {
    pub const fn new(trie_root: CryptoHash, block_hash: CryptoHash) -> Self {
        Self { trie_root, block_hash }
    }

    /// Content hash of the commitment.
    pub fn hash(&self) -> CryptoHash {
        CryptoHash::of(&[&self.trie_root.bytes(), &self.block_hash.bytes()])
    }
}

impl Display for L1Commitment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trie_root, self.block_hash)
    }
}

/// Address of an account on the base ledger, such as the committee's state controller address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct Address(pub CryptoHash);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct TransactionID(pub CryptoHash);

/// Identifies one output of a base-ledger transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct OutputID {
    pub transaction_id: TransactionID,
    pub index: u16,
}

impl OutputID {
    pub const fn new(transaction_id: TransactionID, index: u16) -> Self {
        Self { transaction_id, index }
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut bytes = self.transaction_id.0.bytes().to_vec();
        bytes.extend_from_slice(&self.index.to_le_bytes());
        bytes
    }
}

impl Display for OutputID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_id.0, self.index)
    }
}

/// The chain's output on the base ledger.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AliasOutput {
    pub state_index: StateIndex,
    pub state_metadata: L1Commitment,
    /// The address that may advance the chain, i.e., the committee.
    pub state_controller: Address,
    /// The address that may rotate the committee.
    pub governor: Address,
    pub amount: u64,
}

impl AliasOutput {
    /// The successor of this output that commits to `commitment`, controlled by the same addresses.
    pub fn successor(&self, commitment: L1Commitment) -> Option<AliasOutput> {
        Some(AliasOutput {
            state_index: self.state_index.next()?,
            state_metadata: commitment,
            state_controller: self.state_controller,
            governor: self.governor,
            amount: self.amount,
        })
    }
}

/// An [`AliasOutput`] together with the ID under which it appears on the base ledger.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AliasOutputWithID {
    pub output_id: OutputID,
    pub output: AliasOutput,
}

impl AliasOutputWithID {
    pub const fn new(output_id: OutputID, output: AliasOutput) -> Self {
        Self { output_id, output }
    }

    pub fn state_index(&self) -> StateIndex {
        self.output.state_index
    }

    pub fn l1_commitment(&self) -> L1Commitment {
        self.output.state_metadata
    }

    /// Hash of the whole anchor, output ID included. Two anchors are the same anchor iff their hashes
    /// are equal.
    pub fn hash(&self) -> CryptoHash {
        CryptoHash::of(&[&self.try_to_vec().unwrap()])
    }
}

impl Display for AliasOutputWithID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "AO[si#{}]{}", self.output.state_index, self.output_id)
    }
}
