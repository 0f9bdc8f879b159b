/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [`Block`] type.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    anchor::L1Commitment,
    data_types::{CryptoHash, StateIndex, Timestamp},
    update_sets::StateMutations,
};

/// An immutable set of state mutations, applied on top of the state identified by
/// `previous_l1_commitment`, that results in the state whose trie root is `trie_root`.
///
/// Only the origin block has no previous commitment.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub state_index: StateIndex,
    pub timestamp: Timestamp,
    pub previous_l1_commitment: Option<L1Commitment>,
    pub mutations: StateMutations,
    pub trie_root: CryptoHash,
}

impl Block {
    /// Hash of everything in the block except the trie root, which is itself a function of the
    /// previous state and the mutations.
    pub fn hash(&self) -> CryptoHash {
        CryptoHash::of(&[
            &self.state_index.try_to_vec().unwrap(),
            &self.timestamp.try_to_vec().unwrap(),
            &self.previous_l1_commitment.try_to_vec().unwrap(),
            &self.mutations.try_to_vec().unwrap(),
        ])
    }

    pub fn l1_commitment(&self) -> L1Commitment {
        L1Commitment::new(self.trie_root, self.hash())
    }

    pub fn is_origin(&self) -> bool {
        self.previous_l1_commitment.is_none()
    }
}
