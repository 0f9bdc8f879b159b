/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Read-only [`State`] snapshots identified by trie root, and the mutable [`StateDraft`] that batch
//! execution writes into.
//!
//! Both implement [`StateReader`], so that the execution pipeline can read through a draft exactly the
//! way it reads a committed snapshot.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    anchor::L1Commitment,
    data_types::{CryptoHash, SchemaVersion, StateIndex, Timestamp},
    update_sets::StateMutations,
};

use super::kv_store::{KVGetError, KVStore, Key};
use super::paths;
use super::store::StoreError;
use super::trie;

pub trait StateReader {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Read and deserialize the value of `key`.
    fn get_as<T: BorshDeserialize>(&self, key: &[u8]) -> Result<Option<T>, StoreError>
    where
        Self: Sized,
    {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(T::deserialize(&mut &*bytes).map_err(|err| {
                KVGetError::DeserializeValueError {
                    key: Key::StateValue { key: key.to_vec() },
                    source: err,
                }
            })?)),
        }
    }

    /* ↓↓↓ Reserved keys ↓↓↓ */

    fn block_index(&self) -> Result<StateIndex, StoreError>
    where
        Self: Sized,
    {
        Ok(self.get_as(&paths::STATE_BLOCK_INDEX)?.unwrap_or_default())
    }

    fn timestamp(&self) -> Result<Timestamp, StoreError>
    where
        Self: Sized,
    {
        Ok(self.get_as(&paths::STATE_TIMESTAMP)?.unwrap_or_default())
    }

    fn previous_l1_commitment(&self) -> Result<Option<L1Commitment>, StoreError>
    where
        Self: Sized,
    {
        self.get_as(&paths::STATE_PREVIOUS_L1_COMMITMENT)
    }

    fn schema_version(&self) -> Result<SchemaVersion, StoreError>
    where
        Self: Sized,
    {
        Ok(self.get_as(&paths::STATE_SCHEMA_VERSION)?.unwrap_or_default())
    }
}

/// An immutable view of the chain state at one trie root.
#[derive(Clone)]
pub struct State<K: KVStore> {
    kv_store: K,
    trie_root: CryptoHash,
}

impl<K: KVStore> State<K> {
    pub(crate) fn new(kv_store: K, trie_root: CryptoHash) -> Self {
        Self { kv_store, trie_root }
    }

    pub fn trie_root(&self) -> CryptoHash {
        self.trie_root
    }
}

impl<K: KVStore> StateReader for State<K> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(trie::get(&self.kv_store, &self.trie_root, key)?)
    }
}

/// A set of mutations staged on top of a base [`State`].
pub struct StateDraft<K: KVStore> {
    base: State<K>,
    base_l1_commitment: Option<L1Commitment>,
    state_index: StateIndex,
    timestamp: Timestamp,
    mutations: StateMutations,
}

impl<K: KVStore> StateDraft<K> {
    /// Create a draft for the block at `state_index`. The reserved keys for the block index, the
    /// timestamp, and the link to the previous commitment are set immediately.
    pub(crate) fn new(
        base: State<K>,
        base_l1_commitment: Option<L1Commitment>,
        state_index: StateIndex,
        timestamp: Timestamp,
    ) -> Self {
        let mut draft = Self {
            base,
            base_l1_commitment,
            state_index,
            timestamp,
            mutations: StateMutations::new(),
        };
        draft.set(&paths::STATE_BLOCK_INDEX, state_index.try_to_vec().unwrap());
        draft.set(&paths::STATE_TIMESTAMP, timestamp.try_to_vec().unwrap());
        if let Some(base_l1_commitment) = base_l1_commitment {
            draft.set(
                &paths::STATE_PREVIOUS_L1_COMMITMENT,
                base_l1_commitment.try_to_vec().unwrap(),
            );
        }
        draft
    }

    pub fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.mutations.insert(key.to_vec(), value)
    }

    pub fn set_as<T: BorshSerialize>(&mut self, key: &[u8], value: &T) {
        self.set(key, value.try_to_vec().unwrap())
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.mutations.delete(key.to_vec())
    }

    /// Apply a whole set of mutations on top of this draft.
    pub fn apply(&mut self, mutations: StateMutations) {
        self.mutations.merge(mutations)
    }

    pub fn mutations(&self) -> &StateMutations {
        &self.mutations
    }

    pub fn base_l1_commitment(&self) -> Option<L1Commitment> {
        self.base_l1_commitment
    }

    pub fn base_trie_root(&self) -> CryptoHash {
        self.base.trie_root()
    }

    pub fn state_index(&self) -> StateIndex {
        self.state_index
    }

    pub fn draft_timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub(crate) fn into_parts(self) -> (State<K>, Option<L1Commitment>, StateIndex, Timestamp, StateMutations) {
        (
            self.base,
            self.base_l1_commitment,
            self.state_index,
            self.timestamp,
            self.mutations,
        )
    }
}

impl<K: KVStore> StateReader for StateDraft<K> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let key_vec = key.to_vec();
        if let Some(value) = self.mutations.get_insert(&key_vec) {
            return Ok(Some(value.clone()));
        }
        if self.mutations.contains_delete(&key_vec) {
            return Ok(None);
        }
        self.base.get(key)
    }
}
