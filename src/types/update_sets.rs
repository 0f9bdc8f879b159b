/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that store updates to the chain state.

use std::{
    collections::{btree_map, btree_set, BTreeMap, BTreeSet},
    hash::Hash,
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Generic set of key-value updates that are applied together when a block is committed.
///
/// Both sides are kept in ordered collections, so iterating over an `UpdateSet` (and serializing it)
/// yields the same sequence on every node.
///
/// # Uniqueness of Key between `inserts` and `deletes`
///
/// A key is never scheduled for both insertion and deletion: scheduling one cancels the other.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct UpdateSet<K: Ord + Hash, V> {
    /// Insertion updates that will be applied when a `Block` is committed.
    inserts: BTreeMap<K, V>,

    /// Deletion updates that will be applied when a `Block` is committed.
    deletes: BTreeSet<K>,
}

impl<K: Ord + Hash, V> Default for UpdateSet<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Hash, V> UpdateSet<K, V> {
    /// Create a new `UpdateSet` with empty `inserts` and `deletes`.
    pub fn new() -> Self {
        Self {
            inserts: BTreeMap::new(),
            deletes: BTreeSet::new(),
        }
    }

    /// Schedule the insertion of a `key`-`value` pair.
    ///
    /// This cancels the deletion of `key`, if it has been scheduled using [`delete`](Self::delete).
    pub fn insert(&mut self, key: K, value: V) {
        self.deletes.remove(&key);
        self.inserts.insert(key, value);
    }

    /// Schedule the deletion of `key`.
    ///
    /// This cancels the insertion of `key`, if it has been scheduled using [`insert`](Self::insert).
    pub fn delete(&mut self, key: K) {
        self.inserts.remove(&key);
        self.deletes.insert(key);
    }

    /// Get whether the `UpdateSet` is scheduled to insert a value to `key`, and if so, returns a
    /// reference to that value.
    pub fn get_insert(&self, key: &K) -> Option<&V> {
        self.inserts.get(key)
    }

    /// Check whether the `UpdateSet` is scheduled to delete `key`.
    pub fn contains_delete(&self, key: &K) -> bool {
        self.deletes.contains(key)
    }

    /// Get an iterator over all of the key-value pairs that this `UpdateSet` will insert, in ascending
    /// order of keys.
    pub fn inserts(&self) -> btree_map::Iter<K, V> {
        self.inserts.iter()
    }

    /// Get an iterator over all of the keys that this `UpdateSet` will delete, in ascending order.
    pub fn deletes(&self) -> btree_set::Iter<K> {
        self.deletes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.deletes.len()
    }

    /// Apply every update in `other` on top of this `UpdateSet`.
    pub fn merge(&mut self, other: UpdateSet<K, V>) {
        for (key, value) in other.inserts {
            self.insert(key, value);
        }
        for key in other.deletes {
            self.delete(key);
        }
    }
}

/// Mutations of the chain state produced by executing a batch.
pub type StateMutations = UpdateSet<Vec<u8>, Vec<u8>>;
