/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [`Committee`] type: the set of nodes that jointly control a chain.
//!
//! A committee of `N` members tolerates `F` Byzantine or crashed members, where `N >= 3F + 1`. Two
//! thresholds appear throughout the crate:
//!
//! | Threshold | Guarantee |
//! |-----------|-----------|
//! | `F + 1`   | At least one correct member is among any `F + 1` members. |
//! | `N - F`   | Any two sets of `N - F` members intersect in at least one correct member. |

use std::{collections::BTreeSet, slice};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{anchor::Address, data_types::NodeID};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Committee {
    // Kept in ascending order of identity bytes.
    members: Vec<NodeID>,
    f: u16,
    address: Address,
}

impl Committee {
    /// Create a committee that tolerates the largest `F` such that `N >= 3F + 1`.
    pub fn new(members: impl IntoIterator<Item = NodeID>, address: Address) -> Committee {
        let members: Vec<NodeID> = members
            .into_iter()
            .collect::<BTreeSet<NodeID>>()
            .into_iter()
            .collect();
        let f = (members.len().saturating_sub(1) / 3) as u16;
        Committee { members, f, address }
    }

    /// Create a committee with an explicit fault tolerance parameter.
    ///
    /// # Panics
    /// `3f + 1` must not exceed the number of distinct members.
    pub fn with_f(members: impl IntoIterator<Item = NodeID>, f: u16, address: Address) -> Committee {
        let mut committee = Committee::new(members, address);
        assert!(3 * f as usize + 1 <= committee.n(), "committee cannot tolerate {} faults", f);
        committee.f = f;
        committee
    }

    pub fn n(&self) -> usize {
        self.members.len()
    }

    pub fn f(&self) -> usize {
        self.f as usize
    }

    /// `N - F`.
    pub fn quorum(&self) -> usize {
        self.n() - self.f()
    }

    /// `F + 1`.
    pub fn honest_threshold(&self) -> usize {
        self.f() + 1
    }

    pub fn contains(&self, node: &NodeID) -> bool {
        self.members.binary_search(node).is_ok()
    }

    /// Position of `node` in the ascending order of members.
    pub fn index_of(&self, node: &NodeID) -> Option<usize> {
        self.members.binary_search(node).ok()
    }

    pub fn members(&self) -> slice::Iter<'_, NodeID> {
        self.members.iter()
    }

    /// The base-ledger address controlled by this committee.
    pub fn address(&self) -> Address {
        self.address
    }
}
