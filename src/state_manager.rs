/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`StateManager`]: the single writer of a chain's [`Store`].
//!
//! ## Block tree
//!
//! Blocks form a tree rooted at the origin block. Consensus instances commit blocks on top of whatever
//! base their committee decided on, so the tree can branch when instances are aborted, retried, or
//! superseded by a reorganization of the base ledger. The state manager keeps the tree bounded in two
//! ways:
//! 1. **Retention**: after every commit, ancestors of the new block that are buried at least
//!    `pruning_min_states_to_keep` states deep are pruned, oldest first, at most
//!    `pruning_max_states_to_delete` at a time. Ancestors are found through an in-memory index from state
//!    index to trie root of the chain that ends at the latest committed or confirmed block. A commit only
//!    indexes the blocks above the point where its branch leaves the indexed chain.
//! 2. **Dead branches**: when the ledger confirms an anchor, every branch that forks off the confirmed
//!    chain below the confirmed block is deleted, since no consensus instance can build on it anymore.
//!
//! ## Missing blocks
//!
//! When the ledger confirms an anchor whose block is not stored locally, [`StateManager::sync_to`]
//! fetches it, and every missing ancestor, through a [`BlockFetcher`].

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::block_sync::client::{BlockSyncClient, BlockSyncError};
use crate::events::*;
use crate::networking::Network;
use crate::state::{store::PruneStats, Block, KVStore, StateDraft, Store, StoreError};
use crate::types::{
    anchor::{AliasOutputWithID, L1Commitment},
    data_types::{CryptoHash, StateIndex, Timestamp},
};

/// Source of blocks that are missing from the local store.
pub trait BlockFetcher {
    fn fetch(&mut self, commitment: &L1Commitment) -> Result<Block, BlockSyncError>;
}

impl<N: Network> BlockFetcher for BlockSyncClient<N> {
    fn fetch(&mut self, commitment: &L1Commitment) -> Result<Block, BlockSyncError> {
        BlockSyncClient::fetch(self, commitment)
    }
}

pub struct StateManager<K: KVStore> {
    store: Store<K>,
    pruning_min_states_to_keep: u32,
    pruning_max_states_to_delete: u32,
    last_confirmed: Option<L1Commitment>,
    // Unpruned blocks of the chain that ends at the last indexed block, origin excluded.
    chain: BTreeMap<StateIndex, CryptoHash>,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore> StateManager<K> {
    pub fn new(
        store: Store<K>,
        pruning_min_states_to_keep: u32,
        pruning_max_states_to_delete: u32,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            store,
            pruning_min_states_to_keep,
            pruning_max_states_to_delete,
            last_confirmed: None,
            chain: BTreeMap::new(),
            event_publisher,
        }
    }

    /// A read handle to the store. Writes go through the state manager.
    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    pub fn has_block(&self, commitment: &L1Commitment) -> Result<bool, StateManagerError> {
        Ok(self.store.has_block(commitment)?)
    }

    pub fn new_state_draft(
        &self,
        timestamp: Timestamp,
        base: &L1Commitment,
    ) -> Result<StateDraft<K>, StateManagerError> {
        Ok(self.store.new_state_draft(timestamp, base)?)
    }

    /// Commit `draft`, then prune the ancestors of the new block that are buried deep enough.
    pub fn commit(&mut self, draft: StateDraft<K>) -> Result<Block, StateManagerError> {
        let block = self.store.commit(draft)?;

        Event::publish(
            &self.event_publisher,
            Event::CommitBlock(CommitBlockEvent {
                timestamp: SystemTime::now(),
                block: block.l1_commitment(),
                state_index: block.state_index,
            }),
        );

        self.prune_buried(&block)?;
        Ok(block)
    }

    /// Record that the ledger confirmed `alias_output`: make its block the latest block, and delete the
    /// branches that fork off below it.
    ///
    /// The block of `alias_output` must be stored. Call [`sync_to`](Self::sync_to) first if it may not be.
    pub fn on_anchor_confirmed(&mut self, alias_output: &AliasOutputWithID) -> Result<(), StateManagerError> {
        let commitment = alias_output.l1_commitment();
        if !self.store.has_block(&commitment)? {
            return Err(StateManagerError::MissingBlock { commitment });
        }
        self.store.set_latest(&commitment)?;
        self.remove_dead_branches(&commitment)?;
        self.last_confirmed = Some(commitment);

        let confirmed = self.store.block_by_trie_root(&commitment.trie_root)?;
        self.prune_buried(&confirmed)?;
        Ok(())
    }

    /// Fetch the block identified by `target` and every missing ancestor of it, then commit them oldest
    /// first. Returns the number of blocks fetched.
    pub fn sync_to(
        &mut self,
        target: &AliasOutputWithID,
        fetcher: &mut impl BlockFetcher,
    ) -> Result<u64, StateManagerError> {
        let target_commitment = target.l1_commitment();
        if self.store.has_block(&target_commitment)? {
            return Ok(0);
        }

        Event::publish(
            &self.event_publisher,
            Event::StartSync(StartSyncEvent {
                timestamp: SystemTime::now(),
                target: target_commitment,
                state_index: target.state_index(),
            }),
        );

        let mut fetched = Vec::new();
        let mut next = target_commitment;
        loop {
            let block = fetcher.fetch(&next)?;
            let parent = block
                .previous_l1_commitment
                .ok_or(StateManagerError::ForeignOrigin { commitment: next })?;
            fetched.push(block);
            if self.store.has_block(&parent)? {
                break;
            }
            next = parent;
        }

        let blocks_synced = fetched.len() as u64;
        for block in fetched.iter().rev() {
            self.store.commit_block(block)?;
            Event::publish(
                &self.event_publisher,
                Event::CommitBlock(CommitBlockEvent {
                    timestamp: SystemTime::now(),
                    block: block.l1_commitment(),
                    state_index: block.state_index,
                }),
            );
        }

        Event::publish(
            &self.event_publisher,
            Event::EndSync(EndSyncEvent {
                timestamp: SystemTime::now(),
                target: target_commitment,
                blocks_synced,
            }),
        );

        Ok(blocks_synced)
    }

    /* ↓↓↓ Pruning ↓↓↓ */

    fn prune_buried(&mut self, tip: &Block) -> Result<(), StateManagerError> {
        self.index_chain(tip)?;
        let horizon = match tip.state_index.int().checked_sub(self.pruning_min_states_to_keep) {
            Some(horizon) => StateIndex::new(horizon),
            None => return Ok(()),
        };

        let buried: Vec<(StateIndex, CryptoHash)> = self
            .chain
            .range(..=horizon)
            .take(self.pruning_max_states_to_delete as usize)
            .map(|(state_index, trie_root)| (*state_index, *trie_root))
            .collect();
        for (state_index, trie_root) in buried {
            self.chain.remove(&state_index);
            self.prune(&trie_root)?;
        }
        Ok(())
    }

    /// Make `tip` the end of the indexed chain. Walks back from `tip` only until it meets the indexed
    /// chain, an already pruned block, or the origin.
    fn index_chain(&mut self, tip: &Block) -> Result<(), StoreError> {
        if tip.is_origin() {
            return Ok(());
        }
        let _ = self.chain.split_off(&tip.state_index);
        self.chain.insert(tip.state_index, tip.trie_root);

        let mut lowest = tip.state_index;
        let mut next = tip.previous_l1_commitment;
        while let Some(commitment) = next {
            let state_index = match lowest.int().checked_sub(1) {
                Some(state_index) => StateIndex::new(state_index),
                None => break,
            };
            if self.chain.get(&state_index) == Some(&commitment.trie_root) {
                return Ok(());
            }
            let ancestor = match self.store.block_by_trie_root(&commitment.trie_root) {
                Ok(ancestor) => ancestor,
                Err(StoreError::NotFound { .. }) => break,
                Err(err) => return Err(err),
            };
            if ancestor.is_origin() {
                break;
            }
            self.chain.insert(state_index, ancestor.trie_root);
            lowest = state_index;
            next = ancestor.previous_l1_commitment;
        }

        // The walk did not meet the indexed chain, so whatever is indexed below belongs to another branch.
        self.chain = self.chain.split_off(&lowest);
        Ok(())
    }

    fn remove_dead_branches(&mut self, confirmed: &L1Commitment) -> Result<(), StateManagerError> {
        let last_confirmed_index = match &self.last_confirmed {
            Some(last_confirmed) => match self.store.block_by_trie_root(&last_confirmed.trie_root) {
                Ok(block) => Some(block.state_index),
                Err(StoreError::NotFound { .. }) => None,
                Err(err) => return Err(err.into()),
            },
            None => None,
        };

        // The confirmed chain from the confirmed block down to the previously confirmed block (or just
        // below it, after a reorganization), newest first.
        let mut path = Vec::new();
        let mut next = Some(*confirmed);
        while let Some(commitment) = next {
            let block = match self.store.block_by_trie_root(&commitment.trie_root) {
                Ok(block) => block,
                Err(StoreError::NotFound { .. }) => break,
                Err(err) => return Err(err.into()),
            };
            path.push(block.trie_root);
            let reached_last_confirmed = match (&self.last_confirmed, last_confirmed_index) {
                (Some(last_confirmed), Some(index)) => {
                    commitment == *last_confirmed || block.state_index < index
                }
                _ => false,
            };
            if reached_last_confirmed {
                break;
            }
            next = block.previous_l1_commitment;
        }

        for window in path.windows(2) {
            let (on_path, parent) = (window[0], window[1]);
            for child in self.store.children(&parent)? {
                if child != on_path {
                    self.remove_subtree(&child)?;
                }
            }
        }
        Ok(())
    }

    fn remove_subtree(&mut self, root: &CryptoHash) -> Result<(), StateManagerError> {
        for child in self.store.children(root)? {
            self.remove_subtree(&child)?;
        }
        let stats = self.store.delete_abandoned(root)?;
        self.publish_prune(root, &stats);
        Ok(())
    }

    fn prune(&mut self, trie_root: &CryptoHash) -> Result<(), StateManagerError> {
        let stats = self.store.prune(trie_root)?;
        self.publish_prune(trie_root, &stats);
        Ok(())
    }

    fn publish_prune(&self, trie_root: &CryptoHash, stats: &PruneStats) {
        log::debug!(
            "StateManager: pruned block {} at index {}, {} trie nodes deleted",
            trie_root,
            stats.state_index,
            stats.nodes_deleted
        );
        Event::publish(
            &self.event_publisher,
            Event::PruneBlock(PruneBlockEvent {
                timestamp: SystemTime::now(),
                block: *trie_root,
                state_index: stats.state_index,
            }),
        );
    }
}

#[derive(Debug)]
pub enum StateManagerError {
    StoreError(StoreError),
    BlockSyncError(BlockSyncError),
    /// The block of a confirmed anchor is not stored locally.
    MissingBlock { commitment: L1Commitment },
    /// A peer returned an origin block that differs from the local one.
    ForeignOrigin { commitment: L1Commitment },
}

impl Display for StateManagerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StateManagerError::StoreError(err) => Display::fmt(err, f),
            StateManagerError::BlockSyncError(err) => Display::fmt(err, f),
            StateManagerError::MissingBlock { commitment } => write!(f, "block {} is not stored", commitment),
            StateManagerError::ForeignOrigin { commitment } => {
                write!(f, "block {} is the origin of another chain", commitment)
            }
        }
    }
}

impl From<StoreError> for StateManagerError {
    fn from(value: StoreError) -> Self {
        StateManagerError::StoreError(value)
    }
}

impl From<BlockSyncError> for StateManagerError {
    fn from(value: BlockSyncError) -> Self {
        StateManagerError::BlockSyncError(value)
    }
}
