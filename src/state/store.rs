/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Store`]: persisted blocks, keyed by the trie root of the state they produce, on top of the
//! authenticated [trie](super::trie).
//!
//! Blocks form a tree rooted at the origin block. Each block records the commitment of its parent, and
//! the store keeps the inverse mapping (parent to children) so that branches can be walked in both
//! directions when pruning.

use std::cmp::max;
use std::fmt::{self, Display, Formatter};

use crate::types::{
    anchor::L1Commitment,
    data_types::{CryptoHash, StateIndex, Timestamp},
    update_sets::StateMutations,
};

use super::block::Block;
use super::kv_store::{KVGetError, KVStore};
use super::state_view::{State, StateDraft};
use super::trie::{self, TrieError, TrieUpdate, EMPTY_TRIE_ROOT};
use super::write_batch::{KVSetError, StoreWriteBatch};

pub struct Store<K: KVStore>(K);

impl<K: KVStore> Store<K> {
    /* ↓↓↓ Lifecycle methods ↓↓↓ */

    pub fn new(kv_store: K) -> Self {
        Self(kv_store)
    }

    /// Create the origin block from `initial_state`. Calling this on an initialized store returns the
    /// existing origin block and leaves the store unchanged.
    pub fn initialize(&mut self, initial_state: StateMutations) -> Result<Block, StoreError> {
        if let Some(origin) = self.0.origin_block()? {
            return self.block_by_trie_root(&origin.trie_root);
        }

        let mut draft = StateDraft::new(
            State::new(self.0.clone(), EMPTY_TRIE_ROOT),
            None,
            StateIndex::new(0),
            Timestamp::default(),
        );
        draft.apply(initial_state);
        let block = self.commit(draft)?;

        let mut wb = StoreWriteBatch::new();
        wb.set_origin_block(&block.l1_commitment())?;
        wb.set_latest_block(&block.l1_commitment())?;
        self.write(wb);

        Ok(block)
    }

    pub fn is_initialized(&self) -> Result<bool, StoreError> {
        Ok(self.0.origin_block()?.is_some())
    }

    /* ↓↓↓ Drafts and commits ↓↓↓ */

    /// Start a draft of the block that follows the block identified by `base`.
    pub fn new_state_draft(
        &self,
        timestamp: Timestamp,
        base: &L1Commitment,
    ) -> Result<StateDraft<K>, StoreError> {
        let base_block = self.block_by_trie_root(&base.trie_root)?;
        if base_block.hash() != base.block_hash {
            return Err(StoreError::BaseMismatch { base: *base });
        }
        let state_index = base_block
            .state_index
            .next()
            .ok_or(StoreError::StateIndexOverflow)?;
        Ok(StateDraft::new(
            State::new(self.0.clone(), base.trie_root),
            Some(*base),
            state_index,
            timestamp,
        ))
    }

    /// Compute the block that committing `draft` would produce, without persisting anything.
    pub fn extract_block(&self, draft: &StateDraft<K>) -> Result<Block, StoreError> {
        let mut update = TrieUpdate::new(&self.0, &draft.base_trie_root());
        update.apply(draft.mutations())?;
        Ok(Block {
            state_index: draft.state_index(),
            timestamp: draft.draft_timestamp(),
            previous_l1_commitment: draft.base_l1_commitment(),
            mutations: draft.mutations().clone(),
            trie_root: update.root(),
        })
    }

    /// Persist the block produced by `draft`.
    ///
    /// Committing is deterministic and idempotent: the same draft on top of the same base always yields
    /// the same block, and committing a block that already exists returns the existing block.
    pub fn commit(&mut self, draft: StateDraft<K>) -> Result<Block, StoreError> {
        let (base, previous_l1_commitment, state_index, timestamp, mutations) = draft.into_parts();
        let mut update = TrieUpdate::new(&self.0, &base.trie_root());
        update.apply(&mutations)?;

        let block = Block {
            state_index,
            timestamp,
            previous_l1_commitment,
            mutations,
            trie_root: update.root(),
        };
        if let Some(existing) = self.0.block(&block.trie_root)? {
            return if existing.hash() == block.hash() {
                Ok(existing)
            } else {
                Err(StoreError::BlockConflict { trie_root: block.trie_root })
            };
        }

        let writes = update.into_writes()?;
        let mut wb = StoreWriteBatch::new();
        for (hash, node) in &writes.new_nodes {
            wb.set_trie_node(hash, node)?;
        }
        for (hash, increment) in &writes.refcount_increments {
            wb.set_trie_refcount(hash, self.0.trie_refcount(hash)? + increment);
        }
        wb.set_block(&block)?;
        if let Some(parent) = &block.previous_l1_commitment {
            let mut siblings = self.0.block_children(&parent.trie_root)?;
            if !siblings.contains(&block.trie_root) {
                siblings.push(block.trie_root);
            }
            wb.set_block_children(&parent.trie_root, &siblings)?;
        }
        self.write(wb);

        Ok(block)
    }

    /// Persist a block received from a peer. The block's parent must be stored locally, and replaying
    /// the block's mutations on the parent's state must reproduce the block's trie root.
    pub fn commit_block(&mut self, block: &Block) -> Result<(), StoreError> {
        let base = block
            .previous_l1_commitment
            .ok_or(StoreError::InvalidBlock { trie_root: block.trie_root })?;
        let mut draft = self.new_state_draft(block.timestamp, &base)?;
        if draft.state_index() != block.state_index {
            return Err(StoreError::InvalidBlock { trie_root: block.trie_root });
        }
        draft.apply(block.mutations.clone());
        if self.extract_block(&draft)? != *block {
            return Err(StoreError::InvalidBlock { trie_root: block.trie_root });
        }
        self.commit(draft)?;
        Ok(())
    }

    /* ↓↓↓ Getters ↓↓↓ */

    pub fn block_by_trie_root(&self, trie_root: &CryptoHash) -> Result<Block, StoreError> {
        self.0.block(trie_root)?.ok_or(StoreError::NotFound { trie_root: *trie_root })
    }

    pub fn has_trie_root(&self, trie_root: &CryptoHash) -> Result<bool, StoreError> {
        Ok(self.0.block(trie_root)?.is_some())
    }

    /// Whether the block identified by `commitment` (trie root and block hash) is stored.
    pub fn has_block(&self, commitment: &L1Commitment) -> Result<bool, StoreError> {
        Ok(match self.0.block(&commitment.trie_root)? {
            Some(block) => block.hash() == commitment.block_hash,
            None => false,
        })
    }

    pub fn state_by_trie_root(&self, trie_root: &CryptoHash) -> Result<State<K>, StoreError> {
        if !self.has_trie_root(trie_root)? {
            return Err(StoreError::NotFound { trie_root: *trie_root });
        }
        Ok(State::new(self.0.clone(), *trie_root))
    }

    pub fn origin_block(&self) -> Result<Block, StoreError> {
        let origin = self.0.origin_block()?.ok_or(StoreError::NotInitialized)?;
        self.block_by_trie_root(&origin.trie_root)
    }

    pub fn latest_block(&self) -> Result<Block, StoreError> {
        let latest = self.0.latest_block()?.ok_or(StoreError::NotInitialized)?;
        self.block_by_trie_root(&latest.trie_root)
    }

    pub fn latest_state(&self) -> Result<State<K>, StoreError> {
        let latest = self.0.latest_block()?.ok_or(StoreError::NotInitialized)?;
        self.state_by_trie_root(&latest.trie_root)
    }

    pub fn set_latest(&mut self, commitment: &L1Commitment) -> Result<(), StoreError> {
        if !self.has_block(commitment)? {
            return Err(StoreError::NotFound { trie_root: commitment.trie_root });
        }
        let mut wb = StoreWriteBatch::new();
        wb.set_latest_block(commitment)?;
        self.write(wb);
        Ok(())
    }

    pub fn children(&self, trie_root: &CryptoHash) -> Result<Vec<CryptoHash>, StoreError> {
        Ok(self.0.block_children(trie_root)?)
    }

    pub fn largest_pruned_block_index(&self) -> Result<Option<StateIndex>, StoreError> {
        Ok(self.0.largest_pruned_block_index()?)
    }

    /* ↓↓↓ Pruning ↓↓↓ */

    /// Delete the block with trie root `trie_root`, and every trie node that no other stored block
    /// references. The block's state index is recorded as pruned.
    pub fn prune(&mut self, trie_root: &CryptoHash) -> Result<PruneStats, StoreError> {
        self.delete_block(trie_root, true)
    }

    /// Like [`prune`](Self::prune), but for a block on a branch that was abandoned. The largest pruned
    /// block index is left unchanged.
    pub fn delete_abandoned(&mut self, trie_root: &CryptoHash) -> Result<PruneStats, StoreError> {
        self.delete_block(trie_root, false)
    }

    fn delete_block(&mut self, trie_root: &CryptoHash, record_pruned: bool) -> Result<PruneStats, StoreError> {
        let block = self.block_by_trie_root(trie_root)?;
        let releases = trie::release(&self.0, trie_root)?;

        let mut wb = StoreWriteBatch::new();
        for (hash, refcount) in &releases.refcounts {
            wb.set_trie_refcount(hash, *refcount);
        }
        for hash in &releases.deleted_nodes {
            wb.delete_trie_node(hash);
        }
        wb.delete_block(trie_root);
        wb.delete_block_children(trie_root);
        if let Some(parent) = block
            .previous_l1_commitment
            .filter(|parent| matches!(self.0.block(&parent.trie_root), Ok(Some(_))))
        {
            let siblings: Vec<CryptoHash> = self
                .0
                .block_children(&parent.trie_root)?
                .into_iter()
                .filter(|sibling| sibling != trie_root)
                .collect();
            wb.set_block_children(&parent.trie_root, &siblings)?;
        }
        if record_pruned {
            let largest_pruned = match self.0.largest_pruned_block_index()? {
                Some(index) => max(index, block.state_index),
                None => block.state_index,
            };
            wb.set_largest_pruned_block_index(largest_pruned)?;
        }
        self.write(wb);

        Ok(PruneStats {
            state_index: block.state_index,
            nodes_deleted: releases.deleted_nodes.len(),
        })
    }

    /* ↓↓↓ Helpers ↓↓↓ */

    fn write(&mut self, wb: StoreWriteBatch<K::WriteBatch>) {
        self.0.write(wb.0)
    }
}

impl<K: KVStore> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Result of pruning one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PruneStats {
    pub state_index: StateIndex,
    pub nodes_deleted: usize,
}

#[derive(Debug)]
pub enum StoreError {
    /// The block was pruned, or never existed.
    NotFound { trie_root: CryptoHash },
    /// A block exists under the trie root, but its hash differs from the commitment's block hash.
    BaseMismatch { base: L1Commitment },
    /// A different block with the same trie root is already stored.
    BlockConflict { trie_root: CryptoHash },
    /// A block received from a peer does not replay to its declared trie root.
    InvalidBlock { trie_root: CryptoHash },
    StateIndexOverflow,
    NotInitialized,
    TrieError(TrieError),
    KVGetError(KVGetError),
    KVSetError(KVSetError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { trie_root } => write!(f, "block with trie root {} not found", trie_root),
            StoreError::BaseMismatch { base } => write!(f, "stored block does not match commitment {}", base),
            StoreError::BlockConflict { trie_root } => {
                write!(f, "a different block with trie root {} already exists", trie_root)
            }
            StoreError::InvalidBlock { trie_root } => write!(f, "block {} does not replay", trie_root),
            StoreError::StateIndexOverflow => write!(f, "state index overflow"),
            StoreError::NotInitialized => write!(f, "store not initialized"),
            StoreError::TrieError(err) => write!(f, "trie error: {:?}", err),
            StoreError::KVGetError(err) => write!(f, "read error: {:?}", err),
            StoreError::KVSetError(err) => write!(f, "write error: {:?}", err),
        }
    }
}

impl From<TrieError> for StoreError {
    fn from(value: TrieError) -> Self {
        StoreError::TrieError(value)
    }
}

impl From<KVGetError> for StoreError {
    fn from(value: KVGetError) -> Self {
        StoreError::KVGetError(value)
    }
}

impl From<KVSetError> for StoreError {
    fn from(value: KVSetError) -> Self {
        StoreError::KVSetError(value)
    }
}
