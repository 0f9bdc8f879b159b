/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/
//! Defines the [WriteBatch] trait implemented by the user's key-value store, and the
//! [StoreWriteBatch] wrapper through which the [Store](super::store::Store) stages its writes.

use borsh::BorshSerialize;

use crate::types::{
    anchor::L1Commitment,
    data_types::{CryptoHash, StateIndex},
};

use super::block::Block;
use super::kv_store::Key;
use super::paths::{self, combine};
use super::trie::TrieNode;

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

pub struct StoreWriteBatch<W: WriteBatch>(pub(super) W);

impl<W: WriteBatch> StoreWriteBatch<W> {
    pub(crate) fn new() -> StoreWriteBatch<W> {
        StoreWriteBatch(W::new())
    }

    /* ↓↓↓ Blocks ↓↓↓  */

    pub fn set_block(&mut self, block: &Block) -> Result<(), KVSetError> {
        self.0.set(
            &combine(&paths::BLOCKS, &block.trie_root.bytes()),
            &block.try_to_vec().map_err(|err| KVSetError::SerializeValueError {
                key: Key::Block { trie_root: block.trie_root },
                source: err,
            })?,
        );
        Ok(())
    }

    pub fn delete_block(&mut self, trie_root: &CryptoHash) {
        self.0.delete(&combine(&paths::BLOCKS, &trie_root.bytes()));
    }

    /* ↓↓↓ Block to Children ↓↓↓ */

    pub fn set_block_children(
        &mut self,
        trie_root: &CryptoHash,
        children: &Vec<CryptoHash>,
    ) -> Result<(), KVSetError> {
        self.0.set(
            &combine(&paths::BLOCK_TO_CHILDREN, &trie_root.bytes()),
            &children.try_to_vec().map_err(|err| KVSetError::SerializeValueError {
                key: Key::BlockChildren { trie_root: *trie_root },
                source: err,
            })?,
        );
        Ok(())
    }

    pub fn delete_block_children(&mut self, trie_root: &CryptoHash) {
        self.0.delete(&combine(&paths::BLOCK_TO_CHILDREN, &trie_root.bytes()));
    }

    /* ↓↓↓ Trie ↓↓↓ */

    pub fn set_trie_node(&mut self, hash: &CryptoHash, node: &TrieNode) -> Result<(), KVSetError> {
        self.0.set(
            &combine(&paths::TRIE_NODES, &hash.bytes()),
            &node.try_to_vec().map_err(|err| KVSetError::SerializeValueError {
                key: Key::TrieNode { node: *hash },
                source: err,
            })?,
        );
        Ok(())
    }

    pub fn delete_trie_node(&mut self, hash: &CryptoHash) {
        self.0.delete(&combine(&paths::TRIE_NODES, &hash.bytes()));
    }

    pub fn set_trie_refcount(&mut self, hash: &CryptoHash, refcount: u32) {
        let key = combine(&paths::TRIE_REFCOUNTS, &hash.bytes());
        if refcount == 0 {
            self.0.delete(&key)
        } else {
            self.0.set(&key, &refcount.to_le_bytes())
        }
    }

    /* ↓↓↓ Latest Block ↓↓↓ */

    pub fn set_latest_block(&mut self, commitment: &L1Commitment) -> Result<(), KVSetError> {
        self.0.set(
            &paths::LATEST_BLOCK,
            &commitment.try_to_vec().map_err(|err| KVSetError::SerializeValueError {
                key: Key::LatestBlock,
                source: err,
            })?,
        );
        Ok(())
    }

    /* ↓↓↓ Origin Block ↓↓↓ */

    pub fn set_origin_block(&mut self, commitment: &L1Commitment) -> Result<(), KVSetError> {
        self.0.set(
            &paths::ORIGIN_BLOCK,
            &commitment.try_to_vec().map_err(|err| KVSetError::SerializeValueError {
                key: Key::OriginBlock,
                source: err,
            })?,
        );
        Ok(())
    }

    /* ↓↓↓ Largest Pruned Block Index ↓↓↓ */

    pub fn set_largest_pruned_block_index(&mut self, index: StateIndex) -> Result<(), KVSetError> {
        self.0.set(
            &paths::LARGEST_PRUNED_BLOCK_INDEX,
            &index.try_to_vec().map_err(|err| KVSetError::SerializeValueError {
                key: Key::LargestPrunedBlockIndex,
                source: err,
            })?,
        );
        Ok(())
    }
}

/// Error when trying to serialize a value to be stored under a given key.
#[derive(Debug)]
pub enum KVSetError {
    SerializeValueError { key: Key, source: std::io::Error },
}
