/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/
//! Defines the [KVStore] trait, which specifies the required interface for the key-value store provided
//! by the user.
//!
//! Given a method to obtain the value for a given key in bytes, this module also provides methods to
//! obtain the variables stored in the key-value store, as described in [crate::state::paths].

use std::fmt::Display;

use borsh::BorshDeserialize;

use crate::types::{
    anchor::L1Commitment,
    data_types::{CryptoHash, StateIndex},
};

use super::block::Block;
use super::paths::{self, combine};
use super::trie::TrieNode;
use super::write_batch::WriteBatch;

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;
    type Snapshot<'a>: 'a + KVGet;

    fn write(&mut self, wb: Self::WriteBatch);
    fn clear(&mut self);
    fn snapshot<'b>(&'b self) -> Self::Snapshot<'_>;
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ Blocks ↓↓↓  */

    fn block(&self, trie_root: &CryptoHash) -> Result<Option<Block>, KVGetError> {
        if let Some(bytes) = self.get(&combine(&paths::BLOCKS, &trie_root.bytes())) {
            Ok(Some(
                Block::deserialize(&mut bytes.as_slice()).map_err(|err| {
                    KVGetError::DeserializeValueError {
                        key: Key::Block { trie_root: *trie_root },
                        source: err,
                    }
                })?,
            ))
        } else {
            Ok(None)
        }
    }

    /* ↓↓↓ Block to Children ↓↓↓ */

    fn block_children(&self, trie_root: &CryptoHash) -> Result<Vec<CryptoHash>, KVGetError> {
        match self.get(&combine(&paths::BLOCK_TO_CHILDREN, &trie_root.bytes())) {
            None => Ok(Vec::new()),
            Some(bytes) => Vec::<CryptoHash>::deserialize(&mut &*bytes).map_err(|err| {
                KVGetError::DeserializeValueError {
                    key: Key::BlockChildren { trie_root: *trie_root },
                    source: err,
                }
            }),
        }
    }

    /* ↓↓↓ Trie ↓↓↓ */

    fn trie_node(&self, node: &CryptoHash) -> Result<Option<TrieNode>, KVGetError> {
        if let Some(bytes) = self.get(&combine(&paths::TRIE_NODES, &node.bytes())) {
            Ok(Some(TrieNode::deserialize(&mut &*bytes).map_err(|err| {
                KVGetError::DeserializeValueError {
                    key: Key::TrieNode { node: *node },
                    source: err,
                }
            })?))
        } else {
            Ok(None)
        }
    }

    fn trie_refcount(&self, node: &CryptoHash) -> Result<u32, KVGetError> {
        match self.get(&combine(&paths::TRIE_REFCOUNTS, &node.bytes())) {
            None => Ok(0),
            Some(bytes) => u32::deserialize(&mut &*bytes).map_err(|err| {
                KVGetError::DeserializeValueError {
                    key: Key::TrieRefcount { node: *node },
                    source: err,
                }
            }),
        }
    }

    /* ↓↓↓ Latest Block ↓↓↓ */

    fn latest_block(&self) -> Result<Option<L1Commitment>, KVGetError> {
        if let Some(bytes) = self.get(&paths::LATEST_BLOCK) {
            let latest_block = L1Commitment::deserialize(&mut &*bytes).map_err(|err| {
                KVGetError::DeserializeValueError { key: Key::LatestBlock, source: err }
            })?;
            Ok(Some(latest_block))
        } else {
            Ok(None)
        }
    }

    /* ↓↓↓ Origin Block ↓↓↓ */

    fn origin_block(&self) -> Result<Option<L1Commitment>, KVGetError> {
        if let Some(bytes) = self.get(&paths::ORIGIN_BLOCK) {
            let origin_block = L1Commitment::deserialize(&mut &*bytes).map_err(|err| {
                KVGetError::DeserializeValueError { key: Key::OriginBlock, source: err }
            })?;
            Ok(Some(origin_block))
        } else {
            Ok(None)
        }
    }

    /* ↓↓↓ Largest Pruned Block Index ↓↓↓ */

    fn largest_pruned_block_index(&self) -> Result<Option<StateIndex>, KVGetError> {
        if let Some(bytes) = self.get(&paths::LARGEST_PRUNED_BLOCK_INDEX) {
            let index = StateIndex::deserialize(&mut &*bytes).map_err(|err| {
                KVGetError::DeserializeValueError {
                    key: Key::LargestPrunedBlockIndex,
                    source: err,
                }
            })?;
            Ok(Some(index))
        } else {
            Ok(None)
        }
    }
}

/// Error when trying to read a value corresponding to a given key from the [key value store][KVStore].
/// The error may arise in the following circumstances:
/// 1. The value corresponding to a given key cannot be deserialized into its expected type,
/// 2. The value corresponding to a given key cannot be found.
#[derive(Debug)]
pub enum KVGetError {
    DeserializeValueError { key: Key, source: std::io::Error },
    ValueNotFound { key: Key },
}

#[derive(Debug)]
pub enum Key {
    Block { trie_root: CryptoHash },
    BlockChildren { trie_root: CryptoHash },
    TrieNode { node: CryptoHash },
    TrieRefcount { node: CryptoHash },
    LatestBlock,
    OriginBlock,
    LargestPrunedBlockIndex,
    StateValue { key: Vec<u8> },
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            &Key::Block { trie_root } => write!(f, "Block with trie root {}", trie_root),
            &Key::BlockChildren { trie_root } => {
                write!(f, "Block children for block with trie root {}", trie_root)
            }
            &Key::TrieNode { node } => write!(f, "Trie node {}", node),
            &Key::TrieRefcount { node } => write!(f, "Reference count of trie node {}", node),
            &Key::LatestBlock => write!(f, "Latest Block"),
            &Key::OriginBlock => write!(f, "Origin Block"),
            &Key::LargestPrunedBlockIndex => write!(f, "Largest Pruned Block Index"),
            &Key::StateValue { key } => write!(f, "State value for key {:?}", key),
        }
    }
}
