/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/
//! Byte-prefixes that specify where each [`Store`](super::store::Store) variable is kept in the
//! user-provided key-value store.
//!
//! # Storage of store variables
//!
//! Each variable is stored as a **Borsh-serialized value** under one or more **keys**. Keys are formed
//! by combining the constants defined in this module:
//!
//! ## Single values
//!
//! "Single values" (e.g., the latest block, the largest pruned block index) are stored in one-byte,
//! constant keys defined in constants sharing the variable's name.
//!
//! ## Mappings
//!
//! Mappings of the form "`A` -> `B`" are stored under keys that are the concatenation of a one-byte
//! prefix sharing the variable's name and the bytes of the `A` value:
//!
//! | Variable | Key | Value |
//! |----------|-----|-------|
//! | Blocks | `BLOCKS` + trie root | `Block` |
//! | Block children | `BLOCK_TO_CHILDREN` + trie root | `Vec<CryptoHash>` of child trie roots |
//! | Trie nodes | `TRIE_NODES` + node hash | `TrieNode` |
//! | Trie node reference counts | `TRIE_REFCOUNTS` + node hash | `u32` |
//!
//! # Reserved chain state keys
//!
//! The chain state itself (the contents of the trie) is partitioned by contract: every contract owns
//! the keys prefixed by its 4-byte [hname](crate::types::data_types::Hname). The reserved keys defined
//! at the bottom of this module are two bytes long, so they can never collide with a contract key.

// Store variables
pub const BLOCKS: [u8; 1] = [0];
pub const BLOCK_TO_CHILDREN: [u8; 1] = [1];
pub const TRIE_NODES: [u8; 1] = [2];
pub const TRIE_REFCOUNTS: [u8; 1] = [3];
pub const LATEST_BLOCK: [u8; 1] = [4];
pub const LARGEST_PRUNED_BLOCK_INDEX: [u8; 1] = [5];
pub const ORIGIN_BLOCK: [u8; 1] = [6];

// Reserved chain state keys
pub const STATE_BLOCK_INDEX: [u8; 2] = [0xff, 0];
pub const STATE_TIMESTAMP: [u8; 2] = [0xff, 1];
pub const STATE_PREVIOUS_L1_COMMITMENT: [u8; 2] = [0xff, 2];
pub const STATE_SCHEMA_VERSION: [u8; 2] = [0xff, 3];

/// Concatenate two byteslices into one vector.
pub fn combine(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}
