/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The persistent state of a chain node.
//!
//! The user supplies an ordered byte-keyed store through the [`KVStore`](kv_store::KVStore) trait. On
//! top of it, the [`Store`](store::Store) keeps an authenticated [trie](trie) of the chain state and
//! the [blocks](block::Block) that produced each version of it.

pub mod block;

pub mod kv_store;

pub mod paths;

pub mod state_view;

pub mod store;

pub mod trie;

pub mod write_batch;

pub use block::Block;
pub use kv_store::{KVGet, KVStore};
pub use state_view::{State, StateDraft, StateReader};
pub use store::{Store, StoreError};
pub use write_batch::WriteBatch;
