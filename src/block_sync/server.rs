/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Implements the [BlockSyncServer], which answers the block requests of lagging peers from the local
//! [Store].

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread::{self, JoinHandle},
};

use crate::networking::{Network, SenderHandle};
use crate::state::{KVStore, Store, StoreError};
use crate::types::data_types::{ChainID, NodeID};

use super::messages::{BlockRequest, BlockSyncMessage};

pub(crate) struct BlockSyncServer<N: Network + 'static, K: KVStore> {
    chain_id: ChainID,
    store: Store<K>,
    requests: Receiver<(NodeID, BlockRequest)>,
    sender: SenderHandle<N>,
    shutdown_signal: Receiver<()>,
}

impl<N: Network + 'static, K: KVStore> BlockSyncServer<N, K> {
    pub(crate) fn new(
        chain_id: ChainID,
        store: Store<K>,
        requests: Receiver<(NodeID, BlockRequest)>,
        network: N,
        shutdown_signal: Receiver<()>,
    ) -> Self {
        Self {
            chain_id,
            store,
            requests,
            sender: SenderHandle::new(network),
            shutdown_signal,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Block sync server thread disconnected from main thread")
                }
            }

            match self.requests.try_recv() {
                Ok((origin, BlockRequest { chain_id, commitment })) => {
                    if chain_id != self.chain_id {
                        continue;
                    }
                    let block = match self.store.block_by_trie_root(&commitment.trie_root) {
                        Ok(block) if block.hash() == commitment.block_hash => Some(block),
                        Ok(_) | Err(StoreError::NotFound { .. }) => None,
                        Err(err) => {
                            log::warn!("BlockSyncServer: cannot read block {}: {}", commitment, err);
                            None
                        }
                    };
                    self.sender
                        .send(&origin, BlockSyncMessage::block_response(chain_id, commitment, block));
                }
                Err(TryRecvError::Empty) => thread::yield_now(),

                // Safety: the block sync server thread shuts down before the poller thread (the sender side
                // of this channel), so we will never be disconnected at this point.
                Err(TryRecvError::Disconnected) => panic!(),
            }
        })
    }
}
