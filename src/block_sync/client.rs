/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Implements the [BlockSyncClient], which fetches single blocks by commitment from committee peers.

use std::{
    fmt::{self, Display, Formatter},
    sync::mpsc::{Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;

use crate::networking::{Network, SenderHandle};
use crate::state::block::Block;
use crate::types::{
    anchor::L1Commitment,
    data_types::{ChainID, NodeID},
};

use super::messages::{BlockResponse, BlockSyncMessage};

pub(crate) struct BlockSyncClient<N: Network> {
    chain_id: ChainID,
    peers: Vec<NodeID>,
    sender: SenderHandle<N>,
    responses: Receiver<(NodeID, BlockResponse)>,
    response_timeout: Duration,
}

impl<N: Network> BlockSyncClient<N> {
    pub(crate) fn new(
        chain_id: ChainID,
        peers: Vec<NodeID>,
        network: N,
        responses: Receiver<(NodeID, BlockResponse)>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            chain_id,
            peers,
            sender: SenderHandle::new(network),
            responses,
            response_timeout,
        }
    }

    /// Fetch the block identified by `commitment`, asking peers in random order until one of them returns
    /// a block that matches the commitment.
    pub(crate) fn fetch(&mut self, commitment: &L1Commitment) -> Result<Block, BlockSyncError> {
        let mut peers = self.peers.clone();
        peers.shuffle(&mut rand::thread_rng());

        for peer in peers {
            self.sender
                .send(&peer, BlockSyncMessage::block_request(self.chain_id, *commitment));
            match self.recv_response(&peer, commitment, Instant::now() + self.response_timeout) {
                Some(block) if block.l1_commitment() == *commitment => return Ok(block),
                Some(_) => log::warn!("BlockSyncClient: {} sent a block that does not match {}", peer, commitment),
                None => log::debug!("BlockSyncClient: {} did not provide {}", peer, commitment),
            }
        }

        Err(BlockSyncError::Unavailable { commitment: *commitment })
    }

    fn recv_response(&self, peer: &NodeID, commitment: &L1Commitment, deadline: Instant) -> Option<Block> {
        while Instant::now() < deadline {
            match self.responses.recv_timeout(deadline - Instant::now()) {
                Ok((sender, response)) => {
                    if sender == *peer && response.chain_id == self.chain_id && response.commitment == *commitment {
                        return response.block;
                    }
                }
                Err(RecvTimeoutError::Timeout) => thread::yield_now(),

                // Safety: the driver thread (the only caller of this function) shuts down before the poller thread (the
                // sender side of this channel), so we will never be disconnected at this point.
                Err(RecvTimeoutError::Disconnected) => panic!(),
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSyncError {
    /// No peer provided the block in time.
    Unavailable { commitment: L1Commitment },
}

impl Display for BlockSyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockSyncError::Unavailable { commitment } => write!(f, "no peer provided block {}", commitment),
        }
    }
}
