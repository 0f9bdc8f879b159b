/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between committee members as part of the block
//! sync protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::state::block::Block;
use crate::types::{anchor::L1Commitment, data_types::ChainID};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum BlockSyncMessage {
    Request(BlockRequest),
    Response(BlockResponse),
}

impl BlockSyncMessage {
    pub fn block_request(chain_id: ChainID, commitment: L1Commitment) -> BlockSyncMessage {
        BlockSyncMessage::Request(BlockRequest { chain_id, commitment })
    }

    pub fn block_response(chain_id: ChainID, commitment: L1Commitment, block: Option<Block>) -> BlockSyncMessage {
        BlockSyncMessage::Response(BlockResponse { chain_id, commitment, block })
    }
}

/// Ask a peer for the block identified by `commitment`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockRequest {
    pub chain_id: ChainID,
    pub commitment: L1Commitment,
}

/// The block identified by `commitment`, or `None` if the responder does not have it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockResponse {
    pub chain_id: ChainID,
    pub commitment: L1Commitment,
    pub block: Option<Block>,
}
