/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the messages that mempool actors of committee members exchange.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    data_types::ChainID,
    request::{Request, RequestRef},
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum MempoolMessage {
    /// Off-ledger requests submitted to the sender, shared so that every member can propose them.
    ShareRequests { chain_id: ChainID, requests: Vec<Request> },
    /// A query for the payloads of decided requests that the sender does not have.
    RequestQuery { chain_id: ChainID, refs: Vec<RequestRef> },
    /// The answer to a [`RequestQuery`](MempoolMessage::RequestQuery).
    RequestPayloads { chain_id: ChainID, requests: Vec<Request> },
}

impl MempoolMessage {
    pub fn chain_id(&self) -> ChainID {
        match self {
            MempoolMessage::ShareRequests { chain_id, .. } => *chain_id,
            MempoolMessage::RequestQuery { chain_id, .. } => *chain_id,
            MempoolMessage::RequestPayloads { chain_id, .. } => *chain_id,
        }
    }
}
