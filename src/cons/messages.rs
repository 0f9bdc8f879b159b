/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the messages that committee members exchange while running a consensus instance.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{ChainID, LogIndex};

use super::acs::AcsMessage;

/// A common subset message, tagged with the chain and the consensus instance it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ConsensusMessage {
    pub chain_id: ChainID,
    pub log_index: LogIndex,
    pub payload: AcsMessage,
}

impl ConsensusMessage {
    pub fn new(chain_id: ChainID, log_index: LogIndex, payload: AcsMessage) -> Self {
        Self { chain_id, log_index, payload }
    }
}
