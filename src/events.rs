/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events emitted by a chain, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Handlers for each event
//! type are registered through [`ChainSpec`](crate::chain::ChainSpec) and fired on the event bus
//! thread, in the order in which the events were published.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::cons::AbortReason;
use crate::types::{
    anchor::{L1Commitment, OutputID, TransactionID},
    data_types::{CryptoHash, GasUnits, LogIndex, StateIndex, Timestamp},
    request::{RequestID, RequestRef},
};

pub enum Event {
    // Events that change persistent state.
    CommitBlock(CommitBlockEvent),
    PruneBlock(PruneBlockEvent),
    // Consensus instance events.
    StartConsensus(StartConsensusEvent),
    ProposeBatch(ProposeBatchEvent),
    DecideBatch(DecideBatchEvent),
    ConsensusDone(ConsensusDoneEvent),
    ConsensusSkipped(ConsensusSkippedEvent),
    ConsensusAborted(ConsensusAbortedEvent),
    // Committee log events.
    AnchorConfirmed(AnchorConfirmedEvent),
    Reorg(ReorgEvent),
    // Mempool events.
    AddRequest(AddRequestEvent),
    RemoveRequests(RemoveRequestsEvent),
    // Block sync events.
    StartSync(StartSyncEvent),
    EndSync(EndSyncEvent),
}

impl Event {
    /// Send `event` to the event bus, if one is running. An event bus that has already shut down is
    /// ignored.
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(event);
        }
    }
}

pub struct CommitBlockEvent {
    pub timestamp: SystemTime,
    pub block: L1Commitment,
    pub state_index: StateIndex,
}

pub struct PruneBlockEvent {
    pub timestamp: SystemTime,
    /// Trie root of the pruned block.
    pub block: CryptoHash,
    pub state_index: StateIndex,
}

pub struct StartConsensusEvent {
    pub timestamp: SystemTime,
    pub log_index: LogIndex,
    pub base_alias_output: OutputID,
}

pub struct ProposeBatchEvent {
    pub timestamp: SystemTime,
    pub log_index: LogIndex,
    pub request_count: usize,
}

pub struct DecideBatchEvent {
    pub timestamp: SystemTime,
    pub log_index: LogIndex,
    pub base_alias_output: OutputID,
    pub request_count: usize,
    pub aggregated_time: Timestamp,
}

pub struct ConsensusDoneEvent {
    pub timestamp: SystemTime,
    pub log_index: LogIndex,
    pub block: L1Commitment,
    pub transaction: TransactionID,
    pub request_count: usize,
    pub gas_burned: GasUnits,
}

pub struct ConsensusSkippedEvent {
    pub timestamp: SystemTime,
    pub log_index: LogIndex,
}

pub struct ConsensusAbortedEvent {
    pub timestamp: SystemTime,
    pub log_index: LogIndex,
    pub reason: AbortReason,
}

pub struct AnchorConfirmedEvent {
    pub timestamp: SystemTime,
    pub alias_output: OutputID,
    pub state_index: StateIndex,
}

/// The confirmed anchor did not build on the anchor previously assumed to be the tip.
pub struct ReorgEvent {
    pub timestamp: SystemTime,
    pub previous_tip: Option<OutputID>,
    pub new_tip: OutputID,
    pub state_index: StateIndex,
}

pub struct AddRequestEvent {
    pub timestamp: SystemTime,
    pub request: RequestRef,
}

pub struct RemoveRequestsEvent {
    pub timestamp: SystemTime,
    pub requests: Vec<RequestID>,
}

pub struct StartSyncEvent {
    pub timestamp: SystemTime,
    pub target: L1Commitment,
    pub state_index: StateIndex,
}

pub struct EndSyncEvent {
    pub timestamp: SystemTime,
    pub target: L1Commitment,
    pub blocks_synced: u64,
}
