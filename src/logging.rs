/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the chain's
//! [configuration](crate::chain::Configuration).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [DecideBatch](crate::events::DecideBatchEvent) is printed:
//!
//! ```text
//! DecideBatch, 1701329264, 12.0, Id5u7f6, 3, 1701329263950114000
//! ```
//!
//! In the snippet:
//! - The third value is the log index of the consensus instance.
//! - The fourth value is the first seven characters of the Base64 encoding of the output ID of the
//!   decided base anchor.
//! - The fifth value is the number of decided requests.
//! - The sixth value is the aggregated batch time, in nanoseconds since the Unix Epoch.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const COMMIT_BLOCK: &str = "CommitBlock";
pub const PRUNE_BLOCK: &str = "PruneBlock";

pub const START_CONSENSUS: &str = "StartConsensus";
pub const PROPOSE_BATCH: &str = "ProposeBatch";
pub const DECIDE_BATCH: &str = "DecideBatch";
pub const CONSENSUS_DONE: &str = "ConsensusDone";
pub const CONSENSUS_SKIPPED: &str = "ConsensusSkipped";
pub const CONSENSUS_ABORTED: &str = "ConsensusAborted";

pub const ANCHOR_CONFIRMED: &str = "AnchorConfirmed";
pub const REORG: &str = "Reorg";

pub const ADD_REQUEST: &str = "AddRequest";
pub const REMOVE_REQUESTS: &str = "RemoveRequests";

pub const START_SYNC: &str = "StartSync";
pub const END_SYNC: &str = "EndSync";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for CommitBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_block_event: &CommitBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMMIT_BLOCK,
                secs_since_unix_epoch(commit_block_event.timestamp),
                first_seven_base64_chars(&commit_block_event.block.trie_root.bytes()),
                commit_block_event.state_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for PruneBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prune_block_event: &PruneBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                PRUNE_BLOCK,
                secs_since_unix_epoch(prune_block_event.timestamp),
                first_seven_base64_chars(&prune_block_event.block.bytes()),
                prune_block_event.state_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartConsensusEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_consensus_event: &StartConsensusEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_CONSENSUS,
                secs_since_unix_epoch(start_consensus_event.timestamp),
                start_consensus_event.log_index,
                first_seven_base64_chars(&start_consensus_event.base_alias_output.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeBatchEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_batch_event: &ProposeBatchEvent| {
            log::info!(
                "{}, {}, {}, {}",
                PROPOSE_BATCH,
                secs_since_unix_epoch(propose_batch_event.timestamp),
                propose_batch_event.log_index,
                propose_batch_event.request_count
            )
        };
        Box::new(logger)
    }
}

impl Logger for DecideBatchEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |decide_batch_event: &DecideBatchEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                DECIDE_BATCH,
                secs_since_unix_epoch(decide_batch_event.timestamp),
                decide_batch_event.log_index,
                first_seven_base64_chars(&decide_batch_event.base_alias_output.bytes()),
                decide_batch_event.request_count,
                decide_batch_event.aggregated_time
            )
        };
        Box::new(logger)
    }
}

impl Logger for ConsensusDoneEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |consensus_done_event: &ConsensusDoneEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                CONSENSUS_DONE,
                secs_since_unix_epoch(consensus_done_event.timestamp),
                consensus_done_event.log_index,
                first_seven_base64_chars(&consensus_done_event.block.trie_root.bytes()),
                first_seven_base64_chars(&consensus_done_event.transaction.0.bytes()),
                consensus_done_event.request_count,
                consensus_done_event.gas_burned.int()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ConsensusSkippedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |consensus_skipped_event: &ConsensusSkippedEvent| {
            log::info!(
                "{}, {}, {}",
                CONSENSUS_SKIPPED,
                secs_since_unix_epoch(consensus_skipped_event.timestamp),
                consensus_skipped_event.log_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for ConsensusAbortedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |consensus_aborted_event: &ConsensusAbortedEvent| {
            let line = format!(
                "{}, {}, {}, {}",
                CONSENSUS_ABORTED,
                secs_since_unix_epoch(consensus_aborted_event.timestamp),
                consensus_aborted_event.log_index,
                consensus_aborted_event.reason
            );
            if consensus_aborted_event.reason.is_fatal() {
                log::error!("{}", line)
            } else {
                log::info!("{}", line)
            }
        };
        Box::new(logger)
    }
}

impl Logger for AnchorConfirmedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |anchor_confirmed_event: &AnchorConfirmedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ANCHOR_CONFIRMED,
                secs_since_unix_epoch(anchor_confirmed_event.timestamp),
                first_seven_base64_chars(&anchor_confirmed_event.alias_output.bytes()),
                anchor_confirmed_event.state_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReorgEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reorg_event: &ReorgEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                REORG,
                secs_since_unix_epoch(reorg_event.timestamp),
                match &reorg_event.previous_tip {
                    Some(previous_tip) => first_seven_base64_chars(&previous_tip.bytes()),
                    None => String::from("None"),
                },
                first_seven_base64_chars(&reorg_event.new_tip.bytes()),
                reorg_event.state_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for AddRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |add_request_event: &AddRequestEvent| {
            log::info!(
                "{}, {}, {}",
                ADD_REQUEST,
                secs_since_unix_epoch(add_request_event.timestamp),
                first_seven_base64_chars(&add_request_event.request.id.0.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for RemoveRequestsEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |remove_requests_event: &RemoveRequestsEvent| {
            log::info!(
                "{}, {}, {}",
                REMOVE_REQUESTS,
                secs_since_unix_epoch(remove_requests_event.timestamp),
                remove_requests_event.requests.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_sync_event: &StartSyncEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_SYNC,
                secs_since_unix_epoch(start_sync_event.timestamp),
                first_seven_base64_chars(&start_sync_event.target.trie_root.bytes()),
                start_sync_event.state_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for EndSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |end_sync_event: &EndSyncEvent| {
            log::info!(
                "{}, {}, {}, {}",
                END_SYNC,
                secs_since_unix_epoch(end_sync_event.timestamp),
                first_seven_base64_chars(&end_sync_event.target.trie_root.bytes()),
                end_sync_event.blocks_synced
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
