/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which fires the registered handlers for each published [`Event`].

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) commit_block_handlers: Vec<HandlerPtr<CommitBlockEvent>>,
    pub(crate) prune_block_handlers: Vec<HandlerPtr<PruneBlockEvent>>,
    pub(crate) start_consensus_handlers: Vec<HandlerPtr<StartConsensusEvent>>,
    pub(crate) propose_batch_handlers: Vec<HandlerPtr<ProposeBatchEvent>>,
    pub(crate) decide_batch_handlers: Vec<HandlerPtr<DecideBatchEvent>>,
    pub(crate) consensus_done_handlers: Vec<HandlerPtr<ConsensusDoneEvent>>,
    pub(crate) consensus_skipped_handlers: Vec<HandlerPtr<ConsensusSkippedEvent>>,
    pub(crate) consensus_aborted_handlers: Vec<HandlerPtr<ConsensusAbortedEvent>>,
    pub(crate) anchor_confirmed_handlers: Vec<HandlerPtr<AnchorConfirmedEvent>>,
    pub(crate) reorg_handlers: Vec<HandlerPtr<ReorgEvent>>,
    pub(crate) add_request_handlers: Vec<HandlerPtr<AddRequestEvent>>,
    pub(crate) remove_requests_handlers: Vec<HandlerPtr<RemoveRequestsEvent>>,
    pub(crate) start_sync_handlers: Vec<HandlerPtr<StartSyncEvent>>,
    pub(crate) end_sync_handlers: Vec<HandlerPtr<EndSyncEvent>>,
}

impl EventHandlers {
    /// Collect the user-defined handlers, and the default logger of every event type if `log_events` is
    /// set.
    pub(crate) fn new(
        log_events: bool,
        commit_block_handler: Option<HandlerPtr<CommitBlockEvent>>,
        prune_block_handler: Option<HandlerPtr<PruneBlockEvent>>,
        start_consensus_handler: Option<HandlerPtr<StartConsensusEvent>>,
        propose_batch_handler: Option<HandlerPtr<ProposeBatchEvent>>,
        decide_batch_handler: Option<HandlerPtr<DecideBatchEvent>>,
        consensus_done_handler: Option<HandlerPtr<ConsensusDoneEvent>>,
        consensus_skipped_handler: Option<HandlerPtr<ConsensusSkippedEvent>>,
        consensus_aborted_handler: Option<HandlerPtr<ConsensusAbortedEvent>>,
        anchor_confirmed_handler: Option<HandlerPtr<AnchorConfirmedEvent>>,
        reorg_handler: Option<HandlerPtr<ReorgEvent>>,
        add_request_handler: Option<HandlerPtr<AddRequestEvent>>,
        remove_requests_handler: Option<HandlerPtr<RemoveRequestsEvent>>,
        start_sync_handler: Option<HandlerPtr<StartSyncEvent>>,
        end_sync_handler: Option<HandlerPtr<EndSyncEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            commit_block_handlers: handlers(log_events, commit_block_handler),
            prune_block_handlers: handlers(log_events, prune_block_handler),
            start_consensus_handlers: handlers(log_events, start_consensus_handler),
            propose_batch_handlers: handlers(log_events, propose_batch_handler),
            decide_batch_handlers: handlers(log_events, decide_batch_handler),
            consensus_done_handlers: handlers(log_events, consensus_done_handler),
            consensus_skipped_handlers: handlers(log_events, consensus_skipped_handler),
            consensus_aborted_handlers: handlers(log_events, consensus_aborted_handler),
            anchor_confirmed_handlers: handlers(log_events, anchor_confirmed_handler),
            reorg_handlers: handlers(log_events, reorg_handler),
            add_request_handlers: handlers(log_events, add_request_handler),
            remove_requests_handlers: handlers(log_events, remove_requests_handler),
            start_sync_handlers: handlers(log_events, start_sync_handler),
            end_sync_handlers: handlers(log_events, end_sync_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commit_block_handlers.is_empty()
            && self.prune_block_handlers.is_empty()
            && self.start_consensus_handlers.is_empty()
            && self.propose_batch_handlers.is_empty()
            && self.decide_batch_handlers.is_empty()
            && self.consensus_done_handlers.is_empty()
            && self.consensus_skipped_handlers.is_empty()
            && self.consensus_aborted_handlers.is_empty()
            && self.anchor_confirmed_handlers.is_empty()
            && self.reorg_handlers.is_empty()
            && self.add_request_handlers.is_empty()
            && self.remove_requests_handlers.is_empty()
            && self.start_sync_handlers.is_empty()
            && self.end_sync_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::CommitBlock(commit_block_event) => self
                .commit_block_handlers
                .iter()
                .for_each(|handler| handler(&commit_block_event)),

            Event::PruneBlock(prune_block_event) => self
                .prune_block_handlers
                .iter()
                .for_each(|handler| handler(&prune_block_event)),

            Event::StartConsensus(start_consensus_event) => self
                .start_consensus_handlers
                .iter()
                .for_each(|handler| handler(&start_consensus_event)),

            Event::ProposeBatch(propose_batch_event) => self
                .propose_batch_handlers
                .iter()
                .for_each(|handler| handler(&propose_batch_event)),

            Event::DecideBatch(decide_batch_event) => self
                .decide_batch_handlers
                .iter()
                .for_each(|handler| handler(&decide_batch_event)),

            Event::ConsensusDone(consensus_done_event) => self
                .consensus_done_handlers
                .iter()
                .for_each(|handler| handler(&consensus_done_event)),

            Event::ConsensusSkipped(consensus_skipped_event) => self
                .consensus_skipped_handlers
                .iter()
                .for_each(|handler| handler(&consensus_skipped_event)),

            Event::ConsensusAborted(consensus_aborted_event) => self
                .consensus_aborted_handlers
                .iter()
                .for_each(|handler| handler(&consensus_aborted_event)),

            Event::AnchorConfirmed(anchor_confirmed_event) => self
                .anchor_confirmed_handlers
                .iter()
                .for_each(|handler| handler(&anchor_confirmed_event)),

            Event::Reorg(reorg_event) => self
                .reorg_handlers
                .iter()
                .for_each(|handler| handler(&reorg_event)),

            Event::AddRequest(add_request_event) => self
                .add_request_handlers
                .iter()
                .for_each(|handler| handler(&add_request_event)),

            Event::RemoveRequests(remove_requests_event) => self
                .remove_requests_handlers
                .iter()
                .for_each(|handler| handler(&remove_requests_event)),

            Event::StartSync(start_sync_event) => self
                .start_sync_handlers
                .iter()
                .for_each(|handler| handler(&start_sync_event)),

            Event::EndSync(end_sync_event) => self
                .end_sync_handlers
                .iter()
                .for_each(|handler| handler(&end_sync_event)),
        }
    }
}

fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    handlers.extend(user_handler);
    handlers
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher has shut down. Keep waiting for the shutdown signal.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(50)),
        }
    })
}
