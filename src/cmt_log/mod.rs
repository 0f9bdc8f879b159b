/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The committee log: decides when a committee starts a consensus round, and on which base anchor.
//!
//! ## States
//!
//! - **Idle**: no round is running. A round starts as soon as the [local view](local_view) has a
//!   settled (confirmed) tip, unless the log is halted or waiting out a retry delay.
//! - **RoundRunning**: a consensus instance runs at some [`LogIndex`] on top of a base anchor.
//! - **AwaitingConfirmation**: the last round published an anchor, and the log waits for the ledger to
//!   confirm or reject it.
//!
//! ## Log indices
//!
//! A round on base anchor `a` runs at log index `(a.state_index, attempt)`. Every round started on the
//! same state index takes the next attempt. A round that is skipped or aborted is retried after
//! `round_retry_delay`. If at least `f + 1` peers were seen running a later attempt on the same state
//! index, the log catches up to that attempt directly.
//!
//! ## Safety
//!
//! A round whose base anchor is no longer the tip of the local view is cancelled, so that no two rounds
//! commit on top of different bases for the same state index. After a fatal abort the log halts, and
//! starts no round until the ledger confirms a new anchor.

pub mod local_view;

use std::sync::mpsc::Sender;
use std::time::{Duration, Instant, SystemTime};

use crate::events::*;
use crate::types::{
    anchor::AliasOutputWithID,
    data_types::LogIndex,
};

use local_view::LocalView;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CmtLogState {
    Idle,
    AwaitingConfirmation { published: AliasOutputWithID },
    RoundRunning { log_index: LogIndex, base: AliasOutputWithID },
}

pub struct CmtLog {
    local_view: LocalView,
    state: CmtLogState,
    halted: bool,
    last_log_index: Option<LogIndex>,
    retry_at: Option<Instant>,
    round_retry_delay: Duration,
    event_publisher: Option<Sender<Event>>,
}

impl CmtLog {
    pub fn new(round_retry_delay: Duration, event_publisher: Option<Sender<Event>>) -> Self {
        Self {
            local_view: LocalView::new(),
            state: CmtLogState::Idle,
            halted: false,
            last_log_index: None,
            retry_at: None,
            round_retry_delay,
            event_publisher,
        }
    }

    pub fn state(&self) -> &CmtLogState {
        &self.state
    }

    pub fn local_view(&self) -> &LocalView {
        &self.local_view
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /* ↓↓↓ Ledger inputs ↓↓↓ */

    /// Record a confirmation by the ledger. Returns the log index of the running round if it must be
    /// cancelled because its base anchor was superseded.
    pub fn alias_output_confirmed(&mut self, alias_output: AliasOutputWithID) -> Option<LogIndex> {
        let previous_tip = self.local_view.tip().map(|tip| tip.output_id);
        let update = self.local_view.alias_output_confirmed(alias_output.clone());
        if update.reorg {
            log::warn!(
                "CmtLog: reorganization, tip is now {} at state index {}",
                alias_output.output_id,
                alias_output.state_index()
            );
            Event::publish(
                &self.event_publisher,
                Event::Reorg(ReorgEvent {
                    timestamp: SystemTime::now(),
                    previous_tip,
                    new_tip: alias_output.output_id,
                    state_index: alias_output.state_index(),
                }),
            );
        }
        if update.tip_changed || update.reorg {
            self.halted = false;
            self.retry_at = None;
        }

        match &self.state {
            CmtLogState::RoundRunning { log_index, base } => {
                if self.local_view.tip() != Some(base) {
                    let cancelled = *log_index;
                    self.state = CmtLogState::Idle;
                    return Some(cancelled);
                }
            }
            CmtLogState::AwaitingConfirmation { published } => {
                if *published == alias_output || update.reorg {
                    self.state = CmtLogState::Idle;
                }
            }
            CmtLogState::Idle => (),
        }
        None
    }

    pub fn alias_output_rejected(&mut self, alias_output: &AliasOutputWithID) {
        if self.local_view.alias_output_rejected(alias_output) {
            log::warn!("CmtLog: anchor {} rejected by the ledger", alias_output.output_id);
        }
        if let CmtLogState::AwaitingConfirmation { published } = &self.state {
            if published == alias_output {
                self.state = CmtLogState::Idle;
            }
        }
    }

    /* ↓↓↓ Round lifecycle ↓↓↓ */

    /// The round to start now, if any. Starting it moves the log to `RoundRunning`.
    pub fn next_round(&mut self, now: Instant) -> Option<(LogIndex, AliasOutputWithID)> {
        if self.state != CmtLogState::Idle || self.halted || !self.local_view.is_settled() {
            return None;
        }
        if self.retry_at.map_or(false, |retry_at| now < retry_at) {
            return None;
        }
        let base = self.local_view.tip()?.clone();
        let log_index = match self.last_log_index {
            Some(last) if last.state_index == base.state_index() => last.next_attempt(),
            _ => LogIndex::new(base.state_index(), 0),
        };
        self.retry_at = None;
        self.last_log_index = Some(log_index);
        self.state = CmtLogState::RoundRunning {
            log_index,
            base: base.clone(),
        };
        Some((log_index, base))
    }

    /// Jump the running round to the later attempt `target` that peers are already running. Returns the
    /// round to start in place of the running one.
    pub fn catch_up(&mut self, target: LogIndex) -> Option<(LogIndex, AliasOutputWithID)> {
        match &self.state {
            CmtLogState::RoundRunning { log_index, base }
                if target.state_index == log_index.state_index && target > *log_index =>
            {
                log::info!("CmtLog: catching up from log index {} to {}", log_index, target);
                let base = base.clone();
                self.last_log_index = Some(target);
                self.state = CmtLogState::RoundRunning {
                    log_index: target,
                    base: base.clone(),
                };
                Some((target, base))
            }
            _ => None,
        }
    }

    /// The round at `log_index` produced and published `next`.
    pub fn consensus_completed(&mut self, log_index: LogIndex, next: AliasOutputWithID) {
        let base = match &self.state {
            CmtLogState::RoundRunning { log_index: running, base } if *running == log_index => base.clone(),
            _ => return,
        };
        if self.local_view.alias_output_published(&base.output_id, next.clone()) {
            self.state = CmtLogState::AwaitingConfirmation { published: next };
        } else {
            self.state = CmtLogState::Idle;
        }
    }

    /// The round at `log_index` ended without publishing an anchor. A fatal failure halts the log.
    pub fn consensus_failed(&mut self, log_index: LogIndex, fatal: bool, now: Instant) {
        match &self.state {
            CmtLogState::RoundRunning { log_index: running, .. } if *running == log_index => (),
            _ => return,
        }
        self.state = CmtLogState::Idle;
        if fatal {
            log::error!("CmtLog: halting after a fatal failure at log index {}", log_index);
            self.halted = true;
        } else {
            self.retry_at = Some(now + self.round_retry_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        anchor::{Address, AliasOutput, L1Commitment, OutputID, TransactionID},
        data_types::{CryptoHash, StateIndex},
    };

    fn anchor(state_index: u32, tag: u8) -> AliasOutputWithID {
        AliasOutputWithID::new(
            OutputID::new(TransactionID(CryptoHash::new([tag; 32])), 0),
            AliasOutput {
                state_index: StateIndex::new(state_index),
                state_metadata: L1Commitment::new(CryptoHash::new([tag; 32]), CryptoHash::new([tag; 32])),
                state_controller: Address(CryptoHash::new([1; 32])),
                governor: Address(CryptoHash::new([1; 32])),
                amount: 1000,
            },
        )
    }

    fn log_index(state_index: u32, attempt: u32) -> LogIndex {
        LogIndex::new(StateIndex::new(state_index), attempt)
    }

    #[test]
    fn no_round_without_a_confirmed_anchor() {
        let mut cmt_log = CmtLog::new(Duration::ZERO, None);
        assert!(cmt_log.next_round(Instant::now()).is_none());
    }

    #[test]
    fn full_cycle() {
        let mut cmt_log = CmtLog::new(Duration::ZERO, None);
        cmt_log.alias_output_confirmed(anchor(0, 0));

        let (index, base) = cmt_log.next_round(Instant::now()).unwrap();
        assert_eq!(index, log_index(0, 0));
        assert_eq!(base, anchor(0, 0));
        assert!(cmt_log.next_round(Instant::now()).is_none());

        cmt_log.consensus_completed(index, anchor(1, 1));
        assert_eq!(
            *cmt_log.state(),
            CmtLogState::AwaitingConfirmation { published: anchor(1, 1) }
        );
        assert!(cmt_log.next_round(Instant::now()).is_none());

        assert!(cmt_log.alias_output_confirmed(anchor(1, 1)).is_none());
        assert_eq!(*cmt_log.state(), CmtLogState::Idle);
        let (index, base) = cmt_log.next_round(Instant::now()).unwrap();
        assert_eq!(index, log_index(1, 0));
        assert_eq!(base, anchor(1, 1));
    }

    #[test]
    fn failed_round_is_retried_at_the_next_attempt_after_the_delay() {
        let mut cmt_log = CmtLog::new(Duration::from_secs(10), None);
        cmt_log.alias_output_confirmed(anchor(0, 0));
        let (index, _) = cmt_log.next_round(Instant::now()).unwrap();

        let failed_at = Instant::now();
        cmt_log.consensus_failed(index, false, failed_at);
        assert!(cmt_log.next_round(failed_at).is_none());

        let (index, _) = cmt_log.next_round(failed_at + Duration::from_secs(11)).unwrap();
        assert_eq!(index, log_index(0, 1));
    }

    #[test]
    fn fatal_failure_halts_until_a_new_confirmation() {
        let mut cmt_log = CmtLog::new(Duration::ZERO, None);
        cmt_log.alias_output_confirmed(anchor(0, 0));
        let (index, _) = cmt_log.next_round(Instant::now()).unwrap();

        cmt_log.consensus_failed(index, true, Instant::now());
        assert!(cmt_log.is_halted());
        assert!(cmt_log.next_round(Instant::now()).is_none());

        cmt_log.alias_output_confirmed(anchor(1, 7));
        assert!(!cmt_log.is_halted());
        let (index, base) = cmt_log.next_round(Instant::now()).unwrap();
        assert_eq!(index, log_index(1, 0));
        assert_eq!(base, anchor(1, 7));
    }

    #[test]
    fn superseded_round_is_cancelled() {
        let mut cmt_log = CmtLog::new(Duration::ZERO, None);
        cmt_log.alias_output_confirmed(anchor(0, 0));
        let (index, _) = cmt_log.next_round(Instant::now()).unwrap();

        assert_eq!(cmt_log.alias_output_confirmed(anchor(1, 9)), Some(index));
        assert_eq!(*cmt_log.state(), CmtLogState::Idle);

        // A late completion of the cancelled round is ignored.
        cmt_log.consensus_completed(index, anchor(1, 1));
        assert_eq!(*cmt_log.state(), CmtLogState::Idle);
        let (_, base) = cmt_log.next_round(Instant::now()).unwrap();
        assert_eq!(base, anchor(1, 9));
    }

    #[test]
    fn reorg_while_awaiting_confirmation_returns_to_idle() {
        let mut cmt_log = CmtLog::new(Duration::ZERO, None);
        cmt_log.alias_output_confirmed(anchor(0, 0));
        let (index, _) = cmt_log.next_round(Instant::now()).unwrap();
        cmt_log.consensus_completed(index, anchor(1, 1));

        cmt_log.alias_output_confirmed(anchor(1, 2));
        assert_eq!(*cmt_log.state(), CmtLogState::Idle);
        assert_eq!(cmt_log.local_view().tip(), Some(&anchor(1, 2)));
    }

    #[test]
    fn rejection_while_awaiting_confirmation_returns_to_idle() {
        let mut cmt_log = CmtLog::new(Duration::ZERO, None);
        cmt_log.alias_output_confirmed(anchor(0, 0));
        let (index, _) = cmt_log.next_round(Instant::now()).unwrap();
        cmt_log.consensus_completed(index, anchor(1, 1));

        cmt_log.alias_output_rejected(&anchor(1, 1));
        assert_eq!(*cmt_log.state(), CmtLogState::Idle);
        let (index, base) = cmt_log.next_round(Instant::now()).unwrap();
        assert_eq!(index, log_index(0, 1));
        assert_eq!(base, anchor(0, 0));
    }

    #[test]
    fn catch_up_jumps_to_a_later_attempt() {
        let mut cmt_log = CmtLog::new(Duration::ZERO, None);
        cmt_log.alias_output_confirmed(anchor(0, 0));
        cmt_log.next_round(Instant::now()).unwrap();

        assert!(cmt_log.catch_up(log_index(1, 3)).is_none());
        let (index, base) = cmt_log.catch_up(log_index(0, 3)).unwrap();
        assert_eq!(index, log_index(0, 3));
        assert_eq!(base, anchor(0, 0));
        assert!(cmt_log.catch_up(log_index(0, 2)).is_none());
    }
}
