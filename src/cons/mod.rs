/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! One round of agreement among a committee: from local batch proposals to a signed anchor
//! transaction.
//!
//! A round is run by a [`Consensus`](instance::Consensus) instance, in phases:
//! 1. **ProposeBatch**: propose a base anchor, request references, a local timestamp, and a fee
//!    destination.
//! 2. **AgreeOnBatch**: run the [common subset](acs) protocol on the proposals.
//! 3. **DecideBatch**: run the [decision functions](bp) on the agreed subset, and obtain the
//!    committee's randomness from the threshold signer.
//! 4. **ExecuteVM**: execute the decided batch with the [VM](crate::vm).
//! 5. **BuildTransaction**: commit the block, and build the transaction that moves the anchor to it.
//! 6. **SignTransaction**: sign the transaction with the committee's threshold signer.
//! 7. **SubmitTransaction**: post the transaction to the base ledger.
//!
//! A round can end in one of three ways: `Completed`, `Skipped` (the decided batch contained no
//! processable request), or `Aborted` with an [`AbortReason`].

use std::fmt::{self, Display, Formatter};

use crate::ledger::LedgerError;
use crate::signer::SignError;
use crate::vm::{MigrationError, VMError};

pub mod acs;

pub mod bp;

pub mod instance;

pub mod messages;

#[derive(Debug)]
pub enum AbortReason {
    /// Two distinct base anchors at the highest state index were each proposed by more than `f` nodes.
    UncertainBaseAnchor,
    /// No base anchor was proposed by more than `f` nodes. The next round may see a consistent view.
    NoBaseAnchorQuorum,
    TimeAggregationFailed,
    /// The chain's schema version is outside the range this binary can migrate from.
    SchemaVersionInconsistent(MigrationError),
    SigningFailed(SignError),
    /// The decided base block is neither stored locally nor obtainable from peers.
    StateUnavailable,
    Timeout,
    /// The committee log moved on to a different base anchor.
    Superseded,
    ExecutionFailed(VMError),
    SubmissionFailed(LedgerError),
}

impl AbortReason {
    /// Whether the committee log must stop starting rounds until the ledger confirms a new anchor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AbortReason::UncertainBaseAnchor | AbortReason::SchemaVersionInconsistent(_)
        )
    }
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::UncertainBaseAnchor => write!(f, "uncertain base anchor"),
            AbortReason::NoBaseAnchorQuorum => write!(f, "no base anchor quorum"),
            AbortReason::TimeAggregationFailed => write!(f, "time aggregation failed"),
            AbortReason::SchemaVersionInconsistent(err) => write!(f, "schema version inconsistent: {}", err),
            AbortReason::SigningFailed(err) => write!(f, "signing failed: {}", err),
            AbortReason::StateUnavailable => write!(f, "state unavailable"),
            AbortReason::Timeout => write!(f, "timeout"),
            AbortReason::Superseded => write!(f, "superseded"),
            AbortReason::ExecutionFailed(err) => write!(f, "execution failed: {}", err),
            AbortReason::SubmissionFailed(err) => write!(f, "submission failed: {}", err),
        }
    }
}

impl From<VMError> for AbortReason {
    fn from(value: VMError) -> Self {
        match value {
            VMError::MigrationError(err) => AbortReason::SchemaVersionInconsistent(err),
            err => AbortReason::ExecutionFailed(err),
        }
    }
}
