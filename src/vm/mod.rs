/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The execution pipeline: deterministic replay of a decided batch against a state draft.
//!
//! ## Pluggable contracts
//!
//! Contract logic is supplied by the user through the [`Processor`] trait. A processor is called once
//! per request, with a [`CallContext`] scoped to the called contract's realm. The processor must be
//! deterministic: given the same context and parameters, every node must make the same reads and writes
//! and return the same result.
//!
//! ## Failure isolation
//!
//! A request that fails (the processor returns an [`ExecutionError`], runs out of gas, or panics) gets a
//! failed [`Receipt`], and its buffered writes are discarded. The rest of the batch still executes. Only
//! failures that make the outcome of the batch node-dependent (an unreadable store, an inconsistent
//! schema version) abort the batch, as a [`VMError`].
//!
//! ## Order of a run
//!
//! 1. Pending [migrations] are applied.
//! 2. Each request, in the decided order:
//!     1. Is skipped if the blocklog already has a receipt for it (replay), or if its time lock lies
//!        after the batch timestamp.
//!     2. If on-ledger, credits the assets it carries to its sender.
//!     3. Fails with [`ExecutionError::Expired`] if it expired, or [`ExecutionError::InvalidNonce`] if it
//!        is an off-ledger request whose nonce is not the sender's next nonce.
//!     4. Is passed to the processor.
//!     5. Has its receipt recorded in the [blocklog].
//! 3. If any request was processed, the block's [`BlockInfo`](blocklog::BlockInfo) is recorded.

use std::any::Any;
use std::fmt::{self, Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::state::{KVStore, StateDraft, StoreError};
use crate::types::{
    anchor::{AliasOutputWithID, OutputID},
    data_types::{CryptoHash, GasUnits, Hname, Timestamp},
    request::{AgentID, Params, Request},
};

pub mod accounts;

pub mod blocklog;

pub mod context;

pub mod core_contracts;

pub mod migrations;

pub use blocklog::Receipt;
pub use context::{CallContext, ExecutionError};
pub use core_contracts::CoreContracts;
pub use migrations::{Migration, MigrationError, MigrationScheme};

pub trait Processor: Send + 'static {
    /// Execute `entry_point` of the contract `ctx.contract()`.
    ///
    /// Return [`ExecutionError::ContractNotFound`] if the processor does not know the contract.
    fn call(&self, ctx: &mut CallContext<'_>, entry_point: Hname, params: &Params) -> Result<(), ExecutionError>;
}

/// Everything needed to execute one decided batch.
pub struct VMTask<'a, K: KVStore, P: Processor> {
    pub processor: &'a P,
    pub migrations: &'a MigrationScheme,
    pub core_contracts: &'a CoreContracts,
    /// The decided base anchor. `draft` must be a draft on top of its block.
    pub anchor: &'a AliasOutputWithID,
    pub draft: StateDraft<K>,
    /// The decided requests, in execution order.
    pub requests: Vec<Request>,
    /// The aggregated timestamp of the batch.
    pub timestamp: Timestamp,
    /// The committee's randomness for the batch.
    pub entropy: CryptoHash,
    pub validator_fee_destination: AgentID,
    pub request_expiry_window: Duration,
}

pub struct VMTaskResult<K: KVStore> {
    pub draft: StateDraft<K>,
    /// One receipt per processed request, in execution order.
    pub receipts: Vec<Receipt>,
    /// Requests that were skipped because an earlier block already processed them.
    pub replayed: Vec<Request>,
    pub gas_burned: GasUnits,
}

impl<K: KVStore> VMTaskResult<K> {
    pub fn processed_count(&self) -> usize {
        self.receipts.len()
    }

    /// The outputs of the processed on-ledger requests, which the anchor transaction consumes.
    pub fn consumed_outputs(&self) -> Vec<OutputID> {
        self.receipts
            .iter()
            .filter_map(|receipt| match &receipt.request {
                Request::OnLedger(req) => Some(req.output_id),
                Request::OffLedger(_) => None,
            })
            .collect()
    }
}

/// Execute `task`. See the [module-level docs](self) for the order of a run.
pub fn run_task<K: KVStore, P: Processor>(task: VMTask<'_, K, P>) -> Result<VMTaskResult<K>, VMError> {
    let VMTask {
        processor,
        migrations,
        core_contracts,
        anchor,
        mut draft,
        requests,
        timestamp,
        entropy,
        validator_fee_destination,
        request_expiry_window,
    } = task;

    let migrated = migrations.apply(&mut draft, anchor.state_index(), timestamp)?;
    if migrated > 0 {
        log::info!("VM: applied {} migrations", migrated);
    }

    let mut receipts = Vec::new();
    let mut replayed = Vec::new();
    let mut gas_burned = GasUnits::new(0);
    for request in requests {
        if blocklog::is_processed(&draft, core_contracts, &request.id())? {
            log::debug!("VM: skipping request {}, already processed", request.id());
            replayed.push(request);
            continue;
        }
        if request.time_lock().map_or(false, |time_lock| time_lock > timestamp) {
            log::debug!("VM: skipping request {}, time locked", request.id());
            continue;
        }

        let receipt = run_request(
            processor,
            core_contracts,
            &mut draft,
            request,
            timestamp,
            &entropy,
            request_expiry_window,
        )?;
        if let Some(error) = &receipt.error {
            log::debug!("VM: request {} failed: {}", receipt.request.id(), error);
        }
        gas_burned += receipt.gas_burned;
        blocklog::save_receipt(&mut draft, core_contracts, &receipt);
        receipts.push(receipt);
    }

    if !receipts.is_empty() {
        let info = blocklog::BlockInfo {
            state_index: draft.state_index(),
            timestamp,
            request_ids: receipts.iter().map(|receipt| receipt.request.id()).collect(),
            failed_requests: receipts.iter().filter(|receipt| !receipt.is_success()).count() as u16,
            gas_burned,
            validator_fee_destination,
        };
        blocklog::save_block_info(&mut draft, core_contracts, &info);
    }

    Ok(VMTaskResult {
        draft,
        receipts,
        replayed,
        gas_burned,
    })
}

fn run_request<K: KVStore, P: Processor>(
    processor: &P,
    core_contracts: &CoreContracts,
    draft: &mut StateDraft<K>,
    request: Request,
    timestamp: Timestamp,
    entropy: &CryptoHash,
    request_expiry_window: Duration,
) -> Result<Receipt, VMError> {
    let sender = request.sender_account();
    if let Request::OnLedger(req) = &request {
        accounts::credit(draft, core_contracts, &sender, req.assets.base_tokens)?;
    }

    let failed = |request, error| Receipt {
        request,
        error: Some(error),
        gas_burned: GasUnits::new(0),
    };
    if request.is_expired(timestamp, request_expiry_window) {
        return Ok(failed(request, ExecutionError::Expired));
    }
    if let Request::OffLedger(req) = &request {
        let expected = accounts::nonce(draft, core_contracts, &sender)?;
        if req.essence.nonce != expected {
            let actual = req.essence.nonce;
            return Ok(failed(request, ExecutionError::InvalidNonce { expected, actual }));
        }
        accounts::increment_nonce(draft, core_contracts, &sender)?;
    }
    let target = request.target();
    if core_contracts.is_core(target.contract) {
        return Ok(failed(request, ExecutionError::ContractNotFound(target.contract)));
    }

    let mut ctx = CallContext::new(
        &*draft,
        target.contract,
        sender,
        request.allowance(),
        timestamp,
        CryptoHash::of(&[&entropy.bytes(), &request.id().0.bytes()]),
        request.gas_budget(),
    );
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        processor.call(&mut ctx, target.entry_point, request.params())
    }));
    let (mutations, gas_burned) = ctx.finish()?;

    let error = match outcome {
        Ok(Ok(())) => {
            draft.apply(mutations);
            None
        }
        Ok(Err(err)) => Some(err),
        Err(payload) => Some(ExecutionError::Panic(panic_message(payload))),
    };
    Ok(Receipt {
        request,
        error,
        gas_burned,
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("contract panicked")
    }
}

/// A failure that prevents a batch from being executed at all.
#[derive(Debug)]
pub enum VMError {
    MigrationError(MigrationError),
    StoreError(StoreError),
}

impl Display for VMError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VMError::MigrationError(err) => Display::fmt(err, f),
            VMError::StoreError(err) => write!(f, "state unavailable: {}", err),
        }
    }
}

impl From<MigrationError> for VMError {
    fn from(value: MigrationError) -> Self {
        VMError::MigrationError(value)
    }
}

impl From<StoreError> for VMError {
    fn from(value: StoreError) -> Self {
        VMError::StoreError(value)
    }
}
