/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A node engine for committee-run chains anchored on a base ledger.
//!
//! A fixed committee of nodes runs each chain. The committee agrees on batches of requests with a
//! leaderless asynchronous common subset protocol, executes them deterministically into a new block of
//! state, and anchors a commitment to that state on the base ledger with a threshold-signed transaction.
//!
//! Start reading from [chain], which builds and runs a node, then [cons] for the consensus instance and
//! [cmt_log] for how a node decides which round to run next.

pub mod block_sync;

pub mod chain;

pub mod cmt_log;

pub mod cons;

pub mod event_bus;

pub mod events;

pub mod ledger;

pub(crate) mod logging;

pub mod mempool;

pub mod networking;

pub mod signer;

pub mod state;

pub mod state_manager;

pub mod types;

pub mod vm;
