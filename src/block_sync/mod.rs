/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The block sync protocol, which lets a node fetch the blocks behind a commitment it does not have.
//!
//! A node can fall behind its committee, e.g., when it crashes or times out during a consensus
//! instance that the others complete. When the ledger then confirms an anchor whose commitment the
//! node has no block for, its [state manager](crate::state_manager) asks the committee for the block:
//! 1. The [client](client) sends a [`BlockRequest`](messages::BlockRequest) for the commitment to a
//!    random peer, and moves on to another peer if no valid response arrives in time.
//! 2. Peers answer from their stores with the [server](server) thread.
//! 3. The state manager follows the fetched block's link to its parent until it reaches a block it has,
//!    then commits the fetched blocks oldest first, replaying each one against its parent's state.

pub mod client;

pub mod messages;

pub mod server;
