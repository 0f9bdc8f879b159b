/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](LedgerClient) for the pluggable base-ledger client.
//!
//! The base ledger holds the chain's anchor (its current [alias output](AliasOutputWithID)) and the
//! on-ledger requests sent to the chain's address. The client lets a chain read the unspent outputs it
//! owns, post the transactions that advance its anchor, and observe the ledger's confirmations.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use crate::types::{
    anchor::{Address, AliasOutputWithID, OutputID},
    request::OnLedgerRequest,
    transaction::Transaction,
};

pub trait LedgerClient: Clone + Send + 'static {
    /// Get the unspent outputs owned by `address`.
    fn output_map(&self, address: &Address) -> Result<BTreeMap<OutputID, LedgerOutput>, LedgerError>;

    /// Post `transaction`, then block until the ledger confirms it or `timeout` passes. Returns the anchor
    /// created by the transaction.
    ///
    /// Posting a transaction that the ledger already confirmed returns the anchor it created.
    fn post_tx_and_wait_until_confirmation(
        &self,
        transaction: Transaction,
        timeout: Duration,
    ) -> Result<AliasOutputWithID, LedgerError>;

    /// Receive an event from the ledger. Returns immediately with a `None` if no event is available now.
    fn recv_event(&mut self) -> Option<LedgerEvent>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerOutput {
    Alias(AliasOutputWithID),
    Request(OnLedgerRequest),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    /// The ledger confirmed a new anchor for the chain.
    AliasOutputConfirmed(AliasOutputWithID),
    /// The ledger rejected a transaction that would have created this anchor.
    AliasOutputRejected(AliasOutputWithID),
    /// A request output was sent to the chain's address.
    RequestReceived(OnLedgerRequest),
    /// An output owned by the chain was consumed.
    OutputConsumed(OutputID),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    Timeout,
    /// The transaction conflicts with the ledger's state, e.g., it consumes an already spent output.
    Conflict,
    InvalidTransaction(String),
    Unavailable,
}

impl Display for LedgerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Timeout => write!(f, "confirmation timed out"),
            LedgerError::Conflict => write!(f, "transaction conflicts with the ledger"),
            LedgerError::InvalidTransaction(reason) => write!(f, "invalid transaction: {}", reason),
            LedgerError::Unavailable => write!(f, "ledger unavailable"),
        }
    }
}
