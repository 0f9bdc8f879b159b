/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The hnames of the core contracts, whose realms the execution pipeline itself writes to.

use crate::types::data_types::Hname;

/// Built once when a chain starts and passed by reference to every component that reads or writes a
/// core contract's realm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreContracts {
    /// Owns the chain's schema version.
    pub root: Hname,
    /// Owns account balances and off-ledger nonces.
    pub accounts: Hname,
    /// Owns receipts and per-block information.
    pub blocklog: Hname,
}

impl CoreContracts {
    pub fn new() -> Self {
        Self {
            root: Hname::from_name("root"),
            accounts: Hname::from_name("accounts"),
            blocklog: Hname::from_name("blocklog"),
        }
    }

    pub fn is_core(&self, contract: Hname) -> bool {
        contract == self.root || contract == self.accounts || contract == self.blocklog
    }
}

impl Default for CoreContracts {
    fn default() -> Self {
        Self::new()
    }
}
