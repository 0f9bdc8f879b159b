pub(crate) mod counter;

pub(crate) mod ledger;

pub(crate) mod logging;

pub(crate) mod mem_db;

pub(crate) mod network;

pub(crate) mod node;

pub(crate) mod signer;
