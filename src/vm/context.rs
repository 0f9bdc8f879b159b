/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`CallContext`] handed to a contract for the duration of one call.
//!
//! A call sees the chain state through its contract's realm: every key the contract reads or writes is
//! prefixed with the contract's [hname](Hname). Writes are buffered in the context and only reach the
//! batch's [`StateDraft`](crate::state::StateDraft) if the call succeeds. Every read and write burns
//! gas against the request's budget.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::state::{paths::combine, StateReader, StoreError};
use crate::types::{
    data_types::{CryptoHash, GasUnits, Hname, Timestamp},
    request::{AgentID, Assets},
    update_sets::StateMutations,
};

/// Gas burned by every state read, on top of the per-byte cost.
pub const GAS_PER_READ: u64 = 10;

/// Gas burned by every state write or delete, on top of the per-byte cost.
pub const GAS_PER_WRITE: u64 = 100;

/// Gas burned for every byte of key and value moved in or out of the state.
pub const GAS_PER_BYTE: u64 = 1;

/// The failure of one request. Recorded in the request's receipt. Never aborts the batch.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ExecutionError {
    /// The contract aborted the call, or panicked.
    Panic(String),
    OutOfGas,
    /// The nonce of an off-ledger request is not the sender's next nonce.
    InvalidNonce { expected: u64, actual: u64 },
    ContractNotFound(Hname),
    /// The request reached its expiration before it could be processed.
    Expired,
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::Panic(message) => write!(f, "panic: {}", message),
            ExecutionError::OutOfGas => write!(f, "out of gas"),
            ExecutionError::InvalidNonce { expected, actual } => {
                write!(f, "invalid nonce {}, expected {}", actual, expected)
            }
            ExecutionError::ContractNotFound(contract) => write!(f, "contract {} not found", contract),
            ExecutionError::Expired => write!(f, "request expired"),
        }
    }
}

/// The key under which `contract` stores `key`.
pub fn realm_key(contract: Hname, key: &[u8]) -> Vec<u8> {
    combine(&contract.to_le_bytes(), key)
}

pub struct CallContext<'a> {
    state: &'a dyn StateReader,
    mutations: StateMutations,
    contract: Hname,
    caller: AgentID,
    allowance: Assets,
    timestamp: Timestamp,
    entropy: CryptoHash,
    gas_budget: GasUnits,
    gas_burned: GasUnits,
    state_error: Option<StoreError>,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(
        state: &'a dyn StateReader,
        contract: Hname,
        caller: AgentID,
        allowance: Assets,
        timestamp: Timestamp,
        entropy: CryptoHash,
        gas_budget: GasUnits,
    ) -> Self {
        Self {
            state,
            mutations: StateMutations::new(),
            contract,
            caller,
            allowance,
            timestamp,
            entropy,
            gas_budget,
            gas_burned: GasUnits::new(0),
            state_error: None,
        }
    }

    /* ↓↓↓ Call information ↓↓↓ */

    pub fn contract(&self) -> Hname {
        self.contract
    }

    pub fn caller(&self) -> AgentID {
        self.caller
    }

    pub fn allowance(&self) -> Assets {
        self.allowance
    }

    /// The decided timestamp of the batch.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Randomness derived from the committee's randomness and the request ID. Identical on every node.
    pub fn entropy(&self) -> CryptoHash {
        self.entropy
    }

    pub fn gas_burned(&self) -> GasUnits {
        self.gas_burned
    }

    /* ↓↓↓ Contract state ↓↓↓ */

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, ExecutionError> {
        self.burn(GAS_PER_READ + GAS_PER_BYTE * key.len() as u64)?;
        let key = realm_key(self.contract, key);
        let value = if let Some(value) = self.mutations.get_insert(&key) {
            Some(value.clone())
        } else if self.mutations.contains_delete(&key) {
            None
        } else {
            match self.state.get(&key) {
                Ok(value) => value,
                Err(err) => {
                    self.state_error = Some(err);
                    return Err(ExecutionError::Panic(String::from("state unavailable")));
                }
            }
        };
        if let Some(value) = &value {
            self.burn(GAS_PER_BYTE * value.len() as u64)?;
        }
        Ok(value)
    }

    pub fn get_as<T: BorshDeserialize>(&mut self, key: &[u8]) -> Result<Option<T>, ExecutionError> {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => T::deserialize(&mut &*bytes)
                .map(Some)
                .map_err(|err| ExecutionError::Panic(format!("malformed value: {}", err))),
        }
    }

    pub fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), ExecutionError> {
        self.burn(GAS_PER_WRITE + GAS_PER_BYTE * (key.len() + value.len()) as u64)?;
        self.mutations.insert(realm_key(self.contract, key), value);
        Ok(())
    }

    pub fn set_as<T: BorshSerialize>(&mut self, key: &[u8], value: &T) -> Result<(), ExecutionError> {
        self.set(key, value.try_to_vec().unwrap())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), ExecutionError> {
        self.burn(GAS_PER_WRITE + GAS_PER_BYTE * key.len() as u64)?;
        self.mutations.delete(realm_key(self.contract, key));
        Ok(())
    }

    /* ↓↓↓ Aborting ↓↓↓ */

    /// Fail the call with `message` unless `condition` holds.
    pub fn require(&self, condition: bool, message: &str) -> Result<(), ExecutionError> {
        if condition {
            Ok(())
        } else {
            Err(ExecutionError::Panic(message.to_string()))
        }
    }

    /// Burn `amount` gas. Burning past the budget caps the burned gas at the budget and fails the call.
    pub fn burn(&mut self, amount: u64) -> Result<(), ExecutionError> {
        self.gas_burned += GasUnits::new(amount);
        if self.gas_burned > self.gas_budget {
            self.gas_burned = self.gas_budget;
            return Err(ExecutionError::OutOfGas);
        }
        Ok(())
    }

    /// Consume the context, returning the buffered writes and the burned gas. If a state read failed
    /// during the call, the store error is returned instead: the call's outcome is then not
    /// deterministic, and the batch cannot be executed.
    pub(crate) fn finish(self) -> Result<(StateMutations, GasUnits), StoreError> {
        match self.state_error {
            Some(err) => Err(err),
            None => Ok((self.mutations, self.gas_burned)),
        }
    }
}
