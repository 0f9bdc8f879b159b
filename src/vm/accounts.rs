/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The accounts realm: base-token balances and off-ledger nonces, keyed by [`AgentID`].

use crate::state::{paths::combine, KVStore, StateDraft, StateReader, StoreError};
use crate::types::request::AgentID;

use super::context::realm_key;
use super::core_contracts::CoreContracts;

pub const BALANCES: [u8; 1] = [b'b'];
pub const NONCES: [u8; 1] = [b'n'];

fn balance_key(core: &CoreContracts, agent: &AgentID) -> Vec<u8> {
    realm_key(core.accounts, &combine(&BALANCES, &agent.bytes()))
}

fn nonce_key(core: &CoreContracts, agent: &AgentID) -> Vec<u8> {
    realm_key(core.accounts, &combine(&NONCES, &agent.bytes()))
}

pub fn balance<R: StateReader>(state: &R, core: &CoreContracts, agent: &AgentID) -> Result<u64, StoreError> {
    Ok(state.get_as(&balance_key(core, agent))?.unwrap_or(0))
}

/// The nonce that the next off-ledger request of `agent` must carry.
pub fn nonce<R: StateReader>(state: &R, core: &CoreContracts, agent: &AgentID) -> Result<u64, StoreError> {
    Ok(state.get_as(&nonce_key(core, agent))?.unwrap_or(0))
}

pub(crate) fn credit<K: KVStore>(
    draft: &mut StateDraft<K>,
    core: &CoreContracts,
    agent: &AgentID,
    base_tokens: u64,
) -> Result<(), StoreError> {
    if base_tokens == 0 {
        return Ok(());
    }
    let balance = balance(draft, core, agent)?.saturating_add(base_tokens);
    draft.set_as(&balance_key(core, agent), &balance);
    Ok(())
}

pub(crate) fn increment_nonce<K: KVStore>(
    draft: &mut StateDraft<K>,
    core: &CoreContracts,
    agent: &AgentID,
) -> Result<(), StoreError> {
    let next = nonce(draft, core, agent)?.saturating_add(1);
    draft.set_as(&nonce_key(core, agent), &next);
    Ok(())
}
