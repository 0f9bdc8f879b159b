/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The blocklog realm: a [`Receipt`] for every processed request, and a [`BlockInfo`] for every block.
//!
//! | Variable | Key (after the blocklog hname) | Value |
//! |----------|-----|-------|
//! | Receipts | `RECEIPTS` + request ID | `Receipt` |
//! | Block information | `BLOCK_INFOS` + state index (LE) | `BlockInfo` |
//!
//! A receipt holds the full request, so the requests of any stored block can be recovered from its
//! state alone. This is how a node that learns of a confirmed block purges the block's requests from
//! its mempool, whether or not it took part in producing the block.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::state::{paths::combine, KVStore, StateDraft, StateReader, StoreError};
use crate::types::{
    data_types::{GasUnits, StateIndex, Timestamp},
    request::{AgentID, Request, RequestID},
};

use super::context::{realm_key, ExecutionError};
use super::core_contracts::CoreContracts;

pub const RECEIPTS: [u8; 1] = [b'r'];
pub const BLOCK_INFOS: [u8; 1] = [b'b'];

/// The outcome of one processed request.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Receipt {
    pub request: Request,
    pub error: Option<ExecutionError>,
    pub gas_burned: GasUnits,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockInfo {
    pub state_index: StateIndex,
    pub timestamp: Timestamp,
    /// The processed requests, in execution order.
    pub request_ids: Vec<RequestID>,
    pub failed_requests: u16,
    pub gas_burned: GasUnits,
    pub validator_fee_destination: AgentID,
}

fn receipt_key(core: &CoreContracts, id: &RequestID) -> Vec<u8> {
    realm_key(core.blocklog, &combine(&RECEIPTS, &id.0.bytes()))
}

fn block_info_key(core: &CoreContracts, state_index: StateIndex) -> Vec<u8> {
    realm_key(core.blocklog, &combine(&BLOCK_INFOS, &state_index.to_le_bytes()))
}

pub(crate) fn save_receipt<K: KVStore>(draft: &mut StateDraft<K>, core: &CoreContracts, receipt: &Receipt) {
    draft.set_as(&receipt_key(core, &receipt.request.id()), receipt)
}

pub(crate) fn save_block_info<K: KVStore>(draft: &mut StateDraft<K>, core: &CoreContracts, info: &BlockInfo) {
    draft.set_as(&block_info_key(core, info.state_index), info)
}

pub fn receipt<R: StateReader>(state: &R, core: &CoreContracts, id: &RequestID) -> Result<Option<Receipt>, StoreError> {
    state.get_as(&receipt_key(core, id))
}

/// Whether the request identified by `id` was processed in this state or any state before it.
pub fn is_processed<R: StateReader>(state: &R, core: &CoreContracts, id: &RequestID) -> Result<bool, StoreError> {
    state.has(&receipt_key(core, id))
}

pub fn block_info<R: StateReader>(
    state: &R,
    core: &CoreContracts,
    state_index: StateIndex,
) -> Result<Option<BlockInfo>, StoreError> {
    state.get_as(&block_info_key(core, state_index))
}

/// The requests processed in the block at `state_index`, in execution order. Empty if the state holds
/// no information about that block.
pub fn requests_in_block<R: StateReader>(
    state: &R,
    core: &CoreContracts,
    state_index: StateIndex,
) -> Result<Vec<Request>, StoreError> {
    let info = match block_info(state, core, state_index)? {
        Some(info) => info,
        None => return Ok(Vec::new()),
    };
    let mut requests = Vec::with_capacity(info.request_ids.len());
    for id in &info.request_ids {
        if let Some(receipt) = receipt(state, core, id)? {
            requests.push(receipt.request);
        }
    }
    Ok(requests)
}
