/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Batch proposals, and the functions that decide a batch from the set of proposals agreed on by the
//! [common subset](super::acs).
//!
//! ## Determinism
//!
//! Every decision function in this module is a pure function of the contents of the
//! [`BatchProposalSet`]. Proposals are kept in a map sorted by [`NodeID`], and counts are kept in maps
//! sorted by their keys, so iteration order never depends on the order in which proposals arrived.
//!
//! ## Fault tolerance
//!
//! Up to `f` proposals may come from faulty nodes. The decision rules are chosen so that such nodes
//! cannot unilaterally decide anything:
//! - A base anchor is decided only if more than `f` nodes proposed it.
//! - A request is decided only if at least `f + 1` nodes that proposed the decided base anchor
//!   mentioned it.
//! - The batch time is the `(count - f)`-th lowest proposed time, so that at least one correct node
//!   proposed a time at or after it.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    anchor::AliasOutputWithID,
    crypto_primitives::{CryptoHasher, Digest},
    data_types::{CryptoHash, NodeID, Timestamp},
    request::{AgentID, Request, RequestRef, RequestRefKey},
};

use super::AbortReason;

/// One node's input to a consensus instance.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BatchProposal {
    pub node_id: NodeID,
    pub base_alias_output: AliasOutputWithID,
    pub dss_index_proposal: Vec<u16>,
    pub time_data: Timestamp,
    pub validator_fee_destination: AgentID,
    pub request_refs: Vec<RequestRef>,
}

/// The proposals included in the agreed common subset, keyed by proposer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchProposalSet(BTreeMap<NodeID, BatchProposal>);

impl BatchProposalSet {
    pub fn new(proposals: impl IntoIterator<Item = BatchProposal>) -> Self {
        Self(
            proposals
                .into_iter()
                .map(|proposal| (proposal.node_id, proposal))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, node_id: &NodeID) -> Option<&BatchProposal> {
        self.0.get(node_id)
    }

    /// The index proposals of every proposer, sorted by proposer.
    pub fn decided_dss_index_proposals(&self) -> BTreeMap<NodeID, Vec<u16>> {
        self.0
            .iter()
            .map(|(node_id, proposal)| (*node_id, proposal.dss_index_proposal.clone()))
            .collect()
    }

    /// The base anchor proposed by more than `f` nodes.
    ///
    /// If anchors at several state indices qualify, the one with the highest state index is decided.
    /// Fails with [`AbortReason::UncertainBaseAnchor`] if two distinct anchors qualify at that highest
    /// state index, and with [`AbortReason::NoBaseAnchorQuorum`] if no anchor qualifies.
    pub fn decided_base_alias_output(&self, f: usize) -> Result<AliasOutputWithID, AbortReason> {
        let mut counts: BTreeMap<CryptoHash, (usize, &AliasOutputWithID)> = BTreeMap::new();
        for proposal in self.0.values() {
            counts
                .entry(proposal.base_alias_output.hash())
                .or_insert((0, &proposal.base_alias_output))
                .0 += 1;
        }

        let mut found: Option<&AliasOutputWithID> = None;
        let mut uncertain = false;
        for (count, alias_output) in counts.values() {
            if *count <= f {
                continue;
            }
            match found {
                Some(current) if current.state_index() == alias_output.state_index() => uncertain = true,
                Some(current) if current.state_index() > alias_output.state_index() => (),
                _ => {
                    found = Some(alias_output);
                    uncertain = false;
                }
            }
        }

        match found {
            _ if uncertain => Err(AbortReason::UncertainBaseAnchor),
            Some(alias_output) => Ok(alias_output.clone()),
            None => Err(AbortReason::NoBaseAnchorQuorum),
        }
    }

    /// The requests mentioned by at least `f + 1` of the proposals that proposed `alias_output` as their
    /// base, each exactly once, sorted by request ref key.
    pub fn decided_request_refs(&self, f: usize, alias_output: &AliasOutputWithID) -> Vec<RequestRef> {
        let mut mentions: BTreeMap<RequestRefKey, (usize, RequestRef)> = BTreeMap::new();
        for proposal in self.0.values() {
            if proposal.base_alias_output != *alias_output {
                continue;
            }
            let mut refs = proposal.request_refs.clone();
            refs.sort();
            refs.dedup();
            for request_ref in refs {
                mentions.entry(request_ref.as_key()).or_insert((0, request_ref)).0 += 1;
            }
        }

        mentions
            .into_values()
            .filter(|(count, _)| *count > f)
            .map(|(_, request_ref)| request_ref)
            .collect()
    }

    /// The `(count - f)`-th lowest proposed time, where `count` is the number of proposals. `None` if
    /// there are no more than `f` proposals.
    pub fn aggregated_time(&self, f: usize) -> Option<Timestamp> {
        let count = self.0.len();
        if count <= f {
            return None;
        }
        let mut times: Vec<Timestamp> = self.0.values().map(|proposal| proposal.time_data).collect();
        times.sort();
        Some(times[count - f - 1])
    }

    /// Pseudo-randomly select one proposer, given the aggregated time and the committee-wide randomness.
    pub fn selected_proposal(&self, aggregated_time: Timestamp, randomness: &CryptoHash) -> Option<NodeID> {
        if self.0.is_empty() {
            return None;
        }
        let mut hasher = CryptoHasher::new();
        hasher.update(aggregated_time.unix_nanos().to_be_bytes());
        hasher.update(randomness.bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[0..8]);
        let position = (u64::from_be_bytes(prefix) % self.0.len() as u64) as usize;
        self.0.keys().nth(position).copied()
    }

    /// The validator fee destination declared by the [selected proposal](Self::selected_proposal).
    pub fn selected_fee_destination(&self, aggregated_time: Timestamp, randomness: &CryptoHash) -> Option<AgentID> {
        let node_id = self.selected_proposal(aggregated_time, randomness)?;
        self.0.get(&node_id).map(|proposal| proposal.validator_fee_destination)
    }
}

/// The parts of a batch that can be decided before the committee-wide randomness is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatedBatchProposals {
    pub proposals: BatchProposalSet,
    pub decided_base_alias_output: AliasOutputWithID,
    pub decided_request_refs: Vec<RequestRef>,
    pub aggregated_time: Timestamp,
    pub decided_dss_index_proposals: BTreeMap<NodeID, Vec<u16>>,
}

impl AggregatedBatchProposals {
    pub fn aggregate(proposals: BatchProposalSet, f: usize) -> Result<Self, AbortReason> {
        let decided_base_alias_output = proposals.decided_base_alias_output(f)?;
        let aggregated_time = proposals
            .aggregated_time(f)
            .filter(|time| !time.is_zero())
            .ok_or(AbortReason::TimeAggregationFailed)?;
        let decided_request_refs = proposals.decided_request_refs(f, &decided_base_alias_output);
        let decided_dss_index_proposals = proposals.decided_dss_index_proposals();
        Ok(Self {
            proposals,
            decided_base_alias_output,
            decided_request_refs,
            aggregated_time,
            decided_dss_index_proposals,
        })
    }

    pub fn validator_fee_destination(&self, randomness: &CryptoHash) -> Option<AgentID> {
        self.proposals
            .selected_fee_destination(self.aggregated_time, randomness)
    }
}

/// Order the requests of a decided batch for execution: on-ledger requests first, shuffled by
/// `randomness`, then off-ledger requests grouped by sender in ascending nonce order.
pub fn ordered_requests(mut requests: Vec<Request>, randomness: &CryptoHash) -> Vec<Request> {
    requests.sort_by_cached_key(|request| match request {
        Request::OnLedger(on_ledger) => (
            0u8,
            CryptoHash::of(&[&randomness.bytes(), &on_ledger.id().0.bytes()]).bytes(),
            0u64,
        ),
        Request::OffLedger(off_ledger) => (
            1u8,
            off_ledger.essence.sender.bytes(),
            off_ledger.essence.nonce,
        ),
    });
    requests
}
