/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Consensus`] instance: one round of a committee, driven by the chain driver thread.
//!
//! The instance is a state machine that never blocks for long: the driver calls [`Consensus::tick`]
//! repeatedly, and each call receives the consensus messages that arrived in the meantime, then advances
//! the current [`Phase`] as far as its inputs allow. This lets the driver observe the ledger between
//! ticks, and drop the instance outright when the committee log cancels the round.
//!
//! ## Deadlines
//!
//! The instance waits in `ProposeBatch` until there is something to agree on: either the local mempool
//! has requests to propose, or a peer has already started the round. The round deadline
//! (`round_timeout`) starts when the proposal is sent; every later phase aborts with
//! [`AbortReason::Timeout`] once it passes.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::block_sync::client::BlockSyncClient;
use crate::chain::Configuration;
use crate::events::*;
use crate::ledger::{LedgerClient, LedgerError};
use crate::mempool::{MempoolError, MempoolHandle};
use crate::networking::{ConsensusMessageStub, Network};
use crate::signer::{randomness_from_signature, randomness_payload, SignRequest, SignerCoin, ThresholdSigner};
use crate::state::{Block, KVStore};
use crate::state_manager::StateManager;
use crate::types::{
    anchor::AliasOutputWithID,
    committee::Committee,
    data_types::{ChainID, CryptoHash, GasUnits, LogIndex, NodeID, Timestamp},
    request::AgentID,
    transaction::{Transaction, TransactionEssence},
};
use crate::vm::{self, CoreContracts, MigrationScheme, Processor, VMTask};

use super::acs::{Acs, AcsMessage};
use super::bp::{ordered_requests, AggregatedBatchProposals, BatchProposal, BatchProposalSet};
use super::messages::ConsensusMessage;
use super::AbortReason;

/// How long one tick waits for consensus messages when none are pending.
const TICK_WAIT: Duration = Duration::from_millis(10);

/// How often missing request payloads are queried from peers.
const QUERY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    ProposeBatch,
    AgreeOnBatch,
    DecideBatch,
    ExecuteVM,
    BuildTransaction,
    SignTransaction,
    SubmitTransaction,
    Done,
}

pub enum ConsensusOutcome {
    /// A block was committed, and the transaction anchoring it was confirmed by the ledger.
    Completed {
        block: Block,
        transaction: Transaction,
        next_alias_output: AliasOutputWithID,
        request_count: usize,
        gas_burned: GasUnits,
    },
    /// The decided batch had no processable request. Nothing was committed.
    Skipped,
    Aborted(AbortReason),
}

/// Everything an instance borrows from the chain driver during one tick.
pub(crate) struct InstanceContext<'a, K: KVStore, N: Network, L: LedgerClient, S: ThresholdSigner, P: Processor> {
    pub(crate) config: &'a Configuration,
    pub(crate) committee: &'a Committee,
    pub(crate) state_manager: &'a mut StateManager<K>,
    pub(crate) stub: &'a mut ConsensusMessageStub<N>,
    pub(crate) block_sync: &'a mut BlockSyncClient<N>,
    pub(crate) mempool: &'a MempoolHandle,
    pub(crate) ledger: &'a L,
    pub(crate) signer: &'a mut S,
    pub(crate) processor: &'a P,
    pub(crate) migrations: &'a MigrationScheme,
    pub(crate) core_contracts: &'a CoreContracts,
    pub(crate) event_publisher: &'a Option<Sender<Event>>,
}

struct Decision {
    aggregated: AggregatedBatchProposals,
    randomness: Option<CryptoHash>,
    last_query: Option<Instant>,
}

struct Submission {
    block: Block,
    transaction: Transaction,
    request_count: usize,
    gas_burned: GasUnits,
    result: Receiver<Result<AliasOutputWithID, LedgerError>>,
}

pub struct Consensus {
    chain_id: ChainID,
    log_index: LogIndex,
    base: AliasOutputWithID,
    me: NodeID,
    phase: Phase,
    acs: Acs,
    deadline: Option<Instant>,
    peers_started: bool,
    decision: Option<Decision>,
    submission: Option<Submission>,
}

impl Consensus {
    /// Create the instance at `log_index` on top of `base`. Returns `None` if `me` is not a member of
    /// `committee`.
    pub(crate) fn new(
        chain_id: ChainID,
        log_index: LogIndex,
        base: AliasOutputWithID,
        me: NodeID,
        committee: &Committee,
        event_publisher: &Option<Sender<Event>>,
    ) -> Option<Consensus> {
        let my_index = committee.index_of(&me)?;
        Event::publish(
            event_publisher,
            Event::StartConsensus(StartConsensusEvent {
                timestamp: SystemTime::now(),
                log_index,
                base_alias_output: base.output_id,
            }),
        );
        Some(Consensus {
            chain_id,
            log_index,
            base,
            me,
            phase: Phase::Init,
            acs: Acs::new(committee.n(), committee.f(), my_index),
            deadline: None,
            peers_started: false,
            decision: None,
            submission: None,
        })
    }

    pub fn log_index(&self) -> LogIndex {
        self.log_index
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn base(&self) -> &AliasOutputWithID {
        &self.base
    }

    /// Advance the instance. Returns the outcome once the round is over. Ticking a finished instance
    /// does nothing.
    pub(crate) fn tick<K: KVStore, N: Network, L: LedgerClient, S: ThresholdSigner, P: Processor>(
        &mut self,
        ctx: &mut InstanceContext<'_, K, N, L, S, P>,
    ) -> Option<ConsensusOutcome> {
        if self.phase == Phase::Done {
            return None;
        }
        match self.step(ctx) {
            Ok(None) => None,
            Ok(Some(outcome)) => {
                self.phase = Phase::Done;
                Some(outcome)
            }
            Err(reason) => {
                self.phase = Phase::Done;
                Some(ConsensusOutcome::Aborted(reason))
            }
        }
    }

    fn step<K: KVStore, N: Network, L: LedgerClient, S: ThresholdSigner, P: Processor>(
        &mut self,
        ctx: &mut InstanceContext<'_, K, N, L, S, P>,
    ) -> Result<Option<ConsensusOutcome>, AbortReason> {
        self.receive_messages(ctx)?;

        if self.phase == Phase::Init {
            self.phase = Phase::ProposeBatch;
        }
        if self.phase == Phase::ProposeBatch {
            self.propose_batch(ctx)?;
        }
        if self.phase == Phase::AgreeOnBatch {
            self.agree_on_batch(ctx)?;
        }
        if self.phase == Phase::DecideBatch {
            return self.decide_batch(ctx);
        }
        if self.phase == Phase::SubmitTransaction {
            return Ok(self.await_submission());
        }
        Ok(None)
    }

    /* ↓↓↓ Phases ↓↓↓ */

    fn propose_batch<K: KVStore, N: Network, L: LedgerClient, S: ThresholdSigner, P: Processor>(
        &mut self,
        ctx: &mut InstanceContext<'_, K, N, L, S, P>,
    ) -> Result<(), AbortReason> {
        let account_nonces = self.account_nonces(ctx)?;
        let request_refs = connected(ctx.mempool.proposal(ctx.config.max_requests_per_batch, account_nonces))?;
        if request_refs.is_empty() && !self.peers_started {
            return Ok(());
        }

        let proposal = BatchProposal {
            node_id: self.me,
            base_alias_output: self.base.clone(),
            dss_index_proposal: ctx.signer.index_proposal(),
            time_data: Timestamp::now(),
            validator_fee_destination: AgentID::Key(self.me),
            request_refs,
        };
        let request_count = proposal.request_refs.len();
        let outbox = {
            let mut coin = SignerCoin::new(&mut *ctx.signer, self.chain_id, self.log_index, ctx.config.round_timeout);
            self.acs
                .propose(proposal.try_to_vec().unwrap(), &mut coin)
                .map_err(AbortReason::SigningFailed)?
        };
        self.broadcast(ctx, outbox);

        log::debug!(
            "Consensus {}: proposed {} requests on {}",
            self.log_index,
            request_count,
            self.base
        );
        Event::publish(
            ctx.event_publisher,
            Event::ProposeBatch(ProposeBatchEvent {
                timestamp: SystemTime::now(),
                log_index: self.log_index,
                request_count,
            }),
        );
        self.deadline = Some(Instant::now() + ctx.config.round_timeout);
        self.phase = Phase::AgreeOnBatch;
        Ok(())
    }

    fn agree_on_batch<K: KVStore, N: Network, L: LedgerClient, S: ThresholdSigner, P: Processor>(
        &mut self,
        ctx: &mut InstanceContext<'_, K, N, L, S, P>,
    ) -> Result<(), AbortReason> {
        let subset = match self.acs.output() {
            Some(subset) => subset,
            None => return self.check_deadline(),
        };

        let proposals = subset.iter().filter_map(|(index, bytes)| {
            let proposal = match BatchProposal::try_from_slice(bytes) {
                Ok(proposal) => proposal,
                Err(err) => {
                    log::debug!("Consensus {}: dropping malformed proposal: {}", self.log_index, err);
                    return None;
                }
            };
            if ctx.committee.members().nth(*index) != Some(&proposal.node_id) {
                log::debug!("Consensus {}: dropping proposal with a forged proposer", self.log_index);
                return None;
            }
            Some(proposal)
        });
        let proposals = BatchProposalSet::new(proposals.collect::<Vec<_>>());

        let aggregated = AggregatedBatchProposals::aggregate(proposals, ctx.committee.f()).map_err(|reason| {
            log::error!("Consensus {}: cannot decide the batch: {}", self.log_index, reason);
            reason
        })?;
        self.decision = Some(Decision {
            aggregated,
            randomness: None,
            last_query: None,
        });
        self.phase = Phase::DecideBatch;
        Ok(())
    }

    /// Nonces of the accounts of the mempool's off-ledger senders, in the state of the base anchor. Empty
    /// if this node does not hold that state yet, in which case only on-ledger requests are proposed.
    fn account_nonces<K: KVStore, N: Network, L: LedgerClient, S: ThresholdSigner, P: Processor>(
        &self,
        ctx: &mut InstanceContext<'_, K, N, L, S, P>,
    ) -> Result<BTreeMap<NodeID, u64>, AbortReason> {
        let senders = connected(ctx.mempool.senders())?;
        if senders.is_empty() {
            return Ok(BTreeMap::new());
        }
        let base_state = match ctx
            .state_manager
            .store()
            .state_by_trie_root(&self.base.l1_commitment().trie_root)
        {
            Ok(state) => state,
            Err(err) => {
                log::debug!("Consensus {}: no base state to read nonces from: {}", self.log_index, err);
                return Ok(BTreeMap::new());
            }
        };

        let mut account_nonces = BTreeMap::new();
        for sender in senders {
            match vm::accounts::nonce(&base_state, ctx.core_contracts, &AgentID::Key(sender)) {
                Ok(nonce) => {
                    account_nonces.insert(sender, nonce);
                }
                Err(err) => log::warn!("Consensus {}: cannot read the nonce of {}: {}", self.log_index, sender, err),
            }
        }
        Ok(account_nonces)
    }

    fn decide_batch<K: KVStore, N: Network, L: LedgerClient, S: ThresholdSigner, P: Processor>(
        &mut self,
        ctx: &mut InstanceContext<'_, K, N, L, S, P>,
    ) -> Result<Option<ConsensusOutcome>, AbortReason> {
        let deadline = self.deadline.unwrap_or_else(Instant::now);
        let decision = match self.decision.as_mut() {
            Some(decision) => decision,
            None => return Err(AbortReason::StateUnavailable),
        };
        let decided_base = decision.aggregated.decided_base_alias_output.clone();

        let randomness = match decision.randomness {
            Some(randomness) => randomness,
            None => {
                let signature = ctx
                    .signer
                    .sign(SignRequest {
                        chain_id: self.chain_id,
                        log_index: self.log_index,
                        payload: randomness_payload(&decided_base.output_id),
                        dss_index_proposals: decision.aggregated.decided_dss_index_proposals.clone(),
                        timeout: deadline.saturating_duration_since(Instant::now()),
                    })
                    .map_err(AbortReason::SigningFailed)?;
                let randomness = randomness_from_signature(&signature);
                decision.randomness = Some(randomness);
                randomness
            }
        };

        let base_commitment = decided_base.l1_commitment();
        let has_base = ctx
            .state_manager
            .has_block(&base_commitment)
            .map_err(|_| AbortReason::StateUnavailable)?;
        if !has_base {
            if let Err(err) = ctx.state_manager.sync_to(&decided_base, &mut *ctx.block_sync) {
                log::warn!("Consensus {}: cannot obtain the base state: {}", self.log_index, err);
                return Err(AbortReason::StateUnavailable);
            }
        }

        let refs = decision.aggregated.decided_request_refs.clone();
        let (requests, missing) = connected(ctx.mempool.requests(refs))?;
        if !missing.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(AbortReason::Timeout);
            }
            if decision.last_query.map_or(true, |last| now - last >= QUERY_INTERVAL) {
                log::debug!("Consensus {}: querying {} missing requests", self.log_index, missing.len());
                connected(ctx.mempool.query_missing(missing))?;
                decision.last_query = Some(now);
            }
            return Ok(None);
        }

        Event::publish(
            ctx.event_publisher,
            Event::DecideBatch(DecideBatchEvent {
                timestamp: SystemTime::now(),
                log_index: self.log_index,
                base_alias_output: decided_base.output_id,
                request_count: requests.len(),
                aggregated_time: decision.aggregated.aggregated_time,
            }),
        );

        // ExecuteVM
        self.phase = Phase::ExecuteVM;
        let aggregated_time = decision.aggregated.aggregated_time;
        let validator_fee_destination = decision
            .aggregated
            .validator_fee_destination(&randomness)
            .unwrap_or(AgentID::Address(ctx.committee.address()));
        let dss_index_proposals = decision.aggregated.decided_dss_index_proposals.clone();
        let draft = ctx
            .state_manager
            .new_state_draft(aggregated_time, &base_commitment)
            .map_err(|_| AbortReason::StateUnavailable)?;
        let result = vm::run_task(VMTask {
            processor: ctx.processor,
            migrations: ctx.migrations,
            core_contracts: ctx.core_contracts,
            anchor: &decided_base,
            draft,
            requests: ordered_requests(requests, &randomness),
            timestamp: aggregated_time,
            entropy: randomness,
            validator_fee_destination,
            request_expiry_window: ctx.config.request_expiry_window,
        })
        .map_err(|err| {
            log::error!("Consensus {}: batch execution failed: {}", self.log_index, err);
            AbortReason::from(err)
        })?;
        if !result.replayed.is_empty() {
            connected(ctx.mempool.remove_finalized(result.replayed.clone()))?;
        }
        if result.processed_count() == 0 {
            return Ok(Some(ConsensusOutcome::Skipped));
        }

        // BuildTransaction
        self.phase = Phase::BuildTransaction;
        let request_count = result.processed_count();
        let gas_burned = result.gas_burned;
        let mut inputs = vec![decided_base.output_id];
        inputs.extend(result.consumed_outputs());
        let block = ctx.state_manager.commit(result.draft).map_err(|err| {
            log::error!("Consensus {}: cannot commit the block: {}", self.log_index, err);
            AbortReason::StateUnavailable
        })?;
        let next_output = decided_base
            .output
            .successor(block.l1_commitment())
            .ok_or(AbortReason::StateUnavailable)?;
        let essence = TransactionEssence {
            inputs,
            outputs: vec![next_output],
        };

        // SignTransaction
        self.phase = Phase::SignTransaction;
        let signature = ctx
            .signer
            .sign(SignRequest {
                chain_id: self.chain_id,
                log_index: self.log_index,
                payload: essence.signing_message(),
                dss_index_proposals,
                timeout: deadline.saturating_duration_since(Instant::now()),
            })
            .map_err(AbortReason::SigningFailed)?;
        let transaction = Transaction { essence, signature };

        // SubmitTransaction
        self.phase = Phase::SubmitTransaction;
        let (result_sender, result_receiver) = mpsc::channel();
        let ledger = ctx.ledger.clone();
        let to_post = transaction.clone();
        let timeout = ctx.config.round_timeout;
        thread::spawn(move || {
            let _ = result_sender.send(ledger.post_tx_and_wait_until_confirmation(to_post, timeout));
        });
        log::debug!(
            "Consensus {}: submitted transaction {} for block {}",
            self.log_index,
            transaction.id().0,
            block.l1_commitment()
        );
        self.submission = Some(Submission {
            block,
            transaction,
            request_count,
            gas_burned,
            result: result_receiver,
        });
        Ok(None)
    }

    fn await_submission(&mut self) -> Option<ConsensusOutcome> {
        let result = match &self.submission {
            Some(submission) => match submission.result.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => Err(LedgerError::Unavailable),
            },
            None => return Some(ConsensusOutcome::Aborted(AbortReason::StateUnavailable)),
        };
        let submission = self.submission.take()?;
        Some(match result {
            Ok(next_alias_output) => ConsensusOutcome::Completed {
                block: submission.block,
                transaction: submission.transaction,
                next_alias_output,
                request_count: submission.request_count,
                gas_burned: submission.gas_burned,
            },
            Err(err) => ConsensusOutcome::Aborted(AbortReason::SubmissionFailed(err)),
        })
    }

    /// If `confirmed` was produced by the transaction this instance submitted, complete the instance
    /// without waiting for the submission thread to report back.
    pub(crate) fn completed_by(&mut self, confirmed: &AliasOutputWithID) -> Option<ConsensusOutcome> {
        let matches = match &self.submission {
            Some(submission) => submission.transaction.id() == confirmed.output_id.transaction_id,
            None => false,
        };
        if !matches {
            return None;
        }
        let submission = self.submission.take()?;
        self.phase = Phase::Done;
        Some(ConsensusOutcome::Completed {
            block: submission.block,
            transaction: submission.transaction,
            next_alias_output: confirmed.clone(),
            request_count: submission.request_count,
            gas_burned: submission.gas_burned,
        })
    }

    /* ↓↓↓ Messages ↓↓↓ */

    /// Feed the consensus messages that arrive within one tick to the common subset protocol.
    fn receive_messages<K: KVStore, N: Network, L: LedgerClient, S: ThresholdSigner, P: Processor>(
        &mut self,
        ctx: &mut InstanceContext<'_, K, N, L, S, P>,
    ) -> Result<(), AbortReason> {
        let tick_deadline = Instant::now() + TICK_WAIT;
        while let Ok((sender, msg)) = ctx.stub.recv(self.chain_id, self.log_index, tick_deadline) {
            // Own messages were already delivered by the common subset state machine.
            if sender == self.me {
                continue;
            }
            let from = match ctx.committee.index_of(&sender) {
                Some(from) => from,
                None => continue,
            };
            self.peers_started = true;
            let outbox = {
                let mut coin =
                    SignerCoin::new(&mut *ctx.signer, self.chain_id, self.log_index, ctx.config.round_timeout);
                self.acs
                    .handle(from, msg.payload, &mut coin)
                    .map_err(AbortReason::SigningFailed)?
            };
            self.broadcast(ctx, outbox);
        }
        Ok(())
    }

    fn broadcast<K: KVStore, N: Network, L: LedgerClient, S: ThresholdSigner, P: Processor>(
        &self,
        ctx: &mut InstanceContext<'_, K, N, L, S, P>,
        outbox: Vec<AcsMessage>,
    ) {
        for payload in outbox {
            ctx.stub
                .broadcast(ConsensusMessage::new(self.chain_id, self.log_index, payload));
        }
    }

    fn check_deadline(&self) -> Result<(), AbortReason> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(AbortReason::Timeout),
            _ => Ok(()),
        }
    }
}

// Safety: the chain driver (the only owner of instances) shuts down before the mempool thread, so the
// mempool handle is never disconnected while an instance runs.
fn connected<T>(result: Result<T, MempoolError>) -> Result<T, AbortReason> {
    match result {
        Ok(value) => Ok(value),
        Err(MempoolError::Disconnected) => panic!("mempool disconnected while a consensus instance runs"),
    }
}
