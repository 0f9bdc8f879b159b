/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and initialize the storage of a chain node.
//!
//! A chain is run by a fixed committee of nodes. Each node keeps a full copy of the chain's state, runs
//! one [consensus instance](crate::cons) at a time on top of the chain's current anchor on the base
//! ledger, and posts the transaction that advances the anchor once the committee agrees on a block.
//!
//! They key components of this module are:
//! - The builder-pattern interface to construct a [specification of the chain node](ChainSpec) with:
//!   1. `ChainSpec::builder` to construct a `ChainSpecBuilder`,
//!   2. The setters of the `ChainSpecBuilder`, and
//!   3. The `ChainSpecBuilder::build` method to construct a [ChainSpec],
//! - The function to [start](ChainSpec::start) a [Chain] given its specification,
//! - The function to [initialize](Chain::initialize) the node's [Store](crate::state::Store),
//! - [The type](Chain) which keeps the node alive.
//!
//! ## Threads
//!
//! A running node has five threads:
//! 1. The **poller**, which routes messages from the network provider to the other threads.
//! 2. The **mempool**, which owns the pool of pending requests.
//! 3. The **block sync server**, which serves stored blocks to peers that are catching up.
//! 4. The **driver**, which owns the committee log, the state manager, and the current consensus
//!    instance, and feeds ledger events to them.
//! 5. The **event bus**, which runs the registered event handlers. Only started if there are any.
//!
//! ## Starting a chain node
//!
//! ```ignore
//! Chain::initialize(kv_store.clone(), initial_state)?;
//!
//! let chain =
//!     ChainSpec::builder()
//!     .kv_store(kv_store)
//!     .network(network)
//!     .ledger(ledger)
//!     .signer(signer)
//!     .processor(processor)
//!     .configuration(configuration)
//!     .on_consensus_done(handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! - `.kv_store(...)`
//! - `.network(...)`
//! - `.ledger(...)`
//! - `.signer(...)`
//! - `.processor(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! - `.migrations(...)` and `.core_contracts(...)`, which default to no migrations and the standard core
//!   contract names.
//! - One `.on_*(...)` setter per event in [crate::events], for registering event handlers.

use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::block_sync::client::BlockSyncClient;
use crate::block_sync::server::BlockSyncServer;
use crate::cmt_log::CmtLog;
use crate::cons::instance::{Consensus, ConsensusOutcome, InstanceContext};
use crate::cons::AbortReason;
use crate::event_bus::*;
use crate::events::*;
use crate::ledger::{LedgerClient, LedgerEvent, LedgerOutput};
use crate::mempool::{actor::start_mempool, Mempool, MempoolError, MempoolHandle};
use crate::networking::{start_polling, ConsensusMessageStub, Network};
use crate::signer::ThresholdSigner;
use crate::state::{Block, KVStore, Store, StoreError};
use crate::state_manager::StateManager;
use crate::types::{
    anchor::AliasOutputWithID,
    committee::Committee,
    data_types::{BufferSize, ChainID, LogIndex, NodeID},
    request::{Request, RequestID},
    update_sets::StateMutations,
};
use crate::vm::{self, CoreContracts, MigrationScheme, Processor};

/// How long the driver sleeps when there is no consensus instance to tick.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// How long the driver waits before retrying a failed read of the chain's outputs.
const LEDGER_RETRY_WAIT: Duration = Duration::from_millis(500);

/// Stores the user-defined parameters required to run a chain node.
///
/// ## Round timeout
///
/// `round_timeout` bounds every phase of a consensus instance after the batch proposal is sent, including
/// the wait for the ledger to confirm the anchoring transaction. Durations must be "well below"
/// [u64::MAX] seconds.
///
/// ## Log Events
///
/// The node logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed
/// onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.chain_id(...)`
    - `.committee(...)`
    - `.round_timeout(...)`
    - `.round_retry_delay(...)`
    - `.max_requests_per_batch(...)`
    - `.consensus_msg_buffer_capacity(...)`
    - `.block_sync_response_timeout(...)`
    - `.log_events(...)`

    Optional:
    - `.pruning_min_states_to_keep(...)`
    - `.pruning_max_states_to_delete(...)`
    - `.request_expiry_window(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the node's keypair, used to sign network messages. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the ID of the chain. Required."))]
    pub chain_id: ChainID,
    #[builder(setter(doc = "Set the committee that runs the chain. The node must be a member. Required."))]
    pub committee: Committee,
    #[builder(setter(doc = "Set the time a consensus instance may take after proposing its batch. Required."))]
    pub round_timeout: Duration,
    #[builder(setter(doc = "Set how long to wait before retrying a round that failed. Required."))]
    pub round_retry_delay: Duration,
    #[builder(setter(doc = "Set the maximum number of requests a node proposes for one batch. Required."))]
    pub max_requests_per_batch: usize,
    #[builder(setter(doc = "Set the maximum number of bytes of consensus messages for future rounds that are buffered. Required."))]
    pub consensus_msg_buffer_capacity: BufferSize,
    #[builder(default = 10000, setter(doc = "Set how many states below the latest one are kept before pruning. Optional, defaults to 10000."))]
    pub pruning_min_states_to_keep: u32,
    #[builder(default = 10, setter(doc = "Set the maximum number of states pruned after one commit. Optional, defaults to 10."))]
    pub pruning_max_states_to_delete: u32,
    #[builder(setter(doc = "Set the timeout for receiving a block from a peer when syncing. Required."))]
    pub block_sync_response_timeout: Duration,
    #[builder(default = Duration::from_secs(60), setter(doc = "Set how long an off-ledger request stays valid after its timestamp. Optional, defaults to 60 seconds."))]
    pub request_expiry_window: Duration,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run a [Chain] node.
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ChainSpec]. On the builder call the following methods to construct a valid [ChainSpec].

    Required:
    - `.kv_store(...)`
    - `.network(...)`
    - `.ledger(...)`
    - `.signer(...)`
    - `.processor(...)`
    - `.configuration(...)`

    Optional:
    - `.migrations(...)`
    - `.core_contracts(...)`
    - `.on_commit_block(...)`
    - `.on_prune_block(...)`
    - `.on_start_consensus(...)`
    - `.on_propose_batch(...)`
    - `.on_decide_batch(...)`
    - `.on_consensus_done(...)`
    - `.on_consensus_skipped(...)`
    - `.on_consensus_aborted(...)`
    - `.on_anchor_confirmed(...)`
    - `.on_reorg(...)`
    - `.on_add_request(...)`
    - `.on_remove_requests(...)`
    - `.on_start_sync(...)`
    - `.on_end_sync(...)`
"))]
pub struct ChainSpec<K: KVStore, N: Network + 'static, L: LedgerClient, S: ThresholdSigner, P: Processor> {
    // Required parameters
    #[builder(setter(doc = "Set the implementation of the node's Key-Value store. The store must be initialized with [Chain::initialize]. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. Required."))]
    network: N,
    #[builder(setter(doc = "Set the client of the base ledger that anchors the chain. Required."))]
    ledger: L,
    #[builder(setter(doc = "Set the node's share of the committee's threshold signing key. Required."))]
    signer: S,
    #[builder(setter(doc = "Set the processor that executes calls to user contracts. Required."))]
    processor: P,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a node. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(doc = "Set the state migrations that upgrade older states. Optional."))]
    migrations: MigrationScheme,
    #[builder(default, setter(doc = "Set the names of the core contracts. Optional."))]
    core_contracts: CoreContracts,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is committed to the store. Optional."))]
    on_commit_block: Option<HandlerPtr<CommitBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PruneBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PruneBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is pruned from the store. Optional."))]
    on_prune_block: Option<HandlerPtr<PruneBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartConsensusEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartConsensusEvent>),
    doc = "Register a handler closure to be invoked after a consensus instance starts. Optional."))]
    on_start_consensus: Option<HandlerPtr<StartConsensusEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeBatchEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeBatchEvent>),
    doc = "Register a handler closure to be invoked after the node proposes a batch. Optional."))]
    on_propose_batch: Option<HandlerPtr<ProposeBatchEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DecideBatchEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DecideBatchEvent>),
    doc = "Register a handler closure to be invoked after the committee decides on a batch. Optional."))]
    on_decide_batch: Option<HandlerPtr<DecideBatchEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ConsensusDoneEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ConsensusDoneEvent>),
    doc = "Register a handler closure to be invoked after a consensus instance commits a block and anchors it. Optional."))]
    on_consensus_done: Option<HandlerPtr<ConsensusDoneEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ConsensusSkippedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ConsensusSkippedEvent>),
    doc = "Register a handler closure to be invoked after a consensus instance decides on a batch with nothing to process. Optional."))]
    on_consensus_skipped: Option<HandlerPtr<ConsensusSkippedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ConsensusAbortedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ConsensusAbortedEvent>),
    doc = "Register a handler closure to be invoked after a consensus instance aborts. Optional."))]
    on_consensus_aborted: Option<HandlerPtr<ConsensusAbortedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AnchorConfirmedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AnchorConfirmedEvent>),
    doc = "Register a handler closure to be invoked after the ledger confirms a new anchor. Optional."))]
    on_anchor_confirmed: Option<HandlerPtr<AnchorConfirmedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReorgEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReorgEvent>),
    doc = "Register a handler closure to be invoked after the ledger confirms an anchor that does not build on the assumed tip. Optional."))]
    on_reorg: Option<HandlerPtr<ReorgEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AddRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AddRequestEvent>),
    doc = "Register a handler closure to be invoked after a request is added to the mempool. Optional."))]
    on_add_request: Option<HandlerPtr<AddRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RemoveRequestsEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RemoveRequestsEvent>),
    doc = "Register a handler closure to be invoked after requests are removed from the mempool. Optional."))]
    on_remove_requests: Option<HandlerPtr<RemoveRequestsEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartSyncEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartSyncEvent>),
    doc = "Register a handler closure to be invoked after the node starts fetching missing blocks. Optional."))]
    on_start_sync: Option<HandlerPtr<StartSyncEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EndSyncEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EndSyncEvent>),
    doc = "Register a handler closure to be invoked after the node finishes fetching missing blocks. Optional."))]
    on_end_sync: Option<HandlerPtr<EndSyncEvent>>,
}

impl<K: KVStore, N: Network + 'static, L: LedgerClient, S: ThresholdSigner, P: Processor> ChainSpec<K, N, L, S, P> {
    /// Starts all threads and channels associated with running a chain node, and returns the handles to
    /// them in a [Chain] struct.
    pub fn start(mut self) -> Result<Chain<K>, ChainStartError> {
        let config = self.configuration;
        let me = NodeID::from(&config.me.verifying_key());
        if !config.committee.contains(&me) {
            return Err(ChainStartError::NotACommitteeMember { node: me });
        }
        let store = Store::new(self.kv_store.clone());
        if !store.is_initialized()? {
            return Err(ChainStartError::StoreNotInitialized);
        }
        self.network.init_committee(config.committee.clone());

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, polled) = start_polling(self.network.clone(), poller_shutdown_receiver);

        let event_handlers = EventHandlers::new(
            config.log_events,
            self.on_commit_block,
            self.on_prune_block,
            self.on_start_consensus,
            self.on_propose_batch,
            self.on_decide_batch,
            self.on_consensus_done,
            self.on_consensus_skipped,
            self.on_consensus_aborted,
            self.on_anchor_confirmed,
            self.on_reorg,
            self.on_add_request,
            self.on_remove_requests,
            self.on_start_sync,
            self.on_end_sync,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (mempool_inputs, mempool_inputs_receiver) = mpsc::channel();
        let mempool = MempoolHandle::new(mempool_inputs);
        let (mempool_shutdown, mempool_shutdown_receiver) = mpsc::channel();
        let mempool_thread = start_mempool(
            config.chain_id,
            Mempool::new(config.chain_id, config.request_expiry_window),
            mempool_inputs_receiver,
            polled.mempool,
            self.network.clone(),
            mempool_shutdown_receiver,
            event_publisher.clone(),
        );

        let (block_sync_server_shutdown, block_sync_server_shutdown_receiver) = mpsc::channel();
        let block_sync_server = BlockSyncServer::new(
            config.chain_id,
            store.clone(),
            polled.block_requests,
            self.network.clone(),
            block_sync_server_shutdown_receiver,
        )
        .start();

        let peers: Vec<NodeID> = config.committee.members().filter(|member| **member != me).copied().collect();
        let (driver_shutdown, driver_shutdown_receiver) = mpsc::channel();
        let driver = ChainDriver {
            me,
            cmt_log: CmtLog::new(config.round_retry_delay, event_publisher.clone()),
            state_manager: StateManager::new(
                store.clone(),
                config.pruning_min_states_to_keep,
                config.pruning_max_states_to_delete,
                event_publisher.clone(),
            ),
            stub: ConsensusMessageStub::new(
                self.network.clone(),
                polled.consensus,
                config.consensus_msg_buffer_capacity,
            ),
            block_sync: BlockSyncClient::new(
                config.chain_id,
                peers,
                self.network.clone(),
                polled.block_responses,
                config.block_sync_response_timeout,
            ),
            mempool: mempool.clone(),
            ledger: self.ledger,
            signer: self.signer,
            processor: self.processor,
            migrations: self.migrations,
            core_contracts: self.core_contracts,
            instance: None,
            ledger_loaded: false,
            config,
            shutdown_signal: driver_shutdown_receiver,
            event_publisher,
        }
        .start();

        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let event_bus = match (event_subscriber, event_bus_shutdown_receiver) {
            (Some(event_subscriber), Some(shutdown_receiver)) => {
                Some(start_event_bus(event_handlers, event_subscriber, shutdown_receiver))
            }
            _ => None,
        };

        Ok(Chain {
            store,
            mempool,
            poller: Some(poller),
            poller_shutdown,
            mempool_thread: Some(mempool_thread),
            mempool_shutdown,
            block_sync_server: Some(block_sync_server),
            block_sync_server_shutdown,
            driver: Some(driver),
            driver_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A handle to the background threads of a chain node. When this value is dropped, all background threads
/// are gracefully shut down.
pub struct Chain<K: KVStore> {
    store: Store<K>,
    mempool: MempoolHandle,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    mempool_thread: Option<JoinHandle<()>>,
    mempool_shutdown: Sender<()>,
    block_sync_server: Option<JoinHandle<()>>,
    block_sync_server_shutdown: Sender<()>,
    driver: Option<JoinHandle<()>>,
    driver_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<K: KVStore> Chain<K> {
    /// Initializes the node's [Store] with the origin state of the chain. Every node of a committee must
    /// be initialized with the same `initial_state`. Initializing an initialized store returns its origin
    /// block.
    pub fn initialize(kv_store: K, initial_state: StateMutations) -> Result<Block, StoreError> {
        Store::new(kv_store).initialize(initial_state)
    }

    /// A read handle to the node's [Store].
    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    /// Submit requests to the chain. Off-ledger requests are shared with the rest of the committee.
    pub fn submit_requests(&self, requests: Vec<Request>) -> Result<(), MempoolError> {
        self.mempool.submit_requests(requests)
    }
}

impl<K: KVStore> Drop for Chain<K> {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important, as the threads make assumptions
        // about the validity of their channels based on this. The driver sends inputs to the mempool, and
        // every thread but the event bus receives messages from the poller.

        self.event_bus_shutdown.iter().for_each(|shutdown| shutdown.send(()).unwrap());
        if self.event_bus.is_some() {
            self.event_bus.take().unwrap().join().unwrap();
        }

        self.driver_shutdown.send(()).unwrap();
        self.driver.take().unwrap().join().unwrap();

        self.block_sync_server_shutdown.send(()).unwrap();
        self.block_sync_server.take().unwrap().join().unwrap();

        self.mempool_shutdown.send(()).unwrap();
        self.mempool_thread.take().unwrap().join().unwrap();

        self.poller_shutdown.send(()).unwrap();
        self.poller.take().unwrap().join().unwrap();
    }
}

#[derive(Debug)]
pub enum ChainStartError {
    /// The node's key is not in the configured committee.
    NotACommitteeMember { node: NodeID },
    /// [Chain::initialize] was never called on the store.
    StoreNotInitialized,
    StoreError(StoreError),
}

impl Display for ChainStartError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChainStartError::NotACommitteeMember { node } => write!(f, "{} is not a member of the committee", node),
            ChainStartError::StoreNotInitialized => write!(f, "store not initialized"),
            ChainStartError::StoreError(err) => Display::fmt(err, f),
        }
    }
}

impl From<StoreError> for ChainStartError {
    fn from(value: StoreError) -> Self {
        ChainStartError::StoreError(value)
    }
}

/* ↓↓↓ Driver ↓↓↓ */

/// The owner of a node's consensus state. Runs in its own thread and, in every iteration of its loop:
/// 1. Feeds the events of the ledger to the committee log, the state manager, and the mempool.
/// 2. Starts a consensus instance when the committee log has a round to run.
/// 3. Replaces the instance if enough peers moved on to a later attempt on the same state.
/// 4. Ticks the instance, and reports its outcome to the committee log.
struct ChainDriver<K: KVStore, N: Network, L: LedgerClient, S: ThresholdSigner, P: Processor> {
    config: Configuration,
    me: NodeID,
    cmt_log: CmtLog,
    state_manager: StateManager<K>,
    stub: ConsensusMessageStub<N>,
    block_sync: BlockSyncClient<N>,
    mempool: MempoolHandle,
    ledger: L,
    signer: S,
    processor: P,
    migrations: MigrationScheme,
    core_contracts: CoreContracts,
    instance: Option<Consensus>,
    ledger_loaded: bool,
    shutdown_signal: Receiver<()>,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore, N: Network + 'static, L: LedgerClient, S: ThresholdSigner, P: Processor> ChainDriver<K, N, L, S, P> {
    fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => panic!("Driver thread disconnected from main thread"),
            }

            if !self.ledger_loaded {
                self.load_ledger_outputs();
                if !self.ledger_loaded {
                    thread::sleep(LEDGER_RETRY_WAIT);
                    continue;
                }
            }
            self.handle_ledger_events();
            self.drive_consensus();
        })
    }

    /* ↓↓↓ Ledger ↓↓↓ */

    /// Read the chain's outputs: its current anchor and the on-ledger requests waiting to be processed.
    fn load_ledger_outputs(&mut self) {
        let outputs = match self.ledger.output_map(&self.config.committee.address()) {
            Ok(outputs) => outputs,
            Err(err) => {
                log::warn!("Driver: failed to read the chain's outputs from the ledger: {}", err);
                return;
            }
        };

        let mut requests = Vec::new();
        let mut anchor = None;
        for output in outputs.into_values() {
            match output {
                LedgerOutput::Alias(alias_output) => anchor = Some(alias_output),
                LedgerOutput::Request(request) => requests.push(Request::OnLedger(request)),
            }
        }
        if let Some(anchor) = anchor {
            self.on_alias_output_confirmed(anchor);
        }
        connected(self.mempool.add_ledger_requests(requests));
        self.ledger_loaded = true;
    }

    fn handle_ledger_events(&mut self) {
        while let Some(event) = self.ledger.recv_event() {
            match event {
                LedgerEvent::AliasOutputConfirmed(alias_output) => self.on_alias_output_confirmed(alias_output),
                LedgerEvent::AliasOutputRejected(alias_output) => {
                    log::warn!(
                        "Driver: the ledger rejected anchor for state index {}",
                        alias_output.state_index()
                    );
                    self.cmt_log.alias_output_rejected(&alias_output);
                }
                LedgerEvent::RequestReceived(request) => {
                    connected(self.mempool.add_ledger_requests(vec![Request::OnLedger(request)]))
                }
                LedgerEvent::OutputConsumed(output_id) => {
                    connected(self.mempool.remove_by_ids(vec![RequestID::of_output(&output_id)]))
                }
            }
        }
    }

    fn on_alias_output_confirmed(&mut self, alias_output: AliasOutputWithID) {
        if self.update_state(&alias_output) {
            Event::publish(
                &self.event_publisher,
                Event::AnchorConfirmed(AnchorConfirmedEvent {
                    timestamp: SystemTime::now(),
                    alias_output: alias_output.output_id,
                    state_index: alias_output.state_index(),
                }),
            );
            self.remove_processed_requests(&alias_output);
        }

        let cancelled = match self.cmt_log.alias_output_confirmed(alias_output.clone()) {
            Some(cancelled) => cancelled,
            None => return,
        };
        if self.instance.as_ref().map(Consensus::log_index) != Some(cancelled) {
            return;
        }
        if let Some(mut instance) = self.instance.take() {
            // The confirmed anchor may be the one this instance was waiting for.
            match instance.completed_by(&alias_output) {
                Some(outcome) => self.report(cancelled, outcome),
                None => self.publish_aborted(cancelled, AbortReason::Superseded),
            }
        }
    }

    /// Make the block of a confirmed anchor the latest block, fetching it from peers if it is missing.
    /// Returns whether the block is stored.
    fn update_state(&mut self, alias_output: &AliasOutputWithID) -> bool {
        if let Err(err) = self.state_manager.sync_to(alias_output, &mut self.block_sync) {
            log::warn!(
                "Driver: failed to sync to the block of anchor at state index {}: {}",
                alias_output.state_index(),
                err
            );
            return false;
        }
        match self.state_manager.on_anchor_confirmed(alias_output) {
            Ok(()) => true,
            Err(err) => {
                log::error!("Driver: failed to record the confirmed anchor: {}", err);
                false
            }
        }
    }

    fn remove_processed_requests(&self, alias_output: &AliasOutputWithID) {
        let commitment = alias_output.l1_commitment();
        let processed = self
            .state_manager
            .store()
            .state_by_trie_root(&commitment.trie_root)
            .and_then(|state| vm::blocklog::requests_in_block(&state, &self.core_contracts, alias_output.state_index()));
        match processed {
            Ok(requests) if !requests.is_empty() => connected(self.mempool.remove_finalized(requests)),
            Ok(_) => (),
            Err(err) => log::warn!("Driver: failed to read the requests of block {}: {}", commitment, err),
        }
    }

    /* ↓↓↓ Consensus ↓↓↓ */

    fn drive_consensus(&mut self) {
        if self.instance.is_none() {
            match self.cmt_log.next_round(Instant::now()) {
                Some((log_index, base)) => self.start_instance(log_index, base),
                None => {
                    thread::sleep(IDLE_WAIT);
                    return;
                }
            }
        }

        self.catch_up();

        let outcome = match self.instance.as_mut() {
            Some(instance) => {
                let mut ctx = InstanceContext {
                    config: &self.config,
                    committee: &self.config.committee,
                    state_manager: &mut self.state_manager,
                    stub: &mut self.stub,
                    block_sync: &mut self.block_sync,
                    mempool: &self.mempool,
                    ledger: &self.ledger,
                    signer: &mut self.signer,
                    processor: &self.processor,
                    migrations: &self.migrations,
                    core_contracts: &self.core_contracts,
                    event_publisher: &self.event_publisher,
                };
                instance.tick(&mut ctx).map(|outcome| (instance.log_index(), outcome))
            }
            None => None,
        };

        if let Some((log_index, outcome)) = outcome {
            self.instance = None;
            self.report(log_index, outcome);
        }
    }

    fn start_instance(&mut self, log_index: LogIndex, base: AliasOutputWithID) {
        self.instance = Consensus::new(
            self.config.chain_id,
            log_index,
            base,
            self.me,
            &self.config.committee,
            &self.event_publisher,
        );
    }

    /// Move to a later attempt on the same state if at least `f + 1` peers are already running it, since at
    /// least one honest peer gave up on the current attempt.
    fn catch_up(&mut self) {
        let current = match &self.instance {
            Some(instance) => instance.log_index(),
            None => return,
        };
        let target = match self.stub.peers_ahead(current, self.config.committee.f() + 1) {
            Some(target) => target,
            None => return,
        };
        if let Some((log_index, base)) = self.cmt_log.catch_up(target) {
            log::info!("Driver: catching up from log index {} to {}", current, log_index);
            self.instance = None;
            self.publish_aborted(current, AbortReason::Superseded);
            self.start_instance(log_index, base);
        }
    }

    fn report(&mut self, log_index: LogIndex, outcome: ConsensusOutcome) {
        match outcome {
            ConsensusOutcome::Completed {
                block,
                transaction,
                next_alias_output,
                request_count,
                gas_burned,
            } => {
                log::info!(
                    "Driver: log index {} anchored block {} with {} requests",
                    log_index,
                    block.l1_commitment(),
                    request_count
                );
                Event::publish(
                    &self.event_publisher,
                    Event::ConsensusDone(ConsensusDoneEvent {
                        timestamp: SystemTime::now(),
                        log_index,
                        block: block.l1_commitment(),
                        transaction: transaction.id(),
                        request_count,
                        gas_burned,
                    }),
                );
                self.cmt_log.consensus_completed(log_index, next_alias_output);
            }
            ConsensusOutcome::Skipped => {
                Event::publish(
                    &self.event_publisher,
                    Event::ConsensusSkipped(ConsensusSkippedEvent {
                        timestamp: SystemTime::now(),
                        log_index,
                    }),
                );
                self.cmt_log.consensus_failed(log_index, false, Instant::now());
            }
            ConsensusOutcome::Aborted(reason) => {
                let fatal = reason.is_fatal();
                if fatal {
                    log::error!("Driver: log index {} aborted, halting the chain: {}", log_index, reason);
                } else {
                    log::warn!("Driver: log index {} aborted: {}", log_index, reason);
                }
                self.cmt_log.consensus_failed(log_index, fatal, Instant::now());
                self.publish_aborted(log_index, reason);
            }
        }
    }

    fn publish_aborted(&self, log_index: LogIndex, reason: AbortReason) {
        Event::publish(
            &self.event_publisher,
            Event::ConsensusAborted(ConsensusAbortedEvent {
                timestamp: SystemTime::now(),
                log_index,
                reason,
            }),
        );
    }
}

// Safety: the driver shuts down before the mempool thread, so the mempool handle it holds is never
// disconnected while it runs.
fn connected(result: Result<(), MempoolError>) {
    if let Err(MempoolError::Disconnected) = result {
        panic!("Driver thread disconnected from the mempool")
    }
}
