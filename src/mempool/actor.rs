/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The mempool actor thread, which owns a chain's [`Mempool`], and the [`MempoolHandle`] through which
//! other threads talk to it.
//!
//! Every mutation of the mempool happens on the actor thread, in the order in which the actor receives
//! its inputs, so concurrent producers (the ledger, users submitting off-ledger requests, peers) never
//! race each other. Queries carry a reply channel and block the caller until the actor answers.
//!
//! Besides serving its handle, the actor:
//! 1. Releases time-locked requests on every tick.
//! 2. Shares off-ledger requests submitted locally with the other committee members.
//! 3. Answers the [`RequestQuery`](MempoolMessage::RequestQuery) messages of peers, and accepts the
//!    payloads that peers send in response to its own queries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::events::{AddRequestEvent, Event, RemoveRequestsEvent};
use crate::networking::{Network, SenderHandle};
use crate::types::{
    data_types::{ChainID, NodeID, Timestamp},
    request::{Request, RequestID, RequestRef},
};

use super::messages::MempoolMessage;
use super::{Mempool, MempoolError};

const TICK: Duration = Duration::from_millis(10);

pub(crate) enum MempoolInput {
    /// Add requests. Off-ledger requests among them are shared with peers if `share` is set.
    AddRequests { requests: Vec<Request>, share: bool },
    Senders { reply: Sender<Vec<NodeID>> },
    /// Propose on top of a state in which the senders' accounts have `account_nonces`.
    Proposal { max: usize, account_nonces: BTreeMap<NodeID, u64>, reply: Sender<Vec<RequestRef>> },
    Requests { refs: Vec<RequestRef>, reply: Sender<(Vec<Request>, Vec<RequestRef>)> },
    Has { request_ref: RequestRef, reply: Sender<bool> },
    RemoveFinalized(Vec<Request>),
    RemoveByIds(Vec<RequestID>),
    /// Ask peers for the payloads of these refs.
    QueryMissing(Vec<RequestRef>),
}

/// A cloneable handle to the mempool actor.
#[derive(Clone)]
pub struct MempoolHandle {
    inputs: Sender<MempoolInput>,
}

impl MempoolHandle {
    pub(crate) fn new(inputs: Sender<MempoolInput>) -> Self {
        Self { inputs }
    }

    /// Submit requests received from users. Off-ledger requests are shared with the committee.
    pub fn submit_requests(&self, requests: Vec<Request>) -> Result<(), MempoolError> {
        self.send(MempoolInput::AddRequests { requests, share: true })
    }

    /// Add requests observed on the base ledger.
    pub fn add_ledger_requests(&self, requests: Vec<Request>) -> Result<(), MempoolError> {
        self.send(MempoolInput::AddRequests { requests, share: false })
    }

    /// The senders of the off-ledger requests in the mempool.
    pub fn senders(&self) -> Result<Vec<NodeID>, MempoolError> {
        let (reply, response) = mpsc::channel();
        self.send(MempoolInput::Senders { reply })?;
        response.recv().map_err(|_| MempoolError::Disconnected)
    }

    /// Select up to `max` requests to propose. `account_nonces` are the nonces of the senders' accounts in
    /// the base state. Requests whose nonces those accounts already consumed are removed.
    pub fn proposal(
        &self,
        max: usize,
        account_nonces: BTreeMap<NodeID, u64>,
    ) -> Result<Vec<RequestRef>, MempoolError> {
        let (reply, response) = mpsc::channel();
        self.send(MempoolInput::Proposal { max, account_nonces, reply })?;
        response.recv().map_err(|_| MempoolError::Disconnected)
    }

    pub fn requests(&self, refs: Vec<RequestRef>) -> Result<(Vec<Request>, Vec<RequestRef>), MempoolError> {
        let (reply, response) = mpsc::channel();
        self.send(MempoolInput::Requests { refs, reply })?;
        response.recv().map_err(|_| MempoolError::Disconnected)
    }

    pub fn has(&self, request_ref: RequestRef) -> Result<bool, MempoolError> {
        let (reply, response) = mpsc::channel();
        self.send(MempoolInput::Has { request_ref, reply })?;
        response.recv().map_err(|_| MempoolError::Disconnected)
    }

    pub fn remove_finalized(&self, requests: Vec<Request>) -> Result<(), MempoolError> {
        self.send(MempoolInput::RemoveFinalized(requests))
    }

    pub fn remove_by_ids(&self, ids: Vec<RequestID>) -> Result<(), MempoolError> {
        self.send(MempoolInput::RemoveByIds(ids))
    }

    pub fn query_missing(&self, refs: Vec<RequestRef>) -> Result<(), MempoolError> {
        self.send(MempoolInput::QueryMissing(refs))
    }

    fn send(&self, input: MempoolInput) -> Result<(), MempoolError> {
        self.inputs.send(input).map_err(|_| MempoolError::Disconnected)
    }
}

struct MempoolActor<N: Network> {
    chain_id: ChainID,
    mempool: Mempool,
    inputs: Receiver<MempoolInput>,
    peer_messages: Receiver<(NodeID, MempoolMessage)>,
    sender: SenderHandle<N>,
    awaiting: BTreeSet<RequestRef>,
    event_publisher: Option<Sender<Event>>,
}

/// Spawn the mempool actor thread.
pub(crate) fn start_mempool<N: Network + 'static>(
    chain_id: ChainID,
    mempool: Mempool,
    inputs: Receiver<MempoolInput>,
    peer_messages: Receiver<(NodeID, MempoolMessage)>,
    network: N,
    shutdown_signal: Receiver<()>,
    event_publisher: Option<Sender<Event>>,
) -> JoinHandle<()> {
    let mut actor = MempoolActor {
        chain_id,
        mempool,
        inputs,
        peer_messages,
        sender: SenderHandle::new(network),
        awaiting: BTreeSet::new(),
        event_publisher,
    };

    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Mempool thread disconnected from main thread")
            }
        }

        match actor.inputs.recv_timeout(TICK) {
            Ok(input) => actor.on_input(input),
            Err(RecvTimeoutError::Timeout) => (),
            // Every handle was dropped. Keep serving peers until shutdown.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(TICK),
        }

        while let Ok((origin, msg)) = actor.peer_messages.try_recv() {
            actor.on_peer_message(origin, msg);
        }

        actor.mempool.tick(Timestamp::now());
    })
}

impl<N: Network> MempoolActor<N> {
    fn on_input(&mut self, input: MempoolInput) {
        match input {
            MempoolInput::AddRequests { requests, share } => {
                let added = self.add_requests(requests);
                let off_ledger: Vec<Request> = added.into_iter().filter(|r| r.is_off_ledger()).collect();
                if share && !off_ledger.is_empty() {
                    self.sender.broadcast(MempoolMessage::ShareRequests {
                        chain_id: self.chain_id,
                        requests: off_ledger,
                    });
                }
            }

            MempoolInput::Senders { reply } => {
                let _ = reply.send(self.mempool.senders());
            }

            MempoolInput::Proposal { max, account_nonces, reply } => {
                let consumed = self.mempool.remove_consumed(&account_nonces);
                self.publish_removed(consumed);
                let _ = reply.send(self.mempool.proposal(Timestamp::now(), max, &account_nonces));
            }

            MempoolInput::Requests { refs, reply } => {
                let _ = reply.send(self.mempool.requests(&refs));
            }

            MempoolInput::Has { request_ref, reply } => {
                let _ = reply.send(self.mempool.has(&request_ref));
            }

            MempoolInput::RemoveFinalized(requests) => {
                for request in &requests {
                    self.awaiting.remove(&request.request_ref());
                }
                let removed = self.mempool.remove_finalized(&requests);
                self.publish_removed(removed);
            }

            MempoolInput::RemoveByIds(ids) => {
                let removed = ids.into_iter().filter(|id| self.mempool.remove_by_id(id)).collect();
                self.publish_removed(removed);
            }

            MempoolInput::QueryMissing(refs) => {
                let missing: Vec<RequestRef> = refs.into_iter().filter(|r| !self.mempool.has(r)).collect();
                if missing.is_empty() {
                    return;
                }
                log::debug!("Mempool: querying peers for {} missing requests", missing.len());
                self.awaiting.extend(missing.iter().copied());
                self.sender.broadcast(MempoolMessage::RequestQuery {
                    chain_id: self.chain_id,
                    refs: missing,
                });
            }
        }
    }

    fn on_peer_message(&mut self, origin: NodeID, msg: MempoolMessage) {
        if msg.chain_id() != self.chain_id {
            return;
        }
        match msg {
            MempoolMessage::ShareRequests { requests, .. } => {
                // On-ledger requests are only ever taken from the ledger itself.
                let off_ledger = requests.into_iter().filter(|r| r.is_off_ledger()).collect();
                self.add_requests(off_ledger);
            }

            MempoolMessage::RequestQuery { refs, .. } => {
                let (found, _) = self.mempool.requests(&refs);
                if !found.is_empty() {
                    self.sender.send(
                        &origin,
                        MempoolMessage::RequestPayloads { chain_id: self.chain_id, requests: found },
                    );
                }
            }

            MempoolMessage::RequestPayloads { requests, .. } => {
                let awaited: Vec<Request> = requests
                    .into_iter()
                    .filter(|request| self.awaiting.remove(&request.request_ref()))
                    .collect();
                self.add_requests(awaited);
            }
        }
    }

    fn add_requests(&mut self, requests: Vec<Request>) -> Vec<Request> {
        let now = Timestamp::now();
        let mut added = Vec::new();
        for request in requests {
            let request_ref = request.request_ref();
            if self.mempool.add_request(request.clone(), now) {
                Event::publish(
                    &self.event_publisher,
                    Event::AddRequest(AddRequestEvent {
                        timestamp: SystemTime::now(),
                        request: request_ref,
                    }),
                );
                added.push(request);
            }
        }
        added
    }

    fn publish_removed(&self, removed: Vec<RequestID>) {
        if !removed.is_empty() {
            Event::publish(
                &self.event_publisher,
                Event::RemoveRequests(RemoveRequestsEvent {
                    timestamp: SystemTime::now(),
                    requests: removed,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::networking::Message;
    use crate::types::{
        committee::Committee,
        crypto_primitives::{Keypair, VerifyingKey},
        data_types::{GasUnits, Hname},
        request::{Assets, CallTarget, OffLedgerRequest, OffLedgerRequestEssence, Params},
    };

    const CHAIN: ChainID = ChainID::new([3; 32]);

    #[derive(Clone, Default)]
    struct RecordingNetwork(Arc<Mutex<Vec<(Option<VerifyingKey>, Message)>>>);

    impl Network for RecordingNetwork {
        fn init_committee(&mut self, _: Committee) {}
        fn broadcast(&mut self, message: Message) {
            self.0.lock().unwrap().push((None, message))
        }
        fn send(&mut self, peer: VerifyingKey, message: Message) {
            self.0.lock().unwrap().push((Some(peer), message))
        }
        fn recv(&mut self) -> Option<(VerifyingKey, Message)> {
            None
        }
    }

    fn signed(seed: u8, nonce: u64) -> Request {
        let keypair = Keypair::new(SigningKey::from_bytes(&[seed; 32]));
        let essence = OffLedgerRequestEssence {
            chain_id: CHAIN,
            target: CallTarget::new(Hname::from_name("counter"), Hname::from_name("increment")),
            params: Params::new(),
            nonce,
            gas_budget: GasUnits::new(1_000),
            allowance: Assets::default(),
            sender: keypair.node_id(),
        };
        Request::OffLedger(OffLedgerRequest::new_signed(essence, &keypair))
    }

    struct Harness {
        handle: MempoolHandle,
        peers: Sender<(NodeID, MempoolMessage)>,
        network: RecordingNetwork,
        shutdown: Sender<()>,
        thread: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn start() -> Harness {
            let (inputs_sender, inputs) = mpsc::channel();
            let (peers, peer_messages) = mpsc::channel();
            let (shutdown, shutdown_signal) = mpsc::channel();
            let network = RecordingNetwork::default();
            let thread = start_mempool(
                CHAIN,
                Mempool::new(CHAIN, Duration::from_secs(60)),
                inputs,
                peer_messages,
                network.clone(),
                shutdown_signal,
                None,
            );
            Harness {
                handle: MempoolHandle::new(inputs_sender),
                peers,
                network,
                shutdown,
                thread: Some(thread),
            }
        }

        fn sent(&self) -> Vec<(Option<VerifyingKey>, Message)> {
            self.network.0.lock().unwrap().clone()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.send(()).unwrap();
            self.thread.take().unwrap().join().unwrap();
        }
    }

    #[test]
    fn submitted_requests_are_proposed_and_shared() {
        let harness = Harness::start();
        let request = signed(1, 0);
        harness.handle.submit_requests(vec![request.clone()]).unwrap();

        assert!(harness.handle.has(request.request_ref()).unwrap());
        let sender = harness.handle.senders().unwrap();
        assert_eq!(sender.len(), 1);
        assert_eq!(
            harness.handle.proposal(10, BTreeMap::from([(sender[0], 0)])).unwrap(),
            vec![request.request_ref()]
        );
        assert!(harness.sent().iter().any(|(to, message)| to.is_none()
            && matches!(message, Message::Mempool(MempoolMessage::ShareRequests { .. }))));

        harness.handle.remove_finalized(vec![request.clone()]).unwrap();
        assert!(!harness.handle.has(request.request_ref()).unwrap());
    }

    #[test]
    fn only_awaited_payloads_are_accepted() {
        let harness = Harness::start();
        let (awaited, unsolicited) = (signed(1, 0), signed(2, 0));
        harness.handle.query_missing(vec![awaited.request_ref()]).unwrap();

        let peer = Keypair::new(SigningKey::from_bytes(&[9; 32])).node_id();
        harness
            .peers
            .send((
                peer,
                MempoolMessage::RequestPayloads {
                    chain_id: CHAIN,
                    requests: vec![awaited.clone(), unsolicited.clone()],
                },
            ))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !harness.handle.has(awaited.request_ref()).unwrap() {
            assert!(std::time::Instant::now() < deadline, "payload was not accepted");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!harness.handle.has(unsolicited.request_ref()).unwrap());
    }

    #[test]
    fn answers_queries_of_peers() {
        let harness = Harness::start();
        let request = signed(1, 0);
        harness.handle.add_ledger_requests(vec![request.clone()]).unwrap();
        assert!(harness.handle.has(request.request_ref()).unwrap());

        let peer = Keypair::new(SigningKey::from_bytes(&[9; 32]));
        harness
            .peers
            .send((
                peer.node_id(),
                MempoolMessage::RequestQuery { chain_id: CHAIN, refs: vec![request.request_ref()] },
            ))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let answered = harness.sent().into_iter().any(|(to, message)| {
                to == Some(peer.public())
                    && message
                        == Message::Mempool(MempoolMessage::RequestPayloads {
                            chain_id: CHAIN,
                            requests: vec![request.clone()],
                        })
            });
            if answered {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "query was not answered");
            thread::sleep(Duration::from_millis(5));
        }
    }
}
