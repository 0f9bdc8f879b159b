/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for pluggable peer-to-peer networking, as well as the internal types and functions
//! that chain nodes use to interact with the network.
//!
//! Committee members are reachable by their verifying keys. Networking providers interact with the
//! chain's threads through implementations of the [Network] trait, which lets members exchange
//! consensus, mempool, and block sync messages.
//!
//! The provider must deliver messages reliably and authenticate their origin. Per-link FIFO order is
//! enough: consensus messages that arrive early are buffered by the [`ConsensusMessageStub`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::block_sync::messages::{BlockRequest, BlockResponse, BlockSyncMessage};
use crate::cons::messages::ConsensusMessage;
use crate::mempool::messages::MempoolMessage;
use crate::types::{
    committee::Committee,
    crypto_primitives::VerifyingKey,
    data_types::{BufferSize, ChainID, LogIndex, NodeID},
};

pub trait Network: Clone + Send {
    /// Informs the network provider of the committee on wake-up.
    fn init_committee(&mut self, committee: Committee);

    /// Send a message to all committee members without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: VerifyingKey, message: Message);

    /// Receive a message from any peer. Returns immediately with a None if no message is available now.
    fn recv(&mut self) -> Option<(VerifyingKey, Message)>;
}

/// Every message that chain nodes send each other.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    Consensus(ConsensusMessage),
    Mempool(MempoolMessage),
    BlockSync(BlockSyncMessage),
}

impl From<ConsensusMessage> for Message {
    fn from(value: ConsensusMessage) -> Self {
        Message::Consensus(value)
    }
}

impl From<MempoolMessage> for Message {
    fn from(value: MempoolMessage) -> Self {
        Message::Mempool(value)
    }
}

impl From<BlockSyncMessage> for Message {
    fn from(value: BlockSyncMessage) -> Self {
        Message::BlockSync(value)
    }
}

/// The receiving ends of the channels that the poller thread routes messages into.
pub(crate) struct PolledMessages {
    pub(crate) consensus: Receiver<(NodeID, ConsensusMessage)>,
    pub(crate) mempool: Receiver<(NodeID, MempoolMessage)>,
    pub(crate) block_requests: Receiver<(NodeID, BlockRequest)>,
    pub(crate) block_responses: Receiver<(NodeID, BlockResponse)>,
}

/// Spawn the poller thread, which polls the Network for messages and distributes them into receivers for
/// consensus messages, mempool messages, block sync requests, and block sync responses.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, PolledMessages) {
    let (to_consensus, consensus) = mpsc::channel();
    let (to_mempool, mempool) = mpsc::channel();
    let (to_block_requests, block_requests) = mpsc::channel();
    let (to_block_responses, block_responses) = mpsc::channel();

    let poller_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some((origin, msg)) = network.recv() {
            let origin = NodeID::from(origin);
            match msg {
                Message::Consensus(c_msg) => {
                    let _ = to_consensus.send((origin, c_msg));
                }
                Message::Mempool(m_msg) => {
                    let _ = to_mempool.send((origin, m_msg));
                }
                Message::BlockSync(BlockSyncMessage::Request(request)) => {
                    let _ = to_block_requests.send((origin, request));
                }
                Message::BlockSync(BlockSyncMessage::Response(response)) => {
                    let _ = to_block_responses.send((origin, response));
                }
            }
        } else {
            thread::yield_now()
        }
    });

    (
        poller_thread,
        PolledMessages {
            consensus,
            mempool,
            block_requests,
            block_responses,
        },
    )
}

/// A sending and receiving end for consensus messages.
///
/// This type's [ConsensusMessageStub::recv] method only returns messages for the specified current log
/// index, and caches messages for future log indices for later consumption. This keeps an instance from
/// losing the messages of peers that started it slightly earlier.
///
/// The cache is bounded by `msg_buffer_capacity` bytes. When it is full, messages for the highest log
/// indices are evicted first.
pub(crate) struct ConsensusMessageStub<N: Network> {
    network: N,
    receiver: Receiver<(NodeID, ConsensusMessage)>,
    msg_buffer_capacity: u64,
    msg_buffer: BTreeMap<LogIndex, VecDeque<(NodeID, ConsensusMessage, u64)>>,
    msg_buffer_size: u64,
    // Distinct senders of messages for each future log index, used to detect that peers moved on.
    senders_ahead: BTreeMap<LogIndex, BTreeSet<NodeID>>,
}

impl<N: Network> ConsensusMessageStub<N> {
    pub(crate) fn new(
        network: N,
        receiver: Receiver<(NodeID, ConsensusMessage)>,
        msg_buffer_capacity: BufferSize,
    ) -> ConsensusMessageStub<N> {
        Self {
            network,
            receiver,
            msg_buffer_capacity: msg_buffer_capacity.int(),
            msg_buffer: BTreeMap::new(),
            msg_buffer_size: 0,
            senders_ahead: BTreeMap::new(),
        }
    }

    /// Receive a message matching the given chain id and current log index. Messages for later log
    /// indices are cached, while messages for earlier ones are dropped immediately.
    pub(crate) fn recv(
        &mut self,
        chain_id: ChainID,
        cur_log_index: LogIndex,
        deadline: Instant,
    ) -> Result<(NodeID, ConsensusMessage), ConsensusMessageReceiveError> {
        self.discard_before(cur_log_index);

        if let Some(msg_queue) = self.msg_buffer.get_mut(&cur_log_index) {
            if let Some((sender, msg, size)) = msg_queue.pop_front() {
                self.msg_buffer_size -= size;
                return Ok((sender, msg));
            }
        }

        while Instant::now() < deadline {
            match self.receiver.recv_timeout(deadline - Instant::now()) {
                Ok((sender, msg)) => {
                    if msg.chain_id != chain_id {
                        continue;
                    }
                    if msg.log_index == cur_log_index {
                        return Ok((sender, msg));
                    } else if msg.log_index > cur_log_index {
                        self.senders_ahead.entry(msg.log_index).or_default().insert(sender);
                        self.cache(sender, msg);
                    }
                }
                Err(RecvTimeoutError::Timeout) => thread::yield_now(),

                // Safety: the driver thread (the only caller of this function) shuts down before the poller thread (the
                // sender side of this channel), so we will never be disconnected at this point.
                Err(RecvTimeoutError::Disconnected) => panic!(),
            }
        }

        Err(ConsensusMessageReceiveError::Timeout)
    }

    /// The highest log index with the same state index as `cur_log_index` and a later attempt, for which
    /// messages from at least `threshold` distinct peers have arrived.
    pub(crate) fn peers_ahead(&self, cur_log_index: LogIndex, threshold: usize) -> Option<LogIndex> {
        self.senders_ahead
            .iter()
            .rev()
            .filter(|(log_index, _)| {
                log_index.state_index == cur_log_index.state_index && **log_index > cur_log_index
            })
            .find(|(_, senders)| senders.len() >= threshold)
            .map(|(log_index, _)| *log_index)
    }

    pub(crate) fn broadcast(&mut self, msg: ConsensusMessage) {
        self.network.broadcast(Message::Consensus(msg))
    }

    fn cache(&mut self, sender: NodeID, msg: ConsensusMessage) {
        let bytes_requested = msg.try_to_vec().unwrap().len() as u64 + 32;
        let overloaded_buffer = self.msg_buffer_size + bytes_requested > self.msg_buffer_capacity;
        let lower_than_highest_cached = match self.msg_buffer.keys().next_back() {
            Some(highest) => msg.log_index < *highest,
            None => false,
        };

        // When the buffer is full, only a message for a lower log index than the highest cached one may
        // take the place of cached messages.
        if overloaded_buffer {
            if !lower_than_highest_cached {
                return;
            }
            self.remove_from_overloaded_buffer(bytes_requested);
            if self.msg_buffer_size + bytes_requested > self.msg_buffer_capacity {
                return;
            }
        }

        self.msg_buffer_size += bytes_requested;
        self.msg_buffer
            .entry(msg.log_index)
            .or_default()
            .push_back((sender, msg, bytes_requested));
    }

    fn remove_from_overloaded_buffer(&mut self, bytes_to_remove: u64) {
        let mut bytes_removed = 0;
        while bytes_removed < bytes_to_remove {
            let highest = match self.msg_buffer.keys().next_back() {
                Some(highest) => *highest,
                None => break,
            };
            if let Some(msg_queue) = self.msg_buffer.get_mut(&highest) {
                while bytes_removed < bytes_to_remove {
                    match msg_queue.pop_back() {
                        Some((_, _, size)) => {
                            bytes_removed += size;
                            self.msg_buffer_size -= size;
                        }
                        None => break,
                    }
                }
                if msg_queue.is_empty() {
                    self.msg_buffer.remove(&highest);
                }
            }
        }
    }

    fn discard_before(&mut self, cur_log_index: LogIndex) {
        let kept = self.msg_buffer.split_off(&cur_log_index);
        let discarded = std::mem::replace(&mut self.msg_buffer, kept);
        for msg_queue in discarded.values() {
            for (_, _, size) in msg_queue {
                self.msg_buffer_size -= size;
            }
        }
        self.senders_ahead = self.senders_ahead.split_off(&cur_log_index);
    }
}

pub(crate) enum ConsensusMessageReceiveError {
    Timeout,
}

/// A cloneable sending end that the mempool actor and the block sync threads use.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N) -> Self {
        Self { network }
    }

    pub(crate) fn send(&mut self, peer: &NodeID, msg: impl Into<Message>) {
        match peer.verifying_key() {
            Ok(verifying_key) => self.network.send(verifying_key, msg.into()),
            Err(_) => log::warn!("Networking: {} is not a valid verifying key", peer),
        }
    }

    pub(crate) fn broadcast(&mut self, msg: impl Into<Message>) {
        self.network.broadcast(msg.into())
    }
}
