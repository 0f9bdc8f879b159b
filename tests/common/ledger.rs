//! A mock base ledger shared by all nodes of a test, and the per-node clients that talk to it.
//!
//! The ledger holds one anchor and the request outputs sent to the chain. It confirms a transaction if
//! the transaction consumes the current anchor and carries the committee's signature, and then notifies
//! every client.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    time::Duration,
};

use anchor_chain::{
    ledger::{LedgerClient, LedgerError, LedgerEvent, LedgerOutput},
    types::{
        anchor::{Address, AliasOutput, AliasOutputWithID, L1Commitment, OutputID, TransactionID},
        data_types::{CryptoHash, StateIndex},
        request::OnLedgerRequest,
        transaction::Transaction,
    },
};

use super::signer::MockSigner;

struct LedgerState {
    anchor: AliasOutputWithID,
    requests: BTreeMap<OutputID, OnLedgerRequest>,
    confirmed: HashMap<TransactionID, AliasOutputWithID>,
    subscribers: Vec<Sender<LedgerEvent>>,
}

#[derive(Clone)]
pub(crate) struct MockLedger {
    state: Arc<Mutex<LedgerState>>,
    committee_secret: [u8; 32],
}

impl MockLedger {
    /// Create a ledger whose first anchor for the chain controlled by `address` commits to `origin`, the
    /// l1 commitment of the chain's origin block.
    pub(crate) fn new(
        address: Address,
        origin: L1Commitment,
        committee_secret: [u8; 32],
    ) -> MockLedger {
        let anchor = AliasOutputWithID::new(
            OutputID::new(TransactionID(CryptoHash::of(&[b"origin"])), 0),
            AliasOutput {
                state_index: StateIndex::new(0),
                state_metadata: origin,
                state_controller: address,
                governor: address,
                amount: 1_000_000,
            },
        );
        MockLedger {
            state: Arc::new(Mutex::new(LedgerState {
                anchor,
                requests: BTreeMap::new(),
                confirmed: HashMap::new(),
                subscribers: Vec::new(),
            })),
            committee_secret,
        }
    }

    /// A client for one node. The client receives every event published after it was created.
    pub(crate) fn client(&self) -> MockLedgerClient {
        let (sender, receiver) = mpsc::channel();
        self.state.lock().unwrap().subscribers.push(sender);
        MockLedgerClient {
            ledger: self.clone(),
            events: Arc::new(Mutex::new(receiver)),
        }
    }

    pub(crate) fn anchor(&self) -> AliasOutputWithID {
        self.state.lock().unwrap().anchor.clone()
    }

    /// Send an on-ledger request to the chain.
    pub(crate) fn send_request(&self, request: OnLedgerRequest) {
        let mut state = self.state.lock().unwrap();
        state.requests.insert(request.output_id, request.clone());
        publish(&mut state, LedgerEvent::RequestReceived(request));
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    fn post(&self, transaction: Transaction) -> Result<AliasOutputWithID, LedgerError> {
        let mut state = self.state.lock().unwrap();
        let id = transaction.id();
        if let Some(confirmed) = state.confirmed.get(&id) {
            return Ok(confirmed.clone());
        }

        let expected = MockSigner::signature(&self.committee_secret, &transaction.essence.signing_message());
        if transaction.signature != expected {
            return Err(LedgerError::InvalidTransaction(String::from("bad signature")));
        }
        if transaction.essence.inputs.first() != Some(&state.anchor.output_id) {
            return Err(LedgerError::Conflict);
        }
        let next = transaction
            .essence
            .next_anchor()
            .ok_or_else(|| LedgerError::InvalidTransaction(String::from("no anchor output")))?;

        for input in &transaction.essence.inputs[1..] {
            if state.requests.remove(input).is_some() {
                publish(&mut state, LedgerEvent::OutputConsumed(*input));
            }
        }
        state.anchor = next.clone();
        state.confirmed.insert(id, next.clone());
        publish(&mut state, LedgerEvent::AliasOutputConfirmed(next.clone()));
        Ok(next)
    }
}

fn publish(state: &mut LedgerState, event: LedgerEvent) {
    state.subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
}

#[derive(Clone)]
pub(crate) struct MockLedgerClient {
    ledger: MockLedger,
    events: Arc<Mutex<Receiver<LedgerEvent>>>,
}

impl LedgerClient for MockLedgerClient {
    fn output_map(&self, address: &Address) -> Result<BTreeMap<OutputID, LedgerOutput>, LedgerError> {
        let state = self.ledger.state.lock().unwrap();
        let mut outputs = BTreeMap::new();
        if state.anchor.output.state_controller == *address {
            outputs.insert(state.anchor.output_id, LedgerOutput::Alias(state.anchor.clone()));
        }
        for (output_id, request) in &state.requests {
            outputs.insert(*output_id, LedgerOutput::Request(request.clone()));
        }
        Ok(outputs)
    }

    fn post_tx_and_wait_until_confirmation(
        &self,
        transaction: Transaction,
        _timeout: Duration,
    ) -> Result<AliasOutputWithID, LedgerError> {
        self.ledger.post(transaction)
    }

    fn recv_event(&mut self) -> Option<LedgerEvent> {
        self.events.lock().unwrap().try_recv().ok()
    }
}
