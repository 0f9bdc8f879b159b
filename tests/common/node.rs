use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;

use anchor_chain::{
    chain::{Chain, ChainSpec, Configuration},
    events::{AnchorConfirmedEvent, ConsensusAbortedEvent, ConsensusDoneEvent, EndSyncEvent},
    types::{
        anchor::Address,
        committee::Committee,
        crypto_primitives::Keypair,
        data_types::{BufferSize, ChainID, CryptoHash, NodeID, StateIndex},
        request::Request,
        update_sets::StateMutations,
    },
};

use super::{
    counter::{counter_value, CounterProcessor},
    ledger::MockLedger,
    logging::{first_seven_base64_chars, log_with_context},
    mem_db::MemDB,
    network::{mock_network, NetworkStub},
    signer::MockSigner,
};

pub(crate) const CHAIN_ID: ChainID = ChainID::new([7; 32]);

/// Things the Nodes will have in common:
/// - Committee.
/// - Initial state.
/// - Base ledger.
///
/// Things that they will differ in:
/// - Network instance.
/// - KVStore.
/// - Keypair.
pub(crate) struct Node {
    network: NetworkStub,
    chain: Chain<MemDB>,
    done: Arc<Mutex<Vec<StateIndex>>>,
    blocks_synced: Arc<Mutex<u64>>,
}

impl Node {
    pub(crate) fn new(
        keypair: SigningKey,
        network: NetworkStub,
        ledger: &MockLedger,
        signer: MockSigner,
        committee: Committee,
    ) -> Node {
        let kv_store = MemDB::new();
        Chain::initialize(kv_store.clone(), StateMutations::new()).unwrap();

        let node_id = NodeID::from(keypair.verifying_key());
        let done = Arc::new(Mutex::new(Vec::new()));
        let blocks_synced = Arc::new(Mutex::new(0));

        let configuration = Configuration::builder()
            .me(keypair)
            .chain_id(CHAIN_ID)
            .committee(committee)
            .round_timeout(Duration::from_secs(10))
            .round_retry_delay(Duration::from_millis(200))
            .max_requests_per_batch(50)
            .consensus_msg_buffer_capacity(BufferSize::new(1 << 20))
            .block_sync_response_timeout(Duration::from_secs(3))
            .log_events(false)
            .build();

        let chain = ChainSpec::builder()
            .kv_store(kv_store)
            .network(network.clone())
            .ledger(ledger.client())
            .signer(signer)
            .processor(CounterProcessor)
            .configuration(configuration)
            .on_consensus_done(consensus_done_handler(node_id, done.clone()))
            .on_consensus_aborted(consensus_aborted_handler(node_id))
            .on_anchor_confirmed(anchor_confirmed_handler(node_id))
            .on_end_sync(end_sync_handler(node_id, blocks_synced.clone()))
            .build()
            .start()
            .unwrap();

        Node {
            network,
            chain,
            done,
            blocks_synced,
        }
    }

    pub(crate) fn submit(&self, requests: Vec<Request>) {
        self.chain.submit_requests(requests).unwrap();
    }

    /// The number in the latest confirmed state.
    pub(crate) fn number(&self) -> u64 {
        counter_value(&self.chain.store().latest_state().unwrap())
    }

    pub(crate) fn latest_state_index(&self) -> StateIndex {
        self.chain.store().latest_block().unwrap().state_index
    }

    /// State indices of the blocks that consensus instances of this node anchored.
    pub(crate) fn consensus_done(&self) -> Vec<StateIndex> {
        self.done.lock().unwrap().clone()
    }

    pub(crate) fn blocks_synced(&self) -> u64 {
        *self.blocks_synced.lock().unwrap()
    }

    pub(crate) fn network(&self) -> &NetworkStub {
        &self.network
    }
}

/// Everything needed to start the nodes of one committee.
pub(crate) struct CommitteeSetup {
    pub(crate) keypairs: Vec<SigningKey>,
    pub(crate) networks: Vec<NetworkStub>,
    pub(crate) committee: Committee,
    pub(crate) ledger: MockLedger,
    pub(crate) committee_secret: [u8; 32],
}

impl CommitteeSetup {
    pub(crate) fn new(n: usize) -> CommitteeSetup {
        let mut csprg = OsRng {};
        let keypairs: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate(&mut csprg)).collect();
        let networks = mock_network(keypairs.iter().map(|kp| kp.verifying_key()));
        let address = Address(CryptoHash::of(&[b"committee"]));
        let committee = Committee::new(keypairs.iter().map(|kp| NodeID::from(kp.verifying_key())), address);
        let committee_secret = [42; 32];

        let origin = Chain::initialize(MemDB::new(), StateMutations::new()).unwrap();
        let ledger = MockLedger::new(address, origin.l1_commitment(), committee_secret);

        CommitteeSetup {
            keypairs,
            networks,
            committee,
            ledger,
            committee_secret,
        }
    }

    /// Start the node with index `i`.
    pub(crate) fn start(&self, i: usize) -> Node {
        Node::new(
            self.keypairs[i].clone(),
            self.networks[i].clone(),
            &self.ledger,
            MockSigner::new(self.committee.address(), self.committee_secret, i as u16),
            self.committee.clone(),
        )
    }
}

/// A key that signs off-ledger requests, not a committee member.
pub(crate) fn user_keypair() -> Keypair {
    let mut csprg = OsRng {};
    Keypair::new(SigningKey::generate(&mut csprg))
}

fn consensus_done_handler(
    node: NodeID,
    done: Arc<Mutex<Vec<StateIndex>>>,
) -> impl Fn(&ConsensusDoneEvent) + Send + 'static {
    move |event| {
        log_with_context(
            Some(node.bytes()),
            &format!(
                "Consensus done, log index: {}, block: {}, requests: {}",
                event.log_index,
                first_seven_base64_chars(&event.block.trie_root.bytes()),
                event.request_count
            ),
        );
        done.lock().unwrap().push(event.log_index.state_index);
    }
}

fn consensus_aborted_handler(node: NodeID) -> impl Fn(&ConsensusAbortedEvent) + Send + 'static {
    move |event| {
        log_with_context(
            Some(node.bytes()),
            &format!("Consensus aborted, log index: {}, reason: {}", event.log_index, event.reason),
        );
    }
}

fn anchor_confirmed_handler(node: NodeID) -> impl Fn(&AnchorConfirmedEvent) + Send + 'static {
    move |event| {
        log_with_context(
            Some(node.bytes()),
            &format!("Anchor confirmed, state index: {}", event.state_index),
        );
    }
}

fn end_sync_handler(node: NodeID, blocks_synced: Arc<Mutex<u64>>) -> impl Fn(&EndSyncEvent) + Send + 'static {
    move |event| {
        log_with_context(
            Some(node.bytes()),
            &format!("Synced {} blocks", event.blocks_synced),
        );
        *blocks_synced.lock().unwrap() += event.blocks_synced;
    }
}
