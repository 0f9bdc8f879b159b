//! End-to-end tests of committees of chain nodes that share a mock base ledger and talk over a mock
//! network.
//!
//! Every test waits for the nodes to reach some state with a generous timeout, since rounds run on the
//! nodes' own threads.

use std::{
    thread,
    time::{Duration, Instant},
};

use log::LevelFilter;

use anchor_chain::types::{
    anchor::{OutputID, TransactionID},
    data_types::{CryptoHash, GasUnits, StateIndex},
    request::{AgentID, Assets, OnLedgerRequest, Params},
};

mod common;

use common::{
    counter::{increment, CounterCall},
    logging::{log_with_context, setup_logger},
    node::{user_keypair, CommitteeSetup, Node, CHAIN_ID},
};

const WAIT_LIMIT: Duration = Duration::from_secs(60);

/// Poll `condition` until it holds, or fail the test after [`WAIT_LIMIT`].
fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > WAIT_LIMIT {
            panic!("timed out waiting until {}", what);
        }
        thread::sleep(Duration::from_millis(100));
    }
    log_with_context(None, what);
}

/// Submit one increment from each of `count` new users to `node`.
fn submit_increments(node: &Node, count: usize) {
    let requests = (0..count).map(|_| increment(&user_keypair(), CHAIN_ID, 0)).collect();
    node.submit(requests);
}

#[test]
fn committee_processes_off_ledger_requests() {
    setup_logger(LevelFilter::Info);
    let setup = CommitteeSetup::new(4);
    let nodes: Vec<Node> = (0..4).map(|i| setup.start(i)).collect();

    // Requests submitted to one node are shared with the rest of the committee.
    submit_increments(&nodes[0], 5);
    wait_until("every node counted 5 increments", || {
        nodes.iter().all(|node| node.number() == 5)
    });

    let anchor = setup.ledger.anchor();
    assert!(anchor.state_index() >= StateIndex::new(1));
    for node in &nodes {
        wait_until("every node follows the ledger's anchor", || {
            node.latest_state_index() == anchor.state_index()
        });
    }
    assert!(nodes.iter().any(|node| !node.consensus_done().is_empty()));

    // The chain keeps going on top of its own blocks.
    submit_increments(&nodes[2], 3);
    wait_until("every node counted 8 increments", || {
        nodes.iter().all(|node| node.number() == 8)
    });
    assert!(setup.ledger.anchor().state_index() > anchor.state_index());
}

#[test]
fn committee_consumes_on_ledger_requests() {
    setup_logger(LevelFilter::Info);
    let setup = CommitteeSetup::new(4);
    let nodes: Vec<Node> = (0..4).map(|i| setup.start(i)).collect();

    let deposit = |index: u16, by: u64| OnLedgerRequest {
        output_id: OutputID::new(TransactionID(CryptoHash::of(&[b"deposits"])), index),
        sender: AgentID::Key(user_keypair().node_id()),
        target: CounterCall::Increment.target(),
        params: Params::new().with(b"by", &by.to_le_bytes()),
        assets: Assets { base_tokens: 100 },
        allowance: Assets::default(),
        gas_budget: GasUnits::new(100_000),
        time_lock: None,
        expiration: None,
    };
    setup.ledger.send_request(deposit(0, 3));
    setup.ledger.send_request(deposit(1, 4));

    wait_until("every node counted both deposits", || {
        nodes.iter().all(|node| node.number() == 7)
    });
    wait_until("the ledger consumed both request outputs", || {
        setup.ledger.pending_requests() == 0
    });
}

#[test]
fn late_node_syncs_missing_blocks() {
    setup_logger(LevelFilter::Info);
    let setup = CommitteeSetup::new(4);

    // Three of four nodes are enough for the committee to make progress.
    let mut nodes: Vec<Node> = (0..3).map(|i| setup.start(i)).collect();
    submit_increments(&nodes[0], 3);
    wait_until("the running nodes counted 3 increments", || {
        nodes.iter().all(|node| node.number() == 3)
    });

    let late = setup.start(3);
    wait_until("the late node fetched the blocks it missed", || late.number() == 3);
    assert!(late.blocks_synced() >= 1);
    nodes.push(late);

    submit_increments(&nodes[3], 2);
    wait_until("every node counted 5 increments", || {
        nodes.iter().all(|node| node.number() == 5)
    });
}

#[test]
fn offline_node_catches_up_when_back_online() {
    setup_logger(LevelFilter::Info);
    let setup = CommitteeSetup::new(4);
    let nodes: Vec<Node> = (0..4).map(|i| setup.start(i)).collect();

    nodes[3].network().set_online(false);
    submit_increments(&nodes[0], 2);
    wait_until("the online nodes counted 2 increments", || {
        nodes[..3].iter().all(|node| node.number() == 2)
    });
    assert_eq!(nodes[3].number(), 0);

    // The next anchor makes the returning node fetch every block it missed.
    nodes[3].network().set_online(true);
    submit_increments(&nodes[1], 1);
    wait_until("every node counted 3 increments", || {
        nodes.iter().all(|node| node.number() == 3)
    });
}
