//! Tests of the [`Store`] and the [`StateManager`] on top of it: deterministic commits, pruning with
//! shared trie nodes, retention, dead branch removal, and syncing missing blocks.

use std::collections::HashMap;

use anchor_chain::{
    block_sync::client::BlockSyncError,
    state::{paths, Block, StateReader, Store, StoreError},
    state_manager::{BlockFetcher, StateManager, StateManagerError},
    types::{
        anchor::{Address, AliasOutput, AliasOutputWithID, L1Commitment, OutputID, TransactionID},
        data_types::{CryptoHash, StateIndex, Timestamp},
        update_sets::StateMutations,
    },
};

mod common;

use common::mem_db::MemDB;

fn initial_state() -> StateMutations {
    let mut state = StateMutations::new();
    state.insert(b"greeting".to_vec(), b"hello".to_vec());
    state
}

fn initialized_store() -> (Store<MemDB>, MemDB, Block) {
    let kv_store = MemDB::new();
    let mut store = Store::new(kv_store.clone());
    let origin = store.initialize(initial_state()).unwrap();
    (store, kv_store, origin)
}

/// Commit a child of `base` that sets `key` to `value`.
fn commit_child(store: &mut Store<MemDB>, base: &Block, key: &[u8], value: &[u8], time: u64) -> Block {
    let mut draft = store
        .new_state_draft(Timestamp::from_unix_nanos(time), &base.l1_commitment())
        .unwrap();
    draft.set(key, value.to_vec());
    store.commit(draft).unwrap()
}

fn anchor_for(block: &Block) -> AliasOutputWithID {
    AliasOutputWithID::new(
        OutputID::new(TransactionID(block.hash()), 0),
        AliasOutput {
            state_index: block.state_index,
            state_metadata: block.l1_commitment(),
            state_controller: Address(CryptoHash::default()),
            governor: Address(CryptoHash::default()),
            amount: 0,
        },
    )
}

#[test]
fn initialize_is_idempotent() {
    let (mut store, _, origin) = initialized_store();

    assert!(store.is_initialized().unwrap());
    assert_eq!(origin.state_index, StateIndex::new(0));
    assert!(origin.is_origin());

    // A second initialization, even with another state, returns the existing origin.
    let mut other = StateMutations::new();
    other.insert(b"greeting".to_vec(), b"bye".to_vec());
    assert_eq!(store.initialize(other).unwrap(), origin);
    assert_eq!(
        store.latest_state().unwrap().get(b"greeting").unwrap(),
        Some(b"hello".to_vec())
    );
}

#[test]
fn commits_are_deterministic_across_stores() {
    let (mut store_a, _, origin_a) = initialized_store();
    let (mut store_b, _, origin_b) = initialized_store();
    assert_eq!(origin_a, origin_b);

    let block_a = commit_child(&mut store_a, &origin_a, b"k", b"v", 1);
    let block_b = commit_child(&mut store_b, &origin_b, b"k", b"v", 1);
    assert_eq!(block_a, block_b);
    assert_eq!(block_a.hash(), block_b.hash());

    // Committing the same draft again returns the block that is already stored.
    let again = commit_child(&mut store_a, &origin_a, b"k", b"v", 1);
    assert_eq!(again, block_a);
    assert_eq!(store_a.children(&origin_a.trie_root).unwrap(), vec![block_a.trie_root]);
}

#[test]
fn extract_block_matches_commit() {
    let (mut store, _, origin) = initialized_store();
    let mut draft = store
        .new_state_draft(Timestamp::from_unix_nanos(5), &origin.l1_commitment())
        .unwrap();
    draft.set(b"k", b"v".to_vec());

    let extracted = store.extract_block(&draft).unwrap();
    assert!(!store.has_trie_root(&extracted.trie_root).unwrap());

    let committed = store.commit(draft).unwrap();
    assert_eq!(extracted, committed);
}

#[test]
fn drafts_expose_reserved_keys() {
    let (mut store, _, origin) = initialized_store();
    let block = commit_child(&mut store, &origin, b"k", b"v", 9);
    let state = store.state_by_trie_root(&block.trie_root).unwrap();

    assert_eq!(state.block_index().unwrap(), StateIndex::new(1));
    assert_eq!(state.timestamp().unwrap(), Timestamp::from_unix_nanos(9));
    assert_eq!(state.previous_l1_commitment().unwrap(), Some(origin.l1_commitment()));
    assert_eq!(state.get(b"greeting").unwrap(), Some(b"hello".to_vec()));
    assert_eq!(state.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn draft_on_mismatched_base_fails() {
    let (store, _, origin) = initialized_store();
    let wrong = L1Commitment::new(origin.trie_root, CryptoHash::new([9; 32]));
    assert!(matches!(
        store.new_state_draft(Timestamp::default(), &wrong),
        Err(StoreError::BaseMismatch { .. })
    ));

    let missing = L1Commitment::new(CryptoHash::new([1; 32]), CryptoHash::new([2; 32]));
    assert!(matches!(
        store.new_state_draft(Timestamp::default(), &missing),
        Err(StoreError::NotFound { .. })
    ));
}

#[test]
fn pruning_keeps_shared_trie_nodes() {
    let (mut store, kv_store, origin) = initialized_store();
    let block_1 = commit_child(&mut store, &origin, b"a", b"1", 1);
    let block_2 = commit_child(&mut store, &block_1, b"b", b"2", 2);
    let nodes_before = kv_store.count_keys_with_prefix(&paths::TRIE_NODES);

    let stats = store.prune(&block_1.trie_root).unwrap();
    assert_eq!(stats.state_index, StateIndex::new(1));
    assert!(kv_store.count_keys_with_prefix(&paths::TRIE_NODES) < nodes_before);
    assert!(!store.has_trie_root(&block_1.trie_root).unwrap());
    assert_eq!(store.largest_pruned_block_index().unwrap(), Some(StateIndex::new(1)));

    // Everything block 2 references survived.
    let state = store.state_by_trie_root(&block_2.trie_root).unwrap();
    assert_eq!(state.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(state.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(state.get(b"greeting").unwrap(), Some(b"hello".to_vec()));
}

#[test]
fn state_manager_prunes_buried_states() {
    let (store, _, origin) = initialized_store();
    let mut state_manager = StateManager::new(store, 2, 10, None);

    let mut blocks = vec![origin];
    for i in 1..=5u64 {
        let mut draft = state_manager
            .new_state_draft(Timestamp::from_unix_nanos(i), &blocks.last().unwrap().l1_commitment())
            .unwrap();
        draft.set(b"counter", i.to_le_bytes().to_vec());
        blocks.push(state_manager.commit(draft).unwrap());
    }

    let store = state_manager.store();
    // States 1, 2 and 3 lie at least 2 states below state 5. The origin is never pruned.
    assert!(store.has_trie_root(&blocks[0].trie_root).unwrap());
    for block in &blocks[1..=3] {
        assert!(!store.has_trie_root(&block.trie_root).unwrap());
    }
    for block in &blocks[4..=5] {
        assert!(store.has_trie_root(&block.trie_root).unwrap());
    }
}

#[test]
fn pruning_does_not_walk_every_retained_ancestor() {
    let (store, kv_store, origin) = initialized_store();
    let mut state_manager = StateManager::new(store, 1_000, 10, None);

    // Block reads of committing one more block on top of `base`.
    let commit_reads = |state_manager: &mut StateManager<MemDB>, base: &Block, i: u64| {
        let before = kv_store.block_reads();
        let mut draft = state_manager
            .new_state_draft(Timestamp::from_unix_nanos(i), &base.l1_commitment())
            .unwrap();
        draft.set(b"counter", i.to_le_bytes().to_vec());
        let block = state_manager.commit(draft).unwrap();
        (block, kv_store.block_reads() - before)
    };

    let mut tip = origin;
    let mut reads = Vec::new();
    for i in 1..=40u64 {
        let (block, block_reads) = commit_reads(&mut state_manager, &tip, i);
        reads.push(block_reads);
        tip = block;
    }
    // None of the 40 blocks is buried deep enough, yet later commits cost no more than early ones.
    assert!(reads[39] <= reads[4], "block reads per commit grew from {} to {}", reads[4], reads[39]);
}

#[test]
fn pruning_follows_the_branch_of_the_new_block() {
    let (store, _, origin) = initialized_store();
    let mut state_manager = StateManager::new(store, 3, 10, None);

    let commit = |state_manager: &mut StateManager<MemDB>, base: &Block, value: &[u8]| {
        let mut draft = state_manager
            .new_state_draft(Timestamp::from_unix_nanos(1), &base.l1_commitment())
            .unwrap();
        draft.set(b"k", value.to_vec());
        state_manager.commit(draft).unwrap()
    };

    let a1 = commit(&mut state_manager, &origin, b"a1");
    let a2 = commit(&mut state_manager, &a1, b"a2");
    let a3 = commit(&mut state_manager, &a2, b"a3");

    // A second branch that leaves the first one at a1 and outgrows it.
    let b2 = commit(&mut state_manager, &a1, b"b2");
    let b3 = commit(&mut state_manager, &b2, b"b3");
    let b4 = commit(&mut state_manager, &b3, b"b4");

    // Only a1 is buried 3 states below b4. a2 and a3 are not ancestors of b4.
    let store = state_manager.store();
    assert!(!store.has_trie_root(&a1.trie_root).unwrap());
    for block in [&origin, &a2, &a3, &b2, &b3, &b4] {
        assert!(store.has_trie_root(&block.trie_root).unwrap());
    }
    assert_eq!(store.largest_pruned_block_index().unwrap(), Some(StateIndex::new(1)));
}

#[test]
fn confirmed_anchor_removes_dead_branches() {
    let (store, _, origin) = initialized_store();
    let mut state_manager = StateManager::new(store, 100, 10, None);

    let commit = |state_manager: &mut StateManager<MemDB>, base: &Block, value: &[u8]| {
        let mut draft = state_manager
            .new_state_draft(Timestamp::from_unix_nanos(1), &base.l1_commitment())
            .unwrap();
        draft.set(b"k", value.to_vec());
        state_manager.commit(draft).unwrap()
    };

    // Two competing blocks on top of the origin, and a child of the losing one.
    let winner = commit(&mut state_manager, &origin, b"winner");
    let loser = commit(&mut state_manager, &origin, b"loser");
    let loser_child = commit(&mut state_manager, &loser, b"loser child");

    state_manager.on_anchor_confirmed(&anchor_for(&winner)).unwrap();

    let store = state_manager.store();
    assert!(store.has_trie_root(&winner.trie_root).unwrap());
    assert!(!store.has_trie_root(&loser.trie_root).unwrap());
    assert!(!store.has_trie_root(&loser_child.trie_root).unwrap());
    assert_eq!(store.latest_block().unwrap(), winner);
}

#[test]
fn confirming_a_missing_block_fails() {
    let (store, _, origin) = initialized_store();
    let mut state_manager = StateManager::new(store, 100, 10, None);
    let mut anchor = anchor_for(&origin);
    anchor.output.state_metadata = L1Commitment::new(CryptoHash::new([3; 32]), CryptoHash::new([4; 32]));

    assert!(matches!(
        state_manager.on_anchor_confirmed(&anchor),
        Err(StateManagerError::MissingBlock { .. })
    ));
}

/// Serves blocks from a map, and counts the fetches.
struct MapFetcher {
    blocks: HashMap<L1Commitment, Block>,
    fetches: usize,
}

impl BlockFetcher for MapFetcher {
    fn fetch(&mut self, commitment: &L1Commitment) -> Result<Block, BlockSyncError> {
        self.fetches += 1;
        self.blocks
            .get(commitment)
            .cloned()
            .ok_or(BlockSyncError::Unavailable { commitment: *commitment })
    }
}

#[test]
fn sync_fetches_missing_ancestors() {
    // A peer's store, three blocks ahead.
    let (mut peer_store, _, peer_origin) = initialized_store();
    let mut peer_blocks = vec![peer_origin];
    for i in 1..=3u64 {
        let block = commit_child(&mut peer_store, peer_blocks.last().unwrap(), b"k", &i.to_le_bytes(), i);
        peer_blocks.push(block);
    }
    let mut fetcher = MapFetcher {
        blocks: peer_blocks.iter().map(|block| (block.l1_commitment(), block.clone())).collect(),
        fetches: 0,
    };

    let (store, _, _) = initialized_store();
    let mut state_manager = StateManager::new(store, 100, 10, None);
    let target = anchor_for(&peer_blocks[3]);

    assert_eq!(state_manager.sync_to(&target, &mut fetcher).unwrap(), 3);
    assert_eq!(fetcher.fetches, 3);
    assert!(state_manager.has_block(&target.l1_commitment()).unwrap());

    // Nothing is fetched once the block is stored.
    assert_eq!(state_manager.sync_to(&target, &mut fetcher).unwrap(), 0);
    assert_eq!(fetcher.fetches, 3);

    state_manager.on_anchor_confirmed(&target).unwrap();
    let state = state_manager.store().latest_state().unwrap();
    assert_eq!(state.get(b"k").unwrap(), Some(3u64.to_le_bytes().to_vec()));
}

#[test]
fn sync_rejects_tampered_blocks() {
    let (mut peer_store, _, peer_origin) = initialized_store();
    let block = commit_child(&mut peer_store, &peer_origin, b"k", b"v", 1);

    let mut tampered = block.clone();
    tampered.mutations.insert(b"k".to_vec(), b"forged".to_vec());
    let mut fetcher = MapFetcher {
        blocks: [(block.l1_commitment(), tampered)].into_iter().collect(),
        fetches: 0,
    };

    let (store, _, _) = initialized_store();
    let mut state_manager = StateManager::new(store, 100, 10, None);
    assert!(matches!(
        state_manager.sync_to(&anchor_for(&block), &mut fetcher),
        Err(StateManagerError::StoreError(StoreError::InvalidBlock { .. }))
    ));
    assert!(!state_manager.has_block(&block.l1_commitment()).unwrap());
}
