/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Mempool`]: requests that are candidates for future batches.
//!
//! ## Pools
//!
//! The mempool keeps requests in three pools:
//! 1. The [`TimePool`], for on-ledger requests whose time lock has not passed yet.
//! 2. The on-ledger ready pool, in arrival order.
//! 3. The off-ledger pool, grouped by sender and ordered by nonce.
//!
//! A request is in at most one pool at a time. Requests are deduplicated by their [`RequestRef`], so
//! adding a request that is already present is a no-op.
//!
//! ## Proposals
//!
//! [`Mempool::proposal`] selects the requests a node proposes for the next batch: on-ledger requests in
//! arrival order, then, for every sender, the run of off-ledger requests with consecutive nonces that
//! starts at the nonce of the sender's account in the state the batch builds on. The mempool keeps no
//! nonces of its own: the caller passes the account nonces in, and a sender whose account nonce is not
//! passed is not proposed. An off-ledger request whose predecessor nonce is missing is held back until
//! the predecessor arrives or is consumed.
//!
//! ## Concurrency
//!
//! A [`Mempool`] is owned by a single [actor](actor) thread, and every other component talks to it
//! through a [`MempoolHandle`](actor::MempoolHandle). The pools are unbounded.

pub mod actor;

pub mod messages;

pub mod time_pool;

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use crate::types::{
    data_types::{ChainID, CryptoHash, NodeID, Timestamp},
    request::{OffLedgerRequest, OnLedgerRequest, Request, RequestID, RequestRef},
};

use time_pool::TimePool;

pub use actor::MempoolHandle;

pub struct Mempool {
    chain_id: ChainID,
    expiry_window: Duration,
    time_pool: TimePool,

    // Ready on-ledger requests, and their arrival order.
    on_ledger: BTreeMap<RequestRef, (u64, OnLedgerRequest)>,
    on_ledger_order: BTreeMap<u64, RequestRef>,
    next_seq: u64,

    // Off-ledger requests, and the nonce index of each sender.
    off_ledger: BTreeMap<RequestRef, OffLedgerRequest>,
    off_ledger_by_sender: BTreeMap<NodeID, BTreeMap<u64, RequestRef>>,
}

impl Mempool {
    pub fn new(chain_id: ChainID, expiry_window: Duration) -> Self {
        Self {
            chain_id,
            expiry_window,
            time_pool: TimePool::new(),
            on_ledger: BTreeMap::new(),
            on_ledger_order: BTreeMap::new(),
            next_seq: 0,
            off_ledger: BTreeMap::new(),
            off_ledger_by_sender: BTreeMap::new(),
        }
    }

    /// Add `request` to the mempool. Returns whether the request was added.
    ///
    /// A request is not added if it is already present, if it is an off-ledger request for another
    /// chain, with an invalid signature, or with an already pending nonce, or if it
    /// is an on-ledger request that has expired. On-ledger requests with a time lock later than `now`
    /// are scheduled in the time pool.
    pub fn add_request(&mut self, request: Request, now: Timestamp) -> bool {
        let request_ref = request.request_ref();
        if self.has(&request_ref) {
            return false;
        }

        match request {
            Request::OffLedger(off_ledger) => {
                if off_ledger.essence.chain_id != self.chain_id {
                    log::debug!("Mempool: off-ledger request {} is for another chain", request_ref.id);
                    return false;
                }
                if !off_ledger.verify_signature() {
                    log::debug!("Mempool: off-ledger request {} has an invalid signature", request_ref.id);
                    return false;
                }
                let sender = off_ledger.essence.sender;
                let nonce = off_ledger.essence.nonce;
                let by_nonce = self.off_ledger_by_sender.entry(sender).or_default();
                if by_nonce.contains_key(&nonce) {
                    return false;
                }
                by_nonce.insert(nonce, request_ref);
                self.off_ledger.insert(request_ref, off_ledger);
                true
            }

            Request::OnLedger(on_ledger) => {
                let request = Request::OnLedger(on_ledger);
                if request.is_expired(now, self.expiry_window) {
                    return false;
                }
                match request.time_lock() {
                    Some(time_lock) if time_lock > now => self.time_pool.add_request(time_lock, request),
                    _ => self.insert_ready(request),
                }
                true
            }
        }
    }

    /// Whether a request with ref `request_ref` is in any pool.
    pub fn has(&self, request_ref: &RequestRef) -> bool {
        self.on_ledger.contains_key(request_ref)
            || self.off_ledger.contains_key(request_ref)
            || self.time_pool.has(request_ref)
    }

    pub fn get(&self, request_ref: &RequestRef) -> Option<Request> {
        if let Some((_, on_ledger)) = self.on_ledger.get(request_ref) {
            return Some(Request::OnLedger(on_ledger.clone()));
        }
        if let Some(off_ledger) = self.off_ledger.get(request_ref) {
            return Some(Request::OffLedger(off_ledger.clone()));
        }
        self.time_pool.get(request_ref).cloned()
    }

    /// Look up the requests referred to by `refs`. Returns the requests found, in the order of `refs`,
    /// and the refs that were not found.
    pub fn requests(&self, refs: &[RequestRef]) -> (Vec<Request>, Vec<RequestRef>) {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for request_ref in refs {
            match self.get(request_ref) {
                Some(request) => found.push(request),
                None => missing.push(*request_ref),
            }
        }
        (found, missing)
    }

    /// Move every time-locked request whose lock has passed at `now` into the ready pool. Returns the
    /// number of requests released.
    pub fn tick(&mut self, now: Timestamp) -> usize {
        let released = self.time_pool.take_till(now);
        let count = released.len();
        for request in released {
            if !request.is_expired(now, self.expiry_window) {
                self.insert_ready(request);
            }
        }
        count
    }

    /// Senders that have off-ledger requests in the pool.
    pub fn senders(&self) -> Vec<NodeID> {
        self.off_ledger_by_sender.keys().copied().collect()
    }

    /// Select up to `max` requests to propose at `now`. Off-ledger requests of a sender are proposed only
    /// if `account_nonces` has the sender's account nonce, starting exactly at that nonce. Expired
    /// on-ledger requests are dropped from the ready pool along the way.
    pub fn proposal(
        &mut self,
        now: Timestamp,
        max: usize,
        account_nonces: &BTreeMap<NodeID, u64>,
    ) -> Vec<RequestRef> {
        self.drop_expired(now);

        let mut refs: Vec<RequestRef> = self.on_ledger_order.values().take(max).copied().collect();
        for (sender, account_nonce) in account_nonces {
            let by_nonce = match self.off_ledger_by_sender.get(sender) {
                Some(by_nonce) => by_nonce,
                None => continue,
            };
            let mut expected = *account_nonce;
            for (nonce, request_ref) in by_nonce.range(expected..) {
                if refs.len() >= max || *nonce != expected {
                    break;
                }
                refs.push(*request_ref);
                expected += 1;
            }
        }
        refs.truncate(max);
        refs
    }

    /// Purge the requests of a finalized batch from every pool, along with the pending requests of the
    /// same senders whose nonces the batch consumed. Returns the IDs of the requests that were removed.
    pub fn remove_finalized(&mut self, requests: &[Request]) -> Vec<RequestID> {
        let mut removed = Vec::new();
        for request in requests {
            if self.remove_by_id(&request.id()) {
                removed.push(request.id());
            }
            if let Request::OffLedger(off_ledger) = request {
                let next_nonce = off_ledger.essence.nonce.saturating_add(1);
                removed.extend(self.drop_consumed_nonces(&off_ledger.essence.sender, next_nonce));
            }
        }
        removed
    }

    /// Drop the off-ledger requests whose nonces are below their sender's account nonce. Returns the IDs
    /// of the requests that were removed.
    pub fn remove_consumed(&mut self, account_nonces: &BTreeMap<NodeID, u64>) -> Vec<RequestID> {
        account_nonces
            .iter()
            .flat_map(|(sender, account_nonce)| self.drop_consumed_nonces(sender, *account_nonce))
            .collect()
    }

    /// Remove every request with ID `id`, whichever pool it is in. Returns whether anything was removed.
    pub fn remove_by_id(&mut self, id: &RequestID) -> bool {
        let lowest = RequestRef { id: *id, hash: CryptoHash::new([0u8; 32]) };
        let highest = RequestRef { id: *id, hash: CryptoHash::new([0xffu8; 32]) };

        let on_ledger: Vec<RequestRef> = self.on_ledger.range(lowest..=highest).map(|(r, _)| *r).collect();
        for request_ref in &on_ledger {
            if let Some((seq, _)) = self.on_ledger.remove(request_ref) {
                self.on_ledger_order.remove(&seq);
            }
        }

        let off_ledger: Vec<RequestRef> = self.off_ledger.range(lowest..=highest).map(|(r, _)| *r).collect();
        for request_ref in &off_ledger {
            if let Some(request) = self.off_ledger.remove(request_ref) {
                self.unindex_off_ledger(&request);
            }
        }

        let scheduled = self.time_pool.remove_by_id(id);
        !on_ledger.is_empty() || !off_ledger.is_empty() || scheduled > 0
    }

    pub fn len(&self) -> usize {
        self.on_ledger.len() + self.off_ledger.len() + self.time_pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /* ↓↓↓ Helpers ↓↓↓ */

    fn insert_ready(&mut self, request: Request) {
        let request_ref = request.request_ref();
        match request {
            Request::OnLedger(on_ledger) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.on_ledger.insert(request_ref, (seq, on_ledger));
                self.on_ledger_order.insert(seq, request_ref);
            }
            Request::OffLedger(_) => {
                log::warn!("Mempool: off-ledger request {} cannot be scheduled", request_ref.id)
            }
        }
    }

    fn drop_expired(&mut self, now: Timestamp) {
        let window = self.expiry_window;
        let expired: Vec<RequestRef> = self
            .on_ledger
            .iter()
            .filter(|(_, (_, request))| match request.expiration {
                Some(expiration) => now + window >= expiration,
                None => false,
            })
            .map(|(request_ref, _)| *request_ref)
            .collect();
        for request_ref in expired {
            log::debug!("Mempool: dropping expired request {}", request_ref.id);
            if let Some((seq, _)) = self.on_ledger.remove(&request_ref) {
                self.on_ledger_order.remove(&seq);
            }
        }
    }

    fn drop_consumed_nonces(&mut self, sender: &NodeID, next_nonce: u64) -> Vec<RequestID> {
        let stale: Vec<RequestRef> = match self.off_ledger_by_sender.get(sender) {
            Some(by_nonce) => by_nonce.range(..next_nonce).map(|(_, r)| *r).collect(),
            None => return Vec::new(),
        };
        stale
            .into_iter()
            .filter_map(|request_ref| {
                let request = self.off_ledger.remove(&request_ref)?;
                self.unindex_off_ledger(&request);
                Some(request_ref.id)
            })
            .collect()
    }

    fn unindex_off_ledger(&mut self, request: &OffLedgerRequest) {
        let sender = request.essence.sender;
        if let Some(by_nonce) = self.off_ledger_by_sender.get_mut(&sender) {
            by_nonce.remove(&request.essence.nonce);
            if by_nonce.is_empty() {
                self.off_ledger_by_sender.remove(&sender);
            }
        }
    }
}

/// The mempool actor has shut down.
#[derive(Debug)]
pub enum MempoolError {
    Disconnected,
}

impl Display for MempoolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MempoolError::Disconnected => write!(f, "mempool actor disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::types::{
        anchor::{Address, OutputID, TransactionID},
        crypto_primitives::Keypair,
        data_types::{GasUnits, Hname},
        request::{AgentID, Assets, CallTarget, OffLedgerRequestEssence, Params},
    };

    const CHAIN: ChainID = ChainID::new([3; 32]);

    fn on_ledger(i: u16, time_lock: Option<Timestamp>, expiration: Option<Timestamp>) -> Request {
        Request::OnLedger(OnLedgerRequest {
            output_id: OutputID::new(TransactionID(CryptoHash::new([9; 32])), i),
            sender: AgentID::Address(Address(CryptoHash::new([1; 32]))),
            target: CallTarget::new(Hname::from_name("counter"), Hname::from_name("increment")),
            params: Params::new(),
            assets: Assets::default(),
            allowance: Assets::default(),
            gas_budget: GasUnits::new(1_000),
            time_lock,
            expiration,
        })
    }

    fn off_ledger(keypair: &Keypair, chain_id: ChainID, nonce: u64) -> Request {
        let essence = OffLedgerRequestEssence {
            chain_id,
            target: CallTarget::new(Hname::from_name("counter"), Hname::from_name("increment")),
            params: Params::new(),
            nonce,
            gas_budget: GasUnits::new(1_000),
            allowance: Assets::default(),
            sender: keypair.node_id(),
        };
        Request::OffLedger(OffLedgerRequest::new_signed(essence, keypair))
    }

    fn keypair(seed: u8) -> Keypair {
        Keypair::new(SigningKey::from_bytes(&[seed; 32]))
    }

    fn mempool() -> Mempool {
        Mempool::new(CHAIN, Duration::from_secs(60))
    }

    const NOW: Timestamp = Timestamp::from_unix_nanos(1_000_000_000_000);

    fn no_accounts() -> BTreeMap<NodeID, u64> {
        BTreeMap::new()
    }

    fn account(keypair: &Keypair, nonce: u64) -> BTreeMap<NodeID, u64> {
        BTreeMap::from([(keypair.node_id(), nonce)])
    }

    #[test]
    fn add_request_is_idempotent() {
        let mut mempool = mempool();
        let request = on_ledger(0, None, None);
        assert!(mempool.add_request(request.clone(), NOW));
        assert!(mempool.has(&request.request_ref()));
        assert!(!mempool.add_request(request, NOW));
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn rejects_bad_off_ledger_requests() {
        let mut mempool = mempool();
        let alice = keypair(1);

        assert!(!mempool.add_request(off_ledger(&alice, ChainID::new([4; 32]), 0), NOW));

        let mut forged = off_ledger(&alice, CHAIN, 0);
        if let Request::OffLedger(request) = &mut forged {
            request.essence.nonce = 5;
        }
        assert!(!mempool.add_request(forged, NOW));
        assert!(mempool.is_empty());
    }

    #[test]
    fn time_locked_requests_wait_for_tick() {
        let mut mempool = mempool();
        let locked = on_ledger(0, Some(NOW + Duration::from_secs(10)), None);
        assert!(mempool.add_request(locked.clone(), NOW));
        assert!(mempool.has(&locked.request_ref()));
        assert!(mempool.proposal(NOW, 10, &no_accounts()).is_empty());

        assert_eq!(mempool.tick(NOW + Duration::from_secs(5)), 0);
        assert_eq!(mempool.tick(NOW + Duration::from_secs(10)), 1);
        assert_eq!(
            mempool.proposal(NOW + Duration::from_secs(10), 10, &no_accounts()),
            vec![locked.request_ref()]
        );
    }

    #[test]
    fn expired_requests_are_not_proposed() {
        let mut mempool = mempool();
        let soon = on_ledger(0, None, Some(NOW + Duration::from_secs(90)));
        assert!(mempool.add_request(soon.clone(), NOW));
        assert_eq!(mempool.proposal(NOW, 10, &no_accounts()), vec![soon.request_ref()]);
        // Within the expiry window of the expiration time.
        assert!(mempool.proposal(NOW + Duration::from_secs(31), 10, &no_accounts()).is_empty());
        assert!(!mempool.has(&soon.request_ref()));

        assert!(!mempool.add_request(on_ledger(1, None, Some(NOW)), NOW));
    }

    #[test]
    fn off_ledger_requests_are_proposed_in_nonce_order_without_gaps() {
        let mut mempool = mempool();
        let alice = keypair(1);
        let (n0, n1, n3) = (
            off_ledger(&alice, CHAIN, 0),
            off_ledger(&alice, CHAIN, 1),
            off_ledger(&alice, CHAIN, 3),
        );
        for request in [&n3, &n1, &n0] {
            assert!(mempool.add_request(request.clone(), NOW));
        }
        assert_eq!(mempool.senders(), vec![alice.node_id()]);
        assert_eq!(
            mempool.proposal(NOW, 10, &account(&alice, 0)),
            vec![n0.request_ref(), n1.request_ref()]
        );

        let removed = mempool.remove_finalized(&[n0.clone(), n1.clone()]);
        assert_eq!(removed, vec![n0.id(), n1.id()]);
        // Nonce 2 is still missing.
        assert!(mempool.proposal(NOW, 10, &account(&alice, 2)).is_empty());

        let n2 = off_ledger(&alice, CHAIN, 2);
        assert!(mempool.add_request(n2.clone(), NOW));
        assert_eq!(
            mempool.proposal(NOW, 10, &account(&alice, 2)),
            vec![n2.request_ref(), n3.request_ref()]
        );
    }

    #[test]
    fn request_with_missing_predecessor_is_held_back() {
        let mut mempool = mempool();
        let alice = keypair(1);
        let (n0, n1) = (off_ledger(&alice, CHAIN, 0), off_ledger(&alice, CHAIN, 1));

        // This mempool never saw nonce 0, and the account has not consumed it.
        assert!(mempool.add_request(n1.clone(), NOW));
        assert!(mempool.proposal(NOW, 10, &account(&alice, 0)).is_empty());
        assert!(mempool.has(&n1.request_ref()));

        assert!(mempool.add_request(n0.clone(), NOW));
        assert_eq!(
            mempool.proposal(NOW, 10, &account(&alice, 0)),
            vec![n0.request_ref(), n1.request_ref()]
        );
    }

    #[test]
    fn senders_without_account_nonce_are_not_proposed() {
        let mut mempool = mempool();
        let (alice, bob) = (keypair(1), keypair(2));
        let (from_alice, from_bob) = (off_ledger(&alice, CHAIN, 0), off_ledger(&bob, CHAIN, 0));
        mempool.add_request(from_alice.clone(), NOW);
        mempool.add_request(from_bob, NOW);

        assert!(mempool.proposal(NOW, 10, &no_accounts()).is_empty());
        assert_eq!(mempool.proposal(NOW, 10, &account(&alice, 0)), vec![from_alice.request_ref()]);
    }

    #[test]
    fn remove_consumed_drops_nonces_below_account_nonce() {
        let mut mempool = mempool();
        let alice = keypair(1);
        let (n0, n1, n2) = (
            off_ledger(&alice, CHAIN, 0),
            off_ledger(&alice, CHAIN, 1),
            off_ledger(&alice, CHAIN, 2),
        );
        for request in [&n0, &n1, &n2] {
            mempool.add_request(request.clone(), NOW);
        }

        // Consumed by batches this node did not finalize itself.
        assert_eq!(mempool.remove_consumed(&account(&alice, 2)), vec![n0.id(), n1.id()]);
        assert_eq!(mempool.proposal(NOW, 10, &account(&alice, 2)), vec![n2.request_ref()]);
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn proposal_respects_max_and_arrival_order() {
        let mut mempool = mempool();
        let requests: Vec<Request> = (0..5).rev().map(|i| on_ledger(i, None, None)).collect();
        for request in &requests {
            mempool.add_request(request.clone(), NOW);
        }
        let expected: Vec<RequestRef> = requests.iter().take(3).map(|r| r.request_ref()).collect();
        assert_eq!(mempool.proposal(NOW, 3, &no_accounts()), expected);
    }

    #[test]
    fn remove_finalized_purges_every_pool() {
        let mut mempool = mempool();
        let ready = on_ledger(0, None, None);
        let locked = on_ledger(1, Some(NOW + Duration::from_secs(3600)), None);
        let alice = keypair(1);
        let signed = off_ledger(&alice, CHAIN, 0);
        for request in [&ready, &locked, &signed] {
            mempool.add_request(request.clone(), NOW);
        }
        assert_eq!(mempool.len(), 3);

        let removed = mempool.remove_finalized(&[ready.clone(), locked.clone(), signed.clone()]);
        assert_eq!(removed.len(), 3);
        assert!(mempool.is_empty());
        for request in [&ready, &locked, &signed] {
            assert!(!mempool.has(&request.request_ref()));
        }
    }

    #[test]
    fn requests_reports_missing_refs() {
        let mut mempool = mempool();
        let present = on_ledger(0, None, None);
        let absent = on_ledger(1, None, None);
        mempool.add_request(present.clone(), NOW);
        let (found, missing) = mempool.requests(&[present.request_ref(), absent.request_ref()]);
        assert_eq!(found, vec![present]);
        assert_eq!(missing, vec![absent.request_ref()]);
    }
}
