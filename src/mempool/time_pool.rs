/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`TimePool`]: requests that must not become eligible for proposal before a given time.

use std::collections::{BTreeMap, HashMap};
use std::mem;

use crate::types::{
    data_types::Timestamp,
    request::{Request, RequestID, RequestRef, RequestRefKey},
};

/// Requests scheduled by their "not before" time.
///
/// Requests are released by [`take_till`](TimePool::take_till) in ascending order of their scheduled
/// times, and requests scheduled for the same time are released in the order they were added. A
/// released request is no longer in the pool, so it is never released twice.
#[derive(Default)]
pub struct TimePool {
    // (not before, insertion sequence number) -> request.
    scheduled: BTreeMap<(Timestamp, u64), Request>,
    index: HashMap<RequestRefKey, (Timestamp, u64)>,
    next_seq: u64,
}

impl TimePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `request` to become eligible at or after `not_before`. Adding a request that is already
    /// scheduled is a no-op.
    pub fn add_request(&mut self, not_before: Timestamp, request: Request) {
        let key = request.request_ref().as_key();
        if self.index.contains_key(&key) {
            return;
        }
        let slot = (not_before, self.next_seq);
        self.next_seq += 1;
        self.index.insert(key, slot);
        self.scheduled.insert(slot, request);
    }

    pub fn has(&self, request_ref: &RequestRef) -> bool {
        self.index.contains_key(&request_ref.as_key())
    }

    pub fn get(&self, request_ref: &RequestRef) -> Option<&Request> {
        self.index
            .get(&request_ref.as_key())
            .and_then(|slot| self.scheduled.get(slot))
    }

    /// Remove and return every request scheduled at or before `till`.
    pub fn take_till(&mut self, till: Timestamp) -> Vec<Request> {
        let later = match till.unix_nanos().checked_add(1) {
            Some(after) => self.scheduled.split_off(&(Timestamp::from_unix_nanos(after), 0)),
            None => BTreeMap::new(),
        };
        let due = mem::replace(&mut self.scheduled, later);

        due.into_values()
            .map(|request| {
                self.index.remove(&request.request_ref().as_key());
                request
            })
            .collect()
    }

    /// Remove every scheduled request with ID `id`. Returns the number of requests removed.
    pub fn remove_by_id(&mut self, id: &RequestID) -> usize {
        let slots: Vec<(Timestamp, u64)> = self
            .scheduled
            .iter()
            .filter(|(_, request)| request.id() == *id)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in &slots {
            if let Some(request) = self.scheduled.remove(slot) {
                self.index.remove(&request.request_ref().as_key());
            }
        }
        slots.len()
    }

    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::{
        anchor::{Address, OutputID, TransactionID},
        data_types::{CryptoHash, GasUnits, Hname},
        request::{AgentID, Assets, CallTarget, OnLedgerRequest, Params},
    };

    fn request(i: u16) -> Request {
        Request::OnLedger(OnLedgerRequest {
            output_id: OutputID::new(TransactionID(CryptoHash::new([7; 32])), i),
            sender: AgentID::Address(Address(CryptoHash::new([1; 32]))),
            target: CallTarget::new(Hname::from_name("counter"), Hname::from_name("increment")),
            params: Params::new(),
            assets: Assets::default(),
            allowance: Assets::default(),
            gas_budget: GasUnits::new(1_000),
            time_lock: None,
            expiration: None,
        })
    }

    fn ids(requests: &[Request]) -> Vec<RequestID> {
        requests.iter().map(|request| request.id()).collect()
    }

    #[test]
    fn releases_requests_in_schedule_order_once() {
        let t0 = Timestamp::from_unix_nanos(1_700_000_000_000_000_000);
        let t1 = t0 + Duration::from_nanos(17);
        let t2 = t0 + Duration::from_secs(17 * 60);
        let t3 = t0 + Duration::from_secs(17 * 60 * 60);
        let (r0, r1, r2, r3) = (request(0), request(1), request(2), request(3));

        let mut pool = TimePool::new();
        pool.add_request(t0, r0.clone());
        pool.add_request(t1, r1.clone());
        pool.add_request(t2, r2.clone());
        pool.add_request(t3, r3.clone());
        for r in [&r0, &r1, &r2, &r3] {
            assert!(pool.has(&r.request_ref()));
        }

        assert_eq!(ids(&pool.take_till(t0)), vec![r0.id()]);
        assert!(!pool.has(&r0.request_ref()));
        assert!(pool.take_till(t0).is_empty());

        let taken = pool.take_till(t0 + Duration::from_secs(30 * 60));
        assert_eq!(ids(&taken), vec![r1.id(), r2.id()]);

        assert_eq!(ids(&pool.take_till(t0 + Duration::from_secs(30 * 60 * 60))), vec![r3.id()]);
        assert!(pool.is_empty());
    }

    #[test]
    fn ties_are_released_in_insertion_order() {
        let t = Timestamp::from_unix_nanos(5_000);
        let mut pool = TimePool::new();
        for i in [4, 2, 9, 1] {
            pool.add_request(t, request(i));
        }
        let expected: Vec<RequestID> = [4, 2, 9, 1].iter().map(|i| request(*i).id()).collect();
        assert_eq!(ids(&pool.take_till(t)), expected);
    }

    #[test]
    fn adding_twice_is_a_no_op() {
        let mut pool = TimePool::new();
        pool.add_request(Timestamp::from_unix_nanos(10), request(0));
        pool.add_request(Timestamp::from_unix_nanos(20), request(0));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.take_till(Timestamp::from_unix_nanos(15)).len(), 1);
        assert!(pool.take_till(Timestamp::from_unix_nanos(25)).is_empty());
    }

    #[test]
    fn stepwise_takes_partition_a_single_take() {
        let schedule: Vec<(u64, u16)> = vec![(50, 0), (10, 1), (30, 2), (30, 3), (90, 4), (70, 5), (10, 6)];
        let steps = [5, 10, 29, 30, 64, 100];

        let mut stepwise = TimePool::new();
        let mut single = TimePool::new();
        for (time, i) in &schedule {
            stepwise.add_request(Timestamp::from_unix_nanos(*time), request(*i));
            single.add_request(Timestamp::from_unix_nanos(*time), request(*i));
        }

        let mut union = Vec::new();
        for step in steps {
            let taken = stepwise.take_till(Timestamp::from_unix_nanos(step));
            for request in &taken {
                let (time, _) = schedule
                    .iter()
                    .find(|(_, i)| request.id() == self::request(*i).id())
                    .copied()
                    .unwrap_or((u64::MAX, 0));
                // Every request is released by the first step at or after its scheduled time.
                assert!(time <= step);
            }
            union.extend(taken);
        }

        assert_eq!(ids(&union), ids(&single.take_till(Timestamp::from_unix_nanos(100))));
    }

    #[test]
    fn remove_by_id_purges_the_request() {
        let mut pool = TimePool::new();
        pool.add_request(Timestamp::from_unix_nanos(10), request(0));
        pool.add_request(Timestamp::from_unix_nanos(10), request(1));
        assert_eq!(pool.remove_by_id(&request(0).id()), 1);
        assert!(!pool.has(&request(0).request_ref()));
        assert_eq!(ids(&pool.take_till(Timestamp::from_unix_nanos(10))), vec![request(1).id()]);
    }
}
