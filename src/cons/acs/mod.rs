/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Asynchronous Common Subset: every correct committee member outputs the same set of at least `n - f`
//! proposals.
//!
//! ## Construction
//!
//! The construction is the one used by HoneyBadgerBFT. Every member [reliably broadcasts](rbc) its
//! proposal, and one [binary agreement](aba) instance per member decides whether that member's
//! proposal is in the subset:
//! 1. When the broadcast of member `j` delivers, input `true` to agreement `j`.
//! 2. Once `n - f` agreements have decided `true`, input `false` to every agreement that has no input
//!    yet.
//! 3. Once every agreement has decided, the subset is the set of delivered proposals whose agreements
//!    decided `true`, waiting for the broadcasts of those that are still in flight.
//!
//! ## Message flow
//!
//! [`Acs`] is a pure state machine. Its methods return the messages to broadcast to the other members.
//! Messages that a member sends are also delivered to itself, internally, before the methods return.

pub mod aba;

pub mod rbc;

use std::collections::{BTreeMap, VecDeque};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::signer::{CommonCoin, SignError};

use aba::{Aba, AbaMessage};
use rbc::{Rbc, RbcMessage};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum AcsMessage {
    Rbc { proposer: u16, message: RbcMessage },
    Aba { instance: u16, message: AbaMessage },
}

pub(crate) struct Acs {
    me: usize,
    n: usize,
    f: usize,
    rbcs: Vec<Rbc>,
    abas: Vec<Aba>,
    output: Option<BTreeMap<usize, Vec<u8>>>,
}

impl Acs {
    pub(crate) fn new(n: usize, f: usize, me: usize) -> Self {
        Self {
            me,
            n,
            f,
            rbcs: (0..n).map(|proposer| Rbc::new(n, f, proposer)).collect(),
            abas: (0..n).map(|instance| Aba::new(n, f, instance as u16)).collect(),
            output: None,
        }
    }

    pub(crate) fn propose(
        &mut self,
        value: Vec<u8>,
        coin: &mut impl CommonCoin,
    ) -> Result<Vec<AcsMessage>, SignError> {
        let me = self.me;
        let initial = self.rbcs[me]
            .propose(value)
            .into_iter()
            .map(|message| AcsMessage::Rbc { proposer: me as u16, message })
            .collect();
        self.process(initial, coin)
    }

    /// Handle a message from the member at index `from` of the committee.
    pub(crate) fn handle(
        &mut self,
        from: usize,
        message: AcsMessage,
        coin: &mut impl CommonCoin,
    ) -> Result<Vec<AcsMessage>, SignError> {
        if from >= self.n {
            return Ok(Vec::new());
        }
        let mut outbox = Vec::new();
        let mut queue = VecDeque::from([(from, message)]);
        self.drain(&mut queue, &mut outbox, coin)?;
        Ok(outbox)
    }

    /// The agreed subset, by committee index, once it is known.
    pub(crate) fn output(&self) -> Option<&BTreeMap<usize, Vec<u8>>> {
        self.output.as_ref()
    }

    fn process(
        &mut self,
        initial: Vec<AcsMessage>,
        coin: &mut impl CommonCoin,
    ) -> Result<Vec<AcsMessage>, SignError> {
        let mut outbox = initial.clone();
        let mut queue: VecDeque<(usize, AcsMessage)> =
            initial.into_iter().map(|message| (self.me, message)).collect();
        self.drain(&mut queue, &mut outbox, coin)?;
        Ok(outbox)
    }

    fn drain(
        &mut self,
        queue: &mut VecDeque<(usize, AcsMessage)>,
        outbox: &mut Vec<AcsMessage>,
        coin: &mut impl CommonCoin,
    ) -> Result<(), SignError> {
        while let Some((from, message)) = queue.pop_front() {
            let produced = self.dispatch(from, message, coin)?;
            let inputs = self.update_inputs(coin)?;
            for message in produced.into_iter().chain(inputs) {
                outbox.push(message.clone());
                queue.push_back((self.me, message));
            }
            self.update_output();
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        from: usize,
        message: AcsMessage,
        coin: &mut impl CommonCoin,
    ) -> Result<Vec<AcsMessage>, SignError> {
        Ok(match message {
            AcsMessage::Rbc { proposer, message } => match self.rbcs.get_mut(proposer as usize) {
                Some(rbc) => rbc
                    .handle(from, message)
                    .into_iter()
                    .map(|message| AcsMessage::Rbc { proposer, message })
                    .collect(),
                None => Vec::new(),
            },
            AcsMessage::Aba { instance, message } => match self.abas.get_mut(instance as usize) {
                Some(aba) => aba
                    .handle(from, message, coin)?
                    .into_iter()
                    .map(|message| AcsMessage::Aba { instance, message })
                    .collect(),
                None => Vec::new(),
            },
        })
    }

    fn update_inputs(&mut self, coin: &mut impl CommonCoin) -> Result<Vec<AcsMessage>, SignError> {
        let mut produced = Vec::new();
        for instance in 0..self.n {
            if self.rbcs[instance].output().is_some() && !self.abas[instance].has_input() {
                produced.extend(self.input(instance, true, coin)?);
            }
        }

        let accepted = self.abas.iter().filter(|aba| aba.decision() == Some(true)).count();
        if accepted >= self.n - self.f {
            for instance in 0..self.n {
                if !self.abas[instance].has_input() {
                    produced.extend(self.input(instance, false, coin)?);
                }
            }
        }
        Ok(produced)
    }

    fn input(
        &mut self,
        instance: usize,
        value: bool,
        coin: &mut impl CommonCoin,
    ) -> Result<Vec<AcsMessage>, SignError> {
        Ok(self.abas[instance]
            .input(value, coin)?
            .into_iter()
            .map(|message| AcsMessage::Aba { instance: instance as u16, message })
            .collect())
    }

    fn update_output(&mut self) {
        if self.output.is_some() {
            return;
        }
        let mut subset = BTreeMap::new();
        for (instance, aba) in self.abas.iter().enumerate() {
            match aba.decision() {
                None => return,
                Some(false) => (),
                Some(true) => match self.rbcs[instance].output() {
                    Some(value) => {
                        subset.insert(instance, value.clone());
                    }
                    None => return,
                },
            }
        }
        self.output = Some(subset);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    /// Deterministic coin: false in even rounds, true in odd rounds.
    struct AlternatingCoin;

    impl CommonCoin for AlternatingCoin {
        fn flip(&mut self, _instance: u16, round: u32) -> Result<bool, SignError> {
            Ok(round % 2 == 1)
        }
    }

    /// Run ACS among `n` nodes, of which the nodes in `silent` never send anything. Messages are
    /// delivered in FIFO order.
    fn simulate(n: usize, f: usize, silent: &HashSet<usize>) -> Vec<Option<BTreeMap<usize, Vec<u8>>>> {
        let mut nodes: Vec<Acs> = (0..n).map(|me| Acs::new(n, f, me)).collect();
        let mut network: VecDeque<(usize, usize, AcsMessage)> = VecDeque::new();
        let mut coin = AlternatingCoin;

        for me in 0..n {
            if silent.contains(&me) {
                continue;
            }
            let value = format!("proposal of node {}", me).into_bytes();
            for message in nodes[me].propose(value, &mut coin).unwrap() {
                for to in (0..n).filter(|to| *to != me) {
                    network.push_back((me, to, message.clone()));
                }
            }
        }

        let mut steps = 0;
        while let Some((from, to, message)) = network.pop_front() {
            steps += 1;
            assert!(steps < 1_000_000, "simulation does not terminate");
            if silent.contains(&to) {
                continue;
            }
            for reply in nodes[to].handle(from, message, &mut coin).unwrap() {
                for peer in (0..n).filter(|peer| *peer != to) {
                    network.push_back((to, peer, reply.clone()));
                }
            }
        }

        nodes.iter().map(|node| node.output().cloned()).collect()
    }

    #[test]
    fn all_correct_nodes_output_the_same_subset() {
        let outputs = simulate(4, 1, &HashSet::new());
        let first = outputs[0].clone().unwrap();
        assert!(first.len() >= 3);
        for (index, value) in &first {
            assert_eq!(value, &format!("proposal of node {}", index).into_bytes());
        }
        for output in &outputs {
            assert_eq!(output.as_ref(), Some(&first));
        }
    }

    #[test]
    fn tolerates_a_silent_node() {
        let silent = HashSet::from([3]);
        let outputs = simulate(4, 1, &silent);
        let first = outputs[0].clone().unwrap();
        assert_eq!(first.keys().copied().collect::<Vec<usize>>(), vec![0, 1, 2]);
        for output in &outputs[0..3] {
            assert_eq!(output.as_ref(), Some(&first));
        }
        assert!(outputs[3].is_none());
    }

    #[test]
    fn seven_nodes_with_two_silent() {
        let silent = HashSet::from([0, 5]);
        let outputs = simulate(7, 2, &silent);
        let first = outputs[1].clone().unwrap();
        assert!(first.len() >= 5);
        assert!(!first.contains_key(&0) && !first.contains_key(&5));
        for (index, output) in outputs.iter().enumerate() {
            if !silent.contains(&index) {
                assert_eq!(output.as_ref(), Some(&first));
            }
        }
    }
}
