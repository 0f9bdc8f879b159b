/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bracha's reliable broadcast of one proposer's value.
//!
//! If any correct node delivers a value, every correct node eventually delivers the same value, and if
//! the proposer is correct, every correct node delivers the value it proposed.

use std::collections::{BTreeSet, HashMap};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::CryptoHash;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RbcMessage {
    Val(Vec<u8>),
    Echo(Vec<u8>),
    Ready(CryptoHash),
}

pub(crate) struct Rbc {
    n: usize,
    f: usize,
    proposer: usize,
    values: HashMap<CryptoHash, Vec<u8>>,
    echoes: HashMap<CryptoHash, BTreeSet<usize>>,
    echoed_by: BTreeSet<usize>,
    readies: HashMap<CryptoHash, BTreeSet<usize>>,
    readied_by: BTreeSet<usize>,
    sent_echo: bool,
    sent_ready: bool,
    output: Option<Vec<u8>>,
}

impl Rbc {
    pub(crate) fn new(n: usize, f: usize, proposer: usize) -> Self {
        Self {
            n,
            f,
            proposer,
            values: HashMap::new(),
            echoes: HashMap::new(),
            echoed_by: BTreeSet::new(),
            readies: HashMap::new(),
            readied_by: BTreeSet::new(),
            sent_echo: false,
            sent_ready: false,
            output: None,
        }
    }

    pub(crate) fn propose(&mut self, value: Vec<u8>) -> Vec<RbcMessage> {
        vec![RbcMessage::Val(value)]
    }

    pub(crate) fn handle(&mut self, from: usize, message: RbcMessage) -> Vec<RbcMessage> {
        let mut outgoing = Vec::new();
        match message {
            RbcMessage::Val(value) => {
                if from == self.proposer && !self.sent_echo {
                    self.sent_echo = true;
                    outgoing.push(RbcMessage::Echo(value));
                }
            }

            RbcMessage::Echo(value) => {
                if !self.echoed_by.insert(from) {
                    return outgoing;
                }
                let hash = CryptoHash::of(&[&value]);
                self.values.entry(hash).or_insert(value);
                let echoes = self.echoes.entry(hash).or_default();
                echoes.insert(from);
                if echoes.len() >= self.echo_threshold() && !self.sent_ready {
                    self.sent_ready = true;
                    outgoing.push(RbcMessage::Ready(hash));
                }
                self.try_deliver(&hash);
            }

            RbcMessage::Ready(hash) => {
                if !self.readied_by.insert(from) {
                    return outgoing;
                }
                let readies = self.readies.entry(hash).or_default();
                readies.insert(from);
                if readies.len() > self.f && !self.sent_ready {
                    self.sent_ready = true;
                    outgoing.push(RbcMessage::Ready(hash));
                }
                self.try_deliver(&hash);
            }
        }
        outgoing
    }

    pub(crate) fn output(&self) -> Option<&Vec<u8>> {
        self.output.as_ref()
    }

    fn try_deliver(&mut self, hash: &CryptoHash) {
        if self.output.is_some() {
            return;
        }
        let readies = self.readies.get(hash).map(|readies| readies.len()).unwrap_or(0);
        if readies >= 2 * self.f + 1 {
            if let Some(value) = self.values.get(hash) {
                self.output = Some(value.clone());
            }
        }
    }

    // ⌈(n + f + 1) / 2⌉
    fn echo_threshold(&self) -> usize {
        (self.n + self.f + 2) / 2
    }
}
