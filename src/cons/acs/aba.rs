/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Randomized binary agreement with a common coin, after Mostéfaoui, Moumen and Raynal.
//!
//! Each round, nodes exchange `BVal` messages until a value is supported by `2f + 1` nodes, and then
//! one `Aux` message each. Once `n - f` `Aux` messages carrying supported values have arrived, the coin
//! for the round is flipped: a node whose supported values are exactly `{v}` with `v` equal to the coin
//! decides `v`.
//!
//! Deciding nodes broadcast `Term(v)`. `f + 1` `Term(v)` messages let a node decide `v` without
//! finishing its rounds, and `2f + 1` of them let it stop participating.

use std::collections::{BTreeMap, BTreeSet};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::signer::{CommonCoin, SignError};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum AbaMessage {
    BVal { round: u32, value: bool },
    Aux { round: u32, value: bool },
    Term(bool),
}

pub(crate) struct Aba {
    n: usize,
    f: usize,
    instance: u16,
    round: u32,
    estimate: Option<bool>,
    bval_sent: BTreeMap<u32, [bool; 2]>,
    bval_received: BTreeMap<u32, [BTreeSet<usize>; 2]>,
    bin_values: BTreeMap<u32, [bool; 2]>,
    aux_sent: BTreeSet<u32>,
    aux_received: BTreeMap<u32, BTreeMap<usize, bool>>,
    term_received: [BTreeSet<usize>; 2],
    term_sent: bool,
    decision: Option<bool>,
    terminated: bool,
}

impl Aba {
    pub(crate) fn new(n: usize, f: usize, instance: u16) -> Self {
        Self {
            n,
            f,
            instance,
            round: 0,
            estimate: None,
            bval_sent: BTreeMap::new(),
            bval_received: BTreeMap::new(),
            bin_values: BTreeMap::new(),
            aux_sent: BTreeSet::new(),
            aux_received: BTreeMap::new(),
            term_received: [BTreeSet::new(), BTreeSet::new()],
            term_sent: false,
            decision: None,
            terminated: false,
        }
    }

    pub(crate) fn has_input(&self) -> bool {
        self.estimate.is_some()
    }

    pub(crate) fn decision(&self) -> Option<bool> {
        self.decision
    }

    pub(crate) fn input(
        &mut self,
        value: bool,
        coin: &mut impl CommonCoin,
    ) -> Result<Vec<AbaMessage>, SignError> {
        if self.estimate.is_some() || self.terminated {
            return Ok(Vec::new());
        }
        self.estimate = Some(value);
        let mut outgoing = Vec::new();
        self.send_bval(self.round, value, &mut outgoing);
        self.try_progress(coin, &mut outgoing)?;
        Ok(outgoing)
    }

    pub(crate) fn handle(
        &mut self,
        from: usize,
        message: AbaMessage,
        coin: &mut impl CommonCoin,
    ) -> Result<Vec<AbaMessage>, SignError> {
        let mut outgoing = Vec::new();
        if self.terminated {
            return Ok(outgoing);
        }

        match message {
            AbaMessage::BVal { round, value } => {
                let received = self.bval_received.entry(round).or_default();
                if !received[value as usize].insert(from) {
                    return Ok(outgoing);
                }
                let count = received[value as usize].len();
                if count > self.f {
                    self.send_bval(round, value, &mut outgoing);
                }
                if count >= 2 * self.f + 1 {
                    self.bin_values.entry(round).or_default()[value as usize] = true;
                }
            }

            AbaMessage::Aux { round, value } => {
                self.aux_received.entry(round).or_default().entry(from).or_insert(value);
            }

            AbaMessage::Term(value) => {
                let received = &mut self.term_received[value as usize];
                received.insert(from);
                let count = received.len();
                if count > self.f && self.decision.is_none() {
                    self.decide(value, &mut outgoing);
                }
                if count >= 2 * self.f + 1 {
                    self.terminated = true;
                    return Ok(outgoing);
                }
            }
        }

        self.try_progress(coin, &mut outgoing)?;
        Ok(outgoing)
    }

    fn try_progress(
        &mut self,
        coin: &mut impl CommonCoin,
        outgoing: &mut Vec<AbaMessage>,
    ) -> Result<(), SignError> {
        while !self.terminated && self.estimate.is_some() {
            let round = self.round;
            let bin_values = self.bin_values.get(&round).copied().unwrap_or_default();

            if !self.aux_sent.contains(&round) {
                let value = match bin_values {
                    [_, true] => true,
                    [true, false] => false,
                    [false, false] => return Ok(()),
                };
                self.aux_sent.insert(round);
                outgoing.push(AbaMessage::Aux { round, value });
            }

            let mut values = [false; 2];
            let mut supporters = 0;
            if let Some(aux) = self.aux_received.get(&round) {
                for value in aux.values() {
                    if bin_values[*value as usize] {
                        values[*value as usize] = true;
                        supporters += 1;
                    }
                }
            }
            if supporters < self.n - self.f {
                return Ok(());
            }

            let coin_value = coin.flip(self.instance, round)?;
            let estimate = match values {
                [true, false] => false,
                [false, true] => true,
                _ => coin_value,
            };
            if values != [true, true] && estimate == coin_value && self.decision.is_none() {
                self.decide(estimate, outgoing);
            }

            self.estimate = Some(estimate);
            self.round += 1;
            self.send_bval(self.round, estimate, outgoing);
        }
        Ok(())
    }

    fn send_bval(&mut self, round: u32, value: bool, outgoing: &mut Vec<AbaMessage>) {
        let sent = self.bval_sent.entry(round).or_default();
        if !sent[value as usize] {
            sent[value as usize] = true;
            outgoing.push(AbaMessage::BVal { round, value });
        }
    }

    fn decide(&mut self, value: bool, outgoing: &mut Vec<AbaMessage>) {
        self.decision = Some(value);
        if !self.term_sent {
            self.term_sent = true;
            outgoing.push(AbaMessage::Term(value));
        }
    }
}
