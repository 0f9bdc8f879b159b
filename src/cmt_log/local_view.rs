/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A node's local view of the chain's anchor on the base ledger.
//!
//! The view keeps the latest anchor the ledger confirmed, and the anchors this node published on top of
//! it that the ledger has not confirmed yet, in chain order. The tip of the view is the last published
//! anchor, or the confirmed anchor if nothing is pending.
//!
//! A confirmation that does not match the head of the pending chain means that the ledger chose
//! another chain than the one this node assumed: a **reorganization**. The pending anchors are then
//! dropped, and the confirmed anchor becomes the tip.

use std::collections::VecDeque;

use crate::types::anchor::{AliasOutputWithID, OutputID};

#[derive(Clone, Debug, Default)]
pub struct LocalView {
    confirmed: Option<AliasOutputWithID>,
    pending: VecDeque<AliasOutputWithID>,
}

/// How a confirmation changed the view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewUpdate {
    pub tip_changed: bool,
    pub reorg: bool,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<&AliasOutputWithID> {
        self.pending.back().or(self.confirmed.as_ref())
    }

    pub fn confirmed(&self) -> Option<&AliasOutputWithID> {
        self.confirmed.as_ref()
    }

    /// Whether the tip of the view is confirmed.
    pub fn is_settled(&self) -> bool {
        self.confirmed.is_some() && self.pending.is_empty()
    }

    pub fn alias_output_confirmed(&mut self, alias_output: AliasOutputWithID) -> ViewUpdate {
        let previous_tip = self.tip().cloned();
        if self.confirmed.as_ref() == Some(&alias_output) {
            return ViewUpdate { tip_changed: false, reorg: false };
        }

        let reorg = match self.pending.iter().position(|pending| *pending == alias_output) {
            Some(position) => {
                self.pending.drain(..=position);
                false
            }
            None => {
                let reorg = !self.pending.is_empty()
                    || self
                        .confirmed
                        .as_ref()
                        .map_or(false, |confirmed| alias_output.state_index() <= confirmed.state_index());
                self.pending.clear();
                reorg
            }
        };
        self.confirmed = Some(alias_output);

        ViewUpdate {
            tip_changed: previous_tip.as_ref() != self.tip(),
            reorg,
        }
    }

    /// Record that this node published `alias_output`, which consumes the anchor `consumed`. Ignored,
    /// returning `false`, unless `consumed` is the current tip.
    pub fn alias_output_published(&mut self, consumed: &OutputID, alias_output: AliasOutputWithID) -> bool {
        match self.tip() {
            Some(tip) if tip.output_id == *consumed => {
                self.pending.push_back(alias_output);
                true
            }
            _ => false,
        }
    }

    /// Record that the ledger rejected `alias_output`. It and every pending anchor built on it are
    /// dropped. Returns whether the tip changed.
    pub fn alias_output_rejected(&mut self, alias_output: &AliasOutputWithID) -> bool {
        match self.pending.iter().position(|pending| pending == alias_output) {
            Some(position) => {
                self.pending.truncate(position);
                true
            }
            None => false,
        }
    }
}
