/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the anchor transaction that a consensus instance builds, signs, and submits.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    anchor::{AliasOutput, AliasOutputWithID, OutputID, TransactionID},
    data_types::CryptoHash,
};

/// The signed part of a [`Transaction`]: the outputs it consumes and the outputs it produces.
///
/// The first input is always the base anchor, and the first output is always the next anchor.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TransactionEssence {
    pub inputs: Vec<OutputID>,
    pub outputs: Vec<AliasOutput>,
}

impl TransactionEssence {
    pub fn id(&self) -> TransactionID {
        TransactionID(CryptoHash::of(&[&self.try_to_vec().unwrap()]))
    }

    /// The bytes that the committee signs.
    pub fn signing_message(&self) -> Vec<u8> {
        self.try_to_vec().unwrap()
    }

    /// The anchor produced by this essence, if any.
    pub fn next_anchor(&self) -> Option<AliasOutputWithID> {
        self.outputs
            .first()
            .map(|output| AliasOutputWithID::new(OutputID::new(self.id(), 0), output.clone()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub essence: TransactionEssence,
    /// Aggregated threshold signature of the committee over [`TransactionEssence::signing_message`].
    pub signature: Vec<u8>,
}

impl Transaction {
    pub fn id(&self) -> TransactionID {
        self.essence.id()
    }
}
