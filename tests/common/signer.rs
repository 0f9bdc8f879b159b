//! A mock threshold signer.
//!
//! Real threshold signatures are unique for a payload, whichever quorum of shares produced them. The
//! mock keeps that property by deriving the "aggregated signature" from a committee secret that every
//! member's signer holds, so no messages between signers are needed.

use anchor_chain::{
    signer::{SignError, SignRequest, ThresholdSigner},
    types::{anchor::Address, data_types::CryptoHash},
};

#[derive(Clone)]
pub(crate) struct MockSigner {
    address: Address,
    committee_secret: [u8; 32],
    index: u16,
}

impl MockSigner {
    pub(crate) fn new(address: Address, committee_secret: [u8; 32], index: u16) -> MockSigner {
        MockSigner {
            address,
            committee_secret,
            index,
        }
    }

    /// The signature that every member of the committee holding `committee_secret` produces over `payload`.
    pub(crate) fn signature(committee_secret: &[u8; 32], payload: &[u8]) -> Vec<u8> {
        CryptoHash::of(&[b"mock-threshold", committee_secret, payload])
            .bytes()
            .to_vec()
    }
}

impl ThresholdSigner for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn index_proposal(&self) -> Vec<u16> {
        vec![self.index]
    }

    fn sign(&mut self, request: SignRequest) -> Result<Vec<u8>, SignError> {
        Ok(MockSigner::signature(&self.committee_secret, &request.payload))
    }
}
