/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" newtypes that are sent around and inspected, but have no active behavior.
//!
//! Each type wraps a primitive and exposes a small API: a `new` constructor, an accessor for the
//! wrapped value (`int`, `bytes`), and the arithmetic that the rest of the crate actually needs.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign},
    time::{Duration, SystemTime},
};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{SignatureError, VerifyingKey};
use sha2::Digest;

use super::crypto_primitives::CryptoHasher;

/// Identifier of a chain. Included in every consensus message so that messages of one chain are never
/// mistaken for messages of another chain served by the same peering group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct ChainID([u8; 32]);

impl ChainID {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for ChainID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[0..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for ChainID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A SHA256 digest. Used for trie nodes, block hashes, request IDs, and transaction IDs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Default)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Hash the concatenation of `parts`.
    pub fn of(parts: &[&[u8]]) -> Self {
        let mut hasher = CryptoHasher::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[0..6] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Index of a state in the chain. The origin state has index 0, and every accepted block advances it
/// by exactly one.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Default,
)]
pub struct StateIndex(u32);

impl StateIndex {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// The next state index, or `None` on overflow.
    pub fn next(&self) -> Option<StateIndex> {
        self.0.checked_add(1).map(StateIndex)
    }
}

impl Display for StateIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identifies one consensus instance of a committee: the state index of the base anchor that the
/// committee log expects the instance to build on, and the number of earlier attempts on that index.
///
/// Log indices are totally ordered by `(state_index, attempt)`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Default,
)]
pub struct LogIndex {
    pub state_index: StateIndex,
    pub attempt: u32,
}

impl LogIndex {
    pub const fn new(state_index: StateIndex, attempt: u32) -> Self {
        Self { state_index, attempt }
    }

    pub fn next_attempt(&self) -> LogIndex {
        LogIndex::new(self.state_index, self.attempt.saturating_add(1))
    }
}

impl Display for LogIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.state_index, self.attempt)
    }
}

/// A point in time, stored as nanoseconds since the Unix Epoch.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_unix_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn unix_nanos(&self) -> u64 {
        self.0
    }

    /// The zero timestamp signals a failed time aggregation.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    pub fn saturating_sub(&self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(duration.as_nanos() as u64))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let nanos = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|duration| duration.as_nanos() as u64)
            .unwrap_or(0);
        Timestamp(nanos)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identity of a committee member: the bytes of its Ed25519 verifying key.
///
/// Committee members are always iterated in ascending order of these bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct NodeID([u8; 32]);

impl NodeID {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.0)
    }
}

impl From<&VerifyingKey> for NodeID {
    fn from(verifying_key: &VerifyingKey) -> Self {
        NodeID(verifying_key.to_bytes())
    }
}

impl From<VerifyingKey> for NodeID {
    fn from(verifying_key: VerifyingKey) -> Self {
        NodeID(verifying_key.to_bytes())
    }
}

impl Display for NodeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[0..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for NodeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Hashed name of a contract or of an entry point. Contract state lives in a realm prefixed by the
/// contract's hname.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Hname(u32);

impl Hname {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Derive the hname of `name`: the first four bytes of its SHA256 digest, read little-endian.
    pub fn from_name(name: &str) -> Self {
        let digest = CryptoHash::of(&[name.as_bytes()]).bytes();
        Self(u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl Display for Hname {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl Debug for Hname {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Version of the on-chain state layout, advanced by migrations.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Default,
)]
pub struct SchemaVersion(u32);

impl SchemaVersion {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for SchemaVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Amount of gas burned by, or budgeted for, request execution.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Default,
)]
pub struct GasUnits(u64);

impl GasUnits {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Add for GasUnits {
    type Output = GasUnits;
    fn add(self, rhs: GasUnits) -> Self::Output {
        GasUnits(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for GasUnits {
    fn add_assign(&mut self, rhs: GasUnits) {
        self.0 = self.0.saturating_add(rhs.0)
    }
}

/// An Ed25519 signature in its byte representation.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[0..6] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Size of a buffer, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct BufferSize(u64);

impl BufferSize {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}
