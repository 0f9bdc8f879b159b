/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Migrations of the on-chain state layout.
//!
//! The chain state records the [`SchemaVersion`] of its layout under a reserved key. A node's binary
//! knows a [`MigrationScheme`]: the oldest schema version it can still migrate from, and one
//! [`Migration`] for every version after that. Before a batch is executed, every pending migration is
//! applied in order, each one in its contract's realm, and the recorded version is advanced by one
//! after each.
//!
//! A chain whose recorded version lies outside `[base, latest]` cannot be executed by this binary
//! at all: either the binary is older than the chain, or the migrations the chain still needs have
//! been removed from the binary. Both are fatal.

use std::fmt::{self, Display, Formatter};

use crate::state::{paths, KVStore, StateDraft, StateReader};
use crate::types::{
    anchor::Address,
    data_types::{CryptoHash, GasUnits, Hname, SchemaVersion, StateIndex, Timestamp},
    request::{AgentID, Assets},
};

use super::context::{CallContext, ExecutionError};
use super::VMError;

pub type MigrationFn = Box<dyn Fn(&mut CallContext<'_>) -> Result<(), ExecutionError> + Send + Sync>;

/// One step of the state layout, applied to the realm of `contract`.
pub struct Migration {
    pub contract: Hname,
    pub name: String,
    apply: MigrationFn,
}

impl Migration {
    pub fn new(
        contract: Hname,
        name: &str,
        apply: impl Fn(&mut CallContext<'_>) -> Result<(), ExecutionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            contract,
            name: name.to_string(),
            apply: Box::new(apply),
        }
    }
}

pub struct MigrationScheme {
    base_schema_version: SchemaVersion,
    migrations: Vec<Migration>,
}

impl MigrationScheme {
    /// A scheme whose `migrations[i]` migrates a chain from version `base_schema_version + i` to
    /// version `base_schema_version + i + 1`.
    pub fn new(base_schema_version: SchemaVersion, migrations: Vec<Migration>) -> Self {
        Self {
            base_schema_version,
            migrations,
        }
    }

    /// A scheme with no migrations, at version 0.
    pub fn empty() -> Self {
        Self::new(SchemaVersion::new(0), Vec::new())
    }

    pub fn base_schema_version(&self) -> SchemaVersion {
        self.base_schema_version
    }

    pub fn latest_schema_version(&self) -> SchemaVersion {
        SchemaVersion::new(self.base_schema_version.int() + self.migrations.len() as u32)
    }

    /// Bring the state in `draft` to the latest schema version, returning the number of migrations
    /// applied.
    ///
    /// A new chain (a batch on top of the origin anchor, `anchor_state_index == 0`) is set to the latest
    /// version directly. Otherwise, the recorded version is checked against the scheme before anything
    /// is written, and the pending migrations are applied one by one.
    pub fn apply<K: KVStore>(
        &self,
        draft: &mut StateDraft<K>,
        anchor_state_index: StateIndex,
        timestamp: Timestamp,
    ) -> Result<usize, VMError> {
        let latest = self.latest_schema_version();
        if anchor_state_index.int() == 0 {
            draft.set_as(&paths::STATE_SCHEMA_VERSION, &latest);
            return Ok(0);
        }

        let mut current = draft.schema_version()?;
        if current < self.base_schema_version {
            return Err(MigrationError::SchemaVersionBehind {
                current,
                base: self.base_schema_version,
            }
            .into());
        }
        if current > latest {
            return Err(MigrationError::SchemaVersionAhead { current, latest }.into());
        }

        let mut applied = 0;
        while current < latest {
            let migration = &self.migrations[(current.int() - self.base_schema_version.int()) as usize];
            log::info!(
                "Migrations: applying '{}' to contract {}, schema version {}",
                migration.name,
                migration.contract,
                current
            );

            let mut ctx = CallContext::new(
                &*draft,
                migration.contract,
                AgentID::Address(Address(CryptoHash::default())),
                Assets::default(),
                timestamp,
                CryptoHash::default(),
                GasUnits::new(u64::MAX),
            );
            let result = (migration.apply)(&mut ctx);
            let (mutations, _) = ctx.finish()?;
            if let Err(error) = result {
                return Err(MigrationError::MigrationFailed { version: current, error }.into());
            }
            draft.apply(mutations);

            current = SchemaVersion::new(current.int() + 1);
            draft.set_as(&paths::STATE_SCHEMA_VERSION, &current);
            applied += 1;
        }
        Ok(applied)
    }
}

impl Default for MigrationScheme {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationError {
    /// The chain needs migrations that this binary no longer carries.
    SchemaVersionBehind { current: SchemaVersion, base: SchemaVersion },
    /// The chain was migrated by a newer binary.
    SchemaVersionAhead { current: SchemaVersion, latest: SchemaVersion },
    MigrationFailed { version: SchemaVersion, error: ExecutionError },
}

impl Display for MigrationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::SchemaVersionBehind { current, base } => write!(
                f,
                "schema version {} is older than the oldest supported version {}",
                current, base
            ),
            MigrationError::SchemaVersionAhead { current, latest } => write!(
                f,
                "schema version {} is newer than the latest known version {}",
                current, latest
            ),
            MigrationError::MigrationFailed { version, error } => {
                write!(f, "migration from schema version {} failed: {}", version, error)
            }
        }
    }
}
