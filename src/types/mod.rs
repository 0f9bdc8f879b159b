/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of a chain node.
//!
//! Other types, specific to single components, can be found in those components' modules, e.g.,
//! [`crate::cons::bp`].

pub mod anchor;

pub mod committee;

pub mod crypto_primitives;

pub mod data_types;

pub mod request;

pub mod transaction;

pub mod update_sets;
