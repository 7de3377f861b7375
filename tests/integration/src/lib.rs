//! Integration test utilities for the sharded gateway cluster
//!
//! This crate provides a mock gateway, in-process worker launchers and config
//! fixtures for end-to-end tests of shards and clusters.

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;
