//! # canopy-test
//!
//! Integration tests for canopy.
//!
//! This crate contains:
//! - Schema and store fixtures shared by the tests in `tests/`
//! - Seeded workload generators

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Schema, store and scan helpers
pub mod fixtures;

/// Workload generators
pub mod workload;
