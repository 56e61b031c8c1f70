//! Canopy Performance Benchmarks
//!
//! This crate contains benchmarks for the canopy row engine:
//! - hkey construction and key segment encoding
//! - Row writes with immediate and deferred index maintenance
//! - Group, table and index scans at several buffer sizes
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench -p canopy-bench
//! ```

pub mod utils;
