//! # canopy-common
//!
//! Common types, errors, and configuration for canopy.
//!
//! This crate provides the foundational pieces shared by the storage
//! substrate and the hierarchical row engine:
//!
//! - **Types**: table and index identifiers, stored values
//! - **Errors**: the cross-crate `ErrorCode` taxonomy and `CanopyError`
//! - **Config**: `StoreConfig`, loadable from TOML
//! - **Constants**: engine-wide limits and defaults
//!
//! ## Example
//!
//! ```rust
//! use canopy_common::config::StoreConfig;
//! use canopy_common::types::{IndexId, TableId};
//!
//! let config = StoreConfig::default();
//! assert_eq!(config.max_transaction_retries, 10);
//! assert!(config.validate().is_ok());
//!
//! let table = TableId::new(3);
//! let index = IndexId::PRIMARY;
//! assert_eq!(table.as_u32(), 3);
//! assert!(index.is_primary());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use constants::*;
pub use error::{CanopyError, CanopyResult, ErrorCode};
pub use types::{IndexId, TableId, Value};
