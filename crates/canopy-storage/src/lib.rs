//! # canopy-storage
//!
//! Ordered key-value trees for canopy.
//!
//! This crate is the substrate the hierarchical row engine runs on. It
//! provides:
//!
//! - **Keys**: order-preserving, self-delimiting segment encoding ([`Key`])
//! - **Trees**: named sorted maps inside a [`Database`]
//! - **Transactions**: optimistic, with a retryable rollback outcome
//! - **Exchanges**: owned cursors that step under a structural [`KeyFilter`]
//! - **Descriptors**: a fixed-size header describing each tree's key layout
//! - **Histograms**: sampled key distributions for index analysis
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Database                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐   │
//! │  │ tree "g.1"   │  │ tree "i.2.1" │  │ "_descriptors" │   │
//! │  │ BTreeMap +   │  │ BTreeMap +   │  │ name → header  │   │
//! │  │ version      │  │ version      │  └────────────────┘   │
//! │  └──────▲───────┘  └──────▲───────┘                       │
//! │         │ committed reads │                               │
//! └─────────┼─────────────────┼───────────────────────────────┘
//!           │                 │
//!     ┌─────┴─────┐     ┌─────┴───────┐
//!     │ Exchange  │────▶│ Transaction │  write set + read versions
//!     │ key/value │     └─────────────┘  commit: validate, apply
//!     └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use canopy_storage::{Database, Direction, KeyDescriptor};
//! use canopy_common::types::{TableId, Value};
//!
//! let db = Database::new();
//! db.create_tree("orders", KeyDescriptor::hkey(TableId::new(1))).unwrap();
//!
//! let mut txn = db.begin();
//! let mut ex = db.exchange("orders");
//! ex.clear().append_int(1).append_int(42);
//! ex.store(&mut txn, Value::from_bytes(b"row")).unwrap();
//! txn.commit().unwrap();
//!
//! ex.clear().append_before();
//! assert!(ex.traverse(&db, Direction::GtEq, None).unwrap());
//! assert_eq!(ex.key().depth(), 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod database;
mod descriptor;
mod error;
mod exchange;
mod filter;
mod histogram;
mod key;
mod transaction;

pub use database::{Database, KvRead, Seek};
pub use descriptor::{KeyDescriptor, DESCRIPTOR_HEADER_SIZE};
pub use error::{StoreError, StoreResult};
pub use exchange::{Direction, Exchange};
pub use filter::{KeyFilter, Term, TermBound};
pub use histogram::{KeyCount, KeyHistogram};
pub use key::{Key, KeySegment, AFTER_EDGE, BEFORE_EDGE};
pub use transaction::Transaction;
