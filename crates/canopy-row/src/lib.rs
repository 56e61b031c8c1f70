//! # canopy-row
//!
//! Hierarchical row storage over the canopy key-value substrate.
//!
//! Tables are declared in parent/child hierarchies. Every hierarchy is a
//! *group* stored in one tree, where each row's key (its *hkey*) extends its
//! parent's, so a parent row is immediately followed by its descendants:
//!
//! ```text
//!   {1,7}              customer 7
//!   {1,7,2,10}         ├── order 10
//!   {1,7,2,10,3,1}     │   └── item 1
//!   {1,7,2,11}         └── order 11
//!   {1,8}              customer 8
//! ```
//!
//! This crate provides:
//!
//! - **Schema**: table, group and index definitions ([`RowDefCache`])
//! - **Rows**: the self-describing row envelope ([`RowData`])
//! - **Hkeys**: row, index and hkey key mapping ([`row_hkey`])
//! - **Mutations**: retried transactional writes, index maintenance and
//!   post-commit listeners ([`RowStore`])
//! - **Scans**: the paginated row collector ([`RowCollector`])
//! - **Status**: per-table counters persisted in the background
//! - **Analysis**: sampled index histograms ([`TableStatistics`])
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use canopy_common::config::StoreConfig;
//! use canopy_common::types::TableId;
//! use canopy_row::{FieldType, RowBuffer, RowData, RowStore, ScanRequest, SchemaBuilder, TableSpec};
//! use canopy_storage::Database;
//!
//! let schema = SchemaBuilder::new()
//!     .table(
//!         TableSpec::new(1, "shop", "customer")
//!             .field("id", FieldType::BigInt)
//!             .primary_key(&[0]),
//!     )
//!     .build()
//!     .unwrap();
//! let store = RowStore::open(Arc::new(Database::new()), schema, StoreConfig::for_testing()).unwrap();
//!
//! let def = Arc::clone(store.schema().require(TableId::new(1)).unwrap());
//! store.write_row(&RowData::new(&def, &[7.into()]).unwrap()).unwrap();
//!
//! let mut scan = store.new_scan(ScanRequest::new(TableId::new(1))).unwrap();
//! let mut buffer = RowBuffer::new(4096);
//! while scan.collect_next_batch(&mut buffer).unwrap() {
//!     buffer.clear();
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod analysis;
mod buffer;
mod collector;
mod error;
mod hkey;
mod index;
mod listener;
mod retry;
mod rowdata;
mod scan;
pub mod schema;
mod status;
mod store;

pub use analysis::{Histogram, HistogramSample, TableStatistics, ANALYSIS_TREE};
pub use buffer::{RowBuffer, RowIter};
pub use collector::{CollectorStats, RowCollector};
pub use error::{RowResult, RowStoreError};
pub use hkey::{index_key_to_hkey, row_hkey, row_to_index_key};
pub use index::{IndexMaintainer, IndexSelector};
pub use listener::{ListenerError, ListenerId, RowEvent, RowEventKind, UpdateListener};
pub use rowdata::RowData;
pub use scan::{ColumnSet, ScanFlags, ScanRequest};
pub use schema::{
    FieldDef, FieldType, FieldValue, IndexDef, IndexSpec, RowDef, RowDefCache, SchemaBuilder,
    TableSpec,
};
pub use status::{TableStatus, TableStatusCache, TableStatusFlusher, STATUS_TREE};
pub use store::RowStore;
