//! Table, group and index definitions.
//!
//! A schema is declared with [`SchemaBuilder`] and built once into an
//! immutable [`RowDefCache`]. Each hierarchy of user tables becomes a group:
//!
//! ```text
//!   customer (1)                 group 1+2^30, tree "_group.1073741825"
//!   ├── order (2)                columns: customer$.. | order$.. | item$.. | addr$..
//!   │   └── item (3)             hkey depths: customer 2, order 4, item 6
//!   └── address (4)                           address 4
//! ```

mod builder;
mod cache;
mod field;
mod index_def;
mod row_def;

pub use builder::{IndexSpec, SchemaBuilder, TableSpec, GROUP_TABLE_ID_OFFSET, PRIMARY_INDEX_NAME};
pub use cache::RowDefCache;
pub use field::{FieldDef, FieldType, FieldValue};
pub use index_def::{IndexDef, H2I, I2H};
pub use row_def::{HKeyLevel, RowDef, TableKind};
