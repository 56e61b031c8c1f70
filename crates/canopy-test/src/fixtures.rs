//! Shared fixtures.
//!
//! The fixture schema is a three-level hierarchy:
//!
//! ```text
//!   a (1)   id, name?                       auto-increment id
//!   └── b (2)   id, aid, score, tag?        index "score", unique index "tag"
//!       └── c (3)   id, bid, note?
//! ```

use std::sync::{Arc, Once};

use canopy_common::config::StoreConfig;
use canopy_common::types::TableId;
use canopy_row::{
    CollectorStats, FieldType, FieldValue, IndexSpec, RowBuffer, RowData, RowDefCache, RowResult,
    RowStore, ScanRequest, SchemaBuilder, TableSpec,
};
use canopy_storage::Database;
use tracing_subscriber::EnvFilter;

/// Root table.
pub const A: TableId = TableId::new(1);
/// Child of `a`.
pub const B: TableId = TableId::new(2);
/// Child of `b`.
pub const C: TableId = TableId::new(3);

static TRACING: Once = Once::new();

/// Installs a test log subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Builds the fixture schema.
pub fn abc_schema() -> RowResult<RowDefCache> {
    SchemaBuilder::new()
        .table(
            TableSpec::new(1, "test", "a")
                .field("id", FieldType::BigInt)
                .nullable_field("name", FieldType::Varchar { max: 16 })
                .primary_key(&[0])
                .auto_increment(0),
        )
        .table(
            TableSpec::new(2, "test", "b")
                .field("id", FieldType::BigInt)
                .field("aid", FieldType::BigInt)
                .field("score", FieldType::Int)
                .nullable_field("tag", FieldType::Varchar { max: 16 })
                .primary_key(&[0])
                .parent(1, &[1])
                .index(IndexSpec::new(1, "score", &[2]))
                .index(IndexSpec::new(2, "tag", &[3]).unique()),
        )
        .table(
            TableSpec::new(3, "test", "c")
                .field("id", FieldType::BigInt)
                .field("bid", FieldType::BigInt)
                .nullable_field("note", FieldType::Varchar { max: 32 })
                .primary_key(&[0])
                .parent(2, &[1]),
        )
        .build()
}

/// What a drained scan produced.
#[derive(Debug)]
pub struct ScanOutput {
    /// Rows in delivery order.
    pub rows: Vec<RowData>,
    /// Rows as `<table><id>`, e.g. `b3`.
    pub labels: Vec<String>,
    /// Collector counters at the end of the scan.
    pub stats: CollectorStats,
    /// Calls to `collect_next_batch` that delivered at least one row.
    pub batches: usize,
}

/// A row store over a fresh database with the fixture schema.
#[derive(Debug)]
pub struct Fixture {
    /// The store under test.
    pub store: RowStore,
}

impl Fixture {
    /// Opens a fixture with the test configuration.
    pub fn new() -> RowResult<Self> {
        Self::with_config(StoreConfig::for_testing())
    }

    /// Opens a fixture with a custom configuration.
    pub fn with_config(config: StoreConfig) -> RowResult<Self> {
        Self::on(Arc::new(Database::new()), config)
    }

    /// Opens a fixture over an existing database.
    pub fn on(db: Arc<Database>, config: StoreConfig) -> RowResult<Self> {
        init_tracing();
        Ok(Self {
            store: RowStore::open(db, abc_schema()?, config)?,
        })
    }

    /// Encodes a row of `table`.
    pub fn row(&self, table: TableId, values: &[FieldValue]) -> RowResult<RowData> {
        RowData::new(self.store.schema().require(table)?, values)
    }

    /// An `a` row.
    pub fn a(&self, id: i64) -> RowData {
        self.row(A, &[id.into(), format!("a{id}").into()])
            .unwrap_or_else(|e| panic!("a{id}: {e}"))
    }

    /// A `b` row without a tag.
    pub fn b(&self, id: i64, aid: i64, score: i64) -> RowData {
        self.row(B, &[id.into(), aid.into(), score.into()])
            .unwrap_or_else(|e| panic!("b{id}: {e}"))
    }

    /// A `b` row with a tag.
    pub fn b_tagged(&self, id: i64, aid: i64, score: i64, tag: &str) -> RowData {
        self.row(B, &[id.into(), aid.into(), score.into(), tag.into()])
            .unwrap_or_else(|e| panic!("b{id}: {e}"))
    }

    /// A `c` row.
    pub fn c(&self, id: i64, bid: i64) -> RowData {
        self.row(C, &[id.into(), bid.into()])
            .unwrap_or_else(|e| panic!("c{id}: {e}"))
    }

    /// Writes rows in order.
    pub fn write(&self, rows: &[RowData]) -> RowResult<()> {
        for row in rows {
            self.store.write_row(row)?;
        }
        Ok(())
    }

    /// The three-level example: a1 with b1..b3, and c1, c2 under b1.
    pub fn populate_example(&self) -> RowResult<()> {
        self.write(&[
            self.a(1),
            self.b(1, 1, 30),
            self.b(2, 1, 20),
            self.b(3, 1, 10),
            self.c(1, 1),
            self.c(2, 1),
        ])
    }

    /// Runs a scan to completion with a buffer of `capacity` bytes.
    pub fn scan(&self, request: ScanRequest, capacity: usize) -> RowResult<ScanOutput> {
        let mut collector = self.store.new_scan(request)?;
        let mut buffer = RowBuffer::new(capacity);
        let mut output = ScanOutput {
            rows: Vec::new(),
            labels: Vec::new(),
            stats: CollectorStats::default(),
            batches: 0,
        };
        loop {
            buffer.clear();
            let more = collector.collect_next_batch(&mut buffer)?;
            if !buffer.is_empty() {
                output.batches += 1;
            }
            for row in buffer.rows() {
                let row = row?;
                output.labels.push(self.label(&row)?);
                output.rows.push(row);
            }
            if !more {
                break;
            }
        }
        output.stats = collector.stats();
        collector.close();
        Ok(output)
    }

    /// `<table><id>` for a row.
    pub fn label(&self, row: &RowData) -> RowResult<String> {
        let def = self.store.schema().require(row.row_def_id())?;
        Ok(format!("{}{}", def.table_name(), row.value(def, 0)?))
    }
}
