//! Scan requests.

use canopy_common::types::{IndexId, TableId};

use crate::rowdata::RowData;

bitflags::bitflags! {
    /// Independent scan modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ScanFlags: u32 {
        /// Visit keys in descending order.
        const DESCENDING     = 0b0000_0001;
        /// Exclude rows equal to the start bound.
        const START_EXCLUSIVE = 0b0000_0010;
        /// Exclude rows equal to the end bound.
        const END_EXCLUSIVE  = 0b0000_0100;
        /// Stop after the first complete row window.
        const SINGLE_ROW     = 0b0000_1000;
        /// Treat the last end-bound column as a prefix.
        const PREFIX         = 0b0001_0000;
        /// Ignore the start row; begin at the edge of the key space.
        const START_AT_EDGE  = 0b0010_0000;
        /// Ignore the end row; run to the edge of the key space.
        const END_AT_EDGE    = 0b0100_0000;
        /// Include every descendant row below the projected tables.
        const DEEP           = 0b1000_0000;
    }
}

/// Column projection bitmap, one bit per column of the scanned table.
///
/// For a group table the bits address group columns, so each member table
/// owns the range starting at its column offset. An empty set projects the
/// scanned user table with every column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnSet {
    bits: Vec<u8>,
}

impl ColumnSet {
    /// No columns.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The first `count` columns.
    #[must_use]
    pub fn all(count: usize) -> Self {
        let mut set = Self::empty();
        for column in 0..count {
            set.insert(column);
        }
        set
    }

    /// The listed columns.
    #[must_use]
    pub fn from_columns(columns: &[usize]) -> Self {
        let mut set = Self::empty();
        for column in columns {
            set.insert(*column);
        }
        set
    }

    /// Wraps a raw bitmap; bit `i % 8` of byte `i / 8` is column `i`.
    #[must_use]
    pub fn from_bytes(bits: &[u8]) -> Self {
        Self {
            bits: bits.to_vec(),
        }
    }

    /// Adds a column.
    pub fn insert(&mut self, column: usize) {
        if self.bits.len() <= column / 8 {
            self.bits.resize(column / 8 + 1, 0);
        }
        self.bits[column / 8] |= 1 << (column % 8);
    }

    /// Returns true if the column is set.
    #[must_use]
    pub fn contains(&self, column: usize) -> bool {
        self.bits
            .get(column / 8)
            .is_some_and(|byte| byte & (1 << (column % 8)) != 0)
    }

    /// Returns true if any column in `range` is set.
    #[must_use]
    pub fn intersects(&self, range: std::ops::Range<usize>) -> bool {
        range.into_iter().any(|c| self.contains(c))
    }

    /// Returns true if no column is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// The raw bitmap.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

/// Everything a scan needs to start.
///
/// Bound rows are encoded for the scanned table (or group); only the columns
/// that constrain the range need values, the rest stay null.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Scanned user or group table.
    pub table_id: TableId,
    /// Index driving the scan, if any.
    pub index_id: Option<IndexId>,
    /// Scan modifiers.
    pub flags: ScanFlags,
    /// Lower bound row.
    pub start: Option<RowData>,
    /// Upper bound row.
    pub end: Option<RowData>,
    /// Projected columns.
    pub columns: ColumnSet,
}

impl ScanRequest {
    /// A full ascending scan of a table.
    #[must_use]
    pub fn new(table_id: TableId) -> Self {
        Self {
            table_id,
            index_id: None,
            flags: ScanFlags::empty(),
            start: None,
            end: None,
            columns: ColumnSet::empty(),
        }
    }

    /// Drives the scan from an index.
    #[must_use]
    pub fn with_index(mut self, index_id: IndexId) -> Self {
        self.index_id = Some(index_id);
        self
    }

    /// Adds scan flags.
    #[must_use]
    pub fn with_flags(mut self, flags: ScanFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the lower bound row.
    #[must_use]
    pub fn with_start(mut self, start: RowData) -> Self {
        self.start = Some(start);
        self
    }

    /// Sets the upper bound row.
    #[must_use]
    pub fn with_end(mut self, end: RowData) -> Self {
        self.end = Some(end);
        self
    }

    /// Sets the same row as both bounds.
    #[must_use]
    pub fn with_range(self, bound: RowData) -> Self {
        self.with_start(bound.clone()).with_end(bound)
    }

    /// Sets the projection.
    #[must_use]
    pub fn with_columns(mut self, columns: ColumnSet) -> Self {
        self.columns = columns;
        self
    }

    /// Returns true for a descending scan.
    #[must_use]
    pub fn is_descending(&self) -> bool {
        self.flags.contains(ScanFlags::DESCENDING)
    }
}
