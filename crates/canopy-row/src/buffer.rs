//! Scan output buffer.
//!
//! ```text
//!  | len u32 LE | row bytes ... | len u32 LE | row bytes ... |  ...free...  |
//!  ^0                                        ^mark          ^len          ^capacity
//! ```
//!
//! The collector marks the buffer after the leaf row of each complete row
//! window and resets to the mark when a later row does not fit.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use canopy_common::constants::ROW_PREFIX_SIZE;

use crate::error::{RowResult, RowStoreError};
use crate::rowdata::RowData;

/// Fixed-capacity buffer of length-prefixed rows.
#[derive(Debug)]
pub struct RowBuffer {
    buf: BytesMut,
    capacity: usize,
    mark: usize,
}

impl RowBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            mark: 0,
        }
    }

    /// Maximum number of bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing is written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Free bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Empties the buffer and the mark.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.mark = 0;
    }

    /// Bytes up to the mark.
    #[must_use]
    pub fn marked_len(&self) -> usize {
        self.mark
    }

    pub(crate) fn mark(&mut self) {
        self.mark = self.buf.len();
    }

    pub(crate) fn reset(&mut self) {
        self.buf.truncate(self.mark);
    }

    /// Appends a row if it fits. Returns false, leaving the buffer unchanged,
    /// if it does not.
    pub(crate) fn try_put(&mut self, row: &RowData) -> bool {
        if ROW_PREFIX_SIZE + row.len() > self.remaining() {
            return false;
        }
        self.buf.put_u32_le(row.len() as u32);
        self.buf.put_slice(row.as_bytes());
        true
    }

    /// The written bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Decodes the written rows in order.
    pub fn rows(&self) -> RowIter {
        RowIter {
            bytes: Bytes::copy_from_slice(&self.buf),
        }
    }
}

/// Iterator over the rows of a [`RowBuffer`].
#[derive(Debug)]
pub struct RowIter {
    bytes: Bytes,
}

impl Iterator for RowIter {
    type Item = RowResult<RowData>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }
        if self.bytes.len() < ROW_PREFIX_SIZE {
            let err = RowStoreError::corruption("truncated row length prefix");
            self.bytes.clear();
            return Some(Err(err));
        }
        let len = self.bytes.get_u32_le() as usize;
        if len > self.bytes.len() {
            let err = RowStoreError::corruption(format!(
                "row of {len} bytes overruns the buffer"
            ));
            self.bytes.clear();
            return Some(Err(err));
        }
        Some(RowData::from_bytes(self.bytes.split_to(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, SchemaBuilder, TableSpec};
    use canopy_common::types::TableId;

    fn rows() -> Vec<RowData> {
        let schema = SchemaBuilder::new()
            .table(TableSpec::new(1, "s", "t").field("id", FieldType::BigInt).primary_key(&[0]))
            .build()
            .unwrap();
        let def = schema.require(TableId::new(1)).unwrap();
        (0..3).map(|i| RowData::new(def, &[i.into()]).unwrap()).collect()
    }

    #[test]
    fn test_put_mark_reset() {
        let rows = rows();
        let size = ROW_PREFIX_SIZE + rows[0].len();
        let mut buf = RowBuffer::new(size * 2 + 1);

        assert!(buf.try_put(&rows[0]));
        buf.mark();
        assert!(buf.try_put(&rows[1]));
        assert!(!buf.try_put(&rows[2]));
        assert_eq!(buf.len(), size * 2);

        buf.reset();
        assert_eq!(buf.len(), size);
        assert_eq!(buf.marked_len(), size);

        let decoded: Vec<RowData> = buf.rows().collect::<RowResult<_>>().unwrap();
        assert_eq!(decoded, vec![rows[0].clone()]);

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.marked_len(), 0);
    }
}
