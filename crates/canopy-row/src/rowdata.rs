//! Self-describing row encoding.
//!
//! ```text
//!  +0   record length   u32 LE
//!  +4   "AB"
//!  +6   field count     u16 LE
//!  +8   row def id      u32 LE
//!  +12  null bitmap     (fields + 7) / 8 bytes, bit set = null
//!  ...  non-null values in field order
//!         integers at declared width, LE
//!         var fields: 1-byte length (max <= 255) or 2-byte LE length, then bytes
//!  -6   "BA"
//!  -4   record length   u32 LE
//! ```
//!
//! A stored group-tree value is exactly these bytes.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use canopy_common::constants::{MAX_ROW_SIZE, ROW_ENVELOPE_SIZE};
use canopy_common::types::{TableId, Value};

use crate::error::{RowResult, RowStoreError};
use crate::schema::{FieldType, FieldValue, RowDef};

const SIGNATURE_HEAD: &[u8; 2] = b"AB";
const SIGNATURE_TAIL: &[u8; 2] = b"BA";
const HEADER_SIZE: usize = 12;
const TRAILER_SIZE: usize = 6;

/// An encoded row bound to one table definition.
#[derive(Clone, PartialEq, Eq)]
pub struct RowData {
    bytes: Bytes,
}

impl RowData {
    /// Encodes a row. Missing trailing values are null.
    pub fn new(def: &RowDef, values: &[FieldValue]) -> RowResult<Self> {
        let invalid = |reason: String| RowStoreError::InvalidRow {
            table: def.qualified_name(),
            reason,
        };
        let field_count = def.field_count();
        if values.len() > field_count {
            return Err(invalid(format!(
                "{} values for {field_count} fields",
                values.len()
            )));
        }

        let bitmap_len = bitmap_len(field_count);
        let mut bitmap = vec![0u8; bitmap_len];
        let mut body = BytesMut::new();
        for (i, field) in def.fields().iter().enumerate() {
            let value = values.get(i).unwrap_or(&FieldValue::Null);
            match (field.field_type, value) {
                (_, FieldValue::Null) => bitmap[i / 8] |= 1 << (i % 8),
                (ty, FieldValue::Int(v)) if ty.int_range().is_some() => {
                    let (min, max) = ty.int_range().unwrap_or((i64::MIN, i64::MAX));
                    if *v < min || *v > max {
                        return Err(invalid(format!("{} out of range for {}", v, field.name)));
                    }
                    put_int(&mut body, ty, *v);
                }
                (FieldType::Varchar { max }, FieldValue::Str(s)) => {
                    put_var(&mut body, field.field_type, max, s.as_bytes())
                        .map_err(|len| invalid(format!("{len} bytes exceed {}", field.name)))?;
                }
                (FieldType::Varbinary { max }, FieldValue::Bytes(b)) => {
                    put_var(&mut body, field.field_type, max, b)
                        .map_err(|len| invalid(format!("{len} bytes exceed {}", field.name)))?;
                }
                (ty, value) => {
                    return Err(invalid(format!(
                        "value {value} does not fit {} ({ty:?})",
                        field.name
                    )));
                }
            }
        }

        let total = HEADER_SIZE + bitmap_len + body.len() + TRAILER_SIZE;
        if total > MAX_ROW_SIZE {
            return Err(invalid(format!("{total} bytes exceed the row size limit")));
        }
        let mut out = BytesMut::with_capacity(total);
        out.put_u32_le(total as u32);
        out.put_slice(SIGNATURE_HEAD);
        out.put_u16_le(field_count as u16);
        out.put_u32_le(def.id().as_u32());
        out.put_slice(&bitmap);
        out.put_slice(&body);
        out.put_slice(SIGNATURE_TAIL);
        out.put_u32_le(total as u32);
        Ok(Self {
            bytes: out.freeze(),
        })
    }

    /// Wraps stored bytes after checking the envelope.
    pub fn from_bytes(bytes: Bytes) -> RowResult<Self> {
        let len = bytes.len();
        if len < ROW_ENVELOPE_SIZE {
            return Err(RowStoreError::corruption(format!(
                "row of {len} bytes is shorter than its envelope"
            )));
        }
        let mut head = &bytes[..HEADER_SIZE];
        let leading = head.get_u32_le() as usize;
        let signature = [head.get_u8(), head.get_u8()];
        let field_count = head.get_u16_le() as usize;
        let mut tail = &bytes[len - 4..];
        let trailing = tail.get_u32_le() as usize;

        if leading != len || trailing != len {
            return Err(RowStoreError::corruption(format!(
                "row length markers {leading}/{trailing} do not match {len} bytes"
            )));
        }
        if &signature != SIGNATURE_HEAD || &bytes[len - TRAILER_SIZE..len - 4] != SIGNATURE_TAIL {
            return Err(RowStoreError::corruption("row signature mismatch"));
        }
        if HEADER_SIZE + bitmap_len(field_count) + TRAILER_SIZE > len {
            return Err(RowStoreError::corruption(format!(
                "{field_count} fields do not fit a {len}-byte row"
            )));
        }
        Ok(Self { bytes })
    }

    /// Wraps a stored value.
    pub fn from_value(value: Value) -> RowResult<Self> {
        Self::from_bytes(value.into_bytes())
    }

    /// Fails with corruption unless the row belongs to `expected`.
    pub fn validate_for(&self, expected: TableId) -> RowResult<()> {
        let actual = self.row_def_id();
        if actual != expected {
            return Err(RowStoreError::corruption(format!(
                "row def id {actual} where {expected} was expected"
            )));
        }
        Ok(())
    }

    /// Id of the table the row was encoded for.
    #[must_use]
    pub fn row_def_id(&self) -> TableId {
        let mut id = &self.bytes[8..12];
        TableId::new(id.get_u32_le())
    }

    /// Number of fields in the envelope.
    #[must_use]
    pub fn field_count(&self) -> usize {
        let mut count = &self.bytes[6..8];
        count.get_u16_le() as usize
    }

    /// Returns true if field `i` is null or absent.
    #[must_use]
    pub fn is_null(&self, i: usize) -> bool {
        if i >= self.field_count() {
            return true;
        }
        self.bytes[HEADER_SIZE + i / 8] & (1 << (i % 8)) != 0
    }

    /// Offset and size of field `i`'s encoded value, prefix included.
    /// `None` for a null field.
    #[must_use]
    pub fn field_location(&self, def: &RowDef, i: usize) -> Option<(usize, usize)> {
        if i >= def.field_count() || self.is_null(i) {
            return None;
        }
        let end = self.bytes.len() - TRAILER_SIZE;
        let mut offset = HEADER_SIZE + bitmap_len(self.field_count());
        for (j, field) in def.fields().iter().enumerate().take(i + 1) {
            if self.is_null(j) {
                continue;
            }
            let size = self.encoded_size(field.field_type, offset)?;
            if offset + size > end {
                return None;
            }
            if j == i {
                return Some((offset, size));
            }
            offset += size;
        }
        None
    }

    fn encoded_size(&self, ty: FieldType, offset: usize) -> Option<usize> {
        if let Some(width) = ty.fixed_width() {
            return Some(width);
        }
        let mut prefix = self.bytes.get(offset..offset + ty.prefix_width())?;
        let len = if ty.prefix_width() == 1 {
            prefix.get_u8() as usize
        } else {
            prefix.get_u16_le() as usize
        };
        Some(ty.prefix_width() + len)
    }

    /// Decodes field `i`.
    pub fn value(&self, def: &RowDef, i: usize) -> RowResult<FieldValue> {
        let Some(field) = def.fields().get(i) else {
            return Err(RowStoreError::corruption(format!(
                "field {i} not in {}",
                def.qualified_name()
            )));
        };
        if self.is_null(i) {
            return Ok(FieldValue::Null);
        }
        let (offset, size) = self.field_location(def, i).ok_or_else(|| {
            RowStoreError::corruption(format!(
                "field {} overruns a {}-byte row",
                field.name,
                self.bytes.len()
            ))
        })?;
        let mut raw = &self.bytes[offset..offset + size];
        let ty = field.field_type;
        let value = match ty {
            FieldType::TinyInt => FieldValue::Int(i64::from(raw.get_i8())),
            FieldType::SmallInt => FieldValue::Int(i64::from(raw.get_i16_le())),
            FieldType::Int => FieldValue::Int(i64::from(raw.get_i32_le())),
            FieldType::BigInt => FieldValue::Int(raw.get_i64_le()),
            FieldType::Varchar { .. } => {
                let payload = &raw[ty.prefix_width()..];
                let s = std::str::from_utf8(payload).map_err(|e| {
                    RowStoreError::corruption(format!("field {}: {e}", field.name))
                })?;
                FieldValue::Str(s.to_string())
            }
            FieldType::Varbinary { .. } => FieldValue::Bytes(raw[ty.prefix_width()..].to_vec()),
        };
        Ok(value)
    }

    /// Decodes every field.
    pub fn values(&self, def: &RowDef) -> RowResult<Vec<FieldValue>> {
        (0..def.field_count()).map(|i| self.value(def, i)).collect()
    }

    /// Compares field `i` of two rows byte for byte.
    #[must_use]
    pub fn fields_equal(&self, other: &RowData, def: &RowDef, i: usize) -> bool {
        match (self.field_location(def, i), other.field_location(def, i)) {
            (None, None) => self.is_null(i) == other.is_null(i),
            (Some((a, an)), Some((b, bn))) => {
                self.bytes[a..a + an] == other.bytes[b..b + bn]
            }
            _ => false,
        }
    }

    /// Copy of the row with every field `keep` rejects set to null.
    pub fn elide(&self, def: &RowDef, keep: impl Fn(usize) -> bool) -> RowResult<RowData> {
        if (0..def.field_count()).all(|i| keep(i) || self.is_null(i)) {
            return Ok(self.clone());
        }
        let values: Vec<FieldValue> = self
            .values(def)?
            .into_iter()
            .enumerate()
            .map(|(i, v)| if keep(i) { v } else { FieldValue::Null })
            .collect();
        RowData::new(def, &values)
    }

    /// The encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The encoded bytes as a stored value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::from_raw(self.bytes.clone())
    }

    /// Encoded length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; an encoded row carries at least its envelope.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for RowData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowData")
            .field("row_def_id", &self.row_def_id())
            .field("fields", &self.field_count())
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn bitmap_len(field_count: usize) -> usize {
    (field_count + 7) / 8
}

fn put_int(out: &mut BytesMut, ty: FieldType, v: i64) {
    // Range was checked by the caller.
    match ty {
        FieldType::TinyInt => out.put_i8(v as i8),
        FieldType::SmallInt => out.put_i16_le(v as i16),
        FieldType::Int => out.put_i32_le(v as i32),
        _ => out.put_i64_le(v),
    }
}

fn put_var(out: &mut BytesMut, ty: FieldType, max: u16, payload: &[u8]) -> Result<(), usize> {
    if payload.len() > max as usize {
        return Err(payload.len());
    }
    if ty.prefix_width() == 1 {
        out.put_u8(payload.len() as u8);
    } else {
        out.put_u16_le(payload.len() as u16);
    }
    out.put_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, SchemaBuilder, TableSpec};

    fn def() -> std::sync::Arc<RowDef> {
        let schema = SchemaBuilder::new()
            .table(
                TableSpec::new(5, "s", "t")
                    .field("id", FieldType::Int)
                    .nullable_field("small", FieldType::SmallInt)
                    .nullable_field("name", FieldType::Varchar { max: 300 })
                    .nullable_field("blob", FieldType::Varbinary { max: 8 })
                    .nullable_field("big", FieldType::BigInt)
                    .primary_key(&[0]),
            )
            .build()
            .unwrap();
        schema.require(TableId::new(5)).unwrap().clone()
    }

    #[test]
    fn test_layout() {
        let def = def();
        let row = RowData::new(&def, &[1.into(), FieldValue::Null, "ab".into()]).unwrap();
        let bytes = row.as_bytes();
        // header 12 + bitmap 1 + int 4 + varchar (2 + 2) + trailer 6
        assert_eq!(bytes.len(), 27);
        assert_eq!(&bytes[4..6], b"AB");
        assert_eq!(bytes[12], 0b0001_1010);
        assert_eq!(&bytes[13..17], &1i32.to_le_bytes());
        assert_eq!(&bytes[17..21], &[2, 0, b'a', b'b']);
        assert_eq!(&bytes[21..23], b"BA");
        assert_eq!(row.row_def_id(), TableId::new(5));
        assert_eq!(row.field_location(&def, 2), Some((17, 4)));
        assert_eq!(row.field_location(&def, 1), None);
    }

    #[test]
    fn test_values() {
        let def = def();
        let values = vec![
            FieldValue::Int(-7),
            FieldValue::Int(300),
            FieldValue::from("héllo"),
            FieldValue::Bytes(vec![0, 1, 2]),
            FieldValue::Int(i64::MIN),
        ];
        let row = RowData::new(&def, &values).unwrap();
        assert_eq!(row.values(&def).unwrap(), values);

        let reread = RowData::from_bytes(Bytes::copy_from_slice(row.as_bytes())).unwrap();
        assert_eq!(reread, row);
    }

    #[test]
    fn test_rejects_bad_values() {
        let def = def();
        assert!(RowData::new(&def, &[FieldValue::Int(1 << 40)]).is_err());
        assert!(RowData::new(&def, &[1.into(), "x".into()]).is_err());
        let long_blob = FieldValue::Bytes(vec![0; 9]);
        assert!(RowData::new(&def, &[1.into(), FieldValue::Null, FieldValue::Null, long_blob]).is_err());
    }

    #[test]
    fn test_envelope_checks() {
        let def = def();
        let row = RowData::new(&def, &[1.into()]).unwrap();
        let mut bytes = row.as_bytes().to_vec();
        assert!(RowData::from_bytes(Bytes::from(bytes[..10].to_vec())).is_err());

        bytes[5] = b'X';
        let err = RowData::from_bytes(Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, RowStoreError::Corruption { .. }));

        assert!(row.validate_for(TableId::new(5)).is_ok());
        assert!(row.validate_for(TableId::new(6)).is_err());
    }

    #[test]
    fn test_fields_equal_and_elide() {
        let def = def();
        let a = RowData::new(&def, &[1.into(), 2.into(), "x".into()]).unwrap();
        let b = RowData::new(&def, &[1.into(), 3.into(), "x".into()]).unwrap();
        assert!(a.fields_equal(&b, &def, 0));
        assert!(!a.fields_equal(&b, &def, 1));
        assert!(a.fields_equal(&b, &def, 2));
        assert!(a.fields_equal(&b, &def, 4));

        let elided = a.elide(&def, |i| i == 0).unwrap();
        assert_eq!(elided.value(&def, 0).unwrap(), FieldValue::Int(1));
        assert!(elided.is_null(1));
        assert!(elided.is_null(2));
    }
}
