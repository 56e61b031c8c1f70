//! Hierarchical key construction.
//!
//! An hkey alternates ordinals and key values, one level per table from the
//! root down:
//!
//! ```text
//!  item (child of order, child of customer)
//!
//!  [ ordCustomer | c.id | ordOrder | o.id | ordItem | i.id ]
//!    \__ level 0 ______/ \__ level 1 ___/ \__ level 2 __/
//! ```
//!
//! A child row only carries its parent's key, not the whole ancestry, so the
//! ancestor levels are recovered from the parent's primary-key index: the
//! index key holds the parent's key followed by the rest of its hkey, and
//! [`index_key_to_hkey`] turns it back into an hkey.
//!
//! Segments are copied between keys as raw encoded bytes. The encoding is
//! order-preserving and self-delimiting, so no re-encoding is needed.

use canopy_common::types::TableId;
use canopy_storage::{Direction, Key, KvRead, Seek};

use crate::error::{RowResult, RowStoreError};
use crate::rowdata::RowData;
use crate::schema::{IndexDef, RowDef, RowDefCache, H2I, I2H};

/// Computes the hkey of `row`, reading ancestor positions through `reader`.
///
/// Fails with `NoReferencedRow` if the row's parent is not stored or the join
/// values are null.
pub fn row_hkey(
    schema: &RowDefCache,
    def: &RowDef,
    row: &RowData,
    reader: &impl KvRead,
) -> RowResult<Key> {
    let mut hkey = match def.parent() {
        None => Key::new(),
        Some(parent_id) => parent_hkey(schema, def, parent_id, row, reader)?,
    };
    hkey.append_int(i64::from(def.ordinal()));
    for field in def.pk_fields() {
        hkey.append_segment(&row.value(def, *field)?.to_segment());
    }
    Ok(hkey)
}

fn parent_hkey(
    schema: &RowDefCache,
    def: &RowDef,
    parent_id: TableId,
    row: &RowData,
    reader: &impl KvRead,
) -> RowResult<Key> {
    let parent = schema.require(parent_id)?;
    let mut join = Key::new();
    for field in def.parent_join_fields() {
        let value = row.value(def, *field)?;
        if value.is_null() {
            return Err(missing_parent(def, parent, &join_rendering(def, row)));
        }
        join.append_segment(&value.to_segment());
    }

    if parent.parent().is_none() {
        // A root's hkey is its ordinal and key; read the group tree directly.
        let mut hkey = Key::new();
        hkey.append_int(i64::from(parent.ordinal()));
        hkey.append_raw_segment(join.as_bytes());
        if reader.get(parent.tree_name(), hkey.as_bytes())?.is_none() {
            return Err(missing_parent(def, parent, &join.to_string()));
        }
        return Ok(hkey);
    }

    let pk_index = parent
        .primary_index()
        .ok_or_else(|| RowStoreError::corruption(format!("{} has no primary index", parent)))?;
    let seek = Seek::new(join.as_bytes().to_vec(), Direction::Gt);
    let found = reader.seek(pk_index.tree_name(), &seek)?.map(|(key, _)| Key::from(key));
    match found {
        Some(index_key) if join.is_strict_prefix_of(&index_key) => {
            index_key_to_hkey(schema, pk_index, &index_key)
        }
        _ => Err(missing_parent(def, parent, &join.to_string())),
    }
}

fn missing_parent(def: &RowDef, parent: &RowDef, key: &str) -> RowStoreError {
    RowStoreError::NoReferencedRow {
        table: def.qualified_name(),
        parent: parent.qualified_name(),
        key: key.to_string(),
    }
}

fn join_rendering(def: &RowDef, row: &RowData) -> String {
    let values: Vec<String> = def
        .parent_join_fields()
        .iter()
        .map(|f| row.value(def, *f).map_or_else(|_| "?".into(), |v| v.to_string()))
        .collect();
    format!("({})", values.join(","))
}

/// Builds the index key of `row` for `index`.
pub fn row_to_index_key(
    index: &IndexDef,
    def: &RowDef,
    row: &RowData,
    hkey: &Key,
) -> RowResult<Key> {
    let ranges = hkey.segment_ranges();
    let mut key = Key::new();
    for source in index.h2i() {
        match source {
            H2I::Field(field) => {
                key.append_segment(&row.value(def, *field)?.to_segment());
            }
            H2I::HKey(depth) => {
                let range = ranges.get(*depth).ok_or_else(|| {
                    RowStoreError::corruption(format!(
                        "hkey {hkey} too shallow for index {}",
                        index.name()
                    ))
                })?;
                key.append_raw_segment(&hkey.as_bytes()[range.clone()]);
            }
        }
    }
    Ok(key)
}

/// Rebuilds the owning row's hkey from an index key.
///
/// Fails with `InvalidScan` if the index key is shallower than the index's
/// association table requires.
pub fn index_key_to_hkey(schema: &RowDefCache, index: &IndexDef, index_key: &Key) -> RowResult<Key> {
    let ranges = index_key.segment_ranges();
    let mut hkey = Key::new();
    for source in index.i2h() {
        match source {
            I2H::Ordinal(table) => {
                hkey.append_int(i64::from(schema.ordinal(*table)));
            }
            I2H::IndexDepth(depth) => {
                let range = ranges.get(*depth).ok_or_else(|| {
                    RowStoreError::invalid_scan(format!(
                        "index key {index_key} of {} has no segment at depth {depth}",
                        index.name()
                    ))
                })?;
                hkey.append_raw_segment(&index_key.as_bytes()[range.clone()]);
            }
        }
    }
    Ok(hkey)
}
