//! Index definitions and the index-key / hkey association tables.
//!
//! An index key holds the index's own fields followed by every hkey segment
//! the fields do not already supply, so the owning row's hkey can always be
//! rebuilt from the index entry alone.
//!
//! ```text
//!  table C (parent B, grandparent A), index on (c.x)
//!
//!  hkey:       [ordA, a.id, ordB, b.id, ordC, c.id]
//!  index key:  [c.x,  a.id, b.id, c.id]
//!
//!  H2I (index key slot -> source)   I2H (hkey slot -> source)
//!    0  Field(c.x)                    0  Ordinal(A)
//!    1  HKey(1)                       1  IndexDepth(1)
//!    2  HKey(3)                       2  Ordinal(B)
//!    3  HKey(5)                       3  IndexDepth(2)
//!                                     4  Ordinal(C)
//!                                     5  IndexDepth(3)
//! ```

use canopy_common::types::{IndexId, TableId};

/// Source of one index key segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H2I {
    /// Encoded from the row field at this position.
    Field(usize),
    /// Copied from the hkey segment at this depth.
    HKey(usize),
}

/// Source of one hkey segment when rebuilding an hkey from an index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2H {
    /// The ordinal of this table.
    Ordinal(TableId),
    /// Copied from the index key segment at this depth.
    IndexDepth(usize),
}

/// A built index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub(crate) id: IndexId,
    pub(crate) name: String,
    pub(crate) table_id: TableId,
    pub(crate) fields: Vec<usize>,
    pub(crate) unique: bool,
    pub(crate) hkey_equivalent: bool,
    pub(crate) tree_name: String,
    pub(crate) h2i: Vec<H2I>,
    pub(crate) i2h: Vec<I2H>,
}

impl IndexDef {
    /// Index id; `IndexId::PRIMARY` for the primary key.
    #[must_use]
    pub fn id(&self) -> IndexId {
        self.id
    }

    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning table.
    #[must_use]
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Indexed field positions in the owning table.
    #[must_use]
    pub fn fields(&self) -> &[usize] {
        &self.fields
    }

    /// Whether duplicate field values are rejected.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// True for the primary key index.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.id.is_primary()
    }

    /// True if the index key is the hkey itself, so no tree is kept for it.
    #[must_use]
    pub fn is_hkey_equivalent(&self) -> bool {
        self.hkey_equivalent
    }

    /// Tree holding the index entries.
    #[must_use]
    pub fn tree_name(&self) -> &str {
        &self.tree_name
    }

    /// Index key slot sources.
    #[must_use]
    pub fn h2i(&self) -> &[H2I] {
        &self.h2i
    }

    /// Hkey slot sources.
    #[must_use]
    pub fn i2h(&self) -> &[I2H] {
        &self.i2h
    }

    /// Number of leading index key segments that must be unique.
    #[must_use]
    pub fn unique_prefix_len(&self) -> usize {
        self.fields.len()
    }

    /// Index key depth at which a row field can be read, if present.
    #[must_use]
    pub fn key_depth_of_field(&self, field: usize, hkey_fields: &[Option<usize>]) -> Option<usize> {
        if let Some(depth) = self.fields.iter().position(|f| *f == field) {
            return Some(depth);
        }
        self.h2i.iter().position(|source| match source {
            H2I::HKey(d) => hkey_fields.get(*d).copied().flatten() == Some(field),
            H2I::Field(_) => false,
        })
    }
}

/// Builds the association tables for an index on a table.
///
/// `hkey_fields` maps each hkey depth of the table to the row field holding
/// the same value, and `ordinal_tables` gives the table owning each ordinal
/// slot (`None` for value slots).
pub(crate) fn associate(
    fields: &[usize],
    hkey_fields: &[Option<usize>],
    ordinal_tables: &[Option<TableId>],
) -> (Vec<H2I>, Vec<I2H>) {
    let mut h2i: Vec<H2I> = fields.iter().map(|f| H2I::Field(*f)).collect();
    let mut i2h = Vec::with_capacity(ordinal_tables.len());

    for (depth, ordinal) in ordinal_tables.iter().enumerate() {
        if let Some(table) = ordinal {
            i2h.push(I2H::Ordinal(*table));
            continue;
        }
        let covered = hkey_fields[depth].and_then(|f| fields.iter().position(|x| *x == f));
        match covered {
            Some(position) => i2h.push(I2H::IndexDepth(position)),
            None => {
                i2h.push(I2H::IndexDepth(h2i.len()));
                h2i.push(H2I::HKey(depth));
            }
        }
    }
    (h2i, i2h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_associate_grandchild_secondary() {
        // hkey [ordA, a.id, ordB, b.id, ordC, c.id]; C fields: id=0, b_id=1, x=2
        let hkey_fields = [None, None, None, Some(1), None, Some(0)];
        let ordinals = [
            Some(TableId::new(1)),
            None,
            Some(TableId::new(2)),
            None,
            Some(TableId::new(3)),
            None,
        ];
        let (h2i, i2h) = associate(&[2], &hkey_fields, &ordinals);
        assert_eq!(
            h2i,
            vec![H2I::Field(2), H2I::HKey(1), H2I::HKey(3), H2I::HKey(5)]
        );
        assert_eq!(
            i2h,
            vec![
                I2H::Ordinal(TableId::new(1)),
                I2H::IndexDepth(1),
                I2H::Ordinal(TableId::new(2)),
                I2H::IndexDepth(2),
                I2H::Ordinal(TableId::new(3)),
                I2H::IndexDepth(3),
            ]
        );
    }

    #[test]
    fn test_associate_covered_by_fields() {
        // Root table: hkey [ordA, a.id]; index on (id) covers the hkey.
        let (h2i, i2h) = associate(&[0], &[None, Some(0)], &[Some(TableId::new(1)), None]);
        assert_eq!(h2i, vec![H2I::Field(0)]);
        assert_eq!(i2h, vec![I2H::Ordinal(TableId::new(1)), I2H::IndexDepth(0)]);
    }
}
