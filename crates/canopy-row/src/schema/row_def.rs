//! Built table definitions.

use std::fmt;
use std::ops::Range;
use std::sync::OnceLock;

use canopy_common::types::{IndexId, TableId};

use super::field::FieldDef;
use super::index_def::IndexDef;

/// Whether a definition describes one user table or a whole group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// One logical entity within a hierarchy.
    User,
    /// The physical union of a hierarchy.
    Group,
}

/// One level of an hkey: an ordinal followed by `key_fields` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HKeyLevel {
    /// Table owning the level.
    pub table_id: TableId,
    /// Number of primary-key segments after the ordinal.
    pub key_fields: usize,
}

/// Immutable definition of a user table or group table.
///
/// Only the ordinal is set after construction, exactly once, when the store
/// opens.
pub struct RowDef {
    pub(crate) id: TableId,
    pub(crate) schema_name: String,
    pub(crate) table_name: String,
    pub(crate) kind: TableKind,
    pub(crate) fields: Vec<FieldDef>,
    pub(crate) pk_fields: Vec<usize>,
    pub(crate) parent: Option<TableId>,
    pub(crate) parent_join_fields: Vec<usize>,
    pub(crate) auto_inc_field: Option<usize>,
    pub(crate) indexes: Vec<IndexDef>,
    pub(crate) group_id: TableId,
    pub(crate) column_offset: usize,
    pub(crate) hkey_levels: Vec<HKeyLevel>,
    pub(crate) hkey_fields: Vec<Option<usize>>,
    pub(crate) user_tables: Vec<TableId>,
    pub(crate) tree_name: String,
    pub(crate) ordinal: OnceLock<u32>,
}

impl RowDef {
    /// Table id.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Schema name.
    #[must_use]
    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    /// Table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// `schema.table`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    /// Returns true for a group table.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.kind == TableKind::Group
    }

    /// Column definitions.
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Number of columns.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Primary-key field positions.
    #[must_use]
    pub fn pk_fields(&self) -> &[usize] {
        &self.pk_fields
    }

    /// Parent table, if this is a child table.
    #[must_use]
    pub fn parent(&self) -> Option<TableId> {
        self.parent
    }

    /// Fields joined to the parent's primary key, in parent pk order.
    #[must_use]
    pub fn parent_join_fields(&self) -> &[usize] {
        &self.parent_join_fields
    }

    /// Auto-increment field, if any.
    #[must_use]
    pub fn auto_inc_field(&self) -> Option<usize> {
        self.auto_inc_field
    }

    /// Index definitions; the first is the primary key.
    #[must_use]
    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Looks up an index by id.
    #[must_use]
    pub fn index(&self, id: IndexId) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.id == id)
    }

    /// The primary key index.
    #[must_use]
    pub fn primary_index(&self) -> Option<&IndexDef> {
        self.index(IndexId::PRIMARY)
    }

    /// Group table id; a group table's own id.
    #[must_use]
    pub fn group_id(&self) -> TableId {
        self.group_id
    }

    /// Position of this table's first column among the group's columns.
    #[must_use]
    pub fn column_offset(&self) -> usize {
        self.column_offset
    }

    /// This table's columns in group column coordinates.
    #[must_use]
    pub fn group_columns(&self) -> Range<usize> {
        self.column_offset..self.column_offset + self.fields.len()
    }

    /// Hkey levels from the root down to this table.
    #[must_use]
    pub fn hkey_levels(&self) -> &[HKeyLevel] {
        &self.hkey_levels
    }

    /// Number of segments in this table's hkeys.
    #[must_use]
    pub fn hkey_depth(&self) -> usize {
        self.hkey_levels.iter().map(|l| 1 + l.key_fields).sum()
    }

    /// Row field holding the value of the hkey segment at `depth`.
    #[must_use]
    pub fn hkey_field(&self, depth: usize) -> Option<usize> {
        self.hkey_fields.get(depth).copied().flatten()
    }

    /// The full hkey-depth to row-field map.
    #[must_use]
    pub fn hkey_fields(&self) -> &[Option<usize>] {
        &self.hkey_fields
    }

    /// Member tables of a group, depth-first.
    #[must_use]
    pub fn user_tables(&self) -> &[TableId] {
        &self.user_tables
    }

    /// Tree holding the group's rows.
    #[must_use]
    pub fn tree_name(&self) -> &str {
        &self.tree_name
    }

    /// Ordinal of a user table; 0 until assigned.
    #[must_use]
    pub fn ordinal(&self) -> u32 {
        self.ordinal.get().copied().unwrap_or(0)
    }

    /// Returns true once an ordinal has been assigned.
    #[must_use]
    pub fn has_ordinal(&self) -> bool {
        self.ordinal.get().is_some()
    }

    /// Assigns the ordinal. Returns false if one was already set.
    pub(crate) fn assign_ordinal(&self, ordinal: u32) -> bool {
        self.ordinal.set(ordinal).is_ok()
    }
}

impl fmt::Debug for RowDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowDef")
            .field("id", &self.id)
            .field("name", &self.qualified_name())
            .field("kind", &self.kind)
            .field("fields", &self.fields.len())
            .field("ordinal", &self.ordinal.get())
            .finish()
    }
}

impl fmt::Display for RowDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.qualified_name(), self.id)
    }
}
