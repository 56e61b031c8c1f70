//! Schema declaration.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use canopy_common::types::{IndexId, TableId};

use super::cache::{GroupTree, RowDefCache};
use super::field::{FieldDef, FieldType};
use super::index_def::{associate, IndexDef};
use super::row_def::{HKeyLevel, RowDef, TableKind};
use crate::error::{RowResult, RowStoreError};

/// Group table ids are the root table id plus this offset.
pub const GROUP_TABLE_ID_OFFSET: u32 = 1 << 30;

/// Name of every table's primary key index.
pub const PRIMARY_INDEX_NAME: &str = "PRIMARY";

/// Declaration of a secondary index.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    id: IndexId,
    name: String,
    fields: Vec<usize>,
    unique: bool,
}

impl IndexSpec {
    /// Declares a non-unique index over `fields`.
    pub fn new(id: u32, name: impl Into<String>, fields: &[usize]) -> Self {
        Self {
            id: IndexId::new(id),
            name: name.into(),
            fields: fields.to_vec(),
            unique: false,
        }
    }

    /// Makes the index unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Declaration of a user table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    id: TableId,
    schema_name: String,
    table_name: String,
    fields: Vec<FieldDef>,
    pk_fields: Vec<usize>,
    parent: Option<(TableId, Vec<usize>)>,
    auto_inc_field: Option<usize>,
    indexes: Vec<IndexSpec>,
}

impl TableSpec {
    /// Declares a table.
    pub fn new(id: u32, schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            id: TableId::new(id),
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            fields: Vec::new(),
            pk_fields: Vec::new(),
            parent: None,
            auto_inc_field: None,
            indexes: Vec::new(),
        }
    }

    /// Adds a non-null column.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef::new(name, field_type));
        self
    }

    /// Adds a nullable column.
    #[must_use]
    pub fn nullable_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef::new(name, field_type).nullable());
        self
    }

    /// Sets the primary key columns.
    #[must_use]
    pub fn primary_key(mut self, fields: &[usize]) -> Self {
        self.pk_fields = fields.to_vec();
        self
    }

    /// Makes this a child of `parent`, joined on `join_fields`.
    #[must_use]
    pub fn parent(mut self, parent: u32, join_fields: &[usize]) -> Self {
        self.parent = Some((TableId::new(parent), join_fields.to_vec()));
        self
    }

    /// Marks a column as auto-increment.
    #[must_use]
    pub fn auto_increment(mut self, field: usize) -> Self {
        self.auto_inc_field = Some(field);
        self
    }

    /// Adds a secondary index.
    #[must_use]
    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    fn validate(&self) -> RowResult<()> {
        let name = format!("{}.{}", self.schema_name, self.table_name);
        let fail = |reason: String| Err(RowStoreError::invalid_schema(format!("{name}: {reason}")));
        let in_range = |fields: &[usize]| fields.iter().all(|f| *f < self.fields.len());

        if !self.id.is_valid() || self.id.as_u32() >= GROUP_TABLE_ID_OFFSET {
            return fail(format!("table id {} out of range", self.id));
        }
        if self.fields.is_empty() {
            return fail("no fields".into());
        }
        if self.pk_fields.is_empty() || !in_range(&self.pk_fields) {
            return fail("primary key missing or out of range".into());
        }
        if let Some((_, join)) = &self.parent {
            if !in_range(join) {
                return fail("parent join field out of range".into());
            }
        }
        if let Some(field) = self.auto_inc_field {
            let is_int = self
                .fields
                .get(field)
                .is_some_and(|f| f.field_type.int_range().is_some());
            if !is_int {
                return fail("auto-increment field must be an integer column".into());
            }
        }
        let mut ids = HashSet::new();
        for index in &self.indexes {
            if index.id.is_primary() || !ids.insert(index.id) {
                return fail(format!("index id {} reserved or duplicated", index.id));
            }
            if index.fields.is_empty() || !in_range(&index.fields) {
                return fail(format!("index {} fields missing or out of range", index.name));
            }
        }
        Ok(())
    }
}

/// Collects table declarations and builds a [`RowDefCache`].
///
/// ```rust
/// use canopy_row::schema::{FieldType, SchemaBuilder, TableSpec};
///
/// let schema = SchemaBuilder::new()
///     .table(TableSpec::new(1, "shop", "customer")
///         .field("cid", FieldType::Int)
///         .primary_key(&[0]))
///     .table(TableSpec::new(2, "shop", "order")
///         .field("oid", FieldType::Int)
///         .field("cid", FieldType::Int)
///         .primary_key(&[0])
///         .parent(1, &[1]))
///     .build()
///     .unwrap();
///
/// let order = schema.table_named("shop", "order").unwrap();
/// assert_eq!(order.hkey_depth(), 4);
/// assert_eq!(order.column_offset(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    tables: Vec<TableSpec>,
}

impl SchemaBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table.
    #[must_use]
    pub fn table(mut self, table: TableSpec) -> Self {
        self.tables.push(table);
        self
    }

    /// Validates the declarations and builds the schema.
    pub fn build(self) -> RowResult<RowDefCache> {
        let mut by_id: HashMap<TableId, usize> = HashMap::new();
        for (i, spec) in self.tables.iter().enumerate() {
            spec.validate()?;
            if by_id.insert(spec.id, i).is_some() {
                return Err(RowStoreError::invalid_schema(format!(
                    "duplicate table id {}",
                    spec.id
                )));
            }
        }

        let mut children: HashMap<TableId, Vec<TableId>> = HashMap::new();
        for spec in &self.tables {
            if let Some((parent, join)) = &spec.parent {
                let parent_spec = by_id.get(parent).map(|i| &self.tables[*i]).ok_or_else(|| {
                    RowStoreError::invalid_schema(format!(
                        "{}: parent table {parent} not declared",
                        spec.table_name
                    ))
                })?;
                if join.len() != parent_spec.pk_fields.len() {
                    return Err(RowStoreError::invalid_schema(format!(
                        "{}: {} join fields for a {}-column parent key",
                        spec.table_name,
                        join.len(),
                        parent_spec.pk_fields.len()
                    )));
                }
                children.entry(*parent).or_default().push(spec.id);
            }
        }

        let mut defs: HashMap<TableId, Arc<RowDef>> = HashMap::new();
        let mut groups = Vec::new();
        let mut placed = 0;

        for root in self.tables.iter().filter(|s| s.parent.is_none()) {
            let group_id = TableId::new(root.id.as_u32() + GROUP_TABLE_ID_OFFSET);
            let tree_name = format!("_group.{}", group_id.as_u32());

            // Node children keep declaration order; the arena order is irrelevant.
            let mut tree = GroupTree::new(group_id, root.id);
            let mut worklist = vec![0usize];
            while let Some(node) = worklist.pop() {
                let table = tree.nodes[node].table_id;
                for child in children.get(&table).into_iter().flatten() {
                    worklist.push(tree.add_child(node, *child));
                }
            }

            let mut levels: HashMap<TableId, Vec<HKeyLevel>> = HashMap::new();
            let mut group_fields = Vec::new();
            let order = tree.tables();
            for table_id in &order {
                let spec = &self.tables[by_id[table_id]];
                let mut hkey_levels = spec
                    .parent
                    .as_ref()
                    .and_then(|(p, _)| levels.get(p).cloned())
                    .unwrap_or_default();
                hkey_levels.push(HKeyLevel {
                    table_id: spec.id,
                    key_fields: spec.pk_fields.len(),
                });
                levels.insert(spec.id, hkey_levels.clone());

                let def = build_user_def(spec, hkey_levels, group_id, group_fields.len(), &tree_name);
                for field in &spec.fields {
                    group_fields.push(FieldDef {
                        name: format!("{}${}", spec.table_name, field.name),
                        ..field.clone()
                    });
                }
                defs.insert(spec.id, Arc::new(def));
                placed += 1;
            }

            defs.insert(
                group_id,
                Arc::new(RowDef {
                    id: group_id,
                    schema_name: root.schema_name.clone(),
                    table_name: format!("_group${}", root.table_name),
                    kind: TableKind::Group,
                    fields: group_fields,
                    pk_fields: Vec::new(),
                    parent: None,
                    parent_join_fields: Vec::new(),
                    auto_inc_field: None,
                    indexes: Vec::new(),
                    group_id,
                    column_offset: 0,
                    hkey_levels: Vec::new(),
                    hkey_fields: Vec::new(),
                    user_tables: order,
                    tree_name,
                    ordinal: OnceLock::new(),
                }),
            );
            groups.push(tree);
        }

        if placed != self.tables.len() {
            return Err(RowStoreError::invalid_schema(
                "parent links form a cycle".to_string(),
            ));
        }
        Ok(RowDefCache { defs, groups })
    }
}

fn build_user_def(
    spec: &TableSpec,
    hkey_levels: Vec<HKeyLevel>,
    group_id: TableId,
    column_offset: usize,
    tree_name: &str,
) -> RowDef {
    // Map each hkey slot to the row field carrying the same value: the
    // table's own pk, and the parent's pk through the join fields.
    let last = hkey_levels.len() - 1;
    let mut hkey_fields = Vec::new();
    let mut ordinal_tables = Vec::new();
    for (li, level) in hkey_levels.iter().enumerate() {
        hkey_fields.push(None);
        ordinal_tables.push(Some(level.table_id));
        for c in 0..level.key_fields {
            let field = if li == last {
                Some(spec.pk_fields[c])
            } else if li + 1 == last {
                spec.parent.as_ref().map(|(_, join)| join[c])
            } else {
                None
            };
            hkey_fields.push(field);
            ordinal_tables.push(None);
        }
    }

    let is_root = spec.parent.is_none();
    let make_index = |id: IndexId, name: &str, fields: &[usize], unique: bool| {
        let (h2i, i2h) = associate(fields, &hkey_fields, &ordinal_tables);
        let hkey_equivalent = is_root && fields == spec.pk_fields.as_slice();
        IndexDef {
            id,
            name: name.to_string(),
            table_id: spec.id,
            fields: fields.to_vec(),
            unique,
            hkey_equivalent,
            tree_name: if hkey_equivalent {
                tree_name.to_string()
            } else {
                format!("_index.{}.{}", spec.id.as_u32(), id.as_u32())
            },
            h2i,
            i2h,
        }
    };

    let mut indexes = vec![make_index(IndexId::PRIMARY, PRIMARY_INDEX_NAME, &spec.pk_fields, true)];
    for index in &spec.indexes {
        indexes.push(make_index(index.id, &index.name, &index.fields, index.unique));
    }

    RowDef {
        id: spec.id,
        schema_name: spec.schema_name.clone(),
        table_name: spec.table_name.clone(),
        kind: TableKind::User,
        fields: spec.fields.clone(),
        pk_fields: spec.pk_fields.clone(),
        parent: spec.parent.as_ref().map(|(p, _)| *p),
        parent_join_fields: spec.parent.as_ref().map(|(_, j)| j.clone()).unwrap_or_default(),
        auto_inc_field: spec.auto_inc_field,
        indexes,
        group_id,
        column_offset,
        hkey_levels,
        hkey_fields,
        user_tables: Vec::new(),
        tree_name: tree_name.to_string(),
        ordinal: OnceLock::new(),
    }
}
