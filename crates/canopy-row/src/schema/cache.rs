//! The built schema.

use std::collections::HashMap;
use std::sync::Arc;

use canopy_common::types::TableId;

use super::row_def::RowDef;
use crate::error::{RowResult, RowStoreError};

/// One node of a group hierarchy.
#[derive(Debug, Clone)]
pub(crate) struct GroupNode {
    pub(crate) table_id: TableId,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
}

/// A table hierarchy held as an arena; node 0 is the root table.
#[derive(Debug, Clone)]
pub(crate) struct GroupTree {
    pub(crate) group_id: TableId,
    pub(crate) nodes: Vec<GroupNode>,
}

impl GroupTree {
    pub(crate) fn new(group_id: TableId, root: TableId) -> Self {
        Self {
            group_id,
            nodes: vec![GroupNode {
                table_id: root,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub(crate) fn add_child(&mut self, parent: usize, table_id: TableId) -> usize {
        let index = self.nodes.len();
        self.nodes.push(GroupNode {
            table_id,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(index);
        index
    }

    fn position(&self, table_id: TableId) -> Option<usize> {
        self.nodes.iter().position(|n| n.table_id == table_id)
    }

    /// Node indexes in depth-first, declaration order, starting at `start`.
    pub(crate) fn preorder_from(&self, start: usize) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.nodes[node].children.iter().rev());
        }
        order
    }

    /// Member tables, depth-first.
    pub(crate) fn tables(&self) -> Vec<TableId> {
        self.preorder_from(0)
            .into_iter()
            .map(|n| self.nodes[n].table_id)
            .collect()
    }

    /// A table followed by all of its descendants, depth-first.
    pub(crate) fn subtree(&self, table_id: TableId) -> Vec<TableId> {
        self.position(table_id).map_or_else(Vec::new, |start| {
            self.preorder_from(start)
                .into_iter()
                .map(|n| self.nodes[n].table_id)
                .collect()
        })
    }

    /// Returns true if `ancestor` lies on the path from the root to `table_id`.
    pub(crate) fn is_ancestor(&self, ancestor: TableId, table_id: TableId) -> bool {
        let mut node = self.position(table_id);
        while let Some(n) = node {
            node = self.nodes[n].parent;
            if node.is_some_and(|p| self.nodes[p].table_id == ancestor) {
                return true;
            }
        }
        false
    }
}

/// Immutable table and group definitions, by id.
#[derive(Debug, Clone)]
pub struct RowDefCache {
    pub(crate) defs: HashMap<TableId, Arc<RowDef>>,
    pub(crate) groups: Vec<GroupTree>,
}

impl RowDefCache {
    /// Looks up a table or group definition.
    #[must_use]
    pub fn row_def(&self, id: TableId) -> Option<&Arc<RowDef>> {
        self.defs.get(&id)
    }

    /// Looks up a definition, failing with `NoSuchTable`.
    pub fn require(&self, id: TableId) -> RowResult<&Arc<RowDef>> {
        self.defs
            .get(&id)
            .ok_or_else(|| RowStoreError::no_such_table(id.to_string()))
    }

    /// Finds a user table by name.
    #[must_use]
    pub fn table_named(&self, schema_name: &str, table_name: &str) -> Option<&Arc<RowDef>> {
        self.defs.values().find(|d| {
            !d.is_group() && d.schema_name == schema_name && d.table_name == table_name
        })
    }

    /// User tables, ordered by id.
    #[must_use]
    pub fn user_tables(&self) -> Vec<&Arc<RowDef>> {
        let mut tables: Vec<_> = self.defs.values().filter(|d| !d.is_group()).collect();
        tables.sort_by_key(|d| d.id);
        tables
    }

    /// Group tables, in declaration order of their roots.
    #[must_use]
    pub fn group_tables(&self) -> Vec<&Arc<RowDef>> {
        self.groups
            .iter()
            .filter_map(|g| self.defs.get(&g.group_id))
            .collect()
    }

    /// Ordinal of a user table.
    #[must_use]
    pub fn ordinal(&self, id: TableId) -> u32 {
        self.defs.get(&id).map_or(0, |d| d.ordinal())
    }

    /// A table and all of its descendant tables, depth-first.
    #[must_use]
    pub fn subtree(&self, id: TableId) -> Vec<TableId> {
        self.group_tree(id).map_or_else(Vec::new, |g| g.subtree(id))
    }

    /// Returns true if `ancestor` is a proper ancestor of `table`.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: TableId, table: TableId) -> bool {
        self.group_tree(table)
            .is_some_and(|g| g.is_ancestor(ancestor, table))
    }

    pub(crate) fn group_tree(&self, table: TableId) -> Option<&GroupTree> {
        let group_id = self.defs.get(&table)?.group_id;
        self.groups.iter().find(|g| g.group_id == group_id)
    }
}
