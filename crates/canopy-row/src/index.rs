//! Secondary index maintenance.
//!
//! Index entries are keys with empty values. Inserts either go straight into
//! the mutation's transaction or, when deferred, into a per-tree ordered key
//! set that is written out in bulk:
//!
//! ```text
//!  write_row ──▶ IndexMaintainer::insert ──┬─▶ txn.put(index tree, key)
//!                                          │
//!                                          └─▶ IndexEffects.pending
//!                                                 │ under the commit lock
//!                                                 ▼
//!                              DeferredKeySet (BTreeSet, byte-accounted)
//!                                                 │ over tranche / on demand
//!                                                 ▼
//!                                        flush: one transaction per tree
//! ```
//!
//! Primary-key indexes of child tables are never deferred: hkey construction
//! for grandchildren reads them.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use bytes::Bytes;
use canopy_common::config::StoreConfig;
use canopy_common::types::Value;
use canopy_storage::{Database, Direction, Key, Transaction};
use parking_lot::Mutex;

use crate::error::{RowResult, RowStoreError};
use crate::hkey::row_to_index_key;
use crate::retry;
use crate::rowdata::RowData;
use crate::schema::{IndexDef, RowDef, RowDefCache, H2I};

/// Pending, not yet stored, keys of one index tree.
#[derive(Debug, Default)]
struct DeferredKeySet {
    keys: BTreeSet<Bytes>,
    bytes: usize,
}

/// Index work a mutation produced that takes effect only after it commits.
#[derive(Debug, Default)]
pub(crate) struct IndexEffects {
    pending: Vec<(String, Bytes)>,
    withdrawn: Vec<(String, Bytes)>,
}

/// Chooses indexes by table and index name.
#[derive(Debug, Clone, Default)]
pub struct IndexSelector {
    table: Option<String>,
    index: Option<String>,
}

impl IndexSelector {
    /// Selects every index.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to tables whose qualified name contains `s`.
    #[must_use]
    pub fn table_contains(mut self, s: impl Into<String>) -> Self {
        self.table = Some(s.into());
        self
    }

    /// Restricts to indexes named exactly `name`.
    #[must_use]
    pub fn index_named(mut self, name: impl Into<String>) -> Self {
        self.index = Some(name.into());
        self
    }

    /// Returns true if the index is selected.
    #[must_use]
    pub fn selects(&self, def: &RowDef, index: &IndexDef) -> bool {
        self.table
            .as_ref()
            .map_or(true, |t| def.qualified_name().contains(t.as_str()))
            && self.index.as_ref().map_or(true, |i| index.name() == i)
    }
}

/// Keeps index trees consistent with row mutations.
#[derive(Debug)]
pub struct IndexMaintainer {
    deferred: Mutex<HashMap<String, DeferredKeySet>>,
    tranche_bytes: usize,
    key_overhead: usize,
    max_attempts: u32,
}

impl IndexMaintainer {
    /// Creates a maintainer using the configured tranche and retry limits.
    #[must_use]
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            deferred: Mutex::new(HashMap::new()),
            tranche_bytes: config.deferred_index_tranche_bytes,
            key_overhead: config.deferred_key_overhead_bytes,
            max_attempts: config.max_transaction_retries,
        }
    }

    // =========================================================================
    // Row mutations
    // =========================================================================

    /// Adds the index entry for a new row.
    pub(crate) fn insert(
        &self,
        txn: &mut Transaction<'_>,
        effects: &mut IndexEffects,
        index: &IndexDef,
        def: &RowDef,
        row: &RowData,
        hkey: &Key,
        defer: bool,
    ) -> RowResult<()> {
        let key = row_to_index_key(index, def, row, hkey)?;
        if index.is_unique() && !index.fields().iter().any(|f| row.is_null(*f)) {
            self.check_unique(txn, index, def, &key)?;
        }
        let defer = defer && !index.is_primary();
        if defer {
            effects.pending.push((index.tree_name().to_string(), key.to_bytes()));
        } else {
            let mut exchange = txn.database().exchange(index.tree_name());
            exchange.key_mut().copy_from(&key);
            exchange.store(txn, Value::empty())?;
        }
        Ok(())
    }

    /// Replaces a row's index entry. Returns false when no indexed field
    /// changed and nothing was done.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn update(
        &self,
        txn: &mut Transaction<'_>,
        effects: &mut IndexEffects,
        index: &IndexDef,
        def: &RowDef,
        old_row: &RowData,
        new_row: &RowData,
        hkey: &Key,
        defer: bool,
    ) -> RowResult<bool> {
        let unchanged = index.h2i().iter().all(|source| match source {
            H2I::Field(f) => old_row.fields_equal(new_row, def, *f),
            H2I::HKey(_) => true,
        });
        if unchanged {
            return Ok(false);
        }
        self.delete(txn, effects, index, def, old_row, hkey)?;
        self.insert(txn, effects, index, def, new_row, hkey, defer)?;
        Ok(true)
    }

    /// Removes the index entry of a deleted row.
    pub(crate) fn delete(
        &self,
        txn: &mut Transaction<'_>,
        effects: &mut IndexEffects,
        index: &IndexDef,
        def: &RowDef,
        row: &RowData,
        hkey: &Key,
    ) -> RowResult<()> {
        let key = row_to_index_key(index, def, row, hkey)?;
        let mut exchange = txn.database().exchange(index.tree_name());
        exchange.key_mut().copy_from(&key);
        exchange.remove(txn)?;
        effects.withdrawn.push((index.tree_name().to_string(), key.to_bytes()));
        Ok(())
    }

    fn check_unique(
        &self,
        txn: &Transaction<'_>,
        index: &IndexDef,
        def: &RowDef,
        key: &Key,
    ) -> RowResult<()> {
        let mut exchange = txn.database().exchange(index.tree_name());
        exchange.key_mut().copy_from(key);
        exchange.key_mut().truncate_depth(index.unique_prefix_len());
        let prefix = exchange.key().clone();

        let stored = exchange.has_children(txn)? || exchange.fetch(txn)?;
        if stored || self.pending_under(index.tree_name(), &prefix) {
            return Err(RowStoreError::DuplicateKey {
                table: def.qualified_name(),
                index: index.name().to_string(),
                key: prefix.to_string(),
            });
        }
        Ok(())
    }

    /// Returns true if a deferred key of `tree` starts with `prefix`.
    fn pending_under(&self, tree: &str, prefix: &Key) -> bool {
        let deferred = self.deferred.lock();
        let Some(set) = deferred.get(tree) else {
            return false;
        };
        set.keys
            .range::<[u8], _>((Bound::Included(prefix.as_bytes()), Bound::Unbounded))
            .next()
            .is_some_and(|k| prefix.is_prefix_of(&Key::from(k.clone())))
    }

    // =========================================================================
    // Deferred keys
    // =========================================================================

    /// Merges a committed mutation's deferred keys. Returns the trees whose
    /// pending size now exceeds the tranche.
    pub(crate) fn apply(&self, effects: IndexEffects) -> Vec<String> {
        if effects.pending.is_empty() && effects.withdrawn.is_empty() {
            return Vec::new();
        }
        let mut deferred = self.deferred.lock();
        for (tree, key) in effects.withdrawn {
            if let Some(set) = deferred.get_mut(&tree) {
                if set.keys.remove(&key) {
                    set.bytes -= key.len() + self.key_overhead;
                }
            }
        }
        let mut full = Vec::new();
        for (tree, key) in effects.pending {
            let set = deferred.entry(tree.clone()).or_default();
            let size = key.len() + self.key_overhead;
            if set.keys.insert(key) {
                set.bytes += size;
            }
            if set.bytes > self.tranche_bytes && !full.contains(&tree) {
                full.push(tree);
            }
        }
        full
    }

    /// Number of deferred keys waiting for `tree`, or for every tree.
    #[must_use]
    pub fn pending_count(&self, tree: Option<&str>) -> usize {
        let deferred = self.deferred.lock();
        match tree {
            Some(tree) => deferred.get(tree).map_or(0, |s| s.keys.len()),
            None => deferred.values().map(|s| s.keys.len()).sum(),
        }
    }

    /// Drops the deferred keys of a tree whose contents were removed.
    pub(crate) fn discard(&self, tree: &str) -> usize {
        self.deferred.lock().remove(tree).map_or(0, |s| s.keys.len())
    }

    /// Stores the deferred keys of `tree`, or of every tree, in sorted order.
    /// Returns how many keys were written.
    pub fn flush(&self, db: &Database, tree: Option<&str>) -> RowResult<usize> {
        let trees: Vec<String> = match tree {
            Some(tree) => vec![tree.to_string()],
            None => self.deferred.lock().keys().cloned().collect(),
        };
        let mut written = 0;
        for tree in trees {
            written += self.flush_tree(db, &tree)?;
        }
        Ok(written)
    }

    fn flush_tree(&self, db: &Database, tree: &str) -> RowResult<usize> {
        let keys: Vec<Bytes> = match self.deferred.lock().get(tree) {
            Some(set) if !set.keys.is_empty() => set.keys.iter().cloned().collect(),
            _ => return Ok(0),
        };
        retry::run(
            db,
            self.max_attempts,
            tree,
            |txn| {
                for key in &keys {
                    txn.put(tree, key.clone(), Value::empty());
                }
                Ok(())
            },
            |_, _| {},
        )?;

        // Keys merged while the flush ran stay pending.
        let mut deferred = self.deferred.lock();
        if let Some(set) = deferred.get_mut(tree) {
            for key in &keys {
                if set.keys.remove(key) {
                    set.bytes -= key.len() + self.key_overhead;
                }
            }
            if set.keys.is_empty() {
                deferred.remove(tree);
            }
        }
        tracing::debug!(tree = %tree, keys = keys.len(), "flushed deferred index keys");
        Ok(keys.len())
    }

    // =========================================================================
    // Rebuild
    // =========================================================================

    /// Clears and repopulates every selected stored index. Returns the number
    /// of index entries written.
    pub fn rebuild(
        &self,
        db: &Database,
        schema: &RowDefCache,
        selector: &IndexSelector,
        live: impl Fn(&RowDef) -> bool,
    ) -> RowResult<usize> {
        let mut total = 0;
        for group in schema.group_tables() {
            let selected: HashMap<_, Vec<&IndexDef>> = group
                .user_tables()
                .iter()
                .filter_map(|t| schema.row_def(*t))
                .filter(|def| live(def.as_ref()))
                .map(|def| {
                    let indexes = def
                        .indexes()
                        .iter()
                        .filter(|i| !i.is_hkey_equivalent() && selector.selects(def, i))
                        .collect::<Vec<_>>();
                    (def.id(), indexes)
                })
                .filter(|(_, indexes)| !indexes.is_empty())
                .collect();
            if selected.is_empty() {
                continue;
            }

            let trees: Vec<&str> = selected.values().flatten().map(|i| i.tree_name()).collect();
            retry::run(
                db,
                self.max_attempts,
                group.tree_name(),
                |txn| {
                    for tree in &trees {
                        txn.clear_tree(tree);
                    }
                    Ok(())
                },
                |_, _| {},
            )?;
            {
                let mut deferred = self.deferred.lock();
                for tree in &trees {
                    deferred.remove(*tree);
                }
            }

            // Walk the group in hkey order, root rows before their children.
            let mut effects = IndexEffects::default();
            let mut exchange = db.exchange(group.tree_name());
            let mut direction = Direction::GtEq;
            while exchange.traverse(db, direction, None)? {
                direction = Direction::Gt;
                let Some(value) = exchange.value().cloned() else {
                    continue;
                };
                let row = RowData::from_value(value)?;
                let Some(indexes) = selected.get(&row.row_def_id()) else {
                    continue;
                };
                let def = schema.require(row.row_def_id())?;
                for index in indexes {
                    let key = row_to_index_key(index, def, &row, exchange.key())?;
                    effects.pending.push((index.tree_name().to_string(), key.to_bytes()));
                }
            }
            let entries = effects.pending.len();
            self.apply(effects);
            for tree in &trees {
                self.flush_tree(db, tree)?;
            }
            total += entries;
            tracing::info!(
                group = %group,
                indexes = trees.len(),
                entries,
                "rebuilt indexes"
            );
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hkey::row_hkey;
    use crate::schema::{FieldType, FieldValue, IndexSpec, SchemaBuilder, TableSpec};
    use canopy_common::types::{IndexId, TableId};
    use canopy_storage::KeyDescriptor;
    use std::sync::Arc;

    fn setup() -> (Database, RowDefCache) {
        let schema = SchemaBuilder::new()
            .table(
                TableSpec::new(1, "s", "t")
                    .field("id", FieldType::Int)
                    .nullable_field("email", FieldType::Varchar { max: 40 })
                    .primary_key(&[0])
                    .index(IndexSpec::new(1, "email", &[1]).unique()),
            )
            .build()
            .unwrap();
        let def = schema.require(TableId::new(1)).unwrap();
        def.assign_ordinal(1);
        let db = Database::new();
        db.create_tree(def.tree_name(), KeyDescriptor::hkey(def.group_id())).unwrap();
        let index = def.index(IndexId::new(1)).unwrap();
        db.create_tree(index.tree_name(), KeyDescriptor::index(def.id(), index.id())).unwrap();
        (db, schema)
    }

    fn def(schema: &RowDefCache) -> Arc<RowDef> {
        schema.require(TableId::new(1)).unwrap().clone()
    }

    fn insert(
        maintainer: &IndexMaintainer,
        db: &Database,
        schema: &RowDefCache,
        values: &[FieldValue],
        defer: bool,
    ) -> RowResult<Vec<String>> {
        let def = def(schema);
        let index = def.index(IndexId::new(1)).unwrap();
        let row = RowData::new(&def, values)?;
        let mut txn = db.begin();
        let hkey = row_hkey(schema, &def, &row, &txn)?;
        let mut effects = IndexEffects::default();
        maintainer.insert(&mut txn, &mut effects, index, &def, &row, &hkey, defer)?;
        txn.commit()?;
        Ok(maintainer.apply(effects))
    }

    #[test]
    fn test_unique_violation() {
        let (db, schema) = setup();
        let maintainer = IndexMaintainer::new(&StoreConfig::for_testing());
        insert(&maintainer, &db, &schema, &[1.into(), "a@x".into()], false).unwrap();
        let err = insert(&maintainer, &db, &schema, &[2.into(), "a@x".into()], false).unwrap_err();
        assert!(matches!(err, RowStoreError::DuplicateKey { .. }));

        // Nulls never collide.
        insert(&maintainer, &db, &schema, &[3.into(), FieldValue::Null], false).unwrap();
        insert(&maintainer, &db, &schema, &[4.into(), FieldValue::Null], false).unwrap();
        assert_eq!(db.tree_len("_index.1.1"), 3);
    }

    #[test]
    fn test_deferred_keys_flush() {
        let (db, schema) = setup();
        let maintainer = IndexMaintainer::new(&StoreConfig::for_testing());
        for i in 0..5 {
            let email = format!("u{i}@x");
            insert(&maintainer, &db, &schema, &[i.into(), email.into()], true).unwrap();
        }
        assert_eq!(db.tree_len("_index.1.1"), 0);
        assert_eq!(maintainer.pending_count(Some("_index.1.1")), 5);

        // Pending keys still count for uniqueness.
        let err = insert(&maintainer, &db, &schema, &[9.into(), "u3@x".into()], true).unwrap_err();
        assert!(matches!(err, RowStoreError::DuplicateKey { .. }));

        assert_eq!(maintainer.flush(&db, None).unwrap(), 5);
        assert_eq!(db.tree_len("_index.1.1"), 5);
        assert_eq!(maintainer.pending_count(None), 0);
    }

    #[test]
    fn test_tranche_reports_full_tree() {
        let (db, schema) = setup();
        let config = StoreConfig::for_testing().with_deferred_index_tranche(200);
        let maintainer = IndexMaintainer::new(&config);
        let mut full = Vec::new();
        for i in 0..4 {
            let email = format!("user{i}@example");
            full = insert(&maintainer, &db, &schema, &[i.into(), email.into()], true).unwrap();
            if !full.is_empty() {
                break;
            }
        }
        assert_eq!(full, vec!["_index.1.1".to_string()]);
    }

    #[test]
    fn test_update_skips_unchanged_fields() {
        let (db, schema) = setup();
        let maintainer = IndexMaintainer::new(&StoreConfig::for_testing());
        insert(&maintainer, &db, &schema, &[1.into(), "a@x".into()], false).unwrap();

        let def = def(&schema);
        let index = def.index(IndexId::new(1)).unwrap();
        let old = RowData::new(&def, &[1.into(), "a@x".into()]).unwrap();
        let new = RowData::new(&def, &[1.into(), "b@x".into()]).unwrap();
        let mut txn = db.begin();
        let hkey = row_hkey(&schema, &def, &old, &txn).unwrap();
        let mut effects = IndexEffects::default();
        assert!(!maintainer
            .update(&mut txn, &mut effects, index, &def, &old, &old, &hkey, false)
            .unwrap());
        assert!(maintainer
            .update(&mut txn, &mut effects, index, &def, &old, &new, &hkey, false)
            .unwrap());
        txn.commit().unwrap();

        let keys: Vec<String> = db
            .tree_entries("_index.1.1")
            .into_iter()
            .map(|(k, _)| Key::from(k).to_string())
            .collect();
        assert_eq!(keys, vec!["{\"b@x\",1}".to_string()]);
    }

    #[test]
    fn test_selector() {
        let (_, schema) = setup();
        let def = def(&schema);
        let index = def.index(IndexId::new(1)).unwrap();
        assert!(IndexSelector::all().selects(&def, index));
        assert!(IndexSelector::all().table_contains("s.t").selects(&def, index));
        assert!(!IndexSelector::all().index_named("other").selects(&def, index));
    }
}
