//! The row store: mutations, scans, and maintenance over one database.
//!
//! Every mutation runs in its own transaction and is retried on conflict up
//! to the configured budget. Work that must not happen twice is collected
//! while the transaction body runs and applied once: deferred index keys as
//! part of the commit, table status deltas and listener events after it:
//!
//! ```text
//!  write_row ─▶ retry::run ─┬─▶ body:   hkey, store row, index entries
//!                           │           + MutationEffects (status, keys, events)
//!                           └─▶ commit ─▶ apply effects ─▶ listeners
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use canopy_common::config::StoreConfig;
use canopy_common::constants::{MAX_ROW_SIZE, ROW_PREFIX_SIZE};
use canopy_common::types::{IndexId, TableId};
use canopy_storage::{Database, Direction, Exchange, Key, KeyDescriptor, KeyFilter, Term, Transaction};
use parking_lot::Mutex;

use crate::analysis::create_analysis_tree;
use crate::buffer::RowBuffer;
use crate::collector::RowCollector;
use crate::error::{RowResult, RowStoreError};
use crate::hkey::row_hkey;
use crate::index::{IndexEffects, IndexMaintainer, IndexSelector};
use crate::listener::{ListenerId, ListenerRegistry, RowEvent, RowEventKind, UpdateListener};
use crate::retry;
use crate::rowdata::RowData;
use crate::scan::{ScanFlags, ScanRequest};
use crate::schema::{FieldValue, RowDef, RowDefCache, PRIMARY_INDEX_NAME};
use crate::status::{StatusDelta, TableStatus, TableStatusCache, TableStatusFlusher};

/// Deferred work of one mutation, applied after it commits.
#[derive(Debug, Default)]
struct MutationEffects {
    status: Vec<StatusDelta>,
    index: IndexEffects,
    events: Vec<RowEvent>,
    /// Deferred key trees over their tranche once `index` was merged.
    full_trees: Vec<String>,
}

/// Hierarchical row storage over a [`Database`].
pub struct RowStore {
    /// Underlying ordered store.
    db: Arc<Database>,
    /// Table and group definitions.
    schema: Arc<RowDefCache>,
    /// Configuration.
    config: StoreConfig,
    /// Per-table counters and flags.
    status: Arc<TableStatusCache>,
    /// Index maintenance and deferred keys.
    indexes: IndexMaintainer,
    /// Post-commit listeners.
    listeners: ListenerRegistry,
    /// Whether new index keys are deferred.
    defer_indexes: AtomicBool,
    /// Next collector id.
    next_collector_id: AtomicU64,
    /// Background status writer, until shutdown.
    flusher: Mutex<Option<TableStatusFlusher>>,
}

impl RowStore {
    /// Opens a row store, assigning ordinals and creating trees as needed.
    pub fn open(db: Arc<Database>, schema: RowDefCache, config: StoreConfig) -> RowResult<Self> {
        config
            .validate()
            .map_err(|reason| RowStoreError::InvalidConfig { reason })?;
        let status = Arc::new(TableStatusCache::load(&db)?);
        create_analysis_tree(&db)?;
        assign_ordinals(&schema, &status)?;

        for group in schema.group_tables() {
            db.create_tree(group.tree_name(), KeyDescriptor::hkey(group.id()))?;
            for table in group.user_tables() {
                let def = schema.require(*table)?;
                for index in def.indexes().iter().filter(|i| !i.is_hkey_equivalent()) {
                    db.create_tree(index.tree_name(), KeyDescriptor::index(def.id(), index.id()))?;
                }
            }
        }
        status.flush(&db, config.max_transaction_retries)?;

        let flusher = TableStatusFlusher::start(
            Arc::clone(&db),
            Arc::clone(&status),
            config.table_status_flush_interval,
            config.max_transaction_retries,
        )?;
        tracing::info!(
            tables = schema.user_tables().len(),
            groups = schema.group_tables().len(),
            defer_indexes = config.defer_indexes,
            "opened row store"
        );

        Ok(Self {
            indexes: IndexMaintainer::new(&config),
            defer_indexes: AtomicBool::new(config.defer_indexes),
            db,
            schema: Arc::new(schema),
            config,
            status,
            listeners: ListenerRegistry::default(),
            next_collector_id: AtomicU64::new(1),
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Returns the underlying database.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Arc<RowDefCache> {
        &self.schema
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current status of a table.
    pub fn table_status(&self, table: TableId) -> TableStatus {
        self.status.get(table)
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: TableId) -> RowResult<u64> {
        self.live_def(table)?;
        Ok(self.status.get(table).row_count)
    }

    fn live_def(&self, table: TableId) -> RowResult<&Arc<RowDef>> {
        let def = self.schema.require(table)?;
        if def.is_group() {
            return Err(RowStoreError::InvalidRow {
                table: def.qualified_name(),
                reason: "group tables hold no rows of their own".into(),
            });
        }
        if self.status.is_deleted(table) {
            return Err(RowStoreError::no_such_table(def.qualified_name()));
        }
        Ok(def)
    }

    fn defer(&self) -> bool {
        self.defer_indexes.load(Ordering::Acquire)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Inserts a row.
    pub fn write_row(&self, row: &RowData) -> RowResult<()> {
        let def = Arc::clone(self.live_def(row.row_def_id())?);
        let defer = self.defer();
        let effects = self.run(&def, |store, txn| {
            let mut effects = MutationEffects::default();
            store.status_check(&def)?;
            store.insert_in(txn, &mut effects, &def, row, defer)?;
            Ok(effects)
        })?;
        self.apply(effects);
        Ok(())
    }

    /// Deletes the row stored at `row`'s hkey.
    pub fn delete_row(&self, row: &RowData) -> RowResult<()> {
        let def = Arc::clone(self.live_def(row.row_def_id())?);
        let effects = self.run(&def, |store, txn| {
            let mut effects = MutationEffects::default();
            store.status_check(&def)?;
            store.delete_in(txn, &mut effects, &def, row)?;
            Ok(effects)
        })?;
        self.apply(effects);
        Ok(())
    }

    /// Replaces `old` with `new`. A change to the primary key or parent join
    /// moves the row: it is deleted and written again, provided it has no
    /// descendants.
    pub fn update_row(&self, old: &RowData, new: &RowData) -> RowResult<()> {
        let def = Arc::clone(self.live_def(old.row_def_id())?);
        if new.row_def_id() != def.id() {
            return Err(RowStoreError::InvalidRow {
                table: def.qualified_name(),
                reason: format!("replacement row belongs to table {}", new.row_def_id()),
            });
        }
        let defer = self.defer();
        let effects = self.run(&def, |store, txn| {
            let mut effects = MutationEffects::default();
            store.status_check(&def)?;
            store.update_in(txn, &mut effects, &def, old, new, defer)?;
            Ok(effects)
        })?;
        self.apply(effects);
        Ok(())
    }

    fn run<B>(&self, def: &RowDef, mut body: B) -> RowResult<MutationEffects>
    where
        B: FnMut(&Self, &mut Transaction<'_>) -> RowResult<MutationEffects>,
    {
        retry::run(
            &self.db,
            self.config.max_transaction_retries,
            &def.qualified_name(),
            |txn| body(self, txn),
            |effects, seq| {
                for event in &mut effects.events {
                    event.commit_seq = seq;
                }
                // Merged under the commit lock, so the next transaction's
                // unique checks see these keys.
                effects.full_trees = self.indexes.apply(std::mem::take(&mut effects.index));
            },
        )
    }

    fn status_check(&self, def: &RowDef) -> RowResult<()> {
        if self.status.is_deleted(def.id()) {
            return Err(RowStoreError::no_such_table(def.qualified_name()));
        }
        Ok(())
    }

    fn apply(&self, effects: MutationEffects) {
        self.status.apply(&effects.status);
        for tree in &effects.full_trees {
            // The mutation is committed; a failed flush leaves the keys pending.
            if let Err(e) = self.indexes.flush(&self.db, Some(tree)) {
                tracing::warn!(tree = %tree, error = %e, "deferred index flush failed");
            }
        }
        if !self.listeners.is_empty() {
            self.listeners.dispatch(&effects.events);
        }
    }

    fn insert_in(
        &self,
        txn: &mut Transaction<'_>,
        effects: &mut MutationEffects,
        def: &RowDef,
        row: &RowData,
        defer: bool,
    ) -> RowResult<()> {
        check_not_null(def, row)?;
        let hkey = row_hkey(&self.schema, def, row, &*txn)?;
        hkey.check_size()?;
        let mut exchange = self.row_exchange(def, &hkey);
        if exchange.fetch(&*txn)? {
            return Err(RowStoreError::DuplicateKey {
                table: def.qualified_name(),
                index: PRIMARY_INDEX_NAME.to_string(),
                key: hkey.to_string(),
            });
        }
        exchange.store(txn, row.to_value())?;

        effects.status.push(StatusDelta {
            table: def.id(),
            rows: 1,
            auto_increment: auto_increment(def, row)?,
        });
        for index in def.indexes().iter().filter(|i| !i.is_hkey_equivalent()) {
            self.indexes
                .insert(txn, &mut effects.index, index, def, row, &hkey, defer)?;
        }
        tracing::trace!(table = %def, hkey = %hkey, "wrote row");
        effects.events.push(RowEvent {
            kind: RowEventKind::Inserted,
            table_id: def.id(),
            hkey,
            old_row: None,
            new_row: Some(row.clone()),
            commit_seq: 0,
        });
        Ok(())
    }

    /// Locates the stored row `row` refers to. Returns its hkey, the stored
    /// row and an exchange positioned on it.
    fn locate(
        &self,
        txn: &Transaction<'_>,
        def: &RowDef,
        row: &RowData,
    ) -> RowResult<(Key, RowData, Exchange)> {
        let hkey = match row_hkey(&self.schema, def, row, txn) {
            Ok(hkey) => hkey,
            Err(RowStoreError::NoReferencedRow { key, .. }) => {
                return Err(RowStoreError::NoSuchRecord {
                    table: def.qualified_name(),
                    key: format!("parent {key}"),
                })
            }
            Err(e) => return Err(e),
        };
        let mut exchange = self.row_exchange(def, &hkey);
        if !exchange.fetch(txn)? {
            return Err(RowStoreError::NoSuchRecord {
                table: def.qualified_name(),
                key: hkey.to_string(),
            });
        }
        let value = exchange
            .take_value()
            .ok_or_else(|| RowStoreError::corruption(format!("row at {hkey} vanished")))?;
        let stored = RowData::from_value(value)?;
        stored.validate_for(def.id())?;
        Ok((hkey, stored, exchange))
    }

    fn delete_in(
        &self,
        txn: &mut Transaction<'_>,
        effects: &mut MutationEffects,
        def: &RowDef,
        row: &RowData,
    ) -> RowResult<()> {
        let (hkey, stored, mut exchange) = self.locate(txn, def, row)?;
        if exchange.has_children(&*txn)? {
            return Err(RowStoreError::FkConstraintViolation {
                table: def.qualified_name(),
                key: hkey.to_string(),
            });
        }
        exchange.remove(txn)?;

        effects.status.push(StatusDelta {
            table: def.id(),
            rows: -1,
            auto_increment: None,
        });
        for index in def.indexes().iter().filter(|i| !i.is_hkey_equivalent()) {
            self.indexes
                .delete(txn, &mut effects.index, index, def, &stored, &hkey)?;
        }
        tracing::trace!(table = %def, hkey = %hkey, "deleted row");
        effects.events.push(RowEvent {
            kind: RowEventKind::Deleted,
            table_id: def.id(),
            hkey,
            old_row: Some(stored),
            new_row: None,
            commit_seq: 0,
        });
        Ok(())
    }

    fn update_in(
        &self,
        txn: &mut Transaction<'_>,
        effects: &mut MutationEffects,
        def: &RowDef,
        old: &RowData,
        new: &RowData,
        defer: bool,
    ) -> RowResult<()> {
        check_not_null(def, new)?;
        let (hkey, stored, mut exchange) = self.locate(txn, def, old)?;
        let moves = def
            .pk_fields()
            .iter()
            .chain(def.parent_join_fields())
            .any(|f| !stored.fields_equal(new, def, *f));
        if moves {
            if exchange.has_children(&*txn)? {
                return Err(RowStoreError::FkConstraintViolation {
                    table: def.qualified_name(),
                    key: hkey.to_string(),
                });
            }
            tracing::trace!(table = %def, hkey = %hkey, "update moves row");
            self.delete_in(txn, effects, def, &stored)?;
            return self.insert_in(txn, effects, def, new, defer);
        }

        exchange.store(txn, new.to_value())?;
        if let Some(value) = auto_increment(def, new)? {
            effects.status.push(StatusDelta {
                table: def.id(),
                rows: 0,
                auto_increment: Some(value),
            });
        }
        for index in def.indexes().iter().filter(|i| !i.is_hkey_equivalent()) {
            self.indexes
                .update(txn, &mut effects.index, index, def, &stored, new, &hkey, defer)?;
        }
        tracing::trace!(table = %def, hkey = %hkey, "updated row");
        effects.events.push(RowEvent {
            kind: RowEventKind::Updated,
            table_id: def.id(),
            hkey,
            old_row: Some(stored),
            new_row: Some(new.clone()),
            commit_seq: 0,
        });
        Ok(())
    }

    fn row_exchange(&self, def: &RowDef, hkey: &Key) -> Exchange {
        let mut exchange = self.db.exchange(def.tree_name());
        exchange.key_mut().copy_from(hkey);
        exchange
    }

    // =========================================================================
    // Table maintenance
    // =========================================================================

    /// Removes every row and index entry of a table. Fails while a child
    /// table holds rows.
    pub fn truncate_table(&self, table: TableId) -> RowResult<u64> {
        let def = Arc::clone(self.live_def(table)?);
        self.check_no_child_rows(&def)?;
        let removed = self.remove_rows(&def)?;
        self.status.reset_rows(table);
        tracing::info!(table = %def, rows = removed, "truncated table");
        Ok(removed)
    }

    /// Truncates a table and marks it dropped. Dropping the last live table
    /// of a group removes the group's trees. Dropping a dropped table does
    /// nothing; dropping a table whose child tables hold rows fails.
    pub fn drop_table(&self, table: TableId) -> RowResult<()> {
        let def = Arc::clone(self.schema.require(table)?);
        if def.is_group() {
            return Err(RowStoreError::InvalidRow {
                table: def.qualified_name(),
                reason: "group tables are dropped with their last member".into(),
            });
        }
        if self.status.is_deleted(table) {
            return Ok(());
        }
        self.check_no_child_rows(&def)?;
        let removed = self.remove_rows(&def)?;
        self.delete_index_analysis(table, None)?;
        self.status.reset_rows(table);
        self.status.set_deleted(table, true);

        let group = self.schema.require(def.group_id())?;
        let live = group.user_tables().iter().any(|t| !self.status.is_deleted(*t));
        if !live {
            self.db.remove_tree(group.tree_name());
            for member in group.user_tables() {
                let member = self.schema.require(*member)?;
                for index in member.indexes().iter().filter(|i| !i.is_hkey_equivalent()) {
                    self.indexes.discard(index.tree_name());
                    self.db.remove_tree(index.tree_name());
                }
            }
        }
        self.status.flush(&self.db, self.config.max_transaction_retries)?;
        tracing::info!(table = %def, rows = removed, group_removed = !live, "dropped table");
        Ok(())
    }

    fn check_no_child_rows(&self, def: &RowDef) -> RowResult<()> {
        let blocking = self
            .schema
            .user_tables()
            .into_iter()
            .filter(|t| t.parent() == Some(def.id()) && !self.status.is_deleted(t.id()))
            .find(|t| self.status.get(t.id()).row_count > 0);
        match blocking {
            Some(child) => Err(RowStoreError::FkConstraintViolation {
                table: def.qualified_name(),
                key: format!("{} rows in {}", self.status.get(child.id()).row_count, child),
            }),
            None => Ok(()),
        }
    }

    fn remove_rows(&self, def: &RowDef) -> RowResult<u64> {
        let index_trees: Vec<&str> = def
            .indexes()
            .iter()
            .filter(|i| !i.is_hkey_equivalent())
            .map(|i| i.tree_name())
            .collect();
        let filter = table_filter(&self.schema, def);
        let removed = retry::run(
            &self.db,
            self.config.max_transaction_retries,
            &def.qualified_name(),
            |txn| {
                let mut exchange = self.db.exchange(def.tree_name());
                exchange.append_before();
                let mut keys = Vec::new();
                let mut direction = Direction::GtEq;
                while exchange.traverse(&*txn, direction, Some(&filter))? {
                    direction = Direction::Gt;
                    keys.push(exchange.key().to_bytes());
                }
                for key in &keys {
                    txn.delete(def.tree_name(), key);
                }
                for tree in &index_trees {
                    txn.clear_tree(tree);
                }
                Ok(keys.len() as u64)
            },
            |_, _| {},
        )?;
        for tree in &index_trees {
            self.indexes.discard(tree);
        }
        Ok(removed)
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Starts a scan.
    pub fn new_scan(&self, request: ScanRequest) -> RowResult<RowCollector> {
        let def = self.schema.require(request.table_id)?;
        let live = if def.is_group() {
            def.user_tables().iter().any(|t| !self.status.is_deleted(*t))
        } else {
            !self.status.is_deleted(def.id())
        };
        if !live {
            return Err(RowStoreError::no_such_table(def.qualified_name()));
        }
        let id = self.next_collector_id.fetch_add(1, Ordering::Relaxed);
        RowCollector::new(
            id,
            Arc::clone(&self.db),
            Arc::clone(&self.schema),
            &self.config,
            request,
        )
    }

    /// Reads the row with the given primary key values.
    pub fn fetch_row(&self, table: TableId, pk: &[FieldValue]) -> RowResult<Option<RowData>> {
        let def = self.live_def(table)?;
        if pk.len() != def.pk_fields().len() {
            return Err(RowStoreError::invalid_scan(format!(
                "{def} has {} key columns, {} values given",
                def.pk_fields().len(),
                pk.len()
            )));
        }
        let mut values = vec![FieldValue::Null; def.field_count()];
        for (field, value) in def.pk_fields().iter().zip(pk) {
            values[*field] = value.clone();
        }
        let bound = RowData::new(def, &values)?;
        let mut request = ScanRequest::new(table)
            .with_range(bound)
            .with_flags(ScanFlags::SINGLE_ROW);
        if def.parent().is_some() {
            // The primary-key index pins the row without knowing its ancestors.
            request = request.with_index(IndexId::PRIMARY);
        }

        let mut collector = self.new_scan(request)?;
        let mut buffer =
            RowBuffer::new(self.config.default_scan_buffer_bytes.max(MAX_ROW_SIZE + ROW_PREFIX_SIZE));
        collector.collect_next_batch(&mut buffer)?;
        collector.close();
        buffer.rows().next().transpose()
    }

    // =========================================================================
    // Index maintenance
    // =========================================================================

    /// Turns deferred index maintenance on or off. Turning it off flushes
    /// pending keys.
    pub fn set_defer_indexes(&self, defer: bool) -> RowResult<()> {
        let was = self.defer_indexes.swap(defer, Ordering::AcqRel);
        if was && !defer {
            self.flush_deferred_indexes()?;
        }
        tracing::debug!(defer, "deferred index maintenance");
        Ok(())
    }

    /// Returns true if index keys are being deferred.
    pub fn defer_indexes(&self) -> bool {
        self.defer()
    }

    /// Stores every pending deferred index key. Returns how many were written.
    pub fn flush_deferred_indexes(&self) -> RowResult<usize> {
        self.indexes.flush(&self.db, None)
    }

    /// Number of deferred index keys not yet stored.
    pub fn pending_index_keys(&self) -> usize {
        self.indexes.pending_count(None)
    }

    /// Rebuilds the selected indexes from the group trees. Returns the
    /// number of index entries written.
    pub fn rebuild_indexes(&self, selector: &IndexSelector) -> RowResult<usize> {
        self.indexes
            .rebuild(&self.db, &self.schema, selector, |def| !self.status.is_deleted(def.id()))
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Registers a listener for committed row changes.
    pub fn register_update_listener(&self, listener: Arc<dyn UpdateListener>) -> ListenerId {
        let id = self.listeners.register(listener);
        tracing::debug!(listener = %id, "registered update listener");
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unregister_update_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Writes dirty table status now. Returns how many tables were written.
    pub fn flush_status(&self) -> RowResult<usize> {
        self.status.flush(&self.db, self.config.max_transaction_retries)
    }

    /// Stops the status flusher and writes out deferred keys and status.
    pub fn shutdown(&self) -> RowResult<()> {
        let Some(mut flusher) = self.flusher.lock().take() else {
            return Ok(());
        };
        flusher.stop();
        let keys = self.flush_deferred_indexes()?;
        let tables = self.flush_status()?;
        tracing::info!(index_keys = keys, tables, "row store shut down");
        Ok(())
    }
}

impl Drop for RowStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "row store shutdown failed");
        }
    }
}

impl std::fmt::Debug for RowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStore")
            .field("tables", &self.schema.user_tables().len())
            .field("defer_indexes", &self.defer())
            .field("listeners", &self.listeners)
            .finish()
    }
}

/// Gives every user table an ordinal unique within its group. Persisted
/// ordinals are kept; new tables take the next free one, depth-first.
fn assign_ordinals(schema: &RowDefCache, status: &TableStatusCache) -> RowResult<()> {
    for group in schema.group_tables() {
        let mut used: Vec<u32> = group
            .user_tables()
            .iter()
            .map(|t| status.get(*t).ordinal)
            .filter(|o| *o != 0)
            .collect();
        for table in group.user_tables() {
            let def = schema.require(*table)?;
            let ordinal = match status.get(*table).ordinal {
                0 => {
                    let next = used.iter().max().copied().unwrap_or(0) + 1;
                    used.push(next);
                    status.set_ordinal(*table, next);
                    tracing::info!(table = %def, ordinal = next, "assigned ordinal");
                    next
                }
                persisted => persisted,
            };
            if !def.assign_ordinal(ordinal) && def.ordinal() != ordinal {
                return Err(RowStoreError::invalid_schema(format!(
                    "{def} already has ordinal {}, store holds {ordinal}",
                    def.ordinal()
                )));
            }
        }
    }
    Ok(())
}

fn check_not_null(def: &RowDef, row: &RowData) -> RowResult<()> {
    match def.fields().iter().enumerate().find(|(i, f)| !f.nullable && row.is_null(*i)) {
        Some((_, field)) => Err(RowStoreError::InvalidRow {
            table: def.qualified_name(),
            reason: format!("column {} is not nullable", field.name),
        }),
        None => Ok(()),
    }
}

fn auto_increment(def: &RowDef, row: &RowData) -> RowResult<Option<i64>> {
    match def.auto_inc_field() {
        Some(field) => Ok(row.value(def, field)?.as_int()),
        None => Ok(None),
    }
}

/// Selects exactly the hkeys of one table's rows.
pub(crate) fn table_filter(schema: &RowDefCache, def: &RowDef) -> KeyFilter {
    let mut terms = Vec::with_capacity(def.hkey_depth());
    for level in def.hkey_levels() {
        terms.push(Term::exact_int(i64::from(schema.ordinal(level.table_id))));
        terms.extend(std::iter::repeat(Term::All).take(level.key_fields));
    }
    KeyFilter::new(terms)
}
