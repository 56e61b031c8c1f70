//! Row collector: the scan state machine.
//!
//! A collector walks a group tree in hkey order, optionally driven by an
//! index, and writes complete root-to-leaf row windows into a caller's
//! [`RowBuffer`]:
//!
//! ```text
//!              ┌──────────────┐  index key   ┌──────────────┐
//!  index tree ─▶│  index mode  │────────────▶│  back-fill   │─┐
//!              └──────────────┘  → hkey pin  └──────────────┘ │ deep
//!                      ▲                                      ▼
//!                      │ left the pin        ┌───────────────────────┐
//!                      └─────────────────────│    primary mode       │◀─ group tree
//!                                            │ (hkey filter, pinned) │
//!                                            └───────────────────────┘
//!
//!  pending[level]   A1   B1   C1          window [from, to) flushes only
//!                   ^from          ^to    when to == projected levels
//! ```
//!
//! Rows of a window are written tentatively; the buffer is marked after the
//! leaf row. When a row does not fit, the buffer is reset to the mark and the
//! window restarts from level 0 on the next call, so ancestor rows may be
//! delivered again. [`CollectorStats::repeated_rows`] counts those.

use std::sync::Arc;

use bytes::Bytes;
use canopy_common::config::StoreConfig;
use canopy_common::constants::ROW_PREFIX_SIZE;
use canopy_common::types::{IndexId, TableId, Value};
use canopy_storage::{Database, Direction, Exchange, Key, KeyFilter, KvRead, Term, TermBound};

use crate::buffer::RowBuffer;
use crate::error::{RowResult, RowStoreError};
use crate::hkey::index_key_to_hkey;
use crate::rowdata::RowData;
use crate::scan::{ColumnSet, ScanFlags, ScanRequest};
use crate::schema::{FieldValue, IndexDef, RowDef, RowDefCache};

/// Delivery counters of one collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// Rows in committed (marked) buffer regions, repeats included.
    pub delivered_rows: u64,
    /// Rows written, including rows of a window not yet marked.
    pub almost_delivered_rows: u64,
    /// Ancestor rows written again after a buffer overflow.
    pub repeated_rows: u64,
    /// Batches that received at least one row.
    pub delivered_buffers: u64,
    /// Bytes written across all batches.
    pub delivered_bytes: u64,
}

/// One key segment's constraint, before scan flags are applied.
#[derive(Debug)]
enum TermSpec {
    Fixed(Term),
    Bounded {
        low: Option<Bytes>,
        high: Option<Bytes>,
    },
}

/// Scan state over one group tree.
pub struct RowCollector {
    id: u64,
    db: Arc<Database>,
    schema: Arc<RowDefCache>,
    table: Arc<RowDef>,
    group: Arc<RowDef>,
    flags: ScanFlags,
    columns: ColumnSet,
    projected: Vec<Arc<RowDef>>,
    index_id: Option<IndexId>,
    /// `(field, index key depth)` of every projected field, when covering.
    covering: Option<Vec<(usize, usize)>>,
    h_filter: KeyFilter,
    i_filter: Option<KeyFilter>,
    h_ex: Option<Exchange>,
    i_ex: Option<Exchange>,
    direction: Direction,
    index_mode: bool,
    pinned_len: usize,
    last_key: Key,
    pending: Vec<Option<RowData>>,
    /// A descendant row waiting for the ancestors loaded with it to go out.
    held: Option<(Key, Value)>,
    from: usize,
    to: usize,
    more: bool,
    closed: bool,
    stats: CollectorStats,
}

impl RowCollector {
    pub(crate) fn new(
        id: u64,
        db: Arc<Database>,
        schema: Arc<RowDefCache>,
        config: &StoreConfig,
        request: ScanRequest,
    ) -> RowResult<Self> {
        let table = Arc::clone(schema.require(request.table_id)?);
        let group = Arc::clone(schema.require(table.group_id())?);
        for bound in request.start.iter().chain(request.end.iter()) {
            if bound.row_def_id() != table.id() {
                return Err(RowStoreError::invalid_scan(format!(
                    "bound row of table {} used to scan {table}",
                    bound.row_def_id()
                )));
            }
        }

        let projected = project(&schema, &table, &request.columns)?;
        let index_id = match request.index_id {
            None => None,
            Some(index_id) => {
                if table.is_group() {
                    return Err(RowStoreError::invalid_scan(format!(
                        "group table {table} has no indexes"
                    )));
                }
                let index = index_of(&table, index_id)?;
                (!index.is_hkey_equivalent()).then_some(index_id)
            }
        };
        let descending = request.is_descending();
        let initial = if descending {
            if request.flags.contains(ScanFlags::END_EXCLUSIVE)
                || request.flags.contains(ScanFlags::PREFIX)
            {
                Direction::Lt
            } else {
                Direction::LtEq
            }
        } else if request.flags.contains(ScanFlags::START_EXCLUSIVE) {
            Direction::Gt
        } else {
            Direction::GtEq
        };

        let mut collector = Self {
            id,
            db,
            schema,
            table,
            group,
            flags: request.flags,
            columns: request.columns,
            projected,
            index_id,
            covering: None,
            h_filter: KeyFilter::new(Vec::new()),
            i_filter: None,
            h_ex: None,
            i_ex: None,
            direction: initial,
            index_mode: index_id.is_some(),
            pinned_len: 0,
            last_key: Key::new(),
            pending: Vec::new(),
            held: None,
            from: 0,
            to: 0,
            more: false,
            closed: false,
            stats: CollectorStats::default(),
        };
        if collector.projected.is_empty() {
            tracing::debug!(collector = id, table = %collector.table, "scan projects no tables");
            return Ok(collector);
        }

        let start = request.start.as_ref();
        let end = request.end.as_ref();
        collector.h_filter = collector.hkey_filter(start, end)?;
        let table = Arc::clone(&collector.table);
        if let Some(index_id) = collector.index_id {
            let index = index_of(&table, index_id)?;
            let filter = collector.index_filter(index, start, end)?;
            if !collector.flags.contains(ScanFlags::DEEP) {
                collector.covering = covered_fields(config, &table, index, &collector.columns);
            }
            let mut exchange = collector.db.exchange(index.tree_name());
            edge(&mut exchange, descending);
            collector.i_filter = Some(filter);
            collector.i_ex = Some(exchange);
        }
        if collector.covering.is_none() {
            let mut exchange = collector.db.exchange(collector.group.tree_name());
            edge(&mut exchange, descending);
            collector.h_ex = Some(exchange);
        }
        collector.pending = vec![None; collector.projected.len()];
        collector.more = true;

        tracing::debug!(
            collector = id,
            table = %collector.table,
            index = ?collector.index_id,
            flags = ?collector.flags,
            projected = collector.projected.len(),
            covering = collector.covering.is_some(),
            hkey_filter = %collector.h_filter,
            "opened row collector"
        );
        Ok(collector)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Collector id, unique within its store.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Tables whose rows this scan delivers, root first.
    #[must_use]
    pub fn projected_tables(&self) -> Vec<TableId> {
        self.projected.iter().map(|d| d.id()).collect()
    }

    /// Returns true if rows are decoded from index keys alone.
    #[must_use]
    pub fn is_covering(&self) -> bool {
        self.covering.is_some()
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    /// Returns true while rows may remain.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.more || self.more_pending()
    }

    fn more_pending(&self) -> bool {
        self.from < self.to && self.to == self.pending.len()
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Fills `buffer` with as many complete row windows as fit.
    ///
    /// Returns false only when nothing was written and no rows remain.
    pub fn collect_next_batch(&mut self, buffer: &mut RowBuffer) -> RowResult<bool> {
        let before = buffer.len();
        while self.collect_next_row(buffer)? {}
        let written = buffer.len().saturating_sub(before);
        if written > 0 {
            self.stats.delivered_buffers += 1;
            self.stats.delivered_bytes += written as u64;
        }
        Ok(written > 0 || self.has_more())
    }

    /// Writes the next row into `buffer`.
    ///
    /// Returns false when the buffer is full or the scan is done; rows of an
    /// unfinished window are then withdrawn from the buffer.
    pub fn collect_next_row(&mut self, buffer: &mut RowBuffer) -> RowResult<bool> {
        loop {
            if self.more_pending() {
                return self.deliver_pending(buffer);
            }
            if !self.more {
                return Ok(false);
            }
            if let Some((key, value)) = self.held.take() {
                self.prepare(self.projected.len() - 1, value, true)?;
                self.last_key = key;
                continue;
            }
            if self.index_mode {
                self.step_index()?;
            } else {
                self.step_primary()?;
            }
        }
    }

    fn deliver_pending(&mut self, buffer: &mut RowBuffer) -> RowResult<bool> {
        let level = self.from;
        let row = self.pending[level].as_ref().ok_or_else(|| {
            RowStoreError::corruption(format!(
                "scan of {} has no row at level {level}",
                self.table
            ))
        })?;
        if buffer.try_put(row) {
            self.stats.almost_delivered_rows += 1;
            self.from += 1;
            if self.from == self.pending.len() {
                buffer.mark();
                self.stats.delivered_rows = self.stats.almost_delivered_rows;
            }
            if self.flags.contains(ScanFlags::SINGLE_ROW) && self.from == self.to {
                self.more = false;
            }
            return Ok(true);
        }

        let needed: usize = self.pending[..self.to]
            .iter()
            .flatten()
            .map(|r| ROW_PREFIX_SIZE + r.len())
            .sum();
        if needed > buffer.capacity() {
            return Err(RowStoreError::ScanBufferTooSmall {
                needed,
                capacity: buffer.capacity(),
            });
        }
        // Rows of this window sent in an earlier batch go out again.
        let tentative = self.stats.almost_delivered_rows - self.stats.delivered_rows;
        self.stats.repeated_rows += self.from as u64 - tentative;
        self.stats.almost_delivered_rows = self.stats.delivered_rows;
        self.from = 0;
        buffer.reset();
        tracing::trace!(collector = self.id, window = self.to, "buffer full, window rewound");
        Ok(false)
    }

    /// Releases the scan's cursors. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.more = false;
        self.from = self.to;
        self.held = None;
        self.h_ex = None;
        self.i_ex = None;
        tracing::debug!(
            collector = self.id,
            table = %self.table,
            delivered = self.stats.delivered_rows,
            repeated = self.stats.repeated_rows,
            buffers = self.stats.delivered_buffers,
            bytes = self.stats.delivered_bytes,
            "closed row collector"
        );
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    fn step_index(&mut self) -> RowResult<()> {
        let Some(i_ex) = self.i_ex.as_mut() else {
            self.more = false;
            return Ok(());
        };
        self.to = 0;
        let found = i_ex.traverse(&*self.db, self.direction, self.i_filter.as_ref())?;
        self.direction = self.direction.strict();
        if !found {
            self.more = false;
            return Ok(());
        }
        let index_key = i_ex.key().clone();

        if let Some(covered) = &self.covering {
            let mut values = vec![FieldValue::Null; self.table.field_count()];
            for (field, depth) in covered {
                values[*field] = FieldValue::from_segment(index_key.decode_segment(*depth)?);
            }
            let row = RowData::new(&self.table, &values)?;
            tracing::trace!(collector = self.id, key = %index_key, "covered row");
            self.pending[0] = Some(row);
            self.from = 0;
            self.to = 1;
            return Ok(());
        }

        let table = Arc::clone(&self.table);
        let index_id = self.index_id.ok_or_else(|| {
            RowStoreError::invalid_scan(format!("index step in a primary scan of {table}"))
        })?;
        let hkey = index_key_to_hkey(&self.schema, index_of(&table, index_id)?, &index_key)?;
        tracing::trace!(collector = self.id, key = %index_key, hkey = %hkey, "index step");
        self.back_fill(&hkey, hkey.depth())?;
        self.last_key = hkey.clone();
        self.pinned_len = hkey.len();

        if self.flags.contains(ScanFlags::DEEP) {
            if let Some(h_ex) = self.h_ex.as_mut() {
                h_ex.key_mut().copy_from(&hkey);
                if self.flags.contains(ScanFlags::DESCENDING) {
                    h_ex.key_mut().append_after();
                }
                self.index_mode = false;
            }
        }
        Ok(())
    }

    fn step_primary(&mut self) -> RowResult<()> {
        let Some(h_ex) = self.h_ex.as_mut() else {
            self.more = false;
            return Ok(());
        };
        let found = h_ex.traverse(&*self.db, self.direction, Some(&self.h_filter))?;
        self.direction = self.direction.strict();
        let left_pin = found
            && self.index_id.is_some()
            && h_ex.key().first_unique_byte_index(&self.last_key) < self.pinned_len;
        if !found || left_pin {
            if self.index_id.is_some() {
                self.index_mode = true;
            } else {
                self.more = false;
            }
            return Ok(());
        }

        let key = h_ex.key().clone();
        let value = h_ex.take_value();
        let depth = key.depth();
        let leaf_depth = self.projected[self.projected.len() - 1].hkey_depth();
        let descendant = self.flags.contains(ScanFlags::DEEP) && depth > leaf_depth;
        if !descendant && key.is_prefix_of(&self.last_key) {
            // Already delivered through back-fill.
            return Ok(());
        }
        let level = if descendant {
            self.projected.len() - 1
        } else {
            match self.projected.iter().position(|d| d.hkey_depth() == depth) {
                Some(level) => level,
                None => return Ok(()),
            }
        };
        let Some(value) = value else {
            return Ok(());
        };
        tracing::trace!(collector = self.id, key = %key, level, "primary step");
        self.back_fill(&key, depth - 1)?;
        if descendant && self.more_pending() {
            // Back-fill filled the descendant's slot; that window goes first.
            self.held = Some((key, value));
            return Ok(());
        }
        self.prepare(level, value, descendant)?;
        self.last_key = key;
        Ok(())
    }

    /// Loads projected ancestors of `key`, down to `max_depth`, that differ
    /// from the last delivered key.
    fn back_fill(&mut self, key: &Key, max_depth: usize) -> RowResult<()> {
        let differs = key.first_unique_byte_index(&self.last_key);
        for level in 0..self.projected.len() {
            let depth = self.projected[level].hkey_depth();
            if depth > max_depth {
                break;
            }
            if differs >= key.prefix_len(depth) {
                continue;
            }
            let mut prefix = key.clone();
            prefix.truncate_depth(depth);
            match self.db.get(self.group.tree_name(), prefix.as_bytes())? {
                Some(value) => {
                    self.prepare(level, value, false)?;
                    self.last_key = prefix;
                }
                None => {
                    tracing::trace!(collector = self.id, key = %prefix, "ancestor row not found");
                }
            }
        }
        Ok(())
    }

    fn prepare(&mut self, level: usize, value: Value, descendant: bool) -> RowResult<()> {
        let row = RowData::from_value(value)?;
        let row = if descendant {
            row
        } else {
            let def = &self.projected[level];
            row.validate_for(def.id())?;
            if self.columns.is_empty() {
                row
            } else {
                let base = if self.table.is_group() { def.column_offset() } else { 0 };
                row.elide(def, |i| self.columns.contains(base + i))?
            }
        };
        self.pending[level] = Some(row);
        self.from = self.from.min(level);
        self.to = level + 1;
        Ok(())
    }

    // =========================================================================
    // Filters
    // =========================================================================

    /// Filter over the group tree: ordinals fixed, key segments bounded by
    /// the start and end rows where they carry values.
    fn hkey_filter(&self, start: Option<&RowData>, end: Option<&RowData>) -> RowResult<KeyFilter> {
        let leaf = &self.projected[self.projected.len() - 1];
        let levels = leaf.hkey_levels();
        let mut specs = Vec::new();
        for (li, level) in levels.iter().enumerate() {
            specs.push(TermSpec::Fixed(Term::exact_int(i64::from(
                self.schema.ordinal(level.table_id),
            ))));
            let member = self.schema.require(level.table_id)?;
            let child = match levels.get(li + 1) {
                Some(next) => Some(self.schema.require(next.table_id)?),
                None => None,
            };
            for c in 0..level.key_fields {
                let candidates: Vec<usize> = if self.table.is_group() {
                    let mut fields = vec![member.column_offset() + member.pk_fields()[c]];
                    if let Some(child) = child {
                        fields.push(child.column_offset() + child.parent_join_fields()[c]);
                    }
                    fields
                } else {
                    self.table.hkey_field(specs.len()).into_iter().collect()
                };
                specs.push(self.bound(&candidates, start, end)?);
            }
        }
        let driving = self.index_id.is_none();
        let terms = finish_terms(specs, self.flags, driving)?;
        let max_depth = if self.flags.contains(ScanFlags::DEEP) {
            usize::MAX
        } else {
            leaf.hkey_depth()
        };
        Ok(KeyFilter::with_depths(terms, 0, max_depth))
    }

    fn index_filter(
        &self,
        index: &IndexDef,
        start: Option<&RowData>,
        end: Option<&RowData>,
    ) -> RowResult<KeyFilter> {
        let specs = index
            .fields()
            .iter()
            .map(|f| self.bound(&[*f], start, end))
            .collect::<RowResult<Vec<_>>>()?;
        let depth = specs.len();
        Ok(KeyFilter::with_depths(finish_terms(specs, self.flags, true)?, depth, usize::MAX))
    }

    /// Bounds from the first candidate field either bound row sets.
    fn bound(
        &self,
        candidates: &[usize],
        start: Option<&RowData>,
        end: Option<&RowData>,
    ) -> RowResult<TermSpec> {
        let start = start.filter(|_| !self.flags.contains(ScanFlags::START_AT_EDGE));
        let end = end.filter(|_| !self.flags.contains(ScanFlags::END_AT_EDGE));
        for field in candidates {
            let low = segment_of(&self.table, start, *field)?;
            let high = segment_of(&self.table, end, *field)?;
            if low.is_some() || high.is_some() {
                return Ok(TermSpec::Bounded { low, high });
            }
        }
        Ok(TermSpec::Fixed(Term::All))
    }
}

impl Drop for RowCollector {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RowCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCollector")
            .field("id", &self.id)
            .field("table", &self.table.qualified_name())
            .field("index", &self.index_id)
            .field("flags", &self.flags)
            .field("more", &self.more)
            .field("stats", &self.stats)
            .finish()
    }
}

fn index_of(table: &RowDef, id: IndexId) -> RowResult<&IndexDef> {
    table.index(id).ok_or_else(|| RowStoreError::NoSuchIndex {
        table: table.qualified_name(),
        index: id.as_u32(),
    })
}

fn edge(exchange: &mut Exchange, descending: bool) {
    if descending {
        exchange.append_after();
    } else {
        exchange.append_before();
    }
}

/// The tables a projection covers, as an ancestor chain.
fn project(schema: &RowDefCache, table: &Arc<RowDef>, columns: &ColumnSet) -> RowResult<Vec<Arc<RowDef>>> {
    if !table.is_group() {
        if columns.is_empty() || columns.intersects(0..table.field_count()) {
            return Ok(vec![Arc::clone(table)]);
        }
        return Ok(Vec::new());
    }

    let members = table
        .user_tables()
        .iter()
        .map(|id| schema.require(*id).map(Arc::clone))
        .collect::<RowResult<Vec<_>>>()?;
    if columns.is_empty() {
        return match members.as_slice() {
            [only] => Ok(vec![Arc::clone(only)]),
            _ => Err(RowStoreError::invalid_scan(format!(
                "empty projection of multi-table group {table}"
            ))),
        };
    }
    let mut projected: Vec<Arc<RowDef>> = members
        .into_iter()
        .filter(|m| columns.intersects(m.group_columns()))
        .collect();
    projected.sort_by_key(|d| d.hkey_depth());
    for pair in projected.windows(2) {
        if !schema.is_ancestor(pair[0].id(), pair[1].id()) {
            return Err(RowStoreError::invalid_scan(format!(
                "projected tables {} and {} are not on one branch",
                pair[0], pair[1]
            )));
        }
    }
    Ok(projected)
}

/// Index key depths of every projected field, if the index holds them all.
fn covered_fields(
    config: &StoreConfig,
    table: &RowDef,
    index: &IndexDef,
    columns: &ColumnSet,
) -> Option<Vec<(usize, usize)>> {
    if !config.covering_index_support || columns.is_empty() {
        return None;
    }
    (0..table.field_count())
        .filter(|f| columns.contains(*f))
        .map(|f| index.key_depth_of_field(f, table.hkey_fields()).map(|d| (f, d)))
        .collect()
}

fn segment_of(def: &RowDef, row: Option<&RowData>, field: usize) -> RowResult<Option<Bytes>> {
    let Some(row) = row else {
        return Ok(None);
    };
    if field >= row.field_count() || row.is_null(field) {
        return Ok(None);
    }
    Ok(Some(Bytes::from(row.value(def, field)?.to_segment().encode())))
}

/// Applies exclusivity and prefix matching to the deepest bounded term of
/// the filter that drives the scan; every other bound is inclusive.
fn finish_terms(specs: Vec<TermSpec>, flags: ScanFlags, driving: bool) -> RowResult<Vec<Term>> {
    let last = if driving {
        specs.iter().rposition(|s| matches!(s, TermSpec::Bounded { .. }))
    } else {
        None
    };
    specs
        .into_iter()
        .enumerate()
        .map(|(i, spec)| {
            let (low, high) = match spec {
                TermSpec::Fixed(term) => return Ok(term),
                TermSpec::Bounded { low, high } => (low, high),
            };
            let last = last == Some(i);
            let low = low.map(|s| {
                if last && flags.contains(ScanFlags::START_EXCLUSIVE) {
                    TermBound::exclusive(s)
                } else {
                    TermBound::inclusive(s)
                }
            });
            let high = match high {
                None => None,
                Some(s) if last && flags.contains(ScanFlags::PREFIX) => {
                    Some(TermBound::exclusive(prefix_successor(&s)?))
                }
                Some(s) if last && flags.contains(ScanFlags::END_EXCLUSIVE) => {
                    Some(TermBound::exclusive(s))
                }
                Some(s) => Some(TermBound::inclusive(s)),
            };
            Ok(Term::range(low, high))
        })
        .collect()
}

fn prefix_successor(segment: &[u8]) -> RowResult<Bytes> {
    let mut key = Key::new();
    key.append_raw_segment(segment);
    let successor = key
        .successor_for_prefix()
        .map_err(|e| RowStoreError::invalid_scan(format!("prefix bound {key}: {e}")))?;
    Ok(successor.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, IndexSpec, SchemaBuilder, TableSpec};
    use crate::store::RowStore;

    /// a(id) <- b(id, aid, x, name) <- c(id, bid)
    fn store() -> RowStore {
        let schema = SchemaBuilder::new()
            .table(TableSpec::new(1, "s", "a").field("id", FieldType::Int).primary_key(&[0]))
            .table(
                TableSpec::new(2, "s", "b")
                    .field("id", FieldType::Int)
                    .field("aid", FieldType::Int)
                    .field("x", FieldType::Int)
                    .nullable_field("name", FieldType::Varchar { max: 16 })
                    .primary_key(&[0])
                    .parent(1, &[1])
                    .index(IndexSpec::new(1, "x", &[2]))
                    .index(IndexSpec::new(2, "name", &[3])),
            )
            .table(
                TableSpec::new(3, "s", "c")
                    .field("id", FieldType::Int)
                    .field("bid", FieldType::Int)
                    .primary_key(&[0])
                    .parent(2, &[1]),
            )
            .build()
            .unwrap();
        let store = RowStore::open(Arc::new(Database::new()), schema, StoreConfig::for_testing()).unwrap();

        store.write_row(&row(&store, 1, &[1.into()])).unwrap();
        store.write_row(&row(&store, 1, &[2.into()])).unwrap();
        for (id, aid, x, name) in [(1, 1, 30, "ant"), (2, 1, 20, "bee"), (3, 1, 10, "bat"), (4, 2, 40, "cow")] {
            store
                .write_row(&row(&store, 2, &[id.into(), aid.into(), x.into(), name.into()]))
                .unwrap();
        }
        for (id, bid) in [(1, 1), (2, 1), (3, 4)] {
            store.write_row(&row(&store, 3, &[id.into(), bid.into()])).unwrap();
        }
        store
    }

    fn row(store: &RowStore, table: u32, values: &[FieldValue]) -> RowData {
        let def = store.schema().require(TableId::new(table)).unwrap();
        RowData::new(def, values).unwrap()
    }

    fn scan_all(store: &RowStore, request: ScanRequest, capacity: usize) -> (Vec<String>, CollectorStats) {
        let mut collector = store.new_scan(request).unwrap();
        let mut buffer = RowBuffer::new(capacity);
        let mut out = Vec::new();
        loop {
            buffer.clear();
            let more = collector.collect_next_batch(&mut buffer).unwrap();
            for row in buffer.rows() {
                let row = row.unwrap();
                let def = store.schema().require(row.row_def_id()).unwrap();
                let id = row.value(def, 0).unwrap();
                out.push(format!("{}{}", def.table_name(), id));
            }
            if !more {
                break;
            }
        }
        let stats = collector.stats();
        collector.close();
        collector.close();
        (out, stats)
    }

    #[test]
    fn test_user_table_scan_ascending_and_descending() {
        let store = store();
        let (rows, _) = scan_all(&store, ScanRequest::new(TableId::new(2)), 4096);
        assert_eq!(rows, vec!["b1", "b2", "b3", "b4"]);

        let request = ScanRequest::new(TableId::new(2)).with_flags(ScanFlags::DESCENDING);
        let (rows, _) = scan_all(&store, request, 4096);
        assert_eq!(rows, vec!["b4", "b3", "b2", "b1"]);
    }

    #[test]
    fn test_group_scan_emits_parents_before_children() {
        let store = store();
        let group = store.schema().require(TableId::new(1)).unwrap().group_id();
        let group_def = store.schema().require(group).unwrap();
        let request = ScanRequest::new(group).with_columns(ColumnSet::all(group_def.field_count()));
        let (rows, _) = scan_all(&store, request, 4096);
        // Windows flush only once they reach c, so childless b rows drop out.
        assert_eq!(rows, vec!["a1", "b1", "c1", "c2", "a2", "b4", "c3"]);

        let request = ScanRequest::new(group)
            .with_columns(ColumnSet::all(group_def.field_count()))
            .with_flags(ScanFlags::DESCENDING);
        let (rows, _) = scan_all(&store, request, 4096);
        assert_eq!(rows, vec!["a2", "b4", "c3", "a1", "b1", "c2", "c1"]);
    }

    #[test]
    fn test_bounds_and_exclusive_flags() {
        let store = store();
        let bound = |id: i64| row(&store, 2, &[id.into(), FieldValue::Null, FieldValue::Null]);
        let request = ScanRequest::new(TableId::new(2)).with_start(bound(2)).with_end(bound(3));
        assert_eq!(scan_all(&store, request, 4096).0, vec!["b2", "b3"]);

        let request = ScanRequest::new(TableId::new(2))
            .with_start(bound(2))
            .with_end(bound(4))
            .with_flags(ScanFlags::START_EXCLUSIVE | ScanFlags::END_EXCLUSIVE);
        assert_eq!(scan_all(&store, request, 4096).0, vec!["b3"]);

        let request = ScanRequest::new(TableId::new(2))
            .with_start(bound(2))
            .with_flags(ScanFlags::START_AT_EDGE | ScanFlags::SINGLE_ROW);
        assert_eq!(scan_all(&store, request, 4096).0, vec!["b1"]);
    }

    #[test]
    fn test_index_scan_orders_by_index() {
        let store = store();
        let request = ScanRequest::new(TableId::new(2)).with_index(IndexId::new(1));
        let (rows, _) = scan_all(&store, request, 4096);
        assert_eq!(rows, vec!["b3", "b2", "b1", "b4"]);

        let request = ScanRequest::new(TableId::new(2))
            .with_index(IndexId::new(1))
            .with_flags(ScanFlags::DESCENDING);
        assert_eq!(scan_all(&store, request, 4096).0, vec!["b4", "b1", "b2", "b3"]);
    }

    #[test]
    fn test_prefix_bound() {
        let store = store();
        let bound = row(&store, 2, &[FieldValue::Null, FieldValue::Null, FieldValue::Null, "b".into()]);
        let request = ScanRequest::new(TableId::new(2))
            .with_index(IndexId::new(2))
            .with_range(bound)
            .with_flags(ScanFlags::PREFIX);
        assert_eq!(scan_all(&store, request, 4096).0, vec!["b3", "b2"]);
    }

    #[test]
    fn test_deep_index_scan_includes_subtree() {
        let store = store();
        let bound = row(&store, 2, &[FieldValue::Null, FieldValue::Null, 30.into()]);
        let request = ScanRequest::new(TableId::new(2))
            .with_index(IndexId::new(1))
            .with_range(bound)
            .with_flags(ScanFlags::DEEP);
        assert_eq!(scan_all(&store, request, 4096).0, vec!["b1", "c1", "c2"]);
    }

    #[test]
    fn test_deep_descending_scan_keeps_parent_first() {
        let store = store();
        let request = ScanRequest::new(TableId::new(1))
            .with_range(row(&store, 1, &[1.into()]))
            .with_flags(ScanFlags::DEEP | ScanFlags::DESCENDING);
        let (rows, stats) = scan_all(&store, request, 4096);
        assert_eq!(rows, vec!["a1", "b3", "b2", "c2", "c1", "b1"]);
        assert_eq!(stats.delivered_rows, 6);
    }

    #[test]
    fn test_covering_scan_decodes_index_keys() {
        let store = store();
        let request = ScanRequest::new(TableId::new(2))
            .with_index(IndexId::new(1))
            .with_columns(ColumnSet::from_columns(&[0, 2]));
        let mut collector = store.new_scan(request).unwrap();
        assert!(collector.is_covering());
        let mut buffer = RowBuffer::new(4096);
        assert!(collector.collect_next_batch(&mut buffer).unwrap());
        let def = store.schema().require(TableId::new(2)).unwrap();
        let rows: Vec<RowData> = buffer.rows().collect::<RowResult<_>>().unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].value(def, 0).unwrap(), FieldValue::Int(3));
        assert_eq!(rows[0].value(def, 2).unwrap(), FieldValue::Int(10));
        assert!(rows[0].is_null(1));
        assert_eq!(store.database().open_exchanges(), 1);
        collector.close();
        assert_eq!(store.database().open_exchanges(), 0);
    }

    #[test]
    fn test_small_buffers_repeat_ancestors() {
        let store = store();
        let group = store.schema().require(TableId::new(1)).unwrap().group_id();
        let group_def = store.schema().require(group).unwrap();
        let columns = ColumnSet::all(group_def.field_count());
        let (full, _) = scan_all(&store, ScanRequest::new(group).with_columns(columns.clone()), 4096);

        // Room for exactly one three-row window.
        let capacity: usize = {
            let mut collector = store.new_scan(ScanRequest::new(group).with_columns(columns.clone())).unwrap();
            let mut buffer = RowBuffer::new(4096);
            collector.collect_next_batch(&mut buffer).unwrap();
            buffer.rows().take(3).map(|r| ROW_PREFIX_SIZE + r.unwrap().len()).sum()
        };
        let (rows, stats) = scan_all(&store, ScanRequest::new(group).with_columns(columns), capacity);
        assert_eq!(rows, vec!["a1", "b1", "c1", "a1", "b1", "c2", "a2", "b4", "c3"]);
        assert_eq!(stats.repeated_rows, 2);
        assert_eq!(stats.delivered_rows - stats.repeated_rows, full.len() as u64);
        assert_eq!(stats.delivered_buffers, 3);
    }

    #[test]
    fn test_window_larger_than_buffer() {
        let store = store();
        let mut collector = store.new_scan(ScanRequest::new(TableId::new(1))).unwrap();
        let mut buffer = RowBuffer::new(ROW_PREFIX_SIZE + 2);
        let err = collector.collect_next_batch(&mut buffer).unwrap_err();
        assert!(matches!(err, RowStoreError::ScanBufferTooSmall { .. }));
    }

    #[test]
    fn test_invalid_projections() {
        let store = store();
        let group = store.schema().require(TableId::new(1)).unwrap().group_id();
        let err = store.new_scan(ScanRequest::new(group)).unwrap_err();
        assert!(matches!(err, RowStoreError::InvalidScan { .. }));

        // a's first column and c's first column, but not b's.
        let c = store.schema().require(TableId::new(3)).unwrap();
        let request = ScanRequest::new(group).with_columns(ColumnSet::from_columns(&[0, c.column_offset()]));
        assert!(store.new_scan(request).is_ok());

        let err = store
            .new_scan(ScanRequest::new(TableId::new(2)).with_index(IndexId::new(9)))
            .unwrap_err();
        assert!(matches!(err, RowStoreError::NoSuchIndex { index: 9, .. }));
    }

    #[test]
    fn test_projection_outside_table_delivers_nothing() {
        let store = store();
        let request = ScanRequest::new(TableId::new(1)).with_columns(ColumnSet::from_columns(&[5]));
        let (rows, _) = scan_all(&store, request, 4096);
        assert!(rows.is_empty());
    }
}
