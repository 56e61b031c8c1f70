//! Per-table status: row count, auto-increment mark, ordinal, deleted flag.
//!
//! Status lives in memory and is written to the `_status` tree by an
//! explicit [`TableStatusCache::flush`] or periodically by the
//! [`TableStatusFlusher`] thread. Deltas are applied only after the mutation
//! that produced them commits, so a retried mutation never counts twice.
//!
//! ```text
//!  _status tree (FixedLength, 4-byte keys)
//!  key:   table id            u32 BE
//!  value: row count           u64 BE
//!         auto-increment      i64 BE
//!         ordinal             u32 BE
//!         deleted             u8
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use canopy_common::types::{TableId, Value};
use canopy_storage::{Database, KeyDescriptor};
use parking_lot::{Condvar, Mutex};

use crate::error::{RowResult, RowStoreError};
use crate::retry;

/// Tree holding persisted table status.
pub const STATUS_TREE: &str = "_status";

const STATUS_VALUE_SIZE: usize = 21;

/// Persisted state of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStatus {
    /// Number of rows.
    pub row_count: u64,
    /// Highest auto-increment value written.
    pub auto_increment: i64,
    /// Assigned ordinal, 0 if none.
    pub ordinal: u32,
    /// Whether the table was dropped.
    pub deleted: bool,
}

impl TableStatus {
    fn encode(&self) -> Value {
        let mut buf = BytesMut::with_capacity(STATUS_VALUE_SIZE);
        buf.put_u64(self.row_count);
        buf.put_i64(self.auto_increment);
        buf.put_u32(self.ordinal);
        buf.put_u8(u8::from(self.deleted));
        Value::from_raw(buf.freeze())
    }

    fn decode(mut bytes: &[u8]) -> RowResult<Self> {
        if bytes.len() != STATUS_VALUE_SIZE {
            return Err(RowStoreError::corruption(format!(
                "table status of {} bytes, expected {STATUS_VALUE_SIZE}",
                bytes.len()
            )));
        }
        Ok(Self {
            row_count: bytes.get_u64(),
            auto_increment: bytes.get_i64(),
            ordinal: bytes.get_u32(),
            deleted: bytes.get_u8() != 0,
        })
    }
}

/// A status change produced by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatusDelta {
    pub(crate) table: TableId,
    pub(crate) rows: i64,
    pub(crate) auto_increment: Option<i64>,
}

#[derive(Debug, Default)]
struct Entry {
    status: TableStatus,
    dirty: bool,
}

/// In-memory table status with write-back to the status tree.
#[derive(Debug, Default)]
pub struct TableStatusCache {
    entries: Mutex<HashMap<TableId, Entry>>,
}

impl TableStatusCache {
    /// Loads every persisted status.
    pub fn load(db: &Database) -> RowResult<Self> {
        db.create_tree(STATUS_TREE, KeyDescriptor::fixed_length(TableId::NONE, 4))?;
        let mut entries = HashMap::new();
        for (key, value) in db.tree_entries(STATUS_TREE) {
            let id: [u8; 4] = key.as_ref().try_into().map_err(|_| {
                RowStoreError::corruption(format!("table status key of {} bytes", key.len()))
            })?;
            let status = TableStatus::decode(&value)?;
            entries.insert(TableId::from_be_bytes(id), Entry { status, dirty: false });
        }
        tracing::debug!(tables = entries.len(), "loaded table status");
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Current status of a table.
    #[must_use]
    pub fn get(&self, table: TableId) -> TableStatus {
        self.entries
            .lock()
            .get(&table)
            .map(|e| e.status)
            .unwrap_or_default()
    }

    /// Returns true if the table was dropped.
    #[must_use]
    pub fn is_deleted(&self, table: TableId) -> bool {
        self.get(table).deleted
    }

    /// Returns true if any entry has unflushed changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.entries.lock().values().any(|e| e.dirty)
    }

    fn update(&self, table: TableId, change: impl FnOnce(&mut TableStatus)) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(table).or_default();
        let before = entry.status;
        change(&mut entry.status);
        entry.dirty |= entry.status != before;
    }

    pub(crate) fn apply(&self, deltas: &[StatusDelta]) {
        for delta in deltas {
            self.update(delta.table, |status| {
                status.row_count = status.row_count.saturating_add_signed(delta.rows);
                if let Some(value) = delta.auto_increment {
                    status.auto_increment = status.auto_increment.max(value);
                }
            });
        }
    }

    pub(crate) fn set_ordinal(&self, table: TableId, ordinal: u32) {
        self.update(table, |status| status.ordinal = ordinal);
    }

    pub(crate) fn set_deleted(&self, table: TableId, deleted: bool) {
        self.update(table, |status| status.deleted = deleted);
    }

    pub(crate) fn reset_rows(&self, table: TableId) {
        self.update(table, |status| status.row_count = 0);
    }

    /// Writes dirty entries to the status tree. Returns how many were written.
    pub fn flush(&self, db: &Database, max_attempts: u32) -> RowResult<usize> {
        let dirty: Vec<(TableId, TableStatus)> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(id, e)| (*id, e.status))
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }
        retry::run(
            db,
            max_attempts,
            STATUS_TREE,
            |txn| {
                for (id, status) in &dirty {
                    txn.put(STATUS_TREE, id.to_be_bytes().to_vec().into(), status.encode());
                }
                Ok(())
            },
            |_, _| {},
        )?;

        // An entry changed during the flush stays dirty.
        let mut entries = self.entries.lock();
        for (id, written) in &dirty {
            if let Some(entry) = entries.get_mut(id) {
                if entry.status == *written {
                    entry.dirty = false;
                }
            }
        }
        tracing::trace!(tables = dirty.len(), "flushed table status");
        Ok(dirty.len())
    }
}

/// Background thread flushing table status on an interval.
#[derive(Debug)]
pub struct TableStatusFlusher {
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl TableStatusFlusher {
    /// Starts the flusher thread.
    pub fn start(
        db: Arc<Database>,
        cache: Arc<TableStatusCache>,
        interval: Duration,
        max_attempts: u32,
    ) -> RowResult<Self> {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("canopy-status-flusher".into())
            .spawn(move || {
                let (stopped, wake) = &*thread_signal;
                loop {
                    {
                        let mut stopped = stopped.lock();
                        if !*stopped {
                            wake.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    if let Err(e) = cache.flush(&db, max_attempts) {
                        tracing::warn!(error = %e, "table status flush failed");
                    }
                }
            })?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let (stopped, wake) = &*self.signal;
        *stopped.lock() = true;
        wake.notify_all();
        if handle.join().is_err() {
            tracing::warn!("table status flusher panicked");
        }
    }
}

impl Drop for TableStatusFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}
