//! Optimistic transactions.
//!
//! A transaction buffers its writes and records which trees it touched.
//! Reads through the transaction see the committed state overlaid with the
//! transaction's own writes. Commit fails with [`StoreError::Rollback`] if
//! any touched tree was changed by a commit after this transaction began;
//! the caller retries the whole unit of work in a fresh transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::Ordering as AtomicOrdering;

use bytes::Bytes;
use canopy_common::types::Value;
use parking_lot::Mutex;

use crate::database::{Database, KvRead, Seek};
use crate::error::{StoreError, StoreResult};

/// Pending writes against one tree.
#[derive(Debug, Default)]
struct TreeWrites {
    /// The committed contents are discarded before `entries` apply.
    cleared: bool,
    /// `None` is a tombstone.
    entries: BTreeMap<Bytes, Option<Value>>,
}

/// A unit of work against a [`Database`].
///
/// Dropping a transaction without committing discards it.
#[derive(Debug)]
pub struct Transaction<'db> {
    db: &'db Database,
    start_seq: u64,
    reads: Mutex<HashSet<String>>,
    writes: HashMap<String, TreeWrites>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, start_seq: u64) -> Self {
        Self {
            db,
            start_seq,
            reads: Mutex::new(HashSet::new()),
            writes: HashMap::new(),
        }
    }

    /// The database this transaction runs against.
    #[must_use]
    pub fn database(&self) -> &'db Database {
        self.db
    }

    /// Commit sequence number visible when the transaction began.
    #[must_use]
    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Buffers a write.
    pub fn put(&mut self, tree: &str, key: Bytes, value: Value) {
        self.tree_writes(tree).entries.insert(key, Some(value));
    }

    /// Buffers a delete.
    pub fn delete(&mut self, tree: &str, key: &[u8]) {
        self.tree_writes(tree)
            .entries
            .insert(Bytes::copy_from_slice(key), None);
    }

    /// Buffers removal of every entry in a tree.
    pub fn clear_tree(&mut self, tree: &str) {
        let writes = self.tree_writes(tree);
        writes.cleared = true;
        writes.entries.clear();
    }

    fn tree_writes(&mut self, tree: &str) -> &mut TreeWrites {
        self.writes.entry(tree.to_string()).or_default()
    }

    fn note_read(&self, tree: &str) {
        let mut reads = self.reads.lock();
        if !reads.contains(tree) {
            reads.insert(tree.to_string());
        }
    }

    /// Validates and applies the buffered writes.
    ///
    /// Returns the commit sequence number, or the start sequence for a
    /// transaction that wrote nothing.
    pub fn commit(self) -> StoreResult<u64> {
        let _guard = self.db.commit_lock();
        self.commit_locked()
    }

    /// Commits, then runs `callback` with the commit sequence number. The
    /// callback never runs if the commit fails.
    ///
    /// The callback runs under the commit lock: no other transaction begins
    /// or commits until it returns, so it must not start one itself.
    pub fn commit_with<F>(self, callback: F) -> StoreResult<u64>
    where
        F: FnOnce(u64),
    {
        let _guard = self.db.commit_lock();
        let seq = self.commit_locked()?;
        callback(seq);
        Ok(seq)
    }

    fn commit_locked(&self) -> StoreResult<u64> {
        let reads = self.reads.lock();
        for tree in reads.iter().chain(self.writes.keys()) {
            if self.db.tree_version(tree) > self.start_seq {
                tracing::debug!(tree = %tree, start_seq = self.start_seq, "commit conflict");
                return Err(StoreError::Rollback { tree: tree.clone() });
            }
        }
        if self.writes.is_empty() {
            return Ok(self.start_seq);
        }

        let seq = self.db.next_commit_seq();
        for (name, writes) in &self.writes {
            let tree = self.db.tree_or_create(name);
            let mut data = tree.data.write();
            if writes.cleared {
                data.clear();
            }
            for (key, value) in &writes.entries {
                match value {
                    Some(value) => {
                        data.insert(key.clone(), value.clone());
                    }
                    None => {
                        data.remove(key);
                    }
                }
            }
            tree.version.store(seq, AtomicOrdering::Release);
        }
        tracing::trace!(seq, trees = self.writes.len(), "committed");
        Ok(seq)
    }

    /// Discards the transaction.
    pub fn rollback(self) {
        tracing::trace!(start_seq = self.start_seq, "rolled back");
    }
}

impl KvRead for Transaction<'_> {
    fn get(&self, tree: &str, key: &[u8]) -> StoreResult<Option<Value>> {
        self.note_read(tree);
        if let Some(writes) = self.writes.get(tree) {
            if let Some(entry) = writes.entries.get(key) {
                return Ok(entry.clone());
            }
            if writes.cleared {
                return Ok(None);
            }
        }
        self.db.get(tree, key)
    }

    fn seek(&self, tree: &str, seek: &Seek) -> StoreResult<Option<(Bytes, Value)>> {
        self.note_read(tree);
        let Some(writes) = self.writes.get(tree) else {
            return self.db.seek(tree, seek);
        };

        // Nearest live pending entry.
        let mut pending_seek = seek.clone();
        let pending = loop {
            match pending_seek.find_in(&writes.entries) {
                Some((key, Some(value))) => break Some((key.clone(), value.clone())),
                Some((key, None)) => {
                    pending_seek = Seek::new(key.to_vec(), seek.direction().strict());
                }
                None => break None,
            }
        };

        // Nearest committed entry not shadowed by a tombstone.
        let committed = if writes.cleared {
            None
        } else {
            let mut base_seek = seek.clone();
            loop {
                match self.db.seek(tree, &base_seek)? {
                    Some((key, _)) if matches!(writes.entries.get(&key), Some(None)) => {
                        base_seek = Seek::new(key.to_vec(), seek.direction().strict());
                    }
                    other => break other,
                }
            }
        };

        Ok(match (pending, committed) {
            (Some(p), Some(c)) => {
                let pending_first = if seek.direction().is_forward() {
                    p.0 <= c.0
                } else {
                    p.0 >= c.0
                };
                if pending_first {
                    Some(p)
                } else {
                    Some(c)
                }
            }
            (p, c) => p.or(c),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Direction;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn v(s: &str) -> Value {
        Value::from_bytes(s.as_bytes())
    }

    fn seek_key(reader: &impl KvRead, key: &str, direction: Direction) -> Option<Bytes> {
        reader
            .seek("t", &Seek::new(key.as_bytes().to_vec(), direction))
            .unwrap()
            .map(|(k, _)| k)
    }

    #[test]
    fn test_reads_see_own_writes() {
        let db = Database::new();
        let mut setup = db.begin();
        setup.put("t", b("a"), v("1"));
        setup.put("t", b("c"), v("3"));
        setup.commit().unwrap();

        let mut txn = db.begin();
        txn.put("t", b("b"), v("2"));
        txn.delete("t", b"c");
        assert_eq!(txn.get("t", b"b").unwrap(), Some(v("2")));
        assert_eq!(txn.get("t", b"c").unwrap(), None);
        assert_eq!(db.get("t", b"b").unwrap(), None);

        assert_eq!(seek_key(&txn, "a", Direction::Gt), Some(b("b")));
        assert_eq!(seek_key(&txn, "b", Direction::Gt), None);
        assert_eq!(seek_key(&txn, "z", Direction::Lt), Some(b("b")));
        assert_eq!(seek_key(&db, "z", Direction::Lt), Some(b("c")));

        txn.commit().unwrap();
        assert_eq!(db.tree_len("t"), 2);
        assert_eq!(db.get("t", b"c").unwrap(), None);
    }

    #[test]
    fn test_clear_tree_hides_committed() {
        let db = Database::new();
        let mut setup = db.begin();
        setup.put("t", b("a"), v("1"));
        setup.commit().unwrap();

        let mut txn = db.begin();
        txn.clear_tree("t");
        txn.put("t", b("x"), v("9"));
        assert_eq!(txn.get("t", b"a").unwrap(), None);
        assert_eq!(seek_key(&txn, "", Direction::GtEq), Some(b("x")));
        txn.commit().unwrap();
        assert_eq!(db.tree_entries("t").len(), 1);
    }

    #[test]
    fn test_conflicting_commit_rolls_back() {
        let db = Database::new();
        let mut first = db.begin();
        let mut second = db.begin();

        assert_eq!(second.get("t", b"k").unwrap(), None);
        first.put("t", b("k"), v("1"));
        first.commit().unwrap();

        second.put("t", b("k"), v("2"));
        let err = second.commit().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(db.get("t", b"k").unwrap(), Some(v("1")));
    }

    #[test]
    fn test_commit_with_runs_after_apply() {
        let db = Database::new();
        let mut txn = db.begin();
        txn.put("t", b("k"), v("1"));
        let mut seen = None;
        let seq = txn
            .commit_with(|seq| seen = Some((seq, db.tree_len("t"))))
            .unwrap();
        assert_eq!(seen, Some((seq, 1)));

        let mut stale = db.begin();
        assert!(stale.get("t", b"k").unwrap().is_some());
        let mut other = db.begin();
        other.put("t", b("k"), v("2"));
        other.commit().unwrap();
        stale.put("t", b("j"), v("3"));
        let mut called = false;
        assert!(stale.commit_with(|_| called = true).is_err());
        assert!(!called);
    }

    #[test]
    fn test_begin_waits_for_commit_callback() {
        let db = Database::new();
        let done = AtomicBool::new(false);
        let mut txn = db.begin();
        txn.put("t", b("k"), v("1"));

        thread::scope(|s| {
            let mut waiter = None;
            let seq = txn
                .commit_with(|_| {
                    waiter = Some(s.spawn(|| {
                        let txn = db.begin();
                        (txn.start_seq(), done.load(Ordering::SeqCst))
                    }));
                    thread::sleep(Duration::from_millis(20));
                    done.store(true, Ordering::SeqCst);
                })
                .unwrap();
            let (start_seq, saw_done) = waiter.unwrap().join().unwrap();
            assert_eq!(start_seq, seq);
            assert!(saw_done);
        });
    }

    #[test]
    fn test_disjoint_trees_commit() {
        let db = Database::new();
        let mut first = db.begin();
        let mut second = db.begin();
        first.put("a", b("k"), v("1"));
        second.put("b", b("k"), v("2"));
        first.commit().unwrap();
        second.commit().unwrap();
        assert_eq!(db.tree_len("a"), 1);
        assert_eq!(db.tree_len("b"), 1);
    }

    #[test]
    fn test_dropped_transaction_discards() {
        let db = Database::new();
        {
            let mut txn = db.begin();
            txn.put("t", b("k"), v("1"));
        }
        let txn = db.begin();
        assert!(txn.is_read_only());
        txn.rollback();
        assert_eq!(db.tree_len("t"), 0);
    }
}
