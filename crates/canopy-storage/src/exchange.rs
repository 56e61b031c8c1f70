//! Exchanges: owned cursors over one tree.
//!
//! An [`Exchange`] carries a key buffer and the value last fetched at it.
//! Callers build the key with the `append_*` methods, then fetch, store,
//! remove or traverse. Traversal moves the key to the next stored key in a
//! [`Direction`], optionally restricted by a [`KeyFilter`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use canopy_common::types::Value;

use crate::database::{KvRead, Seek};
use crate::error::StoreResult;
use crate::filter::{FilterCheck, KeyFilter};
use crate::key::{is_segment_prefix, Key, KeySegment};
use crate::transaction::Transaction;

/// Traversal direction relative to the current key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Strictly greater.
    Gt,
    /// Greater or equal.
    GtEq,
    /// Strictly less.
    Lt,
    /// Less or equal.
    LtEq,
}

impl Direction {
    /// Returns true for ascending directions.
    #[must_use]
    pub const fn is_forward(self) -> bool {
        matches!(self, Self::Gt | Self::GtEq)
    }

    /// The exclusive form of this direction.
    #[must_use]
    pub const fn strict(self) -> Self {
        match self {
            Self::Gt | Self::GtEq => Self::Gt,
            Self::Lt | Self::LtEq => Self::Lt,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Lt => "<",
            Self::LtEq => "<=",
        };
        write!(f, "{s}")
    }
}

/// Counts an exchange as open for as long as it lives.
#[derive(Debug)]
struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, AtomicOrdering::AcqRel);
        Self(counter)
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::AcqRel);
    }
}

/// A cursor bound to one tree.
#[derive(Debug)]
pub struct Exchange {
    tree: Arc<str>,
    key: Key,
    value: Option<Value>,
    _open: OpenGuard,
}

impl Exchange {
    pub(crate) fn new(tree: &str, counter: Arc<AtomicUsize>) -> Self {
        Self {
            tree: Arc::from(tree),
            key: Key::new(),
            value: None,
            _open: OpenGuard::new(counter),
        }
    }

    /// The tree name.
    #[must_use]
    pub fn tree(&self) -> &str {
        &self.tree
    }

    /// The current key.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Mutable access to the key buffer.
    pub fn key_mut(&mut self) -> &mut Key {
        &mut self.key
    }

    /// Value found by the last successful fetch or traverse.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Takes the fetched value out of the exchange.
    pub fn take_value(&mut self) -> Option<Value> {
        self.value.take()
    }

    /// Empties the key.
    pub fn clear(&mut self) -> &mut Self {
        self.key.clear();
        self.value = None;
        self
    }

    /// Appends an integer segment.
    pub fn append_int(&mut self, value: i64) -> &mut Self {
        self.key.append_int(value);
        self
    }

    /// Appends a string segment.
    pub fn append_str(&mut self, value: &str) -> &mut Self {
        self.key.append_str(value);
        self
    }

    /// Appends a byte-string segment.
    pub fn append_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.key.append_bytes(value);
        self
    }

    /// Appends a null segment.
    pub fn append_null(&mut self) -> &mut Self {
        self.key.append_null();
        self
    }

    /// Appends a decoded segment.
    pub fn append_segment(&mut self, segment: &KeySegment) -> &mut Self {
        self.key.append_segment(segment);
        self
    }

    /// Appends the position before every segment at this depth.
    pub fn append_before(&mut self) -> &mut Self {
        self.key.append_before();
        self
    }

    /// Appends the position after every segment at this depth.
    pub fn append_after(&mut self) -> &mut Self {
        self.key.append_after();
        self
    }

    /// Looks up the current key. Returns true if it is stored.
    pub fn fetch(&mut self, reader: &impl KvRead) -> StoreResult<bool> {
        self.value = reader.get(&self.tree, self.key.as_bytes())?;
        Ok(self.value.is_some())
    }

    /// Stores a value at the current key.
    pub fn store(&mut self, txn: &mut Transaction<'_>, value: Value) -> StoreResult<()> {
        self.key.check_size()?;
        txn.put(&self.tree, self.key.to_bytes(), value.clone());
        self.value = Some(value);
        Ok(())
    }

    /// Removes the current key. Returns true if it was stored.
    pub fn remove(&mut self, txn: &mut Transaction<'_>) -> StoreResult<bool> {
        let existed = txn.get(&self.tree, self.key.as_bytes())?.is_some();
        if existed {
            txn.delete(&self.tree, self.key.as_bytes());
        }
        self.value = None;
        Ok(existed)
    }

    /// Removes every key the current key is a strict prefix of. Returns how
    /// many were removed.
    pub fn remove_children(&mut self, txn: &mut Transaction<'_>) -> StoreResult<usize> {
        let prefix = self.key.as_bytes().to_vec();
        let mut seek = Seek::new(prefix.clone(), Direction::Gt);
        let mut removed = 0;
        while let Some((key, _)) = txn.seek(&self.tree, &seek)? {
            if !is_segment_prefix(&prefix, &key) {
                break;
            }
            txn.delete(&self.tree, &key);
            removed += 1;
            seek = Seek::new(key.to_vec(), Direction::Gt);
        }
        Ok(removed)
    }

    /// Returns true if some stored key has the current key as a strict prefix.
    pub fn has_children(&self, reader: &impl KvRead) -> StoreResult<bool> {
        let prefix = self.key.as_bytes();
        let seek = Seek::new(prefix.to_vec(), Direction::Gt);
        Ok(reader
            .seek(&self.tree, &seek)?
            .is_some_and(|(key, _)| is_segment_prefix(prefix, &key)))
    }

    /// Moves to the next stored key in `direction` that the filter selects.
    ///
    /// On success the key and value reflect the entry found. On failure the
    /// key is left unchanged and the value is cleared.
    pub fn traverse(
        &mut self,
        reader: &impl KvRead,
        direction: Direction,
        filter: Option<&KeyFilter>,
    ) -> StoreResult<bool> {
        let forward = direction.is_forward();
        let mut seek = Seek::new(self.key.as_bytes().to_vec(), direction);
        loop {
            let Some((key, value)) = reader.seek(&self.tree, &seek)? else {
                self.value = None;
                return Ok(false);
            };
            let check = filter.map_or(FilterCheck::Selected, |f| f.check(&key, forward));
            match check {
                FilterCheck::Selected => {
                    self.key.set_encoded(&key);
                    self.value = Some(value);
                    return Ok(true);
                }
                FilterCheck::Step => seek = Seek::new(key.to_vec(), direction.strict()),
                FilterCheck::Jump(next) => seek = next,
                FilterCheck::Exhausted => {
                    self.value = None;
                    return Ok(false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::filter::{Term, TermBound};

    fn populate(db: &Database, keys: &[&[i64]]) {
        let mut txn = db.begin();
        let mut ex = db.exchange("t");
        for k in keys {
            ex.clear();
            for v in *k {
                ex.append_int(*v);
            }
            ex.store(&mut txn, Value::from_bytes(b"v")).unwrap();
        }
        txn.commit().unwrap();
    }

    fn collect(db: &Database, start_after: bool, direction: Direction, filter: Option<&KeyFilter>) -> Vec<String> {
        let mut ex = db.exchange("t");
        if start_after {
            ex.append_after();
        } else {
            ex.append_before();
        }
        let mut out = Vec::new();
        while ex.traverse(db, direction, filter).unwrap() {
            out.push(ex.key().to_string());
        }
        out
    }

    #[test]
    fn test_traverse_both_directions() {
        let db = Database::new();
        populate(&db, &[&[1], &[1, 1], &[2]]);
        assert_eq!(collect(&db, false, Direction::Gt, None), vec!["{1}", "{1,1}", "{2}"]);
        assert_eq!(collect(&db, true, Direction::Lt, None), vec!["{2}", "{1,1}", "{1}"]);
    }

    #[test]
    fn test_traverse_with_filter_jumps() {
        let db = Database::new();
        populate(
            &db,
            &[&[1, 1], &[1, 5], &[1, 9], &[2, 1], &[2, 5], &[3, 5], &[3, 5, 1]],
        );
        let int = |v: i64| bytes::Bytes::from(KeySegment::Int(v).encode());
        let filter = KeyFilter::new(vec![
            Term::range(Some(TermBound::exclusive(int(1))), None),
            Term::range(Some(TermBound::inclusive(int(2))), Some(TermBound::inclusive(int(5)))),
        ]);
        assert_eq!(collect(&db, false, Direction::Gt, Some(&filter)), vec!["{2,5}", "{3,5}"]);
        assert_eq!(collect(&db, true, Direction::Lt, Some(&filter)), vec!["{3,5}", "{2,5}"]);
    }

    #[test]
    fn test_fetch_remove_children() {
        let db = Database::new();
        populate(&db, &[&[1], &[1, 1], &[1, 2], &[2]]);

        let mut ex = db.exchange("t");
        ex.append_int(1);
        assert!(ex.fetch(&db).unwrap());
        assert!(ex.has_children(&db).unwrap());

        let mut txn = db.begin();
        assert_eq!(ex.remove_children(&mut txn).unwrap(), 2);
        assert!(!ex.has_children(&txn).unwrap());
        assert!(ex.remove(&mut txn).unwrap());
        assert!(!ex.remove(&mut txn).unwrap());
        txn.commit().unwrap();

        assert_eq!(collect(&db, false, Direction::Gt, None), vec!["{2}"]);
    }

    #[test]
    fn test_traverse_failure_keeps_key() {
        let db = Database::new();
        populate(&db, &[&[1]]);
        let mut ex = db.exchange("t");
        ex.append_int(1);
        assert!(!ex.traverse(&db, Direction::Gt, None).unwrap());
        assert_eq!(ex.key().to_string(), "{1}");
        assert!(ex.value().is_none());
    }
}
