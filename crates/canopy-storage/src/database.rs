//! The database: a set of named, ordered trees.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use canopy_common::types::Value;
use parking_lot::{Mutex, RwLock};

use crate::descriptor::KeyDescriptor;
use crate::error::{StoreError, StoreResult};
use crate::exchange::{Direction, Exchange};
use crate::filter::KeyFilter;
use crate::histogram::{self, KeyHistogram};
use crate::key::{Key, BEFORE_EDGE};
use crate::transaction::Transaction;

/// Tree holding the descriptor header of every other tree.
const DESCRIPTOR_TREE: &str = "_descriptors";

/// A positioned lookup: the first key in `direction` from `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seek {
    key: Vec<u8>,
    direction: Direction,
}

impl Seek {
    /// Creates a seek.
    #[must_use]
    pub fn new(key: Vec<u8>, direction: Direction) -> Self {
        Self { key, direction }
    }

    /// The reference key.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Finds the seek target in a sorted map.
    pub(crate) fn find_in<'a, V>(&self, map: &'a BTreeMap<Bytes, V>) -> Option<(&'a Bytes, &'a V)> {
        let key = self.key.as_slice();
        match self.direction {
            Direction::Gt => map
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
                .next(),
            Direction::GtEq => map
                .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
                .next(),
            Direction::Lt => map
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back(),
            Direction::LtEq => map
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
                .next_back(),
        }
    }
}

/// Read access to trees: the committed state, or a transaction's view.
pub trait KvRead {
    /// Returns the value stored at `key`.
    fn get(&self, tree: &str, key: &[u8]) -> StoreResult<Option<Value>>;

    /// Returns the first entry satisfying the seek.
    fn seek(&self, tree: &str, seek: &Seek) -> StoreResult<Option<(Bytes, Value)>>;
}

/// One named tree.
#[derive(Debug, Default)]
pub(crate) struct Tree {
    pub(crate) data: RwLock<BTreeMap<Bytes, Value>>,
    /// Commit sequence number of the last commit that wrote this tree.
    pub(crate) version: AtomicU64,
}

/// A set of named, ordered trees with optimistic transactions.
///
/// Reads through `&Database` see committed data. Writes go through a
/// [`Transaction`], which validates at commit that no tree it read has
/// changed since it began.
#[derive(Debug)]
pub struct Database {
    trees: RwLock<HashMap<String, Arc<Tree>>>,
    /// Serializes commit validation and apply.
    commit_lock: Mutex<()>,
    commit_seq: AtomicU64,
    open_exchanges: Arc<AtomicUsize>,
}

impl Database {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trees: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            commit_seq: AtomicU64::new(0),
            open_exchanges: Arc::new(AtomicUsize::new(0)),
        }
    }

    // =========================================================================
    // Trees
    // =========================================================================

    /// Creates a tree if it does not exist and records its descriptor.
    pub fn create_tree(&self, name: &str, descriptor: KeyDescriptor) -> StoreResult<()> {
        let existing = self.tree_descriptor(name)?;
        if let Some(existing) = existing {
            if existing != descriptor {
                return Err(StoreError::InvalidDescriptor {
                    tree: name.to_string(),
                    reason: format!("already created as {existing:?}"),
                });
            }
            return Ok(());
        }

        self.tree_or_create(name);
        let catalog = self.tree_or_create(DESCRIPTOR_TREE);
        catalog.data.write().insert(
            Bytes::copy_from_slice(name.as_bytes()),
            Value::from_vec(descriptor.encode().to_vec()),
        );
        tracing::debug!(tree = name, ?descriptor, "created tree");
        Ok(())
    }

    /// Returns the descriptor recorded for a tree.
    pub fn tree_descriptor(&self, name: &str) -> StoreResult<Option<KeyDescriptor>> {
        let Some(catalog) = self.tree(DESCRIPTOR_TREE) else {
            return Ok(None);
        };
        let data = catalog.data.read();
        match data.get(name.as_bytes()) {
            Some(header) => KeyDescriptor::decode(header).map(Some).map_err(|reason| {
                StoreError::InvalidDescriptor {
                    tree: name.to_string(),
                    reason,
                }
            }),
            None => Ok(None),
        }
    }

    /// Returns true if the tree exists.
    #[must_use]
    pub fn tree_exists(&self, name: &str) -> bool {
        self.trees.read().contains_key(name)
    }

    /// Names of all user trees, sorted.
    #[must_use]
    pub fn tree_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .trees
            .read()
            .keys()
            .filter(|name| name.as_str() != DESCRIPTOR_TREE)
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Removes a tree and its descriptor. Returns false if it did not exist.
    pub fn remove_tree(&self, name: &str) -> bool {
        let _guard = self.commit_lock.lock();
        let removed = self.trees.write().remove(name).is_some();
        if let Some(catalog) = self.tree(DESCRIPTOR_TREE) {
            catalog.data.write().remove(name.as_bytes());
        }
        if removed {
            self.commit_seq.fetch_add(1, AtomicOrdering::SeqCst);
            tracing::debug!(tree = name, "removed tree");
        }
        removed
    }

    /// Number of entries in a tree.
    #[must_use]
    pub fn tree_len(&self, name: &str) -> usize {
        self.tree(name).map_or(0, |t| t.data.read().len())
    }

    /// Snapshot of every entry in a tree, in key order.
    #[must_use]
    pub fn tree_entries(&self, name: &str) -> Vec<(Bytes, Value)> {
        self.tree(name).map_or_else(Vec::new, |t| {
            t.data
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    pub(crate) fn tree(&self, name: &str) -> Option<Arc<Tree>> {
        self.trees.read().get(name).cloned()
    }

    pub(crate) fn tree_or_create(&self, name: &str) -> Arc<Tree> {
        if let Some(tree) = self.tree(name) {
            return tree;
        }
        self.trees
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Tree::default()))
            .clone()
    }

    pub(crate) fn tree_version(&self, name: &str) -> u64 {
        self.tree(name)
            .map_or(0, |t| t.version.load(AtomicOrdering::Acquire))
    }

    // =========================================================================
    // Transactions and Exchanges
    // =========================================================================

    /// Begins an optimistic transaction.
    #[must_use]
    pub fn begin(&self) -> Transaction<'_> {
        // Commits in flight finish before the start sequence is read.
        let _guard = self.commit_lock();
        Transaction::new(self, self.commit_seq.load(AtomicOrdering::Acquire))
    }

    /// Acquires an exchange bound to a tree.
    #[must_use]
    pub fn exchange(&self, tree: &str) -> Exchange {
        Exchange::new(tree, Arc::clone(&self.open_exchanges))
    }

    /// Number of exchanges currently held.
    #[must_use]
    pub fn open_exchanges(&self) -> usize {
        self.open_exchanges.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn commit_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    pub(crate) fn next_commit_seq(&self) -> u64 {
        self.commit_seq.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }

    // =========================================================================
    // Histograms
    // =========================================================================

    /// Samples the key distribution of a tree.
    ///
    /// Keys are truncated to `key_depth` segments; runs of keys sharing a
    /// truncated prefix count as one distinct key.
    pub fn compute_histogram(
        &self,
        tree: &str,
        filter: Option<&KeyFilter>,
        sample_size: usize,
        key_depth: usize,
    ) -> StoreResult<KeyHistogram> {
        let mut exchange = self.exchange(tree);
        exchange.key_mut().set_encoded(BEFORE_EDGE);

        let mut distinct: Vec<(Key, u64)> = Vec::new();
        let mut direction = Direction::GtEq;
        while exchange.traverse(self, direction, filter)? {
            direction = Direction::Gt;
            let mut truncated = exchange.key().clone();
            truncated.truncate_depth(key_depth);
            match distinct.last_mut() {
                Some((last, count)) if *last == truncated => *count += 1,
                _ => distinct.push((truncated, 1)),
            }
        }
        Ok(histogram::sample(distinct, sample_size))
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl KvRead for Database {
    fn get(&self, tree: &str, key: &[u8]) -> StoreResult<Option<Value>> {
        Ok(self.tree(tree).and_then(|t| t.data.read().get(key).cloned()))
    }

    fn seek(&self, tree: &str, seek: &Seek) -> StoreResult<Option<(Bytes, Value)>> {
        Ok(self.tree(tree).and_then(|t| {
            seek.find_in(&t.data.read())
                .map(|(k, v)| (k.clone(), v.clone()))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_common::types::TableId;

    fn key(values: &[i64]) -> Bytes {
        let mut key = Key::new();
        for v in values {
            key.append_int(*v);
        }
        key.to_bytes()
    }

    fn populate(db: &Database, tree: &str, keys: &[&[i64]]) {
        let mut txn = db.begin();
        for k in keys {
            txn.put(tree, key(k), Value::from_bytes(b"v"));
        }
        txn.commit().unwrap();
    }

    #[test]
    fn test_seek_directions() {
        let db = Database::new();
        populate(&db, "t", &[&[1], &[2], &[3]]);

        let at = |direction| {
            db.seek("t", &Seek::new(key(&[2]).to_vec(), direction))
                .unwrap()
                .map(|(k, _)| k)
        };
        assert_eq!(at(Direction::Gt), Some(key(&[3])));
        assert_eq!(at(Direction::GtEq), Some(key(&[2])));
        assert_eq!(at(Direction::Lt), Some(key(&[1])));
        assert_eq!(at(Direction::LtEq), Some(key(&[2])));
        assert!(db
            .seek("missing", &Seek::new(Vec::new(), Direction::GtEq))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_descriptors() {
        let db = Database::new();
        let descriptor = KeyDescriptor::hkey(TableId::new(4));
        db.create_tree("g.4", descriptor).unwrap();
        db.create_tree("g.4", descriptor).unwrap();
        assert_eq!(db.tree_descriptor("g.4").unwrap(), Some(descriptor));
        assert_eq!(db.tree_names(), vec!["g.4".to_string()]);

        let other = KeyDescriptor::fixed_length(TableId::new(4), 4);
        assert!(db.create_tree("g.4", other).is_err());

        assert!(db.remove_tree("g.4"));
        assert!(!db.tree_exists("g.4"));
        assert_eq!(db.tree_descriptor("g.4").unwrap(), None);
        assert!(!db.remove_tree("g.4"));
    }

    #[test]
    fn test_exchange_accounting() {
        let db = Database::new();
        assert_eq!(db.open_exchanges(), 0);
        let a = db.exchange("t");
        let b = db.exchange("t");
        assert_eq!(db.open_exchanges(), 2);
        drop(a);
        assert_eq!(db.open_exchanges(), 1);
        drop(b);
        assert_eq!(db.open_exchanges(), 0);
    }

    #[test]
    fn test_histogram_groups_by_depth() {
        let db = Database::new();
        populate(
            &db,
            "t",
            &[&[1, 1], &[1, 2], &[2, 1], &[3, 1], &[3, 2], &[3, 3], &[4, 1]],
        );

        let all = db.compute_histogram("t", None, 10, 1).unwrap();
        assert_eq!(all.key_count(), 4);
        let counts: Vec<u64> = all.samples().iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![2, 1, 3, 1]);

        let two = db.compute_histogram("t", None, 2, 1).unwrap();
        assert_eq!(two.samples().len(), 2);
        assert_eq!(two.samples().iter().map(|s| s.count).sum::<u64>(), 7);
    }
}
