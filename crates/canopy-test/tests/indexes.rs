//! Index maintenance integration tests: deferred keys, rebuilds and
//! index analysis.

use std::sync::Arc;
use std::thread;

use canopy_common::config::StoreConfig;
use canopy_common::types::IndexId;
use canopy_row::{FieldValue, IndexSelector, RowStoreError, ScanRequest};
use canopy_test::fixtures::{Fixture, A, B};
use canopy_test::workload;

const SCORE_TREE: &str = "_index.2.1";
const TAG_TREE: &str = "_index.2.2";

fn load(fx: &Fixture, rows: &[workload::ChildRow]) {
    for a in 1..=5 {
        fx.write(&[fx.a(a)]).unwrap();
    }
    for &(id, aid, score) in rows {
        fx.write(&[fx.b(id, aid, score)]).unwrap();
    }
}

fn by_score(fx: &Fixture) -> Vec<String> {
    let request = ScanRequest::new(B).with_index(IndexId::new(1));
    fx.scan(request, 1 << 16).unwrap().labels
}

#[test]
fn test_deferred_and_immediate_indexes_agree() {
    let rows = workload::child_rows(100, 5, 42);

    let tagged = |fx: &Fixture| {
        for (id, tag) in [(101, "red"), (102, "blue"), (103, "green")] {
            fx.write(&[fx.b_tagged(id, 2, 500, tag)]).unwrap();
        }
    };

    let immediate = Fixture::new().unwrap();
    load(&immediate, &rows);
    tagged(&immediate);

    let config = StoreConfig::for_testing()
        .with_defer_indexes(true)
        .with_deferred_index_tranche(1 << 20);
    let deferred = Fixture::with_config(config).unwrap();
    assert!(deferred.store.defer_indexes());
    load(&deferred, &rows);
    tagged(&deferred);

    // Nothing is stored until the keys are flushed.
    let pending = deferred.store.pending_index_keys();
    assert!(pending > 0);
    assert!(by_score(&deferred).is_empty());
    assert_eq!(deferred.store.flush_deferred_indexes().unwrap(), pending);
    assert_eq!(deferred.store.pending_index_keys(), 0);

    let expected = by_score(&immediate);
    assert_eq!(expected.len(), 103);
    assert_eq!(by_score(&deferred), expected);

    for tree in [SCORE_TREE, TAG_TREE] {
        assert_eq!(
            deferred.store.database().tree_entries(tree),
            immediate.store.database().tree_entries(tree),
            "{tree}"
        );
    }
    assert_eq!(immediate.store.database().tree_len(SCORE_TREE), 103);
}

#[test]
fn test_concurrent_deferred_unique_inserts() {
    let config = StoreConfig {
        max_transaction_retries: 10_000,
        ..StoreConfig::for_testing()
            .with_defer_indexes(true)
            .with_deferred_index_tranche(1 << 20)
    };
    let fx = Arc::new(Fixture::with_config(config).unwrap());
    fx.write(&[fx.a(1)]).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|id| {
            let fx = Arc::clone(&fx);
            thread::spawn(move || fx.store.write_row(&fx.b_tagged(id, 1, id, "red")))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(err, RowStoreError::DuplicateKey { ref index, .. } if index == "tag"));
    }
    assert_eq!(fx.store.row_count(B).unwrap(), 1);

    fx.store.flush_deferred_indexes().unwrap();
    assert_eq!(fx.store.database().tree_len(TAG_TREE), 1);
}

#[test]
fn test_deferred_unique_keys_checked_before_flush() {
    let config = StoreConfig::for_testing()
        .with_defer_indexes(true)
        .with_deferred_index_tranche(1 << 20);
    let fx = Fixture::with_config(config).unwrap();
    fx.write(&[fx.a(1), fx.b_tagged(1, 1, 5, "red")]).unwrap();

    let err = fx.store.write_row(&fx.b_tagged(2, 1, 6, "red")).unwrap_err();
    assert!(matches!(err, RowStoreError::DuplicateKey { ref index, .. } if index == "tag"));

    // Deleting the row withdraws its pending keys.
    fx.store.delete_row(&fx.b_tagged(1, 1, 5, "red")).unwrap();
    assert_eq!(fx.store.pending_index_keys(), 0);
    fx.write(&[fx.b_tagged(2, 1, 6, "red")]).unwrap();

    fx.store.set_defer_indexes(false).unwrap();
    assert_eq!(fx.store.pending_index_keys(), 0);
    assert_eq!(by_score(&fx), vec!["b2"]);
}

#[test]
fn test_rebuild_restores_lost_entries() {
    let fx = Fixture::new().unwrap();
    load(&fx, &workload::child_rows(40, 5, 7));
    let expected = by_score(&fx);

    let db = fx.store.database();
    let mut txn = db.begin();
    txn.clear_tree(SCORE_TREE);
    txn.commit().unwrap();
    assert_eq!(db.tree_len(SCORE_TREE), 0);

    let selector = IndexSelector::all().table_contains("test.b").index_named("score");
    assert_eq!(fx.store.rebuild_indexes(&selector).unwrap(), 40);
    assert_eq!(db.tree_len(SCORE_TREE), 40);
    assert_eq!(by_score(&fx), expected);

    // Selecting nothing writes nothing.
    let none = IndexSelector::all().index_named("missing");
    assert_eq!(fx.store.rebuild_indexes(&none).unwrap(), 0);
}

#[test]
fn test_table_statistics_after_analysis() {
    let fx = Fixture::new().unwrap();
    fx.write(&[fx.a(1), fx.a(2)]).unwrap();
    for id in 0..30 {
        fx.write(&[fx.b(id, 1 + id % 2, id % 3)]).unwrap();
    }

    assert_eq!(fx.store.analyze_table(B).unwrap(), 3);
    let stats = fx.store.table_statistics(B).unwrap();
    assert_eq!(stats.row_count, 30);
    assert_eq!(stats.histograms.len(), 3);

    let score = stats
        .histograms
        .iter()
        .find(|h| h.index_name == "score")
        .unwrap();
    assert_eq!(score.row_count(), 30);
    assert_eq!(score.samples.iter().map(|s| s.distinct).sum::<u64>(), 3);
    assert_eq!(score.samples.last().unwrap().key, vec![FieldValue::Int(2)]);

    // The root table's primary key is its hkey.
    assert_eq!(fx.store.analyze_table(A).unwrap(), 1);
    let stats = fx.store.table_statistics(A).unwrap();
    assert_eq!(stats.histograms[0].row_count(), 2);

    fx.store.drop_table(B).unwrap();
    assert!(fx.store.table_statistics(B).is_err());
}
