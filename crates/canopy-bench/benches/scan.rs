//! Row engine benchmarks for canopy.
//!
//! Benchmarks for:
//! - Row writes with immediate and deferred index maintenance
//! - Whole-group scans at several buffer sizes
//! - Index-ordered and covering scans

use std::sync::Arc;

use canopy_bench::utils::{bench_schema, generate_group_rows, populated_store, GroupShape, ORDER};
use canopy_common::config::StoreConfig;
use canopy_common::types::{IndexId, TableId};
use canopy_row::schema::GROUP_TABLE_ID_OFFSET;
use canopy_row::{ColumnSet, RowBuffer, RowStore, ScanRequest};
use canopy_storage::Database;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const SHAPE: GroupShape = GroupShape {
    customers: 200,
    orders: 5,
    items: 3,
};

/// Drains a scan, returning the number of rows delivered.
fn drain(store: &RowStore, request: ScanRequest, capacity: usize) -> usize {
    let mut collector = store.new_scan(request).unwrap();
    let mut buffer = RowBuffer::new(capacity);
    let mut rows = 0;
    loop {
        buffer.clear();
        let more = collector.collect_next_batch(&mut buffer).unwrap();
        rows += buffer.rows().count();
        if !more {
            break;
        }
    }
    collector.close();
    rows
}

/// Benchmark writing a whole group, with and without deferred indexes.
fn bench_write_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan/write_group");
    let schema = bench_schema().unwrap();
    let rows = generate_group_rows(&schema, SHAPE).unwrap();

    group.throughput(Throughput::Elements(rows.len() as u64));
    for defer in [false, true].iter() {
        let name = if *defer { "deferred" } else { "immediate" };
        group.bench_with_input(BenchmarkId::from_parameter(name), defer, |b, defer| {
            b.iter(|| {
                let config = StoreConfig::default().with_defer_indexes(*defer);
                let store = RowStore::open(Arc::new(Database::new()), bench_schema().unwrap(), config)
                    .unwrap();
                for row in &rows {
                    store.write_row(row).unwrap();
                }
                store.flush_deferred_indexes().unwrap();
                black_box(store.row_count(ORDER).unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark a full group scan; small buffers repeat ancestor rows.
fn bench_group_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan/group");
    let store = populated_store(SHAPE, StoreConfig::default()).unwrap();
    let group_id = TableId::new(1 + GROUP_TABLE_ID_OFFSET);
    let columns = ColumnSet::all(store.schema().require(group_id).unwrap().field_count());

    group.throughput(Throughput::Elements(SHAPE.rows() as u64));
    for capacity in [1024, 8 * 1024, 64 * 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &capacity| {
            b.iter(|| {
                let request = ScanRequest::new(group_id).with_columns(columns.clone());
                black_box(drain(&store, request, capacity))
            });
        });
    }

    group.finish();
}

/// Benchmark scanning orders through the total index, fetching rows or
/// answering from the index alone.
fn bench_index_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan/index");
    let store = populated_store(SHAPE, StoreConfig::default()).unwrap();

    group.throughput(Throughput::Elements((SHAPE.customers * SHAPE.orders) as u64));
    group.bench_function("rows", |b| {
        b.iter(|| {
            let request = ScanRequest::new(ORDER).with_index(IndexId::new(1));
            black_box(drain(&store, request, 64 * 1024))
        });
    });
    group.bench_function("covering", |b| {
        b.iter(|| {
            let request = ScanRequest::new(ORDER)
                .with_index(IndexId::new(1))
                .with_columns(ColumnSet::from_columns(&[0, 2]));
            black_box(drain(&store, request, 64 * 1024))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_write_group, bench_group_scan, bench_index_scan);
criterion_main!(benches);
