//! hkey benchmarks for canopy.
//!
//! Benchmarks for:
//! - Key segment encoding and decoding
//! - hkey construction at each level of a group
//! - Index key derivation

use canopy_bench::utils::{populated_store, GroupShape, CUSTOMER, ITEM, ORDER};
use canopy_common::config::StoreConfig;
use canopy_common::types::{IndexId, TableId};
use canopy_row::{row_hkey, row_to_index_key, FieldValue, RowData};
use canopy_storage::Key;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SHAPE: GroupShape = GroupShape {
    customers: 100,
    orders: 4,
    items: 4,
};

/// Benchmark building and decoding mixed int/string keys.
fn bench_key_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("hkey/key_encode");

    for count in [1000, 10_000].iter() {
        let mut rng = StdRng::seed_from_u64(42);
        let parts: Vec<(i64, i64, String)> = (0..*count)
            .map(|_| {
                let id: i64 = rng.gen();
                let child: i64 = rng.gen_range(0..1_000_000);
                (id, child, format!("sku-{:06}", rng.gen_range(0..1_000_000)))
            })
            .collect();

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let mut total = 0;
                for (id, child, sku) in &parts {
                    let mut key = Key::new();
                    key.append_int(1).append_int(*id).append_int(2).append_int(*child);
                    key.append_int(3).append_str(sku);
                    total += key.decode_all().unwrap().len();
                }
                black_box(total)
            });
        });
    }

    group.finish();
}

/// Benchmark hkey construction; deeper tables resolve their parent first.
fn bench_row_hkey(c: &mut Criterion) {
    let mut group = c.benchmark_group("hkey/row_hkey");
    let store = populated_store(SHAPE, StoreConfig::default()).unwrap();
    let schema = store.schema();
    let db = store.database();

    let cases: [(&str, TableId, Vec<FieldValue>); 3] = [
        ("customer", CUSTOMER, vec![50.into(), "x".into()]),
        ("order", ORDER, vec![9_999.into(), 50.into(), 1.into()]),
        ("item", ITEM, vec![99_999.into(), 200.into(), "x".into()]),
    ];
    for (name, table, values) in cases.iter() {
        let def = schema.require(*table).unwrap();
        let row = RowData::new(def, values).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(name), &row, |b, row| {
            b.iter(|| black_box(row_hkey(schema, def, row, db.as_ref()).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark deriving a secondary index key from a row and its hkey.
fn bench_index_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("hkey/index_key");
    let store = populated_store(SHAPE, StoreConfig::default()).unwrap();
    let schema = store.schema();
    let def = schema.require(ORDER).unwrap();
    let row = RowData::new(def, &[9_999.into(), 50.into(), 1.into()]).unwrap();
    let hkey = row_hkey(schema, def, &row, store.database().as_ref()).unwrap();

    for id in [IndexId::PRIMARY, IndexId::new(1)].iter() {
        let index = def.index(*id).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(index.name()), index, |b, index| {
            b.iter(|| black_box(row_to_index_key(index, def, &row, &hkey).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_key_encode, bench_row_hkey, bench_index_key);
criterion_main!(benches);
