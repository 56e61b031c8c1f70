//! Benchmark utilities and helpers.

use std::sync::Arc;

use canopy_common::config::StoreConfig;
use canopy_common::types::TableId;
use canopy_row::{
    FieldType, FieldValue, IndexSpec, RowData, RowDefCache, RowResult, RowStore, SchemaBuilder,
    TableSpec,
};
use canopy_storage::Database;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Customer table, the group root.
pub const CUSTOMER: TableId = TableId::new(1);
/// Orders, children of customers.
pub const ORDER: TableId = TableId::new(2);
/// Order items, children of orders.
pub const ITEM: TableId = TableId::new(3);

/// Generates random string data for benchmarks.
pub fn random_string(rng: &mut StdRng, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// customer(id, name) <- order(id, cid, total) <- item(id, oid, sku)
pub fn bench_schema() -> RowResult<RowDefCache> {
    SchemaBuilder::new()
        .table(
            TableSpec::new(1, "bench", "customer")
                .field("id", FieldType::BigInt)
                .field("name", FieldType::Varchar { max: 32 })
                .primary_key(&[0]),
        )
        .table(
            TableSpec::new(2, "bench", "order")
                .field("id", FieldType::BigInt)
                .field("cid", FieldType::BigInt)
                .field("total", FieldType::Int)
                .primary_key(&[0])
                .parent(1, &[1])
                .index(IndexSpec::new(1, "total", &[2])),
        )
        .table(
            TableSpec::new(3, "bench", "item")
                .field("id", FieldType::BigInt)
                .field("oid", FieldType::BigInt)
                .field("sku", FieldType::Varchar { max: 16 })
                .primary_key(&[0])
                .parent(2, &[1]),
        )
        .build()
}

/// Shape of a generated customer group.
#[derive(Debug, Clone, Copy)]
pub struct GroupShape {
    /// Customer rows.
    pub customers: usize,
    /// Orders per customer.
    pub orders: usize,
    /// Items per order.
    pub items: usize,
}

impl GroupShape {
    /// Total rows in the group.
    pub fn rows(&self) -> usize {
        self.customers * (1 + self.orders * (1 + self.items))
    }
}

/// Generates the rows of a customer group, parents before children.
pub fn generate_group_rows(schema: &RowDefCache, shape: GroupShape) -> RowResult<Vec<RowData>> {
    let mut rng = StdRng::seed_from_u64(42);
    let customer = schema.require(CUSTOMER)?;
    let order = schema.require(ORDER)?;
    let item = schema.require(ITEM)?;

    let mut rows = Vec::with_capacity(shape.rows());
    let mut next_order = 1i64;
    let mut next_item = 1i64;
    for cid in 1..=shape.customers as i64 {
        let name = random_string(&mut rng, 12);
        rows.push(RowData::new(customer, &[cid.into(), name.as_str().into()])?);
        for _ in 0..shape.orders {
            let oid = next_order;
            next_order += 1;
            let total: i64 = rng.gen_range(0..10_000);
            rows.push(RowData::new(order, &[oid.into(), cid.into(), total.into()])?);
            for _ in 0..shape.items {
                let sku = random_string(&mut rng, 8);
                rows.push(RowData::new(
                    item,
                    &[next_item.into(), oid.into(), FieldValue::from(sku.as_str())],
                )?);
                next_item += 1;
            }
        }
    }
    Ok(rows)
}

/// Opens a store over a fresh database and writes a generated group.
pub fn populated_store(shape: GroupShape, config: StoreConfig) -> RowResult<RowStore> {
    let store = RowStore::open(Arc::new(Database::new()), bench_schema()?, config)?;
    for row in generate_group_rows(store.schema(), shape)? {
        store.write_row(&row)?;
    }
    Ok(store)
}
