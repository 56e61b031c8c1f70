//! Index analysis: sampled key distributions persisted per index.
//!
//! Samples live in one fixed-length tree, keyed so that every sample of an
//! index is contiguous and in key order:
//!
//! ```text
//!   key:   | table id u32 BE | index id u32 BE | item u32 BE |
//!   value: | count u64 BE | distinct u64 BE | truncated index key ... |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use canopy_common::types::{IndexId, TableId, Value};
use canopy_storage::{
    Database, Direction, Key, KeyDescriptor, KeyHistogram, KvRead, Seek, Transaction,
};

use crate::error::{RowResult, RowStoreError};
use crate::retry;
use crate::schema::{FieldValue, IndexDef, RowDef};
use crate::store::{table_filter, RowStore};

/// Tree holding index analysis samples.
pub const ANALYSIS_TREE: &str = "_analysis";

const ANALYSIS_KEY_SIZE: u16 = 12;
const SAMPLE_HEADER_SIZE: usize = 16;

/// One sampled index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSample {
    /// Decoded key values, in index field order.
    pub key: Vec<FieldValue>,
    /// Rows in the bucket ending at this key.
    pub count: u64,
    /// Distinct keys in the bucket ending at this key.
    pub distinct: u64,
}

/// Stored analysis of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    /// The analyzed index.
    pub index_id: IndexId,
    /// Its name.
    pub index_name: String,
    /// Samples in key order.
    pub samples: Vec<HistogramSample>,
}

impl Histogram {
    /// Rows covered by the samples.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.samples.iter().map(|s| s.count).sum()
    }
}

/// Status and analysis of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStatistics {
    /// The table.
    pub table_id: TableId,
    /// Number of rows.
    pub row_count: u64,
    /// Highest auto-increment value written.
    pub auto_increment: i64,
    /// One entry per analyzed index, by index id.
    pub histograms: Vec<Histogram>,
}

pub(crate) fn create_analysis_tree(db: &Database) -> RowResult<()> {
    db.create_tree(
        ANALYSIS_TREE,
        KeyDescriptor::fixed_length(TableId::NONE, ANALYSIS_KEY_SIZE),
    )?;
    Ok(())
}

impl RowStore {
    /// Samples an index and replaces its stored analysis. Returns the number
    /// of samples stored.
    pub fn analyze_index(
        &self,
        table: TableId,
        index_id: IndexId,
        sample_size: usize,
    ) -> RowResult<usize> {
        let def = self.analyzable(table)?;
        let index = def.index(index_id).ok_or_else(|| RowStoreError::NoSuchIndex {
            table: def.qualified_name(),
            index: index_id.as_u32(),
        })?;
        let db = self.database();

        let histogram = if index.is_hkey_equivalent() {
            let filter = table_filter(self.schema(), def);
            db.compute_histogram(def.tree_name(), Some(&filter), sample_size, def.hkey_depth())?
        } else {
            db.compute_histogram(index.tree_name(), None, sample_size, index.fields().len())?
        };

        let prefix = analysis_prefix(table, Some(index_id));
        let samples = histogram.samples().len();
        retry::run(
            db,
            self.config().max_transaction_retries,
            ANALYSIS_TREE,
            |txn| {
                remove_under(txn, &prefix)?;
                store_samples(txn, table, index_id, &histogram);
                Ok(())
            },
            |_, _| {},
        )?;
        tracing::info!(
            table = %def,
            index = %index.name(),
            keys = histogram.key_count(),
            rows = histogram.total_count(),
            samples,
            "analyzed index"
        );
        Ok(samples)
    }

    /// Analyzes every index of a table with the configured sample size.
    /// Returns the number of indexes analyzed.
    pub fn analyze_table(&self, table: TableId) -> RowResult<usize> {
        let def = self.analyzable(table)?;
        let sample_size = self.config().histogram_sample_size;
        for index in def.indexes() {
            self.analyze_index(table, index.id(), sample_size)?;
        }
        Ok(def.indexes().len())
    }

    /// Removes the stored analysis of one index, or of every index of the
    /// table. Returns the number of samples removed.
    pub fn delete_index_analysis(&self, table: TableId, index_id: Option<IndexId>) -> RowResult<usize> {
        let prefix = analysis_prefix(table, index_id);
        let removed = retry::run(
            self.database(),
            self.config().max_transaction_retries,
            ANALYSIS_TREE,
            |txn| remove_under(txn, &prefix),
            |_, _| {},
        )?;
        if removed > 0 {
            tracing::debug!(table = %table.as_u32(), samples = removed, "deleted index analysis");
        }
        Ok(removed)
    }

    /// Row count, auto-increment value and stored index analysis of a table.
    pub fn table_statistics(&self, table: TableId) -> RowResult<TableStatistics> {
        let def = self.analyzable(table)?;
        let status = self.table_status(table);
        let prefix = analysis_prefix(table, None);

        let mut histograms: Vec<Histogram> = Vec::new();
        for (key, value) in entries_under(self.database().as_ref(), &prefix)? {
            let index_id = IndexId::new(u32::from_be_bytes([key[4], key[5], key[6], key[7]]));
            let Some(index) = def.index(index_id) else {
                continue;
            };
            let sample = decode_sample(def, index, &value)?;
            match histograms.last_mut() {
                Some(last) if last.index_id == index_id => last.samples.push(sample),
                _ => histograms.push(Histogram {
                    index_id,
                    index_name: index.name().to_string(),
                    samples: vec![sample],
                }),
            }
        }

        Ok(TableStatistics {
            table_id: table,
            row_count: status.row_count,
            auto_increment: status.auto_increment,
            histograms,
        })
    }

    fn analyzable(&self, table: TableId) -> RowResult<&RowDef> {
        let def = self.schema().require(table)?;
        if def.is_group() || self.table_status(table).deleted {
            return Err(RowStoreError::no_such_table(def.qualified_name()));
        }
        Ok(def.as_ref())
    }
}

fn analysis_prefix(table: TableId, index: Option<IndexId>) -> Vec<u8> {
    let mut prefix = table.to_be_bytes().to_vec();
    if let Some(index) = index {
        prefix.extend_from_slice(&index.as_u32().to_be_bytes());
    }
    prefix
}

fn entries_under(reader: &impl KvRead, prefix: &[u8]) -> RowResult<Vec<(Bytes, Value)>> {
    let mut entries = Vec::new();
    let mut seek = Seek::new(prefix.to_vec(), Direction::GtEq);
    while let Some((key, value)) = reader.seek(ANALYSIS_TREE, &seek)? {
        if !key.starts_with(prefix) {
            break;
        }
        seek = Seek::new(key.to_vec(), Direction::Gt);
        entries.push((key, value));
    }
    Ok(entries)
}

fn remove_under(txn: &mut Transaction<'_>, prefix: &[u8]) -> RowResult<usize> {
    let entries = entries_under(&*txn, prefix)?;
    for (key, _) in &entries {
        txn.delete(ANALYSIS_TREE, key);
    }
    Ok(entries.len())
}

fn store_samples(txn: &mut Transaction<'_>, table: TableId, index: IndexId, histogram: &KeyHistogram) {
    for (item, sample) in histogram.samples().iter().enumerate() {
        let mut key = BytesMut::with_capacity(usize::from(ANALYSIS_KEY_SIZE));
        key.put_slice(&table.to_be_bytes());
        key.put_u32(index.as_u32());
        key.put_u32(item as u32);

        let encoded = sample.key.as_bytes();
        let mut value = BytesMut::with_capacity(SAMPLE_HEADER_SIZE + encoded.len());
        value.put_u64(sample.count);
        value.put_u64(sample.distinct);
        value.put_slice(encoded);
        txn.put(ANALYSIS_TREE, key.freeze(), Value::from_raw(value.freeze()));
    }
}

fn decode_sample(def: &RowDef, index: &IndexDef, value: &[u8]) -> RowResult<HistogramSample> {
    if value.len() < SAMPLE_HEADER_SIZE {
        return Err(RowStoreError::corruption(format!(
            "analysis sample of {} bytes for {}",
            value.len(),
            index.name()
        )));
    }
    let mut header = &value[..SAMPLE_HEADER_SIZE];
    let count = header.get_u64();
    let distinct = header.get_u64();
    let key = Key::from(Bytes::copy_from_slice(&value[SAMPLE_HEADER_SIZE..]));
    let segments = key.decode_all()?;

    // Hkey samples carry an ordinal ahead of each level's key columns.
    let ordinals = if index.is_hkey_equivalent() {
        ordinal_depths(def)
    } else {
        Vec::new()
    };
    let key = segments
        .into_iter()
        .enumerate()
        .filter(|(depth, _)| !ordinals.contains(depth))
        .map(|(_, segment)| FieldValue::from_segment(segment))
        .collect();
    Ok(HistogramSample {
        key,
        count,
        distinct,
    })
}

fn ordinal_depths(def: &RowDef) -> Vec<usize> {
    let mut depths = Vec::with_capacity(def.hkey_levels().len());
    let mut depth = 0;
    for level in def.hkey_levels() {
        depths.push(depth);
        depth += 1 + level.key_fields;
    }
    depths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowdata::RowData;
    use crate::schema::{FieldType, IndexSpec, RowDefCache, SchemaBuilder, TableSpec};
    use canopy_common::config::StoreConfig;
    use std::sync::Arc;

    /// customer(id, city; index city) <- order(id, cid)
    fn schema() -> RowDefCache {
        SchemaBuilder::new()
            .table(
                TableSpec::new(1, "shop", "customer")
                    .field("id", FieldType::BigInt)
                    .field("city", FieldType::Varchar { max: 16 })
                    .primary_key(&[0])
                    .index(IndexSpec::new(1, "city", &[1])),
            )
            .table(
                TableSpec::new(2, "shop", "order")
                    .field("id", FieldType::BigInt)
                    .field("cid", FieldType::BigInt)
                    .primary_key(&[0])
                    .parent(1, &[1]),
            )
            .build()
            .unwrap()
    }

    fn populated() -> RowStore {
        let store =
            RowStore::open(Arc::new(Database::new()), schema(), StoreConfig::for_testing()).unwrap();
        let customer = Arc::clone(store.schema().require(TableId::new(1)).unwrap());
        let order = Arc::clone(store.schema().require(TableId::new(2)).unwrap());
        let cities = ["oslo", "oslo", "oslo", "rome", "rome", "york"];
        for (id, city) in cities.iter().enumerate() {
            let row = RowData::new(&customer, &[(id as i64).into(), (*city).into()]).unwrap();
            store.write_row(&row).unwrap();
        }
        for id in 0..4 {
            let row = RowData::new(&order, &[(100 + id).into(), 0.into()]).unwrap();
            store.write_row(&row).unwrap();
        }
        store
    }

    #[test]
    fn test_secondary_index_histogram() {
        let store = populated();
        assert_eq!(store.analyze_index(TableId::new(1), IndexId::new(1), 8).unwrap(), 3);

        let stats = store.table_statistics(TableId::new(1)).unwrap();
        assert_eq!(stats.row_count, 6);
        assert_eq!(stats.histograms.len(), 1);
        let histogram = &stats.histograms[0];
        assert_eq!(histogram.index_name, "city");
        let keys: Vec<FieldValue> = histogram.samples.iter().map(|s| s.key[0].clone()).collect();
        assert_eq!(
            keys,
            vec![FieldValue::from("oslo"), FieldValue::from("rome"), FieldValue::from("york")]
        );
        let counts: Vec<u64> = histogram.samples.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![3, 2, 1]);
    }

    #[test]
    fn test_hkey_index_samples_table_only() {
        let store = populated();
        // Customer rows only; the orders under customer 0 are excluded.
        store.analyze_index(TableId::new(1), IndexId::PRIMARY, 2).unwrap();
        let stats = store.table_statistics(TableId::new(1)).unwrap();
        let histogram = &stats.histograms[0];
        assert_eq!(histogram.index_id, IndexId::PRIMARY);
        assert_eq!(histogram.row_count(), 6);
        assert_eq!(histogram.samples.last().unwrap().key, vec![FieldValue::Int(5)]);
    }

    #[test]
    fn test_reanalyze_replaces_and_delete() {
        let store = populated();
        assert_eq!(store.analyze_table(TableId::new(1)).unwrap(), 2);
        assert_eq!(store.analyze_index(TableId::new(1), IndexId::new(1), 1).unwrap(), 1);

        let stats = store.table_statistics(TableId::new(1)).unwrap();
        let city = stats.histograms.iter().find(|h| h.index_name == "city").unwrap();
        assert_eq!(city.samples.len(), 1);
        assert_eq!(city.row_count(), 6);

        assert_eq!(store.delete_index_analysis(TableId::new(1), Some(IndexId::new(1))).unwrap(), 1);
        let stats = store.table_statistics(TableId::new(1)).unwrap();
        assert_eq!(stats.histograms.len(), 1);
        assert!(store.delete_index_analysis(TableId::new(1), None).unwrap() > 0);
        assert!(store.table_statistics(TableId::new(1)).unwrap().histograms.is_empty());
    }

    #[test]
    fn test_child_primary_index() {
        let store = populated();
        assert_eq!(store.analyze_table(TableId::new(2)).unwrap(), 1);
        let stats = store.table_statistics(TableId::new(2)).unwrap();
        let histogram = &stats.histograms[0];
        assert_eq!(histogram.row_count(), 4);
        // Truncated to the declared key columns.
        assert_eq!(histogram.samples[0].key, vec![FieldValue::Int(100)]);
    }

    #[test]
    fn test_unknown_index() {
        let store = populated();
        let err = store.analyze_index(TableId::new(1), IndexId::new(9), 4).unwrap_err();
        assert!(matches!(err, RowStoreError::NoSuchIndex { index: 9, .. }));
    }
}
