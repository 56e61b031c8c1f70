//! Seeded workload generators.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// A `b` row to write: `(id, aid, score)`.
pub type ChildRow = (i64, i64, i64);

/// Generates `count` child rows spread over parents `1..=parents`, with
/// random scores and ids in shuffled order.
pub fn child_rows(count: usize, parents: i64, seed: u64) -> Vec<ChildRow> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ids: Vec<i64> = (1..=count as i64).collect();
    ids.shuffle(&mut rng);
    ids.into_iter()
        .map(|id| {
            let aid = rng.gen_range(1..=parents);
            let score = rng.gen_range(0..1000);
            (id, aid, score)
        })
        .collect()
}

/// Splits `0..count` into `workers` disjoint id ranges.
pub fn partition(count: usize, workers: usize) -> Vec<std::ops::Range<i64>> {
    let per = count.div_ceil(workers.max(1));
    (0..workers)
        .map(|w| {
            let start = (w * per).min(count) as i64;
            let end = ((w + 1) * per).min(count) as i64;
            start..end
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_rows_deterministic() {
        let rows = child_rows(50, 5, 42);
        assert_eq!(rows, child_rows(50, 5, 42));
        let mut ids: Vec<i64> = rows.iter().map(|r| r.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=50).collect::<Vec<_>>());
        assert!(rows.iter().all(|r| (1..=5).contains(&r.1)));
    }

    #[test]
    fn test_partition_covers_range() {
        let parts = partition(10, 3);
        assert_eq!(parts, vec![0..4, 4..8, 8..10]);
    }
}
