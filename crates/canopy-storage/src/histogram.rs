//! Sampled key distributions.

use crate::key::Key;

/// One histogram sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCount {
    /// The sampled key, truncated to the histogram depth.
    pub key: Key,
    /// Stored keys in the bucket ending at this sample.
    pub count: u64,
    /// Distinct truncated keys in the bucket ending at this sample.
    pub distinct: u64,
}

/// Evenly spaced samples over the distinct truncated keys of a tree.
///
/// Buckets are contiguous and the final sample is always the greatest key,
/// so the counts sum to the number of stored keys visited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyHistogram {
    key_count: u64,
    samples: Vec<KeyCount>,
}

impl KeyHistogram {
    /// Number of distinct truncated keys.
    #[must_use]
    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    /// Number of stored keys visited.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.samples.iter().map(|s| s.count).sum()
    }

    /// The samples in key order.
    #[must_use]
    pub fn samples(&self) -> &[KeyCount] {
        &self.samples
    }

    /// Returns true if no keys were visited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Builds a histogram from `(distinct key, occurrences)` runs in key order.
pub(crate) fn sample(distinct: Vec<(Key, u64)>, sample_size: usize) -> KeyHistogram {
    let n = distinct.len();
    let key_count = n as u64;
    let buckets = sample_size.clamp(1, n.max(1));

    let mut samples = Vec::with_capacity(buckets.min(n));
    let mut count = 0;
    let mut in_bucket = 0;
    let mut next = 1;
    for (i, (key, occurrences)) in distinct.into_iter().enumerate() {
        count += occurrences;
        in_bucket += 1;
        // Bucket `next` ends at index next * n / buckets - 1.
        if i + 1 == next * n / buckets {
            samples.push(KeyCount {
                key,
                count,
                distinct: in_bucket,
            });
            count = 0;
            in_bucket = 0;
            next += 1;
        }
    }

    KeyHistogram { key_count, samples }
}
