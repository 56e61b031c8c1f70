//! Engine-wide constants for canopy.

// =============================================================================
// Transactions
// =============================================================================

/// Number of attempts a mutation makes before failing with a transaction error.
pub const MAX_TRANSACTION_RETRY_COUNT: u32 = 10;

// =============================================================================
// Deferred Index Maintenance
// =============================================================================

/// Pending deferred index keys are flushed once their accounted size exceeds this.
pub const DEFAULT_DEFERRED_INDEX_TRANCHE: usize = 10 * 1024 * 1024;

/// Bookkeeping bytes charged per deferred key on top of the key length.
pub const DEFERRED_KEY_OVERHEAD: usize = 64;

// =============================================================================
// Row Encoding
// =============================================================================

/// Bytes of fixed envelope surrounding every encoded row.
///
/// Leading length (4), signature (2), field count (2), row def id (4),
/// trailing signature (2), trailing length (4).
pub const ROW_ENVELOPE_SIZE: usize = 18;

/// Length prefix written ahead of each row in a scan buffer.
pub const ROW_PREFIX_SIZE: usize = 4;

/// Largest encoded row accepted by the row encoder (1 MB).
pub const MAX_ROW_SIZE: usize = 1024 * 1024;

// =============================================================================
// Scanning
// =============================================================================

/// Default capacity of a scan output buffer (64 KB).
pub const DEFAULT_SCAN_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of samples kept per index histogram.
pub const DEFAULT_HISTOGRAM_SAMPLE_SIZE: usize = 32;

// =============================================================================
// Key Limits
// =============================================================================

/// Maximum encoded key size in bytes (16 KB).
pub const MAX_KEY_SIZE: usize = 16 * 1024;
