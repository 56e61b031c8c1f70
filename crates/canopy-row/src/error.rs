//! Error types for the row engine.

use canopy_common::ErrorCode;
use canopy_storage::StoreError;
use thiserror::Error;

/// Result type for row engine operations.
pub type RowResult<T> = Result<T, RowStoreError>;

/// Errors that can occur in row engine operations.
#[derive(Debug, Error)]
pub enum RowStoreError {
    // =========================================================================
    // Not found
    // =========================================================================
    /// Table does not exist or has been dropped.
    #[error("no such table: {table}")]
    NoSuchTable {
        /// Table id or name.
        table: String,
    },

    /// No row is stored at the computed hkey.
    #[error("no such record in {table} at {key}")]
    NoSuchRecord {
        /// Qualified table name.
        table: String,
        /// Rendered hkey.
        key: String,
    },

    /// The parent row a child references is missing.
    #[error("{table}: no row in {parent} for join key {key}")]
    NoReferencedRow {
        /// Qualified child table name.
        table: String,
        /// Qualified parent table name.
        parent: String,
        /// Rendered join values.
        key: String,
    },

    /// Index does not exist on the table.
    #[error("no index {index} on table {table}")]
    NoSuchIndex {
        /// Qualified table name.
        table: String,
        /// Index id.
        index: u32,
    },

    // =========================================================================
    // Constraints
    // =========================================================================
    /// A row already exists at the hkey, or a unique index already holds the key.
    #[error("duplicate key in {table} index {index}: {key}")]
    DuplicateKey {
        /// Qualified table name.
        table: String,
        /// Index name, `PRIMARY` for an hkey collision.
        index: String,
        /// Rendered key.
        key: String,
    },

    /// A delete or key-changing update is blocked by descendant rows.
    #[error("{table}: row at {key} has descendant rows")]
    FkConstraintViolation {
        /// Qualified table name.
        table: String,
        /// Rendered hkey.
        key: String,
    },

    // =========================================================================
    // Transactions
    // =========================================================================
    /// The retry budget ran out.
    #[error("transaction on {table} failed after {attempts} attempts: {source}")]
    TransactionFailed {
        /// Qualified table name.
        table: String,
        /// Attempts made.
        attempts: u32,
        /// The last conflict.
        #[source]
        source: StoreError,
    },

    // =========================================================================
    // Data and contract errors
    // =========================================================================
    /// Stored bytes failed an integrity check.
    #[error("corruption: {reason}")]
    Corruption {
        /// What was wrong.
        reason: String,
    },

    /// Malformed scan request or scan state.
    #[error("invalid scan: {reason}")]
    InvalidScan {
        /// What was wrong.
        reason: String,
    },

    /// A complete pending window does not fit an empty scan buffer.
    #[error("scan buffer too small: {needed} bytes needed, capacity {capacity}")]
    ScanBufferTooSmall {
        /// Bytes the pending row needs, prefix included.
        needed: usize,
        /// Buffer capacity.
        capacity: usize,
    },

    /// Schema declaration rejected.
    #[error("invalid schema: {reason}")]
    InvalidSchema {
        /// What was wrong.
        reason: String,
    },

    /// Row values do not fit the table definition.
    #[error("invalid row for {table}: {reason}")]
    InvalidRow {
        /// Qualified table name.
        table: String,
        /// What was wrong.
        reason: String,
    },

    /// Engine configuration rejected.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },

    // =========================================================================
    // Lower layers
    // =========================================================================
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the ordered store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RowStoreError {
    /// Returns the error code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoSuchTable { .. } => ErrorCode::NoSuchTable,
            Self::NoSuchRecord { .. } => ErrorCode::NoSuchRecord,
            Self::NoReferencedRow { .. } => ErrorCode::NoReferencedRow,
            Self::NoSuchIndex { .. } => ErrorCode::NoSuchIndex,
            Self::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            Self::FkConstraintViolation { .. } => ErrorCode::FkConstraintViolation,
            Self::TransactionFailed { .. } => ErrorCode::TransactionFailed,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::InvalidScan { .. } => ErrorCode::InvalidScan,
            Self::ScanBufferTooSmall { .. } => ErrorCode::ScanBufferTooSmall,
            Self::InvalidSchema { .. } | Self::InvalidRow { .. } => ErrorCode::InvalidArgument,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::Io(_) => ErrorCode::Io,
            Self::Store(e) => e.code(),
        }
    }

    /// Returns true if the operation should be retried in a new transaction.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns true for not-found errors.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code().is_not_found()
    }

    /// Returns true for constraint violations.
    #[must_use]
    pub fn is_constraint(&self) -> bool {
        self.code().is_constraint()
    }

    pub(crate) fn no_such_table(table: impl Into<String>) -> Self {
        Self::NoSuchTable {
            table: table.into(),
        }
    }

    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        Self::Corruption {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_scan(reason: impl Into<String>) -> Self {
        Self::InvalidScan {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_schema(reason: impl Into<String>) -> Self {
        Self::InvalidSchema {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let dup = RowStoreError::DuplicateKey {
            table: "shop.order".into(),
            index: "PRIMARY".into(),
            key: "{1,2}".into(),
        };
        assert!(dup.is_constraint());
        assert!(!dup.is_retryable());
        assert_eq!(dup.code(), ErrorCode::DuplicateKey);

        let missing = RowStoreError::no_such_table("7");
        assert!(missing.is_not_found());
        assert_eq!(missing.to_string(), "no such table: 7");
    }

    #[test]
    fn test_store_rollback_is_retryable() {
        let err = RowStoreError::from(StoreError::Rollback {
            tree: "_group.1".into(),
        });
        assert!(err.is_retryable());
        assert_eq!(err.code(), ErrorCode::TransactionRollback);

        let failed = RowStoreError::TransactionFailed {
            table: "shop.order".into(),
            attempts: 10,
            source: StoreError::Rollback {
                tree: "_group.1".into(),
            },
        };
        assert!(!failed.is_retryable());
        assert_eq!(failed.code().category(), "Transaction");
    }
}
