//! Error types for the ordered store.

use canopy_common::ErrorCode;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent commit changed a tree this transaction read.
    #[error("transaction rolled back: tree '{tree}' changed since the transaction began")]
    Rollback {
        /// The tree whose version moved.
        tree: String,
    },

    /// Key bytes are not a valid segment encoding.
    #[error("invalid key {key}: {reason}")]
    InvalidKey {
        /// Hex rendering of the offending key.
        key: String,
        /// What was wrong.
        reason: String,
    },

    /// Key is too large.
    #[error("key too large: {size} bytes (max: {max})")]
    KeyTooLarge {
        /// Actual size of the key.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Tree does not exist.
    #[error("no such tree: {name}")]
    NoSuchTree {
        /// The tree name.
        name: String,
    },

    /// A tree descriptor header failed to decode.
    #[error("invalid descriptor for tree '{tree}': {reason}")]
    InvalidDescriptor {
        /// The tree name.
        tree: String,
        /// What was wrong.
        reason: String,
    },
}

impl StoreError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Rollback { .. } => ErrorCode::TransactionRollback,
            Self::InvalidKey { .. } => ErrorCode::InvalidKey,
            Self::KeyTooLarge { .. } => ErrorCode::KeyTooLarge,
            Self::NoSuchTree { .. } => ErrorCode::InvalidArgument,
            Self::InvalidDescriptor { .. } => ErrorCode::Corruption,
        }
    }

    /// Returns true if the operation should be retried in a new transaction.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Rollback { .. })
    }

    pub(crate) fn invalid_key(bytes: &[u8], reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: hex(bytes),
            reason: reason.into(),
        }
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 2);
    out.push_str("0x");
    for byte in &bytes[..bytes.len().min(64)] {
        out.push_str(&format!("{byte:02x}"));
    }
    if bytes.len() > 64 {
        out.push_str("...");
    }
    out
}
