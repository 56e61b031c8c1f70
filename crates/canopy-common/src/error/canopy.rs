//! Shared error taxonomy.
//!
//! Provides the stable [`ErrorCode`] every canopy error classifies into, and
//! [`CanopyError`] for failures outside the storage and row layers.

use std::fmt;
use thiserror::Error;

/// Error codes for categorizing errors.
///
/// These codes are stable across versions and group errors by how a caller
/// is expected to react: not-found and constraint errors go back to the user,
/// transaction errors may be retried, corruption and contract errors are bugs
/// or damaged data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0002,
    /// Invalid configuration.
    InvalidConfig = 0x0003,

    // I/O and integrity errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Stored data failed an integrity check.
    Corruption = 0x0101,

    // Storage errors (0x0200 - 0x02FF)
    /// Encoded key exceeds the size limit.
    KeyTooLarge = 0x0200,
    /// Key bytes could not be decoded.
    InvalidKey = 0x0201,

    // Transaction errors (0x0300 - 0x03FF)
    /// Transaction rolled back by a conflicting commit; retry.
    TransactionRollback = 0x0300,
    /// Retry budget exhausted.
    TransactionFailed = 0x0301,

    // Not-found errors (0x0400 - 0x04FF)
    /// Table does not exist or has been dropped.
    NoSuchTable = 0x0400,
    /// Row does not exist.
    NoSuchRecord = 0x0401,
    /// Parent row referenced by a child does not exist.
    NoReferencedRow = 0x0402,
    /// Index does not exist.
    NoSuchIndex = 0x0403,

    // Constraint errors (0x0500 - 0x05FF)
    /// Duplicate key in a unique index or at an hkey position.
    DuplicateKey = 0x0500,
    /// Operation blocked by existing descendant rows.
    FkConstraintViolation = 0x0501,

    // Contract errors (0x0600 - 0x06FF)
    /// Malformed scan request.
    InvalidScan = 0x0600,
    /// A pending window does not fit an empty scan buffer.
    ScanBufferTooSmall = 0x0601,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x02 => "Storage",
            0x03 => "Transaction",
            0x04 => "NotFound",
            0x05 => "Constraint",
            0x06 => "Contract",
            _ => "Unknown",
        }
    }

    /// Returns true for the not-found category.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        (*self as u16) >> 8 == 0x04
    }

    /// Returns true for the constraint category.
    #[must_use]
    pub const fn is_constraint(&self) -> bool {
        (*self as u16) >> 8 == 0x05
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// General canopy error.
///
/// Used by configuration loading and shared helpers. The storage and row
/// layers have their own enums that report through [`ErrorCode`].
#[derive(Debug, Error)]
pub enum CanopyError {
    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration: {source}")]
    ConfigParse {
        /// The underlying TOML error.
        #[from]
        source: toml::de::Error,
    },

    /// Configuration could not be rendered.
    #[error("failed to render configuration: {source}")]
    ConfigRender {
        /// The underlying TOML error.
        #[from]
        source: toml::ser::Error,
    },
}

impl CanopyError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfig { .. } | Self::ConfigParse { .. } | Self::ConfigRender { .. } => {
                ErrorCode::InvalidConfig
            }
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_categories() {
        assert_eq!(ErrorCode::NoSuchTable.category(), "NotFound");
        assert_eq!(ErrorCode::DuplicateKey.category(), "Constraint");
        assert_eq!(ErrorCode::TransactionFailed.category(), "Transaction");
        assert_eq!(ErrorCode::Corruption.category(), "I/O");
        assert_eq!(ErrorCode::InvalidScan.category(), "Contract");
    }

    #[test]
    fn test_error_code_predicates() {
        assert!(ErrorCode::NoReferencedRow.is_not_found());
        assert!(!ErrorCode::NoReferencedRow.is_constraint());
        assert!(ErrorCode::FkConstraintViolation.is_constraint());
        assert!(!ErrorCode::TransactionRollback.is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = CanopyError::invalid_config("retries must be positive");
        assert_eq!(
            err.to_string(),
            "invalid configuration: retries must be positive"
        );
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CanopyError = io_err.into();
        assert_eq!(err.code(), ErrorCode::Io);
    }
}
