//! Identifier types for canopy.
//!
//! Type-safe wrappers around the numeric ids that name tables and indexes,
//! preventing one from being passed where the other is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Table identifier (the row definition id).
///
/// Every encoded row carries the id of the table it belongs to, so a row read
/// back from storage can be checked against the table that was expected.
///
/// # Example
///
/// ```rust
/// use canopy_common::types::TableId;
///
/// let table = TableId::new(7);
/// assert_eq!(table.as_u32(), 7);
/// assert!(table.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TableId(u32);

impl TableId {
    /// Sentinel for "no table", used as the parent id of root tables.
    pub const NONE: Self = Self(0);

    /// Creates a new `TableId` from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks if this is a real table id.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::NONE.0
    }

    /// Converts to bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Creates a `TableId` from bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            write!(f, "TableId(NONE)")
        } else {
            write!(f, "TableId({})", self.0)
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TableId {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

impl From<TableId> for u32 {
    #[inline]
    fn from(id: TableId) -> Self {
        id.0
    }
}

/// Index identifier, unique within its table.
///
/// Id 0 is reserved for the primary-key index every table carries.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct IndexId(u32);

impl IndexId {
    /// The primary-key index.
    pub const PRIMARY: Self = Self(0);

    /// Creates a new `IndexId` from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks if this names the primary-key index.
    #[inline]
    #[must_use]
    pub const fn is_primary(self) -> bool {
        self.0 == Self::PRIMARY.0
    }
}

impl fmt::Debug for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_primary() {
            write!(f, "IndexId(PRIMARY)")
        } else {
            write!(f, "IndexId({})", self.0)
        }
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for IndexId {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_id() {
        let id = TableId::new(42);
        assert_eq!(id.as_u32(), 42);
        assert!(id.is_valid());
        assert!(!TableId::NONE.is_valid());
        assert_eq!(TableId::from_be_bytes(id.to_be_bytes()), id);
        assert_eq!(format!("{:?}", TableId::NONE), "TableId(NONE)");
    }

    #[test]
    fn test_index_id() {
        assert!(IndexId::PRIMARY.is_primary());
        assert!(!IndexId::new(3).is_primary());
        assert_eq!(format!("{:?}", IndexId::new(3)), "IndexId(3)");
        assert_eq!(IndexId::from(5).to_string(), "5");
    }

    #[test]
    fn test_ordering() {
        assert!(TableId::new(1) < TableId::new(2));
        assert!(IndexId::PRIMARY < IndexId::new(1));
    }
}
