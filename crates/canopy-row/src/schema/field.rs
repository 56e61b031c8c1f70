//! Field types and values.

use std::fmt;

use canopy_storage::KeySegment;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// 1-byte signed integer.
    TinyInt,
    /// 2-byte signed integer.
    SmallInt,
    /// 4-byte signed integer.
    Int,
    /// 8-byte signed integer.
    BigInt,
    /// UTF-8 string of at most `max` bytes.
    Varchar {
        /// Maximum encoded length in bytes.
        max: u16,
    },
    /// Byte string of at most `max` bytes.
    Varbinary {
        /// Maximum length in bytes.
        max: u16,
    },
}

impl FieldType {
    /// Width of a fixed-size value, or `None` for variable-length types.
    #[must_use]
    pub const fn fixed_width(self) -> Option<usize> {
        match self {
            Self::TinyInt => Some(1),
            Self::SmallInt => Some(2),
            Self::Int => Some(4),
            Self::BigInt => Some(8),
            Self::Varchar { .. } | Self::Varbinary { .. } => None,
        }
    }

    /// Width of the length prefix of a variable-length value.
    #[must_use]
    pub const fn prefix_width(self) -> usize {
        match self {
            Self::Varchar { max } | Self::Varbinary { max } => {
                if max <= 255 {
                    1
                } else {
                    2
                }
            }
            _ => 0,
        }
    }

    /// Maximum encoded size of a value, prefix included.
    #[must_use]
    pub const fn max_width(self) -> usize {
        match self {
            Self::Varchar { max } | Self::Varbinary { max } => self.prefix_width() + max as usize,
            Self::TinyInt => 1,
            Self::SmallInt => 2,
            Self::Int => 4,
            Self::BigInt => 8,
        }
    }

    /// Inclusive value range of an integer type.
    pub(crate) const fn int_range(self) -> Option<(i64, i64)> {
        match self {
            Self::TinyInt => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::SmallInt => Some((i16::MIN as i64, i16::MAX as i64)),
            Self::Int => Some((i32::MIN as i64, i32::MAX as i64)),
            Self::BigInt => Some((i64::MIN, i64::MAX)),
            Self::Varchar { .. } | Self::Varbinary { .. } => None,
        }
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub field_type: FieldType,
    /// Whether the column accepts null.
    pub nullable: bool,
}

impl FieldDef {
    /// Creates a non-null column.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
        }
    }

    /// Makes the column nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldValue {
    /// SQL null.
    Null,
    /// Any integer type.
    Int(i64),
    /// A varchar value.
    Str(String),
    /// A varbinary value.
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Returns true for null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer value, if this is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Canonical key segment for this value.
    #[must_use]
    pub fn to_segment(&self) -> KeySegment {
        match self {
            Self::Null => KeySegment::Null,
            Self::Int(v) => KeySegment::Int(*v),
            Self::Str(s) => KeySegment::Str(s.clone()),
            Self::Bytes(b) => KeySegment::Bytes(b.clone()),
        }
    }

    /// Value decoded from a key segment.
    #[must_use]
    pub fn from_segment(segment: KeySegment) -> Self {
        match segment {
            KeySegment::Null => Self::Null,
            KeySegment::Int(v) => Self::Int(v),
            KeySegment::Str(s) => Self::Str(s),
            KeySegment::Bytes(b) => Self::Bytes(b),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert_eq!(FieldType::SmallInt.fixed_width(), Some(2));
        assert_eq!(FieldType::Varchar { max: 255 }.prefix_width(), 1);
        assert_eq!(FieldType::Varchar { max: 256 }.prefix_width(), 2);
        assert_eq!(FieldType::Varbinary { max: 300 }.max_width(), 302);
        assert_eq!(FieldType::TinyInt.int_range(), Some((-128, 127)));
    }

    #[test]
    fn test_segment_conversion() {
        let value = FieldValue::from("abc");
        assert_eq!(FieldValue::from_segment(value.to_segment()), value);
        assert_eq!(FieldValue::from(None::<i64>), FieldValue::Null);
        assert_eq!(FieldValue::from(Some(5i64)).as_int(), Some(5));
    }
}
