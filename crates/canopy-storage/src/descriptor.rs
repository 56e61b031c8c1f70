//! Tree descriptors.
//!
//! Every tree records a fixed-size header describing how its keys are laid
//! out. Row and index trees hold segment-encoded hierarchical keys; status
//! trees hold fixed-length raw keys.
//!
//! ```text
//! offset  size  field
//! ------  ----  -----------------------------------------
//!      0     1  kind (1 = fixed length, 2 = hkey)
//!      1     1  format version
//!      2     4  table id (big-endian)
//!      6     4  kind-specific: key size (u16) or index id (u32)
//!     10     6  reserved, zero
//! ```

use canopy_common::types::{IndexId, TableId};

use crate::key::segment_ranges;

/// Size of an encoded descriptor header.
pub const DESCRIPTOR_HEADER_SIZE: usize = 16;

const FORMAT_VERSION: u8 = 1;
const KIND_FIXED_LENGTH: u8 = 1;
const KIND_HKEY: u8 = 2;

/// Key layout of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyDescriptor {
    /// Raw keys of exactly `key_size` bytes.
    FixedLength {
        /// Owning table.
        table_id: TableId,
        /// Key length in bytes.
        key_size: u16,
    },
    /// Segment-encoded hierarchical keys.
    HKey {
        /// Owning table.
        table_id: TableId,
        /// `IndexId::PRIMARY` for the group tree itself.
        index_id: IndexId,
    },
}

impl KeyDescriptor {
    /// Descriptor for a group tree keyed by hkeys.
    #[must_use]
    pub const fn hkey(table_id: TableId) -> Self {
        Self::HKey {
            table_id,
            index_id: IndexId::PRIMARY,
        }
    }

    /// Descriptor for an index tree.
    #[must_use]
    pub const fn index(table_id: TableId, index_id: IndexId) -> Self {
        Self::HKey { table_id, index_id }
    }

    /// Descriptor for a tree of fixed-length raw keys.
    #[must_use]
    pub const fn fixed_length(table_id: TableId, key_size: u16) -> Self {
        Self::FixedLength { table_id, key_size }
    }

    /// The owning table.
    #[must_use]
    pub const fn table_id(&self) -> TableId {
        match self {
            Self::FixedLength { table_id, .. } | Self::HKey { table_id, .. } => *table_id,
        }
    }

    /// Returns true if a key is well formed for this tree.
    #[must_use]
    pub fn accepts(&self, key: &[u8]) -> bool {
        match self {
            Self::FixedLength { key_size, .. } => key.len() == usize::from(*key_size),
            Self::HKey { .. } => {
                segment_ranges(key).last().map(|r| r.end) == Some(key.len())
            }
        }
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; DESCRIPTOR_HEADER_SIZE] {
        let mut header = [0u8; DESCRIPTOR_HEADER_SIZE];
        header[1] = FORMAT_VERSION;
        header[2..6].copy_from_slice(&self.table_id().to_be_bytes());
        match self {
            Self::FixedLength { key_size, .. } => {
                header[0] = KIND_FIXED_LENGTH;
                header[6..8].copy_from_slice(&key_size.to_be_bytes());
            }
            Self::HKey { index_id, .. } => {
                header[0] = KIND_HKEY;
                header[6..10].copy_from_slice(&index_id.as_u32().to_be_bytes());
            }
        }
        header
    }

    /// Decodes a header, describing what was wrong on failure.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != DESCRIPTOR_HEADER_SIZE {
            return Err(format!(
                "header is {} bytes, expected {DESCRIPTOR_HEADER_SIZE}",
                bytes.len()
            ));
        }
        if bytes[1] != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", bytes[1]));
        }
        let table_id = TableId::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        match bytes[0] {
            KIND_FIXED_LENGTH => Ok(Self::FixedLength {
                table_id,
                key_size: u16::from_be_bytes([bytes[6], bytes[7]]),
            }),
            KIND_HKEY => Ok(Self::HKey {
                table_id,
                index_id: IndexId::new(u32::from_be_bytes([
                    bytes[6], bytes[7], bytes[8], bytes[9],
                ])),
            }),
            kind => Err(format!("unknown descriptor kind {kind}")),
        }
    }
}
