//! Segment-encoded keys.
//!
//! A key is a sequence of self-delimiting segments whose byte order equals
//! their value order, so a tree sorted by raw key bytes is sorted by the
//! logical tuple the key encodes.
//!
//! # Encoding
//!
//! ```text
//! segment := tag payload* 0x00
//!
//! tag   0x02  null      (no payload)
//!       0x20  integer   8 bytes big-endian, sign bit flipped
//!       0x30  string    UTF-8 bytes
//!       0x40  bytes     raw bytes
//!
//! payload 0x00 is written as 0x00 0xFF
//! ```
//!
//! Because no tag is `0x00` or `0xFF`, a terminator is any `0x00` not followed
//! by `0xFF`. A key that is a segment-wise prefix of another sorts first, which
//! is what makes a parent's hkey precede its children.
//!
//! Two edge bytes exist only in seek positions, never in stored keys:
//! `0x01` sorts before every segment and `0xFF` after every segment.

use std::fmt;
use std::ops::Range;

use bytes::Bytes;
use canopy_common::constants::MAX_KEY_SIZE;

use crate::error::{StoreError, StoreResult};

pub(crate) const TERMINATOR: u8 = 0x00;
pub(crate) const ESCAPE: u8 = 0xFF;

const TAG_BEFORE: u8 = 0x01;
const TAG_NULL: u8 = 0x02;
const TAG_INT: u8 = 0x20;
const TAG_STRING: u8 = 0x30;
const TAG_BYTES: u8 = 0x40;
const TAG_AFTER: u8 = 0xFF;

const SIGN_BIT: u64 = 1 << 63;

/// Seek position before every key in a tree.
pub const BEFORE_EDGE: &[u8] = &[TAG_BEFORE];

/// Seek position after every key in a tree.
pub const AFTER_EDGE: &[u8] = &[TAG_AFTER];

/// A decoded key segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySegment {
    /// SQL null; sorts before every other value.
    Null,
    /// Signed integer of any width.
    Int(i64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl KeySegment {
    /// Appends this segment's encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Null => out.push(TAG_NULL),
            Self::Int(v) => {
                out.push(TAG_INT);
                escape_into(&((*v as u64) ^ SIGN_BIT).to_be_bytes(), out);
            }
            Self::Str(s) => {
                out.push(TAG_STRING);
                escape_into(s.as_bytes(), out);
            }
            Self::Bytes(b) => {
                out.push(TAG_BYTES);
                escape_into(b, out);
            }
        }
        out.push(TERMINATOR);
    }

    /// Returns this segment's encoding.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        self.encode_into(&mut out);
        out
    }

    /// Decodes exactly one encoded segment.
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| StoreError::invalid_key(bytes, "empty segment"))?;
        let body = match rest.split_last() {
            Some((&TERMINATOR, body)) => body,
            _ => return Err(StoreError::invalid_key(bytes, "unterminated segment")),
        };
        let payload = unescape(body).ok_or_else(|| StoreError::invalid_key(bytes, "bad escape"))?;

        match tag {
            TAG_NULL if payload.is_empty() => Ok(Self::Null),
            TAG_INT => {
                let raw: [u8; 8] = payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::invalid_key(bytes, "integer payload is not 8 bytes"))?;
                Ok(Self::Int((u64::from_be_bytes(raw) ^ SIGN_BIT) as i64))
            }
            TAG_STRING => String::from_utf8(payload)
                .map(Self::Str)
                .map_err(|_| StoreError::invalid_key(bytes, "string is not UTF-8")),
            TAG_BYTES => Ok(Self::Bytes(payload)),
            _ => Err(StoreError::invalid_key(
                bytes,
                format!("unknown segment tag 0x{tag:02x}"),
            )),
        }
    }

    /// Returns the integer value, if this is an integer segment.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

fn escape_into(payload: &[u8], out: &mut Vec<u8>) {
    for &byte in payload {
        out.push(byte);
        if byte == TERMINATOR {
            out.push(ESCAPE);
        }
    }
}

fn unescape(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let byte = body[i];
        out.push(byte);
        if byte == TERMINATOR {
            if body.get(i + 1) != Some(&ESCAPE) {
                return None;
            }
            i += 1;
        }
        i += 1;
    }
    Some(out)
}

/// A mutable, segment-encoded key.
///
/// Keys are built by appending segments and compared by raw bytes.
///
/// # Example
///
/// ```rust
/// use canopy_storage::{Key, KeySegment};
///
/// let mut parent = Key::new();
/// parent.append_int(1).append_int(7);
///
/// let mut child = parent.clone();
/// child.append_int(2).append_str("x");
///
/// assert!(parent < child);
/// assert!(parent.is_prefix_of(&child));
/// assert_eq!(child.depth(), 4);
/// assert_eq!(child.decode_segment(3).unwrap(), KeySegment::Str("x".into()));
/// ```
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    bytes: Vec<u8>,
}

impl Key {
    /// Creates an empty key.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Wraps already-encoded key bytes without validating them.
    #[inline]
    #[must_use]
    pub fn from_encoded(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Returns the encoded bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns a frozen copy of the encoded bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bytes)
    }

    /// Returns the encoded length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the key has no bytes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Removes all segments.
    pub fn clear(&mut self) -> &mut Self {
        self.bytes.clear();
        self
    }

    /// Replaces this key's bytes with another key's.
    pub fn copy_from(&mut self, other: &Key) -> &mut Self {
        self.bytes.clear();
        self.bytes.extend_from_slice(&other.bytes);
        self
    }

    /// Replaces this key's bytes with raw encoded bytes.
    pub fn set_encoded(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Appends a null segment.
    pub fn append_null(&mut self) -> &mut Self {
        KeySegment::Null.encode_into(&mut self.bytes);
        self
    }

    /// Appends an integer segment.
    pub fn append_int(&mut self, value: i64) -> &mut Self {
        self.bytes.push(TAG_INT);
        escape_into(&((value as u64) ^ SIGN_BIT).to_be_bytes(), &mut self.bytes);
        self.bytes.push(TERMINATOR);
        self
    }

    /// Appends a string segment.
    pub fn append_str(&mut self, value: &str) -> &mut Self {
        self.bytes.push(TAG_STRING);
        escape_into(value.as_bytes(), &mut self.bytes);
        self.bytes.push(TERMINATOR);
        self
    }

    /// Appends a byte-string segment.
    pub fn append_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.bytes.push(TAG_BYTES);
        escape_into(value, &mut self.bytes);
        self.bytes.push(TERMINATOR);
        self
    }

    /// Appends a decoded segment.
    pub fn append_segment(&mut self, segment: &KeySegment) -> &mut Self {
        segment.encode_into(&mut self.bytes);
        self
    }

    /// Appends bytes that already hold one or more whole encoded segments.
    ///
    /// This is a raw copy; the bytes are not re-encoded.
    pub fn append_raw_segment(&mut self, encoded: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(encoded);
        self
    }

    /// Appends the edge that sorts before every child of the current key.
    pub fn append_before(&mut self) -> &mut Self {
        self.bytes.push(TAG_BEFORE);
        self
    }

    /// Appends the edge that sorts after every child of the current key.
    pub fn append_after(&mut self) -> &mut Self {
        self.bytes.push(TAG_AFTER);
        self
    }

    /// Byte ranges of each complete segment, in order.
    #[must_use]
    pub fn segment_ranges(&self) -> Vec<Range<usize>> {
        segment_ranges(&self.bytes)
    }

    /// Number of complete segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        segment_ranges(&self.bytes).len()
    }

    /// Byte range of the segment at `index`.
    #[must_use]
    pub fn segment_range(&self, index: usize) -> Option<Range<usize>> {
        segment_ranges(&self.bytes).into_iter().nth(index)
    }

    /// Encoded bytes of the segment at `index`.
    #[must_use]
    pub fn segment_bytes(&self, index: usize) -> Option<&[u8]> {
        self.segment_range(index).map(|r| &self.bytes[r])
    }

    /// Byte length of the first `depth` segments.
    #[must_use]
    pub fn prefix_len(&self, depth: usize) -> usize {
        if depth == 0 {
            return 0;
        }
        segment_ranges(&self.bytes)
            .get(depth - 1)
            .map_or(self.bytes.len(), |r| r.end)
    }

    /// Keeps only the first `depth` segments.
    pub fn truncate_depth(&mut self, depth: usize) -> &mut Self {
        let len = self.prefix_len(depth);
        self.bytes.truncate(len);
        self
    }

    /// Keeps only the first `len` bytes.
    pub fn truncate_bytes(&mut self, len: usize) -> &mut Self {
        self.bytes.truncate(len);
        self
    }

    /// Decodes the segment at `index`.
    pub fn decode_segment(&self, index: usize) -> StoreResult<KeySegment> {
        let range = self.segment_range(index).ok_or_else(|| {
            StoreError::invalid_key(&self.bytes, format!("no segment at depth {index}"))
        })?;
        KeySegment::decode(&self.bytes[range])
    }

    /// Decodes every segment.
    pub fn decode_all(&self) -> StoreResult<Vec<KeySegment>> {
        segment_ranges(&self.bytes)
            .into_iter()
            .map(|r| KeySegment::decode(&self.bytes[r]))
            .collect()
    }

    /// Index of the first byte at which the two keys differ.
    ///
    /// Equals the shorter length when one key is a byte prefix of the other.
    #[must_use]
    pub fn first_unique_byte_index(&self, other: &Key) -> usize {
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Returns true if this key's segments are a leading subsequence of
    /// `other`'s segments. A key is a prefix of itself.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Key) -> bool {
        is_segment_prefix(&self.bytes, &other.bytes)
    }

    /// Returns true if this key is a prefix of `other` and shorter than it.
    #[must_use]
    pub fn is_strict_prefix_of(&self, other: &Key) -> bool {
        self.bytes.len() < other.bytes.len() && self.is_prefix_of(other)
    }

    /// Byte-level successor of the last segment, used as an exclusive upper
    /// bound that admits every extension of the last segment's payload.
    ///
    /// The last payload byte that is not `0xFF` is incremented and the
    /// segment is cut and re-terminated right after it.
    pub fn successor_for_prefix(&self) -> StoreResult<Key> {
        let ranges = segment_ranges(&self.bytes);
        let last = ranges
            .last()
            .ok_or_else(|| StoreError::invalid_key(&self.bytes, "empty key has no successor"))?;

        // Skip the terminator, walk back through the payload to the tag.
        let mut i = last.end - 1;
        while i > last.start + 1 {
            i -= 1;
            if self.bytes[i] != ESCAPE {
                let mut bytes = self.bytes[..=i].to_vec();
                bytes[i] += 1;
                bytes.push(TERMINATOR);
                return Ok(Key { bytes });
            }
        }
        Err(StoreError::invalid_key(
            &self.bytes,
            "segment payload cannot be advanced",
        ))
    }

    /// Fails if the key exceeds the maximum key size.
    pub fn check_size(&self) -> StoreResult<()> {
        if self.bytes.len() > MAX_KEY_SIZE {
            return Err(StoreError::KeyTooLarge {
                size: self.bytes.len(),
                max: MAX_KEY_SIZE,
            });
        }
        Ok(())
    }
}

/// Byte ranges of each complete segment in `bytes`.
pub(crate) fn segment_ranges(bytes: &[u8]) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == TERMINATOR {
            if bytes.get(i + 1) == Some(&ESCAPE) {
                i += 2;
                continue;
            }
            ranges.push(start..i + 1);
            start = i + 1;
            i = start + 1;
            continue;
        }
        i += 1;
    }
    ranges
}

pub(crate) fn is_segment_prefix(prefix: &[u8], key: &[u8]) -> bool {
    // After a terminator the next byte is a tag, never the escape byte.
    key.starts_with(prefix) && key.get(prefix.len()) != Some(&ESCAPE)
}

impl AsRef<[u8]> for Key {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Bytes> for Key {
    fn from(bytes: Bytes) -> Self {
        Self::from_encoded(bytes.to_vec())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, range) in segment_ranges(&self.bytes).into_iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match KeySegment::decode(&self.bytes[range.clone()]) {
                Ok(segment) => write!(f, "{segment}")?,
                Err(_) => write!(f, "?")?,
            }
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}
