//! Structural key filters.
//!
//! A [`KeyFilter`] describes which keys a traversal may stop on: a term per
//! segment depth plus a minimum and maximum key depth. When a key fails, the
//! filter computes where the next candidate can possibly be, so traversal
//! jumps over whole subtrees instead of visiting every key in them.
//!
//! ```text
//!  terms:   [ =1 ]  [ 10..=20 ]  [ =2 ]  [ * ]
//!  depth:     0         1          2      3        min 2, max 4
//!
//!  {1,15}          selected (depth 2)
//!  {1,15,2,"x"}    selected (depth 4)
//!  {1,25}          segment 1 above range: skip past {1,...}
//!  {1,15,3}        segment 2 mismatch: skip past {1,15,3,...}
//! ```

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

use crate::database::Seek;
use crate::exchange::Direction;
use crate::key::{segment_ranges, Key, KeySegment, ESCAPE};

/// One bound of a range term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermBound {
    /// Encoded segment bytes the bound compares against.
    pub segment: Bytes,
    /// Whether a segment equal to the bound is admitted.
    pub inclusive: bool,
}

impl TermBound {
    /// Creates an inclusive bound.
    #[must_use]
    pub fn inclusive(segment: impl Into<Bytes>) -> Self {
        Self {
            segment: segment.into(),
            inclusive: true,
        }
    }

    /// Creates an exclusive bound.
    #[must_use]
    pub fn exclusive(segment: impl Into<Bytes>) -> Self {
        Self {
            segment: segment.into(),
            inclusive: false,
        }
    }
}

/// Condition applied to one key segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Any segment.
    All,
    /// Exactly this encoded segment.
    Exact(Bytes),
    /// Between two optional bounds.
    Range {
        /// Lower bound, or unbounded.
        low: Option<TermBound>,
        /// Upper bound, or unbounded.
        high: Option<TermBound>,
    },
}

/// Where a segment falls relative to a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Below,
    Within,
    Above,
}

impl Term {
    /// Creates a term matching exactly one value.
    #[must_use]
    pub fn exact(segment: &KeySegment) -> Self {
        Self::Exact(Bytes::from(segment.encode()))
    }

    /// Creates a term matching one integer, such as an ordinal.
    #[must_use]
    pub fn exact_int(value: i64) -> Self {
        Self::exact(&KeySegment::Int(value))
    }

    /// Creates a range term over encoded bounds.
    #[must_use]
    pub fn range(low: Option<TermBound>, high: Option<TermBound>) -> Self {
        match (&low, &high) {
            (None, None) => Self::All,
            (Some(l), Some(h)) if l.inclusive && h.inclusive && l.segment == h.segment => {
                Self::Exact(l.segment.clone())
            }
            _ => Self::Range { low, high },
        }
    }

    fn low(&self) -> Option<(&[u8], bool)> {
        match self {
            Self::All => None,
            Self::Exact(segment) => Some((segment, true)),
            Self::Range { low, .. } => low.as_ref().map(|b| (&b.segment[..], b.inclusive)),
        }
    }

    fn high(&self) -> Option<(&[u8], bool)> {
        match self {
            Self::All => None,
            Self::Exact(segment) => Some((segment, true)),
            Self::Range { high, .. } => high.as_ref().map(|b| (&b.segment[..], b.inclusive)),
        }
    }

    fn place(&self, segment: &[u8]) -> Placement {
        if let Some((low, inclusive)) = self.low() {
            match segment.cmp(low) {
                Ordering::Less => return Placement::Below,
                Ordering::Equal if !inclusive => return Placement::Below,
                _ => {}
            }
        }
        if let Some((high, inclusive)) = self.high() {
            match segment.cmp(high) {
                Ordering::Greater => return Placement::Above,
                Ordering::Equal if !inclusive => return Placement::Above,
                _ => {}
            }
        }
        Placement::Within
    }

    /// Returns true if the encoded segment satisfies this term.
    #[must_use]
    pub fn selects(&self, segment: &[u8]) -> bool {
        self.place(segment) == Placement::Within
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render(bytes: &[u8]) -> String {
            KeySegment::decode(bytes).map_or_else(|_| "?".to_string(), |s| s.to_string())
        }
        match self {
            Self::All => write!(f, "*"),
            Self::Exact(segment) => write!(f, "{}", render(segment)),
            Self::Range { low, high } => {
                match low {
                    Some(b) => write!(f, "{}{}", if b.inclusive { "[" } else { "(" }, render(&b.segment))?,
                    None => write!(f, "(")?,
                }
                write!(f, ":")?;
                match high {
                    Some(b) => write!(f, "{}{}", render(&b.segment), if b.inclusive { "]" } else { ")" }),
                    None => write!(f, ")"),
                }
            }
        }
    }
}

/// Result of checking a key against a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FilterCheck {
    /// The key is selected.
    Selected,
    /// The key is rejected; continue strictly past it.
    Step,
    /// The key is rejected; the next candidate is at this seek position.
    Jump(Seek),
    /// No key further in this direction can be selected.
    Exhausted,
}

/// Per-depth structural filter over segment-encoded keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilter {
    terms: Vec<Term>,
    min_depth: usize,
    max_depth: usize,
}

impl KeyFilter {
    /// Creates a filter requiring exactly as many segments as there are terms.
    #[must_use]
    pub fn new(terms: Vec<Term>) -> Self {
        let depth = terms.len();
        Self {
            terms,
            min_depth: depth,
            max_depth: depth,
        }
    }

    /// Creates a filter with explicit depth limits.
    #[must_use]
    pub fn with_depths(terms: Vec<Term>, min_depth: usize, max_depth: usize) -> Self {
        Self {
            terms,
            min_depth,
            max_depth,
        }
    }

    /// The per-depth terms.
    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Minimum selected key depth.
    #[must_use]
    pub fn min_depth(&self) -> usize {
        self.min_depth
    }

    /// Maximum selected key depth.
    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Returns true if the key is selected.
    #[must_use]
    pub fn selects(&self, key: &Key) -> bool {
        matches!(self.check(key.as_bytes(), true), FilterCheck::Selected)
    }

    /// Checks a stored key and, when it is rejected, computes the next
    /// position worth seeking to in the traversal direction.
    pub(crate) fn check(&self, key: &[u8], forward: bool) -> FilterCheck {
        let ranges = segment_ranges(key);
        let depth = ranges.len();

        for (i, range) in ranges.iter().enumerate().take(self.terms.len()) {
            let term = &self.terms[i];
            let prefix = &key[..range.start];
            match (term.place(&key[range.clone()]), forward) {
                (Placement::Within, _) => {}
                (Placement::Below, true) => {
                    let (low, inclusive) = term.low().unwrap_or_default();
                    let mut target = prefix.to_vec();
                    target.extend_from_slice(low);
                    if inclusive {
                        return FilterCheck::Jump(Seek::new(target, Direction::GtEq));
                    }
                    target.push(ESCAPE);
                    return FilterCheck::Jump(Seek::new(target, Direction::Gt));
                }
                (Placement::Above, true) => {
                    if i == 0 {
                        return FilterCheck::Exhausted;
                    }
                    return FilterCheck::Jump(past_subtree(prefix));
                }
                (Placement::Above, false) => {
                    let (high, inclusive) = term.high().unwrap_or_default();
                    let mut target = prefix.to_vec();
                    target.extend_from_slice(high);
                    if inclusive {
                        target.push(ESCAPE);
                    }
                    return FilterCheck::Jump(Seek::new(target, Direction::Lt));
                }
                (Placement::Below, false) => {
                    if i == 0 {
                        return FilterCheck::Exhausted;
                    }
                    return FilterCheck::Jump(Seek::new(prefix.to_vec(), Direction::LtEq));
                }
            }
        }

        if depth > self.max_depth {
            let prefix = &key[..ranges[self.max_depth].start];
            if forward {
                return FilterCheck::Jump(past_subtree(prefix));
            }
            return FilterCheck::Jump(Seek::new(prefix.to_vec(), Direction::LtEq));
        }
        if depth < self.min_depth {
            return FilterCheck::Step;
        }
        FilterCheck::Selected
    }
}

/// Seek position just after every key beginning with `prefix`.
fn past_subtree(prefix: &[u8]) -> Seek {
    let mut target = prefix.to_vec();
    target.push(ESCAPE);
    Seek::new(target, Direction::Gt)
}

impl fmt::Display for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{term}")?;
        }
        write!(f, "}} depth {}..", self.min_depth)?;
        if self.max_depth == usize::MAX {
            write!(f, "*")
        } else {
            write!(f, "{}", self.max_depth)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Bytes {
        Bytes::from(KeySegment::Int(v).encode())
    }

    fn key(values: &[i64]) -> Key {
        let mut key = Key::new();
        for v in values {
            key.append_int(*v);
        }
        key
    }

    #[test]
    fn test_exact_and_range_selection() {
        let filter = KeyFilter::with_depths(
            vec![
                Term::exact_int(1),
                Term::range(
                    Some(TermBound::inclusive(int(10))),
                    Some(TermBound::exclusive(int(20))),
                ),
            ],
            2,
            4,
        );

        assert!(filter.selects(&key(&[1, 10])));
        assert!(filter.selects(&key(&[1, 19, 5])));
        assert!(!filter.selects(&key(&[1, 20])));
        assert!(!filter.selects(&key(&[2, 15])));
        assert!(!filter.selects(&key(&[1])));
        assert!(!filter.selects(&key(&[1, 15, 1, 1, 1])));
    }

    #[test]
    fn test_range_collapses_to_exact() {
        let term = Term::range(
            Some(TermBound::inclusive(int(3))),
            Some(TermBound::inclusive(int(3))),
        );
        assert_eq!(term, Term::exact_int(3));
        assert_eq!(Term::range(None, None), Term::All);
    }

    #[test]
    fn test_forward_jump_below_low() {
        let filter = KeyFilter::new(vec![
            Term::All,
            Term::range(Some(TermBound::inclusive(int(10))), None),
        ]);
        let k = key(&[1, 5]);
        match filter.check(k.as_bytes(), true) {
            FilterCheck::Jump(seek) => {
                assert_eq!(seek.direction(), Direction::GtEq);
                assert_eq!(seek.key(), key(&[1, 10]).as_bytes());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_forward_jump_above_high_skips_parent_subtree() {
        let filter = KeyFilter::new(vec![
            Term::All,
            Term::range(None, Some(TermBound::inclusive(int(10)))),
        ]);
        let k = key(&[1, 11]);
        match filter.check(k.as_bytes(), true) {
            FilterCheck::Jump(seek) => {
                assert_eq!(seek.direction(), Direction::Gt);
                assert!(seek.key() > key(&[1, i64::MAX, 9]).as_bytes());
                assert!(seek.key() < key(&[2]).as_bytes());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_first_segment_out_of_range_exhausts() {
        let filter = KeyFilter::new(vec![Term::exact_int(3)]);
        assert_eq!(filter.check(key(&[4]).as_bytes(), true), FilterCheck::Exhausted);
        assert_eq!(filter.check(key(&[2]).as_bytes(), false), FilterCheck::Exhausted);
    }

    #[test]
    fn test_backward_jump_above_high() {
        let filter = KeyFilter::with_depths(
            vec![
                Term::exact_int(1),
                Term::range(None, Some(TermBound::inclusive(int(10)))),
            ],
            2,
            usize::MAX,
        );
        match filter.check(key(&[1, 30]).as_bytes(), false) {
            FilterCheck::Jump(seek) => {
                assert_eq!(seek.direction(), Direction::Lt);
                assert!(seek.key() > key(&[1, 10, i64::MAX]).as_bytes());
                assert!(seek.key() < key(&[1, 11]).as_bytes());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_too_deep_jumps_to_ancestor_when_backward() {
        let filter = KeyFilter::new(vec![Term::All, Term::All]);
        match filter.check(key(&[1, 2, 3]).as_bytes(), false) {
            FilterCheck::Jump(seek) => {
                assert_eq!(seek.direction(), Direction::LtEq);
                assert_eq!(seek.key(), key(&[1, 2]).as_bytes());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(filter.check(key(&[1]).as_bytes(), true), FilterCheck::Step);
    }

    #[test]
    fn test_display() {
        let filter = KeyFilter::with_depths(
            vec![
                Term::exact_int(1),
                Term::range(Some(TermBound::exclusive(int(2))), None),
            ],
            2,
            usize::MAX,
        );
        assert_eq!(filter.to_string(), "{1,(2:)} depth 2..*");
    }
}
