//! Position algebra for clustering space
//!
//! A [`Position`] names a point strictly before, at, or after a clustering
//! key, or one of the two partition-wide sentinels. Row entries may only sit
//! at `At` positions; dummy cache entries use the remaining positions to
//! carry continuity markers.
//!
//! ## Domains
//!
//! Positions live in one of two orderings:
//!
//! - **table domain**: the order the cache stores entries in. This is the
//!   natural `Ord` on [`Position`].
//! - **query domain**: the order the reader emits fragments in. Identical to
//!   the table domain for forward reads; inverted for reversed reads.
//!
//! [`Position::reversed`] converts between the two domains (it is its own
//! inverse), and [`PositionCmp`] compares positions inside a chosen domain.

use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;

/// Placement of a position relative to its clustering key
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Weight {
    /// Strictly before the key
    Before,
    /// At the key; the only weight a row entry may have
    At,
    /// Strictly after the key
    After,
}

impl Weight {
    /// Mirror the weight across the key, as domain reversal requires
    #[inline]
    pub fn flip(self) -> Weight {
        match self {
            Weight::Before => Weight::After,
            Weight::At => Weight::At,
            Weight::After => Weight::Before,
        }
    }
}

/// A clustering key prefix, ordered bytewise
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusteringKey(Bytes);

impl ClusteringKey {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Encode a signed integer so that byte order matches numeric order
    pub fn from_int(v: i64) -> Self {
        let biased = (v as u64) ^ (1 << 63);
        Self(Bytes::copy_from_slice(&biased.to_be_bytes()))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ClusteringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 8 {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&self.0);
            let v = (u64::from_be_bytes(buf) ^ (1 << 63)) as i64;
            return write!(f, "{}", v);
        }
        write!(f, "0x")?;
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// A point in clustering space
///
/// `key == None` encodes the partition sentinels: `(None, Before)` is
/// `before_all_clustered_rows` and `(None, After)` is
/// `after_all_clustered_rows`. The natural `Ord` is the table domain.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Position {
    key: Option<ClusteringKey>,
    weight: Weight,
}

impl Position {
    /// Lower partition sentinel
    pub fn before_all() -> Self {
        Self {
            key: None,
            weight: Weight::Before,
        }
    }

    /// Upper partition sentinel
    pub fn after_all() -> Self {
        Self {
            key: None,
            weight: Weight::After,
        }
    }

    /// Position strictly before `key`
    pub fn before_key(key: ClusteringKey) -> Self {
        Self {
            key: Some(key),
            weight: Weight::Before,
        }
    }

    /// Position of the row with `key`
    pub fn at_key(key: ClusteringKey) -> Self {
        Self {
            key: Some(key),
            weight: Weight::At,
        }
    }

    /// Position strictly after `key`
    pub fn after_key(key: ClusteringKey) -> Self {
        Self {
            key: Some(key),
            weight: Weight::After,
        }
    }

    /// The clustering key, if this is not a sentinel
    pub fn key(&self) -> Option<&ClusteringKey> {
        self.key.as_ref()
    }

    /// Placement relative to the key
    pub fn weight(&self) -> Weight {
        self.weight
    }

    /// True for the lower sentinel
    pub fn is_before_all(&self) -> bool {
        self.key.is_none() && self.weight == Weight::Before
    }

    /// True for the upper sentinel
    pub fn is_after_all(&self) -> bool {
        self.key.is_none() && self.weight == Weight::After
    }

    /// True when the position names a row, not a boundary
    pub fn is_clustering_row(&self) -> bool {
        self.key.is_some() && self.weight == Weight::At
    }

    /// Same key, `Before` weight; the lower sentinel stays the lower sentinel
    pub fn before(&self) -> Position {
        Position {
            key: self.key.clone(),
            weight: Weight::Before,
        }
    }

    /// Convert between the query and table domains
    ///
    /// Involutive: reversing twice yields the original position.
    pub fn reversed(&self) -> Position {
        Position {
            key: self.key.clone(),
            weight: self.weight.flip(),
        }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.key, &other.key) {
            (None, None) => self.weight.cmp(&other.weight),
            (None, Some(_)) => {
                if self.weight == Weight::Before {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (Some(_), None) => {
                if other.weight == Weight::Before {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (Some(a), Some(b)) => a.cmp(b).then(self.weight.cmp(&other.weight)),
        }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.key, self.weight) {
            (None, Weight::Before) => write!(f, "-inf"),
            (None, Weight::After) => write!(f, "+inf"),
            (None, Weight::At) => write!(f, "at(?)"),
            (Some(k), Weight::Before) => write!(f, "before({:?})", k),
            (Some(k), Weight::At) => write!(f, "at({:?})", k),
            (Some(k), Weight::After) => write!(f, "after({:?})", k),
        }
    }
}

/// Position comparator bound to a reading direction
///
/// For forward reads this is the natural table order. For reversed reads,
/// `cmp(a, b)` is the query order of two query-domain positions: keys compare
/// inverted and weights mirror, so `before(k)` still precedes `at(k)` which
/// still precedes `after(k)` within the same key.
#[derive(Clone, Copy, Debug)]
pub struct PositionCmp {
    reversed: bool,
}

impl PositionCmp {
    /// Comparator for the given direction
    pub fn new(reversed: bool) -> Self {
        Self { reversed }
    }

    /// Compare two positions in this comparator's domain
    pub fn cmp(&self, a: &Position, b: &Position) -> Ordering {
        if !self.reversed {
            a.cmp(b)
        } else {
            b.reversed().cmp(&a.reversed())
        }
    }

    #[inline]
    pub fn lt(&self, a: &Position, b: &Position) -> bool {
        self.cmp(a, b) == Ordering::Less
    }

    #[inline]
    pub fn le(&self, a: &Position, b: &Position) -> bool {
        self.cmp(a, b) != Ordering::Greater
    }

    #[inline]
    pub fn ge(&self, a: &Position, b: &Position) -> bool {
        self.cmp(a, b) != Ordering::Less
    }

    #[inline]
    pub fn eq(&self, a: &Position, b: &Position) -> bool {
        self.cmp(a, b) == Ordering::Equal
    }
}

/// True when no clustering-row position can lie strictly between `a` and `b`
///
/// Both positions are in the same (query) domain and `a <= b` is assumed.
/// Only decidable when both positions share a key: a row can sneak between
/// them exactly when they straddle the `At` weight.
pub fn no_row_between(a: &Position, b: &Position) -> bool {
    match (a.key(), b.key()) {
        (Some(ka), Some(kb)) if ka == kb => {
            !(a.weight() == Weight::Before && b.weight() == Weight::After)
        }
        _ => false,
    }
}

/// One bound of a clustering range
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeBound {
    pub key: ClusteringKey,
    pub inclusive: bool,
}

impl RangeBound {
    /// Inclusive bound at `key`
    pub fn inclusive(key: ClusteringKey) -> Self {
        Self {
            key,
            inclusive: true,
        }
    }

    /// Exclusive bound at `key`
    pub fn exclusive(key: ClusteringKey) -> Self {
        Self {
            key,
            inclusive: false,
        }
    }
}

/// A clustering range restricting a read, expressed in query order
///
/// `start` precedes `end` in the query domain; for reversed reads the caller
/// supplies ranges whose `start` is the greater clustering key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowRange {
    pub start: Option<RangeBound>,
    pub end: Option<RangeBound>,
}

impl RowRange {
    /// The unrestricted range
    pub fn full() -> Self {
        Self::default()
    }

    /// Closed range `[a, b]` in query order
    pub fn inclusive(a: ClusteringKey, b: ClusteringKey) -> Self {
        Self {
            start: Some(RangeBound::inclusive(a)),
            end: Some(RangeBound::inclusive(b)),
        }
    }

    /// Range matching exactly one clustering key
    pub fn singular(key: ClusteringKey) -> Self {
        Self::inclusive(key.clone(), key)
    }

    /// True when the range matches exactly one clustering key
    pub fn is_singular(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) => s.inclusive && e.inclusive && s.key == e.key,
            _ => false,
        }
    }

    /// True when the range has an explicit lower bound
    pub fn has_start(&self) -> bool {
        self.start.is_some()
    }

    /// Query-domain position the range starts at
    pub fn start_position(&self) -> Position {
        match &self.start {
            Some(b) if b.inclusive => Position::before_key(b.key.clone()),
            Some(b) => Position::after_key(b.key.clone()),
            None => Position::before_all(),
        }
    }

    /// Query-domain position the range ends at
    pub fn end_position(&self) -> Position {
        match &self.end {
            Some(b) if b.inclusive => Position::after_key(b.key.clone()),
            Some(b) => Position::before_key(b.key.clone()),
            None => Position::after_all(),
        }
    }
}

/// Half-open query-domain window `[start, end)` handed to the underlying
/// source when fast-forwarding
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionRange {
    pub start: Position,
    pub end: Position,
}

impl PositionRange {
    /// Create a window
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// True when `pos` falls inside the window under `cmp`
    pub fn contains(&self, pos: &Position, cmp: PositionCmp) -> bool {
        cmp.le(&self.start, pos) && cmp.lt(pos, &self.end)
    }
}
