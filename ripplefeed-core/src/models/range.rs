//! Key ranges and shard regions

use serde::{Deserialize, Serialize};
use std::ops::Bound;

use super::datum::Datum;

/// A range of datums with independently bounded ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumRange {
    pub left: Bound<Datum>,
    pub right: Bound<Datum>,
}

impl DatumRange {
    #[must_use]
    pub const fn new(left: Bound<Datum>, right: Bound<Datum>) -> Self {
        Self { left, right }
    }

    /// The range containing every datum
    #[must_use]
    pub const fn universe() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// `[left, right)`
    #[must_use]
    pub const fn half_open(left: Datum, right: Datum) -> Self {
        Self::new(Bound::Included(left), Bound::Excluded(right))
    }

    /// `[left, right]`
    #[must_use]
    pub const fn closed(left: Datum, right: Datum) -> Self {
        Self::new(Bound::Included(left), Bound::Included(right))
    }

    /// `[key, key]`
    #[must_use]
    pub fn point(key: Datum) -> Self {
        Self::closed(key.clone(), key)
    }

    #[must_use]
    pub fn is_universe(&self) -> bool {
        matches!((&self.left, &self.right), (Bound::Unbounded, Bound::Unbounded))
    }

    #[must_use]
    pub fn contains(&self, key: &Datum) -> bool {
        let above_left = match &self.left {
            Bound::Unbounded => true,
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
        };
        let below_right = match &self.right {
            Bound::Unbounded => true,
            Bound::Included(r) => key <= r,
            Bound::Excluded(r) => key < r,
        };
        above_left && below_right
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !lower_meets_upper(&self.left, &self.right)
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        lower_meets_upper(&self.left, &other.right) && lower_meets_upper(&other.left, &self.right)
    }
}

impl Default for DatumRange {
    fn default() -> Self {
        Self::universe()
    }
}

/// Whether some datum can lie at or above `lower` and at or below `upper`.
fn lower_meets_upper(lower: &Bound<Datum>, upper: &Bound<Datum>) -> bool {
    match (lower, upper) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        (Bound::Included(l), Bound::Included(u)) => l <= u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u)) => l < u,
    }
}

/// Region of the primary-key space, used to route changes to shards and to
/// match changes against subscriber interest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Region(DatumRange);

impl Region {
    #[must_use]
    pub const fn new(range: DatumRange) -> Self {
        Self(range)
    }

    #[must_use]
    pub const fn universe() -> Self {
        Self(DatumRange::universe())
    }

    #[must_use]
    pub fn point(key: Datum) -> Self {
        Self(DatumRange::point(key))
    }

    #[must_use]
    pub const fn range(&self) -> &DatumRange {
        &self.0
    }

    #[must_use]
    pub fn contains(&self, key: &Datum) -> bool {
        self.0.contains(key)
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.0.intersects(&other.0)
    }
}

impl From<DatumRange> for Region {
    fn from(range: DatumRange) -> Self {
        Self(range)
    }
}
