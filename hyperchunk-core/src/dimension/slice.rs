//! Dimension slices - the per-dimension extent of a chunk

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open coordinate range `[range_start, range_end)` on one dimension.
///
/// Time slices are aligned intervals; a space slice for partition index `i`
/// is the unit range `[i, i + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DimensionSlice {
    pub range_start: i64,
    pub range_end: i64,
}

impl DimensionSlice {
    /// Lowest coordinate a slice can start at
    pub const MIN_VALUE: i64 = i64::MIN;
    /// Exclusive upper bound of every slice
    pub const MAX_VALUE: i64 = i64::MAX;

    pub fn new(range_start: i64, range_end: i64) -> Self {
        Self { range_start, range_end }
    }

    /// Slice holding exactly one space partition
    pub fn unit(index: i64) -> Self {
        Self::new(index, index.saturating_add(1))
    }

    /// Slice covering the whole domain of a dimension
    pub fn full() -> Self {
        Self::new(Self::MIN_VALUE, Self::MAX_VALUE)
    }

    pub fn contains(&self, coordinate: i64) -> bool {
        coordinate >= self.range_start && coordinate < self.range_end
    }

    pub fn overlaps(&self, other: &DimensionSlice) -> bool {
        self.range_start < other.range_end && other.range_start < self.range_end
    }

    pub fn is_unit(&self) -> bool {
        self.range_end.checked_sub(self.range_start) == Some(1)
    }

    pub fn is_empty(&self) -> bool {
        self.range_start >= self.range_end
    }

    /// Shrink this slice so it no longer overlaps `other`, keeping `coordinate`.
    ///
    /// Returns false when `other` contains the coordinate, in which case the
    /// two slices cannot be separated on this dimension.
    pub fn cut(&mut self, other: &DimensionSlice, coordinate: i64) -> bool {
        if other.contains(coordinate) {
            return false;
        }
        if other.range_start > coordinate {
            self.range_end = self.range_end.min(other.range_start);
        } else {
            self.range_start = self.range_start.max(other.range_end);
        }
        true
    }
}

impl fmt::Display for DimensionSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.range_start, self.range_end)
    }
}
