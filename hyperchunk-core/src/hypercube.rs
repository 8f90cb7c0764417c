//! Hypercube - the region of the hyperspace a chunk covers

use crate::chunk::SizeHint;
use crate::dimension::{DimensionSlice, Hyperspace, Point};
use crate::{HyperError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One slice per dimension, in hyperspace order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hypercube {
    pub slices: Vec<DimensionSlice>,
}

impl Hypercube {
    pub fn new(slices: Vec<DimensionSlice>) -> Self {
        Self { slices }
    }

    /// Compute the aligned hypercube that would hold `point`.
    ///
    /// `hints` carries one size hint per dimension; space dimensions ignore
    /// theirs.
    pub fn from_point(space: &Hyperspace, point: &Point, hints: &[SizeHint]) -> Result<Self> {
        if point.len() != space.num_dimensions() || hints.len() != space.num_dimensions() {
            return Err(HyperError::Validation(format!(
                "point {} has {} coordinates, hyperspace has {} dimensions",
                point,
                point.len(),
                space.num_dimensions()
            )));
        }
        let slices = space
            .iter()
            .zip(point.coordinates.iter())
            .zip(hints.iter())
            .map(|((dim, &coordinate), hint)| dim.slice_for_value(coordinate, hint))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slices })
    }

    pub fn num_slices(&self) -> usize {
        self.slices.len()
    }

    pub fn slice(&self, index: usize) -> Option<&DimensionSlice> {
        self.slices.get(index)
    }

    /// True when every dimension's slice contains the point's coordinate
    pub fn contains(&self, point: &Point) -> bool {
        self.slices.len() == point.len()
            && self
                .slices
                .iter()
                .zip(point.coordinates.iter())
                .all(|(slice, &c)| slice.contains(c))
    }

    /// True when the two cubes share at least one point
    pub fn collides(&self, other: &Hypercube) -> bool {
        self.slices.len() == other.slices.len()
            && self
                .slices
                .iter()
                .zip(other.slices.iter())
                .all(|(a, b)| a.overlaps(b))
    }

    /// Extend with the all-covering slice of a newly added dimension
    pub fn push_full_slice(&mut self) {
        self.slices.push(DimensionSlice::full());
    }

    /// Shrink this cube until it no longer collides with `other`.
    ///
    /// `point` must lie in this cube and outside `other`. The cut happens
    /// on the first dimension where `other` does not contain the point, so
    /// the point stays inside the result.
    pub fn cut(&mut self, other: &Hypercube, point: &Point) -> bool {
        if !self.collides(other) {
            return true;
        }
        for (i, slice) in self.slices.iter_mut().enumerate() {
            let (Some(theirs), Some(coordinate)) = (other.slices.get(i), point.coordinate(i)) else {
                return false;
            };
            if slice.cut(theirs, coordinate) {
                return !slice.is_empty();
            }
        }
        false
    }
}

impl fmt::Display for Hypercube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, slice) in self.slices.iter().enumerate() {
            if i > 0 {
                write!(f, " x ")?;
            }
            write!(f, "{}", slice)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionSpec;

    fn cube(slices: &[(i64, i64)]) -> Hypercube {
        Hypercube::new(slices.iter().map(|&(s, e)| DimensionSlice::new(s, e)).collect())
    }

    #[test]
    fn test_from_point() {
        let space = Hyperspace::new(vec![
            DimensionSpec::time("time", 100),
            DimensionSpec::space("device", 4),
        ])
        .unwrap();
        let hints = [SizeHint { interval_length: 100 }, SizeHint { interval_length: 100 }];

        let point = Point::new(vec![250, 2]);
        let cube = Hypercube::from_point(&space, &point, &hints).unwrap();
        assert_eq!(cube.slices, vec![DimensionSlice::new(200, 300), DimensionSlice::unit(2)]);
        assert!(cube.contains(&point));

        let short = Point::new(vec![250]);
        assert!(Hypercube::from_point(&space, &short, &hints).is_err());
    }

    #[test]
    fn test_contains_and_collides() {
        let a = cube(&[(0, 100), (0, 1)]);
        let b = cube(&[(50, 150), (0, 1)]);
        let c = cube(&[(50, 150), (1, 2)]);

        assert!(a.contains(&Point::new(vec![99, 0])));
        assert!(!a.contains(&Point::new(vec![100, 0])));
        assert!(!a.contains(&Point::new(vec![50])));

        assert!(a.collides(&b));
        // Different space partition
        assert!(!a.collides(&c));
    }

    #[test]
    fn test_cut_separates_on_time() {
        let existing = cube(&[(0, 100), (i64::MIN, i64::MAX)]);
        let mut candidate = cube(&[(0, 200), (1, 2)]);
        let point = Point::new(vec![150, 1]);

        assert!(candidate.cut(&existing, &point));
        assert_eq!(candidate, cube(&[(100, 200), (1, 2)]));
        assert!(!candidate.collides(&existing));
        assert!(candidate.contains(&point));
    }

    #[test]
    fn test_push_full_slice() {
        let mut c = cube(&[(0, 100)]);
        c.push_full_slice();
        assert!(c.contains(&Point::new(vec![5, 12345])));
        assert!(c.contains(&Point::new(vec![5, -7])));
    }
}
