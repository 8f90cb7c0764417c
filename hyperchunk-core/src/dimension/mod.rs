//! Dimension model
//!
//! A hypertable is partitioned along an ordered list of dimensions (its
//! hyperspace): exactly one open `time` dimension followed by zero or more
//! closed, hash-partitioned `space` dimensions. Each dimension turns a row's
//! column value into a coordinate and a coordinate into the slice a new chunk
//! would cover.

mod slice;

pub use slice::DimensionSlice;

use crate::chunk::SizeHint;
use crate::{DimensionId, HyperError, Result, Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Partitioning behaviour of a dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    /// Open dimension sliced into fixed-width intervals
    Time { interval_length: i64 },
    /// Closed dimension with a fixed number of hash partitions
    Space { num_slices: u16 },
}

impl DimensionKind {
    pub fn is_time(&self) -> bool {
        matches!(self, DimensionKind::Time { .. })
    }
}

/// Requested dimension, before it is attached to a hypertable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub column: String,
    pub kind: DimensionKind,
}

impl DimensionSpec {
    pub fn time(column: impl Into<String>, interval_length: i64) -> Self {
        Self {
            column: column.into(),
            kind: DimensionKind::Time { interval_length },
        }
    }

    pub fn space(column: impl Into<String>, num_slices: u16) -> Self {
        Self {
            column: column.into(),
            kind: DimensionKind::Space { num_slices },
        }
    }

    /// Check column name and partitioning parameters
    pub fn validate(&self) -> Result<()> {
        if self.column.trim().is_empty() {
            return Err(HyperError::Validation("dimension column name is empty".into()));
        }
        match self.kind {
            DimensionKind::Time { interval_length } if interval_length <= 0 => {
                Err(HyperError::Validation(format!(
                    "invalid interval {} for time dimension \"{}\": must be positive",
                    interval_length, self.column
                )))
            }
            DimensionKind::Space { num_slices }
                if num_slices == 0 || num_slices as i64 > i16::MAX as i64 =>
            {
                Err(HyperError::Validation(format!(
                    "invalid number of partitions {} for space dimension \"{}\": must be between 1 and {}",
                    num_slices,
                    self.column,
                    i16::MAX
                )))
            }
            _ => Ok(()),
        }
    }
}

/// A partitioning dimension attached to a hypertable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub id: DimensionId,
    pub column: String,
    pub kind: DimensionKind,
}

impl Dimension {
    pub fn from_spec(id: DimensionId, spec: DimensionSpec) -> Self {
        Self {
            id,
            column: spec.column,
            kind: spec.kind,
        }
    }

    pub fn is_time(&self) -> bool {
        self.kind.is_time()
    }

    /// Configured interval of a time dimension
    pub fn interval_length(&self) -> Option<i64> {
        match self.kind {
            DimensionKind::Time { interval_length } => Some(interval_length),
            DimensionKind::Space { .. } => None,
        }
    }

    /// Convert the row's value for this dimension into a coordinate
    pub fn extract(&self, row: &Row) -> Result<i64> {
        let value = row.get(&self.column).unwrap_or(&Value::Null);
        match self.kind {
            DimensionKind::Time { .. } => {
                if value.is_null() {
                    return Err(HyperError::Validation(format!(
                        "NULL value in time column \"{}\"",
                        self.column
                    )));
                }
                let coordinate = value.as_time().ok_or_else(|| {
                    HyperError::Validation(format!(
                        "value {:?} of column \"{}\" cannot be used as time",
                        value, self.column
                    ))
                })?;
                if coordinate == DimensionSlice::MAX_VALUE {
                    return Err(HyperError::Validation(format!(
                        "time value of column \"{}\" is out of range",
                        self.column
                    )));
                }
                Ok(coordinate)
            }
            DimensionKind::Space { num_slices } => Ok(partition_index(value, num_slices)),
        }
    }

    /// Compute the slice a new chunk holding `coordinate` covers on this dimension.
    ///
    /// Time slices snap to a grid of `hint.interval_length`-wide intervals
    /// anchored at zero; space slices are the unit range of the partition.
    pub fn slice_for_value(&self, coordinate: i64, hint: &SizeHint) -> Result<DimensionSlice> {
        match self.kind {
            DimensionKind::Time { .. } => {
                // No half-open slice can hold the exclusive upper bound
                if coordinate == DimensionSlice::MAX_VALUE {
                    return Err(HyperError::Validation(format!(
                        "time coordinate {} of dimension \"{}\" is out of range",
                        coordinate, self.column
                    )));
                }
                let width = hint.interval_length;
                if width <= 0 {
                    return Err(HyperError::Validation(format!(
                        "chunk interval {} for dimension \"{}\" must be positive",
                        width, self.column
                    )));
                }
                let range_start = coordinate
                    .div_euclid(width)
                    .checked_mul(width)
                    .unwrap_or(DimensionSlice::MIN_VALUE);
                let range_end = range_start.saturating_add(width);
                Ok(DimensionSlice::new(range_start, range_end))
            }
            DimensionKind::Space { num_slices } => {
                if coordinate < 0 || coordinate >= num_slices as i64 {
                    return Err(HyperError::Validation(format!(
                        "partition {} out of range for dimension \"{}\" with {} partitions",
                        coordinate, self.column, num_slices
                    )));
                }
                Ok(DimensionSlice::unit(coordinate))
            }
        }
    }

    pub fn contains(&self, slice: &DimensionSlice, coordinate: i64) -> bool {
        slice.contains(coordinate)
    }
}

/// Hash a value into one of `num_slices` partitions
pub fn partition_index(value: &Value, num_slices: u16) -> i64 {
    let hash = crc32fast::hash(&value.canonical_bytes());
    (hash % num_slices.max(1) as u32) as i64
}

/// Ordered dimensions of a hypertable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hyperspace {
    pub dimensions: Vec<Dimension>,
}

impl Hyperspace {
    /// Build and validate a hyperspace from dimension specs
    pub fn new(specs: Vec<DimensionSpec>) -> Result<Self> {
        let Some(first) = specs.first() else {
            return Err(HyperError::Validation(
                "a hypertable needs at least one dimension".into(),
            ));
        };
        if !first.kind.is_time() {
            return Err(HyperError::Validation(
                "the first dimension must be a time dimension".into(),
            ));
        }

        let mut space = Self { dimensions: Vec::with_capacity(specs.len()) };
        let mut specs = specs.into_iter();
        if let Some(time) = specs.next() {
            time.validate()?;
            space.dimensions.push(Dimension::from_spec(DimensionId(1), time));
        }
        for spec in specs {
            space.add(spec)?;
        }
        Ok(space)
    }

    /// Append a space dimension, returning the attached dimension
    pub fn add(&mut self, spec: DimensionSpec) -> Result<&Dimension> {
        spec.validate()?;
        if spec.kind.is_time() {
            return Err(HyperError::Validation(format!(
                "cannot add time dimension \"{}\": a hypertable has exactly one time dimension",
                spec.column
            )));
        }
        if self.dimension_by_column(&spec.column).is_some() {
            return Err(HyperError::Validation(format!(
                "column \"{}\" is already a dimension",
                spec.column
            )));
        }
        let id = DimensionId(self.dimensions.len() as u32 + 1);
        self.dimensions.push(Dimension::from_spec(id, spec));
        Ok(&self.dimensions[self.dimensions.len() - 1])
    }

    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }

    pub fn time_dimension(&self) -> &Dimension {
        // Construction guarantees a leading time dimension
        &self.dimensions[0]
    }

    pub fn time_dimension_mut(&mut self) -> &mut Dimension {
        &mut self.dimensions[0]
    }

    pub fn dimension_by_column(&self, column: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.column == column)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter()
    }

    /// Compute a row's coordinates in dimension order
    pub fn compute_point(&self, row: &Row) -> Result<Point> {
        let coordinates = self
            .dimensions
            .iter()
            .map(|d| d.extract(row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Point::new(coordinates))
    }

    /// Columns are unique by construction; recheck after deserialization
    pub fn check_columns_unique(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for dim in &self.dimensions {
            if !seen.insert(dim.column.as_str()) {
                return Err(HyperError::Corruption(format!(
                    "duplicate dimension column \"{}\"",
                    dim.column
                )));
            }
        }
        Ok(())
    }
}

/// A row's coordinates, one per dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub coordinates: Vec<i64>,
}

impl Point {
    pub fn new(coordinates: Vec<i64>) -> Self {
        Self { coordinates }
    }

    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    pub fn coordinate(&self, index: usize) -> Option<i64> {
        self.coordinates.get(index).copied()
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.coordinates.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, ")")
    }
}
