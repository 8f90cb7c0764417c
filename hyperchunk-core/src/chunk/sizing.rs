//! Chunk sizing
//!
//! The width of a new chunk's time slice comes from a target-size
//! estimator. The default estimator returns the interval configured on the
//! time dimension; adaptive estimators plug in through the same trait.

use crate::dimension::{Dimension, DimensionKind};
use crate::hypertable::HypertableRecord;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Width to use when slicing a dimension for a new chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeHint {
    pub interval_length: i64,
}

impl SizeHint {
    pub fn new(interval_length: i64) -> Self {
        Self { interval_length }
    }
}

/// Source of slice widths for new chunks
pub trait TargetSizeEstimator: Send + Sync {
    /// Estimate the slice width for `dimension` of `hypertable`
    fn estimate_target_width(
        &self,
        hypertable: &HypertableRecord,
        dimension: &Dimension,
    ) -> Result<SizeHint>;
}

/// Uses the interval stored on the dimension
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredInterval;

impl TargetSizeEstimator for ConfiguredInterval {
    fn estimate_target_width(
        &self,
        _hypertable: &HypertableRecord,
        dimension: &Dimension,
    ) -> Result<SizeHint> {
        let width = match dimension.kind {
            DimensionKind::Time { interval_length } => interval_length,
            // Space slices are always one partition wide
            DimensionKind::Space { .. } => 1,
        };
        Ok(SizeHint::new(width))
    }
}
