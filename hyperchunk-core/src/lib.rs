//! HyperChunk Core - Chunk Partitioning Engine for Hypertables
//!
//! A hypertable is a logical table whose rows are spread over many physical
//! chunks. Each chunk covers a hypercube in the hypertable's hyperspace:
//! one time dimension sliced into fixed intervals plus optional hashed
//! space dimensions.
//!
//! # Architecture
//!
//! - **Dimensions**: turn row values into points and points into slices
//! - **Subspace store**: per-hypertable boundary cache for fast routing
//! - **Chunk router**: finds the chunk for a point, creating it under the
//!   hypertable lock when missing
//! - **Placement / tablespaces**: choose data nodes and tablespaces for new chunks
//! - **Catalog**: durable metadata, journaled and replayed on open

pub mod catalog;
pub mod chunk;
pub mod dimension;
pub mod hypercube;
pub mod hypertable;
pub mod placement;
pub mod subspace;
pub mod tablespace;

mod error;
mod types;

pub use error::{HyperError, Result};
pub use types::*;

/// HyperChunk version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// How long chunk creation waits for the hypertable lock (5s)
    pub const LOCK_TIMEOUT_MS: u64 = 5_000;

    /// Boundary cache entries per hypertable
    pub const DEFAULT_CACHE_CAPACITY: usize = 1_024;

    /// Default chunk time interval (7 days in microseconds)
    pub const DEFAULT_CHUNK_TIME_INTERVAL: i64 = 604_800_000_000;

    /// Schema holding chunk relations
    pub const DEFAULT_ASSOCIATED_SCHEMA: &str = "_hyper_internal";

    /// Schema for unqualified table names
    pub const DEFAULT_SCHEMA: &str = "public";
}
