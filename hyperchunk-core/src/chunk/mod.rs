//! Chunks and chunk routing
//!
//! A chunk is the physical partition holding every row whose point falls
//! inside its hypercube. Chunks are owned by the metadata store; the rest of
//! the system holds them as shared, immutable snapshots.

mod router;
mod sizing;

pub use router::ChunkRouter;
pub use sizing::{ConfiguredInterval, SizeHint, TargetSizeEstimator};

use crate::hypercube::Hypercube;
use crate::{ChunkId, HypertableId, NodeId, Tablespace};
use serde::{Deserialize, Serialize};

/// A persisted chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub hypertable_id: HypertableId,
    /// Schema of the chunk's relation
    pub schema_name: String,
    /// Name of the chunk's relation
    pub table_name: String,
    pub hypercube: Hypercube,
    /// `None` means the default tablespace
    pub tablespace: Option<Tablespace>,
    /// Data nodes holding replicas, empty unless distributed
    pub data_nodes: Vec<NodeId>,
    pub dropped: bool,
}

impl Chunk {
    /// Fully qualified relation name
    pub fn relation_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    pub fn is_live(&self) -> bool {
        !self.dropped
    }
}

/// A chunk that has been computed but not yet persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChunk {
    pub hypertable_id: HypertableId,
    pub hypercube: Hypercube,
    pub tablespace: Option<Tablespace>,
    /// Tablespace round-robin offset to store together with the chunk
    pub next_tablespace_offset: Option<u64>,
    pub data_nodes: Vec<NodeId>,
}
