//! Hypertables - logical partitioned tables and their process-local state

mod manager;

pub use manager::HypertableManager;

use crate::chunk::Chunk;
use crate::dimension::{Hyperspace, Point};
use crate::subspace::{CacheStats, SubspaceStore};
use crate::{HypertableId, HypertableType, NodeId, Result, Row, Tablespace};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Durable hypertable metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypertableRecord {
    pub id: HypertableId,
    pub schema_name: String,
    pub table_name: String,
    /// Schema holding the chunk relations
    pub associated_schema_name: String,
    /// Prefix of chunk relation names
    pub associated_table_prefix: String,
    pub space: Hyperspace,
    /// Name of an adaptive chunk sizing function, if configured
    pub chunk_sizing_func: Option<String>,
    /// Target chunk size in bytes for adaptive chunking
    pub chunk_target_size: i64,
    /// -1 for a distributed member, 0 for regular, >0 for distributed
    pub replication_factor: i16,
    /// Restricts placement to these nodes; `None` allows every node
    pub data_nodes: Option<Vec<NodeId>>,
    /// Attached tablespaces in attachment order
    pub tablespaces: Vec<Tablespace>,
    /// Next round-robin position in `tablespaces`
    pub tablespace_offset: u64,
    /// Advanced by the catalog whenever a chunk is dropped or the hyperspace
    /// changes; cached chunk boundaries from an older epoch are stale
    #[serde(default)]
    pub invalidation_epoch: u64,
}

impl HypertableRecord {
    pub fn hypertable_type(&self) -> HypertableType {
        HypertableType::from_replication_factor(self.replication_factor)
    }

    pub fn is_distributed(&self) -> bool {
        self.replication_factor > 0
    }

    pub fn is_distributed_member(&self) -> bool {
        self.replication_factor == -1
    }

    pub fn adaptive_chunking_enabled(&self) -> bool {
        self.chunk_sizing_func.is_some() && self.chunk_target_size > 0
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    pub fn has_tablespace(&self, tablespace: &Tablespace) -> bool {
        self.tablespaces.contains(tablespace)
    }
}

/// A hypertable that has not been assigned an id yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewHypertable {
    pub schema_name: String,
    pub table_name: String,
    pub associated_schema_name: String,
    pub space: Hyperspace,
    pub chunk_sizing_func: Option<String>,
    pub chunk_target_size: i64,
    pub replication_factor: i16,
    pub data_nodes: Option<Vec<NodeId>>,
}

impl NewHypertable {
    pub fn into_record(self, id: HypertableId) -> HypertableRecord {
        HypertableRecord {
            id,
            schema_name: self.schema_name,
            table_name: self.table_name,
            associated_schema_name: self.associated_schema_name,
            associated_table_prefix: format!("_hyper_{}", id),
            space: self.space,
            chunk_sizing_func: self.chunk_sizing_func,
            chunk_target_size: self.chunk_target_size,
            replication_factor: self.replication_factor,
            data_nodes: self.data_nodes,
            tablespaces: Vec::new(),
            tablespace_offset: 0,
            invalidation_epoch: 0,
        }
    }
}

/// A hypertable as seen by one process: a metadata snapshot plus the
/// boundary cache it owns.
pub struct Hypertable {
    id: HypertableId,
    record: RwLock<HypertableRecord>,
    cache: Mutex<SubspaceStore>,
}

impl Hypertable {
    pub fn new(record: HypertableRecord, cache_capacity: usize) -> Self {
        let cache = SubspaceStore::new(&record.space, cache_capacity);
        Self {
            id: record.id,
            record: RwLock::new(record),
            cache: Mutex::new(cache),
        }
    }

    pub fn id(&self) -> HypertableId {
        self.id
    }

    /// Snapshot of the metadata this process last loaded
    pub fn record(&self) -> HypertableRecord {
        self.record.read().clone()
    }

    pub fn num_dimensions(&self) -> usize {
        self.record.read().space.num_dimensions()
    }

    pub fn compute_point(&self, row: &Row) -> Result<Point> {
        self.record.read().space.compute_point(row)
    }

    /// Invalidation epoch of the metadata this process last loaded
    pub fn invalidation_epoch(&self) -> u64 {
        self.record.read().invalidation_epoch
    }

    /// Adopt freshly loaded metadata.
    ///
    /// Returns true when the hyperspace changed, in which case the boundary
    /// cache has been reset. A newer invalidation epoch alone clears the
    /// cache as well.
    pub fn refresh(&self, record: HypertableRecord) -> bool {
        let mut current = self.record.write();
        let changed = current.space != record.space;
        if changed {
            debug!("Hyperspace of hypertable {} changed, resetting chunk cache", self.id);
            self.cache.lock().reset(&record.space);
        } else if current.invalidation_epoch != record.invalidation_epoch {
            debug!(
                "Chunks of hypertable {} changed (epoch {} -> {}), clearing chunk cache",
                self.id, current.invalidation_epoch, record.invalidation_epoch
            );
            self.cache.lock().invalidate_all();
        }
        *current = record;
        changed
    }

    pub fn cache_lookup(&self, point: &Point) -> Option<Arc<Chunk>> {
        self.cache.lock().lookup(point)
    }

    pub fn cache_insert(&self, chunk: Arc<Chunk>) -> bool {
        self.cache.lock().insert(chunk)
    }

    pub fn invalidate_cache(&self) {
        self.cache.lock().invalidate_all();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

/// Hypertable manager configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Boundary cache entries per hypertable
    pub cache_capacity: usize,
    /// Schema that new chunk relations are created in
    pub associated_schema_name: String,
    /// Schema assumed for unqualified table names
    pub default_schema: String,
    /// Time interval used by `time_dimension`
    pub default_chunk_time_interval: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: crate::config::DEFAULT_CACHE_CAPACITY,
            associated_schema_name: crate::config::DEFAULT_ASSOCIATED_SCHEMA.to_string(),
            default_schema: crate::config::DEFAULT_SCHEMA.to_string(),
            default_chunk_time_interval: crate::config::DEFAULT_CHUNK_TIME_INTERVAL,
        }
    }
}

/// Number of hypertables by type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HypertablesStat {
    pub num_hypertables_regular: usize,
    pub num_hypertables_distributed_members: usize,
    pub num_hypertables_distributed: usize,
    /// Distributed hypertables with a replication factor above one
    pub num_hypertables_distributed_and_replicated: usize,
    pub num_hypertables_total: usize,
}

impl HypertablesStat {
    pub fn count(&mut self, record: &HypertableRecord) {
        match record.hypertable_type() {
            HypertableType::Regular => self.num_hypertables_regular += 1,
            HypertableType::DistributedMember => self.num_hypertables_distributed_members += 1,
            HypertableType::Distributed => {
                self.num_hypertables_distributed += 1;
                if record.replication_factor > 1 {
                    self.num_hypertables_distributed_and_replicated += 1;
                }
            }
        }
        self.num_hypertables_total += 1;
    }
}
