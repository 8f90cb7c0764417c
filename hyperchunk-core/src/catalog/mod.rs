//! Catalog collaborators
//!
//! The partitioning core never owns durable state. It reaches hypertable and
//! chunk metadata, the data-node registry and the tablespace registry through
//! the traits below. [`Catalog`] implements all of them, either purely in
//! memory or backed by a checksummed journal on disk.

mod journal;
mod store;

pub use journal::{CatalogChange, Journal};
pub use store::Catalog;

use crate::chunk::{Chunk, NewChunk};
use crate::hypertable::{HypertableRecord, NewHypertable};
use crate::{ChunkId, HypertableId, NodeId, Result, Tablespace};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Durable hypertable and chunk metadata
pub trait MetadataStore: Send + Sync {
    /// Insert a hypertable, assigning its id and chunk table prefix
    fn create_hypertable(&self, new: NewHypertable) -> Result<HypertableRecord>;

    fn hypertable(&self, id: HypertableId) -> Result<HypertableRecord>;

    fn hypertable_by_name(&self, schema: &str, table: &str) -> Result<Option<HypertableRecord>>;

    fn hypertables(&self) -> Result<Vec<HypertableRecord>>;

    /// Store a changed record; the invalidation epoch is kept as stored
    fn update_hypertable(&self, record: &HypertableRecord) -> Result<()>;

    /// Current invalidation epoch of a hypertable
    fn invalidation_epoch(&self, id: HypertableId) -> Result<u64>;

    /// Remove a hypertable and all its chunks, returning the removed chunks
    fn delete_hypertable(&self, id: HypertableId) -> Result<Vec<Chunk>>;

    /// Atomically store a changed hyperspace together with the rewritten
    /// chunks, advancing the invalidation epoch
    fn update_hyperspace(&self, record: &HypertableRecord, chunks: &[Chunk]) -> Result<()>;

    /// All chunks of a hypertable, dropped ones included
    fn scan_chunks(&self, id: HypertableId) -> Result<Vec<Chunk>>;

    fn chunk(&self, id: ChunkId) -> Result<Chunk>;

    /// Persist a new chunk, assigning its identity
    fn persist_chunk(&self, new: NewChunk) -> Result<Chunk>;

    /// Store a changed chunk; dropping a live chunk advances the
    /// hypertable's invalidation epoch
    fn update_chunk(&self, chunk: &Chunk) -> Result<()>;

    /// Block until the hypertable's creation lock is granted
    fn lock_hypertable(&self, id: HypertableId) -> Result<HypertableLock>;
}

/// Registry of data nodes for distributed hypertables
pub trait NodeRegistry: Send + Sync {
    /// Nodes currently accepting new chunks
    fn available_nodes(&self) -> Result<BTreeSet<NodeId>>;

    /// Number of live chunks of the hypertable each node holds
    fn chunk_count_per_node(&self, id: HypertableId) -> Result<HashMap<NodeId, usize>>;
}

/// Registry of tablespaces attached to hypertables
pub trait TablespaceRegistry: Send + Sync {
    /// Attached tablespaces in attachment order
    fn tablespaces_for(&self, id: HypertableId) -> Result<Vec<Tablespace>>;
}

/// Scoped hypertable lock, released when dropped
pub struct HypertableLock {
    hypertable_id: HypertableId,
    _guard: Box<dyn Any>,
}

impl HypertableLock {
    pub fn new(hypertable_id: HypertableId, guard: Box<dyn Any>) -> Self {
        Self {
            hypertable_id,
            _guard: guard,
        }
    }

    pub fn hypertable_id(&self) -> HypertableId {
        self.hypertable_id
    }
}

impl std::fmt::Debug for HypertableLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypertableLock")
            .field("hypertable_id", &self.hypertable_id)
            .finish()
    }
}

/// A data node known to the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    pub name: NodeId,
    /// Whether the node accepts new chunks
    pub available: bool,
}

/// Journal sync policy
#[derive(Debug, Clone, Copy, Default)]
pub enum SyncPolicy {
    /// Sync after every change (safest, slowest)
    #[default]
    Immediate,
    /// Sync after N changes
    EveryN(usize),
    /// Never sync (OS decides)
    None,
}

/// Catalog configuration
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Journal directory; `None` keeps the catalog in memory
    pub dir: Option<PathBuf>,
    pub sync_policy: SyncPolicy,
    /// How long `lock_hypertable` waits before reporting a conflict
    pub lock_timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            sync_policy: SyncPolicy::default(),
            lock_timeout: Duration::from_millis(crate::config::LOCK_TIMEOUT_MS),
        }
    }
}

impl CatalogConfig {
    /// Durable catalog journaling into `dir`
    pub fn durable(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Default::default()
        }
    }
}
