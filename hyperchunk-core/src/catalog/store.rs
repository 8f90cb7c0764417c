//! Reference catalog implementing every collaborator trait

use super::{
    CatalogChange, CatalogConfig, DataNode, HypertableLock, Journal, MetadataStore, NodeRegistry,
    TablespaceRegistry,
};
use crate::chunk::{Chunk, NewChunk};
use crate::hypertable::{HypertableRecord, NewHypertable};
use crate::{ChunkId, HyperError, HypertableId, NodeId, Result, Tablespace};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct CatalogState {
    hypertables: BTreeMap<HypertableId, HypertableRecord>,
    chunks: BTreeMap<ChunkId, Chunk>,
    data_nodes: BTreeMap<NodeId, DataNode>,
    next_hypertable_id: i32,
    next_chunk_id: i32,
}

impl CatalogState {
    fn new() -> Self {
        Self {
            next_hypertable_id: 1,
            next_chunk_id: 1,
            ..Default::default()
        }
    }

    fn apply(&mut self, change: CatalogChange) {
        match change {
            CatalogChange::PutHypertable(record) => {
                self.next_hypertable_id = self.next_hypertable_id.max(record.id.0 + 1);
                self.hypertables.insert(record.id, record);
            }
            CatalogChange::DeleteHypertable(id) => {
                self.hypertables.remove(&id);
                self.chunks.retain(|_, c| c.hypertable_id != id);
            }
            CatalogChange::PutChunk(chunk) => {
                self.next_chunk_id = self.next_chunk_id.max(chunk.id.0 + 1);
                self.chunks.insert(chunk.id, chunk);
            }
            CatalogChange::PutDataNode(node) => {
                self.data_nodes.insert(node.name.clone(), node);
            }
        }
    }

    fn hypertable(&self, id: HypertableId) -> Result<&HypertableRecord> {
        self.hypertables
            .get(&id)
            .ok_or_else(|| HyperError::NotFound(format!("hypertable {}", id)))
    }

    fn name_taken(&self, schema: &str, table: &str, except: Option<HypertableId>) -> bool {
        self.hypertables.values().any(|h| {
            Some(h.id) != except && h.schema_name == schema && h.table_name == table
        })
    }
}

/// Hypertable, chunk, data-node and tablespace catalog.
///
/// With a journal directory configured every change is journaled before it
/// becomes visible, so ids, chunk boundaries and tablespace offsets survive
/// restarts.
pub struct Catalog {
    config: CatalogConfig,
    state: RwLock<CatalogState>,
    journal: Option<Journal>,
    locks: Mutex<HashMap<HypertableId, Arc<Mutex<()>>>>,
}

impl Catalog {
    /// Catalog without durability
    pub fn in_memory() -> Self {
        Self {
            config: CatalogConfig::default(),
            state: RwLock::new(CatalogState::new()),
            journal: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open a catalog, replaying its journal if one is configured
    pub fn open(config: CatalogConfig) -> Result<Self> {
        let mut state = CatalogState::new();
        let journal = match &config.dir {
            Some(dir) => {
                let (journal, batches) = Journal::open(dir, config.sync_policy)?;
                for change in batches.into_iter().flatten() {
                    state.apply(change);
                }
                for record in state.hypertables.values() {
                    record.space.check_columns_unique()?;
                }
                info!(
                    "Opened catalog at {:?}: {} hypertables, {} chunks",
                    dir,
                    state.hypertables.len(),
                    state.chunks.len()
                );
                Some(journal)
            }
            None => None,
        };

        Ok(Self {
            config,
            state: RwLock::new(state),
            journal,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Register a data node, or update its availability
    pub fn add_data_node(&self, name: NodeId) -> Result<()> {
        let mut state = self.state.write();
        let change = CatalogChange::PutDataNode(DataNode {
            name: name.clone(),
            available: true,
        });
        self.commit(&mut state, vec![change])?;
        info!("Added data node {}", name);
        Ok(())
    }

    /// Allow or block new chunks on a data node
    pub fn set_data_node_available(&self, name: &NodeId, available: bool) -> Result<()> {
        let mut state = self.state.write();
        let mut node = state
            .data_nodes
            .get(name)
            .cloned()
            .ok_or_else(|| HyperError::NotFound(format!("data node \"{}\"", name)))?;
        node.available = available;
        self.commit(&mut state, vec![CatalogChange::PutDataNode(node)])
    }

    pub fn data_nodes(&self) -> Vec<DataNode> {
        self.state.read().data_nodes.values().cloned().collect()
    }

    pub fn data_node_exists(&self, name: &NodeId) -> bool {
        self.state.read().data_nodes.contains_key(name)
    }

    /// Force the journal to disk
    pub fn sync(&self) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    fn commit(&self, state: &mut CatalogState, changes: Vec<CatalogChange>) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.append(&changes)?;
        }
        for change in changes {
            state.apply(change);
        }
        Ok(())
    }
}

impl MetadataStore for Catalog {
    fn create_hypertable(&self, new: NewHypertable) -> Result<HypertableRecord> {
        let mut state = self.state.write();
        if state.name_taken(&new.schema_name, &new.table_name, None) {
            return Err(HyperError::Validation(format!(
                "table \"{}.{}\" is already a hypertable",
                new.schema_name, new.table_name
            )));
        }

        let id = HypertableId(state.next_hypertable_id);
        let record = new.into_record(id);
        self.commit(&mut state, vec![CatalogChange::PutHypertable(record.clone())])?;
        Ok(record)
    }

    fn hypertable(&self, id: HypertableId) -> Result<HypertableRecord> {
        self.state.read().hypertable(id).cloned()
    }

    fn hypertable_by_name(&self, schema: &str, table: &str) -> Result<Option<HypertableRecord>> {
        Ok(self
            .state
            .read()
            .hypertables
            .values()
            .find(|h| h.schema_name == schema && h.table_name == table)
            .cloned())
    }

    fn hypertables(&self) -> Result<Vec<HypertableRecord>> {
        Ok(self.state.read().hypertables.values().cloned().collect())
    }

    fn update_hypertable(&self, record: &HypertableRecord) -> Result<()> {
        let mut state = self.state.write();
        let epoch = state.hypertable(record.id)?.invalidation_epoch;
        if state.name_taken(&record.schema_name, &record.table_name, Some(record.id)) {
            return Err(HyperError::Validation(format!(
                "table \"{}.{}\" is already a hypertable",
                record.schema_name, record.table_name
            )));
        }
        let mut record = record.clone();
        record.invalidation_epoch = epoch;
        self.commit(&mut state, vec![CatalogChange::PutHypertable(record)])
    }

    fn invalidation_epoch(&self, id: HypertableId) -> Result<u64> {
        Ok(self.state.read().hypertable(id)?.invalidation_epoch)
    }

    fn delete_hypertable(&self, id: HypertableId) -> Result<Vec<Chunk>> {
        let mut state = self.state.write();
        state.hypertable(id)?;
        let removed: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| c.hypertable_id == id)
            .cloned()
            .collect();
        self.commit(&mut state, vec![CatalogChange::DeleteHypertable(id)])?;
        self.locks.lock().remove(&id);
        Ok(removed)
    }

    fn update_hyperspace(&self, record: &HypertableRecord, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.state.write();
        let epoch = state.hypertable(record.id)?.invalidation_epoch;
        for chunk in chunks {
            if chunk.hypertable_id != record.id || !state.chunks.contains_key(&chunk.id) {
                return Err(HyperError::NotFound(format!(
                    "chunk {} of hypertable {}",
                    chunk.id, record.id
                )));
            }
        }

        let mut record = record.clone();
        record.invalidation_epoch = epoch + 1;
        let mut changes = Vec::with_capacity(chunks.len() + 1);
        changes.push(CatalogChange::PutHypertable(record));
        changes.extend(chunks.iter().cloned().map(CatalogChange::PutChunk));
        self.commit(&mut state, changes)
    }

    fn scan_chunks(&self, id: HypertableId) -> Result<Vec<Chunk>> {
        Ok(self
            .state
            .read()
            .chunks
            .values()
            .filter(|c| c.hypertable_id == id)
            .cloned()
            .collect())
    }

    fn chunk(&self, id: ChunkId) -> Result<Chunk> {
        self.state
            .read()
            .chunks
            .get(&id)
            .cloned()
            .ok_or_else(|| HyperError::NotFound(format!("chunk {}", id)))
    }

    fn persist_chunk(&self, new: NewChunk) -> Result<Chunk> {
        let mut state = self.state.write();
        let mut hypertable = state.hypertable(new.hypertable_id)?.clone();

        let id = ChunkId(state.next_chunk_id);
        let chunk = Chunk {
            id,
            hypertable_id: new.hypertable_id,
            schema_name: hypertable.associated_schema_name.clone(),
            table_name: format!("{}_{}_chunk", hypertable.associated_table_prefix, id),
            hypercube: new.hypercube,
            tablespace: new.tablespace,
            data_nodes: new.data_nodes,
            dropped: false,
        };

        let mut changes = vec![CatalogChange::PutChunk(chunk.clone())];
        if let Some(offset) = new.next_tablespace_offset {
            hypertable.tablespace_offset = offset;
            changes.push(CatalogChange::PutHypertable(hypertable));
        }
        self.commit(&mut state, changes)?;
        debug!("Persisted chunk {} ({})", chunk.id, chunk.relation_name());
        Ok(chunk)
    }

    fn update_chunk(&self, chunk: &Chunk) -> Result<()> {
        let mut state = self.state.write();
        let newly_dropped = match state.chunks.get(&chunk.id) {
            Some(existing) if existing.hypertable_id == chunk.hypertable_id => {
                existing.is_live() && chunk.dropped
            }
            _ => return Err(HyperError::NotFound(format!("chunk {}", chunk.id))),
        };

        let mut changes = vec![CatalogChange::PutChunk(chunk.clone())];
        if newly_dropped {
            let mut hypertable = state.hypertable(chunk.hypertable_id)?.clone();
            hypertable.invalidation_epoch += 1;
            changes.push(CatalogChange::PutHypertable(hypertable));
        }
        self.commit(&mut state, changes)
    }

    fn lock_hypertable(&self, id: HypertableId) -> Result<HypertableLock> {
        self.state.read().hypertable(id)?;
        let mutex = self.locks.lock().entry(id).or_default().clone();

        match mutex.try_lock_arc_for(self.config.lock_timeout) {
            Some(guard) => Ok(HypertableLock::new(id, Box::new(guard))),
            None => {
                warn!(
                    "Timed out after {:?} waiting for lock on hypertable {}",
                    self.config.lock_timeout, id
                );
                Err(HyperError::ConcurrencyConflict(format!(
                    "could not lock hypertable {} within {:?}",
                    id, self.config.lock_timeout
                )))
            }
        }
    }
}

impl NodeRegistry for Catalog {
    fn available_nodes(&self) -> Result<BTreeSet<NodeId>> {
        Ok(self
            .state
            .read()
            .data_nodes
            .values()
            .filter(|n| n.available)
            .map(|n| n.name.clone())
            .collect())
    }

    fn chunk_count_per_node(&self, id: HypertableId) -> Result<HashMap<NodeId, usize>> {
        let state = self.state.read();
        let mut counts = HashMap::new();
        for chunk in state.chunks.values() {
            if chunk.hypertable_id != id || chunk.dropped {
                continue;
            }
            for node in &chunk.data_nodes {
                *counts.entry(node.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

impl TablespaceRegistry for Catalog {
    fn tablespaces_for(&self, id: HypertableId) -> Result<Vec<Tablespace>> {
        Ok(self.state.read().hypertable(id)?.tablespaces.clone())
    }
}
