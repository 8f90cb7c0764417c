//! Chunk router - point to chunk resolution and safe chunk creation

use super::{Chunk, NewChunk, SizeHint, TargetSizeEstimator};
use crate::catalog::{MetadataStore, NodeRegistry, TablespaceRegistry};
use crate::dimension::Point;
use crate::hypercube::Hypercube;
use crate::hypertable::{Hypertable, HypertableRecord};
use crate::placement::PlacementEngine;
use crate::tablespace::TablespaceSelector;
use crate::{HyperError, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Resolves points to chunks, creating chunks on demand
pub struct ChunkRouter {
    store: Arc<dyn MetadataStore>,
    estimator: Arc<dyn TargetSizeEstimator>,
    placement: PlacementEngine,
    tablespaces: TablespaceSelector,
}

impl ChunkRouter {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        estimator: Arc<dyn TargetSizeEstimator>,
        nodes: Arc<dyn NodeRegistry>,
        tablespaces: Arc<dyn TablespaceRegistry>,
    ) -> Self {
        Self {
            store,
            estimator,
            placement: PlacementEngine::new(nodes),
            tablespaces: TablespaceSelector::new(tablespaces),
        }
    }

    pub fn placement(&self) -> &PlacementEngine {
        &self.placement
    }

    pub fn tablespaces(&self) -> &TablespaceSelector {
        &self.tablespaces
    }

    /// Find the live chunk containing `point`, if any.
    ///
    /// Consults the boundary cache first and falls back to a metadata scan;
    /// a chunk found by the scan is cached. Chunk drops and dimension
    /// changes made through other managers are picked up first.
    pub fn find_chunk_if_exists(&self, ht: &Hypertable, point: &Point) -> Result<Option<Arc<Chunk>>> {
        self.sync_metadata(ht)?;

        let dimensions = ht.num_dimensions();
        if point.len() != dimensions {
            return Err(HyperError::Validation(format!(
                "point {} has {} coordinates, hypertable {} has {} dimensions",
                point,
                point.len(),
                ht.id(),
                dimensions
            )));
        }

        if let Some(chunk) = ht.cache_lookup(point) {
            return Ok(Some(chunk));
        }

        let found = self
            .store
            .scan_chunks(ht.id())?
            .into_iter()
            .find(|c| c.is_live() && c.hypercube.contains(point));

        Ok(found.map(|chunk| {
            let chunk = Arc::new(chunk);
            ht.cache_insert(chunk.clone());
            chunk
        }))
    }

    /// Reload the hypertable when the catalog's invalidation epoch has moved
    /// past this process's snapshot
    fn sync_metadata(&self, ht: &Hypertable) -> Result<()> {
        let epoch = self.store.invalidation_epoch(ht.id())?;
        if epoch != ht.invalidation_epoch() {
            ht.refresh(self.store.hypertable(ht.id())?);
        }
        Ok(())
    }

    /// Return the chunk containing `point`, creating it if necessary.
    ///
    /// Creation runs under the hypertable lock and re-checks for a chunk
    /// created by a concurrent writer before building a new one.
    pub fn get_or_create_chunk(&self, ht: &Hypertable, point: &Point) -> Result<Arc<Chunk>> {
        if let Some(chunk) = self.find_chunk_if_exists(ht, point)? {
            return Ok(chunk);
        }

        let _lock = self.store.lock_hypertable(ht.id())?;

        let record = self.store.hypertable(ht.id())?;
        if ht.refresh(record.clone()) {
            debug!("Hypertable {} changed while waiting for its lock", ht.id());
        }
        if point.len() != record.space.num_dimensions() {
            return Err(HyperError::ConcurrencyConflict(format!(
                "dimensions of hypertable {} changed, point {} must be recomputed",
                ht.id(),
                point
            )));
        }

        if let Some(chunk) = self.find_chunk_if_exists(ht, point)? {
            debug!("Chunk {} for point {} was created concurrently", chunk.id, point);
            return Ok(chunk);
        }

        self.create_chunk(ht, &record, point)
    }

    fn create_chunk(&self, ht: &Hypertable, record: &HypertableRecord, point: &Point) -> Result<Arc<Chunk>> {
        let live: Vec<Chunk> = self
            .store
            .scan_chunks(record.id)?
            .into_iter()
            .filter(Chunk::is_live)
            .collect();

        let hypercube = self.calculate_hypercube(record, point, &live)?;
        let selection = self.tablespaces.select_tablespace(record, &hypercube)?;
        let data_nodes = if record.is_distributed() {
            self.placement.assign_chunk_data_nodes(record, &hypercube)?
        } else {
            Vec::new()
        };

        let chunk = self.store.persist_chunk(NewChunk {
            hypertable_id: record.id,
            hypercube,
            tablespace: selection.tablespace,
            next_tablespace_offset: selection.next_offset,
            data_nodes,
        })?;

        info!(
            "Created chunk {} {} for hypertable {}",
            chunk.relation_name(),
            chunk.hypercube,
            record.qualified_name()
        );

        let chunk = Arc::new(chunk);
        ht.cache_insert(chunk.clone());
        Ok(chunk)
    }

    /// Snap a hypercube around `point` and cut it free of live siblings
    fn calculate_hypercube(
        &self,
        record: &HypertableRecord,
        point: &Point,
        live: &[Chunk],
    ) -> Result<Hypercube> {
        let hints = record
            .space
            .iter()
            .map(|dim| {
                if dim.is_time() {
                    self.estimator.estimate_target_width(record, dim)
                } else {
                    Ok(SizeHint::new(1))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mut cube = Hypercube::from_point(&record.space, point, &hints)?;

        for other in live {
            if !cube.cut(&other.hypercube, point) {
                error!(
                    "Chunk {} {} already covers point {} of hypertable {}",
                    other.id, other.hypercube, point, record.id
                );
                return Err(HyperError::PartitioningViolation(format!(
                    "chunk {} already covers point {}",
                    other.id, point
                )));
            }
        }

        if let Some(other) = live.iter().find(|c| c.hypercube.collides(&cube)) {
            error!(
                "New hypercube {} overlaps chunk {} {} of hypertable {}",
                cube, other.id, other.hypercube, record.id
            );
            return Err(HyperError::PartitioningViolation(format!(
                "hypercube {} overlaps chunk {}",
                cube, other.id
            )));
        }

        Ok(cube)
    }
}
