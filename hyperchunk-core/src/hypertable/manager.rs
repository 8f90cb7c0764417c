//! Hypertable manager - top-level coordinator

use super::{EngineConfig, Hypertable, HypertableRecord, HypertablesStat, NewHypertable};
use crate::catalog::{Catalog, MetadataStore, NodeRegistry, TablespaceRegistry};
use crate::chunk::{Chunk, ChunkRouter, ConfiguredInterval, TargetSizeEstimator};
use crate::dimension::{Dimension, DimensionKind, DimensionSpec, Hyperspace, Point};
use crate::hypercube::Hypercube;
use crate::subspace::CacheStats;
use crate::tablespace::TablespaceSelection;
use crate::{
    ChunkId, DimensionId, HyperError, HypertableId, HypertableType, NodeId, Result, Row,
    Tablespace,
};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Entry point for hypertable DDL and insert routing.
///
/// Each manager keeps its own hypertable snapshots and boundary caches, so
/// several managers sharing one catalog behave like separate processes.
pub struct HypertableManager {
    config: EngineConfig,
    store: Arc<dyn MetadataStore>,
    router: ChunkRouter,
    hypertables: RwLock<HashMap<HypertableId, Arc<Hypertable>>>,
}

impl HypertableManager {
    /// Manager backed by `catalog` for every collaborator
    pub fn new(catalog: Arc<Catalog>, config: EngineConfig) -> Self {
        Self::with_collaborators(
            catalog.clone(),
            Arc::new(ConfiguredInterval),
            catalog.clone(),
            catalog,
            config,
        )
    }

    pub fn with_collaborators(
        store: Arc<dyn MetadataStore>,
        estimator: Arc<dyn TargetSizeEstimator>,
        nodes: Arc<dyn NodeRegistry>,
        tablespaces: Arc<dyn TablespaceRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            router: ChunkRouter::new(store.clone(), estimator, nodes, tablespaces),
            store,
            config,
            hypertables: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Time dimension using the configured default interval
    pub fn default_time_dimension(&self, column: impl Into<String>) -> DimensionSpec {
        DimensionSpec::time(column, self.config.default_chunk_time_interval)
    }

    /// Turn `table` into a hypertable partitioned by `dimensions`.
    ///
    /// `table` may be schema-qualified; otherwise the default schema is used.
    pub fn create_hypertable(
        &self,
        table: &str,
        dimensions: Vec<DimensionSpec>,
        replication_factor: i16,
        data_nodes: Option<Vec<NodeId>>,
    ) -> Result<HypertableId> {
        let (schema_name, table_name) = self.parse_table_name(table)?;
        Self::validate_distribution(replication_factor, data_nodes.as_deref())?;
        let space = Hyperspace::new(dimensions)?;

        let record = self.store.create_hypertable(NewHypertable {
            schema_name,
            table_name,
            associated_schema_name: self.config.associated_schema_name.clone(),
            space,
            chunk_sizing_func: None,
            chunk_target_size: 0,
            replication_factor,
            data_nodes,
        })?;

        info!(
            "Created hypertable {} (id {}, {} dimensions, {:?})",
            record.qualified_name(),
            record.id,
            record.space.num_dimensions(),
            record.hypertable_type()
        );

        let id = record.id;
        let space_dimensions: Vec<DimensionId> = record
            .space
            .iter()
            .filter(|d| !d.is_time())
            .map(|d| d.id)
            .collect();
        self.adopt(record);
        for dimension_id in space_dimensions {
            self.check_partitioning(id, dimension_id)?;
        }
        Ok(id)
    }

    /// Get a hypertable, loading it from the catalog on first use
    pub fn hypertable(&self, id: HypertableId) -> Result<Arc<Hypertable>> {
        if let Some(ht) = self.hypertables.read().get(&id) {
            return Ok(ht.clone());
        }
        let record = self.store.hypertable(id)?;
        Ok(self.adopt(record))
    }

    pub fn hypertable_by_name(&self, table: &str) -> Result<Option<Arc<Hypertable>>> {
        let (schema, name) = self.parse_table_name(table)?;
        Ok(self
            .store
            .hypertable_by_name(&schema, &name)?
            .map(|record| self.adopt(record)))
    }

    /// Every hypertable in the catalog
    pub fn hypertables(&self) -> Result<Vec<HypertableRecord>> {
        self.store.hypertables()
    }

    pub fn hypertable_type(&self, id: HypertableId) -> Result<HypertableType> {
        Ok(self.store.hypertable(id)?.hypertable_type())
    }

    /// Remove a hypertable and all of its chunks
    pub fn drop_hypertable(&self, id: HypertableId) -> Result<Vec<Chunk>> {
        let _lock = self.store.lock_hypertable(id)?;
        let removed = self.store.delete_hypertable(id)?;
        self.hypertables.write().remove(&id);
        info!("Dropped hypertable {} with {} chunks", id, removed.len());
        Ok(removed)
    }

    pub fn rename_hypertable(&self, id: HypertableId, new_name: &str) -> Result<()> {
        let (schema_name, table_name) = self.parse_table_name(new_name)?;
        let _lock = self.store.lock_hypertable(id)?;
        let mut record = self.store.hypertable(id)?;
        let old_name = record.qualified_name();
        record.schema_name = schema_name;
        record.table_name = table_name;
        self.store.update_hypertable(&record)?;
        info!("Renamed hypertable {} to {}", old_name, record.qualified_name());
        self.adopt(record);
        Ok(())
    }

    pub fn find_chunk_if_exists(&self, id: HypertableId, point: &Point) -> Result<Option<Arc<Chunk>>> {
        let ht = self.hypertable(id)?;
        self.router.find_chunk_if_exists(&ht, point)
    }

    pub fn get_or_create_chunk(&self, id: HypertableId, point: &Point) -> Result<Arc<Chunk>> {
        let ht = self.hypertable(id)?;
        self.router.get_or_create_chunk(&ht, point)
    }

    /// Route a row to its chunk, creating the chunk if needed.
    ///
    /// A point computed against a hyperspace that changed underneath is
    /// recomputed once.
    pub fn insert_row(&self, id: HypertableId, row: &Row) -> Result<Arc<Chunk>> {
        let ht = self.hypertable(id)?;
        let point = ht.compute_point(row)?;
        match self.router.get_or_create_chunk(&ht, &point) {
            Err(HyperError::ConcurrencyConflict(_) | HyperError::Validation(_))
                if ht.num_dimensions() != point.len() =>
            {
                debug!("Recomputing point {} for hypertable {}", point, id);
                let point = ht.compute_point(row)?;
                self.router.get_or_create_chunk(&ht, &point)
            }
            result => result,
        }
    }

    pub fn assign_chunk_data_nodes(&self, id: HypertableId, hypercube: &Hypercube) -> Result<Vec<NodeId>> {
        let record = self.store.hypertable(id)?;
        self.router.placement().assign_chunk_data_nodes(&record, hypercube)
    }

    /// Add a space dimension to a hypertable.
    ///
    /// Existing chunks cover the whole new dimension. Fails if that would
    /// leave two live chunks covering the same point.
    pub fn add_dimension(&self, id: HypertableId, spec: DimensionSpec) -> Result<Dimension> {
        let _lock = self.store.lock_hypertable(id)?;
        let mut record = self.store.hypertable(id)?;
        let dimension = record.space.add(spec)?.clone();

        let mut chunks = self.store.scan_chunks(id)?;
        for chunk in &mut chunks {
            chunk.hypercube.push_full_slice();
        }
        check_exclusive(&record, &chunks)?;

        self.store.update_hyperspace(&record, &chunks)?;
        info!(
            "Added dimension \"{}\" to hypertable {} ({} chunks extended)",
            dimension.column,
            record.qualified_name(),
            chunks.len()
        );
        self.adopt(self.store.hypertable(id)?);
        self.check_partitioning(id, dimension.id)?;
        Ok(dimension)
    }

    /// Check that a space dimension of a distributed hypertable has at least
    /// as many partitions as the hypertable has data nodes.
    ///
    /// With fewer partitions some data nodes never receive chunks for that
    /// dimension. This is logged as a warning and reported as `false`.
    pub fn check_partitioning(&self, id: HypertableId, dimension_id: DimensionId) -> Result<bool> {
        let record = self.store.hypertable(id)?;
        let dimension = record
            .space
            .iter()
            .find(|d| d.id == dimension_id)
            .ok_or_else(|| {
                HyperError::NotFound(format!("dimension {} of hypertable {}", dimension_id.0, id))
            })?;
        let DimensionKind::Space { num_slices } = dimension.kind else {
            return Ok(true);
        };
        if !record.is_distributed() {
            return Ok(true);
        }

        let num_nodes = self.router.placement().available_data_nodes(&record)?.len();
        if (num_slices as usize) < num_nodes {
            warn!(
                "Insufficient number of partitions for dimension \"{}\" of hypertable {}: \
                 {} partitions for {} data nodes, use at least {} partitions to use all data nodes",
                dimension.column,
                record.qualified_name(),
                num_slices,
                num_nodes,
                num_nodes
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Change the interval used for new chunks; existing chunks keep theirs
    pub fn set_chunk_time_interval(&self, id: HypertableId, interval_length: i64) -> Result<()> {
        let _lock = self.store.lock_hypertable(id)?;
        let mut record = self.store.hypertable(id)?;
        let time = record.space.time_dimension_mut();
        let spec = DimensionSpec::time(time.column.clone(), interval_length);
        spec.validate()?;
        time.kind = DimensionKind::Time { interval_length };

        self.store.update_hypertable(&record)?;
        info!(
            "Set chunk time interval of hypertable {} to {}",
            record.qualified_name(),
            interval_length
        );
        self.adopt(record);
        Ok(())
    }

    /// Live chunks of a hypertable
    pub fn chunks(&self, id: HypertableId) -> Result<Vec<Chunk>> {
        self.store.hypertable(id)?;
        Ok(self
            .store
            .scan_chunks(id)?
            .into_iter()
            .filter(Chunk::is_live)
            .collect())
    }

    /// Mark a chunk dropped so its region can be re-created
    pub fn drop_chunk(&self, chunk_id: ChunkId) -> Result<Chunk> {
        let hypertable_id = self.store.chunk(chunk_id)?.hypertable_id;
        let _lock = self.store.lock_hypertable(hypertable_id)?;

        let mut chunk = self.store.chunk(chunk_id)?;
        if chunk.dropped {
            return Err(HyperError::NotFound(format!("chunk {} is already dropped", chunk_id)));
        }
        chunk.dropped = true;
        self.store.update_chunk(&chunk)?;

        self.refresh_loaded(hypertable_id)?;
        info!("Dropped chunk {}", chunk.relation_name());
        Ok(chunk)
    }

    /// Drop every live chunk whose time range ends at or before `older_than`
    pub fn drop_chunks_before(&self, id: HypertableId, older_than: i64) -> Result<Vec<Chunk>> {
        let _lock = self.store.lock_hypertable(id)?;

        let mut dropped = Vec::new();
        for mut chunk in self.store.scan_chunks(id)? {
            let expired = chunk
                .hypercube
                .slice(0)
                .map_or(false, |time| time.range_end <= older_than);
            if chunk.is_live() && expired {
                chunk.dropped = true;
                self.store.update_chunk(&chunk)?;
                dropped.push(chunk);
            }
        }

        self.refresh_loaded(id)?;
        info!("Dropped {} chunks of hypertable {} older than {}", dropped.len(), id, older_than);
        Ok(dropped)
    }

    pub fn is_partitioning_column(&self, id: HypertableId, column: &str) -> Result<bool> {
        let ht = self.hypertable(id)?;
        let record = ht.record();
        Ok(record.space.dimension_by_column(column).is_some())
    }

    /// Attach a tablespace for new chunks; returns false if already attached
    pub fn attach_tablespace(&self, id: HypertableId, tablespace: Tablespace) -> Result<bool> {
        if tablespace.as_str().trim().is_empty() {
            return Err(HyperError::Validation("tablespace name is empty".into()));
        }
        let _lock = self.store.lock_hypertable(id)?;
        let mut record = self.store.hypertable(id)?;
        if record.has_tablespace(&tablespace) {
            return Ok(false);
        }
        record.tablespaces.push(tablespace.clone());
        self.store.update_hypertable(&record)?;
        info!("Attached tablespace {} to hypertable {}", tablespace, record.qualified_name());
        self.adopt(record);
        Ok(true)
    }

    pub fn detach_tablespace(&self, id: HypertableId, tablespace: &Tablespace) -> Result<()> {
        let _lock = self.store.lock_hypertable(id)?;
        let mut record = self.store.hypertable(id)?;
        if !record.has_tablespace(tablespace) {
            return Err(HyperError::NotFound(format!(
                "tablespace \"{}\" is not attached to hypertable {}",
                tablespace,
                record.qualified_name()
            )));
        }
        record.tablespaces.retain(|t| t != tablespace);
        self.store.update_hypertable(&record)?;
        info!("Detached tablespace {} from hypertable {}", tablespace, record.qualified_name());
        self.adopt(record);
        Ok(())
    }

    /// The tablespace the next chunk covering `hypercube` would get
    pub fn select_tablespace(&self, id: HypertableId, hypercube: &Hypercube) -> Result<TablespaceSelection> {
        let record = self.store.hypertable(id)?;
        self.router.tablespaces().select_tablespace(&record, hypercube)
    }

    pub fn tablespace_at_offset_from(
        &self,
        id: HypertableId,
        tablespace: &Tablespace,
        offset: i64,
    ) -> Result<Option<Tablespace>> {
        self.router.tablespaces().tablespace_at_offset_from(id, tablespace, offset)
    }

    /// Count hypertables by type
    pub fn hypertable_stats(&self) -> Result<HypertablesStat> {
        let mut stat = HypertablesStat::default();
        for record in self.store.hypertables()? {
            stat.count(&record);
        }
        Ok(stat)
    }

    pub fn cache_stats(&self, id: HypertableId) -> Result<CacheStats> {
        Ok(self.hypertable(id)?.cache_stats())
    }

    /// Clear this manager's boundary cache for a hypertable
    pub fn invalidate_cache(&self, id: HypertableId) -> Result<()> {
        self.hypertable(id)?.invalidate_cache();
        Ok(())
    }

    /// Pick up catalog changes for a hypertable this manager has loaded
    fn refresh_loaded(&self, id: HypertableId) -> Result<()> {
        let loaded = self.hypertables.read().get(&id).cloned();
        if let Some(ht) = loaded {
            ht.refresh(self.store.hypertable(id)?);
        }
        Ok(())
    }

    fn adopt(&self, record: HypertableRecord) -> Arc<Hypertable> {
        let mut hypertables = self.hypertables.write();
        match hypertables.get(&record.id) {
            Some(ht) => {
                ht.refresh(record);
                ht.clone()
            }
            None => {
                let ht = Arc::new(Hypertable::new(record, self.config.cache_capacity));
                hypertables.insert(ht.id(), ht.clone());
                ht
            }
        }
    }

    fn parse_table_name(&self, name: &str) -> Result<(String, String)> {
        let (schema, table) = match name.split_once('.') {
            Some((schema, table)) => (schema.trim(), table.trim()),
            None => (self.config.default_schema.as_str(), name.trim()),
        };
        if schema.is_empty() || table.is_empty() || table.contains('.') {
            return Err(HyperError::Validation(format!("invalid table name \"{}\"", name)));
        }
        Ok((schema.to_string(), table.to_string()))
    }

    fn validate_distribution(replication_factor: i16, data_nodes: Option<&[NodeId]>) -> Result<()> {
        if replication_factor < -1 {
            return Err(HyperError::Validation(format!(
                "invalid replication factor {}: must be -1, 0 or positive",
                replication_factor
            )));
        }
        let Some(nodes) = data_nodes else {
            return Ok(());
        };
        if replication_factor <= 0 {
            return Err(HyperError::Validation(
                "data nodes can only be set for distributed hypertables".into(),
            ));
        }
        if nodes.is_empty() {
            return Err(HyperError::Validation("data node list is empty".into()));
        }
        let distinct: BTreeSet<&NodeId> = nodes.iter().collect();
        if distinct.len() != nodes.len() {
            return Err(HyperError::Validation("data node list contains duplicates".into()));
        }
        if nodes.len() > i16::MAX as usize {
            return Err(HyperError::Validation(format!(
                "too many data nodes: at most {} are supported",
                i16::MAX
            )));
        }
        Ok(())
    }
}

/// Fail if two live chunks would cover a common point
fn check_exclusive(record: &HypertableRecord, chunks: &[Chunk]) -> Result<()> {
    let live: Vec<&Chunk> = chunks.iter().filter(|c| c.is_live()).collect();
    for (i, a) in live.iter().enumerate() {
        if let Some(b) = live[i + 1..].iter().find(|b| a.hypercube.collides(&b.hypercube)) {
            error!(
                "Chunks {} {} and {} {} of hypertable {} overlap",
                a.id, a.hypercube, b.id, b.hypercube, record.id
            );
            return Err(HyperError::PartitioningViolation(format!(
                "chunks {} and {} of hypertable {} overlap",
                a.id,
                b.id,
                record.qualified_name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogConfig;
    use crate::chunk::NewChunk;
    use crate::dimension::DimensionSlice;
    use crate::Value;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager() -> (Arc<Catalog>, HypertableManager) {
        let catalog = Arc::new(Catalog::in_memory());
        let manager = HypertableManager::new(catalog.clone(), EngineConfig::default());
        (catalog, manager)
    }

    fn row(time: i64) -> Row {
        Row::new().with("time", Value::Timestamp(time))
    }

    fn device_row(time: i64, device: &str) -> Row {
        row(time).with("device", device)
    }

    fn time_table(manager: &HypertableManager, interval: i64) -> HypertableId {
        manager
            .create_hypertable("metrics", vec![DimensionSpec::time("time", interval)], 0, None)
            .unwrap()
    }

    #[test]
    fn test_create_hypertable_validation() {
        let (_, manager) = manager();
        let id = time_table(&manager, 100);
        let ht = manager.hypertable(id).unwrap().record();
        assert_eq!(ht.qualified_name(), "public.metrics");
        assert_eq!(ht.associated_schema_name, "_hyper_internal");

        let duplicate = manager.create_hypertable("public.metrics", vec![DimensionSpec::time("time", 100)], 0, None);
        assert!(matches!(duplicate, Err(HyperError::Validation(_))));

        let bad_dims = [
            vec![],
            vec![DimensionSpec::space("device", 4)],
            vec![DimensionSpec::time("time", 0)],
            vec![DimensionSpec::time("time", 100), DimensionSpec::space("device", 0)],
            vec![DimensionSpec::time("time", 100), DimensionSpec::space("time", 2)],
            vec![DimensionSpec::time("time", 100), DimensionSpec::time("other", 100)],
        ];
        for dims in bad_dims {
            let result = manager.create_hypertable("other", dims, 0, None);
            assert!(matches!(result, Err(HyperError::Validation(_))));
        }

        let dims = || vec![DimensionSpec::time("time", 100)];
        assert!(manager.create_hypertable("a", dims(), -2, None).is_err());
        assert!(manager.create_hypertable("b", dims(), 0, Some(vec![NodeId::from("dn1")])).is_err());
        assert!(manager.create_hypertable("c", dims(), 2, Some(vec![])).is_err());
        assert!(manager
            .create_hypertable("d", dims(), 2, Some(vec![NodeId::from("dn1"), NodeId::from("dn1")]))
            .is_err());
        assert!(manager.create_hypertable("bad.name.here", dims(), 0, None).is_err());
        assert!(manager.hypertable_by_name("other").unwrap().is_none());
    }

    #[test]
    fn test_routing_is_idempotent() {
        let (catalog, manager) = manager();
        let id = time_table(&manager, 100);

        let first = manager.insert_row(id, &row(42)).unwrap();
        let second = manager.insert_row(id, &row(42)).unwrap();
        let neighbour = manager.insert_row(id, &row(99)).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.id, neighbour.id);
        assert_eq!(first.hypercube.slices, vec![DimensionSlice::new(0, 100)]);
        assert_eq!(catalog.scan_chunks(id).unwrap().len(), 1);

        let next = manager.insert_row(id, &row(100)).unwrap();
        assert_ne!(next.id, first.id);
        assert_eq!(next.hypercube.slices, vec![DimensionSlice::new(100, 200)]);

        let negative = manager.insert_row(id, &row(-1)).unwrap();
        assert_eq!(negative.hypercube.slices, vec![DimensionSlice::new(-100, 0)]);

        let stats = manager.cache_stats(id).unwrap();
        assert!(stats.hits >= 2);
        assert_eq!(stats.entries, 3);
    }

    #[test]
    fn test_invalid_rows_are_rejected() {
        let (catalog, manager) = manager();
        let id = time_table(&manager, 100);

        assert!(matches!(manager.insert_row(id, &Row::new()), Err(HyperError::Validation(_))));
        let text_time = Row::new().with("time", "yesterday");
        assert!(matches!(manager.insert_row(id, &text_time), Err(HyperError::Validation(_))));
        assert!(matches!(manager.insert_row(id, &row(i64::MAX)), Err(HyperError::Validation(_))));

        let wrong_arity = Point::new(vec![1, 2]);
        assert!(matches!(
            manager.get_or_create_chunk(id, &wrong_arity),
            Err(HyperError::Validation(_))
        ));
        assert!(catalog.scan_chunks(id).unwrap().is_empty());
        assert!(matches!(
            manager.insert_row(HypertableId(99), &row(0)),
            Err(HyperError::NotFound(_))
        ));
    }

    #[test]
    fn test_partition_exclusivity_randomized() {
        let (catalog, manager) = manager();
        let id = manager
            .create_hypertable(
                "metrics",
                vec![DimensionSpec::time("time", 1_000), DimensionSpec::space("device", 3)],
                0,
                None,
            )
            .unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut rows = Vec::new();
        for step in 0..400 {
            // Shrink the interval halfway so new chunks get cut against old ones
            if step == 200 {
                manager.set_chunk_time_interval(id, 350).unwrap();
            }
            let r = device_row(rng.gen_range(-5_000..5_000), &format!("dev-{}", rng.gen_range(0..10)));
            let chunk = manager.insert_row(id, &r).unwrap();
            let point = manager.hypertable(id).unwrap().compute_point(&r).unwrap();
            assert!(chunk.hypercube.contains(&point));
            rows.push(point);
        }

        let chunks: Vec<Chunk> = catalog.scan_chunks(id).unwrap().into_iter().filter(Chunk::is_live).collect();
        for (i, a) in chunks.iter().enumerate() {
            for b in &chunks[i + 1..] {
                assert!(!a.hypercube.collides(&b.hypercube), "{} overlaps {}", a.hypercube, b.hypercube);
            }
        }
        for point in &rows {
            let owners = chunks.iter().filter(|c| c.hypercube.contains(point)).count();
            assert_eq!(owners, 1, "point {} has {} owners", point, owners);
        }
    }

    #[test]
    fn test_concurrent_creation_yields_one_chunk() {
        let catalog = Arc::new(Catalog::in_memory());
        let first = HypertableManager::new(catalog.clone(), EngineConfig::default());
        let second = HypertableManager::new(catalog.clone(), EngineConfig::default());
        let id = time_table(&first, 100);

        let ids: Vec<ChunkId> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let manager = if i % 2 == 0 { &first } else { &second };
                    s.spawn(move || manager.insert_row(id, &row(50 + i)).unwrap().id)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(ids.iter().all(|c| *c == ids[0]));
        assert_eq!(catalog.scan_chunks(id).unwrap().len(), 1);
    }

    #[test]
    fn test_distributed_placement() {
        let (catalog, manager) = manager();
        for name in ["dn1", "dn2", "dn3"] {
            catalog.add_data_node(NodeId::from(name)).unwrap();
        }
        let id = manager
            .create_hypertable("metrics", vec![DimensionSpec::time("time", 100)], 2, None)
            .unwrap();
        assert_eq!(manager.hypertable_type(id).unwrap(), HypertableType::Distributed);

        let mut load: HashMap<NodeId, usize> = HashMap::new();
        for i in 0..3 {
            let chunk = manager.insert_row(id, &row(i * 100)).unwrap();
            let distinct: HashSet<_> = chunk.data_nodes.iter().collect();
            assert_eq!(chunk.data_nodes.len(), 2);
            assert_eq!(distinct.len(), 2);
            for node in &chunk.data_nodes {
                *load.entry(node.clone()).or_default() += 1;
            }
        }
        // Six replicas over three equally preferred nodes
        assert!(load.values().all(|n| *n == 2));

        let cube = Hypercube::new(vec![DimensionSlice::new(0, 100)]);
        assert_eq!(manager.assign_chunk_data_nodes(id, &cube).unwrap().len(), 2);
    }

    #[test]
    fn test_check_partitioning() {
        let (catalog, manager) = manager();
        for name in ["dn1", "dn2", "dn3"] {
            catalog.add_data_node(NodeId::from(name)).unwrap();
        }
        let dims = vec![DimensionSpec::time("time", 100), DimensionSpec::space("device", 2)];
        let id = manager.create_hypertable("metrics", dims.clone(), 1, None).unwrap();

        // Two partitions cannot spread over three nodes
        assert!(!manager.check_partitioning(id, DimensionId(2)).unwrap());
        assert!(manager.check_partitioning(id, DimensionId(1)).unwrap());
        assert!(matches!(
            manager.check_partitioning(id, DimensionId(9)),
            Err(HyperError::NotFound(_))
        ));

        let zone = manager.add_dimension(id, DimensionSpec::space("zone", 4)).unwrap();
        assert!(manager.check_partitioning(id, zone.id).unwrap());

        // Only the hypertable's own node list counts
        let restricted = manager
            .create_hypertable("restricted", dims.clone(), 1, Some(vec![NodeId::from("dn1"), NodeId::from("dn2")]))
            .unwrap();
        assert!(manager.check_partitioning(restricted, DimensionId(2)).unwrap());

        let regular = manager.create_hypertable("regular", dims, 0, None).unwrap();
        assert!(manager.check_partitioning(regular, DimensionId(2)).unwrap());
    }

    #[test]
    fn test_placement_failure_leaves_no_chunk() {
        let (catalog, manager) = manager();
        for name in ["dn1", "dn2", "dn3"] {
            catalog.add_data_node(NodeId::from(name)).unwrap();
        }
        let id = manager
            .create_hypertable("metrics", vec![DimensionSpec::time("time", 100)], 5, None)
            .unwrap();
        manager.attach_tablespace(id, Tablespace::from("a")).unwrap();
        manager.attach_tablespace(id, Tablespace::from("b")).unwrap();

        let err = manager.insert_row(id, &row(0)).unwrap_err();
        assert!(matches!(err, HyperError::Placement { required: 5, available: 3 }));
        assert!(catalog.scan_chunks(id).unwrap().is_empty());
        assert_eq!(catalog.hypertable(id).unwrap().tablespace_offset, 0);

        let regular = time_table(&manager, 100);
        let cube = Hypercube::new(vec![DimensionSlice::new(0, 100)]);
        assert!(matches!(
            manager.assign_chunk_data_nodes(regular, &cube),
            Err(HyperError::Validation(_))
        ));
    }

    #[test]
    fn test_tablespace_round_robin() {
        let (catalog, manager) = manager();
        let id = time_table(&manager, 100);
        for name in ["A", "B", "C"] {
            assert!(manager.attach_tablespace(id, Tablespace::from(name)).unwrap());
        }
        assert!(!manager.attach_tablespace(id, Tablespace::from("A")).unwrap());

        let picked: Vec<String> = (0..4)
            .map(|i| {
                let chunk = manager.insert_row(id, &row(i * 100)).unwrap();
                chunk.tablespace.clone().unwrap().0
            })
            .collect();
        assert_eq!(picked, vec!["A", "B", "C", "A"]);
        assert_eq!(catalog.hypertable(id).unwrap().tablespace_offset, 4);

        // Routing to an existing chunk does not advance the counter
        manager.insert_row(id, &row(0)).unwrap();
        assert_eq!(catalog.hypertable(id).unwrap().tablespace_offset, 4);

        let cube = Hypercube::new(vec![DimensionSlice::new(400, 500)]);
        let next = manager.select_tablespace(id, &cube).unwrap();
        assert_eq!(next.tablespace, Some(Tablespace::from("B")));
        assert_eq!(
            manager.tablespace_at_offset_from(id, &Tablespace::from("C"), 1).unwrap(),
            Some(Tablespace::from("A"))
        );

        manager.detach_tablespace(id, &Tablespace::from("B")).unwrap();
        assert!(manager.detach_tablespace(id, &Tablespace::from("B")).is_err());
        let chunk = manager.insert_row(id, &row(400)).unwrap();
        assert_eq!(chunk.tablespace, Some(Tablespace::from("A")));
    }

    #[test]
    fn test_no_tablespaces_uses_default() {
        let (catalog, manager) = manager();
        let id = time_table(&manager, 100);
        let chunk = manager.insert_row(id, &row(0)).unwrap();
        assert!(chunk.tablespace.is_none());
        assert_eq!(catalog.hypertable(id).unwrap().tablespace_offset, 0);
    }

    #[test]
    fn test_cache_staleness_after_add_dimension() {
        let (_, manager) = manager();
        let id = time_table(&manager, 100);
        let chunk = manager.insert_row(id, &row(10)).unwrap();
        assert!(manager.find_chunk_if_exists(id, &Point::new(vec![10])).unwrap().is_some());

        let dimension = manager.add_dimension(id, DimensionSpec::space("device", 4)).unwrap();
        assert_eq!(dimension.id.0, 2);
        assert!(manager.is_partitioning_column(id, "device").unwrap());
        assert!(!manager.is_partitioning_column(id, "value").unwrap());
        assert_eq!(manager.cache_stats(id).unwrap().entries, 0);

        let found = manager.find_chunk_if_exists(id, &Point::new(vec![10, 3])).unwrap().unwrap();
        assert_eq!(found.id, chunk.id);
        assert_eq!(found.hypercube.slices[1], DimensionSlice::full());

        // The old chunk still owns its time range for every partition
        let routed = manager.insert_row(id, &device_row(20, "sensor-9")).unwrap();
        assert_eq!(routed.id, chunk.id);

        let fresh = manager.insert_row(id, &device_row(150, "sensor-9")).unwrap();
        assert_ne!(fresh.id, chunk.id);
        assert!(fresh.hypercube.slices[1].is_unit());

        assert!(matches!(
            manager.add_dimension(id, DimensionSpec::time("other", 10)),
            Err(HyperError::Validation(_))
        ));
        assert!(matches!(
            manager.add_dimension(id, DimensionSpec::space("device", 2)),
            Err(HyperError::Validation(_))
        ));
    }

    #[test]
    fn test_stale_process_recomputes_point() {
        let catalog = Arc::new(Catalog::in_memory());
        let writer = HypertableManager::new(catalog.clone(), EngineConfig::default());
        let stale = HypertableManager::new(catalog.clone(), EngineConfig::default());
        let id = time_table(&writer, 100);
        stale.insert_row(id, &row(10)).unwrap();

        writer.add_dimension(id, DimensionSpec::space("device", 4)).unwrap();

        let chunk = stale.insert_row(id, &device_row(250, "sensor-1")).unwrap();
        assert_eq!(chunk.hypercube.num_slices(), 2);
        assert_eq!(stale.hypertable(id).unwrap().num_dimensions(), 2);
    }

    #[test]
    fn test_time_upper_bound_is_rejected() {
        let (catalog, manager) = manager();
        let id = time_table(&manager, 100);
        let point = Point::new(vec![i64::MAX]);

        for _ in 0..2 {
            assert!(matches!(
                manager.get_or_create_chunk(id, &point),
                Err(HyperError::Validation(_))
            ));
        }
        assert!(catalog.scan_chunks(id).unwrap().is_empty());

        let edge = manager.get_or_create_chunk(id, &Point::new(vec![i64::MAX - 1])).unwrap();
        assert!(edge.hypercube.contains(&Point::new(vec![i64::MAX - 1])));
    }

    #[test]
    fn test_drop_is_seen_by_other_managers() {
        let catalog = Arc::new(Catalog::in_memory());
        let dropper = HypertableManager::new(catalog.clone(), EngineConfig::default());
        let reader = HypertableManager::new(catalog.clone(), EngineConfig::default());
        let id = time_table(&dropper, 100);

        let old = reader.insert_row(id, &row(10)).unwrap();
        assert_eq!(reader.cache_stats(id).unwrap().entries, 1);

        dropper.drop_chunk(old.id).unwrap();
        let recreated = dropper.insert_row(id, &row(10)).unwrap();
        assert_ne!(recreated.id, old.id);

        assert_eq!(reader.insert_row(id, &row(10)).unwrap().id, recreated.id);
        let point = Point::new(vec![10]);
        assert_eq!(reader.get_or_create_chunk(id, &point).unwrap().id, recreated.id);

        // Retention drops invalidate the other cache too
        reader.insert_row(id, &row(150)).unwrap();
        dropper.drop_chunks_before(id, 1_000).unwrap();
        assert!(reader.find_chunk_if_exists(id, &point).unwrap().is_none());
        assert!(reader.find_chunk_if_exists(id, &Point::new(vec![150])).unwrap().is_none());
        assert!(catalog.scan_chunks(id).unwrap().iter().all(|c| c.dropped));
    }

    #[test]
    fn test_stale_process_finds_chunks_after_add_dimension() {
        let catalog = Arc::new(Catalog::in_memory());
        let writer = HypertableManager::new(catalog.clone(), EngineConfig::default());
        let stale = HypertableManager::new(catalog.clone(), EngineConfig::default());
        let id = time_table(&writer, 100);
        let chunk = stale.insert_row(id, &row(10)).unwrap();

        writer.add_dimension(id, DimensionSpec::space("device", 4)).unwrap();

        let found = stale.find_chunk_if_exists(id, &Point::new(vec![10, 3])).unwrap().unwrap();
        assert_eq!(found.id, chunk.id);
        assert_eq!(stale.hypertable(id).unwrap().num_dimensions(), 2);
        assert!(matches!(
            stale.find_chunk_if_exists(id, &Point::new(vec![10])),
            Err(HyperError::Validation(_))
        ));
    }

    #[test]
    fn test_add_dimension_rejects_overlapping_chunks() {
        let (catalog, manager) = manager();
        let id = time_table(&manager, 100);
        for start in [0, 50] {
            catalog
                .persist_chunk(NewChunk {
                    hypertable_id: id,
                    hypercube: Hypercube::new(vec![DimensionSlice::new(start, start + 100)]),
                    tablespace: None,
                    next_tablespace_offset: None,
                    data_nodes: Vec::new(),
                })
                .unwrap();
        }

        let err = manager.add_dimension(id, DimensionSpec::space("device", 2)).unwrap_err();
        assert!(matches!(err, HyperError::PartitioningViolation(_)));
        assert_eq!(catalog.hypertable(id).unwrap().space.num_dimensions(), 1);
    }

    #[test]
    fn test_interval_change_cuts_new_chunks() {
        let (_, manager) = manager();
        let id = time_table(&manager, 100);
        let old = manager.insert_row(id, &row(50)).unwrap();

        manager.set_chunk_time_interval(id, 1_000).unwrap();
        assert!(manager.set_chunk_time_interval(id, 0).is_err());

        let wide = manager.insert_row(id, &row(150)).unwrap();
        assert_eq!(wide.hypercube.slices, vec![DimensionSlice::new(100, 1_000)]);
        assert_eq!(manager.insert_row(id, &row(99)).unwrap().id, old.id);
    }

    #[test]
    fn test_drop_chunks() {
        let (_, manager) = manager();
        let id = time_table(&manager, 100);
        let first = manager.insert_row(id, &row(0)).unwrap();
        manager.insert_row(id, &row(100)).unwrap();
        manager.insert_row(id, &row(200)).unwrap();

        let dropped = manager.drop_chunk(first.id).unwrap();
        assert!(dropped.dropped);
        assert!(manager.drop_chunk(first.id).is_err());
        assert!(manager.find_chunk_if_exists(id, &Point::new(vec![0])).unwrap().is_none());

        let recreated = manager.insert_row(id, &row(0)).unwrap();
        assert_ne!(recreated.id, first.id);
        assert_eq!(recreated.hypercube, first.hypercube);

        let expired = manager.drop_chunks_before(id, 200).unwrap();
        assert_eq!(expired.len(), 2);
        let live = manager.chunks(id).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].hypercube.slices, vec![DimensionSlice::new(200, 300)]);
    }

    #[test]
    fn test_rename_drop_and_stats() {
        let (catalog, manager) = manager();
        let id = time_table(&manager, 100);
        let member = manager
            .create_hypertable("remote.metrics", vec![DimensionSpec::time("time", 100)], -1, None)
            .unwrap();
        manager.insert_row(id, &row(0)).unwrap();

        manager.rename_hypertable(id, "archive.metrics_old").unwrap();
        let renamed = manager.hypertable_by_name("archive.metrics_old").unwrap().unwrap();
        assert_eq!(renamed.id(), id);
        assert!(manager.hypertable_by_name("metrics").unwrap().is_none());
        assert!(manager.rename_hypertable(member, "archive.metrics_old").is_err());

        let stat = manager.hypertable_stats().unwrap();
        assert_eq!(stat.num_hypertables_regular, 1);
        assert_eq!(stat.num_hypertables_distributed_members, 1);
        assert_eq!(stat.num_hypertables_total, 2);

        let removed = manager.drop_hypertable(id).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(catalog.scan_chunks(id).unwrap().is_empty());
        assert!(matches!(manager.insert_row(id, &row(0)), Err(HyperError::NotFound(_))));
        assert_eq!(manager.hypertables().unwrap().len(), 1);
    }

    #[test]
    fn test_lock_timeout_surfaces_conflict() {
        let config = CatalogConfig {
            lock_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let catalog = Arc::new(Catalog::open(config).unwrap());
        let manager = HypertableManager::new(catalog.clone(), EngineConfig::default());
        let id = time_table(&manager, 100);
        manager.insert_row(id, &row(0)).unwrap();

        let held = catalog.lock_hypertable(id).unwrap();
        // Cached chunks route without the lock
        assert!(manager.insert_row(id, &row(1)).is_ok());
        let err = manager.insert_row(id, &row(500)).unwrap_err();
        assert!(err.is_retryable());
        drop(held);

        assert!(manager.insert_row(id, &row(500)).is_ok());
    }

    #[test]
    fn test_restart_restores_chunks_and_offset() {
        let dir = TempDir::new().unwrap();
        let open = || {
            let catalog = Arc::new(Catalog::open(CatalogConfig::durable(dir.path())).unwrap());
            HypertableManager::new(catalog, EngineConfig::default())
        };

        let (id, first) = {
            let manager = open();
            let id = time_table(&manager, 100);
            for name in ["A", "B", "C"] {
                manager.attach_tablespace(id, Tablespace::from(name)).unwrap();
            }
            let first = manager.insert_row(id, &row(0)).unwrap();
            manager.insert_row(id, &row(100)).unwrap();
            (id, first)
        };

        let manager = open();
        let found = manager.find_chunk_if_exists(id, &Point::new(vec![5])).unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(found.tablespace, Some(Tablespace::from("A")));

        let third = manager.insert_row(id, &row(200)).unwrap();
        assert_eq!(third.tablespace, Some(Tablespace::from("C")));
        assert_eq!(manager.chunks(id).unwrap().len(), 3);
    }
}
