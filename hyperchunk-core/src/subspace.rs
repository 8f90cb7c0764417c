//! Boundary cache ("subspace store")
//!
//! A process-local, size-bounded index of recently seen chunk hypercubes.
//! The index is a tree with one level per dimension: time levels keep their
//! slices ordered for range search, space levels index unit slices by
//! partition so a lookup is an exact match. A miss only means the metadata
//! store has to be consulted.

use crate::chunk::Chunk;
use crate::dimension::{DimensionSlice, Hyperspace, Point};
use crate::ChunkId;
use lru::LruCache;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SliceLookup {
    /// Range search over ordered slices
    Ordered,
    /// Exact match on the partition index
    Exact,
}

#[derive(Debug)]
enum Subspace {
    Ordered {
        slices: BTreeMap<DimensionSlice, Subspace>,
        /// Widest slice ever stored, bounds the range search
        max_width: i64,
    },
    Exact {
        units: HashMap<i64, Subspace>,
        /// Non-unit slices, e.g. the all-covering slice of an added dimension
        wide: BTreeMap<DimensionSlice, Subspace>,
    },
    Leaf(ChunkId),
}

impl Subspace {
    fn level(lookup: SliceLookup) -> Self {
        match lookup {
            SliceLookup::Ordered => Subspace::Ordered {
                slices: BTreeMap::new(),
                max_width: 0,
            },
            SliceLookup::Exact => Subspace::Exact {
                units: HashMap::new(),
                wide: BTreeMap::new(),
            },
        }
    }

    fn get(&self, slice: &DimensionSlice) -> Option<&Subspace> {
        match self {
            Subspace::Ordered { slices, .. } => slices.get(slice),
            Subspace::Exact { units, .. } if slice.is_unit() => units.get(&slice.range_start),
            Subspace::Exact { wide, .. } => wide.get(slice),
            Subspace::Leaf(_) => None,
        }
    }

    fn get_mut(&mut self, slice: &DimensionSlice) -> Option<&mut Subspace> {
        match self {
            Subspace::Ordered { slices, .. } => slices.get_mut(slice),
            Subspace::Exact { units, .. } if slice.is_unit() => units.get_mut(&slice.range_start),
            Subspace::Exact { wide, .. } => wide.get_mut(slice),
            Subspace::Leaf(_) => None,
        }
    }

    fn put(&mut self, slice: DimensionSlice, child: Subspace) -> Option<Subspace> {
        match self {
            Subspace::Ordered { slices, max_width } => {
                *max_width = (*max_width).max(slice.range_end.saturating_sub(slice.range_start));
                slices.insert(slice, child)
            }
            Subspace::Exact { units, .. } if slice.is_unit() => units.insert(slice.range_start, child),
            Subspace::Exact { wide, .. } => wide.insert(slice, child),
            Subspace::Leaf(_) => None,
        }
    }

    fn remove(&mut self, slice: &DimensionSlice) -> Option<Subspace> {
        match self {
            Subspace::Ordered { slices, .. } => slices.remove(slice),
            Subspace::Exact { units, .. } if slice.is_unit() => units.remove(&slice.range_start),
            Subspace::Exact { wide, .. } => wide.remove(slice),
            Subspace::Leaf(_) => None,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Subspace::Ordered { slices, .. } => slices.is_empty(),
            Subspace::Exact { units, wide } => units.is_empty() && wide.is_empty(),
            Subspace::Leaf(_) => false,
        }
    }
}

fn find(node: &Subspace, coordinates: &[i64]) -> Option<ChunkId> {
    if let Subspace::Leaf(id) = node {
        return coordinates.is_empty().then_some(*id);
    }
    let (&coordinate, rest) = coordinates.split_first()?;
    match node {
        Subspace::Ordered { slices, max_width } => {
            // A slice holding the coordinate starts within `max_width` below it
            let low = DimensionSlice::new(coordinate.saturating_sub(*max_width), DimensionSlice::MIN_VALUE);
            let high = DimensionSlice::new(coordinate, DimensionSlice::MAX_VALUE);
            slices
                .range(low..=high)
                .rev()
                .filter(|(slice, _)| slice.contains(coordinate))
                .find_map(|(_, child)| find(child, rest))
        }
        Subspace::Exact { units, wide } => units
            .get(&coordinate)
            .and_then(|child| find(child, rest))
            .or_else(|| {
                wide.iter()
                    .filter(|(slice, _)| slice.contains(coordinate))
                    .find_map(|(_, child)| find(child, rest))
            }),
        Subspace::Leaf(_) => None,
    }
}

fn insert(
    node: &mut Subspace,
    lookups: &[SliceLookup],
    slices: &[DimensionSlice],
    id: ChunkId,
) -> Option<ChunkId> {
    let (slice, rest) = slices.split_first()?;
    if rest.is_empty() {
        return match node.put(*slice, Subspace::Leaf(id)) {
            Some(Subspace::Leaf(old)) if old != id => Some(old),
            _ => None,
        };
    }
    if node.get(slice).is_none() {
        node.put(*slice, Subspace::level(lookups[1]));
    }
    let child = node.get_mut(slice)?;
    insert(child, &lookups[1..], rest, id)
}

fn remove(node: &mut Subspace, slices: &[DimensionSlice], id: ChunkId) -> bool {
    let Some((slice, rest)) = slices.split_first() else {
        return false;
    };
    if rest.is_empty() {
        return match node.get(slice) {
            Some(Subspace::Leaf(existing)) if *existing == id => {
                node.remove(slice);
                true
            }
            _ => false,
        };
    }
    let Some(child) = node.get_mut(slice) else {
        return false;
    };
    let removed = remove(child, rest, id);
    let prune = removed && child.is_empty();
    if prune {
        node.remove(slice);
    }
    removed
}

/// Per-hypertable boundary cache with least-recently-used eviction
pub struct SubspaceStore {
    lookups: Vec<SliceLookup>,
    root: Subspace,
    entries: LruCache<ChunkId, Arc<Chunk>>,
    stats: CacheStats,
}

impl SubspaceStore {
    /// Create an empty cache shaped after `space`
    pub fn new(space: &Hyperspace, capacity: usize) -> Self {
        let lookups = Self::lookups_for(space);
        let root = Self::root_for(&lookups);
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            lookups,
            root,
            entries: LruCache::new(capacity),
            stats: CacheStats::default(),
        }
    }

    fn lookups_for(space: &Hyperspace) -> Vec<SliceLookup> {
        space
            .iter()
            .map(|d| {
                if d.is_time() {
                    SliceLookup::Ordered
                } else {
                    SliceLookup::Exact
                }
            })
            .collect()
    }

    fn root_for(lookups: &[SliceLookup]) -> Subspace {
        Subspace::level(lookups.first().copied().unwrap_or(SliceLookup::Ordered))
    }

    /// Find the cached chunk containing `point`
    pub fn lookup(&mut self, point: &Point) -> Option<Arc<Chunk>> {
        let found = if point.len() == self.lookups.len() {
            find(&self.root, &point.coordinates)
        } else {
            None
        };
        // `get` also marks the entry as most recently used
        match found.and_then(|id| self.entries.get(&id).cloned()) {
            Some(chunk) => {
                self.stats.hits += 1;
                Some(chunk)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Add or replace the entry for a chunk.
    ///
    /// Chunks whose hypercube does not match the cache's dimensionality are
    /// not cached.
    pub fn insert(&mut self, chunk: Arc<Chunk>) -> bool {
        if chunk.hypercube.num_slices() != self.lookups.len() {
            return false;
        }
        let id = chunk.id;
        if let Some(previous) = self.entries.pop(&id) {
            remove(&mut self.root, &previous.hypercube.slices, id);
        }

        if let Some(displaced) = insert(&mut self.root, &self.lookups, &chunk.hypercube.slices, id) {
            self.entries.pop(&displaced);
        }

        if let Some((evicted_id, evicted)) = self.entries.push(id, chunk) {
            remove(&mut self.root, &evicted.hypercube.slices, evicted_id);
            self.stats.evictions += 1;
        }
        true
    }

    /// Drop the entry for one chunk
    pub fn remove(&mut self, id: ChunkId) -> bool {
        match self.entries.pop(&id) {
            Some(chunk) => {
                remove(&mut self.root, &chunk.hypercube.slices, id);
                true
            }
            None => false,
        }
    }

    /// Clear every entry
    pub fn invalidate_all(&mut self) {
        self.root = Self::root_for(&self.lookups);
        self.entries.clear();
    }

    /// Clear every entry and adopt a new dimension layout
    pub fn reset(&mut self, space: &Hyperspace) {
        self.lookups = Self::lookups_for(space);
        self.invalidate_all();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionSpec;
    use crate::hypercube::Hypercube;
    use crate::HypertableId;

    fn space_2d() -> Hyperspace {
        Hyperspace::new(vec![
            DimensionSpec::time("time", 100),
            DimensionSpec::space("device", 4),
        ])
        .unwrap()
    }

    fn chunk(id: i32, slices: &[(i64, i64)]) -> Arc<Chunk> {
        Arc::new(Chunk {
            id: ChunkId(id),
            hypertable_id: HypertableId(1),
            schema_name: "_hyper_internal".into(),
            table_name: format!("_hyper_1_{}_chunk", id),
            hypercube: Hypercube::new(
                slices.iter().map(|&(s, e)| DimensionSlice::new(s, e)).collect(),
            ),
            tablespace: None,
            data_nodes: Vec::new(),
            dropped: false,
        })
    }

    #[test]
    fn test_lookup_requires_all_dimensions() {
        let mut cache = SubspaceStore::new(&space_2d(), 16);
        cache.insert(chunk(1, &[(0, 100), (0, 1)]));
        cache.insert(chunk(2, &[(0, 100), (1, 2)]));
        cache.insert(chunk(3, &[(100, 200), (1, 2)]));

        assert_eq!(cache.lookup(&Point::new(vec![50, 0])).unwrap().id, ChunkId(1));
        assert_eq!(cache.lookup(&Point::new(vec![50, 1])).unwrap().id, ChunkId(2));
        assert_eq!(cache.lookup(&Point::new(vec![150, 1])).unwrap().id, ChunkId(3));
        assert!(cache.lookup(&Point::new(vec![150, 0])).is_none());
        assert!(cache.lookup(&Point::new(vec![250, 1])).is_none());
        // Wrong dimensionality is a plain miss
        assert!(cache.lookup(&Point::new(vec![50])).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.entries, 3);
    }

    #[test]
    fn test_overlapping_time_slices() {
        // Different widths on different partitions
        let mut cache = SubspaceStore::new(&space_2d(), 16);
        cache.insert(chunk(1, &[(0, 100), (0, 1)]));
        cache.insert(chunk(2, &[(0, 200), (1, 2)]));
        cache.insert(chunk(3, &[(100, 150), (0, 1)]));

        assert_eq!(cache.lookup(&Point::new(vec![120, 1])).unwrap().id, ChunkId(2));
        assert_eq!(cache.lookup(&Point::new(vec![120, 0])).unwrap().id, ChunkId(3));
        assert_eq!(cache.lookup(&Point::new(vec![10, 1])).unwrap().id, ChunkId(2));
    }

    #[test]
    fn test_wide_space_slice() {
        let mut cache = SubspaceStore::new(&space_2d(), 16);
        cache.insert(chunk(1, &[(0, 100), (i64::MIN, i64::MAX)]));
        cache.insert(chunk(2, &[(100, 200), (3, 4)]));

        for partition in 0..4 {
            assert_eq!(cache.lookup(&Point::new(vec![5, partition])).unwrap().id, ChunkId(1));
        }
        assert_eq!(cache.lookup(&Point::new(vec![105, 3])).unwrap().id, ChunkId(2));
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = SubspaceStore::new(&space_2d(), 2);
        cache.insert(chunk(1, &[(0, 100), (0, 1)]));
        cache.insert(chunk(2, &[(100, 200), (0, 1)]));

        // Touch chunk 1 so chunk 2 becomes the eviction victim
        assert!(cache.lookup(&Point::new(vec![1, 0])).is_some());
        cache.insert(chunk(3, &[(200, 300), (0, 1)]));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&Point::new(vec![150, 0])).is_none());
        assert!(cache.lookup(&Point::new(vec![1, 0])).is_some());
        assert!(cache.lookup(&Point::new(vec![250, 0])).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replace_and_remove() {
        let mut cache = SubspaceStore::new(&space_2d(), 16);
        cache.insert(chunk(1, &[(0, 100), (0, 1)]));
        // Same chunk with a new hypercube moves
        cache.insert(chunk(1, &[(0, 100), (i64::MIN, i64::MAX)]));
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&Point::new(vec![5, 2])).is_some());

        // Another chunk at the same coordinates displaces the old one
        cache.insert(chunk(7, &[(0, 100), (i64::MIN, i64::MAX)]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&Point::new(vec![5, 2])).unwrap().id, ChunkId(7));

        assert!(cache.remove(ChunkId(7)));
        assert!(cache.is_empty());
        assert!(cache.lookup(&Point::new(vec![5, 2])).is_none());
    }

    #[test]
    fn test_invalidate_and_reset() {
        let mut cache = SubspaceStore::new(&space_2d(), 16);
        cache.insert(chunk(1, &[(0, 100), (0, 1)]));
        cache.invalidate_all();
        assert!(cache.lookup(&Point::new(vec![5, 0])).is_none());

        let one_dim = Hyperspace::new(vec![DimensionSpec::time("time", 100)]).unwrap();
        cache.reset(&one_dim);
        // Two-slice cubes no longer fit
        assert!(!cache.insert(chunk(2, &[(0, 100), (0, 1)])));
        assert!(cache.insert(chunk(3, &[(0, 100)])));
        assert_eq!(cache.lookup(&Point::new(vec![5])).unwrap().id, ChunkId(3));
    }

    #[test]
    fn test_range_search_spans_mixed_widths() {
        let one_dim = Hyperspace::new(vec![DimensionSpec::time("time", 100)]).unwrap();
        let mut cache = SubspaceStore::new(&one_dim, 64);
        for i in 0..20 {
            cache.insert(chunk(i + 1, &[(i as i64 * 10, i as i64 * 10 + 10)]));
        }
        // Wide slices on both sides of the narrow ones
        cache.insert(chunk(100, &[(-10_000, -100)]));
        cache.insert(chunk(101, &[(1_000, 5_000)]));

        assert_eq!(cache.lookup(&Point::new(vec![4_999])).unwrap().id, ChunkId(101));
        assert_eq!(cache.lookup(&Point::new(vec![-5_000])).unwrap().id, ChunkId(100));
        assert_eq!(cache.lookup(&Point::new(vec![195])).unwrap().id, ChunkId(20));
        assert!(cache.lookup(&Point::new(vec![500])).is_none());
        assert!(cache.lookup(&Point::new(vec![-100])).is_none());
        assert_eq!(cache.capacity(), 64);
    }
}
