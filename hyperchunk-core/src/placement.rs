//! Data-node placement for distributed hypertables
//!
//! A new chunk of a distributed hypertable is replicated on
//! `replication_factor` data nodes. Nodes holding the fewest chunks of the
//! hypertable are preferred; ties go to the lowest node name so placement is
//! reproducible for identical catalog state.

use crate::catalog::NodeRegistry;
use crate::hypercube::Hypercube;
use crate::hypertable::HypertableRecord;
use crate::{HyperError, NodeId, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Chooses the data nodes for new chunks
pub struct PlacementEngine {
    nodes: Arc<dyn NodeRegistry>,
}

impl PlacementEngine {
    pub fn new(nodes: Arc<dyn NodeRegistry>) -> Self {
        Self { nodes }
    }

    /// Candidate pool: the hypertable's own node list restricted to
    /// available nodes, or every available node when no list is set.
    pub fn available_data_nodes(&self, hypertable: &HypertableRecord) -> Result<Vec<NodeId>> {
        let available = self.nodes.available_nodes()?;
        let pool = match &hypertable.data_nodes {
            Some(configured) => configured
                .iter()
                .filter(|n| available.contains(*n))
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            None => available.into_iter().collect(),
        };
        Ok(pool)
    }

    /// Select the data nodes that will hold a new chunk's replicas
    pub fn assign_chunk_data_nodes(
        &self,
        hypertable: &HypertableRecord,
        hypercube: &Hypercube,
    ) -> Result<Vec<NodeId>> {
        if !hypertable.is_distributed() {
            return Err(HyperError::Validation(format!(
                "hypertable {} is not distributed",
                hypertable.qualified_name()
            )));
        }

        let mut pool = self.available_data_nodes(hypertable)?;
        let required = hypertable.replication_factor as usize;
        if required > pool.len() {
            return Err(HyperError::Placement {
                required,
                available: pool.len(),
            });
        }

        let counts = self.nodes.chunk_count_per_node(hypertable.id)?;
        pool.sort_by(|a, b| {
            let load_a = counts.get(a).copied().unwrap_or(0);
            let load_b = counts.get(b).copied().unwrap_or(0);
            load_a.cmp(&load_b).then_with(|| a.cmp(b))
        });
        pool.truncate(required);

        debug!(
            "Placed chunk {} of hypertable {} on {:?}",
            hypercube,
            hypertable.id,
            pool
        );
        Ok(pool)
    }
}
