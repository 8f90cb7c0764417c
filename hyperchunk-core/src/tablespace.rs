//! Tablespace selection for new chunks
//!
//! Chunks rotate through the hypertable's attached tablespaces. The rotation
//! offset lives in the hypertable record and is only advanced when a chunk
//! is actually persisted.

use crate::catalog::TablespaceRegistry;
use crate::hypercube::Hypercube;
use crate::hypertable::HypertableRecord;
use crate::{HyperError, HypertableId, Result, Tablespace};
use std::sync::Arc;
use tracing::debug;

/// Outcome of a tablespace selection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TablespaceSelection {
    /// `None` selects the default tablespace
    pub tablespace: Option<Tablespace>,
    /// Offset to store once the chunk is persisted
    pub next_offset: Option<u64>,
}

/// Round-robin tablespace selector
pub struct TablespaceSelector {
    registry: Arc<dyn TablespaceRegistry>,
}

impl TablespaceSelector {
    pub fn new(registry: Arc<dyn TablespaceRegistry>) -> Self {
        Self { registry }
    }

    /// Pick the tablespace for a chunk covering `hypercube`
    pub fn select_tablespace(
        &self,
        hypertable: &HypertableRecord,
        hypercube: &Hypercube,
    ) -> Result<TablespaceSelection> {
        let tablespaces = self.registry.tablespaces_for(hypertable.id)?;
        if tablespaces.is_empty() {
            return Ok(TablespaceSelection::default());
        }

        let offset = hypertable.tablespace_offset;
        let index = (offset % tablespaces.len() as u64) as usize;
        let tablespace = tablespaces[index].clone();
        debug!(
            "Selected tablespace {} (offset {}) for chunk {} of hypertable {}",
            tablespace, offset, hypercube, hypertable.id
        );

        Ok(TablespaceSelection {
            tablespace: Some(tablespace),
            next_offset: Some(offset.wrapping_add(1)),
        })
    }

    /// The tablespace `offset` positions after `tablespace` in attachment order
    pub fn tablespace_at_offset_from(
        &self,
        id: HypertableId,
        tablespace: &Tablespace,
        offset: i64,
    ) -> Result<Option<Tablespace>> {
        let tablespaces = self.registry.tablespaces_for(id)?;
        if tablespaces.is_empty() {
            return Ok(None);
        }
        let position = tablespaces
            .iter()
            .position(|t| t == tablespace)
            .ok_or_else(|| {
                HyperError::NotFound(format!(
                    "tablespace \"{}\" is not attached to hypertable {}",
                    tablespace, id
                ))
            })?;
        let index = (position as i64 + offset).rem_euclid(tablespaces.len() as i64) as usize;
        Ok(Some(tablespaces[index].clone()))
    }
}
