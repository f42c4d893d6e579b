//! Graph snapshot: a serializable picture of every entity and link.
//!
//! Useful for debugging ownership problems and for asserting on whole-graph
//! shape in tests.
//!
//! ```text
//! Graph → snapshot() → GraphSnapshot → to_json() → {"entities": [...], "links": [...]}
//! ```

use std::collections::BTreeMap;

use serde::Serialize;

use crate::link::LinkInfo;
use crate::model::{EntityId, ManagedState, Value};
use crate::{Error, Graph, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub class: String,
    pub state: ManagedState,
    pub parent: Option<EntityId>,
    pub values: BTreeMap<String, Value>,
    pub reference_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSnapshot {
    /// Sorted by id.
    pub entities: Vec<EntitySnapshot>,
    /// Sorted by source, then link id.
    pub links: Vec<LinkInfo>,
    pub pooled_links: usize,
    pub allocated_link_slots: usize,
    pub pending_tasks: usize,
}

impl GraphSnapshot {
    pub fn entity(&self, id: EntityId) -> Option<&EntitySnapshot> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl Graph {
    pub fn snapshot(&self) -> GraphSnapshot {
        let arena = self.inner.arena.borrow();

        let mut entities: Vec<EntitySnapshot> = arena
            .entities
            .values()
            .map(|record| EntitySnapshot {
                id: record.id,
                class: record.class.name().to_string(),
                state: record.state,
                parent: arena.parent_of(record.id),
                values: record.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                reference_count: record.inbound.len(),
            })
            .collect();
        entities.sort_by_key(|e| e.id);

        let mut links: Vec<LinkInfo> =
            arena.links.iter().filter_map(|(id, _)| arena.link_info(id)).collect();
        links.sort_by_key(|l| (l.source, l.id.index(), l.id.generation()));

        GraphSnapshot {
            entities,
            links,
            pooled_links: arena.links.pooled(),
            allocated_link_slots: arena.links.allocated(),
            pending_tasks: self.pending_tasks(),
        }
    }
}
