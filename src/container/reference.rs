//! Single-slot reference container.

use super::{
    check_candidate, ensure_kind, member_ownership, notify_change, Container, ContainerKind,
};
use crate::entity::Class;
use crate::link::{Relay, SlotKey, Unlink};
use crate::model::{ContainerChange, EntityId, LinkId};
use crate::{Graph, Result};

#[derive(Clone)]
pub struct ManagedRef {
    graph: Graph,
    id: EntityId,
}

impl Graph {
    pub fn create_ref(&self) -> ManagedRef {
        ManagedRef { graph: self.clone(), id: self.create(&Class::reference()) }
    }
}

impl ManagedRef {
    pub fn from_entity(graph: &Graph, id: EntityId) -> Result<Self> {
        ensure_kind(graph, id, ContainerKind::Reference)?;
        Ok(Self { graph: graph.clone(), id })
    }

    fn slot(&self) -> Option<(LinkId, EntityId)> {
        let arena = self.graph.inner.arena.borrow();
        let link = *arena.entities.get(&self.id)?.slots.get(&SlotKey::Ref)?;
        arena.links.get(link).map(|r| (link, r.target))
    }

    /// Point at `target`, or clear with `None`. Same target is a no-op.
    pub fn set(&self, target: Option<EntityId>) -> Result<()> {
        self.graph.ensure_alive(self.id)?;
        let current = self.slot();
        if current.map(|(_, t)| t) == target {
            return Ok(());
        }
        if let Some(t) = target {
            check_candidate(&self.graph, self.id, t)?;
        }
        if let Some((link, previous)) = current {
            if self.graph.discard_link(link) {
                notify_change(&self.graph, self.id, ContainerChange::Remove, Some(previous));
            }
        }
        if let Some(t) = target {
            let ownership = member_ownership(&self.graph, self.id);
            self.graph
                .link_entities(
                    self.id,
                    t,
                    SlotKey::Ref,
                    ownership,
                    Relay::Container,
                    Unlink::Container,
                    None,
                )?;
            notify_change(&self.graph, self.id, ContainerChange::Add, Some(t));
        }
        Ok(())
    }

    pub fn get(&self) -> Option<EntityId> {
        self.slot().map(|(_, t)| t)
    }
}

impl Container for ManagedRef {
    fn graph(&self) -> &Graph {
        &self.graph
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn members(&self) -> Vec<EntityId> {
        self.get().into_iter().collect()
    }

    fn clear(&self) -> Result<()> {
        self.set(None)
    }
}

impl std::fmt::Debug for ManagedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedRef").field("id", &self.id).field("target", &self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ref_follows_target_destruction() {
        let graph = Graph::new();
        let reference = graph.create_ref();
        let target = graph.create(&Class::managed_object());
        reference.set(Some(target)).unwrap();
        assert_eq!(reference.get(), Some(target));

        graph.destroy(target).await.unwrap();
        assert_eq!(reference.get(), None);
        assert!(reference.is_empty());
    }

    #[test]
    fn test_clear() {
        let graph = Graph::new();
        let reference = graph.create_ref();
        let target = graph.create(&Class::managed_object());
        reference.set(Some(target)).unwrap();
        reference.clear().unwrap();
        assert_eq!(reference.get(), None);
        assert_eq!(graph.reference_count(target), 0);
    }
}
