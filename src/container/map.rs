//! String-keyed map of entities. One target may sit under several keys.

use super::{check_candidate, ensure_kind, member_ownership, notify, Container, ContainerKind};
use crate::entity::Class;
use crate::link::{Relay, SlotKey, Unlink};
use crate::model::{ContainerChange, EntityId, LinkId, ManagedEvent};
use crate::{Graph, Result};

#[derive(Clone)]
pub struct ManagedMap {
    graph: Graph,
    id: EntityId,
}

impl Graph {
    pub fn create_map(&self) -> ManagedMap {
        ManagedMap { graph: self.clone(), id: self.create(&Class::map()) }
    }
}

fn keyed(change: ContainerChange, target: EntityId, key: &str) -> ManagedEvent {
    ManagedEvent::container(change, Some(target)).with_data("key", key)
}

impl ManagedMap {
    pub fn from_entity(graph: &Graph, id: EntityId) -> Result<Self> {
        ensure_kind(graph, id, ContainerKind::Map)?;
        Ok(Self { graph: graph.clone(), id })
    }

    fn entry(&self, key: &str) -> Option<(LinkId, EntityId)> {
        let arena = self.graph.inner.arena.borrow();
        let link = *arena.entities.get(&self.id)?.slots.get(&SlotKey::Key(key.to_string()))?;
        arena.links.get(link).map(|r| (link, r.target))
    }

    /// Entries sorted by key.
    fn entry_links(&self) -> Vec<(String, LinkId, EntityId)> {
        let arena = self.graph.inner.arena.borrow();
        let Some(record) = arena.entities.get(&self.id) else {
            return Vec::new();
        };
        let mut entries: Vec<(String, LinkId, EntityId)> = record
            .slots
            .iter()
            .filter_map(|(slot, link)| match slot {
                SlotKey::Key(key) => arena.links.get(*link).map(|r| (key.clone(), *link, r.target)),
                _ => None,
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Map `key` to `target`, replacing any previous mapping. Setting the
    /// current mapping again does nothing.
    pub fn set(&self, key: &str, target: EntityId) -> Result<()> {
        self.graph.ensure_alive(self.id)?;
        let current = self.entry(key);
        if current.is_some_and(|(_, t)| t == target) {
            return Ok(());
        }
        check_candidate(&self.graph, self.id, target)?;

        if let Some((link, previous)) = current {
            self.graph.discard_link(link);
            notify(&self.graph, self.id, keyed(ContainerChange::Remove, previous, key));
        }
        let ownership = member_ownership(&self.graph, self.id);
        self.graph.link_entities(
            self.id,
            target,
            SlotKey::Key(key.to_string()),
            ownership,
            Relay::Container,
            Unlink::Container,
            None,
        )?;
        notify(&self.graph, self.id, keyed(ContainerChange::Add, target, key));
        Ok(())
    }

    /// Remove the mapping for `key`, returning its target.
    pub fn unset(&self, key: &str) -> Result<Option<EntityId>> {
        self.graph.ensure_alive(self.id)?;
        let Some((link, target)) = self.entry(key) else {
            return Ok(None);
        };
        self.graph.discard_link(link);
        notify(&self.graph, self.id, keyed(ContainerChange::Remove, target, key));
        Ok(Some(target))
    }

    /// Remove every key mapped to `target` with a single `Remove` event.
    /// Returns the number of keys removed.
    pub fn remove(&self, target: EntityId) -> Result<usize> {
        self.graph.ensure_alive(self.id)?;
        let links: Vec<LinkId> = self
            .entry_links()
            .into_iter()
            .filter(|(_, _, t)| *t == target)
            .map(|(_, link, _)| link)
            .collect();
        if links.is_empty() {
            return Ok(0);
        }
        for link in &links {
            self.graph.discard_link(*link);
        }
        let event = ManagedEvent::container(ContainerChange::Remove, Some(target));
        notify(&self.graph, self.id, event);
        Ok(links.len())
    }

    pub fn get(&self, key: &str) -> Option<EntityId> {
        self.entry(key).map(|(_, t)| t)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entry_links().into_iter().map(|(k, _, _)| k).collect()
    }

    pub fn entries(&self) -> Vec<(String, EntityId)> {
        self.entry_links().into_iter().map(|(k, _, t)| (k, t)).collect()
    }

    /// Mapped targets in key order, each listed once.
    pub fn targets(&self) -> Vec<EntityId> {
        let mut targets: Vec<EntityId> = Vec::new();
        for (_, _, target) in self.entry_links() {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }
}

impl Container for ManagedMap {
    fn graph(&self) -> &Graph {
        &self.graph
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn members(&self) -> Vec<EntityId> {
        self.targets()
    }

    fn clear(&self) -> Result<()> {
        self.graph.ensure_alive(self.id)?;
        for (key, link, target) in self.entry_links() {
            if self.graph.discard_link(link) {
                notify(&self.graph, self.id, keyed(ContainerChange::Remove, target, &key));
            }
        }
        Ok(())
    }

    /// Number of keys.
    fn count(&self) -> usize {
        self.entry_links().len()
    }
}

impl std::fmt::Debug for ManagedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedMap")
            .field("id", &self.id)
            .field("entries", &self.entries())
            .finish()
    }
}
