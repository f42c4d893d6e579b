//! # Entities
//!
//! An entity is an id plus a record in the graph's arena: its class, its
//! lifecycle state, plain property values, and the link slots that connect
//! it to the rest of the graph.
//!
//! Records are removed from the arena once destruction completes; every
//! query on a removed id reports [`ManagedState::Destroyed`].

mod class;
mod emit;
mod lifecycle;
mod property;
mod snapshot;

pub use class::{ChildRelay, Class, ClassBuilder, EventHandler};
pub use lifecycle::{Lifecycle, Transition};
pub use snapshot::{EntitySnapshot, GraphSnapshot};

pub(crate) use lifecycle::LifecycleSlot;

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::component::{BoundRecord, ComponentNode};
use crate::container::ContainerState;
use crate::link::{LinkTable, SlotKey};
use crate::model::{EntityId, LinkId, ManagedState, ObserverId, Value};
use crate::observe::ObserverSlot;
use crate::{Error, Graph, Result};

// ============================================================================
// Arena
// ============================================================================

pub(crate) struct Arena {
    pub(crate) entities: HashMap<EntityId, EntityRecord>,
    pub(crate) links: LinkTable,
}

impl Arena {
    pub(crate) fn new(link_pool_size: usize) -> Self {
        Self { entities: HashMap::new(), links: LinkTable::new(link_pool_size) }
    }

    /// Record of a live (non-destroyed) entity.
    pub(crate) fn live(&self, id: EntityId) -> Result<&EntityRecord> {
        match self.entities.get(&id) {
            Some(record) if record.state.is_alive() => Ok(record),
            _ => Err(Error::Destroyed(id)),
        }
    }

    pub(crate) fn live_mut(&mut self, id: EntityId) -> Result<&mut EntityRecord> {
        match self.entities.get_mut(&id) {
            Some(record) if record.state.is_alive() => Ok(record),
            _ => Err(Error::Destroyed(id)),
        }
    }

    pub(crate) fn parent_of(&self, id: EntityId) -> Option<EntityId> {
        let link = self.entities.get(&id)?.parent?;
        self.links.get(link).map(|r| r.source)
    }
}

pub(crate) struct EntityRecord {
    pub(crate) id: EntityId,
    pub(crate) class: Class,
    pub(crate) state: ManagedState,
    /// Outbound links by key.
    pub(crate) slots: HashMap<SlotKey, LinkId>,
    /// Inbound links; each link records its own position here.
    pub(crate) inbound: SmallVec<[LinkId; 4]>,
    pub(crate) parent: Option<LinkId>,
    pub(crate) values: HashMap<String, Value>,
    pub(crate) container: Option<ContainerState>,
    pub(crate) lifecycle: LifecycleSlot,
    pub(crate) emit_depth: usize,
    pub(crate) observers: HashMap<ObserverId, ObserverSlot>,
    pub(crate) component: Option<ComponentNode>,
    /// Bindings this entity serves as bound parent for.
    pub(crate) bounds: Vec<BoundRecord>,
}

impl EntityRecord {
    fn new(id: EntityId, class: Class) -> Self {
        Self {
            id,
            class,
            state: ManagedState::Created,
            slots: HashMap::new(),
            inbound: SmallVec::new(),
            parent: None,
            values: HashMap::new(),
            container: None,
            lifecycle: LifecycleSlot::default(),
            emit_depth: 0,
            observers: HashMap::new(),
            component: None,
            bounds: Vec::new(),
        }
    }
}

// ============================================================================
// Graph: creation and queries
// ============================================================================

impl Graph {
    /// Create an entity of `class` in the `CREATED` state.
    pub fn create(&self, class: &Class) -> EntityId {
        let id = EntityId::next();

        let mut record = EntityRecord::new(id, class.clone());
        if let Some(kind) = class.container_kind() {
            record.container = Some(ContainerState::new(kind));
        }
        if class.is_component() {
            record.component = Some(ComponentNode::default());
            for (property, binding) in class.bindings() {
                if let Some(default) = binding.default_value() {
                    record.values.insert(property, default.clone());
                }
            }
        }
        self.inner.arena.borrow_mut().entities.insert(id, record);
        tracing::trace!(entity = %id, class = class.name(), "entity.create");
        id
    }

    /// Current lifecycle state. Unknown and removed ids are `DESTROYED`.
    pub fn state(&self, id: EntityId) -> ManagedState {
        self.inner
            .arena
            .borrow()
            .entities
            .get(&id)
            .map(|r| r.state)
            .unwrap_or(ManagedState::Destroyed)
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        self.state(id).is_alive()
    }

    pub(crate) fn ensure_alive(&self, id: EntityId) -> Result<()> {
        self.inner.arena.borrow().live(id).map(|_| ())
    }

    pub fn class_of(&self, id: EntityId) -> Option<Class> {
        self.inner.arena.borrow().entities.get(&id).map(|r| r.class.clone())
    }

    pub fn is_instance_of(&self, id: EntityId, class: &Class) -> bool {
        self.class_of(id).is_some_and(|c| c.is_subclass_of(class))
    }

    /// Owner of `id`, through its parent link.
    pub fn parent(&self, id: EntityId) -> Option<EntityId> {
        self.inner.arena.borrow().parent_of(id)
    }

    pub fn parent_link(&self, id: EntityId) -> Option<LinkId> {
        self.inner.arena.borrow().entities.get(&id).and_then(|r| r.parent)
    }

    /// Number of inbound links.
    pub fn reference_count(&self, id: EntityId) -> usize {
        self.inner.arena.borrow().entities.get(&id).map(|r| r.inbound.len()).unwrap_or(0)
    }

    /// Sources of inbound links, deduplicated, in link order.
    pub fn referrers(&self, id: EntityId) -> Vec<EntityId> {
        let arena = self.inner.arena.borrow();
        let Some(record) = arena.entities.get(&id) else {
            return Vec::new();
        };
        let mut sources: Vec<EntityId> = Vec::with_capacity(record.inbound.len());
        for link in &record.inbound {
            if let Some(r) = arena.links.get(*link) {
                if !sources.contains(&r.source) {
                    sources.push(r.source);
                }
            }
        }
        sources
    }

    /// Entities whose parent link originates at `id`.
    pub fn owned_children(&self, id: EntityId) -> Vec<EntityId> {
        let arena = self.inner.arena.borrow();
        let Some(record) = arena.entities.get(&id) else {
            return Vec::new();
        };
        let mut children: Vec<EntityId> = record
            .slots
            .values()
            .filter_map(|l| {
                let target = arena.links.get(*l)?.target;
                let owned = arena.entities.get(&target)?.parent == Some(*l);
                owned.then_some(target)
            })
            .collect();
        children.sort();
        children
    }

    /// Entities currently held in the arena, including ones mid-destruction.
    pub fn entity_count(&self) -> usize {
        self.inner.arena.borrow().entities.len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::link::LinkOptions;

    #[test]
    fn test_create_starts_in_created_state() {
        let graph = Graph::new();
        let id = graph.create(&Class::managed_object());
        assert_eq!(graph.state(id), ManagedState::Created);
        assert!(graph.is_alive(id));
        assert_eq!(graph.entity_count(), 1);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let graph = Graph::new();
        let a = graph.create(&Class::managed_object());
        let b = graph.create(&Class::managed_object());
        assert_ne!(a, b);
        assert!(b.0 > a.0);
    }

    #[test]
    fn test_unknown_id_reports_destroyed() {
        let graph = Graph::new();
        assert_eq!(graph.state(EntityId(999)), ManagedState::Destroyed);
        assert!(graph.parent(EntityId(999)).is_none());
        assert_eq!(graph.reference_count(EntityId(999)), 0);
    }

    #[test]
    fn test_instance_of_follows_class_chain() {
        let graph = Graph::new();
        let animal = Class::builder("Animal").build();
        let dog = Class::builder("Dog").extends(&animal).build();
        let rex = graph.create(&dog);
        assert!(graph.is_instance_of(rex, &animal));
        assert!(graph.is_instance_of(rex, &Class::managed_object()));
        assert!(!graph.is_instance_of(rex, &Class::list()));
    }

    #[test]
    fn test_referrers_are_deduplicated() {
        let graph = Graph::new();
        let a = graph.create(&Class::managed_object());
        let b = graph.create(&Class::managed_object());
        let target = graph.create(&Class::managed_object());
        graph.create_link(a, target, SlotKey::property("x"), LinkOptions::reference()).unwrap();
        graph.create_link(a, target, SlotKey::property("y"), LinkOptions::reference()).unwrap();
        graph.create_link(b, target, SlotKey::property("x"), LinkOptions::reference()).unwrap();

        assert_eq!(graph.reference_count(target), 3);
        assert_eq!(graph.referrers(target), vec![a, b]);
    }

    #[test]
    fn test_owned_children() {
        let graph = Graph::new();
        let owner = graph.create(&Class::managed_object());
        let kid = graph.create(&Class::managed_object());
        let other = graph.create(&Class::managed_object());
        graph.create_link(owner, kid, SlotKey::property("kid"), LinkOptions::child()).unwrap();
        graph
            .create_link(owner, other, SlotKey::property("other"), LinkOptions::reference())
            .unwrap();
        assert_eq!(graph.owned_children(owner), vec![kid]);
        assert_eq!(graph.parent(kid), Some(owner));
        assert_eq!(graph.parent(other), None);
    }
}
