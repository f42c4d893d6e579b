//! Event values emitted by entities.
//!
//! Events are frozen once created: a [`ManagedEvent`] is a shared handle to
//! immutable data, so the same instance can be relayed along any number of
//! links without copying. The core lifecycle events (`Active`, `Inactive`,
//! `Destroyed`) are per-thread singletons.

use std::rc::Rc;

use super::{EntityId, PropertyMap, Value};

/// Reserved event names.
pub mod names {
    pub const ACTIVE: &str = "Active";
    pub const INACTIVE: &str = "Inactive";
    pub const DESTROYED: &str = "Destroyed";
    pub const CHANGE: &str = "Change";
    pub const ADD: &str = "Add";
    pub const REMOVE: &str = "Remove";
    pub const REORDER: &str = "Reorder";
}

/// Kind of membership change reported by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerChange {
    Add,
    Remove,
    Reorder,
}

impl ContainerChange {
    pub fn name(self) -> &'static str {
        match self {
            ContainerChange::Add => names::ADD,
            ContainerChange::Remove => names::REMOVE,
            ContainerChange::Reorder => names::REORDER,
        }
    }
}

/// Event classification.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Application-defined event.
    Plain,
    /// Reserved lifecycle event.
    Core,
    /// Generic change notification.
    Change,
    /// Container membership change.
    Container {
        change: ContainerChange,
        object: Option<EntityId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct EventData {
    name: String,
    kind: EventKind,
    data: PropertyMap,
}

/// An immutable, cheaply cloneable event.
#[derive(Debug, Clone)]
pub struct ManagedEvent(Rc<EventData>);

thread_local! {
    static ACTIVE_EVENT: ManagedEvent = ManagedEvent::core(names::ACTIVE);
    static INACTIVE_EVENT: ManagedEvent = ManagedEvent::core(names::INACTIVE);
    static DESTROYED_EVENT: ManagedEvent = ManagedEvent::core(names::DESTROYED);
}

impl ManagedEvent {
    /// Plain named event.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_kind(name, EventKind::Plain)
    }

    /// Generic change event (`Change` unless named otherwise).
    pub fn change() -> Self {
        Self::with_kind(names::CHANGE, EventKind::Change)
    }

    /// Named change event.
    pub fn named_change(name: impl Into<String>) -> Self {
        Self::with_kind(name, EventKind::Change)
    }

    /// Container membership change.
    pub fn container(change: ContainerChange, object: Option<EntityId>) -> Self {
        Self::with_kind(change.name(), EventKind::Container { change, object })
    }

    pub fn active() -> Self {
        ACTIVE_EVENT.with(Clone::clone)
    }

    pub fn inactive() -> Self {
        INACTIVE_EVENT.with(Clone::clone)
    }

    pub fn destroyed() -> Self {
        DESTROYED_EVENT.with(Clone::clone)
    }

    fn core(name: &str) -> Self {
        Self::with_kind(name, EventKind::Core)
    }

    fn with_kind(name: impl Into<String>, kind: EventKind) -> Self {
        Self(Rc::new(EventData {
            name: name.into(),
            kind,
            data: PropertyMap::new(),
        }))
    }

    /// Attach a data entry. Copies the payload if this instance is already shared.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Rc::make_mut(&mut self.0).data.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &EventKind {
        &self.0.kind
    }

    pub fn data(&self) -> &PropertyMap {
        &self.0.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.data.get(key)
    }

    pub fn is_core(&self) -> bool {
        matches!(self.0.kind, EventKind::Core)
    }

    /// Change-type events: generic changes and container changes.
    pub fn is_change(&self) -> bool {
        matches!(self.0.kind, EventKind::Change | EventKind::Container { .. })
    }

    /// The container change carried by this event, if any.
    pub fn container_change(&self) -> Option<(ContainerChange, Option<EntityId>)> {
        match self.0.kind {
            EventKind::Container { change, object } => Some((change, object)),
            _ => None,
        }
    }

    pub(crate) fn is_destroyed_core(&self) -> bool {
        self.is_core() && self.0.name == names::DESTROYED
    }

    /// True when both handles refer to the same frozen instance.
    pub fn ptr_eq(&self, other: &ManagedEvent) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for ManagedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl std::fmt::Display for ManagedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_events_are_singletons() {
        assert!(ManagedEvent::active().ptr_eq(&ManagedEvent::active()));
        assert!(ManagedEvent::destroyed().is_destroyed_core());
        assert!(!ManagedEvent::new(names::DESTROYED).is_destroyed_core());
    }

    #[test]
    fn test_with_data_does_not_mutate_shared_instance() {
        let base = ManagedEvent::new("Click");
        let shared = base.clone();
        let extended = base.with_data("x", 1);
        assert!(shared.data().is_empty());
        assert_eq!(extended.get("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_change_classification() {
        assert!(ManagedEvent::change().is_change());
        assert!(ManagedEvent::container(ContainerChange::Add, Some(EntityId(1))).is_change());
        assert!(!ManagedEvent::new("Click").is_change());
        assert!(!ManagedEvent::inactive().is_change());
    }
}
