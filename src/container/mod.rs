//! # Containers
//!
//! Lists, maps and single references are entities whose members are held
//! through links. Membership changes emit `Add`/`Remove`/`Reorder` container
//! events on the container itself.
//!
//! ## Ownership
//!
//! A container owns its members (child links) when it is not weak and is
//! itself owned. A container that becomes owned adopts every member that has
//! no owner yet; members that already belong elsewhere stay where they are.
//! Removing an owned member destroys it on the next scheduler pass unless it
//! has been given a new owner by then.

mod list;
mod map;
mod reference;

pub use list::{ListIter, ManagedList};
pub use map::ManagedMap;
pub use reference::ManagedRef;

use crate::entity::Class;
use crate::link::{LinkInfo, Ownership, SlotKey};
use crate::model::{ContainerChange, EntityId, LinkId, ManagedEvent};
use crate::{Error, Graph, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContainerKind {
    List,
    Map,
    Reference,
}

/// Which member events a container re-emits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum Propagation {
    #[default]
    Off,
    All,
    Only(Vec<String>),
}

impl Propagation {
    fn matches(&self, event: &ManagedEvent) -> bool {
        match self {
            Propagation::Off => false,
            Propagation::All => true,
            Propagation::Only(names) => names.iter().any(|n| n == event.name()),
        }
    }
}

pub(crate) struct ContainerState {
    pub(crate) kind: ContainerKind,
    pub(crate) propagation: Propagation,
    pub(crate) weak: bool,
    pub(crate) restrict: Option<Class>,
    pub(crate) head: Option<LinkId>,
    pub(crate) tail: Option<LinkId>,
    /// Chained (list) members.
    pub(crate) count: usize,
}

impl ContainerState {
    pub(crate) fn new(kind: ContainerKind) -> Self {
        Self {
            kind,
            propagation: Propagation::Off,
            weak: false,
            restrict: None,
            head: None,
            tail: None,
            count: 0,
        }
    }
}

fn is_member_key(key: &SlotKey) -> bool {
    matches!(key, SlotKey::Member(_) | SlotKey::Key(_) | SlotKey::Ref)
}

/// Operations shared by every container handle.
pub trait Container {
    fn graph(&self) -> &Graph;

    fn id(&self) -> EntityId;

    /// Current members in container order, without duplicates.
    fn members(&self) -> Vec<EntityId>;

    /// Remove every member, emitting one `Remove` per removal.
    fn clear(&self) -> Result<()>;

    fn count(&self) -> usize {
        self.members().len()
    }

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn includes(&self, item: EntityId) -> bool {
        self.members().contains(&item)
    }

    /// Re-emit member events on the container. An empty filter forwards
    /// every non-core event.
    fn propagate_events(&self, names: &[&str]) -> Result<()> {
        let propagation = if names.is_empty() {
            Propagation::All
        } else {
            Propagation::Only(names.iter().map(|n| n.to_string()).collect())
        };
        with_state(self.graph(), self.id(), |state| state.propagation = propagation)
    }

    fn stop_propagation(&self) -> Result<()> {
        with_state(self.graph(), self.id(), |state| state.propagation = Propagation::Off)
    }

    /// Never own members, even when the container itself is owned. Already
    /// owned members keep their owner.
    fn weak(&self) -> Result<()> {
        with_state(self.graph(), self.id(), |state| state.weak = true)
    }

    fn is_weak(&self) -> bool {
        let arena = self.graph().inner.arena.borrow();
        arena
            .entities
            .get(&self.id())
            .and_then(|r| r.container.as_ref())
            .is_some_and(|c| c.weak)
    }

    /// Only accept instances of `class` from now on. Fails, listing every
    /// offender, if current members don't qualify.
    fn restrict(&self, class: &Class) -> Result<()> {
        let graph = self.graph();
        graph.ensure_alive(self.id())?;
        let violations: Vec<String> = self
            .members()
            .into_iter()
            .filter(|m| !graph.is_instance_of(*m, class))
            .map(|m| format!("{m} is not an instance of {class}"))
            .collect();
        if !violations.is_empty() {
            return Err(Error::Validation(violations));
        }
        with_state(graph, self.id(), |state| state.restrict = Some(class.clone()))
    }
}

fn with_state(graph: &Graph, id: EntityId, f: impl FnOnce(&mut ContainerState)) -> Result<()> {
    let mut arena = graph.inner.arena.borrow_mut();
    let record = arena.live_mut(id)?;
    let state = record
        .container
        .as_mut()
        .ok_or_else(|| Error::InvalidReference(format!("{id} is not a container")))?;
    f(state);
    Ok(())
}

/// Check that `id` is a live container of `kind`.
pub(crate) fn ensure_kind(graph: &Graph, id: EntityId, kind: ContainerKind) -> Result<()> {
    let arena = graph.inner.arena.borrow();
    let record = arena.live(id)?;
    match &record.container {
        Some(state) if state.kind == kind => Ok(()),
        _ => Err(Error::InvalidReference(format!("{id} is not a {kind:?} container"))),
    }
}

/// Ownership new members get.
pub(crate) fn member_ownership(graph: &Graph, container: EntityId) -> Ownership {
    let arena = graph.inner.arena.borrow();
    let Some(record) = arena.entities.get(&container) else {
        return Ownership::Reference;
    };
    let weak = record.container.as_ref().is_none_or(|c| c.weak);
    if !weak && record.parent.is_some() {
        Ownership::Child
    } else {
        Ownership::Reference
    }
}

/// Validate a prospective member.
pub(crate) fn check_candidate(graph: &Graph, container: EntityId, item: EntityId) -> Result<()> {
    if !graph.is_alive(item) {
        return Err(Error::InvalidReference(format!(
            "cannot add destroyed entity {item} to {container}"
        )));
    }
    let restrict = {
        let arena = graph.inner.arena.borrow();
        arena.live(container)?.container.as_ref().and_then(|c| c.restrict.clone())
    };
    if let Some(class) = restrict {
        if !graph.is_instance_of(item, &class) {
            return Err(Error::InvalidReference(format!(
                "{item} is not an instance of {class}, required by {container}"
            )));
        }
    }
    if member_ownership(graph, container) == Ownership::Child {
        let cycle = item == container || graph.inner.arena.borrow().is_ancestor(item, container);
        if cycle {
            return Err(Error::InvalidReference(format!(
                "owning {item} from {container} would create an ownership cycle"
            )));
        }
    }
    Ok(())
}

/// Emit a container event unless the container is gone.
pub(crate) fn notify(graph: &Graph, container: EntityId, event: ManagedEvent) {
    if !graph.is_alive(container) {
        return;
    }
    if let Err(err) = graph.emit(container, event) {
        graph.report_unhandled(err);
    }
}

pub(crate) fn notify_change(
    graph: &Graph,
    container: EntityId,
    change: ContainerChange,
    object: Option<EntityId>,
) {
    notify(graph, container, ManagedEvent::container(change, object));
}

/// Called after `container` gained an owner: take ownership of members that
/// have none.
pub(crate) fn adopt_members(graph: &Graph, container: EntityId) {
    if member_ownership(graph, container) != Ownership::Child {
        return;
    }
    let mut arena = graph.inner.arena.borrow_mut();
    let links: Vec<LinkId> = match arena.entities.get(&container) {
        Some(record) if record.container.is_some() => record
            .slots
            .iter()
            .filter(|(key, _)| is_member_key(key))
            .map(|(_, link)| *link)
            .collect(),
        _ => return,
    };
    for link in links {
        let Some(target) = arena.links.get(link).map(|r| r.target) else {
            continue;
        };
        // Ownership cycles through containers are refused.
        if target == container || arena.is_ancestor(target, container) {
            continue;
        }
        let Some(member) = arena.entities.get_mut(&target) else {
            continue;
        };
        if member.parent.is_some() {
            continue;
        }
        member.parent = Some(link);
        if let Some(record) = arena.links.get_mut(link) {
            record.ownership = Ownership::Child;
        }
        tracing::trace!(container = %container, member = %target, "container.adopt");
    }
}

/// Unlink behaviour of member links: the member was destroyed or adopted
/// elsewhere.
pub(crate) fn member_unlinked(graph: &Graph, info: &LinkInfo) {
    graph.discard_link(info.id);
    let event = ManagedEvent::container(ContainerChange::Remove, Some(info.target));
    let event = match &info.key {
        SlotKey::Key(key) => event.with_data("key", key.as_str()),
        _ => event,
    };
    notify(graph, info.source, event);
}

/// Relay of member links: forward member events when propagation is on.
pub(crate) fn relay_member_event(graph: &Graph, info: &LinkInfo, event: &ManagedEvent) {
    if event.is_core() {
        return;
    }
    let forward = {
        let arena = graph.inner.arena.borrow();
        arena
            .entities
            .get(&info.source)
            .and_then(|r| r.container.as_ref())
            .is_some_and(|c| c.propagation.matches(event))
    };
    if forward {
        notify(graph, info.source, event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_propagation_filter() {
        let ping = ManagedEvent::new("Ping");
        assert!(!Propagation::Off.matches(&ping));
        assert!(Propagation::All.matches(&ping));
        assert!(Propagation::Only(vec!["Ping".into()]).matches(&ping));
        assert!(!Propagation::Only(vec!["Pong".into()]).matches(&ping));
    }

    #[test]
    fn test_restrict_reports_every_offender() {
        let graph = Graph::new();
        let list = graph.create_list();
        let wanted = Class::builder("Wanted").build();
        let a = graph.create(&Class::managed_object());
        let b = graph.create(&wanted);
        let c = graph.create(&Class::managed_object());
        for item in [a, b, c] {
            list.add(item).unwrap();
        }

        let err = list.restrict(&wanted).unwrap_err();
        match err {
            Error::Validation(messages) => assert_eq!(messages.len(), 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_restricted_container_rejects_other_classes() {
        let graph = Graph::new();
        let list = graph.create_list();
        let wanted = Class::builder("Wanted").build();
        list.restrict(&wanted).unwrap();
        let other = graph.create(&Class::managed_object());
        assert!(matches!(list.add(other), Err(Error::InvalidReference(_))));
        let ok = graph.create(&wanted);
        list.add(ok).unwrap();
    }

    #[test]
    fn test_propagated_member_events_reach_container() {
        let graph = Graph::new();
        let list = graph.create_list();
        let item = graph.create(&Class::managed_object());
        list.add(item).unwrap();
        list.propagate_events(&["Ping"]).unwrap();

        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let s = seen.clone();
        graph
            .create_link(
                graph.create(&Class::managed_object()),
                list.id(),
                SlotKey::Ref,
                crate::LinkOptions::reference().on_event(move |_, _, event| {
                    s.borrow_mut().push(event.name().to_string());
                    Ok(())
                }),
            )
            .unwrap();

        graph.emit(item, ManagedEvent::new("Ping")).unwrap();
        graph.emit(item, ManagedEvent::new("Other")).unwrap();
        assert_eq!(*seen.borrow(), vec!["Ping".to_string()]);
    }
}
