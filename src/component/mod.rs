//! # Components
//!
//! Component classes declare properties that mirror a [`Binding`] evaluated
//! against the instance's *bound parent*:
//!
//! - the structural parent is the nearest component ancestor along parent
//!   links (plain entities and containers in between are skipped);
//! - the bound parent is the structural parent when its class composes the
//!   instance's class, otherwise the structural parent's own bound parent.
//!
//! Each bound parent keeps one [`BoundRecord`] per binding it serves, with
//! the last value read and the instances that mirror it. Writes to the bound
//! parent recompute only the records that depend on the written property.
//!
//! ```rust,ignore
//! let label = Class::builder("Label")
//!     .extends(&Class::component())
//!     .bind("text", bind("title"))
//!     .build();
//! let page = Class::builder("Page")
//!     .extends(&Class::component())
//!     .child("body")
//!     .composes(&label)
//!     .build();
//! ```

mod binding;

pub use binding::Binding;

use crate::entity::Arena;
use crate::model::{EntityId, ManagedEvent, Value};
use crate::Graph;

/// Per-instance component state.
#[derive(Debug, Default)]
pub(crate) struct ComponentNode {
    pub(crate) bound_parent: Option<EntityId>,
}

/// A binding served by a bound parent.
pub(crate) struct BoundRecord {
    pub(crate) binding: Binding,
    pub(crate) value: Value,
    /// `(instance, property)` pairs mirroring `value`.
    pub(crate) dependents: Vec<(EntityId, String)>,
}

/// Shorthand for [`Binding::new`].
pub fn bind(path: &str) -> Binding {
    Binding::new(path)
}

pub fn bind_with_default(path: &str, default: impl Into<Value>) -> Binding {
    Binding::with_default(path, default)
}

pub fn bind_template(template: &str) -> Binding {
    Binding::template(template)
}

// ============================================================================
// Bound parent resolution
// ============================================================================

impl Arena {
    pub(crate) fn structural_parent(&self, id: EntityId) -> Option<EntityId> {
        let mut current = self.parent_of(id)?;
        for _ in 0..=self.entities.len() {
            if self.entities.get(&current)?.component.is_some() {
                return Some(current);
            }
            current = self.parent_of(current)?;
        }
        None
    }

    fn compute_bound_parent(&self, id: EntityId) -> Option<EntityId> {
        let structural = self.structural_parent(id)?;
        let class = &self.entities.get(&id)?.class;
        let parent = self.entities.get(&structural)?;
        if parent.class.composes_instance_of(class) {
            Some(structural)
        } else {
            parent.component.as_ref()?.bound_parent
        }
    }
}

enum Step {
    Descend,
    Skip,
    Rebind(Option<EntityId>, Option<EntityId>),
}

/// Recompute bound parents below `root` after its position changed.
///
/// Components whose bound parent is unchanged shield their subtree.
pub(crate) fn refresh_bound_parents(graph: &Graph, root: EntityId) {
    let mut pending = vec![root];
    while let Some(id) = pending.pop() {
        let step = {
            let arena = graph.inner.arena.borrow();
            let Some(record) = arena.entities.get(&id) else {
                continue;
            };
            if !record.state.is_alive() {
                continue;
            }
            match &record.component {
                None => Step::Descend,
                Some(node) => {
                    let bound = arena.compute_bound_parent(id);
                    if node.bound_parent == bound {
                        Step::Skip
                    } else {
                        Step::Rebind(node.bound_parent, bound)
                    }
                }
            }
        };
        match step {
            Step::Skip => continue,
            Step::Rebind(old, new) => rebind(graph, id, old, new),
            Step::Descend => {}
        }
        pending.extend(graph.owned_children(id));
    }
}

/// Move `id`'s bindings from `old` to `new` and push the current values.
/// Without a bound parent, bound properties keep their last value.
fn rebind(graph: &Graph, id: EntityId, old: Option<EntityId>, new: Option<EntityId>) {
    tracing::debug!(entity = %id, from = ?old, to = ?new, "component.rebind");
    let bindings = {
        let mut arena = graph.inner.arena.borrow_mut();
        let Some(record) = arena.entities.get_mut(&id) else {
            return;
        };
        if let Some(node) = record.component.as_mut() {
            node.bound_parent = new;
        }
        record.class.bindings()
    };
    if let Some(old) = old {
        drop_dependent(graph, old, id);
    }
    let Some(new) = new else {
        return;
    };
    for (property, binding) in bindings {
        let value = attach_dependent(graph, new, id, &property, &binding);
        if let Err(err) = graph.set(id, &property, value) {
            graph.report_unhandled(err);
        }
    }
}

fn drop_dependent(graph: &Graph, holder: EntityId, dependent: EntityId) {
    let mut arena = graph.inner.arena.borrow_mut();
    let Some(record) = arena.entities.get_mut(&holder) else {
        return;
    };
    for bound in &mut record.bounds {
        bound.dependents.retain(|(e, _)| *e != dependent);
    }
    record.bounds.retain(|b| !b.dependents.is_empty());
}

/// Register `(dependent, property)` on `holder`'s record for `binding`,
/// creating the record on first use. Returns the value to mirror.
fn attach_dependent(
    graph: &Graph,
    holder: EntityId,
    dependent: EntityId,
    property: &str,
    binding: &Binding,
) -> Value {
    let cached = {
        let arena = graph.inner.arena.borrow();
        arena
            .entities
            .get(&holder)
            .and_then(|r| r.bounds.iter().find(|b| b.binding.id() == binding.id()))
            .map(|b| b.value.clone())
    };
    let value = match cached {
        Some(value) => value,
        None => binding.read(graph, holder),
    };

    let mut arena = graph.inner.arena.borrow_mut();
    if let Some(record) = arena.entities.get_mut(&holder) {
        let entry = (dependent, property.to_string());
        match record.bounds.iter_mut().find(|b| b.binding.id() == binding.id()) {
            Some(bound) => bound.dependents.push(entry),
            None => record.bounds.push(BoundRecord {
                binding: binding.clone(),
                value: value.clone(),
                dependents: vec![entry],
            }),
        }
    }
    value
}

// ============================================================================
// Value propagation
// ============================================================================

/// `name` changed on `id`: refresh the records that read it and push new
/// values to their dependents.
pub(crate) fn on_property_changed(graph: &Graph, id: EntityId, name: &str) {
    let affected: Vec<Binding> = {
        let arena = graph.inner.arena.borrow();
        let Some(record) = arena.entities.get(&id) else {
            return;
        };
        record
            .bounds
            .iter()
            .filter(|b| b.binding.depends_on(name))
            .map(|b| b.binding.clone())
            .collect()
    };

    for binding in affected {
        let value = binding.read(graph, id);
        let dependents = {
            let mut arena = graph.inner.arena.borrow_mut();
            let Some(bound) = arena
                .entities
                .get_mut(&id)
                .and_then(|r| r.bounds.iter_mut().find(|b| b.binding.id() == binding.id()))
            else {
                continue;
            };
            if bound.value == value {
                continue;
            }
            bound.value = value.clone();
            bound.dependents.clone()
        };
        tracing::trace!(
            entity = %id,
            property = name,
            dependents = dependents.len(),
            "binding.push"
        );
        for (dependent, property) in dependents {
            if let Err(err) = graph.set(dependent, &property, value.clone()) {
                graph.report_unhandled(err);
            }
        }
    }
}

/// A change event arrived through property `name` of `id`; paths through
/// that property may now read differently.
pub(crate) fn on_property_event(graph: &Graph, id: EntityId, name: &str, event: &ManagedEvent) {
    if event.is_change() {
        on_property_changed(graph, id, name);
    }
}

/// Drop every binding relation of a destroyed instance.
pub(crate) fn detach_instance(graph: &Graph, id: EntityId) {
    let old = {
        let mut arena = graph.inner.arena.borrow_mut();
        let Some(record) = arena.entities.get_mut(&id) else {
            return;
        };
        record.bounds.clear();
        record.component.as_mut().and_then(|n| n.bound_parent.take())
    };
    if let Some(old) = old {
        drop_dependent(graph, old, id);
    }
}

impl Graph {
    /// The entity whose values `id`'s bindings read.
    pub fn bound_parent(&self, id: EntityId) -> Option<EntityId> {
        let arena = self.inner.arena.borrow();
        arena.entities.get(&id)?.component.as_ref()?.bound_parent
    }

    /// Nearest component ancestor of `id`.
    pub fn structural_parent(&self, id: EntityId) -> Option<EntityId> {
        self.inner.arena.borrow().structural_parent(id)
    }
}
