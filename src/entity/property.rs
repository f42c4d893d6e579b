//! Property access.
//!
//! Properties declared on the class with `reference`/`child`/`dependency`
//! hold entity references and are backed by links. Everything else is a
//! plain value stored on the record. Both kinds notify observers and
//! bindings only when the value actually changes.

use crate::link::{Ownership, Relay, SlotKey, Unlink};
use crate::model::{EntityId, Value};
use crate::{Error, Graph, Result};

impl Graph {
    /// Read a property. Unset properties read as `Null`.
    pub fn get(&self, id: EntityId, name: &str) -> Result<Value> {
        let arena = self.inner.arena.borrow();
        let record = arena.live(id)?;
        if let Some(link) = record.slots.get(&SlotKey::property(name)) {
            return Ok(arena.links.get(*link).map(|l| Value::Entity(l.target)).unwrap_or_default());
        }
        Ok(record.values.get(name).cloned().unwrap_or_default())
    }

    pub fn get_ref(&self, id: EntityId, name: &str) -> Result<Option<EntityId>> {
        Ok(self.get(id, name)?.as_entity())
    }

    /// Write a property. Writing the current value is a no-op.
    pub fn set(&self, id: EntityId, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let class = self.inner.arena.borrow().live(id)?.class.clone();

        if let Some(ownership) = class.reference_ownership(name) {
            let target = match value {
                Value::Null => None,
                Value::Entity(target) => Some(target),
                ref other => {
                    return Err(Error::InvalidReference(format!(
                        "property '{name}' of {id} holds entity references, got {}",
                        other.type_name()
                    )));
                }
            };
            return self.assign_ref(id, name, ownership, target);
        }

        {
            let mut arena = self.inner.arena.borrow_mut();
            let record = arena.live_mut(id)?;
            let unchanged = match record.values.get(name) {
                Some(current) => *current == value,
                None => value.is_null(),
            };
            if unchanged {
                return Ok(());
            }
            if value.is_null() {
                record.values.remove(name);
            } else {
                record.values.insert(name.to_string(), value.clone());
            }
        }
        tracing::trace!(entity = %id, property = name, "property.set");
        self.property_changed(id, name, &value);
        Ok(())
    }

    pub fn set_ref(&self, id: EntityId, name: &str, target: Option<EntityId>) -> Result<()> {
        self.set(id, name, target)
    }

    fn assign_ref(
        &self,
        id: EntityId,
        name: &str,
        ownership: Ownership,
        target: Option<EntityId>,
    ) -> Result<()> {
        let key = SlotKey::property(name);
        let current = {
            let arena = self.inner.arena.borrow();
            let record = arena.live(id)?;
            record
                .slots
                .get(&key)
                .and_then(|l| arena.links.get(*l).map(|r| (*l, r.target)))
        };
        if current.map(|(_, t)| t) == target {
            return Ok(());
        }
        if let Some(t) = target {
            if !self.is_alive(t) {
                return Err(Error::InvalidReference(format!(
                    "cannot assign destroyed entity {t} to '{name}' of {id}"
                )));
            }
            if ownership == Ownership::Child
                && (t == id || self.inner.arena.borrow().is_ancestor(t, id))
            {
                return Err(Error::InvalidReference(format!(
                    "assigning {t} to '{name}' of {id} would create an ownership cycle"
                )));
            }
        }

        if let Some((link, _)) = current {
            self.discard_link(link);
        }
        if let Some(t) = target {
            let unlink = match ownership {
                Ownership::Dependency => Unlink::DestroySource,
                _ => Unlink::ClearProperty,
            };
            self.link_entities(id, t, key, ownership, Relay::Property, unlink, None)?;
        }
        tracing::trace!(entity = %id, property = name, target = ?target, "property.set_ref");
        self.property_changed(id, name, &Value::from(target));
        Ok(())
    }

    pub(crate) fn property_changed(&self, id: EntityId, name: &str, value: &Value) {
        crate::observe::dispatch_property(self, id, name, value);
        crate::component::on_property_changed(self, id, name);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entity::Class;

    fn person() -> Class {
        Class::builder("Person").reference("friend").child("pet").dependency("home").build()
    }

    #[test]
    fn test_plain_values_round_trip() {
        let graph = Graph::new();
        let id = graph.create(&person());
        assert_eq!(graph.get(id, "name").unwrap(), Value::Null);
        graph.set(id, "name", "Ada").unwrap();
        assert_eq!(graph.get(id, "name").unwrap(), Value::from("Ada"));
        graph.set(id, "name", Value::Null).unwrap();
        assert_eq!(graph.get(id, "name").unwrap(), Value::Null);
    }

    #[test]
    fn test_reference_property_creates_link() {
        let graph = Graph::new();
        let a = graph.create(&person());
        let b = graph.create(&person());
        graph.set(a, "friend", b).unwrap();
        assert_eq!(graph.get_ref(a, "friend").unwrap(), Some(b));
        assert_eq!(graph.reference_count(b), 1);

        graph.set_ref(a, "friend", None).unwrap();
        assert_eq!(graph.get_ref(a, "friend").unwrap(), None);
        assert_eq!(graph.reference_count(b), 0);
    }

    #[test]
    fn test_reassigning_same_target_keeps_link() {
        let graph = Graph::new();
        let a = graph.create(&person());
        let b = graph.create(&person());
        graph.set(a, "friend", b).unwrap();
        let link = graph.outbound_links(a)[0].id;
        graph.set(a, "friend", b).unwrap();
        assert_eq!(graph.outbound_links(a)[0].id, link);
    }

    #[test]
    fn test_reference_property_rejects_plain_value() {
        let graph = Graph::new();
        let a = graph.create(&person());
        let err = graph.set(a, "friend", 3).unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));
    }

    #[test]
    fn test_child_property_sets_parent() {
        let graph = Graph::new();
        let a = graph.create(&person());
        let pet = graph.create(&Class::managed_object());
        graph.set(a, "pet", pet).unwrap();
        assert_eq!(graph.parent(pet), Some(a));
    }

    #[test]
    fn test_self_ownership_is_rejected() {
        let graph = Graph::new();
        let a = graph.create(&person());
        let err = graph.set(a, "pet", a).unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));
    }
}
