//! Event emission.
//!
//! `emit` runs the class's handlers, then the entity's observers, then
//! relays the event along every inbound link that asked for it. Handler and
//! observer errors are reported, never returned to the emitter.

use smallvec::SmallVec;

use crate::link::{Relay, SlotKey};
use crate::model::{EntityId, LinkId, ManagedEvent};
use crate::{Error, Graph, Result};

/// Decrements the entity's emit depth however `emit` exits.
struct EmitGuard<'a> {
    graph: &'a Graph,
    id: EntityId,
}

impl Drop for EmitGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut arena) = self.graph.inner.arena.try_borrow_mut() {
            if let Some(record) = arena.entities.get_mut(&self.id) {
                record.emit_depth = record.emit_depth.saturating_sub(1);
            }
        }
    }
}

impl Graph {
    /// Emit `event` on `id`.
    ///
    /// Fails with `Destroyed` for destroyed entities (the destruction core
    /// event itself excepted) and with `RecursionLimit` when emission nests
    /// deeper than `max_emit_depth` on the same entity.
    pub fn emit(&self, id: EntityId, event: ManagedEvent) -> Result<()> {
        let (class, relays) = {
            let mut guard = self.inner.arena.borrow_mut();
            let arena = &mut *guard;
            let Some(record) = arena.entities.get_mut(&id) else {
                return Err(Error::Destroyed(id));
            };
            if !record.state.is_alive() && !event.is_destroyed_core() {
                return Err(Error::Destroyed(id));
            }
            if record.emit_depth >= self.inner.config.max_emit_depth {
                tracing::error!(
                    entity = %id,
                    event = %event,
                    depth = record.emit_depth,
                    "event recursion limit reached"
                );
                return Err(Error::RecursionLimit(format!(
                    "emitting {event} on {id} nested {} levels deep",
                    record.emit_depth
                )));
            }
            record.emit_depth += 1;
            let relays: SmallVec<[(LinkId, Relay); 4]> = record
                .inbound
                .iter()
                .filter_map(|link| arena.links.get(*link).map(|r| (*link, r.relay.clone())))
                .filter(|(_, relay)| !matches!(relay, Relay::None))
                .collect();
            (record.class.clone(), relays)
        };
        let _depth = EmitGuard { graph: self, id };
        tracing::trace!(entity = %id, event = %event, "event.emit");

        for handler in class.event_handlers() {
            if let Err(err) = handler(self, id, &event) {
                self.report_unhandled(err);
            }
        }
        crate::observe::dispatch_event(self, id, &event);
        for (link, relay) in relays {
            self.relay_event(link, &relay, &event);
        }
        Ok(())
    }

    /// Emit a plain `Change` event.
    pub fn emit_change(&self, id: EntityId) -> Result<()> {
        self.emit(id, ManagedEvent::change())
    }

    fn relay_event(&self, link: LinkId, relay: &Relay, event: &ManagedEvent) {
        let Some(info) = self.link_info(link) else {
            return;
        };
        match relay {
            Relay::None => {}
            Relay::Property => {
                if info.is_parent {
                    self.relay_child_event(info.source, event);
                }
                if let SlotKey::Property(name) = &info.key {
                    crate::observe::dispatch_property_event(self, info.source, name, event);
                    crate::component::on_property_event(self, info.source, name, event);
                }
            }
            Relay::Container => crate::container::relay_member_event(self, &info, event),
            Relay::Callback(callback) => {
                if let Err(err) = callback(self, &info, event) {
                    self.report_unhandled(err);
                }
            }
        }
    }

    fn relay_child_event(&self, owner: EntityId, event: &ManagedEvent) {
        if event.is_core() || !self.is_alive(owner) {
            return;
        }
        let Some(relay) = self.class_of(owner).and_then(|c| c.child_relay()) else {
            return;
        };
        match relay(self, owner, event) {
            Ok(Some(relayed)) => {
                if let Err(err) = self.emit(owner, relayed) {
                    self.report_unhandled(err);
                }
            }
            Ok(None) => {}
            Err(err) => self.report_unhandled(err),
        }
    }
}
