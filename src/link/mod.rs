//! # RefLink fabric
//!
//! Directed edges between entities. Property references, ownership and
//! container membership are all links, and links are
//! the only way one entity can reach another.
//!
//! ## Invariants
//!
//! 1. A live link is stored in its source's slot table under its key and in
//!    its target's inbound array at `inbound_index`. Both sides agree or the
//!    link does not exist.
//! 2. A target has at most one parent link (`EntityRecord::parent`), and the
//!    parent link always has [`Ownership::Child`].
//! 3. Links keyed by [`SlotKey::Member`] are threaded into their container's
//!    head/tail chain through `prev`/`next`.
//! 4. Released slots go back to a bounded free list; a released id never
//!    resolves again because its slot generation has moved on.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::entity::Arena;
use crate::model::{EntityId, LinkId, ManagedEvent, Value};
use crate::{Error, Graph, Result};

// ============================================================================
// Keys and flavours
// ============================================================================

/// Slot under which a link is stored in its source's slot table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotKey {
    /// Reference property.
    Property(String),
    /// List membership, keyed by the member so lookups are O(1).
    Member(EntityId),
    /// Map entry.
    Key(String),
    /// The single slot of a `ManagedRef`.
    Ref,
}

impl SlotKey {
    pub fn property(name: &str) -> Self {
        SlotKey::Property(name.to_string())
    }

    pub fn is_member(&self) -> bool {
        matches!(self, SlotKey::Member(_))
    }

    pub fn property_name(&self) -> Option<&str> {
        match self {
            SlotKey::Property(name) => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotKey::Property(name) => write!(f, ".{name}"),
            SlotKey::Member(id) => write!(f, "[{id}]"),
            SlotKey::Key(key) => write!(f, "[{key:?}]"),
            SlotKey::Ref => write!(f, "[ref]"),
        }
    }
}

/// Ownership semantics of a link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ownership {
    /// No ownership implied in either direction.
    #[default]
    Reference,
    /// Source owns target; target is destroyed when orphaned.
    Child,
    /// Source depends on target; source is destroyed with the target.
    Dependency,
}

/// Callback invoked with every event the target of a link emits.
pub type EventCallback = Rc<dyn Fn(&Graph, &LinkInfo, &ManagedEvent) -> Result<()>>;

/// Callback invoked when a link is severed from the target side (target
/// destroyed, or adopted by a new owner).
pub type UnlinkCallback = Rc<dyn Fn(&Graph, &LinkInfo) -> Result<()>>;

/// How events from the target travel back to the source.
#[derive(Clone, Default)]
pub(crate) enum Relay {
    #[default]
    None,
    /// Property link: child relay, property-event observers, bindings.
    Property,
    /// Container member: forwarded when the container propagates.
    Container,
    Callback(EventCallback),
}

/// What happens to the source when the link is severed from the target side.
#[derive(Clone, Default)]
pub(crate) enum Unlink {
    #[default]
    None,
    ClearProperty,
    DestroySource,
    Container,
    Callback(UnlinkCallback),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnlinkReason {
    TargetDestroyed,
    Adopted,
}

/// Options for [`Graph::create_link`].
#[derive(Clone, Default)]
pub struct LinkOptions {
    pub ownership: Ownership,
    pub on_event: Option<EventCallback>,
    pub on_unlink: Option<UnlinkCallback>,
}

impl LinkOptions {
    pub fn reference() -> Self {
        Self::default()
    }

    pub fn child() -> Self {
        Self { ownership: Ownership::Child, ..Self::default() }
    }

    pub fn dependency() -> Self {
        Self { ownership: Ownership::Dependency, ..Self::default() }
    }

    pub fn on_event(
        mut self,
        f: impl Fn(&Graph, &LinkInfo, &ManagedEvent) -> Result<()> + 'static,
    ) -> Self {
        self.on_event = Some(Rc::new(f));
        self
    }

    pub fn on_unlink(mut self, f: impl Fn(&Graph, &LinkInfo) -> Result<()> + 'static) -> Self {
        self.on_unlink = Some(Rc::new(f));
        self
    }
}

/// Read-only view of a live link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkInfo {
    pub id: LinkId,
    pub source: EntityId,
    pub target: EntityId,
    pub key: SlotKey,
    pub ownership: Ownership,
    /// True when this link is the target's parent link.
    pub is_parent: bool,
}

// ============================================================================
// Link table
// ============================================================================

pub(crate) struct LinkRecord {
    pub(crate) source: EntityId,
    pub(crate) target: EntityId,
    pub(crate) key: SlotKey,
    pub(crate) ownership: Ownership,
    pub(crate) prev: Option<LinkId>,
    pub(crate) next: Option<LinkId>,
    pub(crate) inbound_index: usize,
    pub(crate) relay: Relay,
    pub(crate) unlink: Unlink,
}

struct LinkSlot {
    generation: u32,
    record: Option<LinkRecord>,
}

/// Slot table for link records with a bounded free list.
pub(crate) struct LinkTable {
    slots: Vec<LinkSlot>,
    free: Vec<u32>,
    pool_size: usize,
    live: usize,
}

impl LinkTable {
    pub(crate) fn new(pool_size: usize) -> Self {
        Self { slots: Vec::new(), free: Vec::new(), pool_size, live: 0 }
    }

    pub(crate) fn get(&self, id: LinkId) -> Option<&LinkRecord> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: LinkId) -> Option<&mut LinkRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_mut()
    }

    /// Store a record, reusing a pooled slot when one is available. Every
    /// field of a reused slot is overwritten by `record`.
    pub(crate) fn alloc(&mut self, record: LinkRecord) -> LinkId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return LinkId { index, generation: slot.generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(LinkSlot { generation: 0, record: Some(record) });
        LinkId { index, generation: 0 }
    }

    pub(crate) fn release(&mut self, id: LinkId) -> Option<LinkRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        if self.free.len() < self.pool_size {
            self.free.push(id.index);
        } else {
            tracing::trace!(link = %id, pool_size = self.pool_size, "link pool full, slot retired");
        }
        Some(record)
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn pooled(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn allocated(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (LinkId, &LinkRecord)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|record| {
                (LinkId { index: index as u32, generation: slot.generation }, record)
            })
        })
    }
}

/// A link removed from both sides.
pub(crate) struct DetachedLink {
    pub(crate) source: EntityId,
    pub(crate) target: EntityId,
    pub(crate) was_parent: bool,
}

// ============================================================================
// Arena-level edge bookkeeping (no callbacks, no events)
// ============================================================================

impl Arena {
    pub(crate) fn link_info(&self, id: LinkId) -> Option<LinkInfo> {
        let record = self.links.get(id)?;
        let is_parent = self
            .entities
            .get(&record.target)
            .is_some_and(|target| target.parent == Some(id));
        Some(LinkInfo {
            id,
            source: record.source,
            target: record.target,
            key: record.key.clone(),
            ownership: record.ownership,
            is_parent,
        })
    }

    /// Every precondition of [`Arena::attach`], without touching the table.
    pub(crate) fn check_attach(
        &self,
        source: EntityId,
        target: EntityId,
        key: &SlotKey,
        before: Option<LinkId>,
    ) -> Result<()> {
        if !self.entities.get(&target).is_some_and(|t| t.state.is_alive()) {
            return Err(Error::InvalidReference(format!(
                "cannot link {source} to destroyed entity {target}"
            )));
        }
        match self.entities.get(&source) {
            Some(s) if s.state.is_alive() => {
                if s.slots.contains_key(key) {
                    return Err(Error::Duplicate(format!(
                        "{source} already has a link under {key}"
                    )));
                }
            }
            _ => return Err(Error::Destroyed(source)),
        }
        if let Some(before) = before {
            let valid = self
                .links
                .get(before)
                .is_some_and(|r| r.source == source && r.key.is_member());
            if !valid {
                return Err(Error::NotFound(format!(
                    "insertion point {before} is not a member of {source}"
                )));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attach(
        &mut self,
        source: EntityId,
        target: EntityId,
        key: SlotKey,
        ownership: Ownership,
        relay: Relay,
        unlink: Unlink,
        before: Option<LinkId>,
    ) -> Result<LinkId> {
        self.check_attach(source, target, &key, before)?;
        let inbound_index = self.entities.get(&target).map_or(0, |t| t.inbound.len());

        let is_member = key.is_member();
        let id = self.links.alloc(LinkRecord {
            source,
            target,
            key: key.clone(),
            ownership,
            prev: None,
            next: None,
            inbound_index,
            relay,
            unlink,
        });
        if let Some(t) = self.entities.get_mut(&target) {
            t.inbound.push(id);
            if ownership == Ownership::Child {
                t.parent = Some(id);
            }
        }
        if let Some(s) = self.entities.get_mut(&source) {
            s.slots.insert(key, id);
        }
        if is_member {
            self.splice(source, id, before);
        }
        Ok(id)
    }

    /// Remove a link from both sides. Stale ids return `None`.
    pub(crate) fn detach(&mut self, id: LinkId) -> Option<DetachedLink> {
        let (source, is_member) = {
            let record = self.links.get(id)?;
            (record.source, record.key.is_member())
        };
        if is_member {
            self.unsplice(source, id);
        }
        let record = self.links.release(id)?;

        if let Some(src) = self.entities.get_mut(&record.source) {
            if src.slots.get(&record.key) == Some(&id) {
                src.slots.remove(&record.key);
            }
        }

        let mut was_parent = false;
        if let Some(tgt) = self.entities.get_mut(&record.target) {
            let position = if tgt.inbound.get(record.inbound_index) == Some(&id) {
                Some(record.inbound_index)
            } else {
                tgt.inbound.iter().position(|l| *l == id)
            };
            if let Some(index) = position {
                tgt.inbound.swap_remove(index);
                if let Some(&moved) = tgt.inbound.get(index) {
                    if let Some(m) = self.links.get_mut(moved) {
                        m.inbound_index = index;
                    }
                }
            }
            if tgt.parent == Some(id) {
                tgt.parent = None;
                was_parent = true;
            }
        }

        Some(DetachedLink { source: record.source, target: record.target, was_parent })
    }

    /// Thread a member link into its container's chain before `before`
    /// (or at the tail).
    pub(crate) fn splice(&mut self, container: EntityId, link: LinkId, before: Option<LinkId>) {
        let Some(state) = self.entities.get_mut(&container).and_then(|e| e.container.as_mut())
        else {
            return;
        };
        let (prev, next) = match before {
            Some(b) => (self.links.get(b).and_then(|r| r.prev), Some(b)),
            None => (state.tail, None),
        };
        if let Some(record) = self.links.get_mut(link) {
            record.prev = prev;
            record.next = next;
        }
        match prev {
            Some(p) => {
                if let Some(r) = self.links.get_mut(p) {
                    r.next = Some(link);
                }
            }
            None => state.head = Some(link),
        }
        match next {
            Some(n) => {
                if let Some(r) = self.links.get_mut(n) {
                    r.prev = Some(link);
                }
            }
            None => state.tail = Some(link),
        }
        state.count += 1;
    }

    /// Take a member link out of its container's chain. The link stays live.
    pub(crate) fn unsplice(&mut self, container: EntityId, link: LinkId) {
        let Some((prev, next)) = self.links.get(link).map(|r| (r.prev, r.next)) else {
            return;
        };
        if let Some(p) = prev {
            if let Some(r) = self.links.get_mut(p) {
                r.next = next;
            }
        }
        if let Some(n) = next {
            if let Some(r) = self.links.get_mut(n) {
                r.prev = prev;
            }
        }
        if let Some(state) = self.entities.get_mut(&container).and_then(|e| e.container.as_mut()) {
            if prev.is_none() {
                state.head = next;
            }
            if next.is_none() {
                state.tail = prev;
            }
            state.count = state.count.saturating_sub(1);
        }
        if let Some(record) = self.links.get_mut(link) {
            record.prev = None;
            record.next = None;
        }
    }

    /// Make another link from `source` to `target` the target's parent link.
    /// Used when one container holds the same target under several keys.
    pub(crate) fn promote_parent(&mut self, target: EntityId, source: EntityId) -> bool {
        let Some(tgt) = self.entities.get(&target) else {
            return false;
        };
        if tgt.parent.is_some() {
            return false;
        }
        let candidate = tgt
            .inbound
            .iter()
            .copied()
            .find(|l| self.links.get(*l).is_some_and(|r| r.source == source));
        let Some(link) = candidate else {
            return false;
        };
        if let Some(record) = self.links.get_mut(link) {
            record.ownership = Ownership::Child;
        }
        if let Some(tgt) = self.entities.get_mut(&target) {
            tgt.parent = Some(link);
        }
        true
    }

    /// True when `candidate` owns `of`, directly or transitively.
    pub(crate) fn is_ancestor(&self, candidate: EntityId, of: EntityId) -> bool {
        let mut current = of;
        // Parent chains are acyclic; the bound guards against corruption.
        for _ in 0..=self.entities.len() {
            let parent = self
                .entities
                .get(&current)
                .and_then(|e| e.parent)
                .and_then(|l| self.links.get(l))
                .map(|r| r.source);
            match parent {
                Some(p) if p == candidate => return true,
                Some(p) => current = p,
                None => return false,
            }
        }
        false
    }
}

// ============================================================================
// Graph-level link operations
// ============================================================================

impl Graph {
    /// Create a link from `source` to `target` under `key`.
    ///
    /// A child link to a target that already has an owner first severs the
    /// existing parent link through its unlink behaviour. Dependency links
    /// destroy `source` when `target` is destroyed unless `on_unlink` is set.
    pub fn create_link(
        &self,
        source: EntityId,
        target: EntityId,
        key: SlotKey,
        options: LinkOptions,
    ) -> Result<LinkId> {
        let relay = options.on_event.map(Relay::Callback).unwrap_or_default();
        let unlink = match (options.on_unlink, options.ownership) {
            (Some(callback), _) => Unlink::Callback(callback),
            (None, Ownership::Dependency) => Unlink::DestroySource,
            (None, _) => Unlink::None,
        };
        self.link_entities(source, target, key, options.ownership, relay, unlink, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn link_entities(
        &self,
        source: EntityId,
        target: EntityId,
        key: SlotKey,
        mut ownership: Ownership,
        relay: Relay,
        unlink: Unlink,
        before: Option<LinkId>,
    ) -> Result<LinkId> {
        self.ensure_alive(source)?;
        if !self.is_alive(target) {
            return Err(Error::InvalidReference(format!(
                "cannot link {source} to destroyed entity {target}"
            )));
        }

        let mut previous_owner = None;
        {
            let arena = self.inner.arena.borrow();
            // Validate before the previous owner lets go; a rejected link
            // changes nothing.
            arena.check_attach(source, target, &key, before)?;
        }
        if ownership == Ownership::Child {
            let arena = self.inner.arena.borrow();
            if target == source || arena.is_ancestor(target, source) {
                return Err(Error::InvalidReference(format!(
                    "owning {target} from {source} would create an ownership cycle"
                )));
            }
            let current = arena
                .entities
                .get(&target)
                .and_then(|t| t.parent)
                .and_then(|l| arena.links.get(l).map(|r| (l, r.source)));
            match current {
                // Same owner under another key: keep the existing parent link.
                Some((_, owner)) if owner == source => ownership = Ownership::Reference,
                Some((link, _)) => previous_owner = Some(link),
                None => {}
            }
        }
        if let Some(link) = previous_owner {
            tracing::debug!(
                entity = %target,
                new_owner = %source,
                "detaching entity from previous owner"
            );
            self.force_unlink(link, UnlinkReason::Adopted);
        }

        let id = self
            .inner
            .arena
            .borrow_mut()
            .attach(source, target, key, ownership, relay, unlink, before)?;
        tracing::trace!(link = %id, source = %source, target = %target, ?ownership, "link.create");

        if ownership == Ownership::Child {
            crate::container::adopt_members(self, target);
            crate::component::refresh_bound_parents(self, target);
        }
        Ok(id)
    }

    /// Remove a link from both sides. Returns `false` for stale or unknown ids.
    ///
    /// When the link was its target's parent link, the target is destroyed
    /// on the next scheduler pass unless it has been given a new owner by then.
    pub fn discard_link(&self, id: LinkId) -> bool {
        let detached = self.inner.arena.borrow_mut().detach(id);
        let Some(link) = detached else {
            return false;
        };
        tracing::trace!(link = %id, source = %link.source, target = %link.target, "link.discard");
        if link.was_parent {
            self.after_parent_lost(link.target, link.source);
        }
        true
    }

    fn after_parent_lost(&self, target: EntityId, former_owner: EntityId) {
        let promoted = self.inner.arena.borrow_mut().promote_parent(target, former_owner);
        if promoted || !self.is_alive(target) {
            return;
        }
        self.schedule_orphan_check(target);
        crate::component::refresh_bound_parents(self, target);
    }

    fn schedule_orphan_check(&self, target: EntityId) {
        let weak = self.downgrade();
        self.inner.scheduler.spawn(async move {
            let Some(graph) = weak.upgrade() else {
                return;
            };
            if !graph.is_alive(target) || graph.parent(target).is_some() {
                return;
            }
            tracing::debug!(entity = %target, "destroying orphaned entity");
            match graph.destroy(target).await {
                Ok(()) | Err(Error::Destroyed(_)) => {}
                Err(err) => graph.report_unhandled(err),
            }
        });
    }

    /// Sever a link from the target side, running its unlink behaviour.
    pub(crate) fn force_unlink(&self, id: LinkId, reason: UnlinkReason) {
        let found = {
            let arena = self.inner.arena.borrow();
            arena
                .links
                .get(id)
                .map(|r| r.unlink.clone())
                .zip(arena.link_info(id))
        };
        let Some((unlink, info)) = found else {
            return;
        };
        match unlink {
            Unlink::None => {
                self.discard_link(id);
            }
            Unlink::ClearProperty => {
                self.discard_link(id);
                if let SlotKey::Property(name) = &info.key {
                    if self.is_alive(info.source) {
                        self.property_changed(info.source, name, &Value::Null);
                    }
                }
            }
            Unlink::DestroySource => {
                self.discard_link(id);
                if reason == UnlinkReason::TargetDestroyed && self.is_alive(info.source) {
                    tracing::debug!(
                        entity = %info.source,
                        dependency = %info.target,
                        "dependency destroyed"
                    );
                    // Runs on the scheduler; nothing to await here.
                    let _ = self.destroy(info.source);
                }
            }
            Unlink::Container => crate::container::member_unlinked(self, &info),
            Unlink::Callback(callback) => {
                self.discard_link(id);
                if let Err(err) = callback(self, &info) {
                    self.report_unhandled(err);
                }
            }
        }
    }

    pub fn link_info(&self, id: LinkId) -> Option<LinkInfo> {
        self.inner.arena.borrow().link_info(id)
    }

    /// Links stored in `id`'s slot table.
    pub fn outbound_links(&self, id: EntityId) -> Vec<LinkInfo> {
        let arena = self.inner.arena.borrow();
        let Some(record) = arena.entities.get(&id) else {
            return Vec::new();
        };
        record.slots.values().filter_map(|l| arena.link_info(*l)).collect()
    }

    /// Links pointing at `id`.
    pub fn inbound_links(&self, id: EntityId) -> Vec<LinkInfo> {
        let arena = self.inner.arena.borrow();
        let Some(record) = arena.entities.get(&id) else {
            return Vec::new();
        };
        record.inbound.iter().filter_map(|l| arena.link_info(*l)).collect()
    }

    /// Live links in the graph.
    pub fn link_count(&self) -> usize {
        self.inner.arena.borrow().links.live()
    }

    /// Released link slots waiting for reuse.
    pub fn pooled_links(&self) -> usize {
        self.inner.arena.borrow().links.pooled()
    }
}
