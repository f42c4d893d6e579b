//! Ordered list of unique entities.
//!
//! Members are threaded head → tail through their links, so insertion
//! before a known member, removal and membership tests are O(1); positional
//! access walks the chain.

use hashbrown::{HashMap, HashSet};

use super::{
    check_candidate, ensure_kind, member_ownership, notify_change, Container, ContainerKind,
};
use crate::entity::Class;
use crate::link::{Relay, SlotKey, Unlink};
use crate::model::{ContainerChange, EntityId, LinkId};
use crate::{Error, Graph, Result};

/// Handle to a list entity.
#[derive(Clone)]
pub struct ManagedList {
    graph: Graph,
    id: EntityId,
}

impl Graph {
    pub fn create_list(&self) -> ManagedList {
        ManagedList { graph: self.clone(), id: self.create(&Class::list()) }
    }
}

impl ManagedList {
    /// Wrap an existing list entity (including instances of list subclasses).
    pub fn from_entity(graph: &Graph, id: EntityId) -> Result<Self> {
        ensure_kind(graph, id, ContainerKind::List)?;
        Ok(Self { graph: graph.clone(), id })
    }

    fn link_of(&self, item: EntityId) -> Option<LinkId> {
        let arena = self.graph.inner.arena.borrow();
        arena.entities.get(&self.id)?.slots.get(&SlotKey::Member(item)).copied()
    }

    fn head(&self) -> Option<LinkId> {
        let arena = self.graph.inner.arena.borrow();
        arena.entities.get(&self.id)?.container.as_ref()?.head
    }

    /// Member links with their targets, head to tail.
    fn chain(&self) -> Vec<(LinkId, EntityId)> {
        let arena = self.graph.inner.arena.borrow();
        let Some(state) = arena.entities.get(&self.id).and_then(|r| r.container.as_ref()) else {
            return Vec::new();
        };
        let mut chain = Vec::with_capacity(state.count);
        let mut next = state.head;
        while let Some(link) = next {
            let Some(record) = arena.links.get(link) else {
                break;
            };
            chain.push((link, record.target));
            next = record.next;
            if chain.len() > state.count {
                break;
            }
        }
        chain
    }

    fn next_link(&self, link: LinkId) -> Option<LinkId> {
        self.graph.inner.arena.borrow().links.get(link)?.next
    }

    fn not_member(&self, item: EntityId) -> Error {
        Error::NotFound(format!("{item} is not in list {}", self.id))
    }

    /// Append `item`.
    pub fn add(&self, item: EntityId) -> Result<()> {
        self.insert(item, None)
    }

    /// Insert `item` before `before`, or append when `before` is `None`.
    pub fn insert(&self, item: EntityId, before: Option<EntityId>) -> Result<()> {
        self.graph.ensure_alive(self.id)?;
        if self.link_of(item).is_some() {
            return Err(Error::Duplicate(format!("{item} is already in list {}", self.id)));
        }
        let before_link = match before {
            Some(b) => Some(self.link_of(b).ok_or_else(|| self.not_member(b))?),
            None => None,
        };
        check_candidate(&self.graph, self.id, item)?;
        self.attach(item, before_link)
    }

    fn attach(&self, item: EntityId, before: Option<LinkId>) -> Result<()> {
        let ownership = member_ownership(&self.graph, self.id);
        self.graph.link_entities(
            self.id,
            item,
            SlotKey::Member(item),
            ownership,
            Relay::Container,
            Unlink::Container,
            before,
        )?;
        notify_change(&self.graph, self.id, ContainerChange::Add, Some(item));
        Ok(())
    }

    pub fn remove(&self, item: EntityId) -> Result<()> {
        self.graph.ensure_alive(self.id)?;
        let link = self.link_of(item).ok_or_else(|| self.not_member(item))?;
        self.detach(link, item);
        Ok(())
    }

    fn detach(&self, link: LinkId, item: EntityId) {
        if self.graph.discard_link(link) {
            notify_change(&self.graph, self.id, ContainerChange::Remove, Some(item));
        }
    }

    /// Remove `count` members starting at `start` (all remaining when
    /// `None`), insert `items` in their place, and return what was removed.
    pub fn splice(
        &self,
        start: EntityId,
        count: Option<usize>,
        items: impl IntoIterator<Item = EntityId>,
    ) -> Result<Vec<EntityId>> {
        self.graph.ensure_alive(self.id)?;
        let items: Vec<EntityId> = items.into_iter().collect();
        let start_link = self.link_of(start).ok_or_else(|| self.not_member(start))?;

        let chain = self.chain();
        let from = chain.iter().position(|(l, _)| *l == start_link).unwrap_or(chain.len());
        let to = match count {
            Some(n) => (from + n).min(chain.len()),
            None => chain.len(),
        };
        let removed: Vec<(LinkId, EntityId)> = chain[from..to].to_vec();
        let anchor = chain.get(to).map(|(_, e)| *e);

        let mut seen = HashSet::new();
        for item in &items {
            if !seen.insert(*item) {
                return Err(Error::Duplicate(format!("{item} appears twice in splice")));
            }
            let staying = self.link_of(*item).is_some() && !removed.iter().any(|(_, e)| e == item);
            if staying {
                return Err(Error::Duplicate(format!("{item} is already in list {}", self.id)));
            }
            check_candidate(&self.graph, self.id, *item)?;
        }

        for (link, item) in &removed {
            self.detach(*link, *item);
        }
        for item in items {
            let before = anchor.and_then(|a| self.link_of(a));
            self.attach(item, before)?;
        }
        Ok(removed.into_iter().map(|(_, e)| e).collect())
    }

    /// Make the list equal `items`: removals first, then the fewest moves
    /// that restore order, then insertions. Emits one `Reorder` if anything
    /// moved; replacing with the current contents does nothing.
    pub fn replace(&self, items: impl IntoIterator<Item = EntityId>) -> Result<()> {
        self.graph.ensure_alive(self.id)?;
        let desired: Vec<EntityId> = items.into_iter().collect();
        let mut wanted = HashSet::with_capacity(desired.len());
        for item in &desired {
            if !wanted.insert(*item) {
                return Err(Error::Duplicate(format!("{item} appears twice in replacement")));
            }
            if self.link_of(*item).is_none() {
                check_candidate(&self.graph, self.id, *item)?;
            }
        }

        for (link, item) in self.chain() {
            if !wanted.contains(&item) {
                self.detach(link, item);
            }
        }

        let position: HashMap<EntityId, usize> =
            self.chain().into_iter().enumerate().map(|(i, (_, e))| (e, i)).collect();
        let kept: Vec<EntityId> =
            desired.iter().copied().filter(|e| position.contains_key(e)).collect();
        let order: Vec<usize> = kept.iter().filter_map(|e| position.get(e).copied()).collect();
        let stable = longest_increasing_run(&order);
        let mut moved = 0usize;
        for (i, item) in kept.iter().enumerate() {
            if stable.contains(&i) {
                continue;
            }
            let before = match i {
                0 => self.head(),
                _ => self.link_of(kept[i - 1]).and_then(|l| self.next_link(l)),
            };
            if let Some(link) = self.link_of(*item) {
                if before != Some(link) {
                    self.move_link(link, before);
                    moved += 1;
                }
            }
        }

        let mut previous: Option<EntityId> = None;
        for item in &desired {
            if self.link_of(*item).is_none() {
                let before = match previous {
                    Some(p) => self.link_of(p).and_then(|l| self.next_link(l)),
                    None => self.head(),
                };
                self.attach(*item, before)?;
            }
            previous = Some(*item);
        }

        if moved > 0 {
            tracing::trace!(list = %self.id, moved, "list.reorder");
            notify_change(&self.graph, self.id, ContainerChange::Reorder, None);
        }
        Ok(())
    }

    fn move_link(&self, link: LinkId, before: Option<LinkId>) {
        let mut arena = self.graph.inner.arena.borrow_mut();
        arena.unsplice(self.id, link);
        arena.splice(self.id, link, before);
    }

    pub fn first(&self) -> Option<EntityId> {
        self.iter().next()
    }

    pub fn last(&self) -> Option<EntityId> {
        let arena = self.graph.inner.arena.borrow();
        let tail = arena.entities.get(&self.id)?.container.as_ref()?.tail?;
        arena.links.get(tail).map(|r| r.target)
    }

    pub fn get(&self, index: usize) -> Option<EntityId> {
        self.iter().nth(index)
    }

    pub fn index_of(&self, item: EntityId) -> Option<usize> {
        self.link_of(item)?;
        self.iter().position(|e| e == item)
    }

    pub fn to_vec(&self) -> Vec<EntityId> {
        self.chain().into_iter().map(|(_, e)| e).collect()
    }

    /// Iterate head to tail. Removing the current or an earlier member while
    /// iterating is fine.
    pub fn iter(&self) -> ListIter {
        ListIter { graph: self.graph.clone(), next: self.head() }
    }
}

impl Container for ManagedList {
    fn graph(&self) -> &Graph {
        &self.graph
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn members(&self) -> Vec<EntityId> {
        self.to_vec()
    }

    fn clear(&self) -> Result<()> {
        self.graph.ensure_alive(self.id)?;
        for (link, item) in self.chain() {
            self.detach(link, item);
        }
        Ok(())
    }

    fn count(&self) -> usize {
        let arena = self.graph.inner.arena.borrow();
        arena
            .entities
            .get(&self.id)
            .and_then(|r| r.container.as_ref())
            .map(|c| c.count)
            .unwrap_or(0)
    }

    fn includes(&self, item: EntityId) -> bool {
        self.link_of(item).is_some()
    }
}

impl std::fmt::Debug for ManagedList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedList").field("id", &self.id).field("items", &self.to_vec()).finish()
    }
}

/// Head-to-tail iterator. Holds the link of the next member, not a borrow.
pub struct ListIter {
    graph: Graph,
    next: Option<LinkId>,
}

impl Iterator for ListIter {
    type Item = EntityId;

    fn next(&mut self) -> Option<EntityId> {
        let link = self.next?;
        let arena = self.graph.inner.arena.borrow();
        let record = arena.links.get(link)?;
        self.next = record.next;
        Some(record.target)
    }
}

/// Indices into `seq` of one longest strictly increasing subsequence.
fn longest_increasing_run(seq: &[usize]) -> HashSet<usize> {
    // tails[k]: index of the smallest tail of an increasing run of length k+1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (i, value) in seq.iter().enumerate() {
        let at = tails.partition_point(|&t| seq[t] < *value);
        if at > 0 {
            prev[i] = Some(tails[at - 1]);
        }
        if at == tails.len() {
            tails.push(i);
        } else {
            tails[at] = i;
        }
    }
    let mut run = HashSet::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        run.insert(i);
        cursor = prev[i];
    }
    run
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::ManagedEvent;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn items(graph: &Graph, n: usize) -> Vec<EntityId> {
        (0..n).map(|_| graph.create(&Class::managed_object())).collect()
    }

    fn record_events(graph: &Graph, list: &ManagedList) -> Rc<RefCell<Vec<String>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let watcher = graph.create(&Class::managed_object());
        graph
            .create_link(
                watcher,
                list.id(),
                SlotKey::Ref,
                crate::LinkOptions::reference().on_event(move |_, _, event: &ManagedEvent| {
                    l.borrow_mut().push(event.name().to_string());
                    Ok(())
                }),
            )
            .unwrap();
        log
    }

    #[test]
    fn test_add_insert_and_order() {
        let graph = Graph::new();
        let list = graph.create_list();
        let [a, b, c] = items(&graph, 3)[..] else { unreachable!() };
        list.add(a).unwrap();
        list.add(c).unwrap();
        list.insert(b, Some(c)).unwrap();
        assert_eq!(list.to_vec(), vec![a, b, c]);
        assert_eq!(list.first(), Some(a));
        assert_eq!(list.last(), Some(c));
        assert_eq!(list.get(1), Some(b));
        assert_eq!(list.index_of(c), Some(2));
        assert_eq!(list.count(), 3);
    }

    #[test]
    fn test_insert_errors() {
        let graph = Graph::new();
        let list = graph.create_list();
        let [a, b] = items(&graph, 2)[..] else { unreachable!() };
        list.add(a).unwrap();
        assert!(matches!(list.add(a), Err(Error::Duplicate(_))));
        assert!(matches!(list.insert(b, Some(b)), Err(Error::NotFound(_))));
        assert!(matches!(list.remove(b), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_splice_removes_rest_and_inserts() {
        let graph = Graph::new();
        let list = graph.create_list();
        let [a, b, c, d] = items(&graph, 4)[..] else { unreachable!() };
        for item in [a, b, c] {
            list.add(item).unwrap();
        }
        let removed = list.splice(b, None, [d]).unwrap();
        assert_eq!(removed, vec![b, c]);
        assert_eq!(list.to_vec(), vec![a, d]);
    }

    #[test]
    fn test_splice_inserts_in_place() {
        let graph = Graph::new();
        let list = graph.create_list();
        let [a, b, c, d] = items(&graph, 4)[..] else { unreachable!() };
        for item in [a, b, c] {
            list.add(item).unwrap();
        }
        let removed = list.splice(b, Some(1), [d]).unwrap();
        assert_eq!(removed, vec![b]);
        assert_eq!(list.to_vec(), vec![a, d, c]);
    }

    #[test]
    fn test_replace_with_same_contents_is_silent() {
        let graph = Graph::new();
        let list = graph.create_list();
        for item in items(&graph, 3) {
            list.add(item).unwrap();
        }
        let log = record_events(&graph, &list);
        list.replace(list.to_vec()).unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_replace_moves_inserts_and_removes() {
        let graph = Graph::new();
        let list = graph.create_list();
        let [a, b, c, d, e] = items(&graph, 5)[..] else { unreachable!() };
        for item in [a, b, c, d] {
            list.add(item).unwrap();
        }
        let log = record_events(&graph, &list);
        list.replace([d, a, e, c]).unwrap();
        assert_eq!(list.to_vec(), vec![d, a, e, c]);
        // Reorder is emitted once, after insertions.
        assert_eq!(*log.borrow(), vec!["Remove", "Add", "Reorder"]);
    }

    #[test]
    fn test_iteration_survives_removing_current() {
        let graph = Graph::new();
        let list = graph.create_list();
        let all = items(&graph, 4);
        for item in &all {
            list.add(*item).unwrap();
        }
        let mut visited = Vec::new();
        for item in list.iter() {
            visited.push(item);
            list.remove(item).unwrap();
        }
        assert_eq!(visited, all);
        assert!(list.is_empty());
    }

    #[test]
    fn test_longest_increasing_run() {
        let run = longest_increasing_run(&[3, 0, 1, 4, 2]);
        assert_eq!(run.len(), 3);
        assert!(run.contains(&1) && run.contains(&2));
    }
}
