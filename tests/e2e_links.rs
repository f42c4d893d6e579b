//! End-to-end tests for the link fabric: symmetry, ownership, reference
//! counting, dependency links and orphan collection.

use std::cell::RefCell;
use std::rc::Rc;

use managed_graph::{
    Class, EntityId, Error, Graph, LinkOptions, ManagedEvent, ManagedState, Ownership, SlotKey,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn object(graph: &Graph) -> EntityId {
    graph.create(&Class::managed_object())
}

/// Every outbound link is listed on its target, and vice versa.
fn assert_symmetric(graph: &Graph, ids: &[EntityId]) {
    for id in ids {
        for link in graph.outbound_links(*id) {
            assert!(
                graph.inbound_links(link.target).contains(&link),
                "{} missing from inbound of {}",
                link.id,
                link.target
            );
        }
        for link in graph.inbound_links(*id) {
            assert!(graph.outbound_links(link.source).contains(&link));
        }
    }
}

// ============================================================================
// 1. Edge symmetry: both ends agree, before and after discarding
// ============================================================================

#[test]
fn test_edge_symmetry() {
    let graph = Graph::new();
    let ids: Vec<EntityId> = (0..4).map(|_| object(&graph)).collect();

    let first = graph
        .create_link(ids[0], ids[1], SlotKey::property("a"), LinkOptions::reference())
        .unwrap();
    graph
        .create_link(ids[0], ids[2], SlotKey::property("b"), LinkOptions::child())
        .unwrap();
    graph
        .create_link(ids[3], ids[1], SlotKey::property("c"), LinkOptions::reference())
        .unwrap();
    assert_symmetric(&graph, &ids);

    assert!(graph.discard_link(first));
    assert_symmetric(&graph, &ids);
    assert!(graph.link_info(first).is_none());
    assert!(graph.inbound_links(ids[1]).iter().all(|l| l.id != first));
    assert!(graph.outbound_links(ids[0]).iter().all(|l| l.id != first));
    assert!(!graph.discard_link(first));
}

// ============================================================================
// 2. Single parent: a second owner takes over
// ============================================================================

#[test]
fn test_single_parent_invariant() {
    let graph = Graph::new();
    let first = object(&graph);
    let second = object(&graph);
    let item = object(&graph);

    graph
        .create_link(first, item, SlotKey::property("item"), LinkOptions::child())
        .unwrap();
    assert_eq!(graph.parent(item), Some(first));

    graph
        .create_link(second, item, SlotKey::property("item"), LinkOptions::child())
        .unwrap();
    assert_eq!(graph.parent(item), Some(second));
    let parents: Vec<_> = graph.inbound_links(item).into_iter().filter(|l| l.is_parent).collect();
    assert_eq!(parents.len(), 1);
    assert!(graph.outbound_links(first).is_empty());
}

#[test]
fn test_property_owner_is_cleared_when_child_moves() {
    let graph = Graph::new();
    let class = Class::builder("Holder").child("item").build();
    let first = graph.create(&class);
    let second = graph.create(&class);
    let item = object(&graph);

    graph.set(first, "item", item).unwrap();
    graph.set(second, "item", item).unwrap();
    assert_eq!(graph.get_ref(first, "item").unwrap(), None);
    assert_eq!(graph.get_ref(second, "item").unwrap(), Some(item));
    assert_eq!(graph.owned_children(second), vec![item]);
}

#[test]
fn test_ownership_cycles_are_rejected() {
    let graph = Graph::new();
    let class = Class::builder("Node").child("next").build();
    let a = graph.create(&class);
    let b = graph.create(&class);
    graph.set(a, "next", b).unwrap();

    assert!(matches!(graph.set(b, "next", a), Err(Error::InvalidReference(_))));
    assert!(matches!(graph.set(a, "next", a), Err(Error::InvalidReference(_))));
    assert_eq!(graph.parent(a), None);
}

// ============================================================================
// 3. Reference counting: every link adds and removes exactly one
// ============================================================================

#[test]
fn test_reference_count_tracks_links() {
    let graph = Graph::new();
    let target = object(&graph);
    let sources: Vec<EntityId> = (0..3).map(|_| object(&graph)).collect();

    let mut links = Vec::new();
    for (i, source) in sources.iter().enumerate() {
        links.push(
            graph
                .create_link(*source, target, SlotKey::property("t"), LinkOptions::reference())
                .unwrap(),
        );
        assert_eq!(graph.reference_count(target), i + 1);
    }
    for (i, link) in links.iter().enumerate() {
        graph.discard_link(*link);
        assert_eq!(graph.reference_count(target), sources.len() - i - 1);
    }
}

proptest! {
    #[test]
    fn prop_reference_count_matches_inbound_links(
        ops in prop::collection::vec((0usize..4, any::<bool>()), 1..40),
    ) {
        let graph = Graph::new();
        let target = object(&graph);
        let sources: Vec<EntityId> = (0..4).map(|_| object(&graph)).collect();
        let mut live: Vec<Option<managed_graph::LinkId>> = vec![None; sources.len()];

        for (index, add) in ops {
            let before = graph.reference_count(target);
            match (add, live[index]) {
                (true, None) => {
                    let link = graph
                        .create_link(
                            sources[index],
                            target,
                            SlotKey::property("t"),
                            LinkOptions::reference(),
                        )
                        .unwrap();
                    live[index] = Some(link);
                    prop_assert_eq!(graph.reference_count(target), before + 1);
                }
                (false, Some(link)) => {
                    prop_assert!(graph.discard_link(link));
                    live[index] = None;
                    prop_assert_eq!(graph.reference_count(target), before - 1);
                }
                _ => {
                    prop_assert_eq!(graph.reference_count(target), before);
                }
            }
            prop_assert_eq!(graph.reference_count(target), live.iter().flatten().count());
            prop_assert_eq!(graph.inbound_links(target).len(), graph.reference_count(target));
        }
    }
}

// ============================================================================
// 4. Dependency links destroy their source
// ============================================================================

#[tokio::test]
async fn test_dependency_destroys_source() {
    let graph = Graph::new();
    let class = Class::builder("Tenant").dependency("home").build();
    let home = object(&graph);
    let tenant = graph.create(&class);
    let bystander = object(&graph);
    graph.set(tenant, "home", home).unwrap();
    graph
        .create_link(bystander, home, SlotKey::property("seen"), LinkOptions::reference())
        .unwrap();

    graph.destroy(home).await.unwrap();
    graph.settle().await;
    assert_eq!(graph.state(tenant), ManagedState::Destroyed);
    assert_eq!(graph.state(bystander), ManagedState::Created);
    assert!(graph.outbound_links(bystander).is_empty());
}

#[tokio::test]
async fn test_reference_property_clears_on_target_destruction() {
    let graph = Graph::new();
    let class = Class::builder("Fan").reference("idol").build();
    let fan = graph.create(&class);
    let idol = object(&graph);
    graph.set(fan, "idol", idol).unwrap();

    graph.destroy(idol).await.unwrap();
    assert_eq!(graph.get_ref(fan, "idol").unwrap(), None);
    assert!(graph.is_alive(fan));
}

// ============================================================================
// 5. Cascade destruction reaches children before the owner completes
// ============================================================================

#[tokio::test]
async fn test_cascade_destroys_children_before_owner_completes() {
    let graph = Graph::new();
    let class = Class::builder("Tree").child("left").child("right").build();
    let root = graph.create(&class);
    let left = graph.create(&class);
    let right = graph.create(&class);
    let leaf = graph.create(&class);
    graph.set(root, "left", left).unwrap();
    graph.set(root, "right", right).unwrap();
    graph.set(left, "left", leaf).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let on_event = seen.clone();
    let on_unlink = seen.clone();
    let watcher = object(&graph);
    graph
        .create_link(
            watcher,
            root,
            SlotKey::property("root"),
            LinkOptions::dependency()
                .on_event(move |graph, _, event: &ManagedEvent| {
                    if event.name() == "Destroyed" {
                        let states: Vec<ManagedState> =
                            [left, right, leaf].iter().map(|c| graph.state(*c)).collect();
                        on_event.borrow_mut().push(("event", states));
                    }
                    Ok(())
                })
                .on_unlink(move |graph, _| {
                    let states: Vec<ManagedState> =
                        [left, right, leaf].iter().map(|c| graph.state(*c)).collect();
                    on_unlink.borrow_mut().push(("unlink", states));
                    Ok(())
                }),
        )
        .unwrap();

    graph.destroy(root).await.unwrap();
    let destroyed = vec![ManagedState::Destroyed; 3];
    assert_eq!(*seen.borrow(), vec![("event", destroyed.clone()), ("unlink", destroyed)]);
    assert_eq!(graph.entity_count(), 1);
    assert!(graph.is_alive(watcher));
}

// ============================================================================
// 6. Orphans are collected on the next scheduler pass
// ============================================================================

#[tokio::test]
async fn test_orphan_is_destroyed_after_settle() {
    let graph = Graph::new();
    let class = Class::builder("Owner").child("pet").build();
    let owner = graph.create(&class);
    let pet = object(&graph);
    graph.set(owner, "pet", pet).unwrap();

    graph.set(owner, "pet", None::<EntityId>).unwrap();
    assert!(graph.is_alive(pet));
    graph.settle().await;
    assert_eq!(graph.state(pet), ManagedState::Destroyed);
}

#[tokio::test]
async fn test_moving_between_owners_survives_settle() {
    let graph = Graph::new();
    let class = Class::builder("Owner").child("pet").build();
    let first = graph.create(&class);
    let second = graph.create(&class);
    let pet = object(&graph);
    graph.set(first, "pet", pet).unwrap();

    graph.set(first, "pet", None::<EntityId>).unwrap();
    graph.set(second, "pet", pet).unwrap();
    graph.settle().await;
    assert!(graph.is_alive(pet));
    assert_eq!(graph.parent(pet), Some(second));
}

#[tokio::test]
async fn test_rejected_adoption_keeps_previous_owner() {
    let graph = Graph::new();
    let first = object(&graph);
    let second = object(&graph);
    let child = object(&graph);
    let occupant = object(&graph);
    graph
        .create_link(first, child, SlotKey::property("c"), LinkOptions::child())
        .unwrap();
    graph
        .create_link(second, occupant, SlotKey::property("c"), LinkOptions::reference())
        .unwrap();

    let err = graph
        .create_link(second, child, SlotKey::property("c"), LinkOptions::child())
        .unwrap_err();
    assert!(matches!(err, Error::Duplicate(_)));
    assert_eq!(graph.parent(child), Some(first));

    graph.settle().await;
    assert!(graph.is_alive(child));
    assert_eq!(graph.parent(child), Some(first));
    assert_eq!(graph.outbound_links(second).len(), 1);
}

#[test]
fn test_second_child_link_from_same_owner_is_a_reference() {
    let graph = Graph::new();
    let owner = object(&graph);
    let item = object(&graph);
    graph
        .create_link(owner, item, SlotKey::property("a"), LinkOptions::child())
        .unwrap();
    let second = graph
        .create_link(owner, item, SlotKey::property("b"), LinkOptions::child())
        .unwrap();
    assert_eq!(graph.link_info(second).unwrap().ownership, Ownership::Reference);
    assert_eq!(graph.parent(item), Some(owner));
}

#[test]
fn test_links_to_destroyed_entities_fail() {
    let graph = Graph::new();
    let a = object(&graph);
    let missing = EntityId(9_999);
    let err = graph
        .create_link(a, missing, SlotKey::property("x"), LinkOptions::reference())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidReference(_)));
}

#[test]
fn test_snapshot_reports_links_and_values() {
    let graph = Graph::new();
    let class = Class::builder("Holder").child("item").build();
    let holder = graph.create(&class);
    let item = object(&graph);
    graph.set(holder, "item", item).unwrap();
    graph.set(item, "label", "x").unwrap();

    let snapshot = graph.snapshot();
    assert_eq!(snapshot.links.len(), 1);
    assert_eq!(snapshot.entity(item).unwrap().parent, Some(holder));
    assert_eq!(snapshot.entity(holder).unwrap().class, "Holder");
    let json = snapshot.to_json().unwrap();
    assert!(json.contains("\"label\""));
}
