//! # Observation layer
//!
//! Attaches behaviour to every instance of a class without subclassing. An
//! [`ObserverSpec`] names the triggers it cares about (property writes,
//! events arriving through a property, all events, change events, named
//! events) and a factory for the per-instance [`Observer`].
//!
//! ## Invariants
//!
//! 1. One observer instance per (entity, spec), created on the first
//!    qualifying trigger and cached on the entity record.
//! 2. A trigger that reaches an instance still under construction is a
//!    recursion error; it is reported and the trigger is dropped.
//! 3. Handlers never see a `RefCell` borrow of the arena.
//! 4. Async handlers run on the scheduler, see only the latest payload, and
//!    never run closer together than their `min_interval`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use hashbrown::HashMap;
use tokio::time::Instant;

use crate::model::{EntityId, ManagedEvent, ObserverId, Value};
use crate::{Error, Graph, Result};

// ============================================================================
// Observer contract
// ============================================================================

/// Per-instance observer. Every method defaults to doing nothing.
pub trait Observer {
    /// A watched property changed.
    fn on_property_change(
        &self,
        _graph: &Graph,
        _entity: EntityId,
        _property: &str,
        _value: &Value,
    ) -> Result<()> {
        Ok(())
    }

    /// The entity referenced by a watched property emitted `event`.
    fn on_property_event(
        &self,
        _graph: &Graph,
        _entity: EntityId,
        _property: &str,
        _event: &ManagedEvent,
    ) -> Result<()> {
        Ok(())
    }

    fn on_event(&self, _graph: &Graph, _entity: EntityId, _event: &ManagedEvent) -> Result<()> {
        Ok(())
    }

    /// Change and container events only.
    fn on_change(&self, _graph: &Graph, _entity: EntityId, _event: &ManagedEvent) -> Result<()> {
        Ok(())
    }

    fn on_named_event(
        &self,
        _graph: &Graph,
        _entity: EntityId,
        _event: &ManagedEvent,
    ) -> Result<()> {
        Ok(())
    }
}

/// How a handler is invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerMode {
    /// Inside the write or emit that triggered it.
    #[default]
    Sync,
    /// On the scheduler, coalesced to the latest payload.
    Async { min_interval: Option<Duration> },
}

impl HandlerMode {
    pub fn deferred() -> Self {
        HandlerMode::Async { min_interval: None }
    }

    pub fn rate_limited(min_interval: Duration) -> Self {
        HandlerMode::Async { min_interval: Some(min_interval) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Trigger {
    Property(String),
    PropertyEvent(String),
    AllEvents,
    ChangeEvents,
    Named(String),
}

struct Subscription {
    trigger: Trigger,
    mode: HandlerMode,
}

type Factory = Rc<dyn Fn(&Graph, EntityId) -> Result<Rc<dyn Observer>>>;

/// Observer registration for a class. See [`Class::add_observer`](crate::Class::add_observer).
pub struct ObserverSpec {
    id: ObserverId,
    name: String,
    factory: Factory,
    subscriptions: Vec<Subscription>,
}

impl ObserverSpec {
    pub fn new<O: Observer + 'static>(
        name: impl Into<String>,
        factory: impl Fn(&Graph, EntityId) -> Result<O> + 'static,
    ) -> Self {
        Self {
            id: ObserverId::next(),
            name: name.into(),
            factory: Rc::new(move |graph, id| Ok(Rc::new(factory(graph, id)?) as Rc<dyn Observer>)),
            subscriptions: Vec::new(),
        }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(mut self, trigger: Trigger, mode: HandlerMode) -> Self {
        self.subscriptions.push(Subscription { trigger, mode });
        self
    }

    pub fn watch(self, property: &str) -> Self {
        self.watch_with(property, HandlerMode::Sync)
    }

    pub fn watch_with(self, property: &str, mode: HandlerMode) -> Self {
        self.subscribe(Trigger::Property(property.to_string()), mode)
    }

    /// Forward events emitted by whatever `property` references.
    pub fn watch_events(self, property: &str) -> Self {
        self.watch_events_with(property, HandlerMode::Sync)
    }

    pub fn watch_events_with(self, property: &str, mode: HandlerMode) -> Self {
        self.subscribe(Trigger::PropertyEvent(property.to_string()), mode)
    }

    pub fn on_all_events(self, mode: HandlerMode) -> Self {
        self.subscribe(Trigger::AllEvents, mode)
    }

    pub fn on_change_events(self, mode: HandlerMode) -> Self {
        self.subscribe(Trigger::ChangeEvents, mode)
    }

    pub fn on_named_event(self, name: &str, mode: HandlerMode) -> Self {
        self.subscribe(Trigger::Named(name.to_string()), mode)
    }
}

/// Per-entity cache entry.
pub(crate) enum ObserverSlot {
    Constructing,
    Ready(Rc<dyn Observer>),
}

#[derive(Clone)]
enum Payload {
    Value(Value),
    Event(ManagedEvent),
}

// ============================================================================
// Instances
// ============================================================================

/// Cached instance for (entity, spec), constructing it on first use.
/// `Ok(None)` for entities that are gone and never had one.
fn instance(
    graph: &Graph,
    entity: EntityId,
    spec: &ObserverSpec,
) -> Result<Option<Rc<dyn Observer>>> {
    {
        let mut arena = graph.inner.arena.borrow_mut();
        let Some(record) = arena.entities.get_mut(&entity) else {
            return Ok(None);
        };
        match record.observers.get(&spec.id) {
            Some(ObserverSlot::Ready(observer)) => return Ok(Some(observer.clone())),
            Some(ObserverSlot::Constructing) => {
                return Err(Error::RecursionLimit(format!(
                    "observer '{}' on {entity} was triggered while being constructed",
                    spec.name
                )));
            }
            None if !record.state.is_alive() => return Ok(None),
            None => {
                record.observers.insert(spec.id, ObserverSlot::Constructing);
            }
        }
    }

    tracing::trace!(entity = %entity, observer = %spec.name, "observer.create");
    let created = (spec.factory)(graph, entity);

    let mut arena = graph.inner.arena.borrow_mut();
    if let Some(record) = arena.entities.get_mut(&entity) {
        match &created {
            Ok(observer) => {
                record.observers.insert(spec.id, ObserverSlot::Ready(observer.clone()));
            }
            Err(_) => {
                record.observers.remove(&spec.id);
            }
        }
    }
    created.map(Some)
}

impl Graph {
    /// Observer instance of `spec` for `entity`, constructing it if needed.
    pub fn observer(&self, entity: EntityId, spec: ObserverId) -> Result<Rc<dyn Observer>> {
        let class = self.class_of(entity).ok_or(Error::Destroyed(entity))?;
        let found = class.observers().into_iter().find(|s| s.id == spec);
        let spec = found.ok_or_else(|| {
            Error::NotFound(format!("observer {} is not registered for {}", spec.0, class.name()))
        })?;
        instance(self, entity, &spec)?.ok_or(Error::Destroyed(entity))
    }
}

fn invoke(
    graph: &Graph,
    entity: EntityId,
    spec: &ObserverSpec,
    trigger: &Trigger,
    payload: &Payload,
) -> Result<()> {
    let Some(observer) = instance(graph, entity, spec)? else {
        return Ok(());
    };
    match (trigger, payload) {
        (Trigger::Property(name), Payload::Value(value)) => {
            observer.on_property_change(graph, entity, name, value)
        }
        (Trigger::PropertyEvent(name), Payload::Event(event)) => {
            observer.on_property_event(graph, entity, name, event)
        }
        (Trigger::AllEvents, Payload::Event(event)) => observer.on_event(graph, entity, event),
        (Trigger::ChangeEvents, Payload::Event(event)) => observer.on_change(graph, entity, event),
        (Trigger::Named(_), Payload::Event(event)) => observer.on_named_event(graph, entity, event),
        _ => Ok(()),
    }
}

fn deliver(
    graph: &Graph,
    entity: EntityId,
    spec: &Rc<ObserverSpec>,
    index: usize,
    payload: Payload,
) {
    let subscription = &spec.subscriptions[index];
    match subscription.mode {
        HandlerMode::Sync => {
            if let Err(err) = invoke(graph, entity, spec, &subscription.trigger, &payload) {
                graph.report_unhandled(err);
            }
        }
        HandlerMode::Async { min_interval } => {
            let key = AsyncKey { entity, observer: spec.id, subscription: index };
            graph.inner.async_handlers.enqueue(graph, key, spec.clone(), payload, min_interval);
        }
    }
}

fn dispatch(graph: &Graph, entity: EntityId, matches: impl Fn(&Trigger) -> bool, payload: Payload) {
    let Some(class) = graph.class_of(entity) else {
        return;
    };
    for spec in class.observers() {
        for index in 0..spec.subscriptions.len() {
            if matches(&spec.subscriptions[index].trigger) {
                deliver(graph, entity, &spec, index, payload.clone());
            }
        }
    }
}

pub(crate) fn dispatch_property(graph: &Graph, entity: EntityId, name: &str, value: &Value) {
    dispatch(
        graph,
        entity,
        |t| matches!(t, Trigger::Property(p) if p == name),
        Payload::Value(value.clone()),
    );
}

pub(crate) fn dispatch_property_event(
    graph: &Graph,
    entity: EntityId,
    name: &str,
    event: &ManagedEvent,
) {
    dispatch(
        graph,
        entity,
        |t| matches!(t, Trigger::PropertyEvent(p) if p == name),
        Payload::Event(event.clone()),
    );
}

pub(crate) fn dispatch_event(graph: &Graph, entity: EntityId, event: &ManagedEvent) {
    dispatch(
        graph,
        entity,
        |t| match t {
            Trigger::AllEvents => true,
            Trigger::ChangeEvents => event.is_change(),
            Trigger::Named(name) => event.name() == name,
            _ => false,
        },
        Payload::Event(event.clone()),
    );
}

// ============================================================================
// Deferred handlers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AsyncKey {
    entity: EntityId,
    observer: ObserverId,
    subscription: usize,
}

#[derive(Default)]
struct AsyncSlot {
    scheduled: bool,
    latest: Option<Payload>,
    last_run: Option<Instant>,
}

/// Coalescing state for async handlers, per (entity, observer, trigger).
#[derive(Default)]
pub(crate) struct AsyncHandlers {
    slots: RefCell<HashMap<AsyncKey, AsyncSlot>>,
}

impl AsyncHandlers {
    fn enqueue(
        &self,
        graph: &Graph,
        key: AsyncKey,
        spec: Rc<ObserverSpec>,
        payload: Payload,
        min_interval: Option<Duration>,
    ) {
        let delay = {
            let mut slots = self.slots.borrow_mut();
            let slot = slots.entry(key).or_default();
            slot.latest = Some(payload);
            if slot.scheduled {
                tracing::trace!(entity = %key.entity, observer = %spec.name, "observer.coalesce");
                return;
            }
            slot.scheduled = true;
            match (min_interval, slot.last_run) {
                (Some(interval), Some(last)) => {
                    (last + interval).checked_duration_since(Instant::now())
                }
                _ => None,
            }
        };

        let weak = graph.downgrade();
        graph.inner.scheduler.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let Some(graph) = weak.upgrade() else {
                return;
            };
            let Some(payload) = graph.inner.async_handlers.take(key) else {
                return;
            };
            if !graph.is_alive(key.entity) {
                return;
            }
            let trigger = &spec.subscriptions[key.subscription].trigger;
            if let Err(err) = invoke(&graph, key.entity, &spec, trigger, &payload) {
                graph.report_unhandled(err);
            }
        });
    }

    fn take(&self, key: AsyncKey) -> Option<Payload> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(&key)?;
        slot.scheduled = false;
        slot.last_run = Some(Instant::now());
        slot.latest.take()
    }

    /// Drop coalescing state of a removed entity.
    pub(crate) fn forget(&self, entity: EntityId) {
        self.slots.borrow_mut().retain(|key, _| key.entity != entity);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entity::Class;

    #[derive(Default)]
    struct Log(Rc<RefCell<Vec<String>>>);

    impl Observer for Log {
        fn on_property_change(
            &self,
            _graph: &Graph,
            _entity: EntityId,
            property: &str,
            value: &Value,
        ) -> Result<()> {
            self.0.borrow_mut().push(format!("{property}={value}"));
            Ok(())
        }

        fn on_change(&self, _graph: &Graph, _entity: EntityId, event: &ManagedEvent) -> Result<()> {
            self.0.borrow_mut().push(format!("change:{}", event.name()));
            Ok(())
        }

        fn on_named_event(
            &self,
            _graph: &Graph,
            _entity: EntityId,
            event: &ManagedEvent,
        ) -> Result<()> {
            self.0.borrow_mut().push(format!("named:{}", event.name()));
            Ok(())
        }
    }

    fn logging_spec(log: &Rc<RefCell<Vec<String>>>) -> ObserverSpec {
        let log = log.clone();
        ObserverSpec::new("log", move |_, _| Ok(Log(log.clone())))
    }

    #[test]
    fn test_watch_fires_only_on_change() {
        let graph = Graph::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let class = Class::builder("Watched").build();
        class.add_observer(logging_spec(&log).watch("title"));

        let id = graph.create(&class);
        graph.set(id, "title", "a").unwrap();
        graph.set(id, "title", "a").unwrap();
        graph.set(id, "other", 1).unwrap();
        graph.set(id, "title", "b").unwrap();
        assert_eq!(*log.borrow(), vec![r#"title="a""#.to_string(), r#"title="b""#.to_string()]);
    }

    #[test]
    fn test_instance_is_created_once() {
        let graph = Graph::new();
        let created = Rc::new(Cell::new(0));
        let c = created.clone();
        let class = Class::builder("Counted").build();
        class.add_observer(
            ObserverSpec::new("counted", move |_, _| {
                c.set(c.get() + 1);
                Ok(Log::default())
            })
            .watch("x"),
        );

        let id = graph.create(&class);
        assert_eq!(created.get(), 0);
        graph.set(id, "x", 1).unwrap();
        graph.set(id, "x", 2).unwrap();
        assert_eq!(created.get(), 1);
    }

    #[test]
    fn test_change_and_named_events() {
        let graph = Graph::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let class = Class::builder("Evented").build();
        class.add_observer(
            logging_spec(&log)
                .on_change_events(HandlerMode::Sync)
                .on_named_event("Ping", HandlerMode::Sync),
        );

        let id = graph.create(&class);
        graph.emit(id, ManagedEvent::new("Ping")).unwrap();
        graph.emit(id, ManagedEvent::change()).unwrap();
        assert_eq!(*log.borrow(), vec!["named:Ping".to_string(), "change:Change".to_string()]);
    }

    #[test]
    fn test_reentrant_construction_is_reported() {
        let graph = Graph::new();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let e = errors.clone();
        graph.on_unhandled_error(move |err| {
            e.borrow_mut().push(matches!(err, Error::RecursionLimit(_)));
        });
        let class = Class::builder("Reentrant").build();
        class.add_observer(
            ObserverSpec::new("reentrant", |graph: &Graph, id| {
                graph.set(id, "x", 99)?;
                Ok(Log::default())
            })
            .watch("x"),
        );

        let id = graph.create(&class);
        graph.set(id, "x", 1).unwrap();
        assert_eq!(*errors.borrow(), vec![true]);
    }

    #[tokio::test]
    async fn test_async_handler_coalesces_to_latest() {
        let graph = Graph::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let class = Class::builder("Deferred").build();
        class.add_observer(logging_spec(&log).watch_with("n", HandlerMode::deferred()));

        let id = graph.create(&class);
        for n in 1..=3 {
            graph.set(id, "n", n).unwrap();
        }
        assert!(log.borrow().is_empty());
        graph.settle().await;
        assert_eq!(*log.borrow(), vec!["n=3".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_handler_respects_min_interval() {
        let graph = Graph::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let class = Class::builder("Limited").build();
        class.add_observer(
            logging_spec(&log)
                .watch_with("n", HandlerMode::rate_limited(Duration::from_millis(100))),
        );

        let id = graph.create(&class);
        graph.set(id, "n", 1).unwrap();
        graph.settle().await;
        let first = Instant::now();

        graph.set(id, "n", 2).unwrap();
        graph.settle().await;
        assert!(Instant::now() - first >= Duration::from_millis(100));
        assert_eq!(*log.borrow(), vec!["n=1".to_string(), "n=2".to_string()]);
    }
}
