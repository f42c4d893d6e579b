//! # managed-graph: reactive managed object graph
//!
//! Entities live in a [`Graph`], reference each other only through links,
//! go through an asynchronous activate/deactivate/destroy lifecycle, and emit
//! events that travel back along inbound links to whoever refers to them.
//!
//! ## Design Principles
//!
//! 1. **Links are the only edges**: property references, ownership and
//!    container membership are all [`LinkId`]s with symmetric bookkeeping
//! 2. **One owner**: every entity has at most one parent link; orphans are
//!    destroyed on the next scheduler pass
//! 3. **Handlers never unwind the emitter**: errors raised by event handlers
//!    and observers go to the unhandled-error sink
//! 4. **Single-threaded**: a graph is `!Send`; deferred work runs when the
//!    owner drives [`Graph::settle`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use managed_graph::{Class, Graph, Value};
//!
//! # async fn example() -> managed_graph::Result<()> {
//! let graph = Graph::new();
//! let person = Class::builder("Person").child("address").build();
//! let address = Class::builder("Address").build();
//!
//! let ada = graph.create(&person);
//! let home = graph.create(&address);
//! graph.set(ada, "address", home)?;
//! graph.set(home, "city", "London")?;
//!
//! graph.activate(ada).await?;
//! graph.destroy(ada).await?;
//! assert!(!graph.is_alive(home));
//! # Ok(())
//! # }
//! ```

use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod config;
pub mod link;
pub mod entity;
pub mod container;
pub mod observe;
pub mod component;
mod scheduler;
mod unhandled;

// ============================================================================
// Re-exports
// ============================================================================

pub use model::{
    names, BindingId, ClassId, ContainerChange, EntityId, EventKind, LinkId, ManagedEvent,
    ManagedState, ObserverId, PropertyMap, Value,
};
pub use config::GraphConfig;
pub use link::{LinkInfo, LinkOptions, Ownership, SlotKey};
pub use entity::{Class, ClassBuilder, GraphSnapshot, Lifecycle, Transition};
pub use container::{Container, ManagedList, ManagedMap, ManagedRef};
pub use observe::{HandlerMode, Observer, ObserverSpec};
pub use component::{bind, bind_template, bind_with_default, Binding};
pub use unhandled::{clear_unhandled_error_handler, set_unhandled_error_handler};

/// Re-exported so `Lifecycle` implementations don't need their own dependency.
pub use async_trait::async_trait;

use entity::Arena;
use observe::AsyncHandlers;
use scheduler::Scheduler;

// ============================================================================
// Top-level Graph handle
// ============================================================================

/// Handle to a managed object graph. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct Graph {
    pub(crate) inner: Rc<GraphInner>,
}

pub(crate) struct GraphInner {
    pub(crate) arena: RefCell<Arena>,
    pub(crate) scheduler: Scheduler,
    pub(crate) config: GraphConfig,
    pub(crate) error_sink: RefCell<Option<Rc<dyn Fn(&Error)>>>,
    pub(crate) async_handlers: AsyncHandlers,
}

/// Non-owning graph handle, held by queued tasks so they don't keep a
/// dropped graph alive.
#[derive(Clone)]
pub(crate) struct WeakGraph(Weak<GraphInner>);

impl WeakGraph {
    pub(crate) fn upgrade(&self) -> Option<Graph> {
        self.0.upgrade().map(|inner| Graph { inner })
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    /// Limits below 1 in `config` are raised to 1.
    pub fn with_config(config: GraphConfig) -> Self {
        let config = config.clamped();
        tracing::debug!(?config, "graph.create");
        Self {
            inner: Rc::new(GraphInner {
                arena: RefCell::new(Arena::new(config.link_pool_size)),
                scheduler: Scheduler::new(config.scheduler_high_water),
                error_sink: RefCell::new(None),
                async_handlers: AsyncHandlers::default(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakGraph {
        WeakGraph(Rc::downgrade(&self.inner))
    }

    /// Run deferred work (orphan checks, async handlers, background
    /// transitions) until nothing is left.
    pub async fn settle(&self) {
        self.inner.scheduler.run_until_idle().await;
    }

    /// Queue a task on this graph's scheduler. It runs during `settle`.
    pub fn spawn(&self, task: impl Future<Output = ()> + 'static) {
        self.inner.scheduler.spawn(task);
    }

    /// Tasks queued or running.
    pub fn pending_tasks(&self) -> usize {
        self.inner.scheduler.pending()
    }

    pub fn scheduled_total(&self) -> u64 {
        self.inner.scheduler.scheduled_total()
    }

    pub fn completed_total(&self) -> u64 {
        self.inner.scheduler.completed_total()
    }

    /// Install a per-graph sink for handler errors. Takes precedence over the
    /// process-wide handler.
    pub fn on_unhandled_error(&self, sink: impl Fn(&Error) + 'static) {
        *self.inner.error_sink.borrow_mut() = Some(Rc::new(sink));
    }

    pub(crate) fn report_unhandled(&self, err: Error) {
        let sink = self.inner.error_sink.borrow().clone();
        match sink {
            Some(sink) => {
                tracing::error!(error = %err, "unhandled error in handler");
                sink(&err);
            }
            None => unhandled::report_unhandled(&err),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Entity {0} has been destroyed")]
    Destroyed(EntityId),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Recursion limit: {0}")]
    RecursionLimit(String),

    #[error("Transition of {entity} to {target} was superseded")]
    Superseded { entity: EntityId, target: ManagedState },

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Destroyed(EntityId(3)).to_string(), "Entity #3 has been destroyed");
        assert_eq!(
            Error::Validation(vec!["a".into(), "b".into()]).to_string(),
            "Validation failed: a; b"
        );
    }

    #[tokio::test]
    async fn test_graph_handle_clones_share_state() {
        let graph = Graph::new();
        let other = graph.clone();
        let id = graph.create(&Class::managed_object());
        assert!(other.is_alive(id));
    }

    #[test]
    fn test_entity_ids_are_unique_across_graphs() {
        let first = Graph::new();
        let second = Graph::new();
        let a = first.create(&Class::managed_object());
        let b = second.create(&Class::managed_object());
        assert_ne!(a, b);
        assert!(first.is_alive(a));
        assert!(!first.is_alive(b));
    }

    #[tokio::test]
    async fn test_zero_limits_are_clamped() {
        let graph = Graph::with_config(GraphConfig::default().with_max_emit_depth(0));
        assert_eq!(graph.config().max_emit_depth, 1);
        let id = graph.create(&Class::managed_object());
        graph.emit(id, ManagedEvent::new("Ping")).unwrap();
        graph.activate(id).await.unwrap();
        assert_eq!(graph.state(id), ManagedState::Active);
    }

    #[tokio::test]
    async fn test_weak_graph_does_not_keep_graph_alive() {
        let graph = Graph::new();
        let weak = graph.downgrade();
        assert!(weak.upgrade().is_some());
        drop(graph);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_per_graph_error_sink() {
        let graph = Graph::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        graph.on_unhandled_error(move |e| s.borrow_mut().push(e.to_string()));
        graph.report_unhandled(Error::Handler("boom".into()));
        assert_eq!(seen.borrow().as_slice(), ["Handler error: boom"]);
    }
}
