//! Asynchronous lifecycle.
//!
//! ```text
//! CREATED ──activate──► ACTIVATING ──► ACTIVE ──deactivate──► DEACTIVATING ──► INACTIVE
//!    │                                    ▲                                        │
//!    │                                    └───────────────activate─────────────────┘
//!    └──────────── destroy (from any live state) ──► DESTROYING ──► DESTROYED
//! ```
//!
//! At most one transition runs per entity. A request made while another is
//! running waits for it; a newer request replaces an older waiting one,
//! which then resolves with [`Error::Superseded`]. A pending destroy is
//! never replaced.
//!
//! Every request is also queued on the graph's scheduler, so the transition
//! happens on the next `settle` even if the returned [`Transition`] is
//! dropped.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::{join_all, FutureExt, LocalBoxFuture, Shared};

use crate::link::UnlinkReason;
use crate::model::{EntityId, LinkId, ManagedEvent, ManagedState};
use crate::{Error, Graph, Result, WeakGraph};

/// Hooks run around state changes. Errors from `activating` and
/// `deactivating` abort the transition and restore the previous state.
#[async_trait(?Send)]
pub trait Lifecycle {
    async fn activating(&self, _graph: &Graph, _id: EntityId) -> Result<()> {
        Ok(())
    }

    async fn active(&self, _graph: &Graph, _id: EntityId) -> Result<()> {
        Ok(())
    }

    async fn deactivating(&self, _graph: &Graph, _id: EntityId) -> Result<()> {
        Ok(())
    }

    async fn inactive(&self, _graph: &Graph, _id: EntityId) -> Result<()> {
        Ok(())
    }

    /// Runs before the entity's links are released. Errors are reported and
    /// destruction continues.
    async fn destroying(&self, _graph: &Graph, _id: EntityId) -> Result<()> {
        Ok(())
    }
}

type SharedTransition = Shared<LocalBoxFuture<'static, Result<()>>>;

/// Handle to a requested transition. Resolves when it has run (or was
/// superseded).
pub struct Transition {
    state: TransitionState,
}

enum TransitionState {
    Done(Option<Result<()>>),
    Waiting(SharedTransition),
}

impl Transition {
    fn done(result: Result<()>) -> Self {
        Self { state: TransitionState::Done(Some(result)) }
    }

    fn waiting(future: SharedTransition) -> Self {
        Self { state: TransitionState::Waiting(future) }
    }
}

impl Future for Transition {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            TransitionState::Done(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            TransitionState::Waiting(future) => future.poll_unpin(cx),
        }
    }
}

#[derive(Clone)]
struct PendingTransition {
    target: ManagedState,
    future: SharedTransition,
    /// Set when a newer request replaces this one before it starts.
    cancelled: Rc<Cell<bool>>,
}

#[derive(Default)]
pub(crate) struct LifecycleSlot {
    in_flight: Option<PendingTransition>,
    pending: Option<PendingTransition>,
}

impl Graph {
    /// Move `id` to `ACTIVE`.
    pub fn activate(&self, id: EntityId) -> Transition {
        self.request_transition(id, ManagedState::Active)
    }

    /// Move `id` to `INACTIVE`. A `CREATED` entity counts as inactive.
    pub fn deactivate(&self, id: EntityId) -> Transition {
        self.request_transition(id, ManagedState::Inactive)
    }

    /// Deactivate if needed, release every outbound link, destroy owned
    /// children, then notify referrers. Destroying twice is harmless.
    pub fn destroy(&self, id: EntityId) -> Transition {
        self.request_transition(id, ManagedState::Destroyed)
    }

    fn request_transition(&self, id: EntityId, target: ManagedState) -> Transition {
        let destroying = target == ManagedState::Destroyed;
        let mut arena = self.inner.arena.borrow_mut();
        let Some(record) = arena.entities.get_mut(&id) else {
            return Transition::done(if destroying { Ok(()) } else { Err(Error::Destroyed(id)) });
        };
        let state = record.state;
        let slot = &mut record.lifecycle;

        if let Some(pending) = &slot.pending {
            if pending.target == target {
                return Transition::waiting(pending.future.clone());
            }
            if pending.target == ManagedState::Destroyed {
                return Transition::done(Err(Error::Destroyed(id)));
            }
        }
        if let Some(running) = &slot.in_flight {
            if running.target == ManagedState::Destroyed {
                if destroying {
                    return Transition::waiting(running.future.clone());
                }
                return Transition::done(Err(Error::Destroyed(id)));
            }
        }
        if let Some(replaced) = slot.pending.take() {
            tracing::debug!(
                entity = %id,
                replaced = %replaced.target,
                by = %target,
                "transition.supersede"
            );
            replaced.cancelled.set(true);
        }
        if let Some(running) = &slot.in_flight {
            if running.target == target {
                return Transition::waiting(running.future.clone());
            }
        } else {
            let settled = state == target
                || (target == ManagedState::Inactive && state == ManagedState::Created)
                || (destroying && !state.is_alive());
            if settled {
                return Transition::done(Ok(()));
            }
            if !destroying && !state.is_alive() {
                return Transition::done(Err(Error::Destroyed(id)));
            }
        }

        let cancelled = Rc::new(Cell::new(false));
        let future = drive(self.downgrade(), id, target, cancelled.clone()).boxed_local().shared();
        slot.pending = Some(PendingTransition { target, future: future.clone(), cancelled });
        drop(arena);

        tracing::trace!(entity = %id, %target, "transition.request");
        let background = future.clone();
        self.inner.scheduler.spawn(async move {
            // Outcome goes to whoever awaits the Transition.
            let _ = background.await;
        });
        Transition::waiting(future)
    }

    fn in_flight(&self, id: EntityId) -> Option<SharedTransition> {
        let arena = self.inner.arena.borrow();
        arena.entities.get(&id)?.lifecycle.in_flight.as_ref().map(|t| t.future.clone())
    }

    fn begin_transition(
        &self,
        id: EntityId,
        target: ManagedState,
        ticket: &Rc<Cell<bool>>,
    ) -> Result<()> {
        let mut arena = self.inner.arena.borrow_mut();
        let Some(record) = arena.entities.get_mut(&id) else {
            return Err(Error::Destroyed(id));
        };
        let slot = &mut record.lifecycle;
        match &slot.pending {
            Some(p) if Rc::ptr_eq(&p.cancelled, ticket) => {
                slot.in_flight = slot.pending.take();
                Ok(())
            }
            _ => Err(Error::Superseded { entity: id, target }),
        }
    }

    fn end_transition(&self, id: EntityId, ticket: &Rc<Cell<bool>>) {
        let mut arena = self.inner.arena.borrow_mut();
        if let Some(record) = arena.entities.get_mut(&id) {
            let slot = &mut record.lifecycle;
            if slot.in_flight.as_ref().is_some_and(|t| Rc::ptr_eq(&t.cancelled, ticket)) {
                slot.in_flight = None;
            }
        }
    }

    fn set_state(&self, id: EntityId, state: ManagedState) -> Result<()> {
        let mut arena = self.inner.arena.borrow_mut();
        let record = arena.entities.get_mut(&id).ok_or(Error::Destroyed(id))?;
        tracing::trace!(entity = %id, from = %record.state, to = %state, "state.change");
        record.state = state;
        Ok(())
    }

    /// Put `prior` back if the entity is still in `expected`.
    fn restore_state(&self, id: EntityId, expected: ManagedState, prior: ManagedState) {
        let mut arena = self.inner.arena.borrow_mut();
        if let Some(record) = arena.entities.get_mut(&id) {
            if record.state == expected {
                record.state = prior;
            }
        }
    }

    fn emit_core(&self, id: EntityId, event: ManagedEvent) {
        if let Err(err) = self.emit(id, event) {
            self.report_unhandled(err);
        }
    }

    async fn run_activate(&self, id: EntityId) -> Result<()> {
        let prior = self.state(id);
        match prior {
            ManagedState::Active => return Ok(()),
            ManagedState::Created | ManagedState::Inactive => {}
            ManagedState::Destroying | ManagedState::Destroyed => return Err(Error::Destroyed(id)),
            other => return Err(Error::Lifecycle(format!("cannot activate {id} while {other}"))),
        }
        let hooks = self.class_of(id).and_then(|c| c.lifecycle());

        self.set_state(id, ManagedState::Activating)?;
        if let Some(hooks) = &hooks {
            if let Err(err) = hooks.activating(self, id).await {
                tracing::debug!(entity = %id, error = %err, "activation aborted");
                self.restore_state(id, ManagedState::Activating, prior);
                return Err(err);
            }
        }
        self.set_state(id, ManagedState::Active)?;
        self.emit_core(id, ManagedEvent::active());
        if let Some(hooks) = &hooks {
            hooks.active(self, id).await?;
        }
        Ok(())
    }

    async fn run_deactivate(&self, id: EntityId) -> Result<()> {
        let prior = self.state(id);
        match prior {
            ManagedState::Created | ManagedState::Inactive => return Ok(()),
            ManagedState::Active | ManagedState::Activating | ManagedState::Deactivating => {}
            ManagedState::Destroying | ManagedState::Destroyed => return Err(Error::Destroyed(id)),
        }
        let hooks = self.class_of(id).and_then(|c| c.lifecycle());

        self.set_state(id, ManagedState::Deactivating)?;
        if let Some(hooks) = &hooks {
            if let Err(err) = hooks.deactivating(self, id).await {
                tracing::debug!(entity = %id, error = %err, "deactivation aborted");
                self.restore_state(id, ManagedState::Deactivating, prior);
                return Err(err);
            }
        }
        self.set_state(id, ManagedState::Inactive)?;
        self.emit_core(id, ManagedEvent::inactive());
        if let Some(hooks) = &hooks {
            hooks.inactive(self, id).await?;
        }
        Ok(())
    }

    async fn run_destroy(&self, id: EntityId) -> Result<()> {
        let mut attempts = 0;
        while self.state(id).needs_deactivation() {
            if attempts == self.inner.config.max_deactivate_retries {
                tracing::error!(
                    entity = %id,
                    attempts,
                    "entity could not be deactivated, destroy abandoned"
                );
                return Err(Error::Lifecycle(format!(
                    "{id} could not be deactivated after {attempts} attempts"
                )));
            }
            attempts += 1;
            if let Err(err) = self.run_deactivate(id).await {
                tracing::debug!(
                    entity = %id,
                    attempt = attempts,
                    error = %err,
                    "deactivation before destroy failed"
                );
            }
        }
        if !self.is_alive(id) {
            return Ok(());
        }

        let hooks = self.class_of(id).and_then(|c| c.lifecycle());
        self.set_state(id, ManagedState::Destroying)?;
        if let Some(hooks) = &hooks {
            if let Err(err) = hooks.destroying(self, id).await {
                self.report_unhandled(err);
            }
        }

        let owned = self.release_outbound(id);
        if !owned.is_empty() {
            tracing::trace!(entity = %id, children = owned.len(), "destroying owned children");
            let results = join_all(owned.iter().map(|child| self.destroy(*child))).await;
            for result in results {
                match result {
                    Ok(()) | Err(Error::Destroyed(_)) => {}
                    Err(err) => self.report_unhandled(err),
                }
            }
        }

        crate::component::detach_instance(self, id);
        self.set_state(id, ManagedState::Destroyed)?;
        tracing::debug!(entity = %id, "entity.destroyed");
        self.emit_core(id, ManagedEvent::destroyed());
        self.notify_referrers(id);
        self.remove_record(id);
        Ok(())
    }

    /// Detach every outbound link; returns the targets that were owned.
    fn release_outbound(&self, id: EntityId) -> Vec<EntityId> {
        let mut arena = self.inner.arena.borrow_mut();
        let links: Vec<LinkId> = arena
            .entities
            .get(&id)
            .map(|r| r.slots.values().copied().collect())
            .unwrap_or_default();
        let mut owned = Vec::new();
        for link in links {
            if let Some(detached) = arena.detach(link) {
                if detached.was_parent {
                    owned.push(detached.target);
                }
            }
        }
        owned
    }

    fn notify_referrers(&self, id: EntityId) {
        let inbound: Vec<LinkId> = {
            let arena = self.inner.arena.borrow();
            arena.entities.get(&id).map(|r| r.inbound.to_vec()).unwrap_or_default()
        };
        for link in inbound {
            self.force_unlink(link, UnlinkReason::TargetDestroyed);
        }
    }

    fn remove_record(&self, id: EntityId) {
        let mut arena = self.inner.arena.borrow_mut();
        let leftovers: Vec<LinkId> = arena
            .entities
            .get(&id)
            .map(|r| r.slots.values().chain(r.inbound.iter()).copied().collect())
            .unwrap_or_default();
        for link in leftovers {
            arena.detach(link);
        }
        arena.entities.remove(&id);
        drop(arena);
        self.inner.async_handlers.forget(id);
    }
}

async fn drive(
    graph: WeakGraph,
    id: EntityId,
    target: ManagedState,
    cancelled: Rc<Cell<bool>>,
) -> Result<()> {
    // Wait out whatever is running; the graph handle is not held across awaits.
    loop {
        let running = graph.upgrade().ok_or(Error::Destroyed(id))?.in_flight(id);
        match running {
            Some(running) => {
                let _ = running.await;
            }
            None => break,
        }
    }
    if cancelled.get() {
        return Err(Error::Superseded { entity: id, target });
    }

    let graph = graph.upgrade().ok_or(Error::Destroyed(id))?;
    graph.begin_transition(id, target, &cancelled)?;
    tracing::debug!(entity = %id, %target, "transition.start");
    let result = match target {
        ManagedState::Active => graph.run_activate(id).await,
        ManagedState::Inactive => graph.run_deactivate(id).await,
        ManagedState::Destroyed => graph.run_destroy(id).await,
        other => Err(Error::Lifecycle(format!("{other} is not a transition target"))),
    };
    graph.end_transition(id, &cancelled);
    tracing::debug!(entity = %id, %target, ok = result.is_ok(), "transition.end");
    result
}
