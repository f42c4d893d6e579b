//! Deferred task queue ("microtasks") for a graph.
//!
//! Work that must not run inside the synchronous call that caused it
//! (orphan checks, deferred observer handlers, background transitions) is
//! queued here and executed when the owner
//! drives [`Graph::settle`](crate::Graph::settle).
//!
//! # Concurrency Model
//!
//! Tasks run concurrently via [`FuturesUnordered`] on the caller's thread.
//! Tasks may queue further tasks while running; `settle` picks them up in the
//! same drive and returns only once nothing is queued or running.

use std::cell::{Cell, RefCell};
use std::future::{poll_fn, Future};
use std::task::{Poll, Waker};

use futures::future::{FutureExt, LocalBoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};

pub(crate) struct Scheduler {
    incoming: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
    /// Waker of the drive loop currently parked, if any.
    waker: RefCell<Option<Waker>>,
    /// Queued plus running tasks.
    pending: Cell<usize>,
    scheduled_total: Cell<u64>,
    completed_total: Cell<u64>,
    high_water: usize,
}

impl Scheduler {
    pub(crate) fn new(high_water: usize) -> Self {
        Self {
            incoming: RefCell::new(Vec::new()),
            waker: RefCell::new(None),
            pending: Cell::new(0),
            scheduled_total: Cell::new(0),
            completed_total: Cell::new(0),
            high_water,
        }
    }

    pub(crate) fn spawn(&self, fut: impl Future<Output = ()> + 'static) {
        self.incoming.borrow_mut().push(fut.boxed_local());
        self.pending.set(self.pending.get() + 1);
        self.scheduled_total.set(self.scheduled_total.get() + 1);
        tracing::trace!(
            pending = self.pending.get(),
            scheduled_total = self.scheduled_total.get(),
            "task.schedule"
        );
        if self.pending.get() == self.high_water + 1 {
            tracing::warn!(
                pending = self.pending.get(),
                high_water = self.high_water,
                "scheduler backlog exceeds high-water mark"
            );
        }
        let waker = self.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.get()
    }

    pub(crate) fn scheduled_total(&self) -> u64 {
        self.scheduled_total.get()
    }

    pub(crate) fn completed_total(&self) -> u64 {
        self.completed_total.get()
    }

    fn take_incoming(&self) -> Vec<LocalBoxFuture<'static, ()>> {
        std::mem::take(&mut *self.incoming.borrow_mut())
    }

    fn has_incoming(&self) -> bool {
        !self.incoming.borrow().is_empty()
    }

    fn complete_one(&self) {
        self.pending.set(self.pending.get().saturating_sub(1));
        self.completed_total.set(self.completed_total.get() + 1);
    }

    /// Run queued tasks, and whatever they queue, to completion.
    pub(crate) async fn run_until_idle(&self) {
        let mut running: FuturesUnordered<LocalBoxFuture<'static, ()>> = FuturesUnordered::new();
        let completed_before = self.completed_total.get();

        poll_fn(|cx| {
            loop {
                running.extend(self.take_incoming());
                match running.poll_next_unpin(cx) {
                    Poll::Ready(Some(())) => self.complete_one(),
                    Poll::Ready(None) => {
                        if !self.has_incoming() {
                            return Poll::Ready(());
                        }
                    }
                    Poll::Pending => {
                        if self.has_incoming() {
                            continue;
                        }
                        *self.waker.borrow_mut() = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                }
            }
        })
        .await;

        let completed = self.completed_total.get() - completed_before;
        if completed > 0 {
            tracing::debug!(
                completed,
                completed_total = self.completed_total.get(),
                "scheduler.settle"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[tokio::test]
    async fn test_empty_settle() {
        let scheduler = Scheduler::new(16);
        scheduler.run_until_idle().await;
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_tasks_run_only_when_driven() {
        let scheduler = Scheduler::new(16);
        let counter = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let c = counter.clone();
            scheduler.spawn(async move { c.set(c.get() + 1) });
        }
        assert_eq!(counter.get(), 0);
        assert_eq!(scheduler.pending(), 3);

        scheduler.run_until_idle().await;
        assert_eq!(counter.get(), 3);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.completed_total(), 3);
    }

    #[tokio::test]
    async fn test_tasks_queued_by_tasks_are_picked_up() {
        let scheduler = Rc::new(Scheduler::new(16));
        let counter = Rc::new(Cell::new(0));
        let (s, c) = (scheduler.clone(), counter.clone());
        scheduler.spawn(async move {
            tokio::task::yield_now().await;
            let c2 = c.clone();
            s.spawn(async move { c2.set(c2.get() + 10) });
            c.set(c.get() + 1);
        });

        scheduler.run_until_idle().await;
        assert_eq!(counter.get(), 11);
        assert_eq!(scheduler.scheduled_total(), 2);
    }
}
