//! Cooperative single-threaded scheduling.
//!
//! Two layers. A thread-local microtask queue carries batched render requests
//! and deferred continuations; anything in the runtime can enqueue. The
//! per-app [`Scheduler`] owns the heavier state: the task set of root fibers
//! waiting to complete, renders delayed because an ancestor was mid-render,
//! and a local executor polling the futures behind async lifecycle barriers.
//!
//! [`Scheduler::tick`] is the flush checkpoint, the animation-frame
//! equivalent: it loops draining microtasks, polling futures and completing
//! ready roots until nothing makes progress.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future::LocalBoxFuture;
use tracing::trace;

use crate::component::Status;
use crate::fibers::Fiber;

// =============================================================================
// Microtask queue
// =============================================================================

thread_local! {
    static MICROTASKS: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
}

pub fn queue_microtask(task: Box<dyn FnOnce()>) {
    MICROTASKS.with(|q| q.borrow_mut().push_back(task));
}

/// Run queued microtasks until the queue is empty, including tasks enqueued
/// while draining. Returns how many ran.
pub fn flush_microtasks() -> usize {
    let mut ran = 0;
    loop {
        let task = MICROTASKS.with(|q| q.borrow_mut().pop_front());
        match task {
            Some(task) => {
                task();
                ran += 1;
            }
            None => return ran,
        }
    }
}

/// Drop all queued microtasks. Test setup and last-root teardown only.
pub fn reset_scheduler() {
    MICROTASKS.with(|q| q.borrow_mut().clear());
}

// =============================================================================
// Per-app scheduler
// =============================================================================

pub struct Scheduler {
    tasks: RefCell<Vec<Rc<Fiber>>>,
    delayed_renders: RefCell<Vec<Rc<Fiber>>>,
    futures: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
}

impl Scheduler {
    pub(crate) fn new() -> Scheduler {
        Scheduler {
            tasks: RefCell::new(Vec::new()),
            delayed_renders: RefCell::new(Vec::new()),
            futures: RefCell::new(Vec::new()),
        }
    }

    /// Register a fiber's root for completion once its tree has rendered.
    pub(crate) fn add_fiber(&self, fiber: &Rc<Fiber>) {
        let Some(root) = fiber.root() else {
            return;
        };
        let mut tasks = self.tasks.borrow_mut();
        if !tasks.iter().any(|t| Rc::ptr_eq(t, &root)) {
            tasks.push(root);
        }
    }

    /// Park a render blocked by an actively rendering ancestor.
    pub(crate) fn delay_render(&self, fiber: Rc<Fiber>) {
        trace!("delaying render under a rendering ancestor");
        self.delayed_renders.borrow_mut().push(fiber);
    }

    /// Hand an async lifecycle barrier to the local executor.
    pub(crate) fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
        self.futures.borrow_mut().push(future);
    }

    /// One flush checkpoint: loop until no microtask ran, no future finished
    /// and no root completed.
    pub fn tick(&self) {
        loop {
            let mut progress = flush_microtasks() > 0;
            progress |= self.poll_futures();
            progress |= self.process_delayed_renders();
            progress |= self.process_tasks();
            if !progress {
                return;
            }
        }
    }

    /// Synchronous flush, used from error recovery so a handled error's
    /// re-render commits before control returns to the failing path.
    pub(crate) fn flush_sync(&self) {
        self.process_delayed_renders();
        self.process_tasks();
    }

    fn poll_futures(&self) -> bool {
        let pending = self.futures.take();
        if pending.is_empty() {
            return false;
        }
        let mut cx = Context::from_waker(Waker::noop());
        let mut progressed = false;
        let mut still_pending = Vec::new();
        for mut future in pending {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => progressed = true,
                Poll::Pending => still_pending.push(future),
            }
        }
        self.futures.borrow_mut().append(&mut still_pending);
        progressed
    }

    fn process_delayed_renders(&self) -> bool {
        let renders = self.delayed_renders.take();
        if renders.is_empty() {
            return false;
        }
        let mut progressed = false;
        for fiber in renders {
            let node = fiber.node();
            let still_current = node
                .fiber
                .borrow()
                .as_ref()
                .is_some_and(|f| Rc::ptr_eq(f, &fiber));
            if fiber.root().is_some() && node.status() != Status::Destroyed && still_current {
                fiber.render();
                progressed = true;
            }
        }
        progressed
    }

    /// Complete every ready root. Roots that were demoted, destroyed, or are
    /// stuck on an error are dropped from the task set.
    fn process_tasks(&self) -> bool {
        let tasks = self.tasks.borrow().clone();
        let mut progressed = false;
        for fiber in tasks {
            let demoted = fiber.root().is_none_or(|r| !Rc::ptr_eq(&r, &fiber));
            if demoted {
                self.remove_task(&fiber);
                continue;
            }
            let counter = fiber.root_data().counter.get();
            if fiber.has_error() && counter != 0 {
                self.remove_task(&fiber);
                continue;
            }
            if fiber.node().status() == Status::Destroyed {
                self.remove_task(&fiber);
                continue;
            }
            if counter == 0 {
                // remove before completing: completion hooks can trigger a
                // synchronous recovery flush that must not re-enter this root
                self.remove_task(&fiber);
                if !fiber.has_error() {
                    fiber.complete();
                }
                progressed = true;
            }
        }
        progressed
    }

    fn remove_task(&self, fiber: &Rc<Fiber>) {
        self.tasks.borrow_mut().retain(|t| !Rc::ptr_eq(t, fiber));
    }
}
