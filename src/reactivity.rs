//! Subscription registry for observable values.
//!
//! Reads performed while an observer is active subscribe that observer to the
//! exact (target, key) pairs it touched. A later write to one of those pairs
//! clears the observer's entire subscription set and invokes its callback; the
//! callback is expected to re-read, which re-subscribes it to whatever it
//! still depends on. Clearing before notifying is what keeps stale
//! subscriptions from piling up when a callback's read set shrinks.
//!
//! Subscribers to a key are notified in the order they first subscribed.
//! That order is part of the contract: components subscribe parent-first, so
//! a parent's re-render is scheduled before any of its children's.
//!
//! The registry is a thread-local, torn down when the last app root is
//! destroyed (and by `reset_reactivity` in tests).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::error::{CinderError, Result};
use crate::value::Value;

/// What part of a target a subscription covers.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum RKey {
    /// A named object field.
    Field(Rc<str>),
    /// A list slot.
    Index(usize),
    /// The list's length.
    Length,
    /// Sentinel for key creation/removal, subscribed by iteration and `in`.
    KeyChanges,
}

impl RKey {
    pub fn field(name: &str) -> RKey {
        RKey::Field(Rc::from(name))
    }
}

struct ObserverEntry {
    callback: Rc<dyn Fn()>,
    // every (target, key) this observer is currently subscribed to
    subscriptions: Vec<(u64, RKey)>,
}

#[derive(Default)]
struct Registry {
    // (target, key) -> observer ids, in subscription order
    subscribers: FxHashMap<(u64, RKey), IndexMap<u64, ()>>,
    observers: FxHashMap<u64, ObserverEntry>,
    observer_stack: Vec<u64>,
    next_observer_id: u64,
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
    static MUTATION_LOCKS: Cell<u32> = const { Cell::new(0) };
}

/// A registered change callback. Dropping it removes all its subscriptions.
pub struct Observer {
    id: u64,
}

impl Observer {
    pub fn new(callback: Rc<dyn Fn()>) -> Observer {
        let id = REGISTRY.with(|r| {
            let mut reg = r.borrow_mut();
            reg.next_observer_id += 1;
            let id = reg.next_observer_id;
            reg.observers.insert(
                id,
                ObserverEntry {
                    callback,
                    subscriptions: Vec::new(),
                },
            );
            id
        });
        Observer { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drop every subscription without unregistering. Called when the owning
    /// component is destroyed so no further notifications reach it.
    pub fn clear(&self) {
        clear_subscriptions(self.id);
    }

    /// How many (target, key) pairs this observer is subscribed to.
    pub fn subscription_count(&self) -> usize {
        REGISTRY.with(|r| {
            r.borrow()
                .observers
                .get(&self.id)
                .map_or(0, |e| e.subscriptions.len())
        })
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        clear_subscriptions(self.id);
        REGISTRY.with(|r| {
            r.borrow_mut().observers.remove(&self.id);
        });
    }
}

/// Run `f` with `observer` active: every observable read inside subscribes it.
pub fn with_observer<R>(observer: &Observer, f: impl FnOnce() -> R) -> R {
    REGISTRY.with(|r| r.borrow_mut().observer_stack.push(observer.id));
    let result = f();
    REGISTRY.with(|r| {
        r.borrow_mut().observer_stack.pop();
    });
    result
}

/// Make `value` observable and return it. No-op for scalar values.
pub fn reactive(value: Value) -> Value {
    value.make_observable();
    value
}

/// Subscribe the active observer (if any) to (target, key).
pub fn observe(target: u64, key: RKey) {
    REGISTRY.with(|r| {
        let mut reg = r.borrow_mut();
        let Some(&observer_id) = reg.observer_stack.last() else {
            return;
        };
        let newly_added = reg
            .subscribers
            .entry((target, key.clone()))
            .or_default()
            .insert(observer_id, ())
            .is_none();
        if newly_added
            && let Some(entry) = reg.observers.get_mut(&observer_id)
        {
            entry.subscriptions.push((target, key));
        }
    });
}

/// Notify every subscriber of (target, key), in subscription order. Each
/// subscriber's subscriptions are cleared just before its callback runs, so
/// the callback re-subscribes from scratch.
pub fn notify(target: u64, key: RKey) {
    let callbacks: Vec<(u64, Rc<dyn Fn()>)> = REGISTRY.with(|r| {
        let reg = r.borrow();
        let Some(observer_ids) = reg.subscribers.get(&(target, key)) else {
            return Vec::new();
        };
        observer_ids
            .keys()
            .filter_map(|id| {
                reg.observers
                    .get(id)
                    .map(|entry| (*id, entry.callback.clone()))
            })
            .collect()
    });
    for (observer_id, callback) in callbacks {
        clear_subscriptions(observer_id);
        callback();
    }
}

/// Total number of live (target, key, observer) subscription entries across
/// the whole registry. Meant for tests asserting that torn-down observers
/// left nothing behind.
pub fn total_subscriptions() -> usize {
    REGISTRY.with(|r| r.borrow().subscribers.values().map(IndexMap::len).sum())
}

fn clear_subscriptions(observer_id: u64) {
    REGISTRY.with(|r| {
        let mut reg = r.borrow_mut();
        let subscriptions = match reg.observers.get_mut(&observer_id) {
            Some(entry) => std::mem::take(&mut entry.subscriptions),
            None => return,
        };
        for pair in subscriptions {
            if let Some(ids) = reg.subscribers.get_mut(&pair) {
                ids.shift_remove(&observer_id);
                if ids.is_empty() {
                    reg.subscribers.remove(&pair);
                }
            }
        }
    });
}

// =============================================================================
// Mutation guard
// =============================================================================

/// While held, writes to observable values fail with
/// [`CinderError::ReactivityViolation`]. Render code holds one for the whole
/// synchronous render step.
pub struct MutationLock;

impl MutationLock {
    pub fn acquire() -> MutationLock {
        MUTATION_LOCKS.with(|c| c.set(c.get() + 1));
        MutationLock
    }
}

impl Drop for MutationLock {
    fn drop(&mut self) {
        MUTATION_LOCKS.with(|c| c.set(c.get() - 1));
    }
}

pub fn ensure_mutations_allowed() -> Result<()> {
    if MUTATION_LOCKS.with(Cell::get) > 0 {
        return Err(CinderError::ReactivityViolation);
    }
    Ok(())
}

// =============================================================================
// Batching
// =============================================================================

/// Wrap `f` so that any number of calls within one flush cycle run it once,
/// on the microtask queue. The scheduled flag resets before `f` runs, so a
/// call made during `f` schedules a fresh run.
pub fn batched(f: Rc<dyn Fn()>) -> Rc<dyn Fn()> {
    let scheduled = Rc::new(Cell::new(false));
    Rc::new(move || {
        if !scheduled.get() {
            scheduled.set(true);
            let scheduled = scheduled.clone();
            let f = f.clone();
            crate::scheduler::queue_microtask(Box::new(move || {
                scheduled.set(false);
                f();
            }));
        }
    })
}

/// Drop all registry state. Test setup and last-root teardown only.
pub fn reset_reactivity() {
    REGISTRY.with(|r| *r.borrow_mut() = Registry::default());
    MUTATION_LOCKS.with(|c| c.set(0));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_observer(count: Rc<Cell<u32>>) -> Observer {
        Observer::new(Rc::new(move || count.set(count.get() + 1)))
    }

    #[test]
    fn test_read_subscribes_and_write_notifies() {
        reset_reactivity();
        let state = reactive(Value::obj([("n", Value::num(0.0))]));
        let obj = state.as_obj().unwrap().clone();

        let calls = Rc::new(Cell::new(0u32));
        let observer = counting_observer(calls.clone());

        with_observer(&observer, || {
            obj.get("n");
        });
        assert_eq!(observer.subscription_count(), 1);

        obj.set("n", Value::num(1.0)).unwrap();
        assert_eq!(calls.get(), 1);

        // the write cleared the subscription, so a second write is silent
        obj.set("n", Value::num(2.0)).unwrap();
        assert_eq!(calls.get(), 1, "subscription must be re-armed by a read");

        with_observer(&observer, || {
            obj.get("n");
        });
        obj.set("n", Value::num(3.0)).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_same_value_write_does_not_notify() {
        reset_reactivity();
        let state = reactive(Value::obj([("n", Value::num(5.0))]));
        let obj = state.as_obj().unwrap().clone();
        let calls = Rc::new(Cell::new(0u32));
        let observer = counting_observer(calls.clone());
        with_observer(&observer, || {
            obj.get("n");
        });
        obj.set("n", Value::num(5.0)).unwrap();
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_key_changes_sentinel() {
        reset_reactivity();
        let state = reactive(Value::obj([("a", Value::num(1.0))]));
        let obj = state.as_obj().unwrap().clone();
        let calls = Rc::new(Cell::new(0u32));
        let observer = counting_observer(calls.clone());

        with_observer(&observer, || {
            obj.keys();
        });
        // overwriting an existing key is not a key change
        obj.set("a", Value::num(2.0)).unwrap();
        assert_eq!(calls.get(), 0);
        obj.set("b", Value::num(3.0)).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_nested_reads_propagate_observability() {
        reset_reactivity();
        let inner = Value::obj([("x", Value::num(1.0))]);
        let state = reactive(Value::obj([("inner", inner)]));
        let obj = state.as_obj().unwrap().clone();

        let calls = Rc::new(Cell::new(0u32));
        let observer = counting_observer(calls.clone());
        let inner_obj = with_observer(&observer, || {
            let inner = obj.get("inner");
            inner.as_obj().unwrap().get("x");
            inner.as_obj().unwrap().clone()
        });
        assert_eq!(observer.subscription_count(), 2);

        inner_obj.set("x", Value::num(2.0)).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_notification_order_is_subscription_order() {
        reset_reactivity();
        let state = reactive(Value::obj([("n", Value::num(0.0))]));
        let obj = state.as_obj().unwrap().clone();

        let order = Rc::new(RefCell::new(Vec::new()));
        let mk = |tag: &'static str| {
            let order = order.clone();
            Observer::new(Rc::new(move || order.borrow_mut().push(tag)))
        };
        let first = mk("first");
        let second = mk("second");

        // subscribe second, then first, then touch second again: first
        // subscription wins for ordering
        with_observer(&second, || {
            obj.get("n");
        });
        with_observer(&first, || {
            obj.get("n");
        });
        with_observer(&second, || {
            obj.get("n");
        });

        obj.set("n", Value::num(1.0)).unwrap();
        assert_eq!(*order.borrow(), vec!["second", "first"]);
    }

    #[test]
    fn test_mutation_lock_rejects_observable_writes() {
        reset_reactivity();
        let state = reactive(Value::obj([("n", Value::num(0.0))]));
        let obj = state.as_obj().unwrap().clone();

        let lock = MutationLock::acquire();
        let err = obj.set("n", Value::num(1.0)).unwrap_err();
        assert!(matches!(err, CinderError::ReactivityViolation));

        // plain (non-observable) values are unaffected
        let plain = Value::obj([]);
        plain.as_obj().unwrap().set("k", Value::num(1.0)).unwrap();

        drop(lock);
        obj.set("n", Value::num(1.0)).unwrap();
    }

    #[test]
    fn test_dropping_observer_removes_subscriptions() {
        reset_reactivity();
        let state = reactive(Value::obj([("n", Value::num(0.0))]));
        let obj = state.as_obj().unwrap().clone();
        let calls = Rc::new(Cell::new(0u32));
        {
            let observer = counting_observer(calls.clone());
            with_observer(&observer, || {
                obj.get("n");
            });
        }
        obj.set("n", Value::num(1.0)).unwrap();
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_batched_coalesces_calls() {
        reset_reactivity();
        crate::scheduler::reset_scheduler();
        let calls = Rc::new(Cell::new(0u32));
        let f = {
            let calls = calls.clone();
            batched(Rc::new(move || calls.set(calls.get() + 1)))
        };
        f();
        f();
        f();
        assert_eq!(calls.get(), 0, "batched work waits for the flush");
        crate::scheduler::flush_microtasks();
        assert_eq!(calls.get(), 1);
        f();
        crate::scheduler::flush_microtasks();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_list_iteration_subscribes() {
        reset_reactivity();
        let state = reactive(Value::list([Value::num(1.0), Value::num(2.0)]));
        let list = state.as_list().unwrap().clone();
        let calls = Rc::new(Cell::new(0u32));
        let observer = counting_observer(calls.clone());
        with_observer(&observer, || {
            list.iter_values();
        });
        list.push(Value::num(3.0)).unwrap();
        assert!(calls.get() >= 1);
    }
}
