//! The setup-time hook API.
//!
//! Every function here resolves against the component node whose setup
//! closure is currently running; calling one anywhere else is an error. The
//! async hooks (`on_will_start`, `on_will_update_props`) form the only
//! suspension points of a render: they are joined as a barrier before the
//! synchronous render step, which itself never suspends.

use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures::FutureExt;

use crate::component::ComponentNode;
use crate::dom::DomNode;
use crate::error::{CinderError, Result};
use crate::reactivity::{Observer, batched, reactive};
use crate::value::Value;

thread_local! {
    static CURRENT: RefCell<Option<Rc<ComponentNode>>> = const { RefCell::new(None) };
}

pub(crate) fn with_current<R>(node: &Rc<ComponentNode>, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT.with(|c| c.borrow_mut().replace(node.clone()));
    let result = f();
    CURRENT.with(|c| *c.borrow_mut() = previous);
    result
}

fn current() -> Result<Rc<ComponentNode>> {
    CURRENT.with(|c| c.borrow().clone()).ok_or_else(|| {
        CinderError::Runtime(
            "no active component (hook functions can only be called in setup)".to_string(),
        )
    })
}

// =============================================================================
// Lifecycle hooks
// =============================================================================

pub fn on_will_start<F, Fut>(f: F) -> Result<()>
where
    F: Fn() -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    let node = current()?;
    let hooks = &node.will_start;
    hooks.borrow_mut().push(Rc::new(move || f().boxed_local()));
    Ok(())
}

pub fn on_will_update_props<F, Fut>(f: F) -> Result<()>
where
    F: Fn(Value) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    let node = current()?;
    node.will_update_props
        .borrow_mut()
        .push(Rc::new(move |props| f(props).boxed_local()));
    Ok(())
}

pub fn on_mounted(f: impl Fn() -> Result<()> + 'static) -> Result<()> {
    let node = current()?;
    node.mounted.borrow_mut().push(Rc::new(f));
    Ok(())
}

pub fn on_will_patch(f: impl Fn() -> Result<()> + 'static) -> Result<()> {
    let node = current()?;
    node.will_patch.borrow_mut().push(Rc::new(f));
    Ok(())
}

pub fn on_patched(f: impl Fn() -> Result<()> + 'static) -> Result<()> {
    let node = current()?;
    node.patched.borrow_mut().push(Rc::new(f));
    Ok(())
}

pub fn on_will_unmount(f: impl Fn() -> Result<()> + 'static) -> Result<()> {
    let node = current()?;
    node.will_unmount.borrow_mut().push(Rc::new(f));
    Ok(())
}

pub fn on_will_destroy(f: impl Fn() -> Result<()> + 'static) -> Result<()> {
    let node = current()?;
    node.will_destroy.borrow_mut().push(Rc::new(f));
    Ok(())
}

pub fn on_will_render(f: impl Fn() -> Result<()> + 'static) -> Result<()> {
    let node = current()?;
    node.will_render.borrow_mut().push(Rc::new(f));
    Ok(())
}

pub fn on_rendered(f: impl Fn() -> Result<()> + 'static) -> Result<()> {
    let node = current()?;
    node.rendered.borrow_mut().push(Rc::new(f));
    Ok(())
}

/// Register an error handler. Handlers run in reverse registration order when
/// an error from this component's subtree walks up looking for recovery.
pub fn on_error(f: impl Fn(&CinderError) -> Result<()> + 'static) -> Result<()> {
    let node = current()?;
    node.error_handlers.borrow_mut().push(Rc::new(f));
    Ok(())
}

// =============================================================================
// State and environment
// =============================================================================

/// Observe a value for this component: reading it during a render subscribes
/// the component, and any later mutation schedules exactly one batched
/// re-render per microtask generation.
pub fn use_state(value: Value) -> Result<Value> {
    let node = current()?;
    if node.render_observer.borrow().is_none() {
        let weak: Weak<ComponentNode> = Rc::downgrade(&node);
        let render = batched(Rc::new(move || {
            if let Some(node) = weak.upgrade() {
                node.render(false);
            }
        }));
        *node.render_observer.borrow_mut() = Some(Rc::new(Observer::new(render)));
    }
    Ok(reactive(value))
}

pub fn use_env() -> Result<Value> {
    Ok(current()?.env().clone())
}

/// Expose a value (or a `Value::Fn`) to the component's template scope.
pub fn expose(name: &str, value: Value) -> Result<()> {
    let node = current()?;
    node.scope().define(name, value);
    Ok(())
}

/// Handle to a node marked `x-ref` in the template. Resolves after mount,
/// `None` once the element is gone.
pub struct RefHandle {
    node: Weak<ComponentNode>,
    name: Rc<str>,
}

impl RefHandle {
    pub fn el(&self) -> Option<DomNode> {
        self.node.upgrade().and_then(|n| n.get_ref(&self.name))
    }
}

pub fn use_ref(name: &str) -> Result<RefHandle> {
    let node = current()?;
    Ok(RefHandle {
        node: Rc::downgrade(&node),
        name: Rc::from(name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_outside_setup_fail() {
        assert!(on_mounted(|| Ok(())).is_err());
        assert!(use_state(Value::empty_obj()).is_err());
        assert!(use_env().is_err());
    }
}
