//! Rendering fibers.
//!
//! A fiber is one unit of rendering work for exactly one component node,
//! living in a tree rooted at a root fiber. The root carries the shared
//! bookkeeping: a counter of not-yet-rendered fibers in the tree, the hook
//! collections gathered during traversal, and the `locked` flag protecting
//! its own completion. Child fibers hold weak links upward; parents own
//! their children.
//!
//! Lifecycle: a fiber renders (its `bdom` slot goes through a `Rendering`
//! sentinel so a synchronous supersession is detectable), the root counter
//! drops, and once the counter reaches zero the scheduler completes the
//! root: will-patch hooks, one recursive patch, then mounted/patched hooks
//! popped child-before-parent.

use std::cell::{Cell, RefCell};
use std::mem;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::trace;

use crate::block::Block;
use crate::component::{self, ComponentNode, Status};
use crate::dom::DomNode;

pub(crate) enum FiberBdom {
    None,
    /// Render in progress: set just before entering the render so a render
    /// request arriving mid-render can tell and defer a microtask.
    Rendering,
    Done(Block),
}

pub(crate) struct RootData {
    pub(crate) counter: Cell<i64>,
    pub(crate) will_patch: RefCell<Vec<Rc<Fiber>>>,
    pub(crate) patched: RefCell<Vec<Rc<Fiber>>>,
    pub(crate) mounted: RefCell<Vec<Rc<Fiber>>>,
    /// Set while this root is completing; renders triggered from will-patch
    /// or unmount hooks are delayed a microtask instead of corrupting the
    /// commit in progress.
    pub(crate) locked: Cell<bool>,
    /// Present on mount fibers only: the DOM element to mount into.
    pub(crate) mount_target: Option<DomNode>,
}

pub struct Fiber {
    node: Rc<ComponentNode>,
    parent: Weak<Fiber>,
    /// Weak so a fiber replaced by another can be detached from its tree.
    root: RefCell<Weak<Fiber>>,
    pub(crate) children: RefCell<Vec<Rc<Fiber>>>,
    pub(crate) bdom: RefCell<FiberBdom>,
    pub(crate) applied_to_dom: Cell<bool>,
    pub(crate) deep: Cell<bool>,
    pub(crate) children_map: RefCell<IndexMap<String, Rc<ComponentNode>>>,
    pub(crate) error: Cell<bool>,
    cancelled: Cell<bool>,
    root_data: Option<RootData>,
}

// =============================================================================
// Construction
// =============================================================================

fn new_root_data(mount_target: Option<DomNode>) -> RootData {
    RootData {
        counter: Cell::new(1),
        will_patch: RefCell::new(Vec::new()),
        patched: RefCell::new(Vec::new()),
        mounted: RefCell::new(Vec::new()),
        locked: Cell::new(false),
        mount_target,
    }
}

fn new_root(node: &Rc<ComponentNode>, mount_target: Option<DomNode>) -> Rc<Fiber> {
    Rc::new_cyclic(|weak| Fiber {
        node: node.clone(),
        parent: Weak::new(),
        root: RefCell::new(weak.clone()),
        children: RefCell::new(Vec::new()),
        bdom: RefCell::new(FiberBdom::None),
        applied_to_dom: Cell::new(false),
        deep: Cell::new(false),
        children_map: RefCell::new(IndexMap::new()),
        error: Cell::new(false),
        cancelled: Cell::new(false),
        root_data: Some(new_root_data(mount_target)),
    })
}

/// Fiber for a child component reached during a parent's render. Cancels any
/// fiber the node already had, detaching it from its old tree.
pub(crate) fn make_child_fiber(node: &Rc<ComponentNode>, parent: &Rc<Fiber>) -> Rc<Fiber> {
    if let Some(current) = node.fiber.borrow().clone() {
        cancel_fibers(&current.children.borrow().clone());
        *current.root.borrow_mut() = Weak::new();
    }
    let fiber = Rc::new(Fiber {
        node: node.clone(),
        parent: Rc::downgrade(parent),
        root: RefCell::new(parent.root.borrow().clone()),
        children: RefCell::new(Vec::new()),
        bdom: RefCell::new(FiberBdom::None),
        applied_to_dom: Cell::new(false),
        deep: Cell::new(parent.deep.get()),
        children_map: RefCell::new(IndexMap::new()),
        error: Cell::new(false),
        cancelled: Cell::new(false),
        root_data: None,
    });
    if let Some(root) = fiber.root() {
        root.set_counter(root.root_data().counter.get() + 1);
    }
    parent.children.borrow_mut().push(fiber.clone());
    fiber
}

/// Root fiber for a node-initiated render. If the node already has a fiber,
/// that fiber is reused so a caller waiting on the original render still
/// settles when the superseding one finishes.
pub(crate) fn make_root_fiber(node: &Rc<ComponentNode>) -> Rc<Fiber> {
    if let Some(current) = node.fiber.borrow().clone() {
        if let Some(root) = current.root() {
            let data = root.root_data();
            // cancelling children may run arbitrary destroy hooks, which may
            // themselves request renders; the lock delays those a microtask
            data.locked.set(true);
            let cancelled = cancel_fibers(&current.children.borrow().clone());
            root.set_counter(data.counter.get() + 1 - cancelled);
            data.locked.set(false);
        }
        current.children.borrow_mut().clear();
        current.children_map.borrow_mut().clear();
        *current.bdom.borrow_mut() = FiberBdom::None;
        current.cancelled.set(false);
        if current.error.take() {
            if let Some(root) = current.root() {
                root.error.set(false);
            }
            current.applied_to_dom.set(false);
        }
        return current;
    }
    let fiber = new_root(node, None);
    if !node.will_patch.borrow().is_empty() {
        fiber.root_data().will_patch.borrow_mut().push(fiber.clone());
    }
    if !node.patched.borrow().is_empty() {
        fiber.root_data().patched.borrow_mut().push(fiber.clone());
    }
    fiber
}

/// Root fiber for the initial mount of an application root.
pub(crate) fn make_mount_fiber(node: &Rc<ComponentNode>, target: DomNode) -> Rc<Fiber> {
    new_root(node, Some(target))
}

/// Cancel a fiber subtree. Returns the number of not-yet-rendered fibers
/// cancelled, which the caller subtracts from its root counter. Nodes that
/// never left NEW are destroyed outright; nodes whose fiber already rendered
/// are flagged to force their next render, since silently discarding rendered
/// but unpatched output would let props and DOM diverge.
fn cancel_fibers(fibers: &[Rc<Fiber>]) -> i64 {
    let mut result = 0;
    for fiber in fibers {
        let node = fiber.node();
        fiber.cancelled.set(true);
        if node.status() == Status::New {
            node.destroy();
            if let (Some(parent), Some(key)) =
                (node.parent.upgrade(), node.parent_key.borrow().clone())
            {
                parent.children.borrow_mut().shift_remove(&key);
            }
        }
        node.fiber.take();
        if fiber.has_bdom() {
            node.force_next_render.set(true);
        } else {
            result += 1;
        }
        result += cancel_fibers(&fiber.children.borrow().clone());
    }
    result
}

// =============================================================================
// Fiber behavior
// =============================================================================

impl Fiber {
    pub(crate) fn node(&self) -> Rc<ComponentNode> {
        self.node.clone()
    }

    pub(crate) fn parent(&self) -> Option<Rc<Fiber>> {
        self.parent.upgrade()
    }

    pub(crate) fn root(&self) -> Option<Rc<Fiber>> {
        self.root.borrow().upgrade()
    }

    pub(crate) fn root_data(&self) -> &RootData {
        self.root_data.as_ref().expect("root fiber carries root data")
    }

    pub(crate) fn has_bdom(&self) -> bool {
        matches!(&*self.bdom.borrow(), FiberBdom::Done(_))
    }

    pub(crate) fn is_rendering(&self) -> bool {
        matches!(&*self.bdom.borrow(), FiberBdom::Rendering)
    }

    pub(crate) fn has_error(&self) -> bool {
        self.error.get()
    }

    pub(crate) fn root_locked(&self) -> bool {
        self.root().is_some_and(|r| r.root_data().locked.get())
    }

    pub(crate) fn take_bdom(&self) -> Option<Block> {
        let mut slot = self.bdom.borrow_mut();
        match mem::replace(&mut *slot, FiberBdom::None) {
            FiberBdom::Done(block) => Some(block),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub(crate) fn set_counter(&self, value: i64) {
        self.root_data().counter.set(value);
    }

    /// Render, unless an ancestor component is itself mid-render, in which
    /// case the work is delayed until that rendering settles.
    pub(crate) fn render(self: &Rc<Self>) {
        if self.cancelled.get() {
            trace!("skipping render of cancelled fiber");
            return;
        }
        let Some(root) = self.root() else {
            return;
        };
        let Ok(app) = root.node().app() else {
            return;
        };
        let mut prev = root.node();
        let mut current = prev.parent.upgrade();
        while let Some(mut cur) = current {
            let cur_fiber = cur.fiber.borrow().clone();
            if let Some(cf) = cur_fiber {
                let cf_root = cf.root();
                let settled = cf_root
                    .as_ref()
                    .is_some_and(|r| r.root_data().counter.get() == 0);
                let reachable = prev
                    .parent_key
                    .borrow()
                    .as_deref()
                    .is_some_and(|k| cf.children_map.borrow().contains_key(k));
                if settled && reachable {
                    if let Some(r) = cf_root {
                        cur = r.node();
                    }
                } else {
                    app.scheduler().delay_render(self.clone());
                    return;
                }
            }
            prev = cur.clone();
            current = cur.parent.upgrade();
        }
        self.do_render();
    }

    fn do_render(self: &Rc<Self>) {
        let node = self.node();
        let Some(root) = self.root() else {
            return;
        };
        *self.bdom.borrow_mut() = FiberBdom::Rendering;
        match node.render_block() {
            Ok(block) => *self.bdom.borrow_mut() = FiberBdom::Done(block),
            Err(e) => {
                *self.bdom.borrow_mut() = FiberBdom::None;
                component::handle_error_from_fiber(self, e);
            }
        }
        root.set_counter(root.root_data().counter.get() - 1);
    }

    // =========================================================================
    // Root completion
    // =========================================================================

    /// Commit a fully rendered tree: will-patch hooks parent-to-child, one
    /// recursive patch (or the initial mount), then mounted and patched hooks
    /// popped child-before-parent.
    pub(crate) fn complete(self: &Rc<Self>) {
        if let Some(target) = self.root_data().mount_target.clone() {
            self.complete_mount(&target);
            return;
        }
        let node = self.node();
        let data = self.root_data();
        data.locked.set(true);
        let will_patch = data.will_patch.borrow().clone();
        for fiber in will_patch {
            let n = fiber.node();
            // parts of the ui may have been rendered then superseded; only
            // fire for fibers still attached to their node
            let still_current = n
                .fiber
                .borrow()
                .as_ref()
                .is_some_and(|f| Rc::ptr_eq(f, &fiber));
            if still_current {
                for hook in n.will_patch.borrow().clone().into_iter().rev() {
                    if let Err(e) = hook() {
                        data.locked.set(false);
                        component::handle_error_from_fiber(&fiber, e);
                        return;
                    }
                }
            }
        }
        node.apply_fiber_patch();
        data.locked.set(false);
        loop {
            let popped = data.mounted.borrow_mut().pop();
            let Some(fiber) = popped else { break };
            if !fiber.applied_to_dom.get() {
                continue;
            }
            for hook in fiber.node().mounted.borrow().clone() {
                if let Err(e) = hook() {
                    component::handle_error_from_fiber(&fiber, e);
                    return;
                }
            }
        }
        loop {
            let popped = data.patched.borrow_mut().pop();
            let Some(fiber) = popped else { break };
            if !fiber.applied_to_dom.get() {
                continue;
            }
            for hook in fiber.node().patched.borrow().clone() {
                if let Err(e) = hook() {
                    component::handle_error_from_fiber(&fiber, e);
                    return;
                }
            }
        }
    }

    fn complete_mount(self: &Rc<Self>, target: &DomNode) {
        let node = self.node();
        *node.children.borrow_mut() = self.children_map.take();
        if node.bdom.borrow().is_some() {
            // this fiber already completed once and a mounted hook crashed;
            // the recovery rendering is applied instead of a second mount
            node.update_dom();
        } else if let Some(mut block) = self.take_bdom() {
            block.mount(target, None);
            *node.bdom.borrow_mut() = Some(block);
        }
        // unregister before the mounted hooks: they may render again
        node.fiber.take();
        node.set_status(Status::Mounted);
        self.applied_to_dom.set(true);
        loop {
            let popped = self.root_data().mounted.borrow_mut().pop();
            let Some(fiber) = popped else { break };
            if !fiber.applied_to_dom.get() {
                continue;
            }
            for hook in fiber.node().mounted.borrow().clone() {
                if let Err(e) = hook() {
                    component::handle_error_from_fiber(&fiber, e);
                    return;
                }
            }
        }
    }
}
