//! Component instances and their lifecycle.
//!
//! A [`ComponentType`] describes a component: its template, its setup closure
//! and the sub-components its template may place. A [`ComponentNode`] is one
//! live instance: committed props, the mounted block tree, the ordered child
//! map and the registered lifecycle hooks. Nodes hold weak backlinks to their
//! parent; ownership flows strictly downward through the child map.
//!
//! A node has at most one in-flight [`Fiber`] at a time. Render triggers go
//! through [`ComponentNode::render`], which coalesces, defers or supersedes
//! depending on what the current fiber is doing; the actual DOM commit is
//! driven by the scheduler once the whole fiber tree has rendered.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use futures::FutureExt;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::app::AppInner;
use crate::block::Block;
use crate::compiler::{RenderCtx, RenderProgram};
use crate::dom::DomNode;
use crate::error::{CinderError, Result};
use crate::fibers::{self, Fiber, FiberBdom};
use crate::reactivity::{MutationLock, Observer, with_observer};
use crate::scheduler::queue_microtask;
use crate::value::{Scope, Value};

// =============================================================================
// Component descriptions
// =============================================================================

pub type SetupFn = Rc<dyn Fn() -> Result<()>>;
pub type SyncHook = Rc<dyn Fn() -> Result<()>>;
pub type AsyncHook = Rc<dyn Fn() -> futures::future::LocalBoxFuture<'static, Result<()>>>;
pub type PropsHook = Rc<dyn Fn(Value) -> futures::future::LocalBoxFuture<'static, Result<()>>>;
pub type ErrorHook = Rc<dyn Fn(&CinderError) -> Result<()>>;

/// Renders a slot body in its defining component's context.
pub type SlotRender = Rc<dyn Fn() -> Result<Option<Block>>>;

/// The static description of a component: everything shared by its instances.
pub struct ComponentType {
    pub name: Rc<str>,
    pub template: Rc<str>,
    pub components: FxHashMap<Rc<str>, Rc<ComponentType>>,
    pub setup: Option<SetupFn>,
}

impl ComponentType {
    pub fn new(name: &str, template: &str) -> ComponentType {
        ComponentType {
            name: Rc::from(name),
            template: Rc::from(template),
            components: FxHashMap::default(),
            setup: None,
        }
    }

    /// The setup closure runs once per instance, with that instance current,
    /// so hook registration and `use_state` resolve against it.
    pub fn with_setup(mut self, f: impl Fn() -> Result<()> + 'static) -> ComponentType {
        self.setup = Some(Rc::new(f));
        self
    }

    /// Register a sub-component this component's template can place.
    pub fn with_component(mut self, child: Rc<ComponentType>) -> ComponentType {
        self.components.insert(child.name.clone(), child);
        self
    }

    pub fn build(self) -> Rc<ComponentType> {
        Rc::new(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Mounted,
    Destroyed,
}

// =============================================================================
// Component nodes
// =============================================================================

pub struct ComponentNode {
    pub(crate) ctype: Rc<ComponentType>,
    app: Weak<AppInner>,
    pub(crate) parent: Weak<ComponentNode>,
    pub(crate) parent_key: RefCell<Option<String>>,
    status: Cell<Status>,
    props: RefCell<Value>,
    env: Value,
    scope: Rc<Scope>,
    pub(crate) bdom: RefCell<Option<Block>>,
    pub(crate) fiber: RefCell<Option<Rc<Fiber>>>,
    pub(crate) children: RefCell<IndexMap<String, Rc<ComponentNode>>>,
    refs: RefCell<FxHashMap<Rc<str>, Value>>,
    slots: RefCell<FxHashMap<Rc<str>, SlotRender>>,
    pub(crate) force_next_render: Cell<bool>,
    pub(crate) render_observer: RefCell<Option<Rc<Observer>>>,

    pub(crate) will_start: RefCell<Vec<AsyncHook>>,
    pub(crate) will_update_props: RefCell<Vec<PropsHook>>,
    pub(crate) mounted: RefCell<Vec<SyncHook>>,
    pub(crate) will_patch: RefCell<Vec<SyncHook>>,
    pub(crate) patched: RefCell<Vec<SyncHook>>,
    pub(crate) will_unmount: RefCell<Vec<SyncHook>>,
    pub(crate) will_destroy: RefCell<Vec<SyncHook>>,
    pub(crate) will_render: RefCell<Vec<SyncHook>>,
    pub(crate) rendered: RefCell<Vec<SyncHook>>,
    pub(crate) error_handlers: RefCell<Vec<ErrorHook>>,
}

impl ComponentNode {
    /// Instantiate a node and run its setup closure with the node current.
    pub(crate) fn new(
        ctype: Rc<ComponentType>,
        props: Value,
        app: &Rc<AppInner>,
        parent: Option<&Rc<ComponentNode>>,
        parent_key: Option<String>,
        slots: FxHashMap<Rc<str>, SlotRender>,
    ) -> Result<Rc<ComponentNode>> {
        let env = match parent {
            Some(p) => p.env.clone(),
            None => app.env(),
        };
        let scope = Scope::new();
        scope.define("props", props.clone());
        scope.define("env", env.clone());
        let node = Rc::new(ComponentNode {
            ctype,
            app: Rc::downgrade(app),
            parent: parent.map(Rc::downgrade).unwrap_or_default(),
            parent_key: RefCell::new(parent_key),
            status: Cell::new(Status::New),
            props: RefCell::new(props),
            env,
            scope,
            bdom: RefCell::new(None),
            fiber: RefCell::new(None),
            children: RefCell::new(IndexMap::new()),
            refs: RefCell::new(FxHashMap::default()),
            slots: RefCell::new(slots),
            force_next_render: Cell::new(false),
            render_observer: RefCell::new(None),
            will_start: RefCell::new(Vec::new()),
            will_update_props: RefCell::new(Vec::new()),
            mounted: RefCell::new(Vec::new()),
            will_patch: RefCell::new(Vec::new()),
            patched: RefCell::new(Vec::new()),
            will_unmount: RefCell::new(Vec::new()),
            will_destroy: RefCell::new(Vec::new()),
            will_render: RefCell::new(Vec::new()),
            rendered: RefCell::new(Vec::new()),
            error_handlers: RefCell::new(Vec::new()),
        });
        if let Some(setup) = node.ctype.setup.clone() {
            crate::hooks::with_current(&node, || setup())?;
        }
        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.ctype.name
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.set(status);
    }

    pub fn scope(&self) -> &Rc<Scope> {
        &self.scope
    }

    pub fn env(&self) -> &Value {
        &self.env
    }

    pub fn props(&self) -> Value {
        self.props.borrow().clone()
    }

    pub(crate) fn app(&self) -> Result<Rc<AppInner>> {
        self.app
            .upgrade()
            .ok_or_else(|| CinderError::Runtime("component outlived its app".to_string()))
    }

    fn dev(&self) -> bool {
        self.app.upgrade().is_some_and(|a| a.dev())
    }

    pub(crate) fn set_ref(&self, name: &str, value: Value) {
        self.refs.borrow_mut().insert(Rc::from(name), value);
    }

    pub fn get_ref(&self, name: &str) -> Option<DomNode> {
        match self.refs.borrow().get(name) {
            Some(Value::Node(n)) => Some(n.clone()),
            _ => None,
        }
    }

    pub(crate) fn slot(&self, name: &str) -> Option<SlotRender> {
        self.slots.borrow().get(name).cloned()
    }

    pub(crate) fn template_program(&self, name: &str) -> Result<Rc<RenderProgram>> {
        self.app()?.get_program(name)
    }

    pub(crate) fn resolve_component(&self, name: &str) -> Result<Rc<ComponentType>> {
        if let Some(c) = self.ctype.components.get(name) {
            return Ok(c.clone());
        }
        if let Some(c) = self.app()?.registered_component(name) {
            return Ok(c);
        }
        Err(CinderError::Runtime(format!(
            "cannot find the definition of component `{name}`"
        )))
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    /// Build this node's block tree. Mutating observed state is rejected for
    /// the duration; reads subscribe the node's render observer.
    pub(crate) fn render_block(self: &Rc<Self>) -> Result<Block> {
        for hook in self.will_render.borrow().clone() {
            hook()?;
        }
        let program = self.template_program(&self.ctype.template.clone())?;
        let ctx = RenderCtx {
            scope: self.scope.child(),
            node: self.clone(),
            key_suffix: String::new(),
            dev: self.dev(),
        };
        let observer = self.render_observer.borrow().clone();
        let block = {
            let _lock = MutationLock::acquire();
            match &observer {
                Some(obs) => with_observer(obs, || program.execute(&ctx))?,
                None => program.execute(&ctx)?,
            }
        };
        for hook in self.rendered.borrow().clone() {
            hook()?;
        }
        Ok(block)
    }

    /// First render of a fresh node: await the will-start barrier, then render
    /// inside the given fiber.
    pub(crate) fn initiate_render(self: &Rc<Self>, fiber: Rc<Fiber>) {
        *self.fiber.borrow_mut() = Some(fiber.clone());
        if !self.mounted.borrow().is_empty() {
            if let Some(root) = fiber.root() {
                root.root_data().mounted.borrow_mut().push(fiber.clone());
            }
        }
        let hooks = self.will_start.borrow().clone();
        let node = self.clone();
        let Ok(app) = self.app() else {
            return;
        };
        app.scheduler().spawn(
            async move {
                for hook in hooks {
                    if let Err(e) = hook().await {
                        handle_error_from_node(&node, e);
                        return;
                    }
                }
                let same = node
                    .fiber
                    .borrow()
                    .as_ref()
                    .is_some_and(|f| Rc::ptr_eq(f, &fiber));
                if node.status.get() == Status::New && same {
                    fiber.render();
                }
            }
            .boxed_local(),
        );
    }

    /// Props-triggered child update: await the will-update-props barrier,
    /// commit props, render, and enlist patch hooks on the parent's root.
    pub(crate) fn update_and_render(self: &Rc<Self>, props: Value, parent_fiber: &Rc<Fiber>) {
        let fiber = fibers::make_child_fiber(self, parent_fiber);
        *self.fiber.borrow_mut() = Some(fiber.clone());
        let hooks = self.will_update_props.borrow().clone();
        let node = self.clone();
        let parent_fiber = parent_fiber.clone();
        let Ok(app) = self.app() else {
            return;
        };
        app.scheduler().spawn(
            async move {
                for hook in hooks {
                    if let Err(e) = hook(props.clone()).await {
                        handle_error_from_node(&node, e);
                        return;
                    }
                }
                let same = node
                    .fiber
                    .borrow()
                    .as_ref()
                    .is_some_and(|f| Rc::ptr_eq(f, &fiber));
                if !same {
                    return;
                }
                node.commit_props(props);
                fiber.render();
                if let Some(root) = parent_fiber.root() {
                    let data = root.root_data();
                    if !node.will_patch.borrow().is_empty() {
                        data.will_patch.borrow_mut().push(fiber.clone());
                    }
                    if !node.patched.borrow().is_empty() {
                        data.patched.borrow_mut().push(fiber.clone());
                    }
                }
            }
            .boxed_local(),
        );
    }

    fn commit_props(&self, props: Value) {
        *self.props.borrow_mut() = props.clone();
        self.scope.define("props", props);
    }

    /// Request a re-render of this node. Coalesces with an in-flight fiber,
    /// defers while the root is locked or mid-render, and no-ops for nodes
    /// that were never mounted.
    pub fn render(self: &Rc<Self>, deep: bool) {
        let current = self.fiber.borrow().clone();
        if let Some(cur) = &current {
            if cur.root_locked() || cur.is_rendering() {
                // the situation may change after the current microtask
                let node = self.clone();
                queue_microtask(Box::new(move || node.render(deep)));
                return;
            }
        }
        let mut deep = deep;
        let had_current = match &current {
            Some(cur) if !cur.has_bdom() && !cur.has_error() => {
                if deep {
                    cur.deep.set(true);
                }
                return;
            }
            Some(cur) => {
                deep = deep || cur.deep.get();
                true
            }
            None => {
                if self.bdom.borrow().is_none() {
                    return;
                }
                false
            }
        };
        let fiber = fibers::make_root_fiber(self);
        fiber.deep.set(deep);
        *self.fiber.borrow_mut() = Some(fiber.clone());
        let Ok(app) = self.app() else {
            return;
        };
        app.scheduler().add_fiber(&fiber);
        let node = self.clone();
        queue_microtask(Box::new(move || {
            if node.status.get() == Status::Destroyed {
                return;
            }
            let same = node
                .fiber
                .borrow()
                .as_ref()
                .is_some_and(|f| Rc::ptr_eq(f, &fiber));
            // if the fiber was demoted to a child of a rendering from above
            // in the meantime, that rendering will reach it anyway
            if same && (had_current || fiber.parent().is_none()) {
                fiber.render();
            }
        }));
    }

    /// Child placement entry point, called from compiled programs: reuse the
    /// keyed child when possible, instantiate otherwise.
    pub(crate) fn create_or_update_child(
        self: &Rc<Self>,
        key: &str,
        ctype: Rc<ComponentType>,
        props: Value,
        slots: FxHashMap<Rc<str>, SlotRender>,
    ) -> Result<Rc<ComponentNode>> {
        let parent_fiber = self.fiber.borrow().clone().ok_or_else(|| {
            CinderError::Runtime("component placement outside an active render".to_string())
        })?;
        let mut existing = self.children.borrow().get(key).cloned();
        if let Some(node) = &existing {
            if node.status.get() == Status::Destroyed || !Rc::ptr_eq(&node.ctype, &ctype) {
                existing = None;
            }
        }
        let node = match existing {
            Some(node) => {
                let has_slots = !slots.is_empty();
                *node.slots.borrow_mut() = slots;
                let should_render = node.force_next_render.take()
                    || parent_fiber.deep.get()
                    || has_slots
                    || props_different(&node.props.borrow(), &props);
                if should_render {
                    node.update_and_render(props, &parent_fiber);
                }
                node
            }
            None => {
                let app = self.app()?;
                let node = ComponentNode::new(
                    ctype,
                    props,
                    &app,
                    Some(self),
                    Some(key.to_string()),
                    slots,
                )?;
                self.children
                    .borrow_mut()
                    .insert(key.to_string(), node.clone());
                let fiber = fibers::make_child_fiber(&node, &parent_fiber);
                node.initiate_render(fiber);
                node
            }
        };
        parent_fiber
            .children_map
            .borrow_mut()
            .insert(key.to_string(), node.clone());
        Ok(node)
    }

    // =========================================================================
    // Destruction
    // =========================================================================

    pub fn destroy(self: &Rc<Self>) {
        let should_remove = self.status.get() == Status::Mounted;
        self.destroy_inner();
        if should_remove {
            if let Some(bdom) = self.bdom.borrow_mut().as_mut() {
                bdom.remove();
            }
        }
    }

    /// Recursive teardown: unmount hooks (while the DOM is still attached),
    /// children, destroy hooks, then the terminal status.
    pub(crate) fn destroy_inner(self: &Rc<Self>) {
        if self.status.get() == Status::Destroyed {
            return;
        }
        if self.status.get() == Status::Mounted {
            for hook in self.will_unmount.borrow().clone().into_iter().rev() {
                if let Err(e) = hook() {
                    handle_error_from_node(self, e);
                }
            }
        }
        let children: Vec<_> = self.children.borrow().values().cloned().collect();
        for child in children {
            child.destroy_inner();
        }
        for hook in self.will_destroy.borrow().clone().into_iter().rev() {
            if let Err(e) = hook() {
                handle_error_from_node(self, e);
            }
        }
        self.status.set(Status::Destroyed);
        self.fiber.take();
        // dropping the observer clears every reactive subscription
        self.render_observer.take();
    }

    // =========================================================================
    // Block surface: the `Block::Component` variant delegates here
    // =========================================================================

    pub(crate) fn mount_bdom(self: &Rc<Self>, parent: &DomNode, anchor: Option<&DomNode>) {
        let Some(fiber) = self.fiber.borrow().clone() else {
            return;
        };
        let Some(mut block) = fiber.take_bdom() else {
            return;
        };
        block.mount(parent, anchor);
        *self.bdom.borrow_mut() = Some(block);
        self.status.set(Status::Mounted);
        fiber.applied_to_dom.set(true);
        *self.children.borrow_mut() = fiber.children_map.take();
        self.fiber.take();
    }

    /// Patch only renderings coming from above. A render this node initiated
    /// itself commits in its own root fiber's completion instead.
    pub(crate) fn patch_from_above(self: &Rc<Self>) {
        let from_above = self
            .fiber
            .borrow()
            .as_ref()
            .is_some_and(|f| f.parent().is_some());
        if from_above {
            self.apply_fiber_patch();
        }
    }

    pub(crate) fn apply_fiber_patch(self: &Rc<Self>) {
        let Some(fiber) = self.fiber.borrow().clone() else {
            return;
        };
        let Some(new_bdom) = fiber.take_bdom() else {
            return;
        };
        let had_children = !self.children.borrow().is_empty();
        *self.children.borrow_mut() = fiber.children_map.take();
        if let Some(bdom) = self.bdom.borrow_mut().as_mut() {
            bdom.patch(new_bdom, had_children);
        }
        fiber.applied_to_dom.set(true);
        self.fiber.take();
    }

    pub(crate) fn before_remove_bdom(self: &Rc<Self>) {
        self.destroy_inner();
    }

    pub(crate) fn remove_bdom(&self) {
        if let Some(bdom) = self.bdom.borrow_mut().as_mut() {
            bdom.remove();
        }
    }

    pub(crate) fn first_node(&self) -> Option<DomNode> {
        self.bdom.borrow().as_ref().and_then(Block::first_node)
    }

    pub(crate) fn move_bdom_before(&self, parent: &DomNode, anchor: Option<&DomNode>) {
        if let Some(bdom) = self.bdom.borrow_mut().as_mut() {
            bdom.move_before_dom_node(parent, anchor);
        }
    }

    /// Re-patch after a recovered error during mount hooks: find the node
    /// whose fiber holds a newer rendering and apply it.
    pub(crate) fn update_dom(self: &Rc<Self>) {
        let Some(fiber) = self.fiber.borrow().clone() else {
            return;
        };
        if !matches!(&*fiber.bdom.borrow(), FiberBdom::Done(_)) {
            // handled further down: some child holds the actual rerender
            let children: Vec<_> = self.children.borrow().values().cloned().collect();
            for child in children {
                child.update_dom();
            }
            return;
        }
        self.apply_fiber_patch();
    }
}

/// Shallow props comparison: any reference-unequal value, or a differing key
/// set, forces a child re-render.
fn props_different(old: &Value, new: &Value) -> bool {
    let (Some(old), Some(new)) = (old.as_obj(), new.as_obj()) else {
        return true;
    };
    let old_keys = old.keys();
    let new_keys = new.keys();
    if old_keys.len() != new_keys.len() {
        return true;
    }
    for key in &new_keys {
        if !old.get_untracked(key).same(&new.get_untracked(key)) {
            return true;
        }
    }
    false
}

// =============================================================================
// Error propagation
// =============================================================================

/// Record an error on the node's fiber tree, then walk the component ancestor
/// chain for a handler. A handler that returns Ok recovers: its component
/// re-renders and the scheduler flushes synchronously to commit the recovery.
/// Unhandled errors destroy the application root.
pub(crate) fn handle_error_from_node(node: &Rc<ComponentNode>, error: CinderError) {
    let fiber = node.fiber.borrow().clone();
    handle_error(node, fiber, error);
}

pub(crate) fn handle_error_from_fiber(fiber: &Rc<Fiber>, error: CinderError) {
    let node = fiber.node();
    handle_error(&node, Some(fiber.clone()), error);
}

fn handle_error(node: &Rc<ComponentNode>, fiber: Option<Rc<Fiber>>, error: CinderError) {
    if let Some(fiber) = &fiber {
        fiber.error.set(true);
        // restore ancestor fibers so a recovery render can re-enter the
        // pending tree
        let mut current = Some(fiber.clone());
        while let Some(cur) = current {
            *cur.node().fiber.borrow_mut() = Some(cur.clone());
            current = cur.parent();
        }
        if let Some(root) = fiber.root() {
            root.error.set(true);
        }
    }
    if !walk_handlers(node, &error) {
        warn!(component = node.name(), %error, "unhandled error, destroying the root");
        if let Ok(app) = node.app() {
            app.record_error(error);
            app.destroy_root();
        }
    }
}

fn walk_handlers(node: &Rc<ComponentNode>, error: &CinderError) -> bool {
    let handlers = node.error_handlers.borrow().clone();
    for handler in handlers.into_iter().rev() {
        if handler(error).is_ok() {
            node.render(false);
            if let Ok(app) = node.app() {
                app.scheduler().flush_sync();
            }
            return true;
        }
    }
    match node.parent.upgrade() {
        Some(parent) => walk_handlers(&parent, error),
        None => false,
    }
}
