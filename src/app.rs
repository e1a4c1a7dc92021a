//! Application instances.
//!
//! An [`App`] owns everything that would otherwise be process-global: the
//! template set with its compiled program cache, the scheduler, the shared
//! environment and the dev flag. Multiple independent apps can coexist in one
//! process; destroying one never touches another's caches.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::compiler::{self, RenderProgram};
use crate::component::{ComponentNode, ComponentType};
use crate::dom::DomNode;
use crate::error::{CinderError, Result};
use crate::fibers;
use crate::scheduler::Scheduler;
use crate::value::Value;

// =============================================================================
// Template set
// =============================================================================

/// Template sources plus the per-app compiled program cache. Compilation is
/// lazy: a template compiles the first time a render asks for it.
pub struct TemplateSet {
    sources: RefCell<FxHashMap<Rc<str>, String>>,
    programs: RefCell<FxHashMap<Rc<str>, Rc<RenderProgram>>>,
}

impl TemplateSet {
    fn new() -> TemplateSet {
        TemplateSet {
            sources: RefCell::new(FxHashMap::default()),
            programs: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn add_template(&self, name: &str, source: &str) {
        let mut sources = self.sources.borrow_mut();
        if sources.insert(Rc::from(name), source.to_string()).is_some() {
            warn!(template = name, "template redefined");
            self.programs.borrow_mut().remove(name);
        }
    }

    pub fn get_program(&self, name: &str) -> Result<Rc<RenderProgram>> {
        if let Some(program) = self.programs.borrow().get(name) {
            return Ok(program.clone());
        }
        let source = self.sources.borrow().get(name).cloned().ok_or_else(|| {
            CinderError::template(name, "template was never added to this app")
        })?;
        let roots = compiler::parser::parse_template(name, &source)?;
        let program = compiler::compile_template(name, &roots)?;
        self.programs
            .borrow_mut()
            .insert(Rc::from(name), program.clone());
        Ok(program)
    }
}

// =============================================================================
// App
// =============================================================================

pub(crate) struct AppInner {
    templates: TemplateSet,
    scheduler: Scheduler,
    env: RefCell<Value>,
    dev: Cell<bool>,
    root: RefCell<Option<Rc<ComponentNode>>>,
    components: RefCell<FxHashMap<Rc<str>, Rc<ComponentType>>>,
    pending_error: RefCell<Option<CinderError>>,
}

impl AppInner {
    pub(crate) fn env(&self) -> Value {
        self.env.borrow().clone()
    }

    pub(crate) fn dev(&self) -> bool {
        self.dev.get()
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn get_program(&self, name: &str) -> Result<Rc<RenderProgram>> {
        self.templates.get_program(name)
    }

    pub(crate) fn registered_component(&self, name: &str) -> Option<Rc<ComponentType>> {
        self.components.borrow().get(name).cloned()
    }

    pub(crate) fn record_error(&self, error: CinderError) {
        let mut slot = self.pending_error.borrow_mut();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn destroy_root(&self) {
        if let Some(root) = self.root.borrow_mut().take() {
            root.destroy();
        }
    }
}

pub struct App {
    inner: Rc<AppInner>,
}

impl Default for App {
    fn default() -> App {
        App::new()
    }
}

impl App {
    pub fn new() -> App {
        App {
            inner: Rc::new(AppInner {
                templates: TemplateSet::new(),
                scheduler: Scheduler::new(),
                env: RefCell::new(Value::empty_obj()),
                dev: Cell::new(false),
                root: RefCell::new(None),
                components: RefCell::new(FxHashMap::default()),
                pending_error: RefCell::new(None),
            }),
        }
    }

    /// Shared environment exposed to every component as `env`.
    pub fn with_env(self, env: Value) -> App {
        *self.inner.env.borrow_mut() = env;
        self
    }

    /// Dev mode: duplicate loop keys become errors instead of being skipped.
    pub fn with_dev(self, dev: bool) -> App {
        self.inner.dev.set(dev);
        self
    }

    pub fn add_template(&self, name: &str, source: &str) {
        self.inner.templates.add_template(name, source);
    }

    /// App-wide component registration, the fallback when a placement is not
    /// in the placing component's own table.
    pub fn register_component(&self, ctype: Rc<ComponentType>) {
        self.inner
            .components
            .borrow_mut()
            .insert(ctype.name.clone(), ctype);
    }

    pub fn root(&self) -> Option<Rc<ComponentNode>> {
        self.inner.root.borrow().clone()
    }

    /// Mount a component into `target`, which must be an element attached to
    /// a document. Rendering starts immediately; the DOM appears once
    /// [`App::tick`] completes the mount fiber.
    pub fn mount(&self, ctype: Rc<ComponentType>, target: &DomNode) -> Result<MountedRoot> {
        validate_target(target)?;
        if self.inner.root.borrow().is_some() {
            return Err(CinderError::Runtime(
                "app already has a mounted root".to_string(),
            ));
        }
        let node = ComponentNode::new(
            ctype,
            Value::empty_obj(),
            &self.inner,
            None,
            None,
            FxHashMap::default(),
        )?;
        *self.inner.root.borrow_mut() = Some(node.clone());
        let fiber = fibers::make_mount_fiber(&node, target.clone());
        self.inner.scheduler.add_fiber(&fiber);
        node.initiate_render(fiber);
        Ok(MountedRoot { node })
    }

    /// Drive one flush cycle and surface any unhandled error.
    pub fn tick(&self) -> Result<()> {
        self.inner.scheduler.tick();
        match self.inner.pending_error.borrow_mut().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn destroy(&self) {
        self.inner.scheduler.flush_sync();
        self.inner.destroy_root();
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.inner.destroy_root();
    }
}

/// Handle to a mounted root component.
pub struct MountedRoot {
    node: Rc<ComponentNode>,
}

impl MountedRoot {
    pub fn node(&self) -> &Rc<ComponentNode> {
        &self.node
    }
}

fn validate_target(target: &DomNode) -> Result<()> {
    if !target.is_element() {
        return Err(CinderError::InvalidMountTarget(
            "mount target is not an element".to_string(),
        ));
    }
    if !target.is_attached() {
        return Err(CinderError::InvalidMountTarget(
            "mount target is not attached to a document".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;
    use crate::dom::{self, Document, attributes};
    use crate::hooks::{
        expose, on_error, on_patched, on_will_destroy, on_will_render, on_will_start,
        on_will_unmount, on_will_update_props, use_env, use_ref, use_state,
    };
    use crate::reactivity::{reactive, reset_reactivity, total_subscriptions};
    use crate::scheduler::{flush_microtasks, reset_scheduler};

    fn setup() -> Document {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        reset_reactivity();
        reset_scheduler();
        Document::new()
    }

    /// Setup closure shared by most fixtures: observe the app environment and
    /// expose it to the template as `ctx`.
    fn observe_env() -> Result<()> {
        let ctx = use_state(use_env()?)?;
        expose("ctx", ctx)
    }

    fn find_tag(node: &DomNode, tag: &str) -> Option<DomNode> {
        if node.tag().as_deref() == Some(tag) {
            return Some(node.clone());
        }
        for child in node.children() {
            if let Some(found) = find_tag(&child, tag) {
                return Some(found);
            }
        }
        None
    }

    /// Resolves once its flag is set, from a later flush cycle.
    struct FlagFuture(Rc<Cell<bool>>);

    impl Future for FlagFuture {
        type Output = Result<()>;

        fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
            if self.0.get() {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        }
    }

    #[test]
    fn test_mount_renders_child_over_shared_env() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("value", Value::num(123.0))]));
        let app = App::new().with_env(env.clone());
        app.add_template("Root", "<div><Child/></div>");
        app.add_template("Child", "<span>{{ ctx.value }}</span>");
        let child = ComponentType::new("Child", "Child")
            .with_setup(observe_env)
            .build();
        let root = ComponentType::new("Root", "Root")
            .with_component(child)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><span>123</span></div>");

        let writes = dom::write_count();
        env.as_obj().unwrap().set("value", Value::num(321.0)).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><span>321</span></div>");
        // one text node changed, so exactly one DOM write
        assert_eq!(dom::write_count() - writes, 1);
    }

    #[test]
    fn test_multiple_mutations_render_once() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([
            ("a", Value::str("1")),
            ("b", Value::str("2")),
        ]));
        let app = App::new().with_env(env.clone());
        app.add_template("Root", "<p>{{ ctx.a }}-{{ ctx.b }}</p>");

        let renders = Rc::new(Cell::new(0u32));
        let root = {
            let renders = renders.clone();
            ComponentType::new("Root", "Root")
                .with_setup(move || {
                    observe_env()?;
                    let renders = renders.clone();
                    on_will_render(move || {
                        renders.set(renders.get() + 1);
                        Ok(())
                    })
                })
                .build()
        };

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<p>1-2</p>");
        assert_eq!(renders.get(), 1);

        let obj = env.as_obj().unwrap().clone();
        obj.set("a", Value::str("3")).unwrap();
        obj.set("b", Value::str("4")).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<p>3-4</p>");
        assert_eq!(renders.get(), 2, "both mutations coalesce into one render");
    }

    #[test]
    fn test_identical_rerender_writes_nothing() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("label", Value::str("same"))]));
        let app = App::new().with_env(env);
        app.add_template("Root", "<p>{{ ctx.label }}</p>");
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .build();

        let mounted = app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<p>same</p>");

        let writes = dom::write_count();
        mounted.node().render(false);
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<p>same</p>");
        assert_eq!(dom::write_count(), writes, "equal data patches touch nothing");
    }

    #[test]
    fn test_superseded_render_commits_once_with_latest_state() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("n", Value::num(0.0))]));
        let app = App::new().with_env(env.clone());
        app.add_template("Root", "<p>{{ ctx.n }}</p>");

        let renders = Rc::new(Cell::new(0u32));
        let commits = Rc::new(Cell::new(0u32));
        let root = {
            let (renders, commits) = (renders.clone(), commits.clone());
            ComponentType::new("Root", "Root")
                .with_setup(move || {
                    observe_env()?;
                    let renders = renders.clone();
                    on_will_render(move || {
                        renders.set(renders.get() + 1);
                        Ok(())
                    })?;
                    let commits = commits.clone();
                    on_patched(move || {
                        commits.set(commits.get() + 1);
                        Ok(())
                    })
                })
                .build()
        };

        let mounted = app.mount(root, &target).unwrap();
        app.tick().unwrap();
        renders.set(0);

        // first render runs but is not committed yet
        mounted.node().render(false);
        flush_microtasks();
        assert_eq!(renders.get(), 1);
        assert_eq!(commits.get(), 0);

        // a mutation supersedes it before completion
        env.as_obj().unwrap().set("n", Value::num(5.0)).unwrap();
        app.tick().unwrap();

        assert_eq!(renders.get(), 2);
        assert_eq!(commits.get(), 1, "superseded work must not commit twice");
        assert_eq!(target.inner_html(), "<p>5</p>");
    }

    #[test]
    fn test_shared_env_renders_parent_before_child() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("value", Value::str("a"))]));
        let app = App::new().with_env(env.clone());
        app.add_template("Root", "<div><p>{{ ctx.value }}</p><Child/></div>");
        app.add_template("Child", "<span>{{ ctx.value }}</span>");

        let order = Rc::new(RefCell::new(Vec::new()));
        let logging_setup = |tag: &'static str, order: &Rc<RefCell<Vec<&'static str>>>| {
            let order = order.clone();
            move || {
                observe_env()?;
                let order = order.clone();
                on_will_render(move || {
                    order.borrow_mut().push(tag);
                    Ok(())
                })
            }
        };
        let child = ComponentType::new("Child", "Child")
            .with_setup(logging_setup("child", &order))
            .build();
        let root = ComponentType::new("Root", "Root")
            .with_setup(logging_setup("parent", &order))
            .with_component(child)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><p>a</p><span>a</span></div>");
        order.borrow_mut().clear();

        env.as_obj().unwrap().set("value", Value::str("b")).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><p>b</p><span>b</span></div>");
        assert_eq!(*order.borrow(), vec!["parent", "child"]);
    }

    #[test]
    fn test_cancelled_child_never_runs_unmount() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("show", Value::Bool(true))]));
        let app = App::new().with_env(env.clone());
        app.add_template("Root", "<div><t x-if=\"ctx.show\"><Child/></t><p>rest</p></div>");
        app.add_template("Child", "<span>never</span>");

        let started = Rc::new(Cell::new(false));
        let unmounts = Rc::new(Cell::new(0u32));
        let destroys = Rc::new(Cell::new(0u32));
        let child = {
            let (started, unmounts, destroys) =
                (started.clone(), unmounts.clone(), destroys.clone());
            ComponentType::new("Child", "Child")
                .with_setup(move || {
                    observe_env()?;
                    let started = started.clone();
                    on_will_start(move || FlagFuture(started.clone()))?;
                    let unmounts = unmounts.clone();
                    on_will_unmount(move || {
                        unmounts.set(unmounts.get() + 1);
                        Ok(())
                    })?;
                    let destroys = destroys.clone();
                    on_will_destroy(move || {
                        destroys.set(destroys.get() + 1);
                        Ok(())
                    })
                })
                .build()
        };
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .with_component(child)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        // the child is stuck in its will-start barrier, so nothing mounted yet
        assert_eq!(target.inner_html(), "");

        // drop the child placement before it ever reached MOUNTED
        env.as_obj().unwrap().set("show", Value::Bool(false)).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><p>rest</p></div>");
        assert_eq!(unmounts.get(), 0, "a never-mounted child has no unmount");
        assert_eq!(destroys.get(), 1);
        let subs = total_subscriptions();

        // the stale barrier resolving later must not resurrect the child
        started.set(true);
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><p>rest</p></div>");
        assert_eq!(total_subscriptions(), subs);
    }

    #[test]
    fn test_removed_child_drops_its_subscriptions() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([
            ("show", Value::Bool(true)),
            ("value", Value::str("x")),
        ]));
        let app = App::new().with_env(env.clone());
        app.add_template("Root", "<div><t x-if=\"ctx.show\"><Child/></t></div>");
        app.add_template("Child", "<span>{{ ctx.value }}</span>");
        let child = ComponentType::new("Child", "Child")
            .with_setup(observe_env)
            .build();
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .with_component(child)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><span>x</span></div>");

        let obj = env.as_obj().unwrap().clone();
        obj.set("show", Value::Bool(false)).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div></div>");
        let baseline = total_subscriptions();

        // a full placement cycle must return the registry to its baseline
        obj.set("show", Value::Bool(true)).unwrap();
        app.tick().unwrap();
        assert!(total_subscriptions() > baseline, "mounted child subscribes");

        obj.set("show", Value::Bool(false)).unwrap();
        app.tick().unwrap();
        assert_eq!(
            total_subscriptions(),
            baseline,
            "destroyed child must leave no subscriptions behind"
        );

        // writes to what the removed child was reading go nowhere
        obj.set("value", Value::str("y")).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div></div>");
    }

    #[test]
    fn test_error_recovered_by_ancestor_handler() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("n", Value::num(1.0))]));
        let app = App::new().with_env(env.clone());
        app.add_template("Root", "<div><Mid v=\"ctx.n\"/><span>{{ ctx.n }}</span></div>");
        app.add_template("Mid", "<p><Leaf v=\"props.v\"/></p>");
        app.add_template("Leaf", "<em>{{ props.v }}</em>");

        let fail_once = Rc::new(Cell::new(false));
        let handled = Rc::new(Cell::new(0u32));
        let leaf = {
            let fail_once = fail_once.clone();
            ComponentType::new("Leaf", "Leaf")
                .with_setup(move || {
                    let fail_once = fail_once.clone();
                    on_will_update_props(move |_props| {
                        let fail = fail_once.take();
                        async move {
                            if fail {
                                Err(CinderError::Runtime("leaf refused the update".to_string()))
                            } else {
                                Ok(())
                            }
                        }
                    })
                })
                .build()
        };
        let mid = ComponentType::new("Mid", "Mid").with_component(leaf).build();
        let root = {
            let handled = handled.clone();
            ComponentType::new("Root", "Root")
                .with_setup(move || {
                    observe_env()?;
                    let handled = handled.clone();
                    on_error(move |_err| {
                        handled.set(handled.get() + 1);
                        Ok(())
                    })
                })
                .with_component(mid)
                .build()
        };

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(
            target.inner_html(),
            "<div><p><em>1</em></p><span>1</span></div>"
        );

        fail_once.set(true);
        env.as_obj().unwrap().set("n", Value::num(2.0)).unwrap();
        app.tick().unwrap();

        assert_eq!(handled.get(), 1, "the handler runs exactly once");
        // recovery re-renders the whole subtree, siblings included
        assert_eq!(
            target.inner_html(),
            "<div><p><em>2</em></p><span>2</span></div>"
        );
    }

    #[test]
    fn test_unhandled_error_destroys_the_root() {
        let doc = setup();
        let target = doc.create_attached("div");
        let app = App::new();
        app.add_template("Root", "<div><Child/></div>");
        app.add_template("Child", "<span>x</span>");
        let child = ComponentType::new("Child", "Child")
            .with_setup(|| {
                on_will_start(|| async {
                    Err(CinderError::Runtime("boot failure".to_string()))
                })
            })
            .build();
        let root = ComponentType::new("Root", "Root")
            .with_component(child)
            .build();

        app.mount(root, &target).unwrap();
        let err = app.tick().unwrap_err();
        assert!(matches!(err, CinderError::Runtime(_)));
        assert!(app.root().is_none());
        assert_eq!(target.inner_html(), "");
    }

    #[test]
    fn test_event_handler_updates_state() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("n", Value::num(0.0))]));
        let app = App::new().with_env(env);
        app.add_template(
            "Root",
            "<button x-on-click=\"ctx.n = ctx.n + 1\">{{ ctx.n }}</button>",
        );
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<button>0</button>");

        let button = find_tag(&target, "button").unwrap();
        attributes::trigger(&button, "click", Value::None);
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<button>1</button>");

        attributes::trigger(&button, "click", Value::None);
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<button>2</button>");
    }

    #[test]
    fn test_ref_resolves_after_mount() {
        let doc = setup();
        let target = doc.create_attached("div");
        let app = App::new();
        app.add_template("Root", "<div><span x-ref=\"tip\">hi</span></div>");

        let handle = Rc::new(RefCell::new(None));
        let root = {
            let handle = handle.clone();
            ComponentType::new("Root", "Root")
                .with_setup(move || {
                    *handle.borrow_mut() = Some(use_ref("tip")?);
                    Ok(())
                })
                .build()
        };

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        let el = handle.borrow().as_ref().unwrap().el().unwrap();
        assert_eq!(el.tag().as_deref(), Some("span"));
    }

    #[test]
    fn test_slots_render_in_the_placing_scope() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([
            ("title", Value::str("T")),
            ("body", Value::str("B")),
        ]));
        let app = App::new().with_env(env.clone());
        app.add_template(
            "Root",
            "<Panel><t x-set-slot=\"title\"><h1>{{ ctx.title }}</h1></t>\
             <p>{{ ctx.body }}</p></Panel>",
        );
        app.add_template(
            "Panel",
            "<div><t x-slot=\"title\"/><t x-slot=\"default\"/></div>",
        );
        let panel = ComponentType::new("Panel", "Panel").build();
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .with_component(panel)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><h1>T</h1><p>B</p></div>");

        env.as_obj().unwrap().set("title", Value::str("T2")).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><h1>T2</h1><p>B</p></div>");
    }

    #[test]
    fn test_keyed_list_reorders() {
        let doc = setup();
        let target = doc.create_attached("div");
        let item = |id: &'static str| Value::obj([("id", Value::str(id))]);
        let env = reactive(Value::obj([(
            "items",
            Value::list([item("a"), item("b"), item("c")]),
        )]));
        let app = App::new().with_env(env.clone());
        app.add_template(
            "Root",
            "<ul><li x-foreach=\"ctx.items\" x-as=\"it\" x-key=\"it.id\">{{ it.id }}</li></ul>",
        );
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<ul><li>a</li><li>b</li><li>c</li></ul>");

        let list = env
            .as_obj()
            .unwrap()
            .get_untracked("items")
            .as_list()
            .unwrap()
            .clone();
        let (first, second) = (list.get(0), list.get(1));
        list.set(0, second).unwrap();
        list.set(1, first).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<ul><li>b</li><li>a</li><li>c</li></ul>");
    }

    #[test]
    fn test_dynamic_component_swap_rebuilds() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("which", Value::str("Alpha"))]));
        let app = App::new().with_env(env.clone());
        app.add_template("Root", "<div><t x-component=\"ctx.which\"/></div>");
        app.add_template("Alpha", "<p>alpha</p>");
        app.add_template("Beta", "<p>beta</p>");
        app.register_component(ComponentType::new("Alpha", "Alpha").build());
        app.register_component(ComponentType::new("Beta", "Beta").build());
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><p>alpha</p></div>");

        env.as_obj().unwrap().set("which", Value::str("Beta")).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><p>beta</p></div>");
    }

    #[test]
    fn test_raw_output_respects_markup_proof() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("html", Value::markup("<b>hi</b>"))]));
        let app = App::new().with_env(env.clone());
        app.add_template("Root", "<div><t x-out=\"ctx.html\"/></div>");
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><b>hi</b></div>");

        // the same string without the markup proof renders as text
        env.as_obj().unwrap().set("html", Value::str("<b>hi</b>")).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div>&lt;b&gt;hi&lt;/b&gt;</div>");
    }

    #[test]
    fn test_sub_template_call() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("f", Value::str("shared"))]));
        let app = App::new().with_env(env);
        app.add_template("Root", "<div><t x-call=\"Shared\"/></div>");
        app.add_template("Shared", "<footer>{{ ctx.f }}</footer>");
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><footer>shared</footer></div>");
    }

    #[test]
    fn test_portal_renders_into_its_target() {
        let doc = setup();
        let target = doc.create_attached("div");
        let overlay = doc.create_attached("aside");
        let env = reactive(Value::obj([("overlay", Value::Node(overlay.clone()))]));
        let app = App::new().with_env(env);
        app.add_template(
            "Root",
            "<div><t x-portal=\"ctx.overlay\"><p>tip</p></t></div>",
        );
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(overlay.inner_html(), "<p>tip</p>");
        assert_eq!(target.inner_html(), "<div></div>");
    }

    #[test]
    fn test_duplicate_keys_fail_in_dev_mode() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([(
            "items",
            Value::list([Value::str("x"), Value::str("x")]),
        )]));
        let app = App::new().with_env(env).with_dev(true);
        app.add_template(
            "Root",
            "<ul><li x-foreach=\"ctx.items\" x-as=\"it\" x-key=\"it\">{{ it }}</li></ul>",
        );
        let root = ComponentType::new("Root", "Root")
            .with_setup(observe_env)
            .build();

        app.mount(root, &target).unwrap();
        let err = app.tick().unwrap_err();
        assert!(matches!(err, CinderError::DuplicateKey(_)));
    }

    #[test]
    fn test_mutation_during_render_is_rejected() {
        let doc = setup();
        let target = doc.create_attached("div");
        let env = reactive(Value::obj([("n", Value::num(0.0))]));
        let app = App::new().with_env(env.clone());
        app.add_template("Root", "<p>{{ bump() }}</p>");
        let root = {
            ComponentType::new("Root", "Root")
                .with_setup(move || {
                    observe_env()?;
                    let env = env.clone();
                    expose(
                        "bump",
                        Value::func(move |_args| {
                            let obj = env.as_obj().expect("env is an object");
                            obj.set("n", Value::num(1.0))?;
                            Ok(Value::None)
                        }),
                    )
                })
                .build()
        };

        app.mount(root, &target).unwrap();
        let err = app.tick().unwrap_err();
        assert!(matches!(err, CinderError::ReactivityViolation));
    }

    #[test]
    fn test_mount_target_validation() {
        let doc = setup();
        let app = App::new();
        app.add_template("Root", "<p>x</p>");
        let root = ComponentType::new("Root", "Root").build();

        let detached = DomNode::element("div");
        assert!(matches!(
            app.mount(root.clone(), &detached),
            Err(CinderError::InvalidMountTarget(_))
        ));

        let text = DomNode::text("not an element");
        assert!(matches!(
            app.mount(root.clone(), &text),
            Err(CinderError::InvalidMountTarget(_))
        ));

        let target = doc.create_attached("div");
        app.mount(root.clone(), &target).unwrap();
        let other = doc.create_attached("div");
        assert!(app.mount(root, &other).is_err());
    }

    #[test]
    fn test_destroy_runs_teardown_hooks() {
        let doc = setup();
        let target = doc.create_attached("div");
        let app = App::new();
        app.add_template("Root", "<div><Child/></div>");
        app.add_template("Child", "<span>x</span>");

        let order = Rc::new(RefCell::new(Vec::new()));
        let hooked = |tag: &'static str, order: &Rc<RefCell<Vec<String>>>| {
            let order = order.clone();
            move || {
                let o = order.clone();
                on_will_unmount(move || {
                    o.borrow_mut().push(format!("unmount:{tag}"));
                    Ok(())
                })?;
                let o = order.clone();
                on_will_destroy(move || {
                    o.borrow_mut().push(format!("destroy:{tag}"));
                    Ok(())
                })
            }
        };
        let child = ComponentType::new("Child", "Child")
            .with_setup(hooked("child", &order))
            .build();
        let root = ComponentType::new("Root", "Root")
            .with_setup(hooked("root", &order))
            .with_component(child)
            .build();

        app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<div><span>x</span></div>");

        app.destroy();
        assert_eq!(target.inner_html(), "");
        assert_eq!(
            *order.borrow(),
            vec![
                "unmount:root".to_string(),
                "unmount:child".to_string(),
                "destroy:child".to_string(),
                "destroy:root".to_string(),
            ]
        );
    }

    #[test]
    fn test_template_redefinition_invalidates_the_cache() {
        let doc = setup();
        let target = doc.create_attached("div");
        let app = App::new();
        app.add_template("Root", "<p>old</p>");
        let root = ComponentType::new("Root", "Root").build();
        let mounted = app.mount(root, &target).unwrap();
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<p>old</p>");

        app.add_template("Root", "<p>new</p>");
        mounted.node().render(false);
        app.tick().unwrap();
        assert_eq!(target.inner_html(), "<p>new</p>");
    }
}
