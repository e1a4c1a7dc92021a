//! Dynamic values and scopes.
//!
//! The template language is dynamically typed: expressions evaluate to a
//! [`Value`], a closed union over the kinds of data a template can touch.
//! Heap-backed kinds (strings, lists, objects, functions) are `Rc` handles, so
//! cloning a `Value` is cheap and patch-time diffing can use reference
//! equality ([`Value::same`]), which is what keeps unchanged slots from
//! producing DOM writes.
//!
//! [`Scope`] is the prototype-chained variable environment render programs
//! evaluate against: lookups fall through to the parent chain, loop bodies and
//! sub-template calls get a child scope that is simply dropped afterwards.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::dom::DomNode;
use crate::error::Result;
use crate::reactivity::{self, RKey};

thread_local! {
    static NEXT_TARGET_ID: Cell<u64> = const { Cell::new(1) };
}

fn next_target_id() -> u64 {
    NEXT_TARGET_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    })
}

pub type ValueFn = dyn Fn(&[Value]) -> Result<Value>;

/// A dynamic template value.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Num(f64),
    Str(Rc<str>),
    /// A string carrying the proof that it is safe to inject as raw HTML.
    Markup(Rc<str>),
    List(Rc<ListData>),
    Obj(Rc<ObjectData>),
    Fn(Rc<ValueFn>),
    /// A DOM reference (ref callbacks, event payloads).
    Node(DomNode),
}

/// Backing storage for an object value. Field order is preserved because key
/// iteration order is observable from templates.
pub struct ObjectData {
    id: u64,
    observable: Cell<bool>,
    fields: RefCell<IndexMap<Rc<str>, Value>>,
}

/// Backing storage for a list value.
pub struct ListData {
    id: u64,
    observable: Cell<bool>,
    items: RefCell<Vec<Value>>,
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    /// Wrap a string as markup, i.e. safe for raw HTML injection.
    pub fn markup(s: impl AsRef<str>) -> Value {
        Value::Markup(Rc::from(s.as_ref()))
    }

    pub fn num(n: f64) -> Value {
        Value::Num(n)
    }

    pub fn obj(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
        let fields: IndexMap<Rc<str>, Value> = entries
            .into_iter()
            .map(|(k, v)| (Rc::from(k), v))
            .collect();
        Value::Obj(Rc::new(ObjectData {
            id: next_target_id(),
            observable: Cell::new(false),
            fields: RefCell::new(fields),
        }))
    }

    pub fn empty_obj() -> Value {
        Value::obj([])
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        Value::List(Rc::new(ListData {
            id: next_target_id(),
            observable: Cell::new(false),
            items: RefCell::new(items.into_iter().collect()),
        }))
    }

    pub fn func(f: impl Fn(&[Value]) -> Result<Value> + 'static) -> Value {
        Value::Fn(Rc::new(f))
    }

    /// Reference equality for heap kinds, value equality for scalars. This is
    /// the equality used by patch-time diffing: two values that are `same`
    /// are guaranteed to render identically, so their slot is skipped.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Markup(a), Value::Markup(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Obj(a), Value::Obj(b)) => Rc::ptr_eq(a, b),
            (Value::Fn(a), Value::Fn(b)) => Rc::ptr_eq(a, b),
            (Value::Node(a), Value::Node(b)) => a.same_node(b),
            _ => false,
        }
    }

    /// Structural equality, used by the expression language's `==`.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a) | Value::Markup(a), Value::Str(b) | Value::Markup(b)) => a == b,
            _ => self.same(other),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) | Value::Markup(s) => !s.is_empty(),
            Value::List(_) | Value::Obj(_) | Value::Fn(_) | Value::Node(_) => true,
        }
    }

    /// Stringification used for text slots and attribute values.
    pub fn to_text(&self) -> String {
        match self {
            Value::None => String::new(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Num(n) => num_to_text(*n),
            Value::Str(s) | Value::Markup(s) => s.to_string(),
            Value::List(l) => {
                let items = l.items.borrow();
                items
                    .iter()
                    .map(Value::to_text)
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Obj(_) => "[object]".to_string(),
            Value::Fn(_) => "[function]".to_string(),
            Value::Node(_) => "[node]".to_string(),
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<&Rc<ObjectData>> {
        match self {
            Value::Obj(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Rc<ListData>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Mark this value (and, lazily, everything read through it) observable:
    /// reads subscribe the active observer, writes notify subscribers.
    pub fn make_observable(&self) {
        match self {
            Value::Obj(o) => o.observable.set(true),
            Value::List(l) => l.observable.set(true),
            _ => {}
        }
    }

    pub fn is_observable(&self) -> bool {
        match self {
            Value::Obj(o) => o.observable.get(),
            Value::List(l) => l.observable.get(),
            _ => false,
        }
    }

    /// HTML-escaped text for this value. Markup passes through untouched.
    pub fn escaped(&self) -> String {
        match self {
            Value::Markup(s) => s.to_string(),
            other => html_escape(&other.to_text()),
        }
    }
}

fn num_to_text(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&#x27;"),
            '"' => out.push_str("&quot;"),
            '`' => out.push_str("&#x60;"),
            _ => out.push(c),
        }
    }
    out
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Markup(s) => write!(f, "markup({s:?})"),
            Value::List(l) => write!(f, "{:?}", l.items.borrow()),
            Value::Obj(o) => {
                let fields = o.fields.borrow();
                f.debug_map().entries(fields.iter()).finish()
            }
            Value::Fn(_) => write!(f, "[function]"),
            Value::Node(n) => write!(f, "[node {}]", n.id()),
        }
    }
}

// =============================================================================
// Object access
// =============================================================================

impl ObjectData {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read a field. Subscribes the active observer when this object is
    /// observable, and propagates observability to nested containers so that
    /// deep reads keep subscribing.
    pub fn get(&self, key: &str) -> Value {
        if self.observable.get() {
            reactivity::observe(self.id, RKey::field(key));
        }
        let value = self
            .fields
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or(Value::None);
        if self.observable.get() {
            value.make_observable();
        }
        value
    }

    pub fn has(&self, key: &str) -> bool {
        if self.observable.get() {
            reactivity::observe(self.id, RKey::KeyChanges);
        }
        self.fields.borrow().contains_key(key)
    }

    /// Current keys, in insertion order. Subscribes to key creation/deletion.
    pub fn keys(&self) -> Vec<Rc<str>> {
        if self.observable.get() {
            reactivity::observe(self.id, RKey::KeyChanges);
        }
        self.fields.borrow().keys().cloned().collect()
    }

    /// Write a field. Checked against the mutation guard; notifies the key's
    /// subscribers, plus the key-changes sentinel when the key is new.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        if self.observable.get() {
            reactivity::ensure_mutations_allowed()?;
        }
        let (is_new, changed) = {
            let mut fields = self.fields.borrow_mut();
            match fields.get(key) {
                Some(old) => {
                    let changed = !old.same(&value);
                    if changed {
                        fields.insert(Rc::from(key), value);
                    }
                    (false, changed)
                }
                None => {
                    fields.insert(Rc::from(key), value);
                    (true, true)
                }
            }
        };
        if self.observable.get() {
            if is_new {
                reactivity::notify(self.id, RKey::KeyChanges);
            }
            if changed {
                reactivity::notify(self.id, RKey::field(key));
            }
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        if self.observable.get() {
            reactivity::ensure_mutations_allowed()?;
        }
        let removed = self.fields.borrow_mut().shift_remove(key).is_some();
        if removed && self.observable.get() {
            reactivity::notify(self.id, RKey::KeyChanges);
            reactivity::notify(self.id, RKey::field(key));
        }
        Ok(())
    }

    /// Raw read without subscribing (internal bookkeeping paths).
    pub fn get_untracked(&self, key: &str) -> Value {
        self.fields
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or(Value::None)
    }
}

// =============================================================================
// List access
// =============================================================================

impl ListData {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        if self.observable.get() {
            reactivity::observe(self.id, RKey::Length);
        }
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Value {
        if self.observable.get() {
            reactivity::observe(self.id, RKey::Index(index));
        }
        let value = self
            .items
            .borrow()
            .get(index)
            .cloned()
            .unwrap_or(Value::None);
        if self.observable.get() {
            value.make_observable();
        }
        value
    }

    pub fn set(&self, index: usize, value: Value) -> Result<()> {
        if self.observable.get() {
            reactivity::ensure_mutations_allowed()?;
        }
        let changed = {
            let mut items = self.items.borrow_mut();
            if index >= items.len() {
                items.resize(index + 1, Value::None);
            }
            let changed = !items[index].same(&value);
            items[index] = value;
            changed
        };
        if changed && self.observable.get() {
            reactivity::notify(self.id, RKey::Index(index));
        }
        Ok(())
    }

    pub fn push(&self, value: Value) -> Result<()> {
        if self.observable.get() {
            reactivity::ensure_mutations_allowed()?;
        }
        let index = {
            let mut items = self.items.borrow_mut();
            items.push(value);
            items.len() - 1
        };
        if self.observable.get() {
            reactivity::notify(self.id, RKey::Index(index));
            reactivity::notify(self.id, RKey::Length);
            reactivity::notify(self.id, RKey::KeyChanges);
        }
        Ok(())
    }

    pub fn pop(&self) -> Result<Value> {
        if self.observable.get() {
            reactivity::ensure_mutations_allowed()?;
        }
        let (popped, index) = {
            let mut items = self.items.borrow_mut();
            let popped = items.pop().unwrap_or(Value::None);
            (popped, items.len())
        };
        if self.observable.get() {
            reactivity::notify(self.id, RKey::Index(index));
            reactivity::notify(self.id, RKey::Length);
            reactivity::notify(self.id, RKey::KeyChanges);
        }
        Ok(popped)
    }

    /// Snapshot of the items. Subscribes to length and every index, which is
    /// what iteration means for an observable list.
    pub fn iter_values(&self) -> Vec<Value> {
        if self.observable.get() {
            reactivity::observe(self.id, RKey::Length);
            reactivity::observe(self.id, RKey::KeyChanges);
        }
        let items: Vec<Value> = self.items.borrow().clone();
        if self.observable.get() {
            for (i, item) in items.iter().enumerate() {
                reactivity::observe(self.id, RKey::Index(i));
                item.make_observable();
            }
        }
        items
    }
}

// =============================================================================
// Scopes
// =============================================================================

/// A prototype-chained variable environment.
pub struct Scope {
    vars: RefCell<FxHashMap<Rc<str>, Value>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn new() -> Rc<Scope> {
        Rc::new(Scope {
            vars: RefCell::new(FxHashMap::default()),
            parent: None,
        })
    }

    /// A child scope chained to `self`. Lookups fall through; definitions
    /// stay local, so dropping the child restores the outer environment.
    pub fn child(self: &Rc<Scope>) -> Rc<Scope> {
        Rc::new(Scope {
            vars: RefCell::new(FxHashMap::default()),
            parent: Some(self.clone()),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.vars.borrow().get(name) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    /// Bind `name` in this scope, shadowing any outer binding.
    pub fn define(&self, name: impl AsRef<str>, value: Value) {
        self.vars.borrow_mut().insert(Rc::from(name.as_ref()), value);
    }

    /// Assign to the nearest scope already defining `name`, else bind local.
    pub fn assign(&self, name: &str, value: Value) {
        if self.vars.borrow().contains_key(name) {
            self.vars.borrow_mut().insert(Rc::from(name), value);
            return;
        }
        let mut current = self.parent.as_deref();
        while let Some(scope) = current {
            if scope.vars.borrow().contains_key(name) {
                scope.vars.borrow_mut().insert(Rc::from(name), value);
                return;
            }
            current = scope.parent.as_deref();
        }
        self.vars.borrow_mut().insert(Rc::from(name), value);
    }

    /// A flat, frozen capture of the given names, for deferred closures
    /// (event handlers, slot render functions): each captured variable is
    /// hoisted into a fresh binding so later scope mutation cannot leak in.
    pub fn capture(self: &Rc<Scope>, names: &[Rc<str>]) -> Rc<Scope> {
        let snapshot = Scope::new();
        for name in names {
            if let Some(v) = self.lookup(name) {
                snapshot.define(name.as_ref(), v);
            }
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactivity::reset_reactivity;

    #[test]
    fn test_same_is_reference_equality_for_heap_kinds() {
        let a = Value::list([Value::num(1.0)]);
        let b = Value::list([Value::num(1.0)]);
        assert!(a.same(&a.clone()), "clone shares the backing store");
        assert!(!a.same(&b), "distinct lists are not same");

        assert!(Value::num(3.0).same(&Value::num(3.0)));
        assert!(Value::str("x").same(&Value::str("x")));
    }

    #[test]
    fn test_to_text() {
        assert_eq!(Value::num(3.0).to_text(), "3");
        assert_eq!(Value::num(3.5).to_text(), "3.5");
        assert_eq!(Value::None.to_text(), "");
        assert_eq!(Value::Bool(true).to_text(), "true");
        assert_eq!(Value::str("hey").to_text(), "hey");
    }

    #[test]
    fn test_escaped() {
        assert_eq!(Value::str("<b>&'\"").escaped(), "&lt;b&gt;&amp;&#x27;&quot;");
        assert_eq!(Value::markup("<b>ok</b>").escaped(), "<b>ok</b>");
    }

    #[test]
    fn test_truthy() {
        assert!(!Value::None.truthy());
        assert!(!Value::str("").truthy());
        assert!(!Value::num(0.0).truthy());
        assert!(Value::str("0").truthy());
        assert!(Value::empty_obj().truthy());
    }

    #[test]
    fn test_object_get_set() {
        reset_reactivity();
        let obj = Value::obj([("a", Value::num(1.0))]);
        let data = obj.as_obj().unwrap();
        assert_eq!(data.get("a").to_text(), "1");
        assert!(matches!(data.get("missing"), Value::None));
        data.set("b", Value::str("two")).unwrap();
        assert_eq!(data.keys().len(), 2);
        data.remove("a").unwrap();
        assert!(!data.has("a"));
    }

    #[test]
    fn test_scope_chain() {
        let root = Scope::new();
        root.define("x", Value::num(1.0));
        let inner = root.child();
        inner.define("y", Value::num(2.0));

        assert_eq!(inner.lookup("x").unwrap().to_text(), "1");
        assert_eq!(inner.lookup("y").unwrap().to_text(), "2");
        assert!(root.lookup("y").is_none(), "child bindings stay local");

        // assign goes to the defining scope
        inner.assign("x", Value::num(10.0));
        assert_eq!(root.lookup("x").unwrap().to_text(), "10");
    }

    #[test]
    fn test_scope_capture_is_frozen() {
        let scope = Scope::new();
        scope.define("v", Value::num(1.0));
        let captured = scope.capture(&[Rc::from("v")]);
        scope.assign("v", Value::num(2.0));
        assert_eq!(captured.lookup("v").unwrap().to_text(), "1");
    }
}
