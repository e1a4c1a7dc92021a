//! Attribute, property, class and handler application.
//!
//! These are the leaf operations block patching drives. Callers are expected
//! to diff first and only invoke a setter when the value changed; every call
//! here that touches the node counts as a DOM write.
//!
//! Three value conventions:
//! - attributes are tri-state: `false`/none removes, `true` sets the empty
//!   string, anything else sets its text
//! - a handful of (tag, name) pairs are DOM properties, not attributes, and
//!   must be written as such (`value` on an input, `checked`, ...)
//! - `class` is token-based: updates apply the set difference between the old
//!   and new token sets instead of rewriting the whole attribute

use std::rc::Rc;

use rustc_hash::FxHashSet;

use super::{DomNode, Handler};
use crate::value::Value;

/// (tag, name) pairs that must be written as DOM properties.
pub fn is_prop(tag: &str, name: &str) -> bool {
    match tag {
        "input" => matches!(
            name,
            "checked" | "indeterminate" | "value" | "readonly" | "disabled"
        ),
        "option" => matches!(name, "selected" | "disabled"),
        "textarea" => matches!(name, "value" | "readonly" | "disabled"),
        "select" => matches!(name, "value" | "disabled"),
        "button" | "optgroup" => name == "disabled",
        _ => false,
    }
}

pub fn is_boolean_attr(name: &str) -> bool {
    matches!(
        name,
        "checked" | "selected" | "disabled" | "readonly" | "required" | "autofocus" | "hidden"
    )
}

/// Tri-state attribute write.
pub fn set_attribute(el: &DomNode, name: &str, value: &Value) {
    let Some(attrs) = el.attributes() else { return };
    match value {
        Value::None | Value::Bool(false) => {
            if attrs.borrow_mut().shift_remove(name).is_some() {
                el.note_write();
            }
        }
        Value::Bool(true) => {
            attrs.borrow_mut().insert(Rc::from(name), String::new());
            el.note_write();
        }
        other => {
            attrs.borrow_mut().insert(Rc::from(name), other.to_text());
            el.note_write();
        }
    }
}

pub fn remove_attribute(el: &DomNode, name: &str) {
    set_attribute(el, name, &Value::None);
}

pub fn set_property(el: &DomNode, name: &str, value: &Value) {
    if let Some(props) = el.properties() {
        props.borrow_mut().insert(Rc::from(name), value.clone());
        el.note_write();
    }
}

pub fn get_property(el: &DomNode, name: &str) -> Value {
    el.properties()
        .and_then(|p| p.borrow().get(name).cloned())
        .unwrap_or(Value::None)
}

// =============================================================================
// Attribute spreads
// =============================================================================

/// Apply an attribute object wholesale (`class` entries go through the
/// token-based path).
pub fn set_attrs(el: &DomNode, value: &Value) {
    let Some(obj) = value.as_obj() else { return };
    for key in obj.keys() {
        let v = obj.get(&key);
        if &*key == "class" {
            set_class(el, &v);
        } else {
            set_attribute(el, &key, &v);
        }
    }
}

/// Diff two attribute objects: removed keys are cleared, changed keys
/// rewritten, identical keys skipped.
pub fn update_attrs(el: &DomNode, old: &Value, new: &Value) {
    if old.same(new) {
        return;
    }
    let old_keys: Vec<Rc<str>> = old.as_obj().map(|o| o.keys()).unwrap_or_default();
    let new_obj = new.as_obj();
    for key in &old_keys {
        let still_present = new_obj.is_some_and(|o| o.has(key));
        if !still_present {
            if &**key == "class" {
                update_class(el, &old.as_obj().unwrap().get(key), &Value::None);
            } else {
                remove_attribute(el, key);
            }
        }
    }
    let Some(new_obj) = new_obj else { return };
    for key in new_obj.keys() {
        let new_v = new_obj.get(&key);
        let old_v = old
            .as_obj()
            .map(|o| o.get_untracked(&key))
            .unwrap_or(Value::None);
        if old_v.same(&new_v) {
            continue;
        }
        if &*key == "class" {
            update_class(el, &old_v, &new_v);
        } else {
            set_attribute(el, &key, &new_v);
        }
    }
}

// =============================================================================
// Classes
// =============================================================================

/// Expand a class value into its tokens: strings split on whitespace,
/// objects contribute the keys whose values are truthy, lists flatten.
fn class_tokens(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Str(s) | Value::Markup(s) => {
            out.extend(s.split_whitespace().map(str::to_string));
        }
        Value::Obj(o) => {
            for key in o.keys() {
                if o.get(&key).truthy() {
                    out.push(key.to_string());
                }
            }
        }
        Value::List(l) => {
            for item in l.iter_values() {
                class_tokens(&item, out);
            }
        }
        _ => {}
    }
}

fn add_class_token(el: &DomNode, token: &str) {
    let Some(attrs) = el.attributes() else { return };
    let mut attrs = attrs.borrow_mut();
    let current = attrs.entry(Rc::from("class")).or_default();
    if current.split_whitespace().any(|t| t == token) {
        return;
    }
    if !current.is_empty() {
        current.push(' ');
    }
    current.push_str(token);
    drop(attrs);
    el.note_write();
}

fn remove_class_token(el: &DomNode, token: &str) {
    let Some(attrs) = el.attributes() else { return };
    let mut attrs = attrs.borrow_mut();
    let Some(current) = attrs.get_mut("class") else {
        return;
    };
    let filtered: Vec<&str> = current
        .split_whitespace()
        .filter(|t| *t != token)
        .collect();
    let next = filtered.join(" ");
    if next != *current {
        *current = next;
        drop(attrs);
        el.note_write();
    }
}

pub fn set_class(el: &DomNode, value: &Value) {
    let mut tokens = Vec::new();
    class_tokens(value, &mut tokens);
    for token in tokens {
        add_class_token(el, &token);
    }
}

/// Token set difference: removes what only the old value had, adds what only
/// the new value has. Tokens present in both are untouched.
pub fn update_class(el: &DomNode, old: &Value, new: &Value) {
    let mut old_tokens = Vec::new();
    class_tokens(old, &mut old_tokens);
    let mut new_tokens = Vec::new();
    class_tokens(new, &mut new_tokens);

    let old_set: FxHashSet<&str> = old_tokens.iter().map(String::as_str).collect();
    let new_set: FxHashSet<&str> = new_tokens.iter().map(String::as_str).collect();

    for token in &old_tokens {
        if !new_set.contains(token.as_str()) {
            remove_class_token(el, token);
        }
    }
    for token in &new_tokens {
        if !old_set.contains(token.as_str()) {
            add_class_token(el, token);
        }
    }
}

// =============================================================================
// Event handlers
// =============================================================================

pub fn set_handler(el: &DomNode, event: &str, handler: Handler) {
    if let Some(handlers) = el.handlers() {
        handlers.borrow_mut().insert(Rc::from(event), handler);
    }
}

pub fn remove_handler(el: &DomNode, event: &str) {
    if let Some(handlers) = el.handlers() {
        handlers.borrow_mut().remove(event);
    }
}

/// Dispatch an event at `el`: its handler runs first, then the event bubbles
/// up through the ancestor chain.
pub fn trigger(el: &DomNode, event: &str, payload: Value) {
    let mut current = Some(el.clone());
    while let Some(node) = current {
        let handler = node
            .handlers()
            .and_then(|h| h.borrow().get(event).cloned());
        if let Some(handler) = handler {
            handler(payload.clone());
        }
        current = node.parent();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::dom::write_count;

    #[test]
    fn test_tri_state_attribute() {
        let el = DomNode::element("div");
        set_attribute(&el, "title", &Value::str("hello"));
        assert_eq!(el.get_attribute("title").as_deref(), Some("hello"));

        set_attribute(&el, "hidden", &Value::Bool(true));
        assert_eq!(el.get_attribute("hidden").as_deref(), Some(""));

        set_attribute(&el, "title", &Value::Bool(false));
        assert_eq!(el.get_attribute("title"), None);

        set_attribute(&el, "hidden", &Value::None);
        assert_eq!(el.outer_html(), "<div></div>");
    }

    #[test]
    fn test_is_prop_table() {
        assert!(is_prop("input", "value"));
        assert!(is_prop("input", "checked"));
        assert!(is_prop("option", "selected"));
        assert!(is_prop("textarea", "value"));
        assert!(!is_prop("div", "value"));
        assert!(!is_prop("input", "type"));
    }

    #[test]
    fn test_property_bypasses_attributes() {
        let el = DomNode::element("input");
        set_property(&el, "value", &Value::str("typed"));
        assert_eq!(get_property(&el, "value").to_text(), "typed");
        assert_eq!(el.get_attribute("value"), None);
    }

    #[test]
    fn test_class_set_difference() {
        let el = DomNode::element("div");
        set_class(&el, &Value::str("a b c"));
        assert_eq!(el.get_attribute("class").as_deref(), Some("a b c"));

        let before = write_count();
        update_class(&el, &Value::str("a b c"), &Value::str("b c d"));
        assert_eq!(el.get_attribute("class").as_deref(), Some("b c d"));
        // one removal (a) plus one addition (d)
        assert_eq!(write_count(), before + 2);

        let before = write_count();
        update_class(&el, &Value::str("b c d"), &Value::str("d c b"));
        assert_eq!(write_count(), before, "same token set is a no-op");
    }

    #[test]
    fn test_class_from_object() {
        let el = DomNode::element("div");
        let spec = Value::obj([("active", Value::Bool(true)), ("muted", Value::Bool(false))]);
        set_class(&el, &spec);
        assert_eq!(el.get_attribute("class").as_deref(), Some("active"));
    }

    #[test]
    fn test_update_attrs_removes_stale_keys() {
        let el = DomNode::element("div");
        let old = Value::obj([("a", Value::str("1")), ("b", Value::str("2"))]);
        set_attrs(&el, &old);
        let new = Value::obj([("b", Value::str("2")), ("c", Value::str("3"))]);
        update_attrs(&el, &old, &new);
        assert_eq!(el.get_attribute("a"), None);
        assert_eq!(el.get_attribute("b").as_deref(), Some("2"));
        assert_eq!(el.get_attribute("c").as_deref(), Some("3"));
    }

    #[test]
    fn test_trigger_bubbles() {
        let parent = DomNode::element("div");
        let child = DomNode::element("button");
        parent.append_child(&child);

        let clicks = Rc::new(Cell::new(0u32));
        let log = Rc::new(std::cell::RefCell::new(Vec::new()));
        {
            let log = log.clone();
            set_handler(&child, "click", Rc::new(move |_| log.borrow_mut().push("child")));
        }
        {
            let log = log.clone();
            let clicks = clicks.clone();
            set_handler(
                &parent,
                "click",
                Rc::new(move |_| {
                    clicks.set(clicks.get() + 1);
                    log.borrow_mut().push("parent");
                }),
            );
        }

        trigger(&child, "click", Value::None);
        assert_eq!(*log.borrow(), vec!["child", "parent"]);
        assert_eq!(clicks.get(), 1);
    }
}
