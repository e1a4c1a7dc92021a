//! In-memory DOM.
//!
//! The runtime patches a real tree of nodes, not a widget abstraction: blocks
//! clone template fragments, walk `first_child`/`next_sibling` to collect
//! references, and mutate attributes and text in place. This module provides
//! that tree: a linked structure of element, text and comment nodes under a
//! document root, plus a serializer for assertions and a global write counter
//! so tests can prove that an unchanged render touches nothing.
//!
//! Ownership: parents own their first child, nodes own their next sibling.
//! All back references (parent, previous sibling, last child) are weak, so a
//! detached subtree frees itself when the last handle drops.

pub mod attributes;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::value::{Value, html_escape};

thread_local! {
    static NEXT_NODE_ID: Cell<u64> = const { Cell::new(1) };
    static WRITE_COUNT: Cell<u64> = const { Cell::new(0) };
}

/// Total number of DOM mutations performed on this thread. Tests snapshot it
/// around a patch to assert how much work the diff actually did.
pub fn write_count() -> u64 {
    WRITE_COUNT.with(Cell::get)
}

fn record_write() {
    WRITE_COUNT.with(|c| c.set(c.get() + 1));
}

pub(crate) type Handler = Rc<dyn Fn(Value)>;

enum NodeKind {
    Document,
    Element {
        tag: Rc<str>,
        attributes: RefCell<IndexMap<Rc<str>, String>>,
        // DOM properties (value, checked, ...) live apart from attributes
        properties: RefCell<FxHashMap<Rc<str>, Value>>,
        handlers: RefCell<FxHashMap<Rc<str>, Handler>>,
    },
    Text(RefCell<String>),
    Comment(RefCell<String>),
}

pub struct NodeData {
    id: u64,
    kind: NodeKind,
    parent: RefCell<Weak<NodeData>>,
    prev: RefCell<Weak<NodeData>>,
    next: RefCell<Option<Rc<NodeData>>>,
    first: RefCell<Option<Rc<NodeData>>>,
    last: RefCell<Weak<NodeData>>,
}

/// A shared handle to a DOM node.
#[derive(Clone)]
pub struct DomNode(Rc<NodeData>);

fn new_node(kind: NodeKind) -> DomNode {
    let id = NEXT_NODE_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    });
    DomNode(Rc::new(NodeData {
        id,
        kind,
        parent: RefCell::new(Weak::new()),
        prev: RefCell::new(Weak::new()),
        next: RefCell::new(None),
        first: RefCell::new(None),
        last: RefCell::new(Weak::new()),
    }))
}

/// The tree root components mount into.
pub struct Document {
    root: DomNode,
}

impl Document {
    pub fn new() -> Document {
        Document {
            root: new_node(NodeKind::Document),
        }
    }

    pub fn root(&self) -> DomNode {
        self.root.clone()
    }

    /// Convenience: an element already attached to the document.
    pub fn create_attached(&self, tag: &str) -> DomNode {
        let el = DomNode::element(tag);
        self.root.append_child(&el);
        el
    }
}

impl Default for Document {
    fn default() -> Self {
        Document::new()
    }
}

impl DomNode {
    pub fn element(tag: &str) -> DomNode {
        new_node(NodeKind::Element {
            tag: Rc::from(tag),
            attributes: RefCell::new(IndexMap::new()),
            properties: RefCell::new(FxHashMap::default()),
            handlers: RefCell::new(FxHashMap::default()),
        })
    }

    pub fn text(content: &str) -> DomNode {
        new_node(NodeKind::Text(RefCell::new(content.to_string())))
    }

    pub fn comment(content: &str) -> DomNode {
        new_node(NodeKind::Comment(RefCell::new(content.to_string())))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn same_node(&self, other: &DomNode) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_element(&self) -> bool {
        matches!(self.0.kind, NodeKind::Element { .. })
    }

    pub fn is_text(&self) -> bool {
        matches!(self.0.kind, NodeKind::Text(_))
    }

    pub fn tag(&self) -> Option<Rc<str>> {
        match &self.0.kind {
            NodeKind::Element { tag, .. } => Some(tag.clone()),
            _ => None,
        }
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    pub fn parent(&self) -> Option<DomNode> {
        self.0.parent.borrow().upgrade().map(DomNode)
    }

    pub fn first_child(&self) -> Option<DomNode> {
        self.0.first.borrow().clone().map(DomNode)
    }

    pub fn last_child(&self) -> Option<DomNode> {
        self.0.last.borrow().upgrade().map(DomNode)
    }

    pub fn next_sibling(&self) -> Option<DomNode> {
        self.0.next.borrow().clone().map(DomNode)
    }

    pub fn prev_sibling(&self) -> Option<DomNode> {
        self.0.prev.borrow().upgrade().map(DomNode)
    }

    pub fn children(&self) -> Vec<DomNode> {
        let mut out = Vec::new();
        let mut cur = self.first_child();
        while let Some(node) = cur {
            cur = node.next_sibling();
            out.push(node);
        }
        out
    }

    /// True when the ancestor chain reaches a document root.
    pub fn is_attached(&self) -> bool {
        let mut cur = self.clone();
        loop {
            if matches!(cur.0.kind, NodeKind::Document) {
                return true;
            }
            match cur.parent() {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    // =========================================================================
    // Structure mutation
    // =========================================================================

    pub fn append_child(&self, node: &DomNode) {
        self.insert_before(node, None);
    }

    /// Insert `node` as a child of `self`, before `anchor` (or at the end).
    /// The node is detached from its previous position first, which is what
    /// makes moves a single operation.
    pub fn insert_before(&self, node: &DomNode, anchor: Option<&DomNode>) {
        node.detach();
        match anchor {
            None => {
                if let Some(last) = self.last_child() {
                    *last.0.next.borrow_mut() = Some(node.0.clone());
                    *node.0.prev.borrow_mut() = Rc::downgrade(&last.0);
                } else {
                    *self.0.first.borrow_mut() = Some(node.0.clone());
                }
                *self.0.last.borrow_mut() = Rc::downgrade(&node.0);
            }
            Some(anchor) => {
                debug_assert!(
                    anchor.parent().is_some_and(|p| p.same_node(self)),
                    "anchor must be a child of the insertion parent"
                );
                let prev = anchor.prev_sibling();
                *node.0.next.borrow_mut() = Some(anchor.0.clone());
                *anchor.0.prev.borrow_mut() = Rc::downgrade(&node.0);
                match prev {
                    Some(prev) => {
                        *prev.0.next.borrow_mut() = Some(node.0.clone());
                        *node.0.prev.borrow_mut() = Rc::downgrade(&prev.0);
                    }
                    None => {
                        *self.0.first.borrow_mut() = Some(node.0.clone());
                        *node.0.prev.borrow_mut() = Weak::new();
                    }
                }
            }
        }
        *node.0.parent.borrow_mut() = Rc::downgrade(&self.0);
        record_write();
    }

    /// Unlink this node from its parent. No-op when already detached.
    pub fn remove(&self) {
        if self.parent().is_some() {
            self.detach();
            record_write();
        }
    }

    fn detach(&self) {
        let Some(parent) = self.parent() else {
            // no parent: the node may still hold sibling links from a
            // previous attachment, so clear them before returning
            *self.0.next.borrow_mut() = None;
            *self.0.prev.borrow_mut() = Weak::new();
            return;
        };
        let next = self.0.next.borrow_mut().take();
        let prev = self.0.prev.borrow().upgrade();
        match (&prev, &next) {
            (Some(p), Some(n)) => {
                *p.next.borrow_mut() = Some(n.clone());
                *n.prev.borrow_mut() = Rc::downgrade(p);
            }
            (Some(p), None) => {
                *p.next.borrow_mut() = None;
                *parent.0.last.borrow_mut() = Rc::downgrade(p);
            }
            (None, Some(n)) => {
                *parent.0.first.borrow_mut() = Some(n.clone());
                *n.prev.borrow_mut() = Weak::new();
            }
            (None, None) => {
                *parent.0.first.borrow_mut() = None;
                *parent.0.last.borrow_mut() = Weak::new();
            }
        }
        *self.0.parent.borrow_mut() = Weak::new();
        *self.0.prev.borrow_mut() = Weak::new();
    }

    /// Drop every child in one operation. The fast path for clearing a
    /// parent whose single content block is being removed.
    pub fn clear_children(&self) {
        let mut cur = self.0.first.borrow_mut().take();
        *self.0.last.borrow_mut() = Weak::new();
        while let Some(node) = cur {
            cur = node.next.borrow_mut().take();
            *node.parent.borrow_mut() = Weak::new();
            *node.prev.borrow_mut() = Weak::new();
        }
        record_write();
    }

    // =========================================================================
    // Content
    // =========================================================================

    /// For text/comment nodes: replace the character data. For elements:
    /// replace all children with a single text node (or nothing).
    pub fn set_text_content(&self, text: &str) {
        match &self.0.kind {
            NodeKind::Text(data) | NodeKind::Comment(data) => {
                *data.borrow_mut() = text.to_string();
                record_write();
            }
            _ => {
                self.clear_children();
                if !text.is_empty() {
                    self.append_child(&DomNode::text(text));
                }
            }
        }
    }

    pub fn text_content(&self) -> String {
        match &self.0.kind {
            NodeKind::Text(data) | NodeKind::Comment(data) => data.borrow().clone(),
            _ => self.children().iter().map(DomNode::text_content).collect(),
        }
    }

    pub(crate) fn attributes(&self) -> Option<&RefCell<IndexMap<Rc<str>, String>>> {
        match &self.0.kind {
            NodeKind::Element { attributes, .. } => Some(attributes),
            _ => None,
        }
    }

    pub(crate) fn properties(&self) -> Option<&RefCell<FxHashMap<Rc<str>, Value>>> {
        match &self.0.kind {
            NodeKind::Element { properties, .. } => Some(properties),
            _ => None,
        }
    }

    pub(crate) fn handlers(&self) -> Option<&RefCell<FxHashMap<Rc<str>, Handler>>> {
        match &self.0.kind {
            NodeKind::Element { handlers, .. } => Some(handlers),
            _ => None,
        }
    }

    pub(crate) fn note_write(&self) {
        record_write();
    }

    pub fn get_attribute(&self, name: &str) -> Option<String> {
        self.attributes()?.borrow().get(name).cloned()
    }

    // =========================================================================
    // Cloning
    // =========================================================================

    /// Copy of this node. Attributes and character data are copied; handlers
    /// and properties are not (they are per-instance render output). With
    /// `deep`, the whole subtree is cloned.
    pub fn clone_node(&self, deep: bool) -> DomNode {
        let copy = match &self.0.kind {
            NodeKind::Document => new_node(NodeKind::Document),
            NodeKind::Text(data) => DomNode::text(&data.borrow()),
            NodeKind::Comment(data) => DomNode::comment(&data.borrow()),
            NodeKind::Element {
                tag, attributes, ..
            } => {
                let el = DomNode::element(tag);
                el.attributes()
                    .unwrap()
                    .borrow_mut()
                    .clone_from(&attributes.borrow());
                el
            }
        };
        if deep {
            let mut cur = self.first_child();
            while let Some(child) = cur {
                cur = child.next_sibling();
                let child_copy = child.clone_node(true);
                // direct link, bypassing the write counter: clones are
                // build-time work, not patch output
                if let Some(last) = copy.last_child() {
                    *last.0.next.borrow_mut() = Some(child_copy.0.clone());
                    *child_copy.0.prev.borrow_mut() = Rc::downgrade(&last.0);
                } else {
                    *copy.0.first.borrow_mut() = Some(child_copy.0.clone());
                }
                *copy.0.last.borrow_mut() = Rc::downgrade(&child_copy.0);
                *child_copy.0.parent.borrow_mut() = Rc::downgrade(&copy.0);
            }
        }
        copy
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    pub fn outer_html(&self) -> String {
        let mut out = String::new();
        self.write_html(&mut out);
        out
    }

    pub fn inner_html(&self) -> String {
        let mut out = String::new();
        let mut cur = self.first_child();
        while let Some(node) = cur {
            cur = node.next_sibling();
            node.write_html(&mut out);
        }
        out
    }

    fn write_html(&self, out: &mut String) {
        match &self.0.kind {
            NodeKind::Document => {
                let mut cur = self.first_child();
                while let Some(node) = cur {
                    cur = node.next_sibling();
                    node.write_html(out);
                }
            }
            NodeKind::Text(data) => out.push_str(&html_escape(&data.borrow())),
            NodeKind::Comment(data) => {
                out.push_str("<!--");
                out.push_str(&data.borrow());
                out.push_str("-->");
            }
            NodeKind::Element {
                tag, attributes, ..
            } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attributes.borrow().iter() {
                    out.push(' ');
                    out.push_str(name);
                    if !value.is_empty() || !attributes::is_boolean_attr(name) {
                        out.push_str("=\"");
                        out.push_str(&html_escape(value));
                        out.push('"');
                    }
                }
                if is_void_element(tag) {
                    out.push_str("/>");
                    return;
                }
                out.push('>');
                let mut cur = self.first_child();
                while let Some(node) = cur {
                    cur = node.next_sibling();
                    node.write_html(out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

fn is_void_element(tag: &str) -> bool {
    matches!(
        tag,
        "area" | "base" | "br" | "col" | "embed" | "hr" | "img" | "input" | "link" | "meta"
            | "source" | "track" | "wbr"
    )
}

impl fmt::Debug for DomNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            NodeKind::Document => write!(f, "#document"),
            NodeKind::Text(data) => write!(f, "#text {:?}", data.borrow()),
            NodeKind::Comment(data) => write!(f, "<!--{}-->", data.borrow()),
            NodeKind::Element { tag, .. } => write!(f, "<{tag}> (node {})", self.0.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_links() {
        let doc = Document::new();
        let parent = doc.create_attached("div");
        let a = DomNode::text("a");
        let b = DomNode::text("b");
        let c = DomNode::text("c");
        parent.append_child(&a);
        parent.append_child(&c);
        parent.insert_before(&b, Some(&c));

        assert_eq!(parent.text_content(), "abc");
        assert!(parent.first_child().unwrap().same_node(&a));
        assert!(parent.last_child().unwrap().same_node(&c));
        assert!(b.prev_sibling().unwrap().same_node(&a));
        assert!(b.next_sibling().unwrap().same_node(&c));
        assert!(a.is_attached());
    }

    #[test]
    fn test_remove_relinks_siblings() {
        let parent = DomNode::element("ul");
        let a = DomNode::element("li");
        let b = DomNode::element("li");
        let c = DomNode::element("li");
        for n in [&a, &b, &c] {
            parent.append_child(n);
        }
        b.remove();
        assert!(a.next_sibling().unwrap().same_node(&c));
        assert!(c.prev_sibling().unwrap().same_node(&a));
        assert!(b.parent().is_none());

        c.remove();
        assert!(parent.last_child().unwrap().same_node(&a));
    }

    #[test]
    fn test_insert_before_moves_attached_node() {
        let parent = DomNode::element("div");
        let a = DomNode::text("a");
        let b = DomNode::text("b");
        parent.append_child(&a);
        parent.append_child(&b);
        // moving b before a detaches it first
        parent.insert_before(&b, Some(&a));
        assert_eq!(parent.text_content(), "ba");
    }

    #[test]
    fn test_set_text_content_on_element_replaces_children() {
        let parent = DomNode::element("p");
        parent.append_child(&DomNode::element("span"));
        parent.append_child(&DomNode::text("old"));
        parent.set_text_content("new");
        assert_eq!(parent.outer_html(), "<p>new</p>");
        parent.set_text_content("");
        assert_eq!(parent.outer_html(), "<p></p>");
    }

    #[test]
    fn test_clone_node_deep() {
        let el = DomNode::element("div");
        el.attributes()
            .unwrap()
            .borrow_mut()
            .insert(Rc::from("class"), "x".to_string());
        el.append_child(&DomNode::text("hi"));

        let copy = el.clone_node(true);
        assert!(!copy.same_node(&el));
        assert_eq!(copy.outer_html(), "<div class=\"x\">hi</div>");

        // mutating the copy leaves the original alone
        copy.first_child().unwrap().set_text_content("bye");
        assert_eq!(el.outer_html(), "<div class=\"x\">hi</div>");
    }

    #[test]
    fn test_serializer_escapes_text() {
        let el = DomNode::element("span");
        el.append_child(&DomNode::text("a < b & c"));
        assert_eq!(el.outer_html(), "<span>a &lt; b &amp; c</span>");
    }

    #[test]
    fn test_write_count_tracks_mutations() {
        let parent = DomNode::element("div");
        let before = write_count();
        parent.append_child(&DomNode::text("x"));
        assert_eq!(write_count(), before + 1);
        let unchanged = write_count();
        let _ = parent.outer_html();
        let _ = parent.children();
        assert_eq!(write_count(), unchanged, "reads cost nothing");
    }
}
