//! Compiled element blocks.
//!
//! A [`BlockType`] is compiled once per static template fragment and reused
//! for every render: it owns a detached prototype subtree plus flat
//! instructions describing where the dynamic parts live. Mounting an
//! [`ElemBlock`] clones the prototype, harvests the referenced nodes in one
//! linear pass (each reference is a single `first_child`/`next_sibling` step
//! from an earlier one), applies the data slots, and mounts child blocks at
//! their anchors. Patching walks the location list and touches only the slots
//! whose value fails [`Value::same`].

use std::rc::Rc;

use bitflags::bitflags;
use smallvec::SmallVec;
use tracing::error;

use super::Block;
use crate::dom::{DomNode, attributes};
use crate::value::Value;

/// Static description of a template fragment, produced by the code
/// generator. Dynamic positions carry the index of the data slot that feeds
/// them; `Child` marks an insertion point for a nested block.
pub enum StaticNode {
    Element {
        tag: Rc<str>,
        attrs: Vec<(Rc<str>, String)>,
        dynamics: Vec<(usize, ElemDyn)>,
        children: Vec<StaticNode>,
    },
    Text(String),
    DynamicText(usize),
    Child(usize),
}

/// What a dynamic data slot feeds on its element.
pub enum ElemDyn {
    Attribute(Rc<str>),
    Property(Rc<str>),
    Class,
    /// Whole-object attribute spread.
    Attributes,
    Handler(Rc<str>),
    /// Ref callback, invoked with the node after mount and `None` on remove.
    Ref,
}

bitflags! {
    /// Capability bits of a compiled block type, checked at mount/patch to
    /// skip whole phases.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        const DYNAMIC_DATA = 1;
        const CHILD_SLOTS = 2;
        const COLLECT = 4;
    }
}

enum Step {
    FirstChild(usize),
    NextSibling(usize),
}

struct Collector {
    step: Step,
}

enum Setter {
    Text,
    Attribute(Rc<str>),
    Property(Rc<str>),
    Class,
    Attributes,
    Handler(Rc<str>),
    Ref,
}

struct Location {
    data_idx: usize,
    ref_idx: usize,
    setter: Setter,
}

struct ChildSlot {
    child_idx: usize,
    anchor_ref: usize,
}

/// A compiled, reusable element block type.
pub struct BlockType {
    template: DomNode,
    collectors: SmallVec<[Collector; 8]>,
    locations: SmallVec<[Location; 4]>,
    child_slots: SmallVec<[ChildSlot; 2]>,
    flags: BlockFlags,
    data_len: usize,
    children_len: usize,
}

impl BlockType {
    /// Compile a static fragment. The root must be an element; the code
    /// generator guarantees this (other roots compile to simpler block kinds).
    pub fn compile(root: &StaticNode) -> Rc<BlockType> {
        debug_assert!(
            matches!(root, StaticNode::Element { .. }),
            "element blocks are rooted at an element"
        );
        let mut ty = BlockType {
            template: build_prototype(root),
            collectors: SmallVec::new(),
            locations: SmallVec::new(),
            child_slots: SmallVec::new(),
            flags: BlockFlags::empty(),
            data_len: 0,
            children_len: 0,
        };
        let mut next_ref = 1usize; // ref 0 is the root element
        assign_refs(root, 0, &mut next_ref, &mut ty);
        ty.locations.sort_by_key(|l| l.data_idx);
        ty.child_slots.sort_by_key(|s| s.child_idx);
        ty.data_len = ty.locations.iter().map(|l| l.data_idx + 1).max().unwrap_or(0);
        ty.children_len = ty.child_slots.iter().map(|s| s.child_idx + 1).max().unwrap_or(0);
        if !ty.locations.is_empty() {
            ty.flags |= BlockFlags::DYNAMIC_DATA;
        }
        if !ty.child_slots.is_empty() {
            ty.flags |= BlockFlags::CHILD_SLOTS;
        }
        if !ty.collectors.is_empty() {
            ty.flags |= BlockFlags::COLLECT;
        }
        Rc::new(ty)
    }

    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    pub fn ref_count(&self) -> usize {
        self.collectors.len() + 1
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    pub fn children_len(&self) -> usize {
        self.children_len
    }

    /// Instantiate. Convenience over `ElemBlock::new`.
    pub fn block(self: &Rc<Self>, data: Vec<Value>, children: Vec<Option<Block>>) -> Block {
        Block::Elem(ElemBlock::new(self.clone(), data, children))
    }
}

fn build_prototype(node: &StaticNode) -> DomNode {
    match node {
        StaticNode::Element {
            tag,
            attrs,
            children,
            ..
        } => {
            let el = DomNode::element(tag);
            if let Some(map) = el.attributes() {
                let mut map = map.borrow_mut();
                for (name, value) in attrs {
                    map.insert(name.clone(), value.clone());
                }
            }
            for child in children {
                // direct build, no write accounting: prototypes are detached
                el.append_child(&build_prototype(child));
            }
            el
        }
        StaticNode::Text(text) => DomNode::text(text),
        // dynamic text and child anchors start as empty text nodes
        StaticNode::DynamicText(_) | StaticNode::Child(_) => DomNode::text(""),
    }
}

/// True when the node or anything below it must be reachable at mount time.
fn subtree_needs_ref(node: &StaticNode) -> bool {
    match node {
        StaticNode::Text(_) => false,
        StaticNode::DynamicText(_) | StaticNode::Child(_) => true,
        StaticNode::Element {
            dynamics, children, ..
        } => !dynamics.is_empty() || children.iter().any(subtree_needs_ref),
    }
}

/// Depth-first reference assignment. Every referenced node is one step from
/// an earlier reference, so siblings sitting before a referenced sibling get
/// stepping-stone references of their own.
fn assign_refs(node: &StaticNode, my_ref: usize, next_ref: &mut usize, ty: &mut BlockType) {
    match node {
        StaticNode::Text(_) => {}
        StaticNode::DynamicText(data_idx) => {
            ty.locations.push(Location {
                data_idx: *data_idx,
                ref_idx: my_ref,
                setter: Setter::Text,
            });
        }
        StaticNode::Child(child_idx) => {
            ty.child_slots.push(ChildSlot {
                child_idx: *child_idx,
                anchor_ref: my_ref,
            });
        }
        StaticNode::Element {
            dynamics, children, ..
        } => {
            for (data_idx, dynamic) in dynamics {
                let setter = match dynamic {
                    ElemDyn::Attribute(name) => Setter::Attribute(name.clone()),
                    ElemDyn::Property(name) => Setter::Property(name.clone()),
                    ElemDyn::Class => Setter::Class,
                    ElemDyn::Attributes => Setter::Attributes,
                    ElemDyn::Handler(event) => Setter::Handler(event.clone()),
                    ElemDyn::Ref => Setter::Ref,
                };
                ty.locations.push(Location {
                    data_idx: *data_idx,
                    ref_idx: my_ref,
                    setter,
                });
            }
            let last_needed = children.iter().rposition(subtree_needs_ref);
            let Some(last_needed) = last_needed else {
                return;
            };
            let mut prev_ref: Option<usize> = None;
            for child in children.iter().take(last_needed + 1) {
                let child_ref = *next_ref;
                *next_ref += 1;
                ty.collectors.push(Collector {
                    step: match prev_ref {
                        None => Step::FirstChild(my_ref),
                        Some(prev) => Step::NextSibling(prev),
                    },
                });
                prev_ref = Some(child_ref);
                if subtree_needs_ref(child) {
                    assign_refs(child, child_ref, next_ref, ty);
                }
            }
        }
    }
}

/// A mounted (or about to be mounted) instance of a [`BlockType`].
pub struct ElemBlock {
    ty: Rc<BlockType>,
    el: Option<DomNode>,
    refs: Vec<DomNode>,
    data: Vec<Value>,
    children: Vec<Option<Block>>,
}

impl ElemBlock {
    pub fn new(ty: Rc<BlockType>, mut data: Vec<Value>, mut children: Vec<Option<Block>>) -> ElemBlock {
        if data.len() < ty.data_len {
            data.resize(ty.data_len, Value::None);
        }
        while children.len() < ty.children_len {
            children.push(None);
        }
        ElemBlock {
            ty,
            el: None,
            refs: Vec::new(),
            data,
            children,
        }
    }

    pub fn el(&self) -> Option<DomNode> {
        self.el.clone()
    }

    /// Whether both blocks were produced by the same compiled [`BlockType`].
    pub fn same_type(&self, other: &ElemBlock) -> bool {
        Rc::ptr_eq(&self.ty, &other.ty)
    }

    pub fn mount(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        let ty = self.ty.clone();
        let el = ty.template.clone_node(true);

        let mut refs = Vec::with_capacity(ty.ref_count());
        refs.push(el.clone());
        if ty.flags.contains(BlockFlags::COLLECT) {
            for collector in &ty.collectors {
                let node = match collector.step {
                    Step::FirstChild(from) => refs[from].first_child(),
                    Step::NextSibling(from) => refs[from].next_sibling(),
                };
                refs.push(node.expect("collector path matches the compiled template"));
            }
        }

        if ty.flags.contains(BlockFlags::DYNAMIC_DATA) {
            for loc in &ty.locations {
                apply_mount(&refs[loc.ref_idx], &loc.setter, &self.data[loc.data_idx]);
            }
        }

        if ty.flags.contains(BlockFlags::CHILD_SLOTS) {
            for slot in &ty.child_slots {
                if let Some(child) = &mut self.children[slot.child_idx] {
                    let anchor_node = &refs[slot.anchor_ref];
                    let child_parent = anchor_node
                        .parent()
                        .expect("child anchor sits inside the cloned template");
                    child.mount(&child_parent, Some(anchor_node));
                }
            }
        }

        parent.insert_before(&el, anchor);

        // refs fire once the subtree is attached
        for loc in &ty.locations {
            if matches!(loc.setter, Setter::Ref) {
                call_ref(&self.data[loc.data_idx], Value::Node(refs[loc.ref_idx].clone()));
            }
        }

        self.el = Some(el);
        self.refs = refs;
    }

    pub fn patch(&mut self, mut other: ElemBlock, with_before_remove: bool) {
        let ty = self.ty.clone();
        debug_assert!(Rc::ptr_eq(&ty, &other.ty), "patched blocks share a type");

        if ty.flags.contains(BlockFlags::DYNAMIC_DATA) {
            for loc in &ty.locations {
                let old = &self.data[loc.data_idx];
                let new = &other.data[loc.data_idx];
                if !old.same(new) {
                    apply_patch(&self.refs[loc.ref_idx], &loc.setter, old, new);
                }
            }
            self.data = other.data;
        }

        if ty.flags.contains(BlockFlags::CHILD_SLOTS) {
            for slot in &ty.child_slots {
                let incoming = other.children[slot.child_idx].take();
                match (&mut self.children[slot.child_idx], incoming) {
                    (Some(current), Some(next)) => current.patch(next, with_before_remove),
                    (current @ None, Some(mut next)) => {
                        let anchor_node = &self.refs[slot.anchor_ref];
                        let child_parent = anchor_node
                            .parent()
                            .expect("child anchor stays inside the block");
                        next.mount(&child_parent, Some(anchor_node));
                        *current = Some(next);
                    }
                    (current @ Some(_), None) => {
                        let mut removed = current.take().expect("matched Some");
                        if with_before_remove {
                            removed.before_remove();
                        }
                        removed.remove();
                    }
                    (None, None) => {}
                }
            }
        }
    }

    pub fn remove(&mut self) {
        for loc in &self.ty.locations {
            if matches!(loc.setter, Setter::Ref) {
                call_ref(&self.data[loc.data_idx], Value::None);
            }
        }
        if let Some(el) = &self.el {
            el.remove();
        }
    }

    pub fn before_remove(&mut self) {
        for child in self.children.iter_mut().flatten() {
            child.before_remove();
        }
    }

    pub fn first_node(&self) -> Option<DomNode> {
        self.el.clone()
    }

    pub fn move_before_dom_node(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        if let Some(el) = &self.el {
            parent.insert_before(el, anchor);
        }
    }
}

fn apply_mount(node: &DomNode, setter: &Setter, value: &Value) {
    match setter {
        Setter::Text => node.set_text_content(&value.to_text()),
        Setter::Attribute(name) => attributes::set_attribute(node, name, value),
        Setter::Property(name) => attributes::set_property(node, name, value),
        Setter::Class => attributes::set_class(node, value),
        Setter::Attributes => attributes::set_attrs(node, value),
        Setter::Handler(event) => attributes::set_handler(node, event, make_handler(value)),
        Setter::Ref => {} // fired after attach
    }
}

fn apply_patch(node: &DomNode, setter: &Setter, old: &Value, new: &Value) {
    match setter {
        Setter::Text => node.set_text_content(&new.to_text()),
        Setter::Attribute(name) => attributes::set_attribute(node, name, new),
        Setter::Property(name) => attributes::set_property(node, name, new),
        // class and spreads diff the old data so static tokens survive
        Setter::Class => attributes::update_class(node, old, new),
        Setter::Attributes => attributes::update_attrs(node, old, new),
        Setter::Handler(event) => attributes::set_handler(node, event, make_handler(new)),
        Setter::Ref => call_ref(new, Value::Node(node.clone())),
    }
}

fn make_handler(value: &Value) -> crate::dom::Handler {
    let value = value.clone();
    Rc::new(move |payload: Value| {
        if let Value::Fn(f) = &value
            && let Err(err) = f(&[payload])
        {
            error!(error = %err, "event handler failed");
        }
    })
}

fn call_ref(value: &Value, arg: Value) {
    if let Value::Fn(f) = value
        && let Err(err) = f(&[arg])
    {
        error!(error = %err, "ref callback failed");
    }
}
