//! The block runtime: the tree of render output.
//!
//! A render produces a tree of [`Block`]s. Mounting a block writes real DOM;
//! patching a block against the next render's tree mutates that DOM in place,
//! skipping every slot whose data is unchanged. `Block` is a closed tagged
//! union, one variant per structural situation a template can produce, with
//! every capability dispatched by `match`:
//!
//! - `Text`/`Comment`: a single character-data node
//! - `Elem`: a compiled element block (cloned template + dynamic slots)
//! - `Multi`: fixed-arity sibling group, absent slots keep anchors
//! - `List`: keyed children, reconciled by the two-ended diff
//! - `Html`: raw markup injection
//! - `Toggler`: discriminant-keyed wrapper that swaps subtrees wholesale
//! - `Component`: leaf delegating to a component node (driven by its fiber)
//! - `Portal`: content mounted under a foreign target element

pub mod element;
pub mod html;
pub mod list;
pub mod multi;
pub mod portal;
pub mod text;
pub mod toggler;

use std::rc::Rc;

pub use element::{BlockFlags, BlockType, ElemBlock, ElemDyn, StaticNode};
pub use html::VHtml;
pub use list::{Keyed, VList};
pub use multi::VMulti;
pub use portal::VPortal;
pub use text::{VComment, VText};
pub use toggler::VToggler;

use crate::component::ComponentNode;
use crate::dom::DomNode;

pub enum Block {
    Text(VText),
    Comment(VComment),
    Elem(ElemBlock),
    Multi(VMulti),
    List(VList),
    Html(VHtml),
    Toggler(VToggler),
    Component(Rc<ComponentNode>),
    Portal(VPortal),
}

impl Block {
    /// Write this block's DOM under `parent`, before `anchor` (or at the end).
    pub fn mount(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        match self {
            Block::Text(b) => b.mount(parent, anchor),
            Block::Comment(b) => b.mount(parent, anchor),
            Block::Elem(b) => b.mount(parent, anchor),
            Block::Multi(b) => b.mount(parent, anchor),
            Block::List(b) => b.mount(parent, anchor),
            Block::Html(b) => b.mount(parent, anchor),
            Block::Toggler(b) => b.mount(parent, anchor),
            Block::Component(node) => node.mount_bdom(parent, anchor),
            Block::Portal(b) => b.mount(parent, anchor),
        }
    }

    /// Update the mounted DOM to match `other`, consuming it. `other` must
    /// come from the same template position, so kinds normally agree; a kind
    /// change falls back to a full replace at the same position.
    pub fn patch(&mut self, other: Block, with_before_remove: bool) {
        match (self, other) {
            (Block::Text(a), Block::Text(b)) => a.patch(b),
            (Block::Comment(a), Block::Comment(b)) => a.patch(b),
            // elements from different compiled templates cannot be patched
            // against each other, so a type change rebuilds the position
            (Block::Elem(a), Block::Elem(b)) if a.same_type(&b) => {
                a.patch(b, with_before_remove);
            }
            (Block::Multi(a), Block::Multi(b)) => a.patch(b, with_before_remove),
            (Block::List(a), Block::List(b)) => a.patch(b, with_before_remove),
            (Block::Html(a), Block::Html(b)) => a.patch(b),
            (Block::Toggler(a), Block::Toggler(b)) => a.patch(b, with_before_remove),
            (Block::Component(a), Block::Component(b)) => {
                if Rc::ptr_eq(a, &b) {
                    // same component instance: its own fiber applies the
                    // update when a parent rendering reaches it
                    a.patch_from_above();
                } else {
                    let mut this = Block::Component(a.clone());
                    this.replace_with(Block::Component(b), with_before_remove);
                    *a = match this {
                        Block::Component(n) => n,
                        _ => unreachable!(),
                    };
                }
            }
            (Block::Portal(a), Block::Portal(b)) => a.patch(b, with_before_remove),
            (this, other) => this.replace_with(other, with_before_remove),
        }
    }

    /// Unmount and replace in place. Used when a position changes kind.
    fn replace_with(&mut self, mut other: Block, with_before_remove: bool) {
        let anchor = self.first_node();
        let parent = anchor.as_ref().and_then(DomNode::parent);
        if let Some(parent) = &parent {
            other.mount(parent, anchor.as_ref());
        }
        if with_before_remove {
            self.before_remove();
        }
        self.remove();
        *self = other;
    }

    /// Detach this block's DOM.
    pub fn remove(&mut self) {
        match self {
            Block::Text(b) => b.remove(),
            Block::Comment(b) => b.remove(),
            Block::Elem(b) => b.remove(),
            Block::Multi(b) => b.remove(),
            Block::List(b) => b.remove(),
            Block::Html(b) => b.remove(),
            Block::Toggler(b) => b.remove(),
            Block::Component(node) => node.remove_bdom(),
            Block::Portal(b) => b.remove(),
        }
    }

    /// Pre-removal walk: gives embedded components the chance to run their
    /// teardown hooks while their DOM is still attached.
    pub fn before_remove(&mut self) {
        match self {
            Block::Text(_) | Block::Comment(_) | Block::Html(_) => {}
            Block::Elem(b) => b.before_remove(),
            Block::Multi(b) => b.before_remove(),
            Block::List(b) => b.before_remove(),
            Block::Toggler(b) => b.before_remove(),
            Block::Component(node) => node.before_remove_bdom(),
            Block::Portal(b) => b.before_remove(),
        }
    }

    /// The first DOM node of this block's content, once mounted. Insertions
    /// relative to a block target this node.
    pub fn first_node(&self) -> Option<DomNode> {
        match self {
            Block::Text(b) => b.first_node(),
            Block::Comment(b) => b.first_node(),
            Block::Elem(b) => b.first_node(),
            Block::Multi(b) => b.first_node(),
            Block::List(b) => b.first_node(),
            Block::Html(b) => b.first_node(),
            Block::Toggler(b) => b.first_node(),
            Block::Component(node) => node.first_node(),
            Block::Portal(b) => b.first_node(),
        }
    }

    /// Move the mounted content before `anchor` under `parent`.
    pub fn move_before_dom_node(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        match self {
            Block::Text(b) => b.move_before_dom_node(parent, anchor),
            Block::Comment(b) => b.move_before_dom_node(parent, anchor),
            Block::Elem(b) => b.move_before_dom_node(parent, anchor),
            Block::Multi(b) => b.move_before_dom_node(parent, anchor),
            Block::List(b) => b.move_before_dom_node(parent, anchor),
            Block::Html(b) => b.move_before_dom_node(parent, anchor),
            Block::Toggler(b) => b.move_before_dom_node(parent, anchor),
            Block::Component(node) => node.move_bdom_before(parent, anchor),
            Block::Portal(b) => b.move_before_dom_node(parent, anchor),
        }
    }

    /// Move before another block's first node, falling back to `anchor`.
    pub fn move_before_vnode(&mut self, next: Option<&Block>, anchor: Option<&DomNode>) {
        let target = next.and_then(Block::first_node).or_else(|| anchor.cloned());
        let parent = target
            .as_ref()
            .and_then(DomNode::parent)
            .or_else(|| self.first_node().and_then(|n| n.parent()));
        if let Some(parent) = parent {
            self.move_before_dom_node(&parent, target.as_ref());
        }
    }
}
