//! Discriminant-keyed subtree swapping.
//!
//! A toggler wraps one child block together with a key describing which
//! template produced it. Patching with the same key delegates to the child;
//! a different key means the subtree has a different shape, so the new child
//! is mounted at the old position and the old one is torn down.

use crate::dom::DomNode;

use super::Block;

pub struct VToggler {
    key: String,
    child: Box<Block>,
}

impl VToggler {
    pub fn new(key: impl Into<String>, child: Block) -> VToggler {
        VToggler {
            key: key.into(),
            child: Box::new(child),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mount(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        self.child.mount(parent, anchor);
    }

    pub fn patch(&mut self, other: VToggler, with_before_remove: bool) {
        if self.key == other.key {
            self.child.patch(*other.child, with_before_remove);
            return;
        }
        let anchor = self.child.first_node();
        let parent = anchor.as_ref().and_then(DomNode::parent);
        let mut next = other.child;
        if let Some(parent) = &parent {
            next.mount(parent, anchor.as_ref());
        }
        if with_before_remove {
            self.child.before_remove();
        }
        self.child.remove();
        self.child = next;
        self.key = other.key;
    }

    pub fn remove(&mut self) {
        self.child.remove();
    }

    pub fn before_remove(&mut self) {
        self.child.before_remove();
    }

    pub fn first_node(&self) -> Option<DomNode> {
        self.child.first_node()
    }

    pub fn move_before_dom_node(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        self.child.move_before_dom_node(parent, anchor);
    }
}
