//! Fixed-arity sibling groups.
//!
//! A multi block holds a known number of slots, one per structural sibling of
//! a template fragment with several roots (or a root with conditional
//! siblings). A slot can be empty; an empty slot keeps an invisible anchor
//! text node in the DOM so that a later patch can bring the sibling back at
//! exactly the right position.

use crate::dom::DomNode;

use super::Block;

pub struct VMulti {
    children: Vec<Option<Block>>,
    anchors: Vec<Option<DomNode>>,
    parent_el: Option<DomNode>,
}

impl VMulti {
    pub fn new(children: Vec<Option<Block>>) -> VMulti {
        let len = children.len();
        VMulti {
            children,
            anchors: (0..len).map(|_| None).collect(),
            parent_el: None,
        }
    }

    pub fn mount(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        for (child, slot_anchor) in self.children.iter_mut().zip(&mut self.anchors) {
            match child {
                Some(block) => block.mount(parent, anchor),
                None => {
                    let placeholder = DomNode::text("");
                    parent.insert_before(&placeholder, anchor);
                    *slot_anchor = Some(placeholder);
                }
            }
        }
        self.parent_el = Some(parent.clone());
    }

    pub fn patch(&mut self, other: VMulti, with_before_remove: bool) {
        debug_assert_eq!(
            self.children.len(),
            other.children.len(),
            "multi blocks from one template position have a fixed arity"
        );
        let parent = match &self.parent_el {
            Some(p) => p.clone(),
            None => return,
        };
        for (i, incoming) in other.children.into_iter().enumerate() {
            match (&mut self.children[i], incoming) {
                (Some(current), Some(next)) => current.patch(next, with_before_remove),
                (current @ None, Some(mut next)) => {
                    let placeholder = self.anchors[i].take();
                    next.mount(&parent, placeholder.as_ref());
                    if let Some(placeholder) = placeholder {
                        placeholder.remove();
                    }
                    *current = Some(next);
                }
                (current @ Some(_), None) => {
                    let mut removed = current.take().expect("matched Some");
                    // reinstate the anchor where the sibling stood
                    let placeholder = DomNode::text("");
                    if let Some(first) = removed.first_node() {
                        parent.insert_before(&placeholder, Some(&first));
                    } else {
                        parent.append_child(&placeholder);
                    }
                    self.anchors[i] = Some(placeholder);
                    if with_before_remove {
                        removed.before_remove();
                    }
                    removed.remove();
                }
                (None, None) => {}
            }
        }
    }

    pub fn remove(&mut self) {
        for (child, anchor) in self.children.iter_mut().zip(&mut self.anchors) {
            match child {
                Some(block) => block.remove(),
                None => {
                    if let Some(anchor) = anchor.take() {
                        anchor.remove();
                    }
                }
            }
        }
    }

    pub fn before_remove(&mut self) {
        for child in self.children.iter_mut().flatten() {
            child.before_remove();
        }
    }

    pub fn first_node(&self) -> Option<DomNode> {
        for (child, anchor) in self.children.iter().zip(&self.anchors) {
            match child {
                Some(block) => {
                    if let Some(node) = block.first_node() {
                        return Some(node);
                    }
                }
                None => {
                    if let Some(anchor) = anchor {
                        return Some(anchor.clone());
                    }
                }
            }
        }
        None
    }

    pub fn move_before_dom_node(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        for (child, slot_anchor) in self.children.iter_mut().zip(&self.anchors) {
            match child {
                Some(block) => block.move_before_dom_node(parent, anchor),
                None => {
                    if let Some(placeholder) = slot_anchor {
                        parent.insert_before(placeholder, anchor);
                    }
                }
            }
        }
        self.parent_el = Some(parent.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::text::VText;

    fn txt(s: &str) -> Option<Block> {
        Some(Block::Text(VText::new(s)))
    }

    #[test]
    fn test_absent_slot_keeps_position() {
        let parent = DomNode::element("div");
        let mut multi = VMulti::new(vec![txt("a"), None, txt("c")]);
        multi.mount(&parent, None);
        assert_eq!(parent.text_content(), "ac");

        // filling the middle slot lands between its siblings
        multi.patch(VMulti::new(vec![txt("a"), txt("b"), txt("c")]), false);
        assert_eq!(parent.text_content(), "abc");

        // emptying it again keeps an anchor for the next round trip
        multi.patch(VMulti::new(vec![txt("a"), None, txt("c")]), false);
        assert_eq!(parent.text_content(), "ac");
        multi.patch(VMulti::new(vec![txt("a"), txt("B"), txt("c")]), false);
        assert_eq!(parent.text_content(), "aBc");
    }

    #[test]
    fn test_remove_clears_anchors_too() {
        let parent = DomNode::element("div");
        let mut multi = VMulti::new(vec![None, txt("x")]);
        multi.mount(&parent, None);
        multi.remove();
        assert!(parent.first_child().is_none());
    }
}
