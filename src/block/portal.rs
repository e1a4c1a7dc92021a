//! Out-of-tree content placement.
//!
//! A portal's child renders and patches as part of its owner's tree but its
//! DOM lives under a foreign target element. The portal holds an invisible
//! anchor at its structural position so removal and reordering of the owner
//! keep working.

use super::Block;
use crate::dom::DomNode;

pub struct VPortal {
    target: DomNode,
    child: Box<Block>,
    anchor: Option<DomNode>,
}

impl VPortal {
    pub fn new(target: DomNode, child: Block) -> VPortal {
        VPortal {
            target,
            child: Box::new(child),
            anchor: None,
        }
    }

    pub fn mount(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        let own_anchor = DomNode::text("");
        parent.insert_before(&own_anchor, anchor);
        self.anchor = Some(own_anchor);
        let target = self.target.clone();
        self.child.mount(&target, None);
    }

    pub fn patch(&mut self, other: VPortal, with_before_remove: bool) {
        if self.target.same_node(&other.target) {
            self.child.patch(*other.child, with_before_remove);
        } else {
            // retargeted: tear down at the old target, mount at the new one
            if with_before_remove {
                self.child.before_remove();
            }
            self.child.remove();
            self.target = other.target;
            self.child = other.child;
            let target = self.target.clone();
            self.child.mount(&target, None);
        }
    }

    pub fn remove(&mut self) {
        self.child.remove();
        if let Some(anchor) = &self.anchor {
            anchor.remove();
        }
    }

    pub fn before_remove(&mut self) {
        self.child.before_remove();
    }

    pub fn first_node(&self) -> Option<DomNode> {
        self.anchor.clone()
    }

    pub fn move_before_dom_node(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        if let Some(own_anchor) = &self.anchor {
            parent.insert_before(own_anchor, anchor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::text::VText;

    #[test]
    fn test_content_lands_in_target() {
        let host = DomNode::element("div");
        let overlay = DomNode::element("aside");

        let mut portal = VPortal::new(overlay.clone(), Block::Text(VText::new("popup")));
        portal.mount(&host, None);

        assert_eq!(overlay.text_content(), "popup");
        assert_eq!(host.text_content(), "", "host keeps only the anchor");

        portal.patch(
            VPortal::new(overlay.clone(), Block::Text(VText::new("changed"))),
            false,
        );
        assert_eq!(overlay.text_content(), "changed");

        portal.remove();
        assert_eq!(overlay.text_content(), "");
        assert!(host.first_child().is_none());
    }
}
