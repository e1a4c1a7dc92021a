//! Single character-data blocks.

use crate::dom::DomNode;

/// A lone text node.
pub struct VText {
    text: String,
    el: Option<DomNode>,
}

impl VText {
    pub fn new(text: impl Into<String>) -> VText {
        VText {
            text: text.into(),
            el: None,
        }
    }

    pub fn mount(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        let el = DomNode::text(&self.text);
        parent.insert_before(&el, anchor);
        self.el = Some(el);
    }

    pub fn patch(&mut self, other: VText) {
        if self.text != other.text {
            if let Some(el) = &self.el {
                el.set_text_content(&other.text);
            }
            self.text = other.text;
        }
    }

    pub fn remove(&mut self) {
        if let Some(el) = &self.el {
            el.remove();
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

/// A lone comment node. Togglers and empty templates use these as visible
/// placeholders.
pub struct VComment {
    text: String,
    el: Option<DomNode>,
}

impl VComment {
    pub fn new(text: impl Into<String>) -> VComment {
        VComment {
            text: text.into(),
            el: None,
        }
    }

    pub fn mount(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        let el = DomNode::comment(&self.text);
        parent.insert_before(&el, anchor);
        self.el = Some(el);
    }

    pub fn patch(&mut self, _other: VComment) {
        // comments are static
    }

    pub fn remove(&mut self) {
        if let Some(el) = &self.el {
            el.remove();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::write_count;

    #[test]
    fn test_text_mount_and_patch() {
        let parent = DomNode::element("div");
        let mut block = VText::new("hello");
        block.mount(&parent, None);
        assert_eq!(parent.outer_html(), "<div>hello</div>");

        block.patch(VText::new("bye"));
        assert_eq!(parent.outer_html(), "<div>bye</div>");

        let before = write_count();
        block.patch(VText::new("bye"));
        assert_eq!(write_count(), before, "same text writes nothing");

        block.remove();
        assert_eq!(parent.outer_html(), "<div></div>");
    }
}
