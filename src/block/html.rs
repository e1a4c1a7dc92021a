//! Raw markup injection.
//!
//! Backs unsafe-output positions: the markup string is parsed into real
//! nodes at mount time. A trailing invisible anchor keeps the position stable
//! so a markup change can splice new content in before removing the old, and
//! so empty markup still occupies its slot.

use crate::dom::DomNode;

pub struct VHtml {
    html: String,
    content: Vec<DomNode>,
    anchor: Option<DomNode>,
}

impl VHtml {
    pub fn new(html: impl Into<String>) -> VHtml {
        VHtml {
            html: html.into(),
            content: Vec::new(),
            anchor: None,
        }
    }

    pub fn mount(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        let own_anchor = DomNode::text("");
        parent.insert_before(&own_anchor, anchor);
        self.content = crate::compiler::parser::parse_html_fragment(&self.html);
        for node in &self.content {
            parent.insert_before(node, Some(&own_anchor));
        }
        self.anchor = Some(own_anchor);
    }

    pub fn patch(&mut self, other: VHtml) {
        if self.html == other.html {
            return;
        }
        let Some(anchor) = self.anchor.clone() else {
            return;
        };
        let Some(parent) = anchor.parent() else {
            return;
        };
        let new_content = crate::compiler::parser::parse_html_fragment(&other.html);
        for node in &new_content {
            parent.insert_before(node, Some(&anchor));
        }
        for node in &self.content {
            node.remove();
        }
        self.content = new_content;
        self.html = other.html;
    }

    pub fn remove(&mut self) {
        for node in &self.content {
            node.remove();
        }
        if let Some(anchor) = &self.anchor {
            anchor.remove();
        }
    }

    pub fn first_node(&self) -> Option<DomNode> {
        self.content.first().cloned().or_else(|| self.anchor.clone())
    }

    pub fn move_before_dom_node(&mut self, parent: &DomNode, anchor: Option<&DomNode>) {
        for node in &self.content {
            parent.insert_before(node, anchor);
        }
        if let Some(own_anchor) = &self.anchor {
            parent.insert_before(own_anchor, anchor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::write_count;

    #[test]
    fn test_mount_injects_markup() {
        let parent = DomNode::element("div");
        let mut block = VHtml::new("<b>bold</b> text");
        block.mount(&parent, None);
        assert_eq!(parent.inner_html(), "<b>bold</b> text");
    }

    #[test]
    fn test_patch_replaces_content_in_place() {
        let parent = DomNode::element("div");
        parent.append_child(&DomNode::text("tail"));
        let mut block = VHtml::new("<i>a</i>");
        block.mount(&parent, Some(&parent.first_child().unwrap()));
        assert_eq!(parent.inner_html(), "<i>a</i>tail");

        block.patch(VHtml::new("<u>b</u><u>c</u>"));
        assert_eq!(parent.inner_html(), "<u>b</u><u>c</u>tail");

        let before = write_count();
        block.patch(VHtml::new("<u>b</u><u>c</u>"));
        assert_eq!(write_count(), before, "identical markup is a no-op");
    }

    #[test]
    fn test_empty_markup_keeps_slot() {
        let parent = DomNode::element("div");
        let mut block = VHtml::new("");
        block.mount(&parent, None);
        assert!(block.first_node().is_some());
        block.patch(VHtml::new("x"));
        assert_eq!(parent.inner_html(), "x");
    }
}
