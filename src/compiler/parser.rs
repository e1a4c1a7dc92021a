//! Template markup parser.
//!
//! Templates are XML-ish: a small hand-rolled scanner turns the source into a
//! tree of elements, text and comments, then a validation pass rejects the
//! directive combinations that can never compile. Everything directive-aware
//! beyond validation lives in the code generator; the parser only guarantees
//! the tree is well formed.
//!
//! Directives are attributes with the `x-` prefix: `x-if`/`x-elif`/`x-else`,
//! `x-foreach`+`x-as`+`x-key`, `x-esc`, `x-out`, `x-on-<event>`,
//! `x-att-<name>`, `x-attrs`, `x-ref`, `x-set`+`x-value`, `x-call`,
//! `x-slot`, `x-set-slot`, `x-component`, `x-portal`. `<t>` is the structural
//! element that renders no markup of its own. Tags starting with an uppercase
//! letter are component placements. `{{ expr }}` in text is shorthand for an
//! escaped output node.

use crate::dom::DomNode;
use crate::error::{CinderError, Result};

#[derive(Debug, Clone)]
pub enum TplNode {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        children: Vec<TplNode>,
    },
    Text(String),
    Comment(String),
}

impl TplNode {
    pub fn attr<'a>(&'a self, name: &str) -> Option<&'a str> {
        match self {
            TplNode::Element { attrs, .. } => attrs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }
}

/// A run of template text, split on `{{ }}` interpolations.
#[derive(Debug, PartialEq)]
pub enum TextPart {
    Static(String),
    Expr(String),
}

/// Parse a template source into its root nodes.
pub fn parse_template(name: &str, source: &str) -> Result<Vec<TplNode>> {
    let mut scanner = Scanner {
        template: name,
        chars: source.chars().collect(),
        pos: 0,
    };
    let nodes = scanner.parse_nodes(None)?;
    if scanner.pos < scanner.chars.len() {
        return Err(scanner.err("unexpected closing tag with no open element"));
    }
    for node in &nodes {
        validate(name, node)?;
    }
    Ok(nodes)
}

/// Best-effort markup parsing for raw-output positions. Unparseable input
/// degrades to a single text node rather than failing the render.
pub fn parse_html_fragment(html: &str) -> Vec<DomNode> {
    let mut scanner = Scanner {
        template: "<raw html>",
        chars: html.chars().collect(),
        pos: 0,
    };
    match scanner.parse_nodes(None) {
        Ok(nodes) if scanner.pos >= scanner.chars.len() => {
            nodes.iter().map(to_dom).collect()
        }
        _ => vec![DomNode::text(html)],
    }
}

fn to_dom(node: &TplNode) -> DomNode {
    match node {
        TplNode::Text(text) => DomNode::text(text),
        TplNode::Comment(text) => DomNode::comment(text),
        TplNode::Element {
            tag,
            attrs,
            children,
        } => {
            let el = DomNode::element(tag);
            if let Some(map) = el.attributes() {
                let mut map = map.borrow_mut();
                for (name, value) in attrs {
                    map.insert(std::rc::Rc::from(name.as_str()), value.clone());
                }
            }
            for child in children {
                el.append_child(&to_dom(child));
            }
            el
        }
    }
}

/// Split text on `{{ expr }}` markers.
pub fn split_interpolation(text: &str) -> Vec<TextPart> {
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            parts.push(TextPart::Static(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                parts.push(TextPart::Expr(after[..end].trim().to_string()));
                rest = &after[end + 2..];
            }
            None => {
                // unterminated marker renders literally
                parts.push(TextPart::Static(rest[start..].to_string()));
                return parts;
            }
        }
    }
    if !rest.is_empty() {
        parts.push(TextPart::Static(rest.to_string()));
    }
    parts
}

// =============================================================================
// Scanner
// =============================================================================

struct Scanner<'a> {
    template: &'a str,
    chars: Vec<char>,
    pos: usize,
}

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

impl Scanner<'_> {
    fn err(&self, message: impl Into<String>) -> CinderError {
        CinderError::template(self.template, message)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.chars.get(self.pos + i) == Some(&c))
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    /// Parse sibling nodes until EOF or the named closing tag.
    fn parse_nodes(&mut self, until_close: Option<&str>) -> Result<Vec<TplNode>> {
        let mut nodes = Vec::new();
        loop {
            if self.pos >= self.chars.len() {
                if let Some(tag) = until_close {
                    return Err(self.err(format!("unclosed tag <{tag}>")));
                }
                return Ok(nodes);
            }
            if self.starts_with("</") {
                let close = self.read_closing_tag()?;
                match until_close {
                    Some(tag) if tag == close => return Ok(nodes),
                    Some(tag) => {
                        return Err(self.err(format!(
                            "mismatched closing tag </{close}>, expected </{tag}>"
                        )));
                    }
                    None => {
                        // leave for the caller; top level reports it
                        self.pos -= close.len() + 3;
                        return Ok(nodes);
                    }
                }
            }
            if self.starts_with("<!--") {
                nodes.push(self.read_comment()?);
            } else if self.peek() == Some('<') {
                nodes.push(self.read_element()?);
            } else {
                let text = self.read_text();
                if !text.is_empty() {
                    nodes.push(TplNode::Text(text));
                }
            }
        }
    }

    fn read_text(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c == '<' {
                break;
            }
            if c == '&' {
                text.push(self.read_entity());
            } else {
                text.push(c);
                self.pos += 1;
            }
        }
        text
    }

    fn read_entity(&mut self) -> char {
        for (entity, ch) in [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&#39;", '\''),
            ("&#x27;", '\''),
        ] {
            if self.starts_with(entity) {
                self.pos += entity.len();
                return ch;
            }
        }
        self.pos += 1;
        '&'
    }

    fn read_comment(&mut self) -> Result<TplNode> {
        self.pos += 4; // <!--
        let start = self.pos;
        while !self.starts_with("-->") {
            if self.pos >= self.chars.len() {
                return Err(self.err("unterminated comment"));
            }
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        self.pos += 3;
        Ok(TplNode::Comment(text))
    }

    fn read_closing_tag(&mut self) -> Result<String> {
        self.pos += 2; // </
        let tag = self.read_name();
        if tag.is_empty() {
            return Err(self.err("empty closing tag"));
        }
        self.skip_whitespace();
        if self.peek() != Some('>') {
            return Err(self.err(format!("malformed closing tag </{tag}")));
        }
        self.pos += 1;
        Ok(tag)
    }

    fn read_name(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == ':')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn read_element(&mut self) -> Result<TplNode> {
        self.pos += 1; // <
        let tag = self.read_name();
        if tag.is_empty() {
            return Err(self.err("bare `<` in markup"));
        }
        let mut attrs = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.err(format!("unclosed tag <{tag}>"))),
                Some('>') => {
                    self.pos += 1;
                    break;
                }
                Some('/') => {
                    if self.starts_with("/>") {
                        self.pos += 2;
                        return Ok(TplNode::Element {
                            tag,
                            attrs,
                            children: Vec::new(),
                        });
                    }
                    return Err(self.err(format!("stray `/` in <{tag}>")));
                }
                Some(_) => {
                    let name = self.read_name();
                    if name.is_empty() {
                        return Err(self.err(format!("malformed attribute in <{tag}>")));
                    }
                    self.skip_whitespace();
                    let value = if self.peek() == Some('=') {
                        self.pos += 1;
                        self.skip_whitespace();
                        self.read_attr_value()?
                    } else {
                        String::new()
                    };
                    attrs.push((name, value));
                }
            }
        }
        if VOID_TAGS.contains(&tag.as_str()) {
            return Ok(TplNode::Element {
                tag,
                attrs,
                children: Vec::new(),
            });
        }
        let children = self.parse_nodes(Some(&tag))?;
        Ok(TplNode::Element {
            tag,
            attrs,
            children,
        })
    }

    fn read_attr_value(&mut self) -> Result<String> {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.err("attribute value must be quoted")),
        };
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated attribute value")),
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(value);
                }
                Some('&') => value.push(self.read_entity()),
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
    }
}

// =============================================================================
// Directive validation
// =============================================================================

const SIMPLE_DIRECTIVES: &[&str] = &[
    "x-if",
    "x-elif",
    "x-else",
    "x-foreach",
    "x-as",
    "x-key",
    "x-esc",
    "x-out",
    "x-ref",
    "x-set",
    "x-value",
    "x-call",
    "x-slot",
    "x-set-slot",
    "x-component",
    "x-portal",
    "x-attrs",
];

fn validate(template: &str, node: &TplNode) -> Result<()> {
    let TplNode::Element {
        tag,
        attrs,
        children,
    } = node
    else {
        return Ok(());
    };
    for (name, _) in attrs {
        if name.starts_with("x-")
            && !SIMPLE_DIRECTIVES.contains(&name.as_str())
            && !name.starts_with("x-on-")
            && !name.starts_with("x-att-")
        {
            return Err(CinderError::template(
                template,
                format!("unknown directive `{name}` on <{tag}>"),
            ));
        }
    }
    if node.has_attr("x-esc") && node.has_attr("x-out") {
        return Err(CinderError::template(
            template,
            format!("<{tag}> combines x-esc and x-out"),
        ));
    }
    if node.has_attr("x-foreach") && !node.has_attr("x-as") {
        return Err(CinderError::template(
            template,
            format!("x-foreach on <{tag}> requires x-as"),
        ));
    }
    if node.has_attr("x-if") && (node.has_attr("x-elif") || node.has_attr("x-else")) {
        return Err(CinderError::template(
            template,
            format!("<{tag}> combines x-if with x-elif/x-else"),
        ));
    }
    if node.has_attr("x-set") && node.has_attr("x-esc") {
        return Err(CinderError::template(
            template,
            format!("<{tag}> combines x-set with x-esc"),
        ));
    }

    // x-elif / x-else must directly follow a conditional sibling
    let mut prev_conditional = false;
    for child in children {
        if let TplNode::Text(text) = child {
            if text.trim().is_empty() {
                continue; // whitespace between branches is fine
            }
            prev_conditional = false;
            continue;
        }
        if let TplNode::Element { tag: child_tag, .. } = child {
            let is_follower = child.has_attr("x-elif") || child.has_attr("x-else");
            if is_follower && !prev_conditional {
                return Err(CinderError::template(
                    template,
                    format!("<{child_tag}> has x-elif/x-else with no preceding x-if"),
                ));
            }
            prev_conditional = child.has_attr("x-if") || child.has_attr("x-elif");
        }
    }
    for child in children {
        validate(template, child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_tree() {
        let nodes =
            parse_template("t", "<div class=\"box\"><p>hi</p><br/>tail</div>").unwrap();
        assert_eq!(nodes.len(), 1);
        let TplNode::Element { tag, attrs, children } = &nodes[0] else {
            panic!("expected element");
        };
        assert_eq!(tag, "div");
        assert_eq!(attrs[0], ("class".to_string(), "box".to_string()));
        assert_eq!(children.len(), 3);
        assert!(matches!(&children[2], TplNode::Text(t) if t == "tail"));
    }

    #[test]
    fn test_entities_decode() {
        let nodes = parse_template("t", "<p title=\"a &amp; b\">1 &lt; 2</p>").unwrap();
        assert_eq!(nodes[0].attr("title"), Some("a & b"));
        let TplNode::Element { children, .. } = &nodes[0] else {
            panic!();
        };
        assert!(matches!(&children[0], TplNode::Text(t) if t == "1 < 2"));
    }

    #[test]
    fn test_malformed_markup_errors() {
        assert!(parse_template("t", "<div>").is_err());
        assert!(parse_template("t", "<div></span>").is_err());
        assert!(parse_template("t", "</div>").is_err());
        assert!(parse_template("t", "<div attr=oops></div>").is_err());
        assert!(parse_template("t", "<!-- no end").is_err());
    }

    #[test]
    fn test_conflicting_directives() {
        assert!(parse_template("t", "<t x-esc=\"a\" x-out=\"b\"/>").is_err());
        assert!(parse_template("t", "<t x-foreach=\"items\" x-key=\"k\"/>").is_err());
        assert!(parse_template("t", "<div x-unknown=\"x\"/>").is_err());
        assert!(parse_template("t", "<div><p x-else=\"\"/></div>").is_err());
        // valid chain passes
        parse_template(
            "t",
            "<div><p x-if=\"a\">1</p><p x-elif=\"b\">2</p><p x-else=\"\">3</p></div>",
        )
        .unwrap();
    }

    #[test]
    fn test_split_interpolation() {
        let parts = split_interpolation("count: {{ state.count }}!");
        assert_eq!(
            parts,
            vec![
                TextPart::Static("count: ".to_string()),
                TextPart::Expr("state.count".to_string()),
                TextPart::Static("!".to_string()),
            ]
        );
        assert_eq!(
            split_interpolation("plain"),
            vec![TextPart::Static("plain".to_string())]
        );
    }

    #[test]
    fn test_parse_html_fragment_lenient() {
        let nodes = parse_html_fragment("<b>x</b> y");
        assert_eq!(nodes.len(), 2);
        // broken markup degrades to text
        let nodes = parse_html_fragment("<b>x");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].text_content(), "<b>x");
    }
}
