//! Template code generation.
//!
//! Turns a parsed template into a [`RenderProgram`]: an op tree executed once
//! per render against a scope and an owning component node, producing the
//! block tree the runtime mounts or patches. Compilation happens once per
//! template per app; renders only walk the ops.
//!
//! Folding policy: adjacent static markup collapses into a single compiled
//! [`BlockType`] with data slots at the dynamic positions. A new block starts
//! only where forced: control flow (`x-if`, `x-foreach`), a component
//! boundary, raw output, a portal or a sub-template call. Every such
//! structural position gets a compile-time key (`k<id>`); inside loops the
//! iteration key is appended so that block identity survives reordering.

use std::fmt;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::block::{
    Block, BlockType, ElemDyn, Keyed, StaticNode, VComment, VHtml, VList, VMulti, VPortal, VText,
    VToggler,
};
use crate::component::{ComponentNode, SlotRender};
use crate::dom::attributes::is_prop;
use crate::error::{CinderError, Result};
use crate::value::{Scope, Value};

use super::expr::{self, Expr};
use super::parser::{TextPart, TplNode, split_interpolation};

// =============================================================================
// Programs and ops
// =============================================================================

/// Everything a render needs to execute a program.
pub struct RenderCtx {
    pub scope: Rc<Scope>,
    pub node: Rc<ComponentNode>,
    /// Loop-iteration key suffix accumulated from enclosing `x-foreach`.
    pub key_suffix: String,
    pub dev: bool,
}

impl RenderCtx {
    fn with_scope(&self, scope: Rc<Scope>) -> RenderCtx {
        RenderCtx {
            scope,
            node: self.node.clone(),
            key_suffix: self.key_suffix.clone(),
            dev: self.dev,
        }
    }
}

/// A compiled template: one root op (several roots compile to `Multi`).
pub struct RenderProgram {
    pub template: Rc<str>,
    root: NodeOp,
}

impl RenderProgram {
    /// Run the program. `None` out of the root renders an empty text block so
    /// a template always yields something mountable.
    pub fn execute(&self, ctx: &RenderCtx) -> Result<Block> {
        match self.root.render(ctx)? {
            Some(block) => Ok(block),
            None => Ok(Block::Text(VText::new(""))),
        }
    }
}

enum DataOp {
    /// Plain expression, evaluated every render.
    Eval(Expr),
    /// Deferred closure: evaluated against a frozen capture of its free
    /// variables, so later renders cannot leak into an already-built handler.
    Handler {
        expr: Rc<Expr>,
        free: Rc<[Rc<str>]>,
    },
    /// Ref directive: stores the node (or `None`) under a name on the
    /// component.
    RefSlot(Rc<str>),
}

enum NodeOp {
    Elem {
        ty: Rc<BlockType>,
        data: Vec<DataOp>,
        children: Vec<NodeOp>,
    },
    StaticText(String),
    Comment(String),
    TextExpr(Expr),
    /// `x-out`: togglered on content kind so safe/unsafe swaps rebuild.
    RawExpr {
        key_id: u32,
        expr: Expr,
    },
    Multi(Vec<NodeOp>),
    If {
        key_id: u32,
        branches: Vec<(Option<Expr>, NodeOp)>,
    },
    ForEach {
        key_id: u32,
        items: Expr,
        var: Rc<str>,
        key: Option<Expr>,
        body: Box<NodeOp>,
        is_only_child: bool,
    },
    SetVar {
        name: Rc<str>,
        value: Expr,
    },
    CallTemplate {
        key_id: u32,
        name: Rc<str>,
    },
    Slot {
        name: Rc<str>,
        default: Option<Box<NodeOp>>,
    },
    Component {
        key_id: u32,
        target: ComponentTarget,
        props: Vec<(Rc<str>, Expr)>,
        slots: Vec<(Rc<str>, Rc<NodeOp>)>,
        default_slot: Option<Rc<NodeOp>>,
    },
    Portal {
        target: Expr,
        body: Box<NodeOp>,
    },
}

enum ComponentTarget {
    Named(Rc<str>),
    Dynamic(Expr),
}

// =============================================================================
// Compilation
// =============================================================================

struct Compiler<'a> {
    template: &'a str,
    next_key: u32,
    warned_keyless: bool,
}

/// Compile parsed template nodes into a program.
pub fn compile_template(name: &str, roots: &[TplNode]) -> Result<Rc<RenderProgram>> {
    let mut compiler = Compiler {
        template: name,
        next_key: 0,
        warned_keyless: false,
    };
    let mut ops = compiler.compile_children(roots)?;
    let root = match ops.len() {
        0 => NodeOp::StaticText(String::new()),
        1 => ops.remove(0),
        _ => NodeOp::Multi(ops),
    };
    let program = Rc::new(RenderProgram {
        template: Rc::from(name),
        root,
    });
    debug!(template = name, program = %program, "compiled template");
    Ok(program)
}

impl Compiler<'_> {
    fn err(&self, message: impl Into<String>) -> CinderError {
        CinderError::template(self.template, message)
    }

    fn fresh_key(&mut self) -> u32 {
        self.next_key += 1;
        self.next_key
    }

    fn compile_expr(&self, source: &str) -> Result<Expr> {
        expr::compile(source)
    }

    /// Compile a sibling run, grouping `x-if`/`x-elif`/`x-else` chains.
    fn compile_children(&mut self, nodes: &[TplNode]) -> Result<Vec<NodeOp>> {
        let mut ops = Vec::new();
        let mut i = 0;
        while i < nodes.len() {
            let node = &nodes[i];
            match node {
                TplNode::Text(text) => {
                    for part in split_interpolation(text) {
                        match part {
                            TextPart::Static(s) => {
                                if !s.trim().is_empty() {
                                    ops.push(NodeOp::StaticText(s));
                                }
                            }
                            TextPart::Expr(source) => {
                                ops.push(NodeOp::TextExpr(self.compile_expr(&source)?));
                            }
                        }
                    }
                    i += 1;
                }
                TplNode::Comment(text) => {
                    ops.push(NodeOp::Comment(text.clone()));
                    i += 1;
                }
                TplNode::Element { .. } if node.has_attr("x-if") => {
                    ops.push(self.compile_if_chain(nodes, &mut i)?);
                }
                TplNode::Element { .. } => {
                    ops.push(self.compile_structural(node, false)?);
                    i += 1;
                }
            }
        }
        Ok(ops)
    }

    /// Compile an `x-if` chain starting at `nodes[*i]`, advancing `i` past
    /// the consumed branches. Blank text between branches is skipped.
    fn compile_if_chain(&mut self, nodes: &[TplNode], i: &mut usize) -> Result<NodeOp> {
        let node = &nodes[*i];
        let key_id = self.fresh_key();
        let mut branches = Vec::new();
        let cond = self.compile_expr(node.attr("x-if").expect("guarded"))?;
        branches.push((Some(cond), self.compile_structural(node, false)?));
        *i += 1;
        while *i < nodes.len() {
            match &nodes[*i] {
                TplNode::Text(t) if t.trim().is_empty() => *i += 1,
                branch if branch.has_attr("x-elif") => {
                    let cond = self.compile_expr(branch.attr("x-elif").expect("guarded"))?;
                    branches.push((Some(cond), self.compile_structural(branch, false)?));
                    *i += 1;
                }
                branch if branch.has_attr("x-else") => {
                    branches.push((None, self.compile_structural(branch, false)?));
                    *i += 1;
                    break;
                }
                _ => break,
            }
        }
        Ok(NodeOp::If { key_id, branches })
    }

    /// Compile one element, handling its own structural directives
    /// (`x-foreach` wraps whatever the element otherwise compiles to).
    fn compile_structural(&mut self, node: &TplNode, only_child: bool) -> Result<NodeOp> {
        if let Some(items_src) = node.attr("x-foreach") {
            let items = self.compile_expr(items_src)?;
            let var: Rc<str> = Rc::from(node.attr("x-as").expect("validated"));
            let key = match node.attr("x-key") {
                Some(source) => Some(self.compile_expr(source)?),
                None => {
                    if !self.warned_keyless {
                        warn!(
                            template = self.template,
                            "keyless x-foreach falls back to the iteration index"
                        );
                        self.warned_keyless = true;
                    }
                    None
                }
            };
            let key_id = self.fresh_key();
            let body = self.compile_element_body(node)?;
            return Ok(NodeOp::ForEach {
                key_id,
                items,
                var,
                key,
                body: Box::new(body),
                is_only_child: only_child,
            });
        }
        self.compile_element_body(node)
    }

    /// The element itself, after structural directives were peeled off.
    fn compile_element_body(&mut self, node: &TplNode) -> Result<NodeOp> {
        let TplNode::Element {
            tag,
            attrs,
            children,
        } = node
        else {
            unreachable!("callers pass elements");
        };

        // component placement: capitalized tag or x-component
        if node.has_attr("x-component") {
            let target =
                ComponentTarget::Dynamic(self.compile_expr(node.attr("x-component").expect("guarded"))?);
            return self.compile_component(target, attrs, children);
        }
        if tag.chars().next().is_some_and(char::is_uppercase) {
            let target = ComponentTarget::Named(Rc::from(tag.as_str()));
            return self.compile_component(target, attrs, children);
        }

        if tag == "t" {
            return self.compile_t_element(node, attrs, children);
        }

        // a real element: fold into a block type
        let mut fold = Fold {
            data: Vec::new(),
            children: Vec::new(),
        };
        let static_root = self.fold_element(tag, attrs, children, &mut fold)?;
        let ty = BlockType::compile(&static_root);
        Ok(NodeOp::Elem {
            ty,
            data: fold.data,
            children: fold.children,
        })
    }

    /// Structural `<t>`: renders no markup of its own.
    fn compile_t_element(
        &mut self,
        node: &TplNode,
        _attrs: &[(String, String)],
        children: &[TplNode],
    ) -> Result<NodeOp> {
        if let Some(source) = node.attr("x-esc") {
            return Ok(NodeOp::TextExpr(self.compile_expr(source)?));
        }
        if let Some(source) = node.attr("x-out") {
            let key_id = self.fresh_key();
            return Ok(NodeOp::RawExpr {
                key_id,
                expr: self.compile_expr(source)?,
            });
        }
        if let Some(name) = node.attr("x-set") {
            let value_src = node
                .attr("x-value")
                .ok_or_else(|| self.err(format!("x-set `{name}` needs x-value")))?;
            return Ok(NodeOp::SetVar {
                name: Rc::from(name),
                value: self.compile_expr(value_src)?,
            });
        }
        if let Some(name) = node.attr("x-call") {
            return Ok(NodeOp::CallTemplate {
                key_id: self.fresh_key(),
                name: Rc::from(name),
            });
        }
        if let Some(name) = node.attr("x-slot") {
            let default = if children.is_empty() {
                None
            } else {
                let mut ops = self.compile_children(children)?;
                Some(Box::new(match ops.len() {
                    1 => ops.remove(0),
                    _ => NodeOp::Multi(ops),
                }))
            };
            return Ok(NodeOp::Slot {
                name: Rc::from(name),
                default,
            });
        }
        if let Some(target_src) = node.attr("x-portal") {
            let target = self.compile_expr(target_src)?;
            let mut ops = self.compile_children(children)?;
            let body = match ops.len() {
                1 => ops.remove(0),
                _ => NodeOp::Multi(ops),
            };
            return Ok(NodeOp::Portal {
                target,
                body: Box::new(body),
            });
        }
        // plain grouping <t>
        let mut ops = self.compile_children(children)?;
        Ok(match ops.len() {
            0 => NodeOp::StaticText(String::new()),
            1 => ops.remove(0),
            _ => NodeOp::Multi(ops),
        })
    }

    fn compile_component(
        &mut self,
        target: ComponentTarget,
        attrs: &[(String, String)],
        children: &[TplNode],
    ) -> Result<NodeOp> {
        let mut props = Vec::new();
        for (name, value) in attrs {
            if name.starts_with("x-") {
                continue;
            }
            props.push((Rc::from(name.as_str()), self.compile_expr(value)?));
        }
        let mut slots: Vec<(Rc<str>, Rc<NodeOp>)> = Vec::new();
        let mut default_children: Vec<TplNode> = Vec::new();
        for child in children {
            if let Some(slot_name) = child.attr("x-set-slot") {
                let slot_name: Rc<str> = Rc::from(slot_name);
                let TplNode::Element { children: body, .. } = child else {
                    unreachable!("x-set-slot sits on an element");
                };
                let mut ops = self.compile_children(body)?;
                let op = match ops.len() {
                    1 => ops.remove(0),
                    _ => NodeOp::Multi(ops),
                };
                slots.push((slot_name, Rc::new(op)));
            } else {
                default_children.push(child.clone());
            }
        }
        let default_slot = if default_children
            .iter()
            .all(|c| matches!(c, TplNode::Text(t) if t.trim().is_empty()))
        {
            None
        } else {
            let mut ops = self.compile_children(&default_children)?;
            let op = match ops.len() {
                1 => ops.remove(0),
                _ => NodeOp::Multi(ops),
            };
            Some(Rc::new(op))
        };
        Ok(NodeOp::Component {
            key_id: self.fresh_key(),
            target,
            props,
            slots,
            default_slot,
        })
    }

    /// Fold an element and its statically-shaped descendants into one
    /// `StaticNode` tree, spilling dynamic data and structural children into
    /// the fold.
    fn fold_element(
        &mut self,
        tag: &str,
        attrs: &[(String, String)],
        children: &[TplNode],
        fold: &mut Fold,
    ) -> Result<StaticNode> {
        let mut static_attrs = Vec::new();
        let mut dynamics = Vec::new();

        for (name, value) in attrs {
            if let Some(attr_name) = name.strip_prefix("x-att-") {
                let idx = fold.push_data(DataOp::Eval(self.compile_expr(value)?));
                let dy = if attr_name == "class" {
                    ElemDyn::Class
                } else if is_prop(tag, attr_name) {
                    ElemDyn::Property(Rc::from(attr_name))
                } else {
                    ElemDyn::Attribute(Rc::from(attr_name))
                };
                dynamics.push((idx, dy));
            } else if let Some(event) = name.strip_prefix("x-on-") {
                let expr = self.compile_expr(value)?;
                let free: Rc<[Rc<str>]> = expr.free_vars().into();
                let idx = fold.push_data(DataOp::Handler {
                    expr: Rc::new(expr),
                    free,
                });
                dynamics.push((idx, ElemDyn::Handler(Rc::from(event))));
            } else if name == "x-attrs" {
                let idx = fold.push_data(DataOp::Eval(self.compile_expr(value)?));
                dynamics.push((idx, ElemDyn::Attributes));
            } else if name == "x-ref" {
                let idx = fold.push_data(DataOp::RefSlot(Rc::from(value.as_str())));
                dynamics.push((idx, ElemDyn::Ref));
            } else if name.starts_with("x-") {
                // structural directives were handled by the callers
                continue;
            } else {
                static_attrs.push((Rc::from(name.as_str()), value.clone()));
            }
        }

        let mut static_children = Vec::new();
        if let Some(source) = attrs.iter().find(|(n, _)| n == "x-esc").map(|(_, v)| v) {
            let idx = fold.push_data(DataOp::Eval(self.compile_expr(source)?));
            static_children.push(StaticNode::DynamicText(idx));
        } else if let Some(source) = attrs.iter().find(|(n, _)| n == "x-out").map(|(_, v)| v) {
            let key_id = self.fresh_key();
            let op = NodeOp::RawExpr {
                key_id,
                expr: self.compile_expr(source)?,
            };
            static_children.push(StaticNode::Child(fold.push_child(op)));
        } else {
            self.fold_children(children, fold, &mut static_children)?;
        }

        Ok(StaticNode::Element {
            tag: Rc::from(tag),
            attrs: static_attrs,
            dynamics,
            children: static_children,
        })
    }

    /// Fold a sibling run inside a static element. Foldable markup inlines
    /// into the block type; structural nodes become child anchors, with
    /// `x-if` chains grouped the same way the top-level compiler groups them.
    fn fold_children(
        &mut self,
        children: &[TplNode],
        fold: &mut Fold,
        out: &mut Vec<StaticNode>,
    ) -> Result<()> {
        let only_child = structural_count(children) == 1;
        let mut i = 0;
        while i < children.len() {
            let child = &children[i];
            match child {
                TplNode::Text(text) => {
                    for part in split_interpolation(text) {
                        match part {
                            TextPart::Static(s) => out.push(StaticNode::Text(s)),
                            TextPart::Expr(source) => {
                                let idx =
                                    fold.push_data(DataOp::Eval(self.compile_expr(&source)?));
                                out.push(StaticNode::DynamicText(idx));
                            }
                        }
                    }
                    i += 1;
                }
                TplNode::Comment(_) => i += 1,
                TplNode::Element { .. } if child.has_attr("x-if") => {
                    let op = self.compile_if_chain(children, &mut i)?;
                    out.push(StaticNode::Child(fold.push_child(op)));
                }
                TplNode::Element {
                    tag,
                    attrs,
                    children: grand,
                } if is_foldable(child) => {
                    let folded = self.fold_element(tag, attrs, grand, fold)?;
                    out.push(folded);
                    i += 1;
                }
                TplNode::Element { .. } => {
                    let op = self.compile_structural(child, only_child)?;
                    out.push(StaticNode::Child(fold.push_child(op)));
                    i += 1;
                }
            }
        }
        Ok(())
    }
}

struct Fold {
    data: Vec<DataOp>,
    children: Vec<NodeOp>,
}

impl Fold {
    fn push_data(&mut self, op: DataOp) -> usize {
        self.data.push(op);
        self.data.len() - 1
    }

    fn push_child(&mut self, op: NodeOp) -> usize {
        self.children.push(op);
        self.children.len() - 1
    }
}

/// Can this node fold into its parent's block type? Anything carrying
/// structural directives, a component placement or a `<t>` cannot.
fn is_foldable(node: &TplNode) -> bool {
    let TplNode::Element { tag, attrs, children, .. } = node else {
        return true;
    };
    if tag == "t" || tag.chars().next().is_some_and(char::is_uppercase) {
        return false;
    }
    const STRUCTURAL: &[&str] = &[
        "x-if",
        "x-elif",
        "x-else",
        "x-foreach",
        "x-out",
        "x-component",
        "x-portal",
        "x-slot",
        "x-set-slot",
        "x-call",
        "x-set",
    ];
    if attrs.iter().any(|(n, _)| STRUCTURAL.contains(&n.as_str())) {
        return false;
    }
    children.iter().all(is_foldable)
}

fn structural_count(children: &[TplNode]) -> usize {
    children
        .iter()
        .filter(|c| !matches!(c, TplNode::Text(t) if t.trim().is_empty()))
        .count()
}

// =============================================================================
// Execution
// =============================================================================

impl NodeOp {
    fn render(&self, ctx: &RenderCtx) -> Result<Option<Block>> {
        match self {
            NodeOp::StaticText(text) => Ok(Some(Block::Text(VText::new(text.clone())))),
            NodeOp::Comment(text) => Ok(Some(Block::Comment(VComment::new(text.clone())))),
            NodeOp::TextExpr(expr) => {
                let value = expr.eval(&ctx.scope)?;
                Ok(Some(Block::Text(VText::new(value.to_text()))))
            }
            NodeOp::RawExpr { key_id, expr } => {
                let value = expr.eval(&ctx.scope)?;
                let block = match &value {
                    Value::Markup(html) => Block::Html(VHtml::new(html.to_string())),
                    other => Block::Text(VText::new(other.to_text())),
                };
                // key the toggler on the safety kind so markup<->text swaps
                let kind = if matches!(value, Value::Markup(_)) { "m" } else { "t" };
                Ok(Some(Block::Toggler(VToggler::new(
                    format!("k{key_id}{}-{kind}", ctx.key_suffix),
                    block,
                ))))
            }
            NodeOp::Elem { ty, data, children } => {
                let mut values = Vec::with_capacity(data.len());
                for op in data {
                    values.push(op.render(ctx)?);
                }
                let mut child_blocks = Vec::with_capacity(children.len());
                for child in children {
                    child_blocks.push(child.render(ctx)?);
                }
                Ok(Some(ty.block(values, child_blocks)))
            }
            NodeOp::Multi(ops) => {
                let mut blocks = Vec::with_capacity(ops.len());
                for op in ops {
                    blocks.push(op.render(ctx)?);
                }
                Ok(Some(Block::Multi(VMulti::new(blocks))))
            }
            NodeOp::If { key_id, branches } => {
                for (i, (cond, body)) in branches.iter().enumerate() {
                    let taken = match cond {
                        Some(cond) => cond.eval(&ctx.scope)?.truthy(),
                        None => true,
                    };
                    if taken {
                        let Some(block) = body.render(ctx)? else {
                            return Ok(None);
                        };
                        return Ok(Some(Block::Toggler(VToggler::new(
                            format!("k{key_id}{}-{i}", ctx.key_suffix),
                            block,
                        ))));
                    }
                }
                Ok(None)
            }
            NodeOp::ForEach {
                key_id,
                items,
                var,
                key,
                body,
                is_only_child,
            } => {
                let collection = items.eval(&ctx.scope)?;
                let values = iterate(&collection);
                let mut children = Vec::with_capacity(values.len());
                let mut seen: FxHashSet<String> = FxHashSet::default();
                for (index, item) in values.into_iter().enumerate() {
                    let iter_scope = ctx.scope.child();
                    iter_scope.define(var.as_ref(), item);
                    iter_scope.define(format!("{var}_index"), Value::num(index as f64));
                    let iter_key = match key {
                        Some(expr) => expr.eval(&iter_scope)?.to_text(),
                        None => index.to_string(),
                    };
                    if ctx.dev && !seen.insert(iter_key.clone()) {
                        return Err(CinderError::DuplicateKey(iter_key));
                    }
                    let mut iter_ctx = ctx.with_scope(iter_scope);
                    iter_ctx.key_suffix = format!("{}-{iter_key}", ctx.key_suffix);
                    let block = body
                        .render(&iter_ctx)?
                        .unwrap_or_else(|| Block::Text(VText::new("")));
                    children.push(Keyed::new(
                        format!("k{key_id}-{iter_key}"),
                        block,
                    ));
                }
                Ok(Some(Block::List(VList::new(children, *is_only_child))))
            }
            NodeOp::SetVar { name, value } => {
                let v = value.eval(&ctx.scope)?;
                ctx.scope.define(name.as_ref(), v);
                Ok(None)
            }
            NodeOp::CallTemplate { key_id, name } => {
                let program = ctx.node.template_program(name)?;
                let sub = program.execute(ctx)?;
                Ok(Some(Block::Toggler(VToggler::new(
                    format!("k{key_id}{}", ctx.key_suffix),
                    sub,
                ))))
            }
            NodeOp::Slot { name, default } => {
                if let Some(render) = ctx.node.slot(name) {
                    return render();
                }
                match default {
                    Some(op) => op.render(ctx),
                    None => Ok(None),
                }
            }
            NodeOp::Component {
                key_id,
                target,
                props,
                slots,
                default_slot,
            } => {
                let (ctype, identity) = match target {
                    ComponentTarget::Named(name) => {
                        (ctx.node.resolve_component(name)?, name.to_string())
                    }
                    ComponentTarget::Dynamic(expr) => {
                        let name = expr.eval(&ctx.scope)?.to_text();
                        (ctx.node.resolve_component(&name)?, name)
                    }
                };
                let key = format!("k{key_id}{}", ctx.key_suffix);

                let props_obj = Value::empty_obj();
                {
                    let data = props_obj.as_obj().expect("fresh object");
                    for (name, expr) in props {
                        data.set(name, expr.eval(&ctx.scope)?)?;
                    }
                }

                let mut slot_map: FxHashMap<Rc<str>, SlotRender> = FxHashMap::default();
                for (name, op) in slots {
                    slot_map.insert(name.clone(), self.make_slot(op, ctx));
                }
                if let Some(op) = default_slot {
                    slot_map.insert(Rc::from("default"), self.make_slot(op, ctx));
                }

                let child =
                    ctx.node
                        .create_or_update_child(&key, ctype, props_obj, slot_map)?;
                // toggled on identity so a dynamic component swap rebuilds
                Ok(Some(Block::Toggler(VToggler::new(
                    format!("{key}-{identity}"),
                    Block::Component(child),
                ))))
            }
            NodeOp::Portal { target, body } => {
                let target_value = target.eval(&ctx.scope)?;
                let Value::Node(target_el) = target_value else {
                    return Err(CinderError::Eval(
                        "x-portal target must be a DOM node".to_string(),
                    ));
                };
                let block = body
                    .render(ctx)?
                    .unwrap_or_else(|| Block::Text(VText::new("")));
                Ok(Some(Block::Portal(VPortal::new(target_el, block))))
            }
        }
    }

    /// Close a slot body over a frozen view of the defining environment: the
    /// owner component, its scope and key suffix at placement time.
    fn make_slot(&self, op: &Rc<NodeOp>, ctx: &RenderCtx) -> SlotRender {
        let op = op.clone();
        let scope = ctx.scope.clone();
        let node = ctx.node.clone();
        let key_suffix = ctx.key_suffix.clone();
        let dev = ctx.dev;
        Rc::new(move || {
            let ctx = RenderCtx {
                scope: scope.clone(),
                node: node.clone(),
                key_suffix: key_suffix.clone(),
                dev,
            };
            op.render(&ctx)
        })
    }
}

impl DataOp {
    fn render(&self, ctx: &RenderCtx) -> Result<Value> {
        match self {
            DataOp::Eval(expr) => expr.eval(&ctx.scope),
            DataOp::Handler { expr, free } => {
                // capture now: the handler must see the values from this
                // render, not whatever the scope holds when it finally fires
                let snapshot = ctx.scope.capture(free);
                if matches!(expr.as_ref(), Expr::Arrow { .. }) {
                    return expr.eval(&snapshot);
                }
                let value = expr.eval(&snapshot)?;
                if matches!(value, Value::Fn(_)) {
                    return Ok(value);
                }
                // bare statement form: defer evaluation to dispatch time
                let expr = expr.clone();
                Ok(Value::func(move |args: &[Value]| {
                    let call_scope = snapshot.child();
                    call_scope.define("event", args.first().cloned().unwrap_or(Value::None));
                    expr.eval(&call_scope)
                }))
            }
            DataOp::RefSlot(name) => {
                let node = Rc::downgrade(&ctx.node);
                let name = name.clone();
                Ok(Value::func(move |args: &[Value]| {
                    if let Some(node) = node.upgrade() {
                        node.set_ref(&name, args.first().cloned().unwrap_or(Value::None));
                    }
                    Ok(Value::None)
                }))
            }
        }
    }
}

fn iterate(collection: &Value) -> Vec<Value> {
    match collection {
        Value::List(list) => list.iter_values(),
        Value::Obj(obj) => obj
            .keys()
            .into_iter()
            .map(Value::Str)
            .collect(),
        Value::Num(n) => (0..(*n as usize)).map(|i| Value::num(i as f64)).collect(),
        _ => Vec::new(),
    }
}

// =============================================================================
// Debug dump
// =============================================================================

impl fmt::Display for RenderProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.dump(f, 0)
    }
}

impl NodeOp {
    fn dump(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        match self {
            NodeOp::StaticText(t) => writeln!(f, "{pad}text {t:?}"),
            NodeOp::Comment(t) => writeln!(f, "{pad}comment {t:?}"),
            NodeOp::TextExpr(e) => writeln!(f, "{pad}esc {e:?}"),
            NodeOp::RawExpr { key_id, expr } => writeln!(f, "{pad}out k{key_id} {expr:?}"),
            NodeOp::Elem { ty, data, children } => {
                writeln!(
                    f,
                    "{pad}elem data={} children={} refs={}",
                    data.len(),
                    ty.children_len(),
                    ty.ref_count()
                )?;
                for child in children {
                    child.dump(f, depth + 1)?;
                }
                Ok(())
            }
            NodeOp::Multi(ops) => {
                writeln!(f, "{pad}multi[{}]", ops.len())?;
                for op in ops {
                    op.dump(f, depth + 1)?;
                }
                Ok(())
            }
            NodeOp::If { key_id, branches } => {
                writeln!(f, "{pad}if k{key_id} ({} branches)", branches.len())?;
                for (_, body) in branches {
                    body.dump(f, depth + 1)?;
                }
                Ok(())
            }
            NodeOp::ForEach { key_id, var, .. } => {
                writeln!(f, "{pad}foreach k{key_id} as {var}")
            }
            NodeOp::SetVar { name, .. } => writeln!(f, "{pad}set {name}"),
            NodeOp::CallTemplate { key_id, name } => writeln!(f, "{pad}call k{key_id} {name}"),
            NodeOp::Slot { name, .. } => writeln!(f, "{pad}slot {name}"),
            NodeOp::Component { key_id, .. } => writeln!(f, "{pad}component k{key_id}"),
            NodeOp::Portal { .. } => writeln!(f, "{pad}portal"),
        }
    }
}
