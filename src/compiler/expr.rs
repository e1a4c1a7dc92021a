//! The template expression language.
//!
//! Expressions come out of attribute strings and `{{ }}` interpolations and
//! are compiled once into a small AST, then evaluated against a [`Scope`] on
//! every render. The language is deliberately small: literals, variable and
//! member access, calls, arithmetic, comparisons, ternaries, arrow functions
//! and assignment. The word operators `and`, `or`, `not` and `in` are
//! accepted as aliases for `&&`, `||`, `!` and membership.
//!
//! Arrow functions evaluate to [`Value::Fn`] closures over the scope that was
//! active at evaluation time; their parameters shadow outer bindings.
//! [`Expr::free_vars`] reports the identifiers such a deferred closure reads,
//! which is what render programs snapshot when they build handlers.

use std::rc::Rc;

use rustc_hash::FxHashSet;

use crate::error::{CinderError, Result};
use crate::value::{Scope, Value};

// =============================================================================
// AST
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
}

#[derive(Debug, Clone)]
pub enum MemberKey {
    Name(Rc<str>),
    Index(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Num(f64),
    Str(Rc<str>),
    Bool(bool),
    None,
    Var(Rc<str>),
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        other: Box<Expr>,
    },
    Member {
        obj: Box<Expr>,
        key: MemberKey,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Arrow {
        params: Vec<Rc<str>>,
        body: Rc<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    ListLit(Vec<Expr>),
    ObjLit(Vec<(Rc<str>, Expr)>),
}

/// Compile an expression string.
pub fn compile(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(CinderError::expression(
            source,
            format!("unexpected trailing token `{:?}`", parser.tokens[parser.pos]),
        ));
    }
    Ok(expr)
}

// =============================================================================
// Tokenizer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    // punctuation and operators, one variant each
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Question,
    Dot,
    Arrow,
    Assign,
    Op(BinOp),
    Bang,
    Minus,
    Plus,
}

fn tokenize(source: &str) -> Result<Vec<Tok>> {
    let mut out = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                out.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                out.push(Tok::RParen);
                i += 1;
            }
            '[' => {
                out.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                out.push(Tok::RBracket);
                i += 1;
            }
            '{' => {
                out.push(Tok::LBrace);
                i += 1;
            }
            '}' => {
                out.push(Tok::RBrace);
                i += 1;
            }
            ',' => {
                out.push(Tok::Comma);
                i += 1;
            }
            ':' => {
                out.push(Tok::Colon);
                i += 1;
            }
            '?' => {
                out.push(Tok::Question);
                i += 1;
            }
            '.' => {
                out.push(Tok::Dot);
                i += 1;
            }
            '+' => {
                out.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                out.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                out.push(Tok::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                out.push(Tok::Op(BinOp::Div));
                i += 1;
            }
            '%' => {
                out.push(Tok::Op(BinOp::Mod));
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'>') {
                    out.push(Tok::Arrow);
                    i += 2;
                } else if chars.get(i + 1) == Some(&'=') {
                    // == and === compare alike
                    i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
                    out.push(Tok::Op(BinOp::Eq));
                } else {
                    out.push(Tok::Assign);
                    i += 1;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
                    out.push(Tok::Op(BinOp::Ne));
                } else {
                    out.push(Tok::Bang);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    out.push(Tok::Op(BinOp::Le));
                    i += 2;
                } else {
                    out.push(Tok::Op(BinOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    out.push(Tok::Op(BinOp::Ge));
                    i += 2;
                } else {
                    out.push(Tok::Op(BinOp::Gt));
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    out.push(Tok::Op(BinOp::And));
                    i += 2;
                } else {
                    return Err(CinderError::expression(source, "stray `&`"));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    out.push(Tok::Op(BinOp::Or));
                    i += 2;
                } else {
                    return Err(CinderError::expression(source, "stray `|`"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(CinderError::expression(source, "unterminated string"));
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            if let Some(&esc) = chars.get(i + 1) {
                                s.push(match esc {
                                    'n' => '\n',
                                    't' => '\t',
                                    other => other,
                                });
                                i += 2;
                            } else {
                                return Err(CinderError::expression(source, "dangling escape"));
                            }
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                out.push(Tok::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // a dot followed by a non-digit is member access, not a decimal
                    if chars[i] == '.' && !chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| CinderError::expression(source, format!("bad number `{text}`")))?;
                out.push(Tok::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                // word operators normalize here
                out.push(match word.as_str() {
                    "and" => Tok::Op(BinOp::And),
                    "or" => Tok::Op(BinOp::Or),
                    "in" => Tok::Op(BinOp::In),
                    "not" => Tok::Bang,
                    _ => Tok::Ident(word),
                });
            }
            other => {
                return Err(CinderError::expression(
                    source,
                    format!("unexpected character `{other}`"),
                ));
            }
        }
    }
    Ok(out)
}

// =============================================================================
// Parser
// =============================================================================

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Tok>,
    pos: usize,
}

fn binding_power(op: BinOp) -> (u8, u8) {
    match op {
        BinOp::Or => (3, 4),
        BinOp::And => (5, 6),
        BinOp::Eq | BinOp::Ne => (7, 8),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::In => (9, 10),
        BinOp::Add | BinOp::Sub => (11, 12),
        BinOp::Mul | BinOp::Div | BinOp::Mod => (13, 14),
    }
}

impl Parser<'_> {
    fn err(&self, message: impl Into<String>) -> CinderError {
        CinderError::expression(self.source, message)
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: &Tok) -> Result<()> {
        match self.next() {
            Some(t) if t == *tok => Ok(()),
            other => Err(self.err(format!("expected `{tok:?}`, found `{other:?}`"))),
        }
    }

    /// Does a parenthesis at `pos` open an arrow parameter list? True when
    /// the token after the matching close paren is `=>`.
    fn paren_starts_arrow(&self) -> bool {
        let mut depth = 0;
        for (i, tok) in self.tokens[self.pos..].iter().enumerate() {
            match tok {
                Tok::LParen => depth += 1,
                Tok::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return self.tokens.get(self.pos + i + 1) == Some(&Tok::Arrow);
                    }
                }
                _ => {}
            }
        }
        false
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.parse_prefix()?;
        loop {
            let Some(tok) = self.peek() else { break };
            match tok {
                Tok::Op(op) => {
                    let op = *op;
                    let (l_bp, r_bp) = binding_power(op);
                    if l_bp < min_bp {
                        break;
                    }
                    self.pos += 1;
                    let rhs = self.parse_expr(r_bp)?;
                    lhs = Expr::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                }
                Tok::Plus | Tok::Minus => {
                    let op = if *tok == Tok::Plus { BinOp::Add } else { BinOp::Sub };
                    let (l_bp, r_bp) = binding_power(op);
                    if l_bp < min_bp {
                        break;
                    }
                    self.pos += 1;
                    let rhs = self.parse_expr(r_bp)?;
                    lhs = Expr::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                }
                Tok::Question => {
                    if min_bp > 1 {
                        break;
                    }
                    self.pos += 1;
                    let then = self.parse_expr(0)?;
                    self.expect(&Tok::Colon)?;
                    let other = self.parse_expr(1)?;
                    lhs = Expr::Ternary {
                        cond: Box::new(lhs),
                        then: Box::new(then),
                        other: Box::new(other),
                    };
                }
                Tok::Assign => {
                    if min_bp > 0 {
                        break;
                    }
                    if !matches!(lhs, Expr::Var(_) | Expr::Member { .. }) {
                        return Err(self.err("invalid assignment target"));
                    }
                    self.pos += 1;
                    let value = self.parse_expr(0)?;
                    lhs = Expr::Assign {
                        target: Box::new(lhs),
                        value: Box::new(value),
                    };
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr> {
        let expr = match self.peek().cloned() {
            Some(Tok::Bang) => {
                self.pos += 1;
                Expr::Unary {
                    op: UnOp::Not,
                    expr: Box::new(self.parse_prefix()?),
                }
            }
            Some(Tok::Minus) => {
                self.pos += 1;
                Expr::Unary {
                    op: UnOp::Neg,
                    expr: Box::new(self.parse_prefix()?),
                }
            }
            _ => self.parse_primary()?,
        };
        self.parse_postfix(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Str(s)) => Ok(Expr::Str(Rc::from(s.as_str()))),
            Some(Tok::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" | "undefined" | "none" => Ok(Expr::None),
                _ => {
                    // `ident => body` single-parameter arrow
                    if self.peek() == Some(&Tok::Arrow) {
                        self.pos += 1;
                        let body = self.parse_expr(0)?;
                        return Ok(Expr::Arrow {
                            params: vec![Rc::from(word.as_str())],
                            body: Rc::new(body),
                        });
                    }
                    Ok(Expr::Var(Rc::from(word.as_str())))
                }
            },
            Some(Tok::LParen) => {
                self.pos -= 1;
                if self.paren_starts_arrow() {
                    return self.parse_arrow();
                }
                self.pos += 1;
                let inner = self.parse_expr(0)?;
                self.expect(&Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Tok::RBracket) {
                    loop {
                        items.push(self.parse_expr(0)?);
                        if self.peek() == Some(&Tok::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBracket)?;
                Ok(Expr::ListLit(items))
            }
            Some(Tok::LBrace) => {
                let mut entries = Vec::new();
                if self.peek() != Some(&Tok::RBrace) {
                    loop {
                        let key = match self.next() {
                            Some(Tok::Ident(name)) => Rc::from(name.as_str()),
                            Some(Tok::Str(name)) => Rc::from(name.as_str()),
                            other => {
                                return Err(self.err(format!("bad object key `{other:?}`")));
                            }
                        };
                        self.expect(&Tok::Colon)?;
                        entries.push((key, self.parse_expr(0)?));
                        if self.peek() == Some(&Tok::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBrace)?;
                Ok(Expr::ObjLit(entries))
            }
            other => Err(self.err(format!("unexpected token `{other:?}`"))),
        }
    }

    fn parse_arrow(&mut self) -> Result<Expr> {
        self.expect(&Tok::LParen)?;
        let mut params = Vec::new();
        if self.peek() != Some(&Tok::RParen) {
            loop {
                match self.next() {
                    Some(Tok::Ident(name)) => params.push(Rc::from(name.as_str())),
                    other => {
                        return Err(self.err(format!("bad arrow parameter `{other:?}`")));
                    }
                }
                if self.peek() == Some(&Tok::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(&Tok::RParen)?;
        self.expect(&Tok::Arrow)?;
        let body = self.parse_expr(0)?;
        Ok(Expr::Arrow {
            params,
            body: Rc::new(body),
        })
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr> {
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    let name = match self.next() {
                        Some(Tok::Ident(name)) => Rc::from(name.as_str()),
                        other => {
                            return Err(self.err(format!("bad member name `{other:?}`")));
                        }
                    };
                    expr = Expr::Member {
                        obj: Box::new(expr),
                        key: MemberKey::Name(name),
                    };
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_expr(0)?;
                    self.expect(&Tok::RBracket)?;
                    expr = Expr::Member {
                        obj: Box::new(expr),
                        key: MemberKey::Index(Box::new(index)),
                    };
                }
                Some(Tok::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Tok::RParen) {
                        loop {
                            args.push(self.parse_expr(0)?);
                            if self.peek() == Some(&Tok::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Tok::RParen)?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }
}

// =============================================================================
// Evaluation
// =============================================================================

impl Expr {
    pub fn eval(&self, scope: &Rc<Scope>) -> Result<Value> {
        match self {
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::None),
            Expr::Var(name) => Ok(scope.lookup(name).unwrap_or(Value::None)),
            Expr::Unary { op, expr } => {
                let v = expr.eval(scope)?;
                Ok(match op {
                    UnOp::Not => Value::Bool(!v.truthy()),
                    UnOp::Neg => Value::Num(-v.as_num().unwrap_or(f64::NAN)),
                })
            }
            Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, scope),
            Expr::Ternary { cond, then, other } => {
                if cond.eval(scope)?.truthy() {
                    then.eval(scope)
                } else {
                    other.eval(scope)
                }
            }
            Expr::Member { obj, key } => {
                let target = obj.eval(scope)?;
                eval_member(&target, key, scope)
            }
            Expr::Call { callee, args } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(arg.eval(scope)?);
                }
                // list built-ins dispatch on the member name
                if let Expr::Member {
                    obj,
                    key: MemberKey::Name(name),
                } = callee.as_ref()
                {
                    let target = obj.eval(scope)?;
                    if let Value::List(list) = &target {
                        match &**name {
                            "push" => {
                                for v in arg_values {
                                    list.push(v)?;
                                }
                                return Ok(Value::None);
                            }
                            "pop" => return list.pop(),
                            _ => {}
                        }
                    }
                    let f = eval_member(&target, &MemberKey::Name(name.clone()), scope)?;
                    return call_value(&f, &arg_values);
                }
                let f = callee.eval(scope)?;
                call_value(&f, &arg_values)
            }
            Expr::Arrow { params, body } => {
                let captured = scope.clone();
                let params = params.clone();
                let body = body.clone();
                Ok(Value::func(move |args: &[Value]| {
                    let inner = captured.child();
                    for (i, param) in params.iter().enumerate() {
                        inner.define(param.as_ref(), args.get(i).cloned().unwrap_or(Value::None));
                    }
                    body.eval(&inner)
                }))
            }
            Expr::Assign { target, value } => {
                let v = value.eval(scope)?;
                match target.as_ref() {
                    Expr::Var(name) => {
                        scope.assign(name, v.clone());
                        Ok(v)
                    }
                    Expr::Member { obj, key } => {
                        let container = obj.eval(scope)?;
                        assign_member(&container, key, v.clone(), scope)?;
                        Ok(v)
                    }
                    _ => Err(CinderError::Eval("invalid assignment target".to_string())),
                }
            }
            Expr::ListLit(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(item.eval(scope)?);
                }
                Ok(Value::list(values))
            }
            Expr::ObjLit(entries) => {
                let obj = Value::obj([]);
                let data = obj.as_obj().expect("fresh object").clone();
                for (key, expr) in entries {
                    data.set(key, expr.eval(scope)?)?;
                }
                Ok(obj)
            }
        }
    }

    /// The identifiers this expression reads from its environment. Arrow
    /// parameters are bound, not free; object literal keys never count.
    pub fn free_vars(&self) -> Vec<Rc<str>> {
        let mut out = Vec::new();
        let mut bound: Vec<Rc<str>> = Vec::new();
        let mut seen = FxHashSet::default();
        collect_free(self, &mut bound, &mut out, &mut seen);
        out
    }
}

fn collect_free(
    expr: &Expr,
    bound: &mut Vec<Rc<str>>,
    out: &mut Vec<Rc<str>>,
    seen: &mut FxHashSet<Rc<str>>,
) {
    match expr {
        Expr::Num(_) | Expr::Str(_) | Expr::Bool(_) | Expr::None => {}
        Expr::Var(name) => {
            if !bound.iter().any(|b| b == name) && seen.insert(name.clone()) {
                out.push(name.clone());
            }
        }
        Expr::Unary { expr, .. } => collect_free(expr, bound, out, seen),
        Expr::Binary { lhs, rhs, .. } => {
            collect_free(lhs, bound, out, seen);
            collect_free(rhs, bound, out, seen);
        }
        Expr::Ternary { cond, then, other } => {
            collect_free(cond, bound, out, seen);
            collect_free(then, bound, out, seen);
            collect_free(other, bound, out, seen);
        }
        Expr::Member { obj, key } => {
            collect_free(obj, bound, out, seen);
            if let MemberKey::Index(index) = key {
                collect_free(index, bound, out, seen);
            }
        }
        Expr::Call { callee, args } => {
            collect_free(callee, bound, out, seen);
            for arg in args {
                collect_free(arg, bound, out, seen);
            }
        }
        Expr::Arrow { params, body } => {
            let depth = bound.len();
            bound.extend(params.iter().cloned());
            collect_free(body, bound, out, seen);
            bound.truncate(depth);
        }
        Expr::Assign { target, value } => {
            collect_free(target, bound, out, seen);
            collect_free(value, bound, out, seen);
        }
        Expr::ListLit(items) => {
            for item in items {
                collect_free(item, bound, out, seen);
            }
        }
        Expr::ObjLit(entries) => {
            for (_, value) in entries {
                collect_free(value, bound, out, seen);
            }
        }
    }
}

fn call_value(f: &Value, args: &[Value]) -> Result<Value> {
    match f {
        Value::Fn(f) => f(args),
        other => Err(CinderError::Eval(format!(
            "`{other:?}` is not callable"
        ))),
    }
}

fn eval_member(target: &Value, key: &MemberKey, scope: &Rc<Scope>) -> Result<Value> {
    match key {
        MemberKey::Name(name) => Ok(read_member(target, name)),
        MemberKey::Index(index) => {
            let idx = index.eval(scope)?;
            match (target, &idx) {
                (Value::List(list), Value::Num(n)) => Ok(list.get(*n as usize)),
                (_, key) => Ok(read_member(target, &key.to_text())),
            }
        }
    }
}

fn read_member(target: &Value, name: &str) -> Value {
    match target {
        Value::Obj(obj) => obj.get(name),
        Value::List(list) => match name {
            "length" => Value::Num(list.len() as f64),
            _ => name
                .parse::<usize>()
                .map(|idx| list.get(idx))
                .unwrap_or(Value::None),
        },
        Value::Str(s) | Value::Markup(s) => match name {
            "length" => Value::Num(s.chars().count() as f64),
            _ => Value::None,
        },
        _ => Value::None,
    }
}

fn assign_member(container: &Value, key: &MemberKey, value: Value, scope: &Rc<Scope>) -> Result<()> {
    match key {
        MemberKey::Name(name) => match container {
            Value::Obj(obj) => obj.set(name, value),
            Value::List(list) => match name.parse::<usize>() {
                Ok(idx) => list.set(idx, value),
                Err(_) => Err(CinderError::Eval(format!("cannot set `{name}` on a list"))),
            },
            other => Err(CinderError::Eval(format!("cannot set `{name}` on {other:?}"))),
        },
        MemberKey::Index(index) => {
            let idx = index.eval(scope)?;
            match (container, &idx) {
                (Value::List(list), Value::Num(n)) => list.set(*n as usize, value),
                (Value::Obj(obj), key) => obj.set(&key.to_text(), value),
                (other, _) => Err(CinderError::Eval(format!("cannot index into {other:?}"))),
            }
        }
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, scope: &Rc<Scope>) -> Result<Value> {
    // short-circuit forms first
    match op {
        BinOp::And => {
            let l = lhs.eval(scope)?;
            return if l.truthy() { rhs.eval(scope) } else { Ok(l) };
        }
        BinOp::Or => {
            let l = lhs.eval(scope)?;
            return if l.truthy() { Ok(l) } else { rhs.eval(scope) };
        }
        _ => {}
    }
    let l = lhs.eval(scope)?;
    let r = rhs.eval(scope)?;
    let num = |v: &Value| v.as_num().unwrap_or(f64::NAN);
    Ok(match op {
        BinOp::Add => {
            if matches!(l, Value::Str(_) | Value::Markup(_)) || matches!(r, Value::Str(_) | Value::Markup(_))
            {
                Value::str(format!("{}{}", l.to_text(), r.to_text()))
            } else {
                Value::Num(num(&l) + num(&r))
            }
        }
        BinOp::Sub => Value::Num(num(&l) - num(&r)),
        BinOp::Mul => Value::Num(num(&l) * num(&r)),
        BinOp::Div => Value::Num(num(&l) / num(&r)),
        BinOp::Mod => Value::Num(num(&l) % num(&r)),
        BinOp::Eq => Value::Bool(l.loose_eq(&r)),
        BinOp::Ne => Value::Bool(!l.loose_eq(&r)),
        BinOp::Lt => compare(&l, &r, |o| o == std::cmp::Ordering::Less),
        BinOp::Le => compare(&l, &r, |o| o != std::cmp::Ordering::Greater),
        BinOp::Gt => compare(&l, &r, |o| o == std::cmp::Ordering::Greater),
        BinOp::Ge => compare(&l, &r, |o| o != std::cmp::Ordering::Less),
        BinOp::In => match &r {
            Value::Obj(obj) => Value::Bool(obj.has(&l.to_text())),
            Value::List(list) => {
                let found = list.iter_values().iter().any(|item| item.loose_eq(&l));
                Value::Bool(found)
            }
            _ => Value::Bool(false),
        },
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    })
}

fn compare(l: &Value, r: &Value, pick: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    let ordering = match (l, r) {
        (Value::Str(a) | Value::Markup(a), Value::Str(b) | Value::Markup(b)) => a.cmp(b),
        _ => {
            let (a, b) = (
                l.as_num().unwrap_or(f64::NAN),
                r.as_num().unwrap_or(f64::NAN),
            );
            match a.partial_cmp(&b) {
                Some(o) => o,
                None => return Value::Bool(false),
            }
        }
    };
    Value::Bool(pick(ordering))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactivity::reset_reactivity;

    fn eval_str(source: &str, scope: &Rc<Scope>) -> Value {
        compile(source).unwrap().eval(scope).unwrap()
    }

    #[test]
    fn test_literals_and_arithmetic() {
        let scope = Scope::new();
        assert_eq!(eval_str("1 + 2 * 3", &scope).to_text(), "7");
        assert_eq!(eval_str("(1 + 2) * 3", &scope).to_text(), "9");
        assert_eq!(eval_str("10 % 3", &scope).to_text(), "1");
        assert_eq!(eval_str("-4 + 1", &scope).to_text(), "-3");
        assert_eq!(eval_str("'a' + 'b'", &scope).to_text(), "ab");
        assert_eq!(eval_str("'n=' + 2", &scope).to_text(), "n=2");
    }

    #[test]
    fn test_word_operators_normalize() {
        let scope = Scope::new();
        scope.define("a", Value::Bool(true));
        scope.define("b", Value::Bool(false));
        assert!(!eval_str("a and b", &scope).truthy());
        assert!(eval_str("a or b", &scope).truthy());
        assert!(eval_str("not b", &scope).truthy());

        reset_reactivity();
        let obj = Value::obj([("x", Value::num(1.0))]);
        scope.define("o", obj);
        assert!(eval_str("'x' in o", &scope).truthy());
        assert!(!eval_str("'y' in o", &scope).truthy());
    }

    #[test]
    fn test_member_and_index_access() {
        reset_reactivity();
        let scope = Scope::new();
        scope.define(
            "user",
            Value::obj([("name", Value::str("ada")), ("tags", Value::list([Value::str("x")]))]),
        );
        assert_eq!(eval_str("user.name", &scope).to_text(), "ada");
        assert_eq!(eval_str("user['name']", &scope).to_text(), "ada");
        assert_eq!(eval_str("user.tags[0]", &scope).to_text(), "x");
        assert_eq!(eval_str("user.tags.length", &scope).to_text(), "1");
        assert!(matches!(eval_str("user.missing", &scope), Value::None));
    }

    #[test]
    fn test_ternary_and_comparison() {
        let scope = Scope::new();
        scope.define("n", Value::num(5.0));
        assert_eq!(eval_str("n > 3 ? 'big' : 'small'", &scope).to_text(), "big");
        assert!(eval_str("n == 5", &scope).truthy());
        assert!(eval_str("n != 4", &scope).truthy());
        assert!(eval_str("'a' < 'b'", &scope).truthy());
    }

    #[test]
    fn test_arrow_functions() {
        let scope = Scope::new();
        scope.define("base", Value::num(10.0));
        let f = eval_str("(x, y) => base + x + y", &scope);
        let result = call_value(&f, &[Value::num(1.0), Value::num(2.0)]).unwrap();
        assert_eq!(result.to_text(), "13");

        // single-parameter shorthand
        let g = eval_str("x => x * 2", &scope);
        assert_eq!(call_value(&g, &[Value::num(21.0)]).unwrap().to_text(), "42");
    }

    #[test]
    fn test_assignment() {
        reset_reactivity();
        let scope = Scope::new();
        scope.define("state", Value::obj([("count", Value::num(0.0))]));
        eval_str("state.count = state.count + 1", &scope);
        assert_eq!(eval_str("state.count", &scope).to_text(), "1");
    }

    #[test]
    fn test_free_vars() {
        let expr = compile("(x) => x + a + o.b + items[i]").unwrap();
        let free = expr.free_vars();
        let names: Vec<&str> = free.iter().map(|s| &**s).collect();
        assert_eq!(names, vec!["a", "o", "items", "i"]);
    }

    #[test]
    fn test_compile_errors() {
        assert!(compile("1 +").is_err());
        assert!(compile("'unterminated").is_err());
        assert!(compile("a b").is_err());
        assert!(compile("3 = x").is_err());
    }

    #[test]
    fn test_literals_collections() {
        let scope = Scope::new();
        reset_reactivity();
        let list = eval_str("[1, 2, 3]", &scope);
        assert_eq!(list.as_list().unwrap().len(), 3);
        let obj = eval_str("{ a: 1, b: 'two' }", &scope);
        assert_eq!(obj.as_obj().unwrap().get("b").to_text(), "two");
    }
}
