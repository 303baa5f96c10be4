//! Tree-walking evaluator.
//!
//! Consumes the optimized AST and a runtime environment. Honors every
//! node variant the parser produces plus the specialized builtin forms
//! introduced by the optimizer (`in` over a constant sequence, and the
//! fused `filterMap`/`count`/`find`/`findLast` shapes).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use regex::Regex;

use crate::ast::{Node, NodeKind, Span};
use crate::error::RuntimeError;
use crate::operator::{BinaryOp, UnaryOp};
use crate::value::{Environment, Value};

/// Evaluate an AST against an environment.
pub fn eval(node: &Node, env: &Environment) -> Result<Value, RuntimeError> {
    let mut interp = Interp {
        env,
        lets: Vec::new(),
        scopes: Vec::new(),
    };
    match interp.eval(node) {
        Ok(value) => Ok(value),
        Err(Stop::Error(e)) => Err(e),
        // A chain marker that escapes means the optional access had no
        // enclosing Chain; treat it as the nil it stands for.
        Err(Stop::ChainNil) => Ok(Value::Nil),
    }
}

/// Why evaluation of a subtree stopped early: a real error, or an
/// optional-chain link that hit nil and short-circuits to the nearest
/// `Chain` envelope.
enum Stop {
    Error(RuntimeError),
    ChainNil,
}

type EvalResult = Result<Value, Stop>;

fn fail(message: impl Into<String>, span: Span) -> Stop {
    Stop::Error(RuntimeError::new(message, span))
}

/// Pointer bindings for one predicate-closure activation.
struct Scope {
    element: Value,
    index: i64,
    acc: Option<Value>,
}

struct Interp<'a> {
    env: &'a Environment,
    /// `let` bindings, innermost last.
    lets: Vec<(String, Value)>,
    /// Closure activations, innermost last.
    scopes: Vec<Scope>,
}

impl Interp<'_> {
    fn eval(&mut self, node: &Node) -> EvalResult {
        let span = node.span;
        match &node.kind {
            NodeKind::Nil => Ok(Value::Nil),
            NodeKind::Bool(b) => Ok(Value::Bool(*b)),
            NodeKind::Integer(v) => Ok(Value::Int(*v)),
            NodeKind::Float(v) => Ok(Value::Float(*v)),
            NodeKind::String(s) => Ok(Value::String(s.clone())),
            NodeKind::Constant(v) => Ok(v.clone()),
            NodeKind::Identifier(name) => self.lookup(name, span),
            NodeKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                self.unary(*op, value, span)
            }
            NodeKind::Binary { op, left, right } => self.binary(*op, left, right, span),
            NodeKind::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::Seq(values))
            }
            NodeKind::Map(pairs) => {
                let mut entries = BTreeMap::new();
                for pair in pairs {
                    let NodeKind::Pair { key, value } = &pair.kind else {
                        return Err(fail("malformed map literal", pair.span));
                    };
                    let key_value = self.eval(key)?;
                    let key = map_key(&key_value, key.span)?;
                    let value = self.eval(value)?;
                    entries.insert(key, value);
                }
                Ok(Value::Map(entries))
            }
            NodeKind::Pair { .. } => Err(fail("misplaced pair", span)),
            NodeKind::Member {
                node: receiver,
                property,
                optional,
            } => {
                let receiver = self.eval(receiver)?;
                if receiver.is_nil() && *optional {
                    return Err(Stop::ChainNil);
                }
                let property = self.eval(property)?;
                fetch(&receiver, &property, span)
            }
            NodeKind::Chain(inner) => match self.eval(inner) {
                Err(Stop::ChainNil) => Ok(Value::Nil),
                other => other,
            },
            NodeKind::Slice { node, from, to } => {
                let value = self.eval(node)?;
                let from = match from {
                    Some(from) => Some(self.index_of(from)?),
                    None => None,
                };
                let to = match to {
                    Some(to) => Some(self.index_of(to)?),
                    None => None,
                };
                slice(&value, from, to, span)
            }
            NodeKind::Call { callee, args } => self.call(callee, args, span),
            NodeKind::Builtin { name, args } => self.builtin(name, args, span),
            NodeKind::Closure(_) => Err(fail("closure used outside a builtin", span)),
            NodeKind::Pointer(name) => self.pointer(name, span),
            NodeKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                let cond_value = self.eval(cond)?;
                match cond_value {
                    Value::Bool(true) => self.eval(then),
                    Value::Bool(false) => self.eval(otherwise),
                    other => Err(fail(
                        format!("non-bool condition ({})", other.type_name()),
                        cond.span,
                    )),
                }
            }
            NodeKind::VariableDeclarator { name, value, body } => {
                let value = self.eval(value)?;
                self.lets.push((name.clone(), value));
                let result = self.eval(body);
                self.lets.pop();
                result
            }
        }
    }

    fn lookup(&self, name: &str, span: Span) -> EvalResult {
        for (bound, value) in self.lets.iter().rev() {
            if bound == name {
                return Ok(value.clone());
            }
        }
        match self.env.get(name) {
            Some(value) => Ok(value.clone()),
            None => Err(fail(format!("unknown variable {name}"), span)),
        }
    }

    fn pointer(&self, name: &str, span: Span) -> EvalResult {
        let Some(scope) = self.scopes.last() else {
            return Err(fail("cannot use pointer accessor outside closure", span));
        };
        match name {
            "" => Ok(scope.element.clone()),
            "index" => Ok(Value::Int(scope.index)),
            "acc" => match &scope.acc {
                Some(acc) => Ok(acc.clone()),
                None => Err(fail("#acc is only available inside reduce", span)),
            },
            other => Err(fail(format!("unknown pointer #{other}"), span)),
        }
    }

    fn unary(&self, op: UnaryOp, value: Value, span: Span) -> EvalResult {
        match (op, value) {
            (UnaryOp::Neg, Value::Int(v)) => Ok(Value::Int(v.wrapping_neg())),
            (UnaryOp::Neg, Value::Float(v)) => Ok(Value::Float(-v)),
            (UnaryOp::Pos, v @ (Value::Int(_) | Value::Float(_))) => Ok(v),
            (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
            (op, value) => Err(fail(
                format!("invalid operation: {op}{}", value.type_name()),
                span,
            )),
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Node, right: &Node, span: Span) -> EvalResult {
        // Logic and coalescing short-circuit; everything else is strict.
        match op {
            BinaryOp::And => {
                let l = self.truth(left)?;
                if !l {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.truth(right)?));
            }
            BinaryOp::Or => {
                let l = self.truth(left)?;
                if l {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.truth(right)?));
            }
            BinaryOp::Coalesce => {
                let l = self.eval(left)?;
                if !l.is_nil() {
                    return Ok(l);
                }
                return self.eval(right);
            }
            _ => {}
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;
        match op {
            BinaryOp::Add => arith_add(&l, &r, span),
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Pow => {
                arith(op, &l, &r, span)
            }
            BinaryOp::Eq => Ok(Value::Bool(value_eq(&l, &r))),
            BinaryOp::Ne => Ok(Value::Bool(!value_eq(&l, &r))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, &l, &r, span),
            BinaryOp::In => membership(&l, &r, span),
            BinaryOp::Range => match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => {
                    if a > b {
                        Ok(Value::Seq(Vec::new()))
                    } else {
                        Ok(Value::Seq((*a..=*b).map(Value::Int).collect()))
                    }
                }
                _ => Err(fail(
                    format!(
                        "invalid operation: {} .. {} (range bounds must be integers)",
                        l.type_name(),
                        r.type_name()
                    ),
                    span,
                )),
            },
            BinaryOp::Matches => match (&l, &r) {
                (Value::String(s), Value::String(pattern)) => {
                    let re = Regex::new(pattern).map_err(|e| {
                        fail(format!("invalid regular expression: {e}"), span)
                    })?;
                    Ok(Value::Bool(re.is_match(s)))
                }
                _ => Err(invalid_binop(op, &l, &r, span)),
            },
            BinaryOp::Contains => match (&l, &r) {
                (Value::String(s), Value::String(sub)) => Ok(Value::Bool(s.contains(sub))),
                _ => Err(invalid_binop(op, &l, &r, span)),
            },
            BinaryOp::StartsWith => match (&l, &r) {
                (Value::String(s), Value::String(p)) => Ok(Value::Bool(s.starts_with(p))),
                _ => Err(invalid_binop(op, &l, &r, span)),
            },
            BinaryOp::EndsWith => match (&l, &r) {
                (Value::String(s), Value::String(p)) => Ok(Value::Bool(s.ends_with(p))),
                _ => Err(invalid_binop(op, &l, &r, span)),
            },
            BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => unreachable!("handled above"),
        }
    }

    fn truth(&mut self, node: &Node) -> Result<bool, Stop> {
        match self.eval(node)? {
            Value::Bool(b) => Ok(b),
            other => Err(fail(
                format!("non-bool operand ({}) in logical expression", other.type_name()),
                node.span,
            )),
        }
    }

    fn index_of(&mut self, node: &Node) -> Result<i64, Stop> {
        match self.eval(node)? {
            Value::Int(v) => Ok(v),
            other => Err(fail(
                format!("non-integer index ({})", other.type_name()),
                node.span,
            )),
        }
    }

    fn call(&mut self, callee: &Node, args: &[Node], span: Span) -> EvalResult {
        if let NodeKind::Identifier(name) = &callee.kind {
            let Some(f) = self.env.function(name).cloned() else {
                return Err(fail(format!("unknown function {name}"), span));
            };
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(self.eval(arg)?);
            }
            return f(&values).map_err(|message| fail(message, span));
        }
        // Anything else evaluates to a plain value, and values are not
        // callable in this language.
        let value = self.eval(callee)?;
        Err(fail(
            format!("{} is not callable", value.type_name()),
            span,
        ))
    }

    // ── Builtins ──────────────────────────────────────────────────

    fn builtin(&mut self, name: &str, args: &[Node], span: Span) -> EvalResult {
        match name {
            "all" | "none" | "any" | "one" | "filter" | "map" | "count" | "find"
            | "findIndex" | "findLast" | "findLastIndex" | "groupBy" | "reduce"
            | "filterMap" => self.predicate(name, args, span),
            "in" => {
                let l = self.eval(&args[0])?;
                let r = self.eval(&args[1])?;
                membership(&l, &r, span)
            }
            _ => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                generic_builtin(name, &values, span)
            }
        }
    }

    /// Evaluate a closure body with pointer bindings for one element.
    fn closure(
        &mut self,
        closure: &Node,
        element: &Value,
        index: i64,
        acc: Option<Value>,
    ) -> EvalResult {
        let body = match &closure.kind {
            NodeKind::Closure(body) => body,
            _ => closure,
        };
        self.scopes.push(Scope {
            element: element.clone(),
            index,
            acc,
        });
        let result = self.eval(body);
        self.scopes.pop();
        result
    }

    /// Closure result coerced to a predicate decision.
    fn matches(&mut self, closure: &Node, element: &Value, index: i64) -> Result<bool, Stop> {
        match self.closure(closure, element, index, None)? {
            Value::Bool(b) => Ok(b),
            other => Err(fail(
                format!("predicate must return a bool, got {}", other.type_name()),
                closure.span,
            )),
        }
    }

    fn subject(&mut self, name: &str, node: &Node) -> Result<Vec<Value>, Stop> {
        match self.eval(node)? {
            Value::Seq(items) => Ok(items),
            other => Err(fail(
                format!("{name} expects an array, got {}", other.type_name()),
                node.span,
            )),
        }
    }

    fn predicate(&mut self, name: &str, args: &[Node], span: Span) -> EvalResult {
        let items = self.subject(name, &args[0])?;
        let closure = &args[1];

        match name {
            "all" => {
                for (i, item) in items.iter().enumerate() {
                    if !self.matches(closure, item, i as i64)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            "none" => {
                for (i, item) in items.iter().enumerate() {
                    if self.matches(closure, item, i as i64)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            "any" => {
                for (i, item) in items.iter().enumerate() {
                    if self.matches(closure, item, i as i64)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            "one" => {
                let mut seen = false;
                for (i, item) in items.iter().enumerate() {
                    if self.matches(closure, item, i as i64)? {
                        if seen {
                            return Ok(Value::Bool(false));
                        }
                        seen = true;
                    }
                }
                Ok(Value::Bool(seen))
            }
            "filter" => {
                let mut out = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if self.matches(closure, item, i as i64)? {
                        out.push(item.clone());
                    }
                }
                Ok(Value::Seq(out))
            }
            "map" => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.closure(closure, item, i as i64, None)?);
                }
                Ok(Value::Seq(out))
            }
            "count" => {
                let mut n = 0;
                for (i, item) in items.iter().enumerate() {
                    if self.matches(closure, item, i as i64)? {
                        n += 1;
                    }
                }
                Ok(Value::Int(n))
            }
            "find" => {
                for (i, item) in items.iter().enumerate() {
                    if self.matches(closure, item, i as i64)? {
                        return Ok(item.clone());
                    }
                }
                Ok(Value::Nil)
            }
            "findIndex" => {
                for (i, item) in items.iter().enumerate() {
                    if self.matches(closure, item, i as i64)? {
                        return Ok(Value::Int(i as i64));
                    }
                }
                Ok(Value::Int(-1))
            }
            "findLast" => {
                for (i, item) in items.iter().enumerate().rev() {
                    if self.matches(closure, item, i as i64)? {
                        return Ok(item.clone());
                    }
                }
                Ok(Value::Nil)
            }
            "findLastIndex" => {
                for (i, item) in items.iter().enumerate().rev() {
                    if self.matches(closure, item, i as i64)? {
                        return Ok(Value::Int(i as i64));
                    }
                }
                Ok(Value::Int(-1))
            }
            "groupBy" => {
                let mut groups: BTreeMap<String, Value> = BTreeMap::new();
                for (i, item) in items.iter().enumerate() {
                    let key_value = self.closure(closure, item, i as i64, None)?;
                    let key = map_key(&key_value, closure.span)?;
                    match groups.entry(key).or_insert_with(|| Value::Seq(Vec::new())) {
                        Value::Seq(bucket) => bucket.push(item.clone()),
                        _ => unreachable!("buckets are sequences"),
                    }
                }
                Ok(Value::Map(groups))
            }
            "reduce" => {
                let mut acc;
                let start;
                if let Some(init) = args.get(2) {
                    acc = self.eval(init)?;
                    start = 0;
                } else if items.is_empty() {
                    return Ok(Value::Nil);
                } else {
                    acc = items[0].clone();
                    start = 1;
                }
                for (i, item) in items.iter().enumerate().skip(start) {
                    acc = self.closure(closure, item, i as i64, Some(acc))?;
                }
                Ok(acc)
            }
            "filterMap" => {
                let transform = &args[2];
                let mut out = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if self.matches(closure, item, i as i64)? {
                        out.push(self.closure(transform, item, i as i64, None)?);
                    }
                }
                Ok(Value::Seq(out))
            }
            _ => Err(fail(format!("unknown builtin {name}"), span)),
        }
    }
}

// ── Value operations ──────────────────────────────────────────────

/// Deep equality with int/float promotion.
pub(crate) fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        (Value::Seq(x), Value::Seq(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| value_eq(a, b))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y)
                    .all(|((ka, va), (kb, vb))| ka == kb && value_eq(va, vb))
        }
        _ => a == b,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn invalid_binop(op: BinaryOp, l: &Value, r: &Value, span: Span) -> Stop {
    fail(
        format!(
            "invalid operation: {} {op} {}",
            l.type_name(),
            r.type_name()
        ),
        span,
    )
}

fn arith_add(l: &Value, r: &Value, span: Span) -> EvalResult {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        _ => match (as_f64(l), as_f64(r)) {
            (Some(a), Some(b)) => Ok(Value::Float(a + b)),
            _ => Err(invalid_binop(BinaryOp::Add, l, r, span)),
        },
    }
}

fn arith(op: BinaryOp, l: &Value, r: &Value, span: Span) -> EvalResult {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        match op {
            BinaryOp::Sub => return Ok(Value::Int(a.wrapping_sub(*b))),
            BinaryOp::Mul => return Ok(Value::Int(a.wrapping_mul(*b))),
            BinaryOp::Mod => {
                if *b == 0 {
                    return Err(fail("integer divide by zero", span));
                }
                return Ok(Value::Int(a.wrapping_rem(*b)));
            }
            // Division and power fall through to float arithmetic.
            _ => {}
        }
    }
    match (as_f64(l), as_f64(r)) {
        (Some(a), Some(b)) => match op {
            BinaryOp::Sub => Ok(Value::Float(a - b)),
            BinaryOp::Mul => Ok(Value::Float(a * b)),
            BinaryOp::Div => Ok(Value::Float(a / b)),
            BinaryOp::Pow => Ok(Value::Float(a.powf(b))),
            BinaryOp::Mod => Err(fail(
                "invalid operation: % expects integer operands",
                span,
            )),
            _ => Err(invalid_binop(op, l, r, span)),
        },
        _ => Err(invalid_binop(op, l, r, span)),
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value, span: Span) -> EvalResult {
    if let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) {
        let result = match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => unreachable!("comparison operator"),
        };
        return Ok(Value::Bool(result));
    }
    if let (Value::String(a), Value::String(b)) = (l, r) {
        let ordering = a.cmp(b);
        let result = match op {
            BinaryOp::Lt => ordering == Ordering::Less,
            BinaryOp::Le => ordering != Ordering::Greater,
            BinaryOp::Gt => ordering == Ordering::Greater,
            BinaryOp::Ge => ordering != Ordering::Less,
            _ => unreachable!("comparison operator"),
        };
        return Ok(Value::Bool(result));
    }
    Err(invalid_binop(op, l, r, span))
}

fn membership(l: &Value, r: &Value, span: Span) -> EvalResult {
    match r {
        Value::Seq(items) => Ok(Value::Bool(items.iter().any(|item| value_eq(item, l)))),
        Value::Map(entries) => {
            let key = map_key(l, span)?;
            Ok(Value::Bool(entries.contains_key(&key)))
        }
        _ => Err(fail(
            format!(
                "invalid operation: {} in {}",
                l.type_name(),
                r.type_name()
            ),
            span,
        )),
    }
}

fn map_key(v: &Value, span: Span) -> Result<String, Stop> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(fail(
            format!("unsupported map key ({})", other.type_name()),
            span,
        )),
    }
}

fn fetch(receiver: &Value, property: &Value, span: Span) -> EvalResult {
    match (receiver, property) {
        (Value::Map(entries), _) => {
            let key = map_key(property, span)?;
            Ok(entries.get(&key).cloned().unwrap_or(Value::Nil))
        }
        (Value::Seq(items), Value::Int(index)) => {
            let n = items.len() as i64;
            let i = if *index < 0 { index + n } else { *index };
            if i < 0 || i >= n {
                Ok(Value::Nil)
            } else {
                Ok(items[i as usize].clone())
            }
        }
        (Value::String(s), Value::Int(index)) => {
            let chars: Vec<char> = s.chars().collect();
            let n = chars.len() as i64;
            let i = if *index < 0 { index + n } else { *index };
            if i < 0 || i >= n {
                Ok(Value::Nil)
            } else {
                Ok(Value::String(chars[i as usize].to_string()))
            }
        }
        (Value::Nil, _) => Err(fail(
            format!("cannot fetch {property} from nil"),
            span,
        )),
        _ => Err(fail(
            format!(
                "cannot fetch {property} from {}",
                receiver.type_name()
            ),
            span,
        )),
    }
}

fn slice(v: &Value, from: Option<i64>, to: Option<i64>, span: Span) -> EvalResult {
    fn bounds(len: usize, from: Option<i64>, to: Option<i64>) -> (usize, usize) {
        let n = len as i64;
        let norm = |x: i64| -> i64 {
            let x = if x < 0 { x + n } else { x };
            x.clamp(0, n)
        };
        let from = norm(from.unwrap_or(0));
        let to = norm(to.unwrap_or(n));
        if from >= to {
            (0, 0)
        } else {
            (from as usize, to as usize)
        }
    }

    match v {
        Value::Seq(items) => {
            let (from, to) = bounds(items.len(), from, to);
            Ok(Value::Seq(items[from..to].to_vec()))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (from, to) = bounds(chars.len(), from, to);
            Ok(Value::String(chars[from..to].iter().collect()))
        }
        other => Err(fail(
            format!("cannot slice {}", other.type_name()),
            span,
        )),
    }
}

// ── Generic builtins ──────────────────────────────────────────────

fn generic_builtin(name: &str, args: &[Value], span: Span) -> EvalResult {
    use Value::*;

    match (name, args) {
        ("len", [Seq(items)]) => Ok(Int(items.len() as i64)),
        ("len", [Map(entries)]) => Ok(Int(entries.len() as i64)),
        ("len", [String(s)]) => Ok(Int(s.chars().count() as i64)),

        ("first", [Seq(items)]) => Ok(items.first().cloned().unwrap_or(Nil)),
        ("last", [Seq(items)]) => Ok(items.last().cloned().unwrap_or(Nil)),

        ("keys", [Map(entries)]) => Ok(Seq(entries.keys().cloned().map(String).collect())),
        ("values", [Map(entries)]) => Ok(Seq(entries.values().cloned().collect())),

        ("sort", [Seq(items)]) => sort(items, span),
        ("reverse", [Seq(items)]) => Ok(Seq(items.iter().rev().cloned().collect())),

        ("sum", [Seq(items)]) => {
            let mut int_total: i64 = 0;
            let mut float_total = 0.0;
            let mut saw_float = false;
            for item in items {
                match item {
                    Int(v) => int_total = int_total.wrapping_add(*v),
                    Float(v) => {
                        saw_float = true;
                        float_total += v;
                    }
                    other => {
                        return Err(fail(
                            format!("sum expects numbers, got {}", other.type_name()),
                            span,
                        ))
                    }
                }
            }
            if saw_float {
                Ok(Float(float_total + int_total as f64))
            } else {
                Ok(Int(int_total))
            }
        }

        ("min", [Seq(items)]) => extremum(items, Ordering::Less, span),
        ("max", [Seq(items)]) => extremum(items, Ordering::Greater, span),
        ("min", rest) if rest.len() >= 2 => extremum(rest, Ordering::Less, span),
        ("max", rest) if rest.len() >= 2 => extremum(rest, Ordering::Greater, span),

        ("indexOf", [String(s), String(sub)]) => Ok(Int(match s.find(sub.as_str()) {
            Some(byte_index) => s[..byte_index].chars().count() as i64,
            None => -1,
        })),
        ("indexOf", [Seq(items), needle]) => Ok(Int(
            items
                .iter()
                .position(|item| value_eq(item, needle))
                .map_or(-1, |i| i as i64),
        )),

        ("join", [Seq(items)]) => join(items, "", span),
        ("join", [Seq(items), String(sep)]) => join(items, sep, span),

        ("split", [String(s), String(sep)]) => {
            if sep.is_empty() {
                Ok(Seq(s.chars().map(|c| String(c.to_string())).collect()))
            } else {
                Ok(Seq(s.split(sep.as_str()).map(|p| String(p.to_string())).collect()))
            }
        }

        ("trim", [String(s)]) => Ok(String(s.trim().to_string())),
        ("trim", [String(s), String(chars)]) => Ok(String(
            s.trim_matches(|c| chars.contains(c)).to_string(),
        )),
        ("trimPrefix", [String(s), String(p)]) => Ok(String(
            s.strip_prefix(p.as_str()).unwrap_or(s).to_string(),
        )),
        ("trimSuffix", [String(s), String(p)]) => Ok(String(
            s.strip_suffix(p.as_str()).unwrap_or(s).to_string(),
        )),
        ("upper", [String(s)]) => Ok(String(s.to_uppercase())),
        ("lower", [String(s)]) => Ok(String(s.to_lowercase())),
        ("hasPrefix", [String(s), String(p)]) => Ok(Bool(s.starts_with(p.as_str()))),
        ("hasSuffix", [String(s), String(p)]) => Ok(Bool(s.ends_with(p.as_str()))),

        ("abs", [Int(v)]) => Ok(Int(v.wrapping_abs())),
        ("abs", [Float(v)]) => Ok(Float(v.abs())),
        ("ceil", [v]) => float_fn(v, f64::ceil, span),
        ("floor", [v]) => float_fn(v, f64::floor, span),
        ("round", [v]) => float_fn(v, f64::round, span),

        ("int", [Int(v)]) => Ok(Int(*v)),
        ("int", [Float(v)]) => Ok(Int(*v as i64)),
        ("int", [String(s)]) => s
            .trim()
            .parse::<i64>()
            .map(Int)
            .map_err(|_| fail(format!("cannot convert {s:?} to int"), span)),
        ("float", [Int(v)]) => Ok(Float(*v as f64)),
        ("float", [Float(v)]) => Ok(Float(*v)),
        ("float", [String(s)]) => s
            .trim()
            .parse::<f64>()
            .map(Float)
            .map_err(|_| fail(format!("cannot convert {s:?} to float"), span)),

        ("string", [v]) => Ok(String(v.to_string())),
        ("type", [v]) => Ok(String(v.type_name().to_string())),

        _ => {
            if let Some(b) = crate::builtins::lookup_builtin(name) {
                if args.len() < b.min_args || args.len() > b.max_args {
                    return Err(fail(
                        format!("invalid number of arguments for {name}"),
                        span,
                    ));
                }
                Err(fail(
                    format!(
                        "invalid argument for {name} ({})",
                        args.first().map_or("none", |v| v.type_name())
                    ),
                    span,
                ))
            } else {
                Err(fail(format!("unknown builtin {name}"), span))
            }
        }
    }
}

fn float_fn(v: &Value, f: fn(f64) -> f64, span: Span) -> EvalResult {
    match as_f64(v) {
        Some(x) => Ok(Value::Float(f(x))),
        None => Err(fail(
            format!("expected a number, got {}", v.type_name()),
            span,
        )),
    }
}

fn join(items: &[Value], sep: &str, span: Span) -> EvalResult {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(s) => parts.push(s.clone()),
            other => {
                return Err(fail(
                    format!("join expects strings, got {}", other.type_name()),
                    span,
                ))
            }
        }
    }
    Ok(Value::String(parts.join(sep)))
}

fn sort(items: &[Value], span: Span) -> EvalResult {
    if items.iter().all(|v| matches!(v, Value::Int(_) | Value::Float(_))) {
        let mut out = items.to_vec();
        out.sort_by(|a, b| {
            as_f64(a)
                .unwrap_or(f64::NAN)
                .total_cmp(&as_f64(b).unwrap_or(f64::NAN))
        });
        return Ok(Value::Seq(out));
    }
    if items.iter().all(|v| matches!(v, Value::String(_))) {
        let mut out = items.to_vec();
        out.sort_by(|a, b| match (a, b) {
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ => Ordering::Equal,
        });
        return Ok(Value::Seq(out));
    }
    Err(fail("sort expects all numbers or all strings", span))
}

/// The extremum of a homogeneous numeric or string sequence.
fn extremum(items: &[Value], keep: Ordering, span: Span) -> EvalResult {
    let mut best: Option<Value> = None;
    for item in items {
        let better = match (&best, item) {
            (None, _) => true,
            (Some(b), v) => match (as_f64(b), as_f64(v)) {
                (Some(x), Some(y)) => y.total_cmp(&x) == keep,
                _ => match (b, v) {
                    (Value::String(x), Value::String(y)) => y.cmp(x) == keep,
                    _ => {
                        return Err(fail(
                            "min/max expects all numbers or all strings",
                            span,
                        ))
                    }
                },
            },
        };
        if better {
            best = Some(item.clone());
        }
    }
    best.ok_or_else(|| fail("min/max of an empty array", span))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::optimizer;
    use crate::parser;
    use crate::Config;

    fn run_env(src: &str, env: &Environment) -> Value {
        let config = Config::default();
        let mut node = parser::parse(lex(src).unwrap(), &config).unwrap();
        optimizer::optimize(&mut node, &config).unwrap();
        eval(&node, env).unwrap()
    }

    fn run(src: &str) -> Value {
        run_env(src, &Environment::new())
    }

    fn run_err(src: &str) -> RuntimeError {
        let config = Config::default();
        let mut node = parser::parse(lex(src).unwrap(), &config).unwrap();
        optimizer::optimize(&mut node, &config).unwrap();
        eval(&node, &Environment::new()).unwrap_err()
    }

    /// Evaluate without the optimizer, for equivalence checks.
    fn run_unoptimized(src: &str, env: &Environment) -> Value {
        let config = Config::default();
        let node = parser::parse(lex(src).unwrap(), &config).unwrap();
        eval(&node, env).unwrap()
    }

    #[test]
    fn arithmetic() {
        assert_eq!(run("1 + 2 * 3"), Value::Int(7));
        assert_eq!(run("10 / 4"), Value::Float(2.5));
        assert_eq!(run("10 % 3"), Value::Int(1));
        assert_eq!(run("2 ** 10"), Value::Float(1024.0));
        assert_eq!(run("'a' + 'b'"), Value::String("ab".into()));
    }

    #[test]
    fn runtime_divide_by_zero() {
        let mut env = Environment::new();
        env.set("n", 0);
        let config = Config::default();
        let mut node = parser::parse(lex("10 % n").unwrap(), &config).unwrap();
        optimizer::optimize(&mut node, &config).unwrap();
        let err = eval(&node, &env).unwrap_err();
        assert_eq!(err.message, "integer divide by zero");
    }

    #[test]
    fn logic_is_strict_and_short_circuits() {
        assert_eq!(run("true && 1 < 2"), Value::Bool(true));
        assert_eq!(run("1 > 2 || true"), Value::Bool(true));
        // The right side of a short-circuit is never evaluated.
        let mut env = Environment::new();
        env.set("f", false);
        assert_eq!(run_env("f && missing > 1", &env), Value::Bool(false));
        // The `x && true` identity folds away; an unfoldable non-bool
        // operand is still rejected at runtime.
        assert!(run_err("1 && 1 < 2").message.contains("non-bool"));
    }

    #[test]
    fn comparisons() {
        assert_eq!(run("1 < 1.5"), Value::Bool(true));
        assert_eq!(run("'abc' < 'abd'"), Value::Bool(true));
        assert_eq!(run("2 >= 2"), Value::Bool(true));
        assert_eq!(run("1 == 1.0"), Value::Bool(true));
        assert_eq!(run("[1, 2] == [1, 2.0]"), Value::Bool(true));
        assert_eq!(run("nil == nil"), Value::Bool(true));
    }

    #[test]
    fn coalesce() {
        assert_eq!(run("nil ?? 1"), Value::Int(1));
        assert_eq!(run("2 ?? 1"), Value::Int(2));
        let mut env = Environment::new();
        env.set("user", Value::Map(BTreeMap::new()));
        assert_eq!(
            run_env("user.name ?? 'anonymous'", &env),
            Value::String("anonymous".into())
        );
    }

    #[test]
    fn conditionals() {
        assert_eq!(run("1 < 2 ? 'yes' : 'no'"), Value::String("yes".into()));
        assert_eq!(run("false ?: 'fallback'"), Value::String("fallback".into()));
        assert!(run_err("1 ? 2 : 3").message.contains("non-bool condition"));
    }

    #[test]
    fn let_bindings_shadow() {
        assert_eq!(run("let x = 2; x * x"), Value::Int(4));
        assert_eq!(run("let x = 1; let x = 2; x"), Value::Int(2));
        let mut env = Environment::new();
        env.set("x", 10);
        assert_eq!(run_env("let x = 1; x", &env), Value::Int(1));
    }

    #[test]
    fn unknown_variable_errors() {
        assert!(run_err("missing").message.contains("unknown variable missing"));
    }

    #[test]
    fn member_access() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"user": {"name": "Ada", "tags": ["x", "y"], "address": {"city": "London"}}}"#,
        )
        .unwrap();
        let env = Environment::from_json(&json);
        assert_eq!(run_env("user.name", &env), Value::String("Ada".into()));
        assert_eq!(run_env("user.tags[1]", &env), Value::String("y".into()));
        assert_eq!(run_env("user.tags[-1]", &env), Value::String("y".into()));
        assert_eq!(run_env("user.tags[9]", &env), Value::Nil);
        assert_eq!(run_env("user['name']", &env), Value::String("Ada".into()));
        assert_eq!(run_env("user.missing", &env), Value::Nil);
        assert_eq!(
            run_env("user.address.city", &env),
            Value::String("London".into())
        );
    }

    #[test]
    fn optional_chains_short_circuit() {
        let mut env = Environment::new();
        env.set("user", Value::Nil);
        assert_eq!(run_env("user?.name", &env), Value::Nil);
        assert_eq!(run_env("user?.address.city", &env), Value::Nil);
        assert_eq!(
            run_env("user?.address.city ?? 'unknown'", &env),
            Value::String("unknown".into())
        );
        // Without `?.` a nil receiver is an error.
        let err = {
            let config = Config::default();
            let mut node = parser::parse(lex("user.name").unwrap(), &config).unwrap();
            optimizer::optimize(&mut node, &config).unwrap();
            eval(&node, &env).unwrap_err()
        };
        assert!(err.message.contains("cannot fetch"), "{}", err.message);
    }

    #[test]
    fn string_indexing() {
        assert_eq!(run("'hello'[1]"), Value::String("e".into()));
        assert_eq!(run("'hello'[-1]"), Value::String("o".into()));
    }

    #[test]
    fn slices() {
        let mut env = Environment::new();
        env.set("xs", vec![1i64, 2, 3, 4, 5]);
        assert_eq!(
            run_env("xs[1:3]", &env),
            Value::Seq(vec![Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            run_env("xs[:2]", &env),
            Value::Seq(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            run_env("xs[3:]", &env),
            Value::Seq(vec![Value::Int(4), Value::Int(5)])
        );
        assert_eq!(run_env("xs[:]", &env).to_string(), "[1, 2, 3, 4, 5]");
        assert_eq!(
            run_env("xs[-2:]", &env),
            Value::Seq(vec![Value::Int(4), Value::Int(5)])
        );
        assert_eq!(run_env("xs[4:2]", &env), Value::Seq(Vec::new()));
        assert_eq!(run_env("xs[0:99]", &env).to_string(), "[1, 2, 3, 4, 5]");
        assert_eq!(run("'hello'[1:3]"), Value::String("el".into()));
    }

    #[test]
    fn membership_forms() {
        assert_eq!(run("2 in [1, 2, 3]"), Value::Bool(true));
        assert_eq!(run("5 in [1, 2, 3]"), Value::Bool(false));
        assert_eq!(run("'a' in {a: 1}"), Value::Bool(true));
        assert_eq!(run("3 in 1..5"), Value::Bool(true));
        assert_eq!(run("9 not in 1..5"), Value::Bool(true));
    }

    #[test]
    fn string_operators() {
        assert_eq!(run("'hello' contains 'ell'"), Value::Bool(true));
        assert_eq!(run("'hello' startsWith 'he'"), Value::Bool(true));
        assert_eq!(run("'hello' endsWith 'lo'"), Value::Bool(true));
        assert_eq!(run("'hello' matches '^h.*o$'"), Value::Bool(true));
        assert_eq!(run("'hello' not matches '^x'"), Value::Bool(true));
        assert!(run_err("'a' matches '['").message.contains("invalid regular expression"));
    }

    #[test]
    fn ranges_evaluate_inclusively() {
        assert_eq!(run("1..4").to_string(), "[1, 2, 3, 4]");
        assert_eq!(run("len(5..1)"), Value::Int(0));
    }

    #[test]
    fn predicate_builtins() {
        let mut env = Environment::new();
        env.set("xs", vec![1i64, 2, 3, 4]);
        assert_eq!(run_env("all(xs, # > 0)", &env), Value::Bool(true));
        assert_eq!(run_env("any(xs, # > 3)", &env), Value::Bool(true));
        assert_eq!(run_env("none(xs, # > 4)", &env), Value::Bool(true));
        assert_eq!(run_env("one(xs, # == 2)", &env), Value::Bool(true));
        assert_eq!(run_env("one(xs, # > 2)", &env), Value::Bool(false));
        assert_eq!(run_env("filter(xs, # % 2 == 0)", &env).to_string(), "[2, 4]");
        assert_eq!(run_env("map(xs, # * 10)", &env).to_string(), "[10, 20, 30, 40]");
        assert_eq!(run_env("count(xs, # > 1)", &env), Value::Int(3));
        assert_eq!(run_env("find(xs, # > 2)", &env), Value::Int(3));
        assert_eq!(run_env("findIndex(xs, # > 2)", &env), Value::Int(2));
        assert_eq!(run_env("findLast(xs, # > 2)", &env), Value::Int(4));
        assert_eq!(run_env("findLastIndex(xs, # > 2)", &env), Value::Int(3));
        assert_eq!(run_env("find(xs, # > 9)", &env), Value::Nil);
        assert_eq!(run_env("findIndex(xs, # > 9)", &env), Value::Int(-1));
    }

    #[test]
    fn reduce_forms() {
        assert_eq!(run("reduce(1..4, #acc + #)"), Value::Int(10));
        assert_eq!(run("reduce(1..4, #acc + #, 100)"), Value::Int(110));
        assert_eq!(run("reduce([], #acc + #)"), Value::Nil);
        assert_eq!(run("reduce([], #acc + #, 5)"), Value::Int(5));
    }

    #[test]
    fn pointer_index_binding() {
        assert_eq!(
            run("map([10, 20, 30], #index)").to_string(),
            "[0, 1, 2]"
        );
    }

    #[test]
    fn group_by() {
        let result = run("groupBy([1, 2, 3, 4], # % 2 == 0 ? 'even' : 'odd')");
        assert_eq!(result.to_string(), "{even: [2, 4], odd: [1, 3]}");
    }

    #[test]
    fn nested_closures_keep_inner_scope() {
        // The inner `#` refers to the inner closure's element.
        assert_eq!(
            run("map([1, 2], { filter([10, 20], # > 15) })").to_string(),
            "[[20], [20]]"
        );
    }

    #[test]
    fn pointer_member_access() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"users": [{"age": 16}, {"age": 21}, {"age": 30}]}"#).unwrap();
        let env = Environment::from_json(&json);
        assert_eq!(run_env("count(users, .age >= 18)", &env), Value::Int(2));
        assert_eq!(
            run_env("map(users, #.age * 2)", &env).to_string(),
            "[32, 42, 60]"
        );
    }

    #[test]
    fn fused_forms_match_unfused_semantics() {
        let mut env = Environment::new();
        env.set("xs", vec![1i64, 2, 3, 4, 5, 6]);
        for src in [
            "len(filter(xs, # > 2))",
            "first(filter(xs, # > 2))",
            "last(filter(xs, # > 2))",
            "map(filter(xs, # > 2), # * 2)",
            "filter(filter(xs, # > 1), # < 5)",
        ] {
            assert_eq!(
                run_env(src, &env),
                run_unoptimized(src, &env),
                "optimized and unoptimized disagree for {src}"
            );
        }
    }

    #[test]
    fn generic_builtins() {
        assert_eq!(run("len('héllo')"), Value::Int(5));
        assert_eq!(run("len([1, 2])"), Value::Int(2));
        assert_eq!(run("len({a: 1})"), Value::Int(1));
        assert_eq!(run("abs(-3)"), Value::Int(3));
        assert_eq!(run("abs(-3.5)"), Value::Float(3.5));
        assert_eq!(run("ceil(1.2)"), Value::Float(2.0));
        assert_eq!(run("floor(1.8)"), Value::Float(1.0));
        assert_eq!(run("round(1.5)"), Value::Float(2.0));
        assert_eq!(run("int('42')"), Value::Int(42));
        assert_eq!(run("int(3.9)"), Value::Int(3));
        assert_eq!(run("float('2.5')"), Value::Float(2.5));
        assert_eq!(run("string(42)"), Value::String("42".into()));
        assert_eq!(run("type([1])"), Value::String("array".into()));
        assert_eq!(run("upper('abc')"), Value::String("ABC".into()));
        assert_eq!(run("lower('ABC')"), Value::String("abc".into()));
        assert_eq!(run("trim('  x  ')"), Value::String("x".into()));
        assert_eq!(run("trim('--x--', '-')"), Value::String("x".into()));
        assert_eq!(run("trimPrefix('v1.2', 'v')"), Value::String("1.2".into()));
        assert_eq!(run("trimSuffix('a.rs', '.rs')"), Value::String("a".into()));
        assert_eq!(run("hasPrefix('abc', 'ab')"), Value::Bool(true));
        assert_eq!(run("hasSuffix('abc', 'bc')"), Value::Bool(true));
        assert_eq!(run("split('a,b,c', ',')").to_string(), "[a, b, c]");
        assert_eq!(run("join(['a', 'b'], '-')"), Value::String("a-b".into()));
        assert_eq!(run("indexOf('hello', 'll')"), Value::Int(2));
        assert_eq!(run("indexOf([1, 2, 3], 2)"), Value::Int(1));
        assert_eq!(run("indexOf([1, 2, 3], 9)"), Value::Int(-1));
        assert_eq!(run("keys({b: 1, a: 2})").to_string(), "[a, b]");
        assert_eq!(run("values({b: 1, a: 2})").to_string(), "[2, 1]");
        assert_eq!(run("first([1, 2])"), Value::Int(1));
        assert_eq!(run("last([1, 2])"), Value::Int(2));
        assert_eq!(run("first([])"), Value::Nil);
        assert_eq!(run("sum([1, 2, 3])"), Value::Int(6));
        assert_eq!(run("sum([1, 2.5])"), Value::Float(3.5));
        assert_eq!(run("min([3, 1, 2])"), Value::Int(1));
        assert_eq!(run("max(3, 1, 2)"), Value::Int(3));
        assert_eq!(run("sort([3, 1, 2])").to_string(), "[1, 2, 3]");
        assert_eq!(run("sort(['b', 'a'])").to_string(), "[a, b]");
        assert_eq!(run("reverse([1, 2, 3])").to_string(), "[3, 2, 1]");
    }

    #[test]
    fn builtin_argument_errors() {
        assert!(run_err("len(1)").message.contains("invalid argument for len"));
        assert!(run_err("len()").message.contains("invalid number of arguments"));
        assert!(run_err("sum(['a'])").message.contains("sum expects numbers"));
        assert!(run_err("join([1])").message.contains("join expects strings"));
    }

    #[test]
    fn environment_functions() {
        let mut env = Environment::new();
        env.set("x", 40);
        env.register_function("double", |args: &[Value]| match args {
            [Value::Int(v)] => Ok(Value::Int(v * 2)),
            _ => Err("double expects one integer".to_string()),
        });
        assert_eq!(run_env("double(x) + 4", &env), Value::Int(84));
        assert_eq!(run_env("x | double()", &env), Value::Int(80));
        let config = Config::default();
        let mut node = parser::parse(lex("double('no')").unwrap(), &config).unwrap();
        optimizer::optimize(&mut node, &config).unwrap();
        let err = eval(&node, &env).unwrap_err();
        assert_eq!(err.message, "double expects one integer");
    }

    #[test]
    fn unknown_function_errors() {
        assert!(run_err("nope(1)").message.contains("unknown function nope"));
    }

    #[test]
    fn member_calls_are_not_callable() {
        let json: serde_json::Value = serde_json::from_str(r#"{"a": {"b": 1}}"#).unwrap();
        let env = Environment::from_json(&json);
        let config = Config::default();
        let mut node = parser::parse(lex("a.b(1)").unwrap(), &config).unwrap();
        optimizer::optimize(&mut node, &config).unwrap();
        let err = eval(&node, &env).unwrap_err();
        assert!(err.message.contains("not callable"), "{}", err.message);
    }

    #[test]
    fn map_literals_evaluate() {
        assert_eq!(
            run("{a: 1, 'b c': 2, (1 + 1): 3}").to_string(),
            "{2: 3, a: 1, b c: 2}"
        );
    }

    #[test]
    fn in_specialization_still_answers_membership() {
        let mut env = Environment::new();
        env.set("x", 2);
        assert_eq!(run_env("x in [1, 2, 3]", &env), Value::Bool(true));
        assert_eq!(run_env("x in ['a', 'b']", &env), Value::Bool(false));
        assert_eq!(run_env("x in 1..10", &env), Value::Bool(true));
        assert_eq!(run_env("x in 5..10", &env), Value::Bool(false));
    }
}
