//! Constant folding.
//!
//! Applies the first matching rule per node and records whether any
//! patch landed; the driver re-walks to fixpoint. Literal-producing
//! rewrites annotate the node's inferred static type.

use crate::ast::{self, Node, NodeKind, Visitor};
use crate::error::CompileError;
use crate::operator::{BinaryOp, UnaryOp};
use crate::value::Value;

#[derive(Default)]
pub struct Fold {
    pub applied: bool,
    pub err: Option<CompileError>,
}

impl Visitor for Fold {
    fn visit(&mut self, node: &mut Node) -> bool {
        if self.err.is_some() {
            return false;
        }
        match &node.kind {
            NodeKind::Unary { .. } => self.fold_unary(node),
            NodeKind::Binary { .. } => self.fold_binary(node),
            NodeKind::Array(_) => self.fold_array(node),
            NodeKind::Builtin { .. } => self.fold_filter(node),
            _ => false,
        }
    }
}

fn int(v: i64) -> Node {
    Node::bare(NodeKind::Integer(v))
}

fn float(v: f64) -> Node {
    Node::bare(NodeKind::Float(v))
}

fn boolean(v: bool) -> Node {
    Node::bare(NodeKind::Bool(v))
}

impl Fold {
    fn patch(&mut self, node: &mut Node, mut new: Node) -> bool {
        self.applied = true;
        if let Some(ty) = ast::static_type_of(&new.kind) {
            new.ty = Some(ty);
        }
        ast::patch(node, new);
        true
    }

    fn fold_unary(&mut self, node: &mut Node) -> bool {
        let new = match &node.kind {
            NodeKind::Unary { op, operand } => match op {
                UnaryOp::Neg => match operand.kind {
                    NodeKind::Integer(v) => Some(int(v.wrapping_neg())),
                    NodeKind::Float(v) => Some(float(-v)),
                    _ => None,
                },
                // `+x` folds to `x` so the literal picks up its type tag.
                UnaryOp::Pos => match operand.kind {
                    NodeKind::Integer(v) => Some(int(v)),
                    NodeKind::Float(v) => Some(float(v)),
                    _ => None,
                },
                UnaryOp::Not => operand.as_bool().map(|b| boolean(!b)),
            },
            _ => None,
        };
        match new {
            Some(new) => self.patch(node, new),
            None => false,
        }
    }

    fn fold_binary(&mut self, node: &mut Node) -> bool {
        let span = node.span;
        let new = match &node.kind {
            NodeKind::Binary { op, left, right } => match op {
                BinaryOp::Add => {
                    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
                        Some(int(a.wrapping_add(b)))
                    } else if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
                        Some(float(a + b))
                    } else if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
                        Some(Node::bare(NodeKind::String(format!("{a}{b}"))))
                    } else {
                        None
                    }
                }
                BinaryOp::Sub => {
                    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
                        Some(int(a.wrapping_sub(b)))
                    } else if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
                        Some(float(a - b))
                    } else {
                        None
                    }
                }
                BinaryOp::Mul => {
                    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
                        Some(int(a.wrapping_mul(b)))
                    } else if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
                        Some(float(a * b))
                    } else {
                        None
                    }
                }
                // Division is float even for two integers.
                BinaryOp::Div => match (left.as_number(), right.as_number()) {
                    (Some(a), Some(b)) => Some(float(a / b)),
                    _ => None,
                },
                BinaryOp::Mod => match (&left.kind, &right.kind) {
                    (NodeKind::Integer(_), NodeKind::Integer(0)) => {
                        self.err = Some(CompileError::fold("integer divide by zero", span));
                        None
                    }
                    (NodeKind::Integer(a), NodeKind::Integer(b)) => Some(int(a.wrapping_rem(*b))),
                    _ => None,
                },
                BinaryOp::Pow => match (left.as_number(), right.as_number()) {
                    (Some(a), Some(b)) => Some(float(a.powf(b))),
                    _ => None,
                },
                // Short-circuit identities apply with a single literal
                // side.
                BinaryOp::And => {
                    let a = left.as_bool();
                    let b = right.as_bool();
                    if a == Some(true) {
                        Some((**right).clone())
                    } else if b == Some(true) {
                        Some((**left).clone())
                    } else if a == Some(false) || b == Some(false) {
                        Some(boolean(false))
                    } else {
                        None
                    }
                }
                BinaryOp::Or => {
                    let a = left.as_bool();
                    let b = right.as_bool();
                    if a == Some(false) {
                        Some((**right).clone())
                    } else if b == Some(false) {
                        Some((**left).clone())
                    } else if a == Some(true) || b == Some(true) {
                        Some(boolean(true))
                    } else {
                        None
                    }
                }
                // Only `==` folds, and only on int, string, and bool
                // literal pairs.
                BinaryOp::Eq => {
                    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
                        Some(boolean(a == b))
                    } else if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
                        Some(boolean(a == b))
                    } else if let (Some(a), Some(b)) = (left.as_bool(), right.as_bool()) {
                        Some(boolean(a == b))
                    } else {
                        None
                    }
                }
                _ => None,
            },
            _ => None,
        };
        match new {
            Some(new) => self.patch(node, new),
            None => false,
        }
    }

    /// An array of nothing but literals becomes one constant sequence.
    fn fold_array(&mut self, node: &mut Node) -> bool {
        let new = match &node.kind {
            NodeKind::Array(items) if !items.is_empty() => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match &item.kind {
                        NodeKind::Bool(b) => values.push(Value::Bool(*b)),
                        NodeKind::Integer(v) => values.push(Value::Int(*v)),
                        NodeKind::Float(v) => values.push(Value::Float(*v)),
                        NodeKind::String(s) => values.push(Value::String(s.clone())),
                        _ => return false,
                    }
                }
                Some(Node::bare(NodeKind::Constant(Value::Seq(values))))
            }
            _ => None,
        };
        match new {
            Some(new) => self.patch(node, new),
            None => false,
        }
    }

    /// `filter(filter(s, P), Q)` fuses to `filter(s, P && Q)` with the
    /// predicates merged inside a single closure.
    fn fold_filter(&mut self, node: &mut Node) -> bool {
        let new = match &node.kind {
            NodeKind::Builtin { name, args } if name == "filter" && args.len() == 2 => {
                match &args[0].kind {
                    NodeKind::Builtin {
                        name: inner_name,
                        args: inner_args,
                    } if inner_name == "filter" && inner_args.len() == 2 => {
                        let combined = Node::new(
                            NodeKind::Binary {
                                op: BinaryOp::And,
                                left: Box::new(closure_body(&inner_args[1])),
                                right: Box::new(closure_body(&args[1])),
                            },
                            args[1].span,
                        );
                        let predicate =
                            Node::new(NodeKind::Closure(Box::new(combined)), args[1].span);
                        Some(Node::bare(NodeKind::Builtin {
                            name: "filter".to_string(),
                            args: vec![inner_args[0].clone(), predicate],
                        }))
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        match new {
            Some(new) => self.patch(node, new),
            None => false,
        }
    }
}

fn closure_body(node: &Node) -> Node {
    match &node.kind {
        NodeKind::Closure(body) => (**body).clone(),
        _ => node.clone(),
    }
}
