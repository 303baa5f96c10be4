//! Peephole specialization passes.
//!
//! Each pass is a single walk matching one node shape. The rewritten
//! forms are part of the evaluator contract: membership over a prebuilt
//! constant sequence, bounded range comparisons, and fused
//! filter-consuming builtins that never build the intermediate list.

use crate::ast::{self, Node, NodeKind, Visitor};
use crate::operator::BinaryOp;
use crate::value::Value;

/// Largest range materialized into a constant sequence; anything bigger
/// stays a runtime range.
const MAX_CONST_RANGE: i64 = 1_000;

/// `x in [literals…]` becomes an `in` intrinsic over one constant
/// sequence, so evaluation tests membership without rebuilding the
/// array. Only integer and string elements qualify (hashable keys).
pub struct InArray;

impl Visitor for InArray {
    fn visit(&mut self, node: &mut Node) -> bool {
        let new = match &node.kind {
            NodeKind::Binary {
                op: BinaryOp::In,
                left,
                right,
            } => match &right.kind {
                NodeKind::Array(items)
                    if !items.is_empty()
                        && items.iter().all(|i| {
                            matches!(i.kind, NodeKind::Integer(_) | NodeKind::String(_))
                        }) =>
                {
                    let values = items
                        .iter()
                        .map(|i| match &i.kind {
                            NodeKind::Integer(v) => Value::Int(*v),
                            NodeKind::String(s) => Value::String(s.clone()),
                            _ => unreachable!("filtered above"),
                        })
                        .collect();
                    let constant =
                        Node::new(NodeKind::Constant(Value::Seq(values)), right.span);
                    Some(Node::bare(NodeKind::Builtin {
                        name: "in".to_string(),
                        args: vec![(**left).clone(), constant],
                    }))
                }
                _ => None,
            },
            _ => None,
        };
        patch_if(node, new)
    }
}

/// `x in a..b` with literal endpoints becomes `x >= a && x <= b`. The
/// operand is duplicated, so the rewrite fires only where a second
/// evaluation is free.
pub struct InRange;

impl Visitor for InRange {
    fn visit(&mut self, node: &mut Node) -> bool {
        let new = match &node.kind {
            NodeKind::Binary {
                op: BinaryOp::In,
                left,
                right,
            } if is_cheap(left) => match &right.kind {
                NodeKind::Binary {
                    op: BinaryOp::Range,
                    left: from,
                    right: to,
                } if matches!(from.kind, NodeKind::Integer(_))
                    && matches!(to.kind, NodeKind::Integer(_)) =>
                {
                    let ge = Node::new(
                        NodeKind::Binary {
                            op: BinaryOp::Ge,
                            left: left.clone(),
                            right: from.clone(),
                        },
                        from.span,
                    );
                    let le = Node::new(
                        NodeKind::Binary {
                            op: BinaryOp::Le,
                            left: left.clone(),
                            right: to.clone(),
                        },
                        to.span,
                    );
                    Some(Node::bare(NodeKind::Binary {
                        op: BinaryOp::And,
                        left: Box::new(ge),
                        right: Box::new(le),
                    }))
                }
                _ => None,
            },
            _ => None,
        };
        patch_if(node, new)
    }
}

/// `a..b` with literal endpoints materializes into a constant sequence,
/// within the size bound.
pub struct ConstRange;

impl Visitor for ConstRange {
    fn visit(&mut self, node: &mut Node) -> bool {
        let new = match &node.kind {
            NodeKind::Binary {
                op: BinaryOp::Range,
                left,
                right,
            } => match (left.as_int(), right.as_int()) {
                (Some(a), Some(b))
                    if b >= a && matches!(b.checked_sub(a), Some(n) if n < MAX_CONST_RANGE) =>
                {
                    Some(Node::bare(NodeKind::Constant(Value::Seq(
                        (a..=b).map(Value::Int).collect(),
                    ))))
                }
                _ => None,
            },
            _ => None,
        };
        patch_if(node, new)
    }
}

/// `map(filter(s, P), T)` fuses into a dedicated builtin that filters
/// and transforms in one sweep.
pub struct FilterMap;

impl Visitor for FilterMap {
    fn visit(&mut self, node: &mut Node) -> bool {
        let new = match &node.kind {
            NodeKind::Builtin { name, args } if name == "map" && args.len() == 2 => {
                match &args[0].kind {
                    NodeKind::Builtin {
                        name: inner,
                        args: inner_args,
                    } if inner == "filter" && inner_args.len() == 2 => {
                        Some(Node::bare(NodeKind::Builtin {
                            name: "filterMap".to_string(),
                            args: vec![
                                inner_args[0].clone(),
                                inner_args[1].clone(),
                                args[1].clone(),
                            ],
                        }))
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        patch_if(node, new)
    }
}

/// `len(filter(s, P))` counts matches directly.
pub struct FilterLen;

impl Visitor for FilterLen {
    fn visit(&mut self, node: &mut Node) -> bool {
        patch_if(node, fuse_filter(node, "len", "count"))
    }
}

/// `last(filter(s, P))` scans from the back.
pub struct FilterLast;

impl Visitor for FilterLast {
    fn visit(&mut self, node: &mut Node) -> bool {
        patch_if(node, fuse_filter(node, "last", "findLast"))
    }
}

/// `first(filter(s, P))` stops at the first match.
pub struct FilterFirst;

impl Visitor for FilterFirst {
    fn visit(&mut self, node: &mut Node) -> bool {
        patch_if(node, fuse_filter(node, "first", "find"))
    }
}

fn fuse_filter(node: &Node, outer: &str, fused: &str) -> Option<Node> {
    let NodeKind::Builtin { name, args } = &node.kind else {
        return None;
    };
    if name != outer || args.len() != 1 {
        return None;
    }
    let NodeKind::Builtin {
        name: inner,
        args: inner_args,
    } = &args[0].kind
    else {
        return None;
    };
    if inner != "filter" || inner_args.len() != 2 {
        return None;
    }
    Some(Node::bare(NodeKind::Builtin {
        name: fused.to_string(),
        args: vec![inner_args[0].clone(), inner_args[1].clone()],
    }))
}

fn is_cheap(node: &Node) -> bool {
    matches!(
        node.kind,
        NodeKind::Nil
            | NodeKind::Bool(_)
            | NodeKind::Integer(_)
            | NodeKind::Float(_)
            | NodeKind::String(_)
            | NodeKind::Constant(_)
            | NodeKind::Identifier(_)
            | NodeKind::Pointer(_)
    )
}

fn patch_if(node: &mut Node, new: Option<Node>) -> bool {
    match new {
        Some(new) => {
            ast::patch(node, new);
            true
        }
        None => false,
    }
}
