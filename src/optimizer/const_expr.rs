//! Pre-evaluation of user-declared pure functions.
//!
//! A call whose callee is a registered pure function and whose arguments
//! are all literals is executed during optimization and replaced by a
//! `Constant` node. Faults inside the callable never escape: a returned
//! error aborts the pass located at the call, and a panic is caught,
//! bound to the call, and reworded from a runtime to a compile error.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use crate::ast::{self, Node, NodeKind, Visitor};
use crate::error::CompileError;
use crate::value::{NativeFn, Value};

pub struct ConstExpr<'a> {
    pub applied: bool,
    pub err: Option<CompileError>,
    fns: &'a HashMap<String, NativeFn>,
}

impl<'a> ConstExpr<'a> {
    pub fn new(fns: &'a HashMap<String, NativeFn>) -> Self {
        Self {
            applied: false,
            err: None,
            fns,
        }
    }
}

impl Visitor for ConstExpr<'_> {
    fn visit(&mut self, node: &mut Node) -> bool {
        if self.err.is_some() {
            return false;
        }

        let f = {
            let NodeKind::Call { callee, .. } = &node.kind else {
                return false;
            };
            let NodeKind::Identifier(name) = &callee.kind else {
                return false;
            };
            match self.fns.get(name) {
                Some(f) => f.clone(),
                None => return false,
            }
        };

        let params = {
            let NodeKind::Call { args, .. } = &node.kind else {
                return false;
            };
            let mut params = Vec::with_capacity(args.len());
            for arg in args {
                let value = match &arg.kind {
                    NodeKind::Nil => Value::Nil,
                    NodeKind::Bool(b) => Value::Bool(*b),
                    NodeKind::Integer(v) => Value::Int(*v),
                    NodeKind::Float(v) => Value::Float(*v),
                    NodeKind::String(s) => Value::String(s.clone()),
                    NodeKind::Constant(v) => v.clone(),
                    // A non-literal argument leaves the call untouched.
                    _ => return false,
                };
                params.push(value);
            }
            params
        };

        let span = node.span;
        match panic::catch_unwind(AssertUnwindSafe(|| f(&params))) {
            Ok(Ok(value)) => {
                self.applied = true;
                ast::patch(node, Node::bare(NodeKind::Constant(value)));
                true
            }
            Ok(Err(message)) => {
                self.err = Some(CompileError::const_eval(message, span));
                false
            }
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "panic during constant evaluation".to_string()
                };
                let message = message.replacen("runtime error:", "compile error:", 1);
                self.err = Some(CompileError::const_eval(message, span));
                false
            }
        }
    }
}
