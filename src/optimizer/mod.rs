//! Optimizer driver: rewrite passes in a fixed order.
//!
//! Pipeline: `inArray`, constant folding to fixpoint, pure-function
//! pre-evaluation to fixpoint, then the single-shot specializations.
//! The fixpoint caps are a guard against oscillating rewrites; a
//! well-behaved pass shrinks the tree monotonically and converges in a
//! handful of walks.

mod const_expr;
mod fold;
mod specialize;

use tracing::debug;

use crate::ast::{walk, Node};
use crate::error::CompileError;
use crate::Config;

use const_expr::ConstExpr;
use fold::Fold;
use specialize::{ConstRange, FilterFirst, FilterLast, FilterLen, FilterMap, InArray, InRange};

/// Rewrite `node` in place. The first error aborts the whole call.
pub fn optimize(node: &mut Node, config: &Config) -> Result<(), CompileError> {
    walk(node, &mut InArray);

    for pass in 0..=1000 {
        let mut fold = Fold::default();
        walk(node, &mut fold);
        if let Some(err) = fold.err {
            return Err(err);
        }
        if !fold.applied {
            debug!(passes = pass, "constant folding reached fixpoint");
            break;
        }
    }

    if !config.const_fns.is_empty() {
        for pass in 0..=100 {
            let mut const_expr = ConstExpr::new(&config.const_fns);
            walk(node, &mut const_expr);
            if let Some(err) = const_expr.err {
                return Err(err);
            }
            if !const_expr.applied {
                debug!(passes = pass, "constant calls reached fixpoint");
                break;
            }
        }
    }

    walk(node, &mut InRange);
    walk(node, &mut ConstRange);
    walk(node, &mut FilterMap);
    walk(node, &mut FilterLen);
    walk(node, &mut FilterLast);
    walk(node, &mut FilterFirst);
    Ok(())
}
