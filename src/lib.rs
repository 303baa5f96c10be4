//! rill, an embeddable expression language.
//!
//! A small, dynamically-typed DSL for business rules, feature flags, and
//! configuration predicates. Source strings run through a fixed
//! pipeline: lex → parse → optimize → evaluate against an
//! [`Environment`].
//!
//! ```
//! use rill::{Environment, Value};
//!
//! let mut env = Environment::new();
//! env.set("age", 21);
//! let result = rill::eval("age >= 18 ? 'adult' : 'minor'", &env).unwrap();
//! assert_eq!(result, Value::String("adult".into()));
//! ```

pub mod ast;
pub mod builtins;
pub mod error;
pub mod lexer;
pub mod operator;
pub mod optimizer;
pub mod parser;
pub mod value;
pub mod vm;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

pub use ast::{Node, Span};
pub use error::{CompileError, Error, ErrorKind, RuntimeError};
pub use value::{Environment, NativeFn, Value};

/// Compilation options.
#[derive(Default, Clone)]
pub struct Config {
    /// Builtin names hidden from the parser; calls to them resolve as
    /// user functions instead.
    pub disabled: HashSet<String>,
    /// Pure functions the optimizer may pre-evaluate when every argument
    /// is constant.
    pub const_fns: HashMap<String, NativeFn>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable(mut self, name: impl Into<String>) -> Self {
        self.disabled.insert(name.into());
        self
    }

    pub fn const_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.const_fns.insert(name.into(), Arc::new(f));
        self
    }
}

/// A compiled expression ready for repeated evaluation. Holds the
/// (optimized) AST and the source it was built from, for diagnostics.
#[derive(Debug, Clone)]
pub struct Program {
    node: Node,
    source: String,
}

impl Program {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn run(&self, env: &Environment) -> Result<Value, RuntimeError> {
        vm::eval(&self.node, env)
    }
}

/// Lex and parse without optimizing.
pub fn parse(source: &str) -> Result<Program, CompileError> {
    let tokens = lexer::lex(source)?;
    let node = parser::parse(tokens, &Config::default())?;
    Ok(Program {
        node,
        source: source.to_string(),
    })
}

/// Compile with the default configuration.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    compile_with(source, &Config::default())
}

/// Compile: lex, parse, and run every optimizer pass.
pub fn compile_with(source: &str, config: &Config) -> Result<Program, CompileError> {
    let tokens = lexer::lex(source)?;
    let mut node = parser::parse(tokens, config)?;
    optimizer::optimize(&mut node, config)?;
    debug!(len = source.len(), "compiled expression");
    Ok(Program {
        node,
        source: source.to_string(),
    })
}

/// One-shot: compile with the default configuration and evaluate.
pub fn eval(source: &str, env: &Environment) -> Result<Value, Error> {
    let program = compile(source)?;
    Ok(program.run(env)?)
}
