//! Pratt-style operator-precedence parser.
//!
//! State is a flat token array with a cursor and a sticky first-error
//! slot: after an error the parser keeps consuming tokens but records
//! nothing further, so the reported error stays closest to the true
//! cause instead of cascading.

use crate::ast::{Node, NodeKind, Span};
use crate::builtins;
use crate::error::CompileError;
use crate::lexer::{is_valid_identifier, Token, TokenKind};
use crate::operator::{self, Assoc, BinaryOp, UnaryOp};
use crate::Config;

/// Parse a token sequence into an AST. The sequence must end with an
/// `Eof` token; anything left over after one expression is an error.
pub fn parse(tokens: Vec<Token>, config: &Config) -> Result<Node, CompileError> {
    let mut parser = Parser::new(tokens, config);
    let node = parser.parse_expression(0);

    if !parser.current().is(TokenKind::Eof) {
        let token = parser.current().clone();
        parser.error(format!("unexpected token {token}"), token.span);
    }

    match parser.err {
        Some(err) => Err(err),
        None => Ok(node),
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    /// Sticky: only the earliest error is retained.
    err: Option<CompileError>,
    /// Closure nesting depth; pointer accessors are legal only above 0.
    depth: u32,
    config: &'a Config,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, config: &'a Config) -> Self {
        debug_assert!(matches!(tokens.last(), Some(t) if t.is(TokenKind::Eof)));
        Self {
            tokens,
            pos: 0,
            err: None,
            depth: 0,
            config,
        }
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn error(&mut self, message: impl Into<String>, span: Span) {
        if self.err.is_none() {
            self.err = Some(CompileError::parser(message, span));
        }
    }

    fn next(&mut self) {
        if self.pos + 1 >= self.tokens.len() {
            let span = self.current().span;
            self.error("unexpected end of expression", span);
            return;
        }
        self.pos += 1;
    }

    fn expect(&mut self, kind: TokenKind, value: &str) {
        if self.current().is_value(kind, value) {
            self.next();
            return;
        }
        let token = self.current().clone();
        self.error(format!("unexpected token {token}"), token.span);
    }

    fn expect_kind(&mut self, kind: TokenKind) {
        if self.current().is(kind) {
            self.next();
            return;
        }
        let token = self.current().clone();
        self.error(format!("unexpected token {token}"), token.span);
    }

    // ── Expressions ───────────────────────────────────────────────

    fn parse_expression(&mut self, precedence: u16) -> Node {
        if precedence == 0 && self.current().is_value(TokenKind::Operator, "let") {
            return self.parse_variable_declaration();
        }

        let mut node_left = self.parse_primary();

        let mut prev_coalesce = false;
        while self.current().is(TokenKind::Operator) && self.err.is_none() {
            let mut negate = false;
            let mut not_span = Span::default();
            let mut op_token = self.current().clone();

            // Compound prefix: `not in`, `not contains`, ...
            if op_token.is_value(TokenKind::Operator, "not") {
                self.next();
                not_span = self.current().span;
                negate = true;
                op_token = self.current().clone();
            }

            // The pipe binds at precedence 0 and is pure sugar; it never
            // reaches the AST.
            if op_token.is_value(TokenKind::Operator, "|") {
                if precedence > 0 {
                    break;
                }
                self.next();
                node_left = self.parse_pipe(node_left);
                prev_coalesce = false;
                continue;
            }

            let Some(info) = operator::binary(&op_token.value) else {
                break;
            };
            if info.precedence < precedence {
                break;
            }
            self.next();

            if prev_coalesce && info.op != BinaryOp::Coalesce {
                self.error(
                    format!(
                        "Operator ({}) and coalesce expressions (??) cannot be mixed. \
                         Wrap either by parentheses.",
                        op_token.value
                    ),
                    op_token.span,
                );
                break;
            }

            let node_right = match info.assoc {
                Assoc::Left => self.parse_expression(info.precedence + 1),
                Assoc::Right => self.parse_expression(info.precedence),
            };

            let mut node = Node::new(
                NodeKind::Binary {
                    op: info.op,
                    left: Box::new(node_left),
                    right: Box::new(node_right),
                },
                op_token.span,
            );
            if negate {
                node = Node::new(
                    NodeKind::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(node),
                    },
                    not_span,
                );
            }
            node_left = node;
            prev_coalesce = info.op == BinaryOp::Coalesce;
        }

        if precedence == 0 {
            node_left = self.parse_conditional(node_left);
        }

        node_left
    }

    fn parse_variable_declaration(&mut self) -> Node {
        self.expect(TokenKind::Operator, "let");
        let name_token = self.current().clone();
        self.expect_kind(TokenKind::Identifier);
        self.expect(TokenKind::Operator, "=");
        let value = self.parse_expression(0);
        self.expect(TokenKind::Operator, ";");
        let body = self.parse_expression(0);
        Node::new(
            NodeKind::VariableDeclarator {
                name: name_token.value,
                value: Box::new(value),
                body: Box::new(body),
            },
            name_token.span,
        )
    }

    /// Ternaries, including the Elvis form `a ?: b`. Right-associative
    /// by the loop structure.
    fn parse_conditional(&mut self, mut node: Node) -> Node {
        while self.current().is_value(TokenKind::Operator, "?") && self.err.is_none() {
            let question_span = self.current().span;
            self.next();

            if !self.current().is_value(TokenKind::Operator, ":") {
                let then = self.parse_expression(0);
                self.expect(TokenKind::Operator, ":");
                let otherwise = self.parse_expression(0);
                node = Node::new(
                    NodeKind::Conditional {
                        cond: Box::new(node),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                    question_span,
                );
            } else {
                self.next();
                let otherwise = self.parse_expression(0);
                let then = node.clone();
                node = Node::new(
                    NodeKind::Conditional {
                        cond: Box::new(node),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                    question_span,
                );
            }
        }
        node
    }

    fn parse_primary(&mut self) -> Node {
        let token = self.current().clone();

        if token.is(TokenKind::Operator) {
            if let Some((op, precedence)) = operator::unary(&token.value) {
                self.next();
                let operand = self.parse_expression(precedence);
                let node = Node::new(
                    NodeKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    token.span,
                );
                return self.parse_postfix(node);
            }
        }

        if token.is_value(TokenKind::Bracket, "(") {
            self.next();
            let node = self.parse_expression(0);
            self.expect(TokenKind::Bracket, ")");
            return self.parse_postfix(node);
        }

        if self.depth > 0 {
            if token.is_value(TokenKind::Operator, "#")
                || token.is_value(TokenKind::Operator, ".")
            {
                let mut name = String::new();
                if token.is_value(TokenKind::Operator, "#") {
                    self.next();
                    if self.current().is(TokenKind::Identifier) {
                        name = self.current().value.clone();
                        self.next();
                    }
                }
                // A bare `.` is left in place: postfix parsing turns it
                // into member access on the current element.
                let node = Node::new(NodeKind::Pointer(name), token.span);
                return self.parse_postfix(node);
            }
        } else if token.is_value(TokenKind::Operator, "#")
            || token.is_value(TokenKind::Operator, ".")
        {
            self.error("cannot use pointer accessor outside closure", token.span);
        }

        self.parse_secondary()
    }

    fn parse_secondary(&mut self) -> Node {
        let token = self.current().clone();

        let node = match token.kind {
            TokenKind::Identifier => {
                self.next();
                match token.value.as_str() {
                    "true" => Node::new(NodeKind::Bool(true), token.span),
                    "false" => Node::new(NodeKind::Bool(false), token.span),
                    "nil" => Node::new(NodeKind::Nil, token.span),
                    _ => self.parse_call(&token),
                }
            }
            TokenKind::Number => {
                self.next();
                self.parse_number(&token)
            }
            TokenKind::String => {
                self.next();
                Node::new(NodeKind::String(token.value.clone()), token.span)
            }
            _ => {
                if token.is_value(TokenKind::Bracket, "[") {
                    self.parse_array(&token)
                } else if token.is_value(TokenKind::Bracket, "{") {
                    self.parse_map(&token)
                } else {
                    self.error(format!("unexpected token {token}"), token.span);
                    Node::new(NodeKind::Nil, token.span)
                }
            }
        };

        self.parse_postfix(node)
    }

    fn parse_number(&mut self, token: &Token) -> Node {
        use std::num::IntErrorKind;

        let value = token.value.replace('_', "");

        if value.contains('x') {
            let digits = value.strip_prefix("0x").unwrap_or(&value);
            match i64::from_str_radix(digits, 16) {
                Ok(n) => Node::new(NodeKind::Integer(n), token.span),
                Err(e) if matches!(e.kind(), IntErrorKind::PosOverflow) => {
                    self.error("integer literal is too large", token.span);
                    Node::new(NodeKind::Nil, token.span)
                }
                Err(e) => {
                    self.error(format!("invalid hex literal: {e}"), token.span);
                    Node::new(NodeKind::Nil, token.span)
                }
            }
        } else if value.contains('.') || value.contains('e') || value.contains('E') {
            match value.parse::<f64>() {
                Ok(v) => Node::new(NodeKind::Float(v), token.span),
                Err(e) => {
                    self.error(format!("invalid float literal: {e}"), token.span);
                    Node::new(NodeKind::Nil, token.span)
                }
            }
        } else {
            match value.parse::<i64>() {
                Ok(n) => Node::new(NodeKind::Integer(n), token.span),
                Err(e) if matches!(e.kind(), IntErrorKind::PosOverflow) => {
                    self.error("integer literal is too large", token.span);
                    Node::new(NodeKind::Nil, token.span)
                }
                Err(e) => {
                    self.error(format!("invalid integer literal: {e}"), token.span);
                    Node::new(NodeKind::Nil, token.span)
                }
            }
        }
    }

    /// An identifier in value position: a call if `(` follows, otherwise
    /// a free variable reference.
    fn parse_call(&mut self, token: &Token) -> Node {
        if !self.current().is_value(TokenKind::Bracket, "(") {
            return Node::new(NodeKind::Identifier(token.value.clone()), token.span);
        }

        if builtins::predicate_arity(&token.value).is_some() {
            self.expect(TokenKind::Bracket, "(");
            let mut args = Vec::new();
            if token.value == "reduce" {
                args.push(self.parse_expression(0));
                self.expect(TokenKind::Operator, ",");
                args.push(self.parse_closure());
                if self.current().is_value(TokenKind::Operator, ",") {
                    self.next();
                    args.push(self.parse_expression(0));
                }
            } else {
                args.push(self.parse_expression(0));
                self.expect(TokenKind::Operator, ",");
                args.push(self.parse_closure());
            }
            self.expect(TokenKind::Bracket, ")");
            Node::new(
                NodeKind::Builtin {
                    name: token.value.clone(),
                    args,
                },
                token.span,
            )
        } else if builtins::lookup_builtin(&token.value).is_some()
            && !self.config.disabled.contains(&token.value)
        {
            Node::new(
                NodeKind::Builtin {
                    name: token.value.clone(),
                    args: self.parse_arguments(),
                },
                token.span,
            )
        } else {
            let callee = Node::new(NodeKind::Identifier(token.value.clone()), token.span);
            Node::new(
                NodeKind::Call {
                    callee: Box::new(callee),
                    args: self.parse_arguments(),
                },
                token.span,
            )
        }
    }

    /// Closure bodies may be braced; either way the pointer accessors
    /// are enabled for exactly the body.
    fn parse_closure(&mut self) -> Node {
        let start = self.current().clone();
        let braced = start.is_value(TokenKind::Bracket, "{");
        if braced {
            self.next();
        }

        self.depth += 1;
        let body = self.parse_expression(0);
        self.depth -= 1;

        if braced {
            self.expect(TokenKind::Bracket, "}");
        }
        Node::new(NodeKind::Closure(Box::new(body)), start.span)
    }

    fn parse_array(&mut self, token: &Token) -> Node {
        let mut items = Vec::new();

        self.expect(TokenKind::Bracket, "[");
        while !self.current().is_value(TokenKind::Bracket, "]") && self.err.is_none() {
            if !items.is_empty() {
                self.expect(TokenKind::Operator, ",");
                if self.current().is_value(TokenKind::Bracket, "]") {
                    break; // trailing comma
                }
            }
            items.push(self.parse_expression(0));
        }
        self.expect(TokenKind::Bracket, "]");

        Node::new(NodeKind::Array(items), token.span)
    }

    fn parse_map(&mut self, token: &Token) -> Node {
        self.expect(TokenKind::Bracket, "{");

        let mut pairs = Vec::new();
        while !self.current().is_value(TokenKind::Bracket, "}") && self.err.is_none() {
            if !pairs.is_empty() {
                self.expect(TokenKind::Operator, ",");
                if self.current().is_value(TokenKind::Bracket, "}") {
                    break; // trailing comma
                }
                if self.current().is_value(TokenKind::Operator, ",") {
                    let t = self.current().clone();
                    self.error(format!("unexpected token {t}"), t.span);
                    break;
                }
            }

            // A map key is a number, a string, an identifier (as a string
            // key), or a parenthesized expression.
            let key = if matches!(
                self.current().kind,
                TokenKind::Number | TokenKind::String | TokenKind::Identifier
            ) {
                let t = self.current().clone();
                self.next();
                Node::new(NodeKind::String(t.value), t.span)
            } else if self.current().is_value(TokenKind::Bracket, "(") {
                self.parse_expression(0)
            } else {
                let t = self.current().clone();
                self.error(
                    format!(
                        "a map key must be a quoted string, a number, a identifier, \
                         or an expression enclosed in parentheses (unexpected token {t})"
                    ),
                    t.span,
                );
                Node::new(NodeKind::Nil, t.span)
            };

            self.expect(TokenKind::Operator, ":");
            let value = self.parse_expression(0);
            let span = key.span;
            pairs.push(Node::new(
                NodeKind::Pair {
                    key: Box::new(key),
                    value: Box::new(value),
                },
                span,
            ));
        }
        self.expect(TokenKind::Bracket, "}");

        Node::new(NodeKind::Map(pairs), token.span)
    }

    // ── Postfix: member access, chains, index, slice ──────────────

    fn parse_postfix(&mut self, mut node: Node) -> Node {
        loop {
            if self.err.is_some() {
                break;
            }
            let postfix = self.current().clone();
            if !postfix.is(TokenKind::Operator) && !postfix.is(TokenKind::Bracket) {
                break;
            }

            if postfix.value == "." || postfix.value == "?." {
                self.next();
                let property_token = self.current().clone();
                self.next();

                // Word operators double as property names (`.not`,
                // `.matches`).
                if property_token.kind != TokenKind::Identifier
                    && (property_token.kind != TokenKind::Operator
                        || !is_valid_identifier(&property_token.value))
                {
                    self.error("expected name", property_token.span);
                }

                let property = Node::new(
                    NodeKind::String(property_token.value.clone()),
                    property_token.span,
                );
                let optional = postfix.value == "?.";

                // Flatten: at most one Chain envelope per chain.
                let (receiver, was_chain) = match node {
                    Node {
                        kind: NodeKind::Chain(inner),
                        ..
                    } => (*inner, true),
                    other => (other, false),
                };

                let member = Node::new(
                    NodeKind::Member {
                        node: Box::new(receiver),
                        property: Box::new(property),
                        optional,
                    },
                    property_token.span,
                );

                let mut new_node = if self.current().is_value(TokenKind::Bracket, "(") {
                    Node::new(
                        NodeKind::Call {
                            callee: Box::new(member),
                            args: self.parse_arguments(),
                        },
                        property_token.span,
                    )
                } else {
                    member
                };

                if was_chain || optional {
                    new_node = Node::new(NodeKind::Chain(Box::new(new_node)), property_token.span);
                }
                node = new_node;
            } else if postfix.value == "[" {
                self.next();

                if self.current().is_value(TokenKind::Operator, ":") {
                    // Slice without `from`: x[:to] or x[:]
                    self.next();
                    let to = if self.current().is_value(TokenKind::Bracket, "]") {
                        None
                    } else {
                        Some(Box::new(self.parse_expression(0)))
                    };
                    node = Node::new(
                        NodeKind::Slice {
                            node: Box::new(node),
                            from: None,
                            to,
                        },
                        postfix.span,
                    );
                    self.expect(TokenKind::Bracket, "]");
                } else {
                    let from = self.parse_expression(0);

                    if self.current().is_value(TokenKind::Operator, ":") {
                        self.next();
                        let to = if self.current().is_value(TokenKind::Bracket, "]") {
                            None
                        } else {
                            Some(Box::new(self.parse_expression(0)))
                        };
                        node = Node::new(
                            NodeKind::Slice {
                                node: Box::new(node),
                                from: Some(Box::new(from)),
                                to,
                            },
                            postfix.span,
                        );
                        self.expect(TokenKind::Bracket, "]");
                    } else {
                        // No `:` found; plain index access.
                        node = Node::new(
                            NodeKind::Member {
                                node: Box::new(node),
                                property: Box::new(from),
                                optional: false,
                            },
                            postfix.span,
                        );
                        self.expect(TokenKind::Bracket, "]");
                    }
                }
            } else {
                break;
            }
        }
        node
    }

    // ── Pipe sugar: `x | f(args)` is exactly `f(x, args)` ─────────

    fn parse_pipe(&mut self, node: Node) -> Node {
        let identifier = self.current().clone();
        self.expect_kind(TokenKind::Identifier);

        let mut args = vec![node];

        if builtins::predicate_arity(&identifier.value).is_some() {
            self.expect(TokenKind::Bracket, "(");
            if identifier.value == "reduce" {
                args.push(self.parse_closure());
                if self.current().is_value(TokenKind::Operator, ",") {
                    self.next();
                    args.push(self.parse_expression(0));
                }
            } else {
                args.push(self.parse_closure());
            }
            self.expect(TokenKind::Bracket, ")");
            Node::new(
                NodeKind::Builtin {
                    name: identifier.value,
                    args,
                },
                identifier.span,
            )
        } else if builtins::lookup_builtin(&identifier.value).is_some() {
            args.extend(self.parse_arguments());
            Node::new(
                NodeKind::Builtin {
                    name: identifier.value,
                    args,
                },
                identifier.span,
            )
        } else {
            let callee = Node::new(
                NodeKind::Identifier(identifier.value.clone()),
                identifier.span,
            );
            args.extend(self.parse_arguments());
            Node::new(
                NodeKind::Call {
                    callee: Box::new(callee),
                    args,
                },
                identifier.span,
            )
        }
    }

    fn parse_arguments(&mut self) -> Vec<Node> {
        self.expect(TokenKind::Bracket, "(");
        let mut args = Vec::new();
        while !self.current().is_value(TokenKind::Bracket, ")") && self.err.is_none() {
            if !args.is_empty() {
                self.expect(TokenKind::Operator, ",");
            }
            args.push(self.parse_expression(0));
        }
        self.expect(TokenKind::Bracket, ")");
        args
    }
}
