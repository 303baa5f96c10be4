//! Token source: turns an expression string into a flat token sequence.

use std::fmt;

use crate::ast::Span;
use crate::error::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Identifier,
    Number,
    String,
    Operator,
    Bracket,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub span: Span,
}

impl Token {
    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }

    pub fn is_value(&self, kind: TokenKind, value: &str) -> bool {
        self.kind == kind && self.value == value
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}({:?})", self.kind, self.value)
        }
    }
}

/// Word operators lex as `Operator` tokens so the parser's operator
/// tables see one spelling space. `true`/`false`/`nil` stay identifiers
/// and are recognized by the parser.
const WORD_OPERATORS: &[&str] = &[
    "and",
    "or",
    "not",
    "in",
    "matches",
    "contains",
    "startsWith",
    "endsWith",
    "let",
];

pub(crate) fn is_word_operator(s: &str) -> bool {
    WORD_OPERATORS.contains(&s)
}

pub(crate) fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Lex an expression string. The returned sequence always ends with an
/// `Eof` token; the first error aborts.
pub fn lex(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut lexer = Lexer::new(source);
    lexer.tokenize()?;
    Ok(lexer.tokens)
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            tokens: Vec::new(),
        }
    }

    fn tokenize(&mut self) -> Result<(), CompileError> {
        while self.pos < self.bytes.len() {
            self.skip_whitespace_and_comments()?;
            if self.pos >= self.bytes.len() {
                break;
            }

            let start = self.pos;
            let ch = self.bytes[self.pos];

            match ch {
                b'(' | b')' | b'[' | b']' | b'{' | b'}' => {
                    self.pos += 1;
                    self.push(TokenKind::Bracket, (ch as char).to_string(), start);
                }
                b'\'' | b'"' => self.lex_string(ch, start)?,
                b'0'..=b'9' => self.lex_number(start),
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_identifier(start),
                b'?' => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'.') => {
                            self.pos += 1;
                            self.push_op("?.", start);
                        }
                        Some(b'?') => {
                            self.pos += 1;
                            self.push_op("??", start);
                        }
                        _ => self.push_op("?", start),
                    }
                }
                b'.' => {
                    self.pos += 1;
                    if self.peek() == Some(b'.') {
                        self.pos += 1;
                        self.push_op("..", start);
                    } else {
                        self.push_op(".", start);
                    }
                }
                b'*' => {
                    self.pos += 1;
                    if self.peek() == Some(b'*') {
                        self.pos += 1;
                        self.push_op("**", start);
                    } else {
                        self.push_op("*", start);
                    }
                }
                b'=' => {
                    self.pos += 1;
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                        self.push_op("==", start);
                    } else {
                        self.push_op("=", start);
                    }
                }
                b'!' => {
                    self.pos += 1;
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                        self.push_op("!=", start);
                    } else {
                        self.push_op("!", start);
                    }
                }
                b'<' => {
                    self.pos += 1;
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                        self.push_op("<=", start);
                    } else {
                        self.push_op("<", start);
                    }
                }
                b'>' => {
                    self.pos += 1;
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                        self.push_op(">=", start);
                    } else {
                        self.push_op(">", start);
                    }
                }
                b'&' => {
                    self.pos += 1;
                    if self.peek() == Some(b'&') {
                        self.pos += 1;
                        self.push_op("&&", start);
                    } else {
                        return Err(CompileError::lexer(
                            "unexpected character '&' (logical and is '&&')",
                            Span::new(start, self.pos),
                        ));
                    }
                }
                b'|' => {
                    self.pos += 1;
                    if self.peek() == Some(b'|') {
                        self.pos += 1;
                        self.push_op("||", start);
                    } else {
                        self.push_op("|", start);
                    }
                }
                b'+' | b'-' | b'/' | b'%' | b'^' | b',' | b':' | b';' | b'#' => {
                    self.pos += 1;
                    self.push_op(&(ch as char).to_string(), start);
                }
                _ => {
                    let ch = self.source[self.pos..]
                        .chars()
                        .next()
                        .unwrap_or('\u{FFFD}');
                    return Err(CompileError::lexer(
                        format!("unexpected character {ch:?}"),
                        Span::new(start, start + ch.len_utf8()),
                    ));
                }
            }
        }

        self.tokens.push(Token {
            kind: TokenKind::Eof,
            value: String::new(),
            span: Span::new(self.pos, self.pos),
        });
        Ok(())
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn push(&mut self, kind: TokenKind, value: String, start: usize) {
        self.tokens.push(Token {
            kind,
            value,
            span: Span::new(start, self.pos),
        });
    }

    fn push_op(&mut self, value: &str, start: usize) {
        self.push(TokenKind::Operator, value.to_string(), start);
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\n' | b'\r') => self.pos += 1,
                Some(b'/') if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.bytes.get(self.pos + 1) == Some(&b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos + 1 >= self.bytes.len() {
                            return Err(CompileError::lexer(
                                "unterminated block comment",
                                Span::new(start, self.bytes.len()),
                            ));
                        }
                        if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn lex_string(&mut self, quote: u8, start: usize) -> Result<(), CompileError> {
        self.pos += 1; // opening quote
        let mut value = String::new();
        loop {
            let Some(ch) = self.source[self.pos..].chars().next() else {
                return Err(CompileError::lexer(
                    "unterminated string literal",
                    Span::new(start, self.pos),
                ));
            };
            if ch == '\n' {
                return Err(CompileError::lexer(
                    "unterminated string literal",
                    Span::new(start, self.pos),
                ));
            }
            if ch == quote as char {
                self.pos += 1;
                break;
            }
            if ch == '\\' {
                self.pos += 1;
                let Some(esc) = self.source[self.pos..].chars().next() else {
                    return Err(CompileError::lexer(
                        "unterminated string literal",
                        Span::new(start, self.pos),
                    ));
                };
                self.pos += esc.len_utf8();
                match esc {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '0' => value.push('\0'),
                    '\\' => value.push('\\'),
                    '\'' => value.push('\''),
                    '"' => value.push('"'),
                    _ => {
                        return Err(CompileError::lexer(
                            format!("invalid escape sequence '\\{esc}'"),
                            Span::new(self.pos - 1 - esc.len_utf8(), self.pos),
                        ));
                    }
                }
                continue;
            }
            value.push(ch);
            self.pos += ch.len_utf8();
        }
        self.push(TokenKind::String, value, start);
        Ok(())
    }

    /// Scan a number token. The raw text (hex prefix, underscores,
    /// fraction, exponent) is kept verbatim; the parser interprets it.
    fn lex_number(&mut self, start: usize) {
        if self.bytes[self.pos] == b'0' && self.bytes.get(self.pos + 1) == Some(&b'x') {
            self.pos += 2;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit() || c == b'_') {
                self.pos += 1;
            }
        } else {
            while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == b'_') {
                self.pos += 1;
            }
            // A fraction needs a digit after the dot so `1..5` stays a
            // range and `1.foo` stays a member access.
            if self.peek() == Some(b'.')
                && self
                    .bytes
                    .get(self.pos + 1)
                    .is_some_and(u8::is_ascii_digit)
            {
                self.pos += 1;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == b'_') {
                    self.pos += 1;
                }
            }
            if matches!(self.peek(), Some(b'e' | b'E')) {
                let mut lookahead = self.pos + 1;
                if matches!(self.bytes.get(lookahead), Some(b'+' | b'-')) {
                    lookahead += 1;
                }
                if self.bytes.get(lookahead).is_some_and(u8::is_ascii_digit) {
                    self.pos = lookahead;
                    while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                        self.pos += 1;
                    }
                }
            }
        }
        self.push(TokenKind::Number, self.source[start..self.pos].to_string(), start);
    }

    fn lex_identifier(&mut self, start: usize) {
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        let word = &self.source[start..self.pos];
        if WORD_OPERATORS.contains(&word) {
            self.push(TokenKind::Operator, word.to_string(), start);
        } else {
            self.push(TokenKind::Identifier, word.to_string(), start);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tok(s: &str) -> Vec<(TokenKind, String)> {
        lex(s)
            .unwrap()
            .into_iter()
            .map(|t| (t.kind, t.value))
            .collect()
    }

    fn values(s: &str) -> Vec<String> {
        tok(s).into_iter().map(|(_, v)| v).collect()
    }

    #[test]
    fn simple_arithmetic() {
        assert_eq!(
            tok("1 + 2 * 3"),
            vec![
                (TokenKind::Number, "1".into()),
                (TokenKind::Operator, "+".into()),
                (TokenKind::Number, "2".into()),
                (TokenKind::Operator, "*".into()),
                (TokenKind::Number, "3".into()),
                (TokenKind::Eof, String::new()),
            ]
        );
    }

    #[test]
    fn word_operators_lex_as_operators() {
        for (kind, value) in tok("a and b or not c in d") {
            match value.as_str() {
                "and" | "or" | "not" | "in" => assert_eq!(kind, TokenKind::Operator),
                "" => assert_eq!(kind, TokenKind::Eof),
                _ => assert_eq!(kind, TokenKind::Identifier),
            }
        }
    }

    #[test]
    fn true_false_nil_stay_identifiers() {
        for (kind, value) in tok("true false nil") {
            if !value.is_empty() {
                assert_eq!(kind, TokenKind::Identifier, "{value}");
            }
        }
    }

    #[test]
    fn multi_char_operators() {
        assert_eq!(
            values("a ?. b ?? c == d != e <= f >= g && h || i ** j"),
            vec!["a", "?.", "b", "??", "c", "==", "d", "!=", "e", "<=", "f", ">=", "g", "&&",
                 "h", "||", "i", "**", "j", ""]
        );
    }

    #[test]
    fn range_is_not_a_float() {
        assert_eq!(values("1..5"), vec!["1", "..", "5", ""]);
    }

    #[test]
    fn member_on_number_is_not_a_float() {
        assert_eq!(values("1.foo"), vec!["1", ".", "foo", ""]);
    }

    #[test]
    fn float_forms() {
        assert_eq!(values("1.5 2e3 1.5e-3 1_000.5"), vec!["1.5", "2e3", "1.5e-3", "1_000.5", ""]);
        let kinds: Vec<_> = tok("1.5 2e3").into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]);
    }

    #[test]
    fn hex_and_underscores() {
        assert_eq!(values("0xDEAD_beef 1_000_000"), vec!["0xDEAD_beef", "1_000_000", ""]);
    }

    #[test]
    fn strings_unescape() {
        assert_eq!(values(r#""a\nb""#), vec!["a\nb", ""]);
        assert_eq!(values(r#"'it\'s'"#), vec!["it's", ""]);
        assert_eq!(tok(r#""x""#)[0].0, TokenKind::String);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(values("1 // one\n+ 2"), vec!["1", "+", "2", ""]);
        assert_eq!(values("1 /* mid */ + 2"), vec!["1", "+", "2", ""]);
    }

    #[test]
    fn pointer_and_pipe() {
        assert_eq!(values("xs | filter(# > 1)"),
            vec!["xs", "|", "filter", "(", "#", ">", "1", ")", ""]);
    }

    #[test]
    fn spans_cover_the_source() {
        let tokens = lex("ab + cd").unwrap();
        assert_eq!(tokens[0].span, Span::new(0, 2));
        assert_eq!(tokens[1].span, Span::new(3, 4));
        assert_eq!(tokens[2].span, Span::new(5, 7));
        assert_eq!(tokens[3].span, Span::new(7, 7));
    }

    #[test]
    fn unexpected_character_errors() {
        let err = lex("a ~ b").unwrap_err();
        assert!(err.message.contains("unexpected character"), "{}", err.message);
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(lex("\"abc").unwrap_err().message.contains("unterminated"));
        assert!(lex("'a\nb'").unwrap_err().message.contains("unterminated"));
    }

    #[test]
    fn unterminated_block_comment_errors() {
        assert!(lex("1 /* nope").unwrap_err().message.contains("block comment"));
    }

    #[test]
    fn invalid_escape_errors() {
        assert!(lex(r#""\q""#).unwrap_err().message.contains("invalid escape"));
    }
}
