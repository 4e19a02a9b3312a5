//! Signature DSL parser.
//!
//! Translates `.dice` text into an *unresolved* signature: properties plus
//! an ordered list of node stubs with named parent lists. The parser does
//! not resolve names, look up modules, or check graph validity; that is the
//! graph compiler's job.
//!
//! # Grammar
//!
//! ```text
//! signature  := (property | node | comment)*
//! property   := ident '=' value EOL
//! node       := kind ident [ '(' attr (';' attr)* [';'] ')' ] EOL
//! kind       := 'mod' | 'sig'
//! attr       := ident ':' value
//! value      := string | number | ident (',' ident)*
//! ```
//!
//! Recognised properties: `component` (identifier/classifier/scanner,
//! default classifier) and `name`. Recognised node attributes: `mod` and
//! `sig` (parent-node name lists), `args` (opaque), `strategy`
//! (default/gate/hold/none). Any other key is ignored with a warning.

mod lexer;
mod printer;

pub use printer::print;

use thiserror::Error;
use tracing::warn;

use crate::model::{ComponentKind, NodeKind, Strategy};
use lexer::{Token, TokenKind, tokenize};

/// DSL failure kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Lexical or syntactic violation.
    #[error("parse error at {line}:{column}: {message}")]
    Syntax {
        line: u32,
        column: u32,
        message: String,
    },

    /// Node kind other than `mod`/`sig`.
    #[error("unknown node kind '{kind}' at {line}:{column}")]
    UnknownKind {
        line: u32,
        column: u32,
        kind: String,
    },

    /// Property or attribute value outside its enumeration.
    #[error("invalid value '{value}' for '{key}' at {line}:{column}")]
    InvalidValue {
        line: u32,
        column: u32,
        key: String,
        value: String,
    },
}

/// A parsed, unresolved signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    /// From the `name` property, or the file stem handed to [`parse`].
    pub name: String,
    pub component: ComponentKind,
    /// Node stubs in declaration order.
    pub nodes: Vec<NodeStub>,
}

/// A node declaration before name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStub {
    pub kind: NodeKind,
    pub name: String,
    /// Names of parent nodes of kind `mod`, in authored order.
    pub module_parents: Vec<String>,
    /// Names of parent nodes of kind `sig`, in authored order.
    pub signature_parents: Vec<String>,
    pub strategy: Strategy,
    pub args: Option<String>,
}

impl NodeStub {
    fn new(kind: NodeKind, name: String) -> Self {
        Self {
            kind,
            name,
            module_parents: Vec::new(),
            signature_parents: Vec::new(),
            strategy: Strategy::Default,
            args: None,
        }
    }
}

/// An attribute or property value.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Num(i64),
    /// One or more comma-separated identifiers.
    List(Vec<String>),
}

impl Value {
    /// Renders the value for diagnostics and `InvalidValue` payloads.
    fn render(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Num(n) => n.to_string(),
            Self::List(items) => items.join(","),
        }
    }

    /// A single identifier or string, for enum-valued keys.
    fn as_word(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::List(items) if items.len() == 1 => Some(&items[0]),
            _ => None,
        }
    }
}

/// Parses a `.dice` document.
///
/// `default_name` is the signature name used when no `name` property is
/// present; by convention the source filename without extension.
pub fn parse(default_name: &str, input: &str) -> Result<ParsedSignature, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
    };
    parser.signature(default_name)
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'t Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error_at(&self, message: impl Into<String>) -> ParseError {
        let (line, column) = self
            .peek()
            .map_or_else(|| self.end_position(), |t| (t.line, t.column));
        ParseError::Syntax {
            line,
            column,
            message: message.into(),
        }
    }

    fn end_position(&self) -> (u32, u32) {
        self.tokens.last().map_or((1, 1), |t| (t.line, t.column))
    }

    fn expect(&mut self, want: &TokenKind, context: &str) -> Result<&'t Token, ParseError> {
        match self.next() {
            Some(tok) if tok.kind == *want => Ok(tok),
            Some(tok) => Err(ParseError::Syntax {
                line: tok.line,
                column: tok.column,
                message: format!(
                    "expected {} in {context}, found {}",
                    want.describe(),
                    tok.kind.describe()
                ),
            }),
            None => {
                let (line, column) = self.end_position();
                Err(ParseError::Syntax {
                    line,
                    column,
                    message: format!("expected {} in {context}, found end of input", want.describe()),
                })
            }
        }
    }

    fn signature(&mut self, default_name: &str) -> Result<ParsedSignature, ParseError> {
        let mut sig = ParsedSignature {
            name: default_name.to_string(),
            component: ComponentKind::Classifier,
            nodes: Vec::new(),
        };

        while let Some(tok) = self.peek() {
            match &tok.kind {
                TokenKind::Eol => {
                    self.next();
                }
                TokenKind::Ident(_) => self.statement(&mut sig)?,
                other => {
                    return Err(ParseError::Syntax {
                        line: tok.line,
                        column: tok.column,
                        message: format!("expected declaration, found {}", other.describe()),
                    });
                }
            }
        }
        Ok(sig)
    }

    /// One line: either `key = value` or `kind name (...)`.
    fn statement(&mut self, sig: &mut ParsedSignature) -> Result<(), ParseError> {
        let head = self.next().expect("peeked identifier");
        let TokenKind::Ident(word) = &head.kind else {
            unreachable!("statement starts at an identifier");
        };

        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Equals)) {
            self.next();
            let value = self.value()?;
            self.expect(&TokenKind::Eol, "property")?;
            self.property(sig, word, &value, head)?;
            return Ok(());
        }

        let kind = match word.as_str() {
            "mod" => NodeKind::Module,
            "sig" => NodeKind::EmbeddedSignature,
            other => {
                return Err(ParseError::UnknownKind {
                    line: head.line,
                    column: head.column,
                    kind: other.to_string(),
                });
            }
        };

        let name_tok = self.next().ok_or_else(|| ParseError::Syntax {
            line: head.line,
            column: head.column,
            message: "expected node name".to_string(),
        })?;
        let TokenKind::Ident(name) = &name_tok.kind else {
            return Err(ParseError::Syntax {
                line: name_tok.line,
                column: name_tok.column,
                message: format!("expected node name, found {}", name_tok.kind.describe()),
            });
        };

        let mut stub = NodeStub::new(kind, name.clone());
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
            self.next();
            self.attributes(&mut stub)?;
        }
        self.expect(&TokenKind::Eol, "node declaration")?;
        sig.nodes.push(stub);
        Ok(())
    }

    fn property(
        &self,
        sig: &mut ParsedSignature,
        key: &str,
        value: &Value,
        tok: &Token,
    ) -> Result<(), ParseError> {
        match key {
            "component" => {
                let word = value.as_word().and_then(ComponentKind::parse);
                sig.component = word.ok_or_else(|| ParseError::InvalidValue {
                    line: tok.line,
                    column: tok.column,
                    key: key.to_string(),
                    value: value.render(),
                })?;
            }
            "name" => {
                sig.name = value
                    .as_word()
                    .ok_or_else(|| ParseError::InvalidValue {
                        line: tok.line,
                        column: tok.column,
                        key: key.to_string(),
                        value: value.render(),
                    })?
                    .to_string();
            }
            other => {
                warn!(key = other, "ignoring unrecognised signature property");
            }
        }
        Ok(())
    }

    /// `attr (';' attr)* [';'] ')'` with the opening paren already consumed.
    fn attributes(&mut self, stub: &mut NodeStub) -> Result<(), ParseError> {
        loop {
            match self.peek().map(|t| &t.kind) {
                Some(TokenKind::RParen) => {
                    self.next();
                    return Ok(());
                }
                Some(TokenKind::Ident(_)) => {
                    let key_tok = self.next().expect("peeked identifier");
                    let TokenKind::Ident(key) = &key_tok.kind else {
                        unreachable!()
                    };
                    self.expect(&TokenKind::Colon, "attribute")?;
                    let value = self.value()?;
                    self.attribute(stub, key, &value, key_tok)?;
                    // A semicolon separates attributes; a trailing one before
                    // the closing paren is tolerated.
                    if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Semicolon)) {
                        self.next();
                    }
                }
                _ => return Err(self.error_at("expected attribute or ')'")),
            }
        }
    }

    fn attribute(
        &self,
        stub: &mut NodeStub,
        key: &str,
        value: &Value,
        tok: &Token,
    ) -> Result<(), ParseError> {
        let invalid = || ParseError::InvalidValue {
            line: tok.line,
            column: tok.column,
            key: key.to_string(),
            value: value.render(),
        };
        match key {
            "mod" => match value {
                Value::List(names) => stub.module_parents.extend(names.iter().cloned()),
                _ => return Err(invalid()),
            },
            "sig" => match value {
                Value::List(names) => stub.signature_parents.extend(names.iter().cloned()),
                _ => return Err(invalid()),
            },
            "strategy" => {
                stub.strategy = value
                    .as_word()
                    .and_then(Strategy::parse)
                    .ok_or_else(invalid)?;
            }
            "args" => {
                stub.args = Some(value.render());
            }
            other => {
                warn!(
                    node = %stub.name,
                    key = other,
                    "ignoring unrecognised node attribute"
                );
            }
        }
        Ok(())
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        let tok = self
            .next()
            .ok_or_else(|| self.error_at("expected value, found end of input"))?;
        match &tok.kind {
            TokenKind::Str(s) => Ok(Value::Str(s.clone())),
            TokenKind::Num(n) => Ok(Value::Num(*n)),
            TokenKind::Ident(first) => {
                let mut items = vec![first.clone()];
                while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Comma)) {
                    self.next();
                    let item = self.next().ok_or_else(|| ParseError::Syntax {
                        line: tok.line,
                        column: tok.column,
                        message: "expected identifier after ','".to_string(),
                    })?;
                    let TokenKind::Ident(name) = &item.kind else {
                        return Err(ParseError::Syntax {
                            line: item.line,
                            column: item.column,
                            message: format!(
                                "expected identifier after ',', found {}",
                                item.kind.describe()
                            ),
                        });
                    };
                    items.push(name.clone());
                }
                Ok(Value::List(items))
            }
            other => Err(ParseError::Syntax {
                line: tok.line,
                column: tok.column,
                message: format!("expected value, found {}", other.describe()),
            }),
        }
    }
}
