//! Tokenizer for the signature DSL.
//!
//! The grammar is line-oriented: one property or node declaration per line,
//! `//` comments run to end of line. The lexer tracks line and column for
//! diagnostics.

use super::ParseError;

/// A lexed token with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Bare identifier: `[A-Za-z_][A-Za-z0-9_.-]*`.
    Ident(String),
    /// Double-quoted string, unescaped.
    Str(String),
    /// Integer literal.
    Num(i64),
    Equals,
    Colon,
    Semicolon,
    Comma,
    LParen,
    RParen,
    /// End of a non-empty line; statement separator.
    Eol,
}

impl TokenKind {
    /// Human-readable description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Ident(s) => format!("identifier '{s}'"),
            Self::Str(s) => format!("string \"{s}\""),
            Self::Num(n) => format!("number {n}"),
            Self::Equals => "'='".to_string(),
            Self::Colon => "':'".to_string(),
            Self::Semicolon => "';'".to_string(),
            Self::Comma => "','".to_string(),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::Eol => "end of line".to_string(),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Tokenizes `input`, collapsing blank lines and comments.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line: u32 = 1;
    let mut column: u32 = 1;
    // Tracks whether the current line produced any token, so blank and
    // comment-only lines do not emit Eol separators.
    let mut line_has_tokens = false;

    macro_rules! push {
        ($kind:expr, $col:expr) => {{
            tokens.push(Token {
                kind: $kind,
                line,
                column: $col,
            });
            line_has_tokens = true;
        }};
    }

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                chars.next();
                if line_has_tokens {
                    tokens.push(Token {
                        kind: TokenKind::Eol,
                        line,
                        column,
                    });
                }
                line += 1;
                column = 1;
                line_has_tokens = false;
            }
            c if c.is_whitespace() => {
                chars.next();
                column += 1;
            }
            '/' => {
                let start = column;
                chars.next();
                column += 1;
                if chars.peek() == Some(&'/') {
                    // Comment runs to end of line; the newline itself is
                    // handled by the loop.
                    while let Some(&c) = chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        chars.next();
                        column += 1;
                    }
                } else {
                    return Err(ParseError::Syntax {
                        line,
                        column: start,
                        message: "unexpected '/'".to_string(),
                    });
                }
            }
            '"' => {
                let start = column;
                chars.next();
                column += 1;
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => {
                            column += 1;
                            break;
                        }
                        Some('\\') => {
                            column += 1;
                            match chars.next() {
                                Some('n') => value.push('\n'),
                                Some('t') => value.push('\t'),
                                Some('"') => value.push('"'),
                                Some('\\') => value.push('\\'),
                                other => {
                                    return Err(ParseError::Syntax {
                                        line,
                                        column,
                                        message: format!(
                                            "invalid escape '\\{}'",
                                            other.map(String::from).unwrap_or_default()
                                        ),
                                    });
                                }
                            }
                            column += 1;
                        }
                        Some('\n') | None => {
                            return Err(ParseError::Syntax {
                                line,
                                column: start,
                                message: "unterminated string".to_string(),
                            });
                        }
                        Some(c) => {
                            value.push(c);
                            column += 1;
                        }
                    }
                }
                push!(TokenKind::Str(value), start);
            }
            '0'..='9' => {
                let start = column;
                let mut raw = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        raw.push(c);
                        chars.next();
                        column += 1;
                    } else {
                        break;
                    }
                }
                let num = raw.parse::<i64>().map_err(|_| ParseError::Syntax {
                    line,
                    column: start,
                    message: format!("number '{raw}' out of range"),
                })?;
                push!(TokenKind::Num(num), start);
            }
            c if is_ident_start(c) => {
                let start = column;
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if is_ident_continue(c) {
                        ident.push(c);
                        chars.next();
                        column += 1;
                    } else {
                        break;
                    }
                }
                push!(TokenKind::Ident(ident), start);
            }
            '=' | ':' | ';' | ',' | '(' | ')' => {
                let start = column;
                chars.next();
                column += 1;
                let kind = match c {
                    '=' => TokenKind::Equals,
                    ':' => TokenKind::Colon,
                    ';' => TokenKind::Semicolon,
                    ',' => TokenKind::Comma,
                    '(' => TokenKind::LParen,
                    _ => TokenKind::RParen,
                };
                push!(kind, start);
            }
            other => {
                return Err(ParseError::Syntax {
                    line,
                    column,
                    message: format!("unexpected character '{other}'"),
                });
            }
        }
    }

    if line_has_tokens {
        tokens.push(Token {
            kind: TokenKind::Eol,
            line,
            column,
        });
    }
    Ok(tokens)
}
