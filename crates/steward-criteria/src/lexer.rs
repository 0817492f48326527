//! Tokenizer for criteria expressions.

use steward_core::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    /// One of `= == != < <= > >=`
    Op(String),
    Symbol(char),
}

pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.peek().copied() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        if ch == '\'' || ch == '"' {
            let quote = ch;
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                if c == quote {
                    closed = true;
                    break;
                }
                if c == '\\' {
                    match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => break,
                    }
                    continue;
                }
                value.push(c);
            }
            if !closed {
                return Err(Error::compile(format!("unterminated string starting with {}", quote)));
            }
            tokens.push(Token::Str(value));
            continue;
        }

        if ch.is_ascii_digit() || ch == '-' {
            chars.next();
            let mut value = String::from(ch);
            let mut is_float = false;
            while let Some(c) = chars.peek().copied() {
                if c.is_ascii_digit() {
                    value.push(c);
                    chars.next();
                } else if c == '.' && !is_float {
                    is_float = true;
                    value.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if value == "-" {
                return Err(Error::compile("dangling '-'"));
            }
            let token = if is_float {
                value
                    .parse::<f64>()
                    .map(Token::Float)
                    .map_err(|_| Error::compile(format!("invalid number: {}", value)))?
            } else {
                value
                    .parse::<i64>()
                    .map(Token::Int)
                    .map_err(|_| Error::compile(format!("invalid number: {}", value)))?
            };
            tokens.push(token);
            continue;
        }

        if is_ident_start(ch) {
            let mut value = String::new();
            while let Some(c) = chars.peek().copied() {
                if is_ident_char(c) {
                    value.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(value));
            continue;
        }

        match ch {
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                tokens.push(Token::Op("=".into()));
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(Error::compile("expected '=' after '!'"));
                }
                tokens.push(Token::Op("!=".into()));
            }
            '<' | '>' => {
                chars.next();
                let mut op = String::from(ch);
                if chars.peek() == Some(&'=') {
                    chars.next();
                    op.push('=');
                }
                tokens.push(Token::Op(op));
            }
            '(' | ')' | '[' | ']' | ',' | '.' => {
                chars.next();
                tokens.push(Token::Symbol(ch));
            }
            other => {
                return Err(Error::compile(format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}
