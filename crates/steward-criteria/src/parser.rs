//! Recursive-descent parser producing the expression tree.

use crate::lexer::{tokenize, Token};
use serde_json::Value;
use steward_core::{Error, Result};

/// Deepest nesting of parentheses, lists, calls and `not` a criteria may use.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    /// Dotted lookup into the evaluated document, e.g. `facts.parent_id`.
    Path(Vec<String>),
    Call { name: String, args: Vec<Expr> },
    Not(Box<Expr>),
    /// Operands of a flat `and` chain, at least two.
    And(Vec<Expr>),
    /// Operands of a flat `or` chain, at least two.
    Or(Vec<Expr>),
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(Error::compile("empty expression"));
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(Error::compile(format!("unexpected trailing token {:?}", token)));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::compile("expression nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(id)) if id.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<()> {
        match self.next() {
            Some(Token::Symbol(s)) if s == symbol => Ok(()),
            Some(other) => Err(Error::compile(format!(
                "expected '{}', found {:?}",
                symbol, other
            ))),
            None => Err(Error::compile(format!("expected '{}', found end of input", symbol))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut operands = vec![self.parse_and()?];
        while self.eat_keyword("or") {
            operands.push(self.parse_and()?);
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            Expr::Or(operands)
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut operands = vec![self.parse_unary()?];
        while self.eat_keyword("and") {
            operands.push(self.parse_unary()?);
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            Expr::And(operands)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            self.enter()?;
            let inner = self.parse_unary()?;
            self.leave();
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_operand()?;

        let op = match self.peek() {
            Some(Token::Op(op)) => {
                let op = match op.as_str() {
                    "=" => CompareOp::Eq,
                    "!=" => CompareOp::Ne,
                    "<" => CompareOp::Lt,
                    "<=" => CompareOp::Le,
                    ">" => CompareOp::Gt,
                    ">=" => CompareOp::Ge,
                    other => return Err(Error::compile(format!("unknown operator {}", other))),
                };
                self.pos += 1;
                op
            }
            Some(Token::Ident(id)) if id.eq_ignore_ascii_case("in") => {
                self.pos += 1;
                CompareOp::In
            }
            Some(Token::Ident(id))
                if id.eq_ignore_ascii_case("not")
                    && matches!(self.peek_at(1), Some(Token::Ident(next)) if next.eq_ignore_ascii_case("in")) =>
            {
                self.pos += 2;
                CompareOp::NotIn
            }
            _ => return Ok(lhs),
        };

        let rhs = self.parse_operand()?;
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        let token = self
            .next()
            .ok_or_else(|| Error::compile("unexpected end of input"))?;

        match token {
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(f) => Ok(Expr::Literal(Value::from(f))),
            Token::Symbol('(') => {
                self.enter()?;
                let inner = self.parse_or()?;
                self.expect_symbol(')')?;
                self.leave();
                Ok(inner)
            }
            Token::Symbol('[') => {
                let items = self.parse_items(']')?;
                Ok(Expr::List(items))
            }
            Token::Ident(id) => self.parse_ident(id),
            other => Err(Error::compile(format!("unexpected token {:?}", other))),
        }
    }

    fn parse_ident(&mut self, id: String) -> Result<Expr> {
        match id.to_ascii_lowercase().as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" | "none" => return Ok(Expr::Literal(Value::Null)),
            "and" | "or" | "not" | "in" => {
                return Err(Error::compile(format!("unexpected keyword '{}'", id)));
            }
            _ => {}
        }

        if self.eat_symbol('(') {
            let args = self.parse_items(')')?;
            return Ok(Expr::Call { name: id, args });
        }

        let mut segments = vec![id];
        while self.eat_symbol('.') {
            match self.next() {
                Some(Token::Ident(segment)) => segments.push(segment),
                Some(Token::Int(n)) if n >= 0 => segments.push(n.to_string()),
                Some(other) => {
                    return Err(Error::compile(format!("expected field name, found {:?}", other)))
                }
                None => return Err(Error::compile("expected field name after '.'")),
            }
        }
        Ok(Expr::Path(segments))
    }

    /// Comma-separated operands up to `close`. The opening symbol is already consumed.
    fn parse_items(&mut self, close: char) -> Result<Vec<Expr>> {
        self.enter()?;
        let mut items = Vec::new();
        if !self.eat_symbol(close) {
            loop {
                items.push(self.parse_operand()?);
                if self.eat_symbol(close) {
                    break;
                }
                self.expect_symbol(',')?;
            }
        }
        self.leave();
        Ok(items)
    }
}
