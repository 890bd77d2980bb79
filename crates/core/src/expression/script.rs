//! Scripting expression dialect (`velocityTest`).
//!
//! Precedence, loosest first: `||`/`or`, `&&`/`and`, `==`/`!=`/`eq`/`ne`,
//! `<`/`<=`/`>`/`>=`/`lt`/`le`/`gt`/`ge`, `+`/`-`, `*`/`/`/`%`, then unary `!`/`not`/`-`.
//!
//! Variables: `$patient` (with `gender`, `age`, `ageInMonths`, `birthdate`, `dead`,
//! `personId`, or any person attribute by name), `$today` and `$mode`.

use super::lexer::{Lexer, Token};
use super::{EvaluationContext, Value};
use crate::constants::MAX_EXPRESSION_DEPTH;
use crate::{FormError, FormResult};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Variable(String),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
}

/// A parsed `velocityTest`.
#[derive(Debug, Clone)]
pub struct ScriptTest {
    source: String,
    root: Node,
}

impl ScriptTest {
    pub const DIALECT: &'static str = "script";

    /// # Errors
    ///
    /// Returns `FormError::InvalidExpression` if `source` is not a valid expression.
    pub fn parse(source: &str) -> FormResult<Self> {
        let error = |reason: String| FormError::InvalidExpression {
            dialect: Self::DIALECT,
            expression: source.to_owned(),
            reason,
        };
        let tokens = Lexer::new(source).tokenize().map_err(error)?;
        let mut parser = Parser {
            tokens,
            position: 0,
            depth: 0,
        };
        let root = parser.parse().map_err(error)?;
        Ok(Self {
            source: source.to_owned(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub(super) fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<bool, String> {
        Ok(evaluate(&self.root, ctx)?.is_truthy())
    }
}

fn evaluate(node: &Node, ctx: &EvaluationContext<'_>) -> Result<Value, String> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::Variable(path) => resolve_variable(path, ctx),
        Node::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!evaluate(inner, ctx)?.is_truthy())),
        Node::Unary(UnaryOp::Negate, inner) => match evaluate(inner, ctx)? {
            Value::Number(n) => Ok(Value::Number(-n)),
            other => Err(format!("cannot negate {other}")),
        },
        Node::Binary(BinaryOp::Or, a, b) => {
            let lhs = evaluate(a, ctx)?.is_truthy();
            Ok(Value::Bool(lhs || evaluate(b, ctx)?.is_truthy()))
        }
        Node::Binary(BinaryOp::And, a, b) => {
            let lhs = evaluate(a, ctx)?.is_truthy();
            Ok(Value::Bool(lhs && evaluate(b, ctx)?.is_truthy()))
        }
        Node::Binary(op, a, b) => binary(*op, evaluate(a, ctx)?, evaluate(b, ctx)?),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, String> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&lhs, &rhs))),
        BinaryOp::Lt => Ok(Value::Bool(lhs.compare(&rhs)? == Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(lhs.compare(&rhs)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(lhs.compare(&rhs)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(lhs.compare(&rhs)? != Ordering::Less)),
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::Text(a), b) => Ok(Value::Text(format!("{a}{b}"))),
            (a, Value::Text(b)) => Ok(Value::Text(format!("{a}{b}"))),
            (a, b) => Err(format!("cannot add {a} and {b}")),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Value::Number(a), Value::Number(b)) = (&lhs, &rhs) else {
                return Err(format!("arithmetic needs numbers, found {lhs} and {rhs}"));
            };
            let (a, b) = (*a, *b);
            if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0.0 {
                return Err("division by zero".into());
            }
            Ok(Value::Number(match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            }))
        }
        BinaryOp::Or | BinaryOp::And => Err("logical operator evaluated eagerly".into()),
    }
}

/// Equality across types compares the printed form, so `$patient.age == '37'` holds.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(a), Value::Number(b)) => a == b,
        (a, b) if std::mem::discriminant(a) == std::mem::discriminant(b) => a == b,
        (a, b) => a.to_string() == b.to_string(),
    }
}

fn resolve_variable(path: &str, ctx: &EvaluationContext<'_>) -> Result<Value, String> {
    let subject = ctx.subject;
    let (root, property) = match path.split_once('.') {
        Some((root, property)) => (root, Some(property)),
        None => (path, None),
    };
    match (root, property) {
        ("today", None) => Ok(Value::Date(ctx.today)),
        ("mode", None) => Ok(Value::Text(ctx.mode.as_str().to_owned())),
        ("patient", Some("gender")) => Ok(Value::Text(subject.gender.clone())),
        ("patient", Some("age")) => Ok(subject
            .age_on(ctx.today)
            .map_or(Value::Null, |a| Value::Number(f64::from(a)))),
        ("patient", Some("ageInMonths")) => Ok(subject
            .age_in_months_on(ctx.today)
            .map_or(Value::Null, |a| Value::Number(f64::from(a)))),
        ("patient", Some("birthdate")) => Ok(subject.birthdate.map_or(Value::Null, Value::Date)),
        ("patient", Some("dead")) => Ok(Value::Bool(subject.dead)),
        ("patient", Some("personId")) => Ok(Value::Number(f64::from(subject.person_id.get()))),
        ("patient", Some(attribute)) => subject
            .attributes
            .get(attribute)
            .map(|v| Value::Text(v.clone()))
            .ok_or_else(|| format!("unknown patient property '{attribute}'")),
        _ => Err(format!("unknown variable '${path}'")),
    }
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        self.position += 1;
        token
    }

    fn parse(&mut self) -> Result<Node, String> {
        let node = self.parse_or()?;
        match self.current() {
            Token::Eof => Ok(node),
            other => Err(format!("unexpected {other:?} after end of expression")),
        }
    }

    fn enter(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_EXPRESSION_DEPTH {
            return Err(format!("nesting deeper than {MAX_EXPRESSION_DEPTH} levels"));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Node, String> {
        self.enter()?;
        let mut node = self.parse_and()?;
        while matches!(self.current(), Token::OrOr) || self.current().is_word("or") {
            self.advance();
            let rhs = self.parse_and()?;
            node = Node::Binary(BinaryOp::Or, Box::new(node), Box::new(rhs));
        }
        self.depth -= 1;
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, String> {
        let mut node = self.parse_equality()?;
        while matches!(self.current(), Token::AndAnd) || self.current().is_word("and") {
            self.advance();
            let rhs = self.parse_equality()?;
            node = Node::Binary(BinaryOp::And, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_equality(&mut self) -> Result<Node, String> {
        let mut node = self.parse_relational()?;
        loop {
            let op = match self.current() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                t if t.is_word("eq") => BinaryOp::Eq,
                t if t.is_word("ne") => BinaryOp::Ne,
                _ => return Ok(node),
            };
            self.advance();
            let rhs = self.parse_relational()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
    }

    fn parse_relational(&mut self) -> Result<Node, String> {
        let mut node = self.parse_additive()?;
        loop {
            let op = match self.current() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                t if t.is_word("lt") => BinaryOp::Lt,
                t if t.is_word("le") => BinaryOp::Le,
                t if t.is_word("gt") => BinaryOp::Gt,
                t if t.is_word("ge") => BinaryOp::Ge,
                _ => return Ok(node),
            };
            self.advance();
            let rhs = self.parse_additive()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
    }

    fn parse_additive(&mut self) -> Result<Node, String> {
        let mut node = self.parse_multiplicative()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(node),
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Node, String> {
        let mut node = self.parse_unary()?;
        loop {
            let op = match self.current() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => return Ok(node),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Node, String> {
        let op = match self.current() {
            Token::Bang => UnaryOp::Not,
            Token::Minus => UnaryOp::Negate,
            t if t.is_word("not") => UnaryOp::Not,
            _ => return self.parse_primary(),
        };
        self.advance();
        self.enter()?;
        let inner = self.parse_unary()?;
        self.depth -= 1;
        Ok(Node::Unary(op, Box::new(inner)))
    }

    fn parse_primary(&mut self) -> Result<Node, String> {
        match self.advance() {
            Token::Number(n) => Ok(Node::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Node::Literal(Value::Text(s))),
            Token::Variable(path) => Ok(Node::Variable(path)),
            Token::Ident(word) if word == "true" => Ok(Node::Literal(Value::Bool(true))),
            Token::Ident(word) if word == "false" => Ok(Node::Literal(Value::Bool(false))),
            Token::Ident(word) if word == "null" => Ok(Node::Literal(Value::Null)),
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Token::RParen => Ok(inner),
                    other => Err(format!("expected ')' but found {other:?}")),
                }
            }
            Token::Ident(word) => Err(format!("unexpected word '{word}'")),
            Token::Eof => Err("unexpected end of expression".into()),
            other => Err(format!("unexpected {other:?}")),
        }
    }
}
