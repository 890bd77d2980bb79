//! Rules-style comparator dialect (`logicTest`).
//!
//! ```text
//! or      := and (OR and)*
//! and     := not (AND not)*
//! not     := NOT not | primary
//! primary := '(' or ')' | PROPERTY op literal | RULE
//! ```
//!
//! Keywords and names are case-insensitive. Literals on the right of a comparison are numbers,
//! quoted strings or bare words (`GENDER = F`).

use super::lexer::{Lexer, Token};
use super::{EvaluationContext, Value};
use crate::constants::MAX_EXPRESSION_DEPTH;
use crate::{FormError, FormResult};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Property {
    Gender,
    Age,
    AgeInMonths,
    Birthdate,
    Dead,
}

impl Property {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GENDER" => Some(Self::Gender),
            "AGE" => Some(Self::Age),
            "AGE_IN_MONTHS" => Some(Self::AgeInMonths),
            "BIRTHDATE" => Some(Self::Birthdate),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }

    fn resolve(self, ctx: &EvaluationContext<'_>) -> Value {
        let subject = ctx.subject;
        match self {
            Self::Gender => Value::Text(subject.gender.clone()),
            Self::Age => subject
                .age_on(ctx.today)
                .map_or(Value::Null, |a| Value::Number(f64::from(a))),
            Self::AgeInMonths => subject
                .age_in_months_on(ctx.today)
                .map_or(Value::Null, |a| Value::Number(f64::from(a))),
            Self::Birthdate => subject.birthdate.map_or(Value::Null, Value::Date),
            Self::Dead => Value::Bool(subject.dead),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Female,
    Male,
    Dead,
    Alive,
}

impl Rule {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "FEMALE" => Some(Self::Female),
            "MALE" => Some(Self::Male),
            "DEAD" => Some(Self::Dead),
            "ALIVE" => Some(Self::Alive),
            _ => None,
        }
    }

    fn holds(self, ctx: &EvaluationContext<'_>) -> bool {
        let subject = ctx.subject;
        match self {
            Self::Female => subject.gender.eq_ignore_ascii_case("F"),
            Self::Male => subject.gender.eq_ignore_ascii_case("M"),
            Self::Dead => subject.dead,
            Self::Alive => !subject.dead,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum LogicNode {
    Or(Box<LogicNode>, Box<LogicNode>),
    And(Box<LogicNode>, Box<LogicNode>),
    Not(Box<LogicNode>),
    Rule(Rule),
    Compare {
        property: Property,
        op: CompareOp,
        literal: Value,
    },
}

/// A parsed `logicTest`.
#[derive(Debug, Clone)]
pub struct LogicTest {
    source: String,
    root: LogicNode,
}

impl LogicTest {
    pub const DIALECT: &'static str = "logic";

    /// # Errors
    ///
    /// Returns `FormError::InvalidExpression` if `source` is not a valid logic test.
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
        evaluate(&self.root, ctx)
    }
}

fn evaluate(node: &LogicNode, ctx: &EvaluationContext<'_>) -> Result<bool, String> {
    match node {
        LogicNode::Or(a, b) => Ok(evaluate(a, ctx)? || evaluate(b, ctx)?),
        LogicNode::And(a, b) => Ok(evaluate(a, ctx)? && evaluate(b, ctx)?),
        LogicNode::Not(inner) => Ok(!evaluate(inner, ctx)?),
        LogicNode::Rule(rule) => Ok(rule.holds(ctx)),
        LogicNode::Compare {
            property,
            op,
            literal,
        } => compare(property.resolve(ctx), *op, literal),
    }
}

fn compare(actual: Value, op: CompareOp, literal: &Value) -> Result<bool, String> {
    // Unknown data never satisfies a comparison.
    if actual == Value::Null {
        return Ok(false);
    }
    let equal = match (&actual, literal) {
        (Value::Text(a), Value::Text(b)) => a.eq_ignore_ascii_case(b),
        (Value::Bool(a), Value::Text(b)) => b.eq_ignore_ascii_case(if *a { "true" } else { "false" }),
        _ => actual.compare(literal)? == Ordering::Equal,
    };
    match op {
        CompareOp::Eq => Ok(equal),
        CompareOp::Ne => Ok(!equal),
        CompareOp::Lt => Ok(actual.compare(literal)? == Ordering::Less),
        CompareOp::Le => Ok(actual.compare(literal)? != Ordering::Greater),
        CompareOp::Gt => Ok(actual.compare(literal)? == Ordering::Greater),
        CompareOp::Ge => Ok(actual.compare(literal)? != Ordering::Less),
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

    fn parse(&mut self) -> Result<LogicNode, String> {
        let node = self.parse_or()?;
        match self.current() {
            Token::Eof => Ok(node),
            other => Err(format!("unexpected {other:?} after end of test")),
        }
    }

    fn parse_or(&mut self) -> Result<LogicNode, String> {
        self.depth += 1;
        if self.depth > MAX_EXPRESSION_DEPTH {
            return Err(format!("nesting deeper than {MAX_EXPRESSION_DEPTH} levels"));
        }
        let mut node = self.parse_and()?;
        while self.current().is_word("OR") || *self.current() == Token::OrOr {
            self.advance();
            let rhs = self.parse_and()?;
            node = LogicNode::Or(Box::new(node), Box::new(rhs));
        }
        self.depth -= 1;
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<LogicNode, String> {
        let mut node = self.parse_not()?;
        while self.current().is_word("AND") || *self.current() == Token::AndAnd {
            self.advance();
            let rhs = self.parse_not()?;
            node = LogicNode::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_not(&mut self) -> Result<LogicNode, String> {
        if self.current().is_word("NOT") || *self.current() == Token::Bang {
            self.advance();
            self.depth += 1;
            if self.depth > MAX_EXPRESSION_DEPTH {
                return Err(format!("nesting deeper than {MAX_EXPRESSION_DEPTH} levels"));
            }
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(LogicNode::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<LogicNode, String> {
        match self.advance() {
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Token::RParen => Ok(inner),
                    other => Err(format!("expected ')' but found {other:?}")),
                }
            }
            Token::Ident(name) => {
                if let Some(op) = self.comparison_operator() {
                    let property = Property::from_name(&name)
                        .ok_or_else(|| format!("unknown property '{name}'"))?;
                    let literal = self.parse_literal()?;
                    return Ok(LogicNode::Compare {
                        property,
                        op,
                        literal,
                    });
                }
                Rule::from_name(&name)
                    .map(LogicNode::Rule)
                    .ok_or_else(|| format!("unknown rule '{name}'"))
            }
            Token::Eof => Err("unexpected end of test".into()),
            other => Err(format!("unexpected {other:?}")),
        }
    }

    fn comparison_operator(&mut self) -> Option<CompareOp> {
        let op = match self.current() {
            Token::Assign | Token::Eq => CompareOp::Eq,
            Token::Ne => CompareOp::Ne,
            Token::Lt => CompareOp::Lt,
            Token::Le => CompareOp::Le,
            Token::Gt => CompareOp::Gt,
            Token::Ge => CompareOp::Ge,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_literal(&mut self) -> Result<Value, String> {
        match self.advance() {
            Token::Number(n) => Ok(Value::Number(n)),
            Token::Minus => match self.advance() {
                Token::Number(n) => Ok(Value::Number(-n)),
                other => Err(format!("expected a number after '-' but found {other:?}")),
            },
            Token::Str(s) | Token::Ident(s) => Ok(Value::Text(s)),
            other => Err(format!("expected a value but found {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{eval, subject};
    use super::*;

    #[test]
    fn test_gender_comparison_ignores_case() {
        let s = subject("F", "1990-01-01");
        assert!(eval("logicTest", "gender = f", &s).expect("evaluates"));
        assert!(eval("logicTest", "GENDER != M", &s).expect("evaluates"));
    }

    #[test]
    fn test_bare_rules() {
        let s = subject("F", "1990-01-01");
        assert!(eval("logicTest", "FEMALE", &s).expect("evaluates"));
        assert!(!eval("logicTest", "MALE", &s).expect("evaluates"));
        assert!(eval("logicTest", "ALIVE AND NOT DEAD", &s).expect("evaluates"));
    }

    #[test]
    fn test_age_comparisons_and_precedence() {
        let s = subject("M", "2000-06-01");
        assert!(eval("logicTest", "AGE >= 24", &s).expect("evaluates"));
        assert!(eval("logicTest", "AGE<18 OR AGE>20 AND MALE", &s).expect("evaluates"));
        assert!(!eval("logicTest", "(AGE<18 OR AGE>20) AND FEMALE", &s).expect("evaluates"));
    }

    #[test]
    fn test_birthdate_compares_with_quoted_date() {
        let s = subject("M", "2000-06-01");
        assert!(eval("logicTest", "BIRTHDATE < '2001-01-01'", &s).expect("evaluates"));
    }

    #[test]
    fn test_unknown_age_never_matches() {
        let mut s = subject("M", "2000-06-01");
        s.birthdate = None;
        assert!(!eval("logicTest", "AGE < 200", &s).expect("evaluates"));
        assert!(!eval("logicTest", "AGE >= 0", &s).expect("evaluates"));
    }

    #[test]
    fn test_unknown_rule_is_a_parse_error() {
        let err = LogicTest::parse("PREGNANT").unwrap_err();
        assert!(matches!(err, FormError::InvalidExpression { reason, .. } if reason.contains("unknown rule")));
    }

    #[test]
    fn test_trailing_tokens_are_rejected() {
        assert!(LogicTest::parse("GENDER = F F").is_err());
        assert!(LogicTest::parse("(FEMALE").is_err());
    }
}
