//! Conditional-inclusion tests.
//!
//! `includeIf`/`excludeIf` carry their test in one of two attributes, and the attribute name
//! picks the dialect:
//!
//! - `logicTest`: a rules-style comparator over named subject properties
//!   (`GENDER = F`, `AGE >= 18 AND NOT DEAD`, `FEMALE`).
//! - `velocityTest`: a scripting expression with `$patient.*` property access, arithmetic,
//!   comparisons and `&&`/`||`/`!` (`$patient.age >= 37 && $patient.gender == 'F'`).
//!
//! Both are parsed once when the test is built and evaluated against an
//! [`EvaluationContext`].

mod lexer;
mod logic;
mod script;

use crate::context::Mode;
use crate::subject::Subject;
use crate::{FormError, FormResult};
use chrono::NaiveDate;
use std::cmp::Ordering;

pub use logic::LogicTest;
pub use script::ScriptTest;

/// Attribute introducing a rules-style test.
pub const LOGIC_TEST_ATTRIBUTE: &str = "logicTest";
/// Attribute introducing a scripting-expression test.
pub const SCRIPT_TEST_ATTRIBUTE: &str = "velocityTest";

/// What an expression can see while it is evaluated.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub subject: &'a Subject,
    pub today: NaiveDate,
    pub mode: Mode,
}

/// A value produced while evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    /// Script truthiness: null and `false` are false, everything else is true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
        }
    }

    /// Ordering between two values of compatible types.
    ///
    /// Text compared with a date is read as an ISO date.
    fn compare(&self, other: &Value) -> Result<Ordering, String> {
        let ordering = match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Text(b)) => parse_date(b)?.map(|b| a.cmp(&b)),
            (Value::Text(a), Value::Date(b)) => parse_date(a)?.map(|a| a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        };
        ordering.ok_or_else(|| {
            format!(
                "cannot compare {} with {}",
                self.type_name(),
                other.type_name()
            )
        })
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Date(d) => write!(f, "{d}"),
        }
    }
}

fn parse_date(text: &str) -> Result<Option<NaiveDate>, String> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map(Some)
        .map_err(|_| format!("'{text}' is not a date (expected YYYY-MM-DD)"))
}

/// A parsed conditional test.
#[derive(Debug, Clone)]
pub enum Expression {
    Logic(LogicTest),
    Script(ScriptTest),
}

impl Expression {
    /// Build the test carried by one of the two test attributes.
    ///
    /// # Errors
    ///
    /// Returns `FormError::InvalidExpression` if the source does not parse, or
    /// `FormError::InvalidInput` if `attribute` is not a test attribute.
    pub fn from_attribute(attribute: &str, source: &str) -> FormResult<Self> {
        match attribute {
            LOGIC_TEST_ATTRIBUTE => Ok(Self::Logic(LogicTest::parse(source)?)),
            SCRIPT_TEST_ATTRIBUTE => Ok(Self::Script(ScriptTest::parse(source)?)),
            other => Err(FormError::InvalidInput(format!(
                "'{other}' is not a test attribute"
            ))),
        }
    }

    pub fn dialect(&self) -> &'static str {
        match self {
            Self::Logic(_) => LogicTest::DIALECT,
            Self::Script(_) => ScriptTest::DIALECT,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::Logic(test) => test.source(),
            Self::Script(test) => test.source(),
        }
    }

    /// # Errors
    ///
    /// Returns `FormError::InvalidExpression` when evaluation fails, e.g. when incompatible
    /// values are compared.
    pub fn evaluate(&self, ctx: &EvaluationContext<'_>) -> FormResult<bool> {
        let result = match self {
            Self::Logic(test) => test.evaluate(ctx),
            Self::Script(test) => test.evaluate(ctx),
        };
        result.map_err(|reason| self.error(reason))
    }

    fn error(&self, reason: String) -> FormError {
        FormError::InvalidExpression {
            dialect: self.dialect(),
            expression: self.source().to_owned(),
            reason,
        }
    }
}
