//! Condition sandbox: a closed, Python-flavoured expression language.
//!
//! Expressions are parsed into a small AST and evaluated against a read-only
//! variable map. There is no assignment, no comprehension, no lambda, and
//! no way to reach anything that is not in the map or in the builtin whitelist:
//!
//! - literals: numbers, strings, `True`/`False`/`None`, list/tuple/dict/set
//! - arithmetic, unary `-`/`+`/`not`, chained comparisons, `in`, `is`
//! - short-circuiting `and`/`or`, ternary `a if cond else b`
//! - variable lookup, subscripts, attributes (never names starting with `_`)
//! - builtins: `len int float str bool abs min max sum round all any list dict tuple set`
//! - methods: dict `get keys values`, str `lower upper strip split`
//!
//! Evaluation is pure and synchronous. Everything one evaluation copies or
//! builds counts against [`MAX_ALLOCATION`].

mod builtins;
mod eval;
mod lexer;
mod parser;
mod value;

use std::collections::HashMap;

use thiserror::Error;

pub use eval::MAX_ALLOCATION;
pub use parser::Expr;
pub use value::Value;

/// Longest accepted expression source.
pub const MAX_EXPRESSION_LEN: usize = 10_000;

/// Sandbox error. Every failure is classified; see [`ExprError::kind`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("invalid syntax: {0}")]
    Syntax(String),

    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("name '{0}' is not defined")]
    UndefinedName(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("access to private attribute '{0}' is not allowed")]
    PrivateAttribute(String),

    #[error("'{type_name}' object has no attribute '{attr}'")]
    AttributeNotFound { type_name: String, attr: String },

    #[error("type error: {0}")]
    Type(String),

    #[error("index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("value error: {0}")]
    Value(String),

    #[error("division by zero: {0}")]
    ZeroDivision(String),

    #[error("integer overflow")]
    Overflow,
}

/// Coarse error class, stable across repeated evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Syntax,
    Unsupported,
    UndefinedName,
    KeyNotFound,
    PrivateAttribute,
    AttributeNotFound,
    Type,
    IndexOutOfRange,
    Value,
    ZeroDivision,
    Overflow,
}

impl ExprError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExprError::Syntax(_) => ErrorKind::Syntax,
            ExprError::Unsupported(_) => ErrorKind::Unsupported,
            ExprError::UndefinedName(_) => ErrorKind::UndefinedName,
            ExprError::KeyNotFound(_) => ErrorKind::KeyNotFound,
            ExprError::PrivateAttribute(_) => ErrorKind::PrivateAttribute,
            ExprError::AttributeNotFound { .. } => ErrorKind::AttributeNotFound,
            ExprError::Type(_) => ErrorKind::Type,
            ExprError::IndexOutOfRange(_) => ErrorKind::IndexOutOfRange,
            ExprError::Value(_) => ErrorKind::Value,
            ExprError::ZeroDivision(_) => ErrorKind::ZeroDivision,
            ExprError::Overflow => ErrorKind::Overflow,
        }
    }

    /// True for errors raised before evaluation (the expression itself is bad).
    pub fn is_parse_error(&self) -> bool {
        matches!(self, ExprError::Syntax(_) | ExprError::Unsupported(_))
    }
}

/// Parse an expression without evaluating it.
pub fn parse(expression: &str) -> Result<Expr, ExprError> {
    if expression.len() > MAX_EXPRESSION_LEN {
        return Err(ExprError::Syntax(format!(
            "expression too long ({} > {} bytes)",
            expression.len(),
            MAX_EXPRESSION_LEN
        )));
    }
    let tokens = lexer::tokenize(expression)?;
    parser::Parser::new(tokens).parse()
}

/// Evaluate an expression against a variable map.
pub fn evaluate(
    expression: &str,
    context: &HashMap<String, serde_json::Value>,
) -> Result<Value, ExprError> {
    let expr = parse(expression)?;
    eval::Evaluator::new(context).eval(&expr)
}

/// Evaluate an already parsed expression.
pub fn evaluate_parsed(
    expr: &Expr,
    context: &HashMap<String, serde_json::Value>,
) -> Result<Value, ExprError> {
    eval::Evaluator::new(context).eval(expr)
}

/// Evaluate and reduce to truthiness.
pub fn evaluate_bool(
    expression: &str,
    context: &HashMap<String, serde_json::Value>,
) -> Result<bool, ExprError> {
    evaluate(expression, context).map(|v| v.truthy())
}
