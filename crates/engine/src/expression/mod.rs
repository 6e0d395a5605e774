//! Embedded expression language.
//!
//! Product configuration attaches expressions (computed values, visibility,
//! validation) to fields. Each expression is parsed once into an immutable
//! tree and re-evaluated by a small interpreter whenever one of its declared
//! dependency fields changes. Expressions see only a snapshot of their
//! dependencies and an explicit [`Capabilities`] allowlist.
//!
//! Supported syntax, loosest binding first: `c ? a : b`, `||`, `&&`,
//! `== != === !==`, `< <= > >=`, `+ -`, `* / %`, unary `! -`, and postfix
//! member access, indexing and calls. Literals are numbers, quoted strings,
//! `true`, `false`, `null` and array literals.

pub mod capabilities;
pub mod evaluator;
pub mod interpreter;
pub mod lexer;
pub mod parser;

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::field_paths::FieldPathError;

pub use capabilities::{Capabilities, CapabilityFunction};
pub use evaluator::{EvaluationOutcome, ExpressionDefinition, ExpressionEvaluator, ExpressionRuntime};

/// Raised when expression text cannot be tokenized or parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} at offset {offset}")]
pub struct SyntaxError {
    pub message: String,
    pub offset: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Raised while interpreting a parsed expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluationError {
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("'{0}' is not an allowed function")]
    UnknownFunction(String),

    #[error("expression is not callable")]
    NotCallable,

    #[error("cannot read '{0}' of null")]
    NullAccess(String),

    #[error("operator '{operator}' cannot be applied to {operands}")]
    TypeMismatch { operator: String, operands: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("operator '{0}' produced a number outside the representable range")]
    NonFinite(String),

    #[error("{name}: {message}")]
    Capability { name: String, message: String },
}

impl EvaluationError {
    pub(crate) fn type_mismatch(operator: &str, left: &Value, right: Option<&Value>) -> Self {
        let operands = match right {
            Some(right) => format!("{} and {}", describe(left), describe(right)),
            None => describe(left),
        };
        Self::TypeMismatch {
            operator: operator.to_string(),
            operands,
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(flag) => format!("boolean {flag}"),
        Value::Number(number) => format!("number {number}"),
        Value::String(text) => format!("string \"{text}\""),
        Value::Array(items) => format!("array of {}", items.len()),
        Value::Object(_) => "object".to_string(),
    }
}

/// What went wrong with an expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionErrorKind {
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("invalid dependency: {0}")]
    InvalidDependency(#[from] FieldPathError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error("evaluator has been disposed")]
    Disposed,
}

/// Expression failure tagged with the offending text and its argument bindings.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("expression `{source_text}` failed: {kind}")]
pub struct ExpressionError {
    pub source_text: String,
    pub arguments: IndexMap<String, Value>,
    pub kind: ExpressionErrorKind,
}

impl ExpressionError {
    pub fn new(source_text: impl Into<String>, arguments: IndexMap<String, Value>, kind: impl Into<ExpressionErrorKind>) -> Self {
        Self {
            source_text: source_text.into(),
            arguments,
            kind: kind.into(),
        }
    }
}
