//! Transition condition language.
//!
//! A small, side-effect-free expression grammar: arithmetic, comparison,
//! boolean logic and variable/member/index access. Source text is tokenized,
//! parsed into a typed AST once at validation time, and interpreted against an
//! immutable variable snapshot at evaluation time.

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;

use thiserror::Error;

use weaver_core::error::WeaverError;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use eval::{evaluate, evaluate_bool, Scope};
pub use parser::parse;

/// Names bound by the engine in addition to the workflow's variables.
pub const BUILTIN_NAMES: [&str; 3] = ["output", "gate", "outcome"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected {found} at offset {pos}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        pos: usize,
    },

    #[error("expression is {len} bytes long, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("condition must evaluate to a boolean, got {0}")]
    NotBoolean(&'static str),
}

impl From<ExprError> for WeaverError {
    fn from(e: ExprError) -> Self {
        WeaverError::Expression(e.to_string())
    }
}
