//! Error types for composition expression parsing.

use thiserror::Error;

/// Errors that can occur while parsing a composition expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// Parse error at a specific position in the input.
    #[error("parse error at position {position}: {message}")]
    ParseError {
        /// Byte offset in the trimmed input where parsing stopped.
        position: usize,
        /// Description of the error.
        message: String,
    },

    /// Expression ended before it was complete.
    #[error("composition expression is incomplete: {0}")]
    Incomplete(String),

    /// Empty input provided.
    #[error("empty composition expression")]
    EmptyExpression,
}

/// Result type for composition expression operations.
pub type ExprResult<T> = std::result::Result<T, ExprError>;
