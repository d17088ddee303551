//! Error types for the flag service.

use cohort_engine::EngineError;

/// Result type for flag service operations.
pub type FlagResult<T> = Result<T, FlagError>;

/// Errors that can occur while configuring or running the flag service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlagError {
    /// A refresh-listed name is not a registered flag calculation.
    #[error("{0} is not a registered flag calculation")]
    NotAFlag(String),

    /// The engine failed the request as a whole.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl FlagError {
    /// Returns true if the request was cancelled by the caller.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlagError::Engine(EngineError::Cancelled))
    }
}
