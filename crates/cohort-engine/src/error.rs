//! Error types for rule evaluation.

use thiserror::Error;

use crate::context::ParamKind;
use crate::entity::EntityId;

/// Errors raised by a [`DataSource`](crate::DataSource) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataSourceError {
    /// The backing store cannot be reached.
    #[error("data source unavailable: {0}")]
    Unavailable(String),

    /// A query failed.
    #[error("data source query failed: {0}")]
    Query(String),
}

/// Errors that can occur during calculation and composition evaluation.
///
/// Only [`EntityEvaluation`](EngineError::EntityEvaluation) is scoped to a
/// single entity; the engine records it and moves on. Every other variant
/// fails the whole call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// No calculation is registered under this name.
    #[error("Unknown calculation: {0}")]
    UnknownCalculation(String),

    /// A calculation with this name is already registered.
    #[error("Calculation already registered: {0}")]
    DuplicateCalculation(String),

    /// A calculation transitively invoked itself with the same cohort and parameters.
    #[error("Cycle detected: {}", .chain.join(" -> "))]
    CycleDetected {
        /// Calculation names from the outermost call to the repeated one.
        chain: Vec<String>,
    },

    /// Nested calculation calls exceeded the configured depth.
    #[error("Recursion limit of {limit} exceeded while evaluating {calculation}")]
    RecursionLimit {
        /// Calculation that would have exceeded the limit.
        calculation: String,
        /// Configured maximum depth.
        limit: usize,
    },

    /// A composition referenced a search that was not supplied.
    #[error("Unknown search identifier: {0}")]
    UnknownSearchIdentifier(String),

    /// A composition expression failed to parse.
    #[error("Malformed composition expression: {0}")]
    MalformedExpression(#[from] cohort_expr::ExprError),

    /// A composition definition is inconsistent.
    #[error("Invalid composition {name}: {reason}")]
    InvalidComposition {
        /// Composition name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Evaluation failed for one entity. Non-fatal to the batch.
    #[error("Evaluation failed for entity {entity}: {reason}")]
    EntityEvaluation {
        /// The entity that failed.
        entity: EntityId,
        /// Description of the failure.
        reason: String,
    },

    /// The data source could not serve a query.
    #[error("Data source unavailable: {0}")]
    DataSourceUnavailable(String),

    /// A required parameter was neither passed nor present in the context.
    #[error("Missing parameter {parameter} for {calculation}")]
    MissingParameter {
        /// Calculation that declared the parameter.
        calculation: String,
        /// Parameter name.
        parameter: String,
    },

    /// A parameter was present with the wrong kind.
    #[error("Invalid parameter {parameter} for {calculation}: expected {expected}")]
    InvalidParameter {
        /// Calculation that declared the parameter.
        calculation: String,
        /// Parameter name.
        parameter: String,
        /// Declared kind.
        expected: ParamKind,
    },

    /// The evaluation was cancelled by the caller.
    #[error("Evaluation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Creates a per-entity failure.
    pub fn entity(entity: EntityId, reason: impl Into<String>) -> Self {
        EngineError::EntityEvaluation {
            entity,
            reason: reason.into(),
        }
    }

    /// Returns true if this error only concerns a single entity.
    pub fn is_entity_scoped(&self) -> bool {
        matches!(self, EngineError::EntityEvaluation { .. })
    }
}

impl From<DataSourceError> for EngineError {
    fn from(err: DataSourceError) -> Self {
        EngineError::DataSourceUnavailable(err.to_string())
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
