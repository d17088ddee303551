//! # cohort-engine
//!
//! Rule evaluation and cohort composition over sets of entity identifiers.
//!
//! Given a cohort (an [`EntitySet`]) and a registry of named, parameterized
//! [`Calculation`]s, the engine produces a per-entity [`ResultMap`] for each
//! rule. Rules may call other rules through the manager (cycles are
//! rejected), narrow their cohort with reusable [`Filter`]s, and combine
//! named sub-cohorts with boolean composition expressions.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::HashMap;
//! use chrono::{TimeZone, Utc};
//! use cohort_engine::{
//!     calculation, CalculationManager, EngineConfig, EntitySet, EvaluationContext,
//!     InMemoryDataSource, ParamBag,
//! };
//!
//! let mut builder = CalculationManager::builder();
//! builder
//!     .register(
//!         "OnArt",
//!         calculation::from_fn(|cohort, _params, inv| {
//!             inv.for_each_entity(cohort, |id| Ok(Some((id <= 2).into())))
//!         }),
//!         false,
//!     )
//!     .unwrap();
//! let manager = builder.build(EngineConfig::default());
//!
//! let cohort = EntitySet::from([1, 2, 3]);
//! let ctx = EvaluationContext::new(Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap());
//! let source = InMemoryDataSource::new();
//!
//! let on_art = manager
//!     .evaluate("OnArt", &cohort, &ParamBag::new(), &ctx, &source)
//!     .unwrap()
//!     .truthy();
//!
//! let mut searches = HashMap::new();
//! searches.insert("onArt".to_string(), on_art);
//! searches.insert("pregnant".to_string(), EntitySet::from([2, 3]));
//!
//! let result = manager
//!     .compositions()
//!     .evaluate(&searches, "onArt AND NOT pregnant", &cohort)
//!     .unwrap();
//! assert_eq!(result.to_vec(), vec![1]);
//! ```
//!
//! ## Failure Model
//!
//! | Failure | Scope | Effect |
//! |---------|-------|--------|
//! | `EntityEvaluation` | one entity | logged, entity absent from the result map |
//! | `UnknownCalculation`, `CycleDetected`, `UnknownSearchIdentifier`, `MalformedExpression` | call | whole call fails |
//! | `DataSourceUnavailable` | call | whole call fails |
//! | `Cancelled` | call | whole call fails |
//!
//! ## Feature Flags
//!
//! - `parallel` (default) - evaluates entities and sibling calculations on a rayon pool
//! - `serde` - derives `Serialize`/`Deserialize` for configs and value types
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        cohort-engine                          │
//! │                                                               │
//! │  CalculationManager (read-only registry + worker pool)        │
//! │  ├── evaluate(name, cohort, params, ctx, source)              │
//! │  │   └── Calculation::evaluate(cohort, params, Invocation)    │
//! │  │       ├── Invocation::calculate  (nested, cycle-checked)   │
//! │  │       ├── Invocation::apply_filter (Filter)                │
//! │  │       └── Invocation::for_each_entity (per-entity work)    │
//! │  └── CompositionEvaluator (AND/OR/NOT within a universe)      │
//! │                                                               │
//! │  Dependencies:                                                │
//! │  └── cohort-expr - composition expression parser (AST)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod cache;
pub mod calculation;
mod composition;
mod config;
mod context;
mod entity;
mod error;
pub mod filters;
pub mod library;
mod manager;
#[cfg(any(test, feature = "test-util"))]
mod memory;
mod result;
mod traits;

// Public re-exports
pub use cache::{normalize_cache_key, ExpressionCache, ExpressionCacheStats};
pub use calculation::{Calculation, CancellationToken, Invocation, ParameterSpec};
pub use composition::{CompositionDefinition, CompositionDefinitionBuilder, CompositionEvaluator, Search};
pub use config::{EngineConfig, EngineConfigBuilder, ExpressionCacheConfig, DEFAULT_MAX_DEPTH};
pub use context::{params_fingerprint, EvaluationContext, ParamBag, ParamKind, ParamValue, END_DATE, START_DATE};
pub use entity::{EntityId, EntitySet};
pub use error::{DataSourceError, EngineError, EngineResult};
pub use filters::Filter;
pub use manager::{CalculationManager, CalculationManagerBuilder};
#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryDataSource;
pub use result::{CalcResult, CalculationName, ResultMap, ResultValue};
pub use traits::{
    ConceptId, DataSource, DataSourceResult, DateWindow, Demographics, Encounter, Gender,
    ObsValue, Observation, Order, ProgramEnrollment,
};

// Re-export the expression types for convenience
pub use cohort_expr::{CompositionExpression, ExprError};
