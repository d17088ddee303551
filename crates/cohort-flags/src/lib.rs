//! # cohort-flags
//!
//! Per-entity flag reporting on top of `cohort-engine`.
//!
//! Flag calculations are boolean rules registered with a display message
//! (see `CalculationManagerBuilder::register_flag`). The [`FlagService`]
//! evaluates all of them for one entity, caches the map in a sharded
//! [`ResultCache`], and re-evaluates only the flags on its refresh list
//! when the entity is requested again.
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use cohort_engine::{calculation, CalculationManager, EngineConfig, EvaluationContext, InMemoryDataSource};
//! use cohort_flags::FlagService;
//!
//! let mut builder = CalculationManager::builder();
//! builder
//!     .register_flag(
//!         "MissedVisit",
//!         calculation::from_fn(|cohort, _params, inv| {
//!             inv.for_each_entity(cohort, |id| Ok(Some((id == 7).into())))
//!         }),
//!         "Missed last scheduled visit",
//!     )
//!     .unwrap();
//! let manager = builder.build(EngineConfig::default());
//! let source = InMemoryDataSource::new();
//! let service = FlagService::new(&manager, &source);
//!
//! let ctx = EvaluationContext::new(Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap());
//! let report = service.get_flags(7, &ctx).unwrap();
//! assert!(report.is_raised("MissedVisit"));
//! assert!(service.get_flags(7, &ctx).unwrap().cache_hit);
//! ```
//!
//! ## Failure Model
//!
//! A flag that fails is listed in [`FlagReport::failures`] and left out of
//! the results; the other flags are still returned. An incomplete map is
//! never cached, and a refresh-listed flag that fails on a hit is removed
//! from the cached entry rather than served stale.
//!
//! ## Feature Flags
//!
//! - `serde` - derives `Serialize`/`Deserialize` for configs and reports

#![warn(missing_docs)]

mod cache;
pub mod error;
pub mod service;

pub use cache::{CacheEntry, ResultCache, ResultCacheConfig, ResultCacheStats, DEFAULT_SHARDS};
pub use error::{FlagError, FlagResult};
pub use service::{FlagReport, FlagService, FlagServiceConfig, FlagStats};

// Re-export from cohort-engine for convenience
pub use cohort_engine::{CalcResult, CalculationName, EntityId};
