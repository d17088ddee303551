//! Per-entity flag service with caching and selective refresh.
//!
//! The service evaluates every registered flag calculation for one entity,
//! caches the resulting map, and on later requests serves it from the
//! cache. Flags named in the `always_refresh` list are recomputed on every
//! request and merged back into the cached entry, so a hit never returns a
//! stale value for them.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use cohort_engine::{calculation, CalculationManager, EngineConfig, EvaluationContext, InMemoryDataSource};
//! use cohort_flags::{FlagService, FlagServiceConfig};
//!
//! let mut builder = CalculationManager::builder();
//! builder
//!     .register_flag(
//!         "DueForVisit",
//!         calculation::from_fn(|cohort, _params, inv| {
//!             inv.for_each_entity(cohort, |id| Ok(Some((id % 2 == 0).into())))
//!         }),
//!         "Due for a clinic visit",
//!     )
//!     .unwrap();
//! let manager = builder.build(EngineConfig::sequential());
//! let source = InMemoryDataSource::new();
//!
//! let config = FlagServiceConfig::default().with_always_refresh(["DueForVisit"]);
//! let service = FlagService::with_config(&manager, &source, config).unwrap();
//!
//! let ctx = EvaluationContext::new(Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap());
//! let report = service.get_flags(4, &ctx).unwrap();
//! assert_eq!(report.raised(), vec![("DueForVisit", "Due for a clinic visit")]);
//! ```

mod types;

pub use types::{FlagReport, FlagStats};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cohort_engine::{
    CalcResult, CalculationManager, CalculationName, CancellationToken, DataSource, EngineError,
    EntityId, EntitySet, EvaluationContext, ParamBag,
};
use tracing::{debug, warn};

use crate::cache::{ResultCache, ResultCacheConfig};
use crate::error::{FlagError, FlagResult};

/// Configuration for the flag service.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FlagServiceConfig {
    /// Flags recomputed on every request, even on a cache hit.
    pub always_refresh: Vec<CalculationName>,
    /// Cache layout.
    pub cache: ResultCacheConfig,
}

impl FlagServiceConfig {
    /// Sets the refresh list.
    pub fn with_always_refresh<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CalculationName>,
    {
        self.always_refresh = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the cache configuration.
    pub fn with_cache(mut self, cache: ResultCacheConfig) -> Self {
        self.cache = cache;
        self
    }
}

/// Outcome of one flag for one entity.
enum FlagOutcome {
    Value(CalcResult),
    Absent,
    Failed(String),
}

/// Results, failures and names to drop, split out of a batch of outcomes.
#[derive(Default)]
struct Collected {
    results: BTreeMap<CalculationName, CalcResult>,
    failures: BTreeMap<CalculationName, String>,
    missing: Vec<CalculationName>,
}

impl Collected {
    fn from_outcomes(outcomes: Vec<(CalculationName, FlagOutcome)>) -> Self {
        let mut collected = Collected::default();
        for (name, outcome) in outcomes {
            match outcome {
                FlagOutcome::Value(result) => {
                    collected.results.insert(name, result);
                }
                FlagOutcome::Absent => collected.missing.push(name),
                FlagOutcome::Failed(reason) => {
                    collected.missing.push(name.clone());
                    collected.failures.insert(name, reason);
                }
            }
        }
        collected
    }
}

/// Serves the flag calculations of a [`CalculationManager`] per entity.
///
/// Safe to share across request threads: the cache is sharded and the
/// manager is read-only.
pub struct FlagService<'a> {
    manager: &'a CalculationManager,
    source: &'a dyn DataSource,
    config: FlagServiceConfig,
    flags: Vec<CalculationName>,
    refresh: Vec<CalculationName>,
    messages: BTreeMap<CalculationName, String>,
    cache: ResultCache,
    stats: StatsCounters,
}

impl<'a> FlagService<'a> {
    /// Creates a service with default configuration (no refresh list).
    pub fn new(manager: &'a CalculationManager, source: &'a dyn DataSource) -> Self {
        Self::build(manager, source, FlagServiceConfig::default(), Vec::new())
    }

    /// Creates a service with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::NotAFlag`] if a refresh-listed name is not a
    /// registered flag calculation.
    pub fn with_config(
        manager: &'a CalculationManager,
        source: &'a dyn DataSource,
        config: FlagServiceConfig,
    ) -> FlagResult<Self> {
        let mut refresh = Vec::with_capacity(config.always_refresh.len());
        for name in &config.always_refresh {
            if !manager.is_flag(name) {
                return Err(FlagError::NotAFlag(name.clone()));
            }
            refresh.push(name.clone());
        }
        refresh.sort();
        refresh.dedup();
        Ok(Self::build(manager, source, config, refresh))
    }

    fn build(
        manager: &'a CalculationManager,
        source: &'a dyn DataSource,
        config: FlagServiceConfig,
        refresh: Vec<CalculationName>,
    ) -> Self {
        let flags: Vec<CalculationName> = manager.flag_calculations().map(String::from).collect();
        let messages = flags
            .iter()
            .filter_map(|name| {
                manager
                    .flag_message(name)
                    .map(|message| (name.clone(), message.to_string()))
            })
            .collect();
        let cache = ResultCache::new(&config.cache);

        Self {
            manager,
            source,
            config,
            flags,
            refresh,
            messages,
            cache,
            stats: StatsCounters::default(),
        }
    }

    /// Returns the flags for one entity.
    ///
    /// On a cache hit, refresh-listed flags are recomputed and merged into
    /// the cached entry; every other value is served from the cache. On a
    /// miss, every flag is computed and the map is cached if all of them
    /// succeeded.
    ///
    /// # Arguments
    ///
    /// * `entity` - The entity to report on
    /// * `ctx` - Evaluation context; its `now` stamps the cache entry
    ///
    /// # Returns
    ///
    /// * `Ok(FlagReport)` - Successful flags plus the failures, if any. A
    ///   failing flag never evicts the other cached values.
    /// * `Err(FlagError)` - The request was cancelled
    pub fn get_flags(&self, entity: EntityId, ctx: &EvaluationContext) -> FlagResult<FlagReport> {
        self.get_flags_cancellable(entity, ctx, &CancellationToken::new())
    }

    /// Like [`get_flags`](Self::get_flags), aborting with `Cancelled` once
    /// `cancel` fires.
    pub fn get_flags_cancellable(
        &self,
        entity: EntityId,
        ctx: &EvaluationContext,
        cancel: &CancellationToken,
    ) -> FlagResult<FlagReport> {
        let start = Instant::now();

        let (collected, cache_hit, last_updated, evaluated) = match self.cache.get(entity) {
            Some(entry) => {
                let outcomes = self.evaluate_flags(&self.refresh, entity, ctx, cancel)?;
                let fresh = Collected::from_outcomes(outcomes);

                let mut results = entry.results;
                for name in &fresh.missing {
                    results.remove(name);
                }
                results.extend(fresh.results.clone());

                let last_updated = self
                    .cache
                    .merge(entity, fresh.results, &fresh.missing, ctx.now())
                    .map(|merged| merged.last_updated);

                let collected = Collected {
                    results,
                    failures: fresh.failures,
                    missing: fresh.missing,
                };
                (collected, true, last_updated, self.refresh.len())
            }
            None => {
                let outcomes = self.evaluate_flags(&self.flags, entity, ctx, cancel)?;
                let collected = Collected::from_outcomes(outcomes);

                let last_updated = if collected.failures.is_empty() {
                    self.cache.put_at(entity, collected.results.clone(), ctx.now());
                    Some(ctx.now())
                } else {
                    debug!(
                        entity,
                        failed = collected.failures.len(),
                        "not caching incomplete flag map"
                    );
                    None
                };
                (collected, false, last_updated, self.flags.len())
            }
        };

        let elapsed = start.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        debug!(entity, cache_hit, evaluated, elapsed_ms, "served flags");
        self.stats
            .record(cache_hit, evaluated, collected.failures.len(), elapsed);

        Ok(FlagReport {
            entity,
            results: collected.results,
            failures: collected.failures,
            messages: self.messages.clone(),
            cache_hit,
            last_updated,
            elapsed_ms,
        })
    }

    /// Evaluates `names` for one entity on the manager's worker pool.
    fn evaluate_flags(
        &self,
        names: &[CalculationName],
        entity: EntityId,
        ctx: &EvaluationContext,
        cancel: &CancellationToken,
    ) -> FlagResult<Vec<(CalculationName, FlagOutcome)>> {
        self.manager
            .par_map(names, |name| {
                self.evaluate_flag(name, entity, ctx, cancel)
                    .map(|outcome| (name.clone(), outcome))
            })
            .into_iter()
            .collect()
    }

    fn evaluate_flag(
        &self,
        name: &str,
        entity: EntityId,
        ctx: &EvaluationContext,
        cancel: &CancellationToken,
    ) -> FlagResult<FlagOutcome> {
        let cohort = EntitySet::single(entity);
        match self
            .manager
            .evaluate_cancellable(name, &cohort, &ParamBag::new(), ctx, self.source, cancel)
        {
            Ok(results) => {
                if let Some(result) = results.get(entity) {
                    Ok(FlagOutcome::Value(result.clone()))
                } else if let Some(reason) = results.failures().get(&entity) {
                    Ok(FlagOutcome::Failed(reason.clone()))
                } else {
                    Ok(FlagOutcome::Absent)
                }
            }
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled.into()),
            Err(err) => {
                warn!(entity, flag = name, error = %err, "flag evaluation failed");
                Ok(FlagOutcome::Failed(err.to_string()))
            }
        }
    }

    /// Computes and caches flags for every listed entity that is not cached yet.
    ///
    /// Returns the number of entities newly cached.
    pub fn warm(&self, entities: &[EntityId], ctx: &EvaluationContext) -> FlagResult<usize> {
        let mut cached = 0;
        for &entity in entities {
            if self.cache.get(entity).is_some() {
                continue;
            }
            if self.get_flags(entity, ctx)?.last_updated.is_some() {
                cached += 1;
            }
        }
        Ok(cached)
    }

    /// Drops the cached flags of one entity.
    pub fn invalidate(&self, entity: EntityId) -> bool {
        self.cache.invalidate(entity)
    }

    /// Drops every cached entry.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Returns the underlying cache.
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Names of the flag calculations served, sorted.
    pub fn flags(&self) -> &[CalculationName] {
        &self.flags
    }

    /// Returns service statistics.
    pub fn stats(&self) -> FlagStats {
        self.stats.snapshot()
    }

    /// Resets statistics.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &FlagServiceConfig {
        &self.config
    }
}

/// Request counters updated without locking; read as a [`FlagStats`] snapshot.
#[derive(Debug, Default)]
struct StatsCounters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    refreshed_flags: AtomicU64,
    failed_flags: AtomicU64,
    total_time_us: AtomicU64,
}

impl StatsCounters {
    fn record(&self, cache_hit: bool, evaluated: usize, failed: usize, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.refreshed_flags.fetch_add(evaluated as u64, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        self.failed_flags.fetch_add(failed as u64, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_time_us.fetch_add(micros, Ordering::Relaxed);
    }

    // Counters are read independently, so a snapshot taken while requests
    // are in flight may be off by the requests still being recorded.
    fn snapshot(&self) -> FlagStats {
        FlagStats {
            requests: self.requests.load(Ordering::Relaxed) as usize,
            cache_hits: self.cache_hits.load(Ordering::Relaxed) as usize,
            cache_misses: self.cache_misses.load(Ordering::Relaxed) as usize,
            refreshed_flags: self.refreshed_flags.load(Ordering::Relaxed) as usize,
            failed_flags: self.failed_flags.load(Ordering::Relaxed) as usize,
            total_time_ms: self.total_time_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    fn reset(&self) {
        for counter in [
            &self.requests,
            &self.cache_hits,
            &self.cache_misses,
            &self.refreshed_flags,
            &self.failed_flags,
            &self.total_time_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for FlagService<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagService")
            .field("flags", &self.flags)
            .field("always_refresh", &self.refresh)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use cohort_engine::{calculation, EngineConfig, InMemoryDataSource, ResultValue};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap()
    }

    /// Two flags whose values follow a switch the test can flip.
    fn manager(switch: Arc<AtomicBool>) -> CalculationManager {
        let stable = switch.clone();
        let mut builder = CalculationManager::builder();
        builder
            .register_flag(
                "F1",
                calculation::from_fn(move |cohort, _params, inv| {
                    let on = stable.load(Ordering::SeqCst);
                    inv.for_each_entity(cohort, |_| Ok(Some((!on).into())))
                }),
                "Flag one",
            )
            .unwrap()
            .register_flag(
                "F2",
                calculation::from_fn(move |cohort, _params, inv| {
                    let on = switch.load(Ordering::SeqCst);
                    inv.for_each_entity(cohort, |_| Ok(Some(on.into())))
                }),
                "Flag two",
            )
            .unwrap()
            .register(
                "NotAFlag",
                calculation::from_fn(|cohort, _params, inv| {
                    inv.for_each_entity(cohort, |_| Ok(Some(ResultValue::Numeric(1.0))))
                }),
                false,
            )
            .unwrap();
        builder.build(EngineConfig::sequential())
    }

    #[test]
    fn test_miss_then_hit() {
        let manager = manager(Arc::new(AtomicBool::new(false)));
        let source = InMemoryDataSource::new();
        let service = FlagService::new(&manager, &source);
        let ctx = EvaluationContext::new(now());

        let first = service.get_flags(1, &ctx).unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.last_updated, Some(now()));
        assert!(first.is_raised("F1"));
        assert!(!first.is_raised("F2"));
        assert!(!first.results.contains_key("NotAFlag"));

        let second = service.get_flags(1, &ctx).unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.results, first.results);

        let stats = service.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.refreshed_flags, 0);
    }

    #[test]
    fn test_refresh_list_validated() {
        let manager = manager(Arc::new(AtomicBool::new(false)));
        let source = InMemoryDataSource::new();

        for name in ["NotAFlag", "Missing"] {
            let config = FlagServiceConfig::default().with_always_refresh([name]);
            let err = FlagService::with_config(&manager, &source, config).unwrap_err();
            assert_eq!(err, FlagError::NotAFlag(name.to_string()));
        }
    }

    #[test]
    fn test_refresh_only_listed_flags() {
        let switch = Arc::new(AtomicBool::new(false));
        let manager = manager(switch.clone());
        let source = InMemoryDataSource::new();
        let config = FlagServiceConfig::default().with_always_refresh(["F2", "F2"]);
        let service = FlagService::with_config(&manager, &source, config).unwrap();
        let ctx = EvaluationContext::new(now());

        service.get_flags(3, &ctx).unwrap();
        switch.store(true, Ordering::SeqCst);

        let report = service.get_flags(3, &ctx).unwrap();
        assert!(report.cache_hit);
        assert!(report.is_raised("F1"));
        assert!(report.is_raised("F2"));
        assert_eq!(service.stats().refreshed_flags, 1);

        // The refreshed value is written back to the cache.
        let entry = service.cache().get(3).unwrap();
        assert!(entry.results["F2"].is_truthy());
    }

    #[test]
    fn test_invalidate_recomputes() {
        let switch = Arc::new(AtomicBool::new(false));
        let manager = manager(switch.clone());
        let source = InMemoryDataSource::new();
        let service = FlagService::new(&manager, &source);
        let ctx = EvaluationContext::new(now());

        service.get_flags(5, &ctx).unwrap();
        switch.store(true, Ordering::SeqCst);
        assert!(service.get_flags(5, &ctx).unwrap().is_raised("F1"));

        assert!(service.invalidate(5));
        let report = service.get_flags(5, &ctx).unwrap();
        assert!(!report.cache_hit);
        assert!(!report.is_raised("F1"));
        assert!(report.is_raised("F2"));
    }

    #[test]
    fn test_cancelled_request() {
        let manager = manager(Arc::new(AtomicBool::new(false)));
        let source = InMemoryDataSource::new();
        let service = FlagService::new(&manager, &source);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = service
            .get_flags_cancellable(1, &EvaluationContext::new(now()), &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(service.cache().is_empty());
        assert_eq!(service.stats().requests, 0);
    }

    #[test]
    fn test_stats_counters() {
        let counters = StatsCounters::default();
        counters.record(false, 2, 1, Duration::from_micros(1_500));
        counters.record(true, 1, 0, Duration::from_micros(500));
        counters.record(true, 1, 0, Duration::from_micros(1_000));

        let stats = counters.snapshot();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.refreshed_flags, 2);
        assert_eq!(stats.failed_flags, 1);
        assert!((stats.total_time_ms - 3.0).abs() < 1e-9);

        counters.reset();
        let stats = counters.snapshot();
        assert_eq!(stats.requests, 0);
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.total_time_ms, 0.0);
    }

    #[test]
    fn test_stats_counted_across_threads() {
        let manager = manager(Arc::new(AtomicBool::new(false)));
        let source = InMemoryDataSource::new();
        let service = FlagService::new(&manager, &source);
        let ctx = EvaluationContext::new(now());

        std::thread::scope(|s| {
            for worker in 0..8u64 {
                let service = &service;
                let ctx = &ctx;
                s.spawn(move || {
                    for id in 0..50u64 {
                        service.get_flags(worker * 100 + id, ctx).unwrap();
                    }
                });
            }
        });

        let stats = service.stats();
        assert_eq!(stats.requests, 400);
        assert_eq!(stats.cache_misses, 400);
        assert_eq!(stats.cache_hits, 0);

        service.reset_stats();
        assert_eq!(service.stats().requests, 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_config_from_json() {
        let config: FlagServiceConfig =
            serde_json::from_str(r#"{"always_refresh": ["F2"], "cache": {"shards": 4}}"#).unwrap();
        assert_eq!(config.always_refresh, vec!["F2".to_string()]);
        assert_eq!(config.cache.shards, 4);
        assert_eq!(config.cache.max_entries_per_shard, None);

        let empty: FlagServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, FlagServiceConfig::default());
    }

    #[test]
    fn test_warm() {
        let manager = manager(Arc::new(AtomicBool::new(false)));
        let source = InMemoryDataSource::new();
        let service = FlagService::new(&manager, &source);
        let ctx = EvaluationContext::new(now());

        assert_eq!(service.warm(&[1, 2, 3], &ctx).unwrap(), 3);
        assert_eq!(service.warm(&[1, 2, 3, 4], &ctx).unwrap(), 1);
        assert_eq!(service.cache().len(), 4);
    }
}
