//! Integration tests for the flag service against an in-memory clinic.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use cohort_engine::filters::Gender as GenderFilter;
use cohort_engine::library::FilterCalculation;
use cohort_engine::{
    calculation, CalcResult, CalculationManager, ConceptId, DateWindow, Demographics, EngineConfig,
    EvaluationContext, Gender, InMemoryDataSource, ObsValue, Observation,
};
use cohort_flags::{FlagService, FlagServiceConfig, ResultCacheConfig};

const VIRAL_LOAD: ConceptId = 856;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap()
}

fn ctx() -> EvaluationContext {
    EvaluationContext::new(now())
}

fn flags(pairs: &[(&str, bool)]) -> BTreeMap<String, CalcResult> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), CalcResult::new(*value)))
        .collect()
}

fn values(results: &BTreeMap<String, CalcResult>) -> BTreeMap<String, bool> {
    results
        .iter()
        .map(|(name, result)| (name.clone(), result.is_truthy()))
        .collect()
}

/// F1: the patient is female. F2: a viral load was taken in the last 90 days.
fn clinic_manager(config: EngineConfig) -> CalculationManager {
    let mut builder = CalculationManager::builder();
    builder
        .register_flag(
            "F1",
            FilterCalculation::new(Arc::new(GenderFilter::female())),
            "Female patient",
        )
        .unwrap()
        .register_flag(
            "F2",
            calculation::from_fn(|cohort, _params, inv| {
                let window = DateWindow::between(inv.context().days_before_now(90), inv.now());
                inv.for_each_entity(cohort, |id| {
                    let latest = inv.source().latest_observation(id, VIRAL_LOAD, &window)?;
                    Ok(Some(latest.is_some().into()))
                })
            }),
            "Viral load in the last 90 days",
        )
        .unwrap();
    builder.build(config)
}

fn clinic() -> InMemoryDataSource {
    InMemoryDataSource::new()
        .with_person(1, Demographics::new(Gender::Female, NaiveDate::from_ymd_opt(1990, 1, 1)))
        .with_person(2, Demographics::new(Gender::Male, NaiveDate::from_ymd_opt(1985, 5, 5)))
}

fn viral_load(days_ago: i64) -> Observation {
    Observation {
        concept: VIRAL_LOAD,
        value: ObsValue::Numeric(40.0),
        observed_at: ctx().days_before_now(days_ago),
    }
}

fn refresh_f2() -> FlagServiceConfig {
    FlagServiceConfig::default().with_always_refresh(["F2"])
}

mod selective_refresh {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cached_value_kept_refreshed_value_recomputed() {
        let manager = clinic_manager(EngineConfig::sequential());
        let source = clinic();
        let service = FlagService::with_config(&manager, &source, refresh_f2()).unwrap();

        service.cache().put(1, flags(&[("F1", true), ("F2", false)]));

        // Both underlying computations now disagree with the cache.
        source.remove_person(1);
        source.add_person(1, Demographics::new(Gender::Male, None));
        source.add_observation(1, viral_load(10));

        let report = service.get_flags(1, &ctx()).unwrap();
        assert!(report.cache_hit);
        assert_eq!(values(&report.results), values(&flags(&[("F1", true), ("F2", true)])));
        assert_eq!(
            values(&service.cache().get(1).unwrap().results),
            values(&flags(&[("F1", true), ("F2", true)]))
        );
    }

    #[test]
    fn test_refresh_failure_keeps_other_cached_values() {
        let manager = clinic_manager(EngineConfig::sequential());
        let source = clinic();
        let service = FlagService::with_config(&manager, &source, refresh_f2()).unwrap();

        service.cache().put(1, flags(&[("F1", true), ("F2", true)]));
        source.set_unavailable(true);

        let report = service.get_flags(1, &ctx()).unwrap();
        assert!(report.cache_hit);
        assert!(!report.is_complete());
        assert!(report.failures.contains_key("F2"));
        assert_eq!(values(&report.results), values(&flags(&[("F1", true)])));

        // The failed flag is dropped from the entry; the rest survives.
        let entry = service.cache().get(1).unwrap();
        assert_eq!(values(&entry.results), values(&flags(&[("F1", true)])));
    }

    #[test]
    fn test_last_updated_follows_refresh() {
        let manager = clinic_manager(EngineConfig::sequential());
        let source = clinic();
        let service = FlagService::with_config(&manager, &source, refresh_f2()).unwrap();

        let first = service.get_flags(2, &ctx()).unwrap();
        assert_eq!(first.last_updated, Some(now()));

        let later = EvaluationContext::new(now() + chrono::Duration::days(1));
        let second = service.get_flags(2, &later).unwrap();
        assert_eq!(second.last_updated, Some(later.now()));
    }
}

mod misses {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_incomplete_map_not_cached() {
        let manager = clinic_manager(EngineConfig::sequential());
        let source = clinic();
        let service = FlagService::new(&manager, &source);

        source.set_unavailable(true);
        let report = service.get_flags(1, &ctx()).unwrap();
        assert!(!report.cache_hit);
        assert!(report.results.is_empty());
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.last_updated, None);
        assert!(service.cache().is_empty());

        source.set_unavailable(false);
        let report = service.get_flags(1, &ctx()).unwrap();
        assert!(!report.cache_hit);
        assert!(report.is_complete());
        assert_eq!(service.cache().len(), 1);
        assert_eq!(service.stats().failed_flags, 2);
    }

    #[test]
    fn test_raised_messages() {
        let manager = clinic_manager(EngineConfig::sequential());
        let source = clinic();
        source.add_observation(1, viral_load(30));
        let service = FlagService::new(&manager, &source);

        let report = service.get_flags(1, &ctx()).unwrap();
        assert_eq!(
            report.raised(),
            vec![("F1", "Female patient"), ("F2", "Viral load in the last 90 days")]
        );

        let report = service.get_flags(2, &ctx()).unwrap();
        assert!(report.raised().is_empty());
    }

    #[test]
    fn test_hit_skips_data_source() {
        let manager = clinic_manager(EngineConfig::sequential());
        let source = clinic();
        let service = FlagService::new(&manager, &source);

        service.get_flags(1, &ctx()).unwrap();
        let queries = source.query_count();
        let report = service.get_flags(1, &ctx()).unwrap();
        assert!(report.cache_hit);
        assert_eq!(source.query_count(), queries);
    }
}

mod concurrency {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parallel_requests_share_cache() {
        let manager = clinic_manager(EngineConfig::builder().with_worker_threads(4).build());
        let source = InMemoryDataSource::new();
        for id in 0..200u64 {
            let gender = if id % 2 == 0 { Gender::Female } else { Gender::Male };
            source.add_person(id, Demographics::new(gender, None));
            if id % 3 == 0 {
                source.add_observation(id, viral_load(5));
            }
        }
        let config = refresh_f2().with_cache(ResultCacheConfig::default().with_shards(8));
        let service = FlagService::with_config(&manager, &source, config).unwrap();
        let ctx = ctx();

        std::thread::scope(|s| {
            for worker in 0..4u64 {
                let service = &service;
                let ctx = &ctx;
                s.spawn(move || {
                    for id in (0..200u64).filter(|id| id % 4 == worker) {
                        for _ in 0..2 {
                            let report = service.get_flags(id, ctx).unwrap();
                            assert_eq!(report.is_raised("F1"), id % 2 == 0);
                            assert_eq!(report.is_raised("F2"), id % 3 == 0);
                        }
                    }
                });
            }
        });

        let stats = service.stats();
        assert_eq!(stats.requests, 400);
        assert_eq!(stats.cache_misses, 200);
        assert_eq!(stats.cache_hits, 200);
        assert_eq!(service.cache().len(), 200);
    }
}
