//! Property tests for the sharded result cache.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use cohort_flags::{CalcResult, ResultCache, ResultCacheConfig};
use proptest::prelude::*;

const NAMES: [&str; 6] = ["F0", "F1", "F2", "F3", "F4", "F5"];

fn flag_map() -> impl Strategy<Value = BTreeMap<String, CalcResult>> {
    prop::collection::btree_map(
        prop::sample::select(NAMES.to_vec()).prop_map(String::from),
        any::<bool>().prop_map(|raised| CalcResult::new(raised)),
        0..NAMES.len(),
    )
}

proptest! {
    #[test]
    fn merge_replaces_fresh_drops_removed_keeps_rest(
        cached in flag_map(),
        fresh in flag_map(),
        remove in prop::collection::vec(prop::sample::select(NAMES.to_vec()).prop_map(String::from), 0..3),
    ) {
        let cache = ResultCache::default();
        let at = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        cache.put_at(1, cached.clone(), at);

        let merged = cache.merge(1, fresh.clone(), &remove, at).unwrap();

        for (name, result) in &merged.results {
            match fresh.get(name) {
                Some(value) => prop_assert_eq!(result, value),
                None => {
                    prop_assert!(!remove.contains(name));
                    prop_assert_eq!(Some(result), cached.get(name));
                }
            }
        }
        for name in fresh.keys() {
            prop_assert!(merged.results.contains_key(name));
        }
        for name in cached.keys().filter(|n| !remove.contains(n)) {
            prop_assert!(merged.results.contains_key(name));
        }
    }

    #[test]
    fn entries_never_leak_across_entities(
        entries in prop::collection::btree_map(0u64..500, flag_map(), 0..50),
        shards in 1usize..8,
    ) {
        let cache = ResultCache::new(&ResultCacheConfig::default().with_shards(shards));
        for (id, results) in &entries {
            cache.put(*id, results.clone());
        }

        prop_assert_eq!(cache.len(), entries.len());
        for (id, results) in &entries {
            prop_assert_eq!(&cache.get(*id).unwrap().results, results);
        }
        prop_assert!(cache.get(500).is_none());
    }
}
