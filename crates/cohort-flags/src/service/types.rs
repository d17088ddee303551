//! Types for the flag service.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cohort_engine::{CalcResult, CalculationName, EntityId};

/// Flags computed (or served from cache) for one entity.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlagReport {
    /// The entity the flags belong to.
    pub entity: EntityId,
    /// Flag results keyed by calculation name. Flags with no applicable
    /// result for the entity are absent.
    pub results: BTreeMap<CalculationName, CalcResult>,
    /// Flags that could not be evaluated, with the reason.
    pub failures: BTreeMap<CalculationName, String>,
    /// Display message per flag calculation.
    pub messages: BTreeMap<CalculationName, String>,
    /// Whether the non-refreshed values came from the cache.
    pub cache_hit: bool,
    /// When the entity's cache entry was last written; `None` if the
    /// results were not cached.
    pub last_updated: Option<DateTime<Utc>>,
    /// Time taken to serve the request in milliseconds.
    pub elapsed_ms: f64,
}

impl FlagReport {
    /// Returns true if every flag evaluated successfully.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns the result of one flag.
    pub fn get(&self, name: &str) -> Option<&CalcResult> {
        self.results.get(name)
    }

    /// Returns the boolean value of one flag, if it has one.
    pub fn is_raised(&self, name: &str) -> bool {
        self.results.get(name).map_or(false, CalcResult::is_truthy)
    }

    /// Truthy flags with their display messages, in name order.
    pub fn raised(&self) -> Vec<(&str, &str)> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_truthy())
            .map(|(name, _)| {
                let message = self.messages.get(name).map_or(name.as_str(), String::as_str);
                (name.as_str(), message)
            })
            .collect()
    }
}

/// Statistics about flag service usage.
#[derive(Debug, Clone, Default)]
pub struct FlagStats {
    /// Number of `get_flags` requests served.
    pub requests: usize,
    /// Requests answered from a cached entry.
    pub cache_hits: usize,
    /// Requests that evaluated every flag.
    pub cache_misses: usize,
    /// Refresh-listed flags re-evaluated on cache hits.
    pub refreshed_flags: usize,
    /// Flag evaluations that failed.
    pub failed_flags: usize,
    /// Total time spent serving requests in milliseconds.
    pub total_time_ms: f64,
}

impl FlagStats {
    /// Returns the cache hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }

    /// Returns the average request time in milliseconds.
    pub fn avg_time_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_time_ms / self.requests as f64
        }
    }
}

impl std::fmt::Display for FlagStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Flag Service Statistics:")?;
        writeln!(f, "  Requests:        {}", self.requests)?;
        writeln!(f, "  Cache hits:      {}", self.cache_hits)?;
        writeln!(f, "  Cache misses:    {}", self.cache_misses)?;
        writeln!(f, "  Hit rate:        {:.1}%", self.hit_rate())?;
        writeln!(f, "  Refreshed flags: {}", self.refreshed_flags)?;
        writeln!(f, "  Failed flags:    {}", self.failed_flags)?;
        writeln!(f, "  Total time:      {:.1}ms", self.total_time_ms)?;
        writeln!(f, "  Avg time:        {:.2}ms", self.avg_time_ms())?;
        Ok(())
    }
}
