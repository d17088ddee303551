//! Per-entity calculation results.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::entity::{EntityId, EntitySet};
use crate::error::{EngineError, EngineResult};

/// Stable name a calculation is registered under.
pub type CalculationName = String;

/// Tagged value produced by a calculation for one entity.
///
/// `Empty` means "no applicable result" and is distinct from
/// `Boolean(false)`, which is a real negative determination.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResultValue {
    /// Yes/no determination.
    Boolean(bool),
    /// Numeric measurement or count.
    Numeric(f64),
    /// Point in time.
    Date(DateTime<Utc>),
    /// Coded or free-text value (e.g. `"LDL"`).
    Text(String),
    /// Structured object with named fields.
    Structured(BTreeMap<String, ResultValue>),
    /// Explicitly no value.
    Empty,
}

impl ResultValue {
    /// Truthiness used for cohort extraction.
    ///
    /// `Boolean` is its own value; `Numeric` is truthy when non-zero;
    /// `Text` and `Structured` when non-empty; `Date` always; `Empty` never.
    pub fn is_truthy(&self) -> bool {
        match self {
            ResultValue::Boolean(b) => *b,
            ResultValue::Numeric(n) => *n != 0.0 && !n.is_nan(),
            ResultValue::Date(_) => true,
            ResultValue::Text(s) => !s.is_empty(),
            ResultValue::Structured(fields) => !fields.is_empty(),
            ResultValue::Empty => false,
        }
    }

    /// Returns true for `Empty`.
    pub fn is_empty(&self) -> bool {
        matches!(self, ResultValue::Empty)
    }

    /// Returns the boolean, if this is `Boolean`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ResultValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the number, if this is `Numeric`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResultValue::Numeric(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the instant, if this is `Date`.
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            ResultValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the text, if this is `Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResultValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Looks up a field of a `Structured` value.
    pub fn field(&self, name: &str) -> Option<&ResultValue> {
        match self {
            ResultValue::Structured(fields) => fields.get(name),
            _ => None,
        }
    }
}

impl From<bool> for ResultValue {
    fn from(value: bool) -> Self {
        ResultValue::Boolean(value)
    }
}

impl From<f64> for ResultValue {
    fn from(value: f64) -> Self {
        ResultValue::Numeric(value)
    }
}

impl From<DateTime<Utc>> for ResultValue {
    fn from(value: DateTime<Utc>) -> Self {
        ResultValue::Date(value)
    }
}

impl From<&str> for ResultValue {
    fn from(value: &str) -> Self {
        ResultValue::Text(value.to_string())
    }
}

impl From<String> for ResultValue {
    fn from(value: String) -> Self {
        ResultValue::Text(value)
    }
}

/// A result value plus the calculation that produced it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalcResult {
    value: ResultValue,
    provenance: Option<CalculationName>,
}

impl CalcResult {
    /// Creates a result without provenance.
    pub fn new(value: impl Into<ResultValue>) -> Self {
        Self {
            value: value.into(),
            provenance: None,
        }
    }

    /// Sets the producing calculation.
    pub fn with_provenance(mut self, calculation: impl Into<CalculationName>) -> Self {
        self.provenance = Some(calculation.into());
        self
    }

    /// The value.
    pub fn value(&self) -> &ResultValue {
        &self.value
    }

    /// Consumes the result, returning the value.
    pub fn into_value(self) -> ResultValue {
        self.value
    }

    /// The calculation that produced this result, if recorded.
    pub fn provenance(&self) -> Option<&str> {
        self.provenance.as_deref()
    }

    /// Shorthand for `value().is_truthy()`.
    pub fn is_truthy(&self) -> bool {
        self.value.is_truthy()
    }
}

impl From<ResultValue> for CalcResult {
    fn from(value: ResultValue) -> Self {
        CalcResult::new(value)
    }
}

/// Mapping of entity to result for one calculation over one cohort.
///
/// Entities with no applicable result are absent. Entities whose evaluation
/// failed are absent too, and their failure reason is kept separately so
/// callers can tell "not applicable" from "could not be computed".
///
/// # Example
///
/// ```rust
/// use cohort_engine::{ResultMap, ResultValue};
///
/// let mut results = ResultMap::new();
/// results.insert_value(1, true);
/// results.insert_value(2, false);
/// results.record_failure(3, "no demographic record");
///
/// assert_eq!(results.truthy().to_vec(), vec![1]);
/// assert_eq!(results.len(), 2);
/// assert!(results.failures().contains_key(&3));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultMap {
    results: HashMap<EntityId, CalcResult>,
    failures: HashMap<EntityId, String>,
}

impl ResultMap {
    /// Creates an empty result map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a result for an entity, replacing any previous one.
    pub fn insert(&mut self, entity: EntityId, result: CalcResult) {
        self.failures.remove(&entity);
        self.results.insert(entity, result);
    }

    /// Stores a bare value for an entity.
    pub fn insert_value(&mut self, entity: EntityId, value: impl Into<ResultValue>) {
        self.insert(entity, CalcResult::new(value));
    }

    /// Records that evaluation failed for an entity and drops any result for it.
    pub fn record_failure(&mut self, entity: EntityId, reason: impl Into<String>) {
        self.results.remove(&entity);
        self.failures.insert(entity, reason.into());
    }

    /// Gets the result for an entity.
    pub fn get(&self, entity: EntityId) -> Option<&CalcResult> {
        self.results.get(&entity)
    }

    /// Gets the result for an entity, turning a recorded failure into an
    /// entity-scoped error so a dependent calculation excludes it too.
    pub fn require(&self, entity: EntityId) -> EngineResult<Option<&CalcResult>> {
        match self.failures.get(&entity) {
            Some(reason) => Err(EngineError::entity(entity, reason.clone())),
            None => Ok(self.results.get(&entity)),
        }
    }

    /// Gets the value for an entity.
    pub fn value(&self, entity: EntityId) -> Option<&ResultValue> {
        self.results.get(&entity).map(CalcResult::value)
    }

    /// Checks if an entity has a result.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.results.contains_key(&entity)
    }

    /// Number of entities with a result.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if no entity has a result.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Iterates over (entity, result) pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &CalcResult)> + '_ {
        self.results.iter().map(|(id, result)| (*id, result))
    }

    /// Entities that have a result.
    pub fn entities(&self) -> EntitySet {
        self.results.keys().copied().collect()
    }

    /// Entities whose result is truthy.
    pub fn truthy(&self) -> EntitySet {
        self.results
            .iter()
            .filter(|(_, result)| result.is_truthy())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Entities whose result equals `value`.
    pub fn matching(&self, value: &ResultValue) -> EntitySet {
        self.results
            .iter()
            .filter(|(_, result)| result.value() == value)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Per-entity failure reasons.
    pub fn failures(&self) -> &HashMap<EntityId, String> {
        &self.failures
    }

    /// Entities whose evaluation failed.
    pub fn failed_entities(&self) -> EntitySet {
        self.failures.keys().copied().collect()
    }

    /// Returns true if any entity failed.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Drops results and failures for entities outside `cohort`.
    ///
    /// Returns the number of results dropped.
    pub fn retain_cohort(&mut self, cohort: &EntitySet) -> usize {
        let before = self.results.len();
        self.results.retain(|id, _| cohort.contains(*id));
        self.failures.retain(|id, _| cohort.contains(*id));
        before - self.results.len()
    }

    /// Sets provenance on every result that does not already carry one.
    pub fn stamp_provenance(&mut self, calculation: &str) {
        for result in self.results.values_mut() {
            if result.provenance.is_none() {
                result.provenance = Some(calculation.to_string());
            }
        }
    }

    /// Converts the map to a Vec sorted by entity.
    pub fn to_sorted_vec(&self) -> Vec<(EntityId, CalcResult)> {
        let mut vec: Vec<(EntityId, CalcResult)> = self
            .results
            .iter()
            .map(|(id, result)| (*id, result.clone()))
            .collect();
        vec.sort_unstable_by_key(|(id, _)| *id);
        vec
    }
}

impl IntoIterator for ResultMap {
    type Item = (EntityId, CalcResult);
    type IntoIter = std::collections::hash_map::IntoIter<EntityId, CalcResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl FromIterator<(EntityId, CalcResult)> for ResultMap {
    fn from_iter<I: IntoIterator<Item = (EntityId, CalcResult)>>(iter: I) -> Self {
        Self {
            results: iter.into_iter().collect(),
            failures: HashMap::new(),
        }
    }
}
