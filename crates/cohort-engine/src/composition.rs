//! Boolean composition of named sub-cohorts.
//!
//! [`CompositionEvaluator`] combines a map of named searches with an
//! expression such as `"onArt AND NOT pregnant"`:
//!
//! - `AND` is set intersection
//! - `OR` is set union
//! - `NOT x` is `universe \ x`, never a complement against every entity known
//!
//! Each search is clipped to the universe before combining, so the result is
//! always a subset of the universe. A name that is not in the search map is a
//! hard [`UnknownSearchIdentifier`](EngineError::UnknownSearchIdentifier)
//! error, never an empty set.
//!
//! [`CompositionDefinition`] is the reusable, named form: searches are
//! declared once (as calculations, filters, fixed sets or nested
//! definitions), the expression is parsed and checked once, and the whole
//! definition can be registered as a [`Calculation`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cohort_expr::CompositionExpression;
use tracing::debug;

use crate::cache::{ExpressionCache, ExpressionCacheStats};
use crate::calculation::{Calculation, Invocation};
use crate::config::ExpressionCacheConfig;
use crate::context::ParamBag;
use crate::entity::{EntityId, EntitySet};
use crate::error::{EngineError, EngineResult};
use crate::filters::Filter;
use crate::result::ResultMap;

/// Evaluates composition expressions over named entity sets.
///
/// # Example
///
/// ```rust
/// use std::collections::HashMap;
/// use cohort_engine::{CompositionEvaluator, EntitySet};
///
/// let mut searches = HashMap::new();
/// searches.insert("onArt".to_string(), EntitySet::from([1, 2]));
/// searches.insert("pregnant".to_string(), EntitySet::from([2, 3]));
/// let universe = EntitySet::from([1, 2, 3]);
///
/// let evaluator = CompositionEvaluator::new();
/// let result = evaluator
///     .evaluate(&searches, "onArt AND NOT pregnant", &universe)
///     .unwrap();
/// assert_eq!(result.to_vec(), vec![1]);
/// ```
#[derive(Debug, Default)]
pub struct CompositionEvaluator {
    cache: Option<ExpressionCache>,
}

impl CompositionEvaluator {
    /// Creates an evaluator that parses every expression it is given.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an evaluator that caches parsed expressions.
    pub fn with_cache(config: ExpressionCacheConfig) -> Self {
        Self {
            cache: Some(ExpressionCache::new(config)),
        }
    }

    /// Creates an evaluator from an optional cache configuration.
    pub fn from_config(config: Option<ExpressionCacheConfig>) -> Self {
        config.map_or_else(Self::new, Self::with_cache)
    }

    /// Parses an expression, through the cache when enabled.
    pub fn compile(&self, expression: &str) -> EngineResult<Arc<CompositionExpression>> {
        match &self.cache {
            Some(cache) => cache.get_or_parse(expression),
            None => Ok(Arc::new(cohort_expr::parse(expression)?)),
        }
    }

    /// Returns expression cache statistics, if caching is enabled.
    pub fn cache_stats(&self) -> Option<ExpressionCacheStats> {
        self.cache.as_ref().map(ExpressionCache::stats)
    }

    /// Parses and evaluates `expression` over `searches` within `universe`.
    ///
    /// # Errors
    ///
    /// - `MalformedExpression` if the expression does not parse
    /// - `UnknownSearchIdentifier` if it names a search not in `searches`
    pub fn evaluate(
        &self,
        searches: &HashMap<String, EntitySet>,
        expression: &str,
        universe: &EntitySet,
    ) -> EngineResult<EntitySet> {
        let parsed = self.compile(expression)?;
        self.evaluate_expression(&parsed, searches, universe)
    }

    /// Evaluates an already parsed expression.
    pub fn evaluate_expression(
        &self,
        expression: &CompositionExpression,
        searches: &HashMap<String, EntitySet>,
        universe: &EntitySet,
    ) -> EngineResult<EntitySet> {
        check_identifiers(expression, |name| searches.contains_key(name))?;
        let result = combine(expression, searches, universe)?;
        debug!(
            expression = %expression,
            universe = universe.len(),
            result = result.len(),
            "composition evaluated"
        );
        Ok(result)
    }
}

/// Fails on the first (alphabetically) identifier that `known` rejects.
fn check_identifiers<F>(expression: &CompositionExpression, known: F) -> EngineResult<()>
where
    F: Fn(&str) -> bool,
{
    match expression.identifiers().into_iter().find(|name| !known(*name)) {
        Some(missing) => Err(EngineError::UnknownSearchIdentifier(missing.to_string())),
        None => Ok(()),
    }
}

fn combine(
    expression: &CompositionExpression,
    searches: &HashMap<String, EntitySet>,
    universe: &EntitySet,
) -> EngineResult<EntitySet> {
    Ok(match expression {
        CompositionExpression::Search(name) => searches
            .get(name)
            .ok_or_else(|| EngineError::UnknownSearchIdentifier(name.clone()))?
            .intersection(universe),
        CompositionExpression::And(left, right) => {
            combine(left, searches, universe)?.intersection(&combine(right, searches, universe)?)
        }
        CompositionExpression::Or(left, right) => {
            combine(left, searches, universe)?.union(&combine(right, searches, universe)?)
        }
        CompositionExpression::Not(inner) => universe.difference(&combine(inner, searches, universe)?),
    })
}

/// How one named search of a [`CompositionDefinition`] is produced.
#[derive(Clone)]
pub enum Search {
    /// Entities for which a registered calculation is truthy.
    ///
    /// The call's parameters are inherited; these override them.
    Calculation {
        /// Registered calculation name.
        name: String,
        /// Parameters for this search.
        params: ParamBag,
    },
    /// Entities passing a filter.
    Filter(Arc<dyn Filter>),
    /// A fixed set (e.g. the output of an external query).
    Fixed(EntitySet),
    /// Members of a nested composition.
    Composition(Arc<CompositionDefinition>),
}

impl std::fmt::Debug for Search {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Search::Calculation { name, params } => f
                .debug_struct("Calculation")
                .field("name", name)
                .field("params", params)
                .finish(),
            Search::Filter(filter) => f.debug_tuple("Filter").field(&filter.name()).finish(),
            Search::Fixed(set) => f.debug_tuple("Fixed").field(set).finish(),
            Search::Composition(def) => f.debug_tuple("Composition").field(&def.name()).finish(),
        }
    }
}

/// A named, reusable boolean composition over declared searches.
///
/// # Example
///
/// ```rust
/// use cohort_engine::{CompositionDefinition, ParamBag};
///
/// let definition = CompositionDefinition::builder("onArtNotPregnant")
///     .search_calculation("onArt", "OnArt", ParamBag::new())
///     .search_calculation("pregnant", "Pregnant", ParamBag::new())
///     .expression("onArt AND NOT pregnant")
///     .build()
///     .unwrap();
///
/// assert_eq!(definition.expression().to_string(), "onArt AND NOT pregnant");
/// ```
#[derive(Debug, Clone)]
pub struct CompositionDefinition {
    name: String,
    searches: BTreeMap<String, Search>,
    expression: Arc<CompositionExpression>,
}

impl CompositionDefinition {
    /// Starts a definition named `name`.
    pub fn builder(name: impl Into<String>) -> CompositionDefinitionBuilder {
        CompositionDefinitionBuilder {
            name: name.into(),
            searches: BTreeMap::new(),
            expression: None,
            duplicate: None,
        }
    }

    /// The definition's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parsed expression.
    pub fn expression(&self) -> &CompositionExpression {
        &self.expression
    }

    /// Declared searches by key.
    pub fn searches(&self) -> &BTreeMap<String, Search> {
        &self.searches
    }

    /// Evaluates the referenced searches and combines them, with `cohort`
    /// as the universe.
    ///
    /// Searches not referenced by the expression are not evaluated. An
    /// entity that any referenced search failed for is left out of the
    /// universe, so it is never a member (not even under `NOT`).
    pub fn evaluate_members(
        &self,
        cohort: &EntitySet,
        params: &ParamBag,
        inv: &Invocation<'_>,
    ) -> EngineResult<EntitySet> {
        Ok(self.evaluate_with_failures(cohort, params, inv)?.members)
    }

    fn evaluate_with_failures(
        &self,
        cohort: &EntitySet,
        params: &ParamBag,
        inv: &Invocation<'_>,
    ) -> EngineResult<Decided> {
        inv.check_cancelled()?;
        let referenced: Vec<(&String, &Search)> = self
            .expression
            .identifiers()
            .into_iter()
            .filter_map(|key| self.searches.get_key_value(key))
            .collect();

        let evaluated = inv.par_map(&referenced, |(key, search)| -> EngineResult<(String, Decided)> {
            let decided = self.evaluate_search(search, cohort, params, inv)?;
            Ok(((*key).clone(), decided))
        });

        let mut searches = HashMap::with_capacity(evaluated.len());
        let mut failures: HashMap<EntityId, String> = HashMap::new();
        for outcome in evaluated {
            let (key, decided) = outcome?;
            for (entity, reason) in decided.failures {
                failures.entry(entity).or_insert(reason);
            }
            searches.insert(key, decided.members);
        }

        let universe = if failures.is_empty() {
            cohort.clone()
        } else {
            let failed: EntitySet = failures.keys().copied().collect();
            debug!(
                composition = %self.name,
                excluded = failed.len(),
                "entities with failed searches left out of the universe"
            );
            cohort.difference(&failed)
        };

        let members = inv
            .manager()
            .compositions()
            .evaluate_expression(&self.expression, &searches, &universe)?;
        Ok(Decided { members, failures })
    }

    fn evaluate_search(
        &self,
        search: &Search,
        cohort: &EntitySet,
        params: &ParamBag,
        inv: &Invocation<'_>,
    ) -> EngineResult<Decided> {
        match search {
            Search::Calculation {
                name,
                params: overrides,
            } => {
                let merged = merge_params(params, overrides);
                let results = inv.calculate(name, cohort, &merged)?;
                Ok(Decided {
                    members: results.truthy(),
                    failures: results.failures().clone(),
                })
            }
            Search::Filter(filter) => Ok(Decided::all(inv.apply_filter(filter.as_ref(), cohort)?)),
            Search::Fixed(set) => Ok(Decided::all(set.intersection(cohort))),
            Search::Composition(nested) => nested.evaluate_with_failures(cohort, params, inv),
        }
    }
}

/// Members of a search plus the entities it could not decide.
struct Decided {
    members: EntitySet,
    failures: HashMap<EntityId, String>,
}

impl Decided {
    fn all(members: EntitySet) -> Self {
        Self {
            members,
            failures: HashMap::new(),
        }
    }
}

fn merge_params(inherited: &ParamBag, overrides: &ParamBag) -> ParamBag {
    let mut merged = inherited.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Registered as a calculation, a definition maps members to `true` and the
/// rest of the cohort to `false`. Entities a search failed for are recorded
/// as failures and get no value.
impl Calculation for CompositionDefinition {
    fn evaluate(
        &self,
        cohort: &EntitySet,
        params: &ParamBag,
        inv: &Invocation<'_>,
    ) -> EngineResult<ResultMap> {
        let decided = self.evaluate_with_failures(cohort, params, inv)?;
        let mut results = ResultMap::new();
        for id in cohort.iter() {
            match decided.failures.get(&id) {
                Some(reason) => results.record_failure(id, reason.clone()),
                None => results.insert_value(id, decided.members.contains(id)),
            }
        }
        Ok(results)
    }
}

/// Builder for [`CompositionDefinition`].
#[derive(Debug)]
pub struct CompositionDefinitionBuilder {
    name: String,
    searches: BTreeMap<String, Search>,
    expression: Option<String>,
    duplicate: Option<String>,
}

impl CompositionDefinitionBuilder {
    /// Adds a search backed by a registered calculation.
    pub fn search_calculation(
        self,
        key: impl Into<String>,
        calculation: impl Into<String>,
        params: ParamBag,
    ) -> Self {
        self.search(
            key,
            Search::Calculation {
                name: calculation.into(),
                params,
            },
        )
    }

    /// Adds a search backed by a filter.
    pub fn search_filter(self, key: impl Into<String>, filter: Arc<dyn Filter>) -> Self {
        self.search(key, Search::Filter(filter))
    }

    /// Adds a fixed set.
    pub fn search_set(self, key: impl Into<String>, set: EntitySet) -> Self {
        self.search(key, Search::Fixed(set))
    }

    /// Adds a nested composition.
    pub fn search_composition(
        self,
        key: impl Into<String>,
        definition: Arc<CompositionDefinition>,
    ) -> Self {
        self.search(key, Search::Composition(definition))
    }

    /// Adds a search.
    pub fn search(mut self, key: impl Into<String>, search: Search) -> Self {
        let key = key.into();
        if self.searches.contains_key(&key) && self.duplicate.is_none() {
            self.duplicate = Some(key.clone());
        }
        self.searches.insert(key, search);
        self
    }

    /// Sets the composition expression.
    pub fn expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    /// Parses the expression and checks it against the declared searches.
    ///
    /// # Errors
    ///
    /// - `InvalidComposition` for a missing expression or a repeated search key
    /// - `MalformedExpression` if the expression does not parse
    /// - `UnknownSearchIdentifier` if it names an undeclared search
    pub fn build(self) -> EngineResult<CompositionDefinition> {
        if let Some(key) = self.duplicate {
            return Err(EngineError::InvalidComposition {
                name: self.name,
                reason: format!("search {} declared twice", key),
            });
        }
        let text = self.expression.ok_or_else(|| EngineError::InvalidComposition {
            name: self.name.clone(),
            reason: "no composition expression".to_string(),
        })?;
        let expression = cohort_expr::parse(&text)?;
        check_identifiers(&expression, |key| self.searches.contains_key(key))?;

        Ok(CompositionDefinition {
            name: self.name,
            searches: self.searches,
            expression: Arc::new(expression),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn searches(entries: &[(&str, &[u64])]) -> HashMap<String, EntitySet> {
        entries
            .iter()
            .map(|(name, ids)| (name.to_string(), ids.iter().copied().collect()))
            .collect()
    }

    fn example() -> (HashMap<String, EntitySet>, EntitySet) {
        (
            searches(&[("onArt", &[1, 2]), ("pregnant", &[2, 3])]),
            [1, 2, 3].into(),
        )
    }

    mod evaluator {
        use super::*;

        #[test]
        fn test_and_or_not() {
            let (searches, universe) = example();
            let evaluator = CompositionEvaluator::new();
            let eval = |expr: &str| evaluator.evaluate(&searches, expr, &universe).unwrap().to_vec();

            assert_eq!(eval("onArt AND pregnant"), vec![2]);
            assert_eq!(eval("onArt OR pregnant"), vec![1, 2, 3]);
            assert_eq!(eval("onArt AND NOT pregnant"), vec![1]);
            assert_eq!(eval("NOT onArt"), vec![3]);
            assert_eq!(eval("NOT (onArt OR pregnant)"), Vec::<u64>::new());
        }

        #[test]
        fn test_not_is_relative_to_universe() {
            let searches = searches(&[("a", &[1])]);
            let universe: EntitySet = [1, 2].into();
            let result = CompositionEvaluator::new()
                .evaluate(&searches, "NOT a", &universe)
                .unwrap();
            assert_eq!(result.to_vec(), vec![2]);
        }

        #[test]
        fn test_leaves_are_clipped_to_universe() {
            let searches = searches(&[("a", &[1, 2, 50]), ("b", &[60])]);
            let universe: EntitySet = [1, 2, 3].into();
            let result = CompositionEvaluator::new()
                .evaluate(&searches, "a OR b", &universe)
                .unwrap();
            assert_eq!(result.to_vec(), vec![1, 2]);
        }

        #[test]
        fn test_unknown_identifier_is_error() {
            let (searches, universe) = example();
            let err = CompositionEvaluator::new()
                .evaluate(&searches, "onArt AND pregant", &universe)
                .unwrap_err();
            assert_eq!(err, EngineError::UnknownSearchIdentifier("pregant".into()));
        }

        #[test]
        fn test_unknown_identifier_under_or_still_fails() {
            let (searches, universe) = example();
            let err = CompositionEvaluator::new()
                .evaluate(&searches, "onArt OR missing", &universe)
                .unwrap_err();
            assert!(matches!(err, EngineError::UnknownSearchIdentifier(_)));
        }

        #[test]
        fn test_malformed_expression() {
            let (searches, universe) = example();
            let err = CompositionEvaluator::new()
                .evaluate(&searches, "onArt AND (pregnant", &universe)
                .unwrap_err();
            assert!(matches!(err, EngineError::MalformedExpression(_)));
        }

        #[test]
        fn test_cache_reuses_parse() {
            let (searches, universe) = example();
            let evaluator = CompositionEvaluator::with_cache(ExpressionCacheConfig::default());
            evaluator.evaluate(&searches, "onArt AND pregnant", &universe).unwrap();
            evaluator.evaluate(&searches, "onArt  AND pregnant", &universe).unwrap();

            let stats = evaluator.cache_stats().unwrap();
            assert_eq!(stats.entries, 1);
            assert_eq!(stats.hits, 1);
            assert!(CompositionEvaluator::new().cache_stats().is_none());
        }
    }

    mod definition {
        use super::*;
        use crate::context::ParamValue;

        #[test]
        fn test_build_validates_identifiers() {
            let err = CompositionDefinition::builder("broken")
                .search_set("a", [1].into())
                .expression("a AND b")
                .build()
                .unwrap_err();
            assert_eq!(err, EngineError::UnknownSearchIdentifier("b".into()));
        }

        #[test]
        fn test_build_requires_expression() {
            let err = CompositionDefinition::builder("empty")
                .search_set("a", [1].into())
                .build()
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidComposition { .. }));
        }

        #[test]
        fn test_build_rejects_duplicate_key() {
            let err = CompositionDefinition::builder("dup")
                .search_set("a", [1].into())
                .search_set("a", [2].into())
                .expression("a")
                .build()
                .unwrap_err();
            assert_eq!(
                err,
                EngineError::InvalidComposition {
                    name: "dup".into(),
                    reason: "search a declared twice".into(),
                }
            );
        }

        #[test]
        fn test_build_rejects_malformed() {
            let err = CompositionDefinition::builder("bad")
                .search_set("a", [1].into())
                .expression("a OR")
                .build()
                .unwrap_err();
            assert!(matches!(err, EngineError::MalformedExpression(_)));
        }

        #[test]
        fn test_unreferenced_searches_allowed() {
            let definition = CompositionDefinition::builder("partial")
                .search_set("a", [1].into())
                .search_set("unused", [2].into())
                .expression("a")
                .build()
                .unwrap();
            assert_eq!(definition.searches().len(), 2);
        }

        #[test]
        fn test_merge_params_overrides() {
            let mut inherited = ParamBag::new();
            inherited.insert("startDate".into(), "2024-01-01".into());
            inherited.insert("months".into(), 6_i64.into());
            let mut overrides = ParamBag::new();
            overrides.insert("months".into(), 12_i64.into());

            let merged = merge_params(&inherited, &overrides);
            assert_eq!(merged.get("months"), Some(&ParamValue::Integer(12)));
            assert!(merged.contains_key("startDate"));
        }
    }
}
