//! Reusable cohort predicates.
//!
//! A [`Filter`] narrows a cohort using only the evaluation context and the
//! data source. It never depends on calculation results and never fails for
//! an individual entity: an entity lacking the data a filter needs (no
//! demographic record, no birthdate) is excluded. Only a data-source outage
//! fails the whole call.
//!
//! Filters compose by sequential application, which is set intersection:
//!
//! ```rust
//! use std::sync::Arc;
//! use cohort_engine::filters::{Alive, FilterChain, Gender as GenderFilter};
//!
//! let alive_women = FilterChain::new("aliveFemale")
//!     .then(Arc::new(GenderFilter::female()))
//!     .then(Arc::new(Alive));
//! ```

use std::sync::Arc;

use crate::context::EvaluationContext;
use crate::entity::{EntityId, EntitySet};
use crate::error::EngineResult;
use crate::traits::{self, DataSource, DataSourceResult};

/// A cheap, frequently reused cohort predicate.
pub trait Filter: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Returns the members of `cohort` that pass the predicate.
    ///
    /// The result is always a subset of `cohort`.
    fn apply(
        &self,
        cohort: &EntitySet,
        ctx: &EvaluationContext,
        source: &dyn DataSource,
    ) -> EngineResult<EntitySet>;
}

/// Keeps the members for which `keep` returns true; the first data-source
/// error aborts.
fn retain_where<F>(cohort: &EntitySet, mut keep: F) -> EngineResult<EntitySet>
where
    F: FnMut(EntityId) -> DataSourceResult<bool>,
{
    let mut kept = Vec::with_capacity(cohort.len());
    for id in cohort.iter() {
        if keep(id)? {
            kept.push(id);
        }
    }
    Ok(EntitySet::from(kept))
}

/// Entities alive at `ctx.now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Alive;

impl Filter for Alive {
    fn name(&self) -> &str {
        "alive"
    }

    fn apply(
        &self,
        cohort: &EntitySet,
        ctx: &EvaluationContext,
        source: &dyn DataSource,
    ) -> EngineResult<EntitySet> {
        let now = ctx.now();
        retain_where(cohort, |id| {
            Ok(source
                .demographics(id)?
                .map_or(false, |person| person.is_alive_at(now)))
        })
    }
}

/// Entities of one gender.
#[derive(Debug, Clone, Copy)]
pub struct Gender {
    gender: traits::Gender,
}

impl Gender {
    /// Entities of the given gender.
    pub fn new(gender: traits::Gender) -> Self {
        Self { gender }
    }

    /// Female entities.
    pub fn female() -> Self {
        Self::new(traits::Gender::Female)
    }

    /// Male entities.
    pub fn male() -> Self {
        Self::new(traits::Gender::Male)
    }
}

impl Filter for Gender {
    fn name(&self) -> &str {
        match self.gender {
            traits::Gender::Female => "female",
            traits::Gender::Male => "male",
            traits::Gender::Other => "otherGender",
        }
    }

    fn apply(
        &self,
        cohort: &EntitySet,
        _ctx: &EvaluationContext,
        source: &dyn DataSource,
    ) -> EngineResult<EntitySet> {
        retain_where(cohort, |id| {
            Ok(source
                .demographics(id)?
                .map_or(false, |person| person.gender == self.gender))
        })
    }
}

/// Entities with an enrollment in a program active at `ctx.now()`.
#[derive(Debug, Clone)]
pub struct InProgram {
    program: String,
    name: String,
}

impl InProgram {
    /// Entities actively enrolled in `program`.
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let name = format!("inProgram({})", program);
        Self { program, name }
    }

    /// The program identifier.
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Filter for InProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(
        &self,
        cohort: &EntitySet,
        ctx: &EvaluationContext,
        source: &dyn DataSource,
    ) -> EngineResult<EntitySet> {
        let now = ctx.now();
        retain_where(cohort, |id| {
            Ok(source
                .enrollments(id)?
                .iter()
                .any(|e| e.program == self.program && e.is_active_at(now)))
        })
    }
}

/// Entities whose age in completed years on `ctx.today()` lies in an
/// inclusive range. Entities with no known birthdate are excluded.
#[derive(Debug, Clone)]
pub struct AgeRange {
    min: Option<u32>,
    max: Option<u32>,
    name: String,
}

impl AgeRange {
    /// Inclusive age range; `None` leaves that end open.
    pub fn new(min: Option<u32>, max: Option<u32>) -> Self {
        let bound = |b: Option<u32>| b.map_or_else(|| "*".to_string(), |v| v.to_string());
        let name = format!("age({}..={})", bound(min), bound(max));
        Self { min, max, name }
    }

    /// Age at least `min`.
    pub fn at_least(min: u32) -> Self {
        Self::new(Some(min), None)
    }

    /// Age at most `max`.
    pub fn at_most(max: u32) -> Self {
        Self::new(None, Some(max))
    }

    fn admits(&self, age: u32) -> bool {
        self.min.map_or(true, |min| age >= min) && self.max.map_or(true, |max| age <= max)
    }
}

impl Filter for AgeRange {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(
        &self,
        cohort: &EntitySet,
        ctx: &EvaluationContext,
        source: &dyn DataSource,
    ) -> EngineResult<EntitySet> {
        let today = ctx.today();
        retain_where(cohort, |id| {
            Ok(source
                .demographics(id)?
                .and_then(|person| person.age_on(today))
                .map_or(false, |age| self.admits(age)))
        })
    }
}

/// Applies filters in order, each to the previous one's output.
#[derive(Clone)]
pub struct FilterChain {
    name: String,
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    /// Creates an empty chain (which passes every entity).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
        }
    }

    /// Appends a filter.
    pub fn then(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Number of filters in the chain.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns true if the chain has no filters.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.filters.iter().map(|filter| filter.name()).collect();
        f.debug_struct("FilterChain")
            .field("name", &self.name)
            .field("filters", &names)
            .finish()
    }
}

impl Filter for FilterChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(
        &self,
        cohort: &EntitySet,
        ctx: &EvaluationContext,
        source: &dyn DataSource,
    ) -> EngineResult<EntitySet> {
        let mut current = cohort.clone();
        for filter in &self.filters {
            if current.is_empty() {
                break;
            }
            current = filter.apply(&current, ctx, source)?;
        }
        Ok(current)
    }
}
