//! The read-only data-source collaborator.
//!
//! This module defines the [`DataSource`] trait through which filters and
//! calculations read raw clinical facts. The engine never writes through it.
//!
//! # Architecture Note
//!
//! This crate intentionally does NOT depend on any database or ETL crate.
//! The trait is defined here; implementations over a concrete store live in
//! the consuming service.
//!
//! # Example: Implementing DataSource
//!
//! ```ignore
//! use cohort_engine::{DataSource, DataSourceResult, Demographics, EntityId, ProgramEnrollment};
//!
//! impl DataSource for ClinicalStore {
//!     fn demographics(&self, entity: EntityId) -> DataSourceResult<Option<Demographics>> {
//!         self.patient_demographics(entity).map_err(into_source_error)
//!     }
//!
//!     fn enrollments(&self, entity: EntityId) -> DataSourceResult<Vec<ProgramEnrollment>> {
//!         self.program_enrollments(entity).map_err(into_source_error)
//!     }
//! }
//! ```

use chrono::{DateTime, Datelike, NaiveDate, Utc};

use crate::context::EvaluationContext;
use crate::entity::EntityId;
use crate::error::DataSourceError;

/// Result type for data-source queries.
pub type DataSourceResult<T> = std::result::Result<T, DataSourceError>;

/// Concept (question / answer code) identifier.
pub type ConceptId = u64;

/// Administrative gender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Gender {
    /// Female.
    Female,
    /// Male.
    Male,
    /// Other / unspecified.
    Other,
}

/// Demographic record for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Demographics {
    /// Recorded gender.
    pub gender: Gender,
    /// Date of birth, if known.
    pub birthdate: Option<NaiveDate>,
    /// Date of death, if recorded.
    pub death_date: Option<DateTime<Utc>>,
}

impl Demographics {
    /// Creates a living entity's record.
    pub fn new(gender: Gender, birthdate: Option<NaiveDate>) -> Self {
        Self {
            gender,
            birthdate,
            death_date: None,
        }
    }

    /// Returns true unless a death was recorded on or before `at`.
    pub fn is_alive_at(&self, at: DateTime<Utc>) -> bool {
        match self.death_date {
            Some(died) => died > at,
            None => true,
        }
    }

    /// Age in completed years on `on`, if the birthdate is known and not in the future.
    pub fn age_on(&self, on: NaiveDate) -> Option<u32> {
        let born = self.birthdate?;
        if born > on {
            return None;
        }
        let mut years = on.year() - born.year();
        if (on.month(), on.day()) < (born.month(), born.day()) {
            years -= 1;
        }
        u32::try_from(years).ok()
    }
}

/// Enrollment of an entity in a program.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramEnrollment {
    /// Program identifier.
    pub program: String,
    /// When the enrollment started.
    pub enrolled_on: DateTime<Utc>,
    /// When the enrollment ended, if it has.
    pub completed_on: Option<DateTime<Utc>>,
}

impl ProgramEnrollment {
    /// Returns true if the enrollment covers `at`.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.enrolled_on <= at && self.completed_on.map_or(true, |done| done > at)
    }
}

/// Value recorded by an observation.
#[derive(Debug, Clone, PartialEq)]
pub enum ObsValue {
    /// Numeric value (lab result, vital sign).
    Numeric(f64),
    /// Coded answer.
    Coded(ConceptId),
    /// Free text.
    Text(String),
    /// Date/time answer.
    DateTime(DateTime<Utc>),
    /// Yes/no answer.
    Boolean(bool),
}

/// A single recorded observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Question concept.
    pub concept: ConceptId,
    /// Recorded value.
    pub value: ObsValue,
    /// When the observation was made.
    pub observed_at: DateTime<Utc>,
}

/// A clinical encounter.
#[derive(Debug, Clone, PartialEq)]
pub struct Encounter {
    /// Encounter identifier.
    pub id: u64,
    /// Encounter type identifier.
    pub encounter_type: String,
    /// Form used to capture the encounter, if any.
    pub form: Option<String>,
    /// When the encounter took place.
    pub occurred_at: DateTime<Utc>,
}

/// An order (lab test, drug).
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    /// Order identifier.
    pub id: u64,
    /// Ordered concept.
    pub concept: ConceptId,
    /// When the order was activated.
    pub activated_at: DateTime<Utc>,
    /// When the order was stopped, if it was.
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Returns true if the order is active at `at`.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.activated_at <= at && self.stopped_at.map_or(true, |stopped| stopped > at)
    }
}

/// Inclusive time window for data-source queries (open ends are unbounded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateWindow {
    /// Earliest instant included.
    pub from: Option<DateTime<Utc>>,
    /// Latest instant included.
    pub to: Option<DateTime<Utc>>,
}

impl DateWindow {
    /// Unbounded window.
    pub fn all() -> Self {
        Self::default()
    }

    /// Everything up to and including `to`.
    pub fn until(to: DateTime<Utc>) -> Self {
        Self {
            from: None,
            to: Some(to),
        }
    }

    /// Window between two instants, inclusive.
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// `startDate` (if any) to `endDate` or `now`.
    pub fn from_context(ctx: &EvaluationContext) -> Self {
        Self {
            from: ctx.start_date(),
            to: Some(ctx.window_end()),
        }
    }

    /// Checks if an instant falls inside the window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

/// Read-only source of raw clinical facts.
///
/// Every method is a blocking call from the engine's point of view. Errors
/// mean the source could not answer at all (e.g. the database is down); a
/// missing record is `Ok(None)` / `Ok(vec![])`, not an error.
///
/// # Required Methods
///
/// - [`demographics`](Self::demographics) - gender, birth and death dates
/// - [`enrollments`](Self::enrollments) - program enrollments
///
/// # Optional Methods (with defaults)
///
/// Observation, encounter and order queries default to empty results.
/// Override them for calculations that read those facts.
pub trait DataSource: Send + Sync {
    /// Gets the demographic record of an entity.
    fn demographics(&self, entity: EntityId) -> DataSourceResult<Option<Demographics>>;

    /// Gets all program enrollments of an entity.
    fn enrollments(&self, entity: EntityId) -> DataSourceResult<Vec<ProgramEnrollment>>;

    /// Gets observations of a concept recorded inside the window.
    fn observations(
        &self,
        entity: EntityId,
        concept: ConceptId,
        window: &DateWindow,
    ) -> DataSourceResult<Vec<Observation>> {
        let _ = (entity, concept, window);
        Ok(Vec::new())
    }

    /// Gets encounters of a type that took place inside the window.
    fn encounters(
        &self,
        entity: EntityId,
        encounter_type: &str,
        window: &DateWindow,
    ) -> DataSourceResult<Vec<Encounter>> {
        let _ = (entity, encounter_type, window);
        Ok(Vec::new())
    }

    /// Gets orders active at an instant.
    fn active_orders(&self, entity: EntityId, at: DateTime<Utc>) -> DataSourceResult<Vec<Order>> {
        let _ = (entity, at);
        Ok(Vec::new())
    }

    /// Gets the most recent observation of a concept inside the window.
    fn latest_observation(
        &self,
        entity: EntityId,
        concept: ConceptId,
        window: &DateWindow,
    ) -> DataSourceResult<Option<Observation>> {
        Ok(self
            .observations(entity, concept, window)?
            .into_iter()
            .filter(|obs| window.contains(obs.observed_at))
            .max_by_key(|obs| obs.observed_at))
    }

    /// Gets the most recent encounter of a type inside the window.
    fn latest_encounter(
        &self,
        entity: EntityId,
        encounter_type: &str,
        window: &DateWindow,
    ) -> DataSourceResult<Option<Encounter>> {
        Ok(self
            .encounters(entity, encounter_type, window)?
            .into_iter()
            .filter(|enc| window.contains(enc.occurred_at))
            .max_by_key(|enc| enc.occurred_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    /// Mock store for testing the DataSource defaults.
    struct MockStore {
        obs: HashMap<EntityId, Vec<Observation>>,
    }

    impl DataSource for MockStore {
        fn demographics(&self, _entity: EntityId) -> DataSourceResult<Option<Demographics>> {
            Ok(None)
        }

        fn enrollments(&self, _entity: EntityId) -> DataSourceResult<Vec<ProgramEnrollment>> {
            Ok(Vec::new())
        }

        fn observations(
            &self,
            entity: EntityId,
            concept: ConceptId,
            _window: &DateWindow,
        ) -> DataSourceResult<Vec<Observation>> {
            Ok(self
                .obs
                .get(&entity)
                .map(|all| all.iter().filter(|o| o.concept == concept).cloned().collect())
                .unwrap_or_default())
        }
    }

    fn vl(value: f64, when: DateTime<Utc>) -> Observation {
        Observation {
            concept: 856,
            value: ObsValue::Numeric(value),
            observed_at: when,
        }
    }

    #[test]
    fn test_latest_observation_respects_window() {
        let mut obs = HashMap::new();
        obs.insert(
            1,
            vec![vl(1200.0, at(2023, 1, 10)), vl(40.0, at(2023, 8, 1)), vl(20.0, at(2024, 2, 1))],
        );
        let store = MockStore { obs };

        let latest = store
            .latest_observation(1, 856, &DateWindow::until(at(2023, 12, 31)))
            .unwrap()
            .unwrap();
        assert_eq!(latest.value, ObsValue::Numeric(40.0));

        let latest_all = store.latest_observation(1, 856, &DateWindow::all()).unwrap().unwrap();
        assert_eq!(latest_all.value, ObsValue::Numeric(20.0));

        assert!(store.latest_observation(2, 856, &DateWindow::all()).unwrap().is_none());
    }

    #[test]
    fn test_default_optional_methods_are_empty() {
        let store = MockStore { obs: HashMap::new() };
        assert!(store.encounters(1, "triage", &DateWindow::all()).unwrap().is_empty());
        assert!(store.active_orders(1, at(2024, 1, 1)).unwrap().is_empty());
        assert!(store.latest_encounter(1, "triage", &DateWindow::all()).unwrap().is_none());
    }

    #[test]
    fn test_alive_at() {
        let mut person = Demographics::new(Gender::Female, None);
        assert!(person.is_alive_at(at(2024, 1, 1)));
        person.death_date = Some(at(2023, 6, 1));
        assert!(!person.is_alive_at(at(2024, 1, 1)));
        assert!(person.is_alive_at(at(2023, 1, 1)));
    }

    #[test]
    fn test_age_on() {
        let person = Demographics::new(
            Gender::Male,
            NaiveDate::from_ymd_opt(2000, 6, 15),
        );
        assert_eq!(person.age_on(NaiveDate::from_ymd_opt(2024, 6, 14).unwrap()), Some(23));
        assert_eq!(person.age_on(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()), Some(24));
        assert_eq!(person.age_on(NaiveDate::from_ymd_opt(1999, 1, 1).unwrap()), None);
        assert_eq!(Demographics::new(Gender::Male, None).age_on(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()), None);
    }

    #[test]
    fn test_enrollment_active() {
        let enrollment = ProgramEnrollment {
            program: "hiv".into(),
            enrolled_on: at(2020, 1, 1),
            completed_on: Some(at(2023, 1, 1)),
        };
        assert!(enrollment.is_active_at(at(2021, 5, 5)));
        assert!(!enrollment.is_active_at(at(2023, 1, 1)));
        assert!(!enrollment.is_active_at(at(2019, 12, 31)));
    }

    #[test]
    fn test_window_contains() {
        let window = DateWindow::between(at(2024, 1, 1), at(2024, 3, 31));
        assert!(window.contains(at(2024, 1, 1)));
        assert!(window.contains(at(2024, 3, 31)));
        assert!(!window.contains(at(2024, 4, 1)));
        assert!(DateWindow::all().contains(at(1900, 1, 1)));
    }

    #[test]
    fn test_window_from_context() {
        let ctx = EvaluationContext::new(at(2024, 6, 1)).with_param(
            crate::context::START_DATE,
            at(2024, 1, 1),
        );
        let window = DateWindow::from_context(&ctx);
        assert_eq!(window.from, Some(at(2024, 1, 1)));
        assert_eq!(window.to, Some(at(2024, 6, 1)));
    }
}
