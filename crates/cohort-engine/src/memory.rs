//! In-memory [`DataSource`] for tests, fixtures and demos.
//!
//! Only built with the `test-util` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::entity::EntityId;
use crate::error::DataSourceError;
use crate::traits::{
    ConceptId, DataSource, DataSourceResult, DateWindow, Demographics, Encounter, Observation,
    Order, ProgramEnrollment,
};

#[derive(Debug, Default)]
struct Records {
    demographics: HashMap<EntityId, Demographics>,
    enrollments: HashMap<EntityId, Vec<ProgramEnrollment>>,
    observations: HashMap<EntityId, Vec<Observation>>,
    encounters: HashMap<EntityId, Vec<Encounter>>,
    orders: HashMap<EntityId, Vec<Order>>,
}

/// Mutable in-memory store implementing [`DataSource`].
///
/// Records can be added after construction, which lets a test change the
/// underlying facts between two evaluations. [`set_unavailable`](Self::set_unavailable)
/// makes every query fail with [`DataSourceError::Unavailable`].
#[derive(Debug, Default)]
pub struct InMemoryDataSource {
    records: RwLock<Records>,
    unavailable: AtomicBool,
    queries: AtomicU64,
}

impl InMemoryDataSource {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an entity's demographic record.
    pub fn with_person(self, entity: EntityId, demographics: Demographics) -> Self {
        self.add_person(entity, demographics);
        self
    }

    /// Adds a program enrollment.
    pub fn with_enrollment(self, entity: EntityId, enrollment: ProgramEnrollment) -> Self {
        self.add_enrollment(entity, enrollment);
        self
    }

    /// Adds an observation.
    pub fn with_observation(self, entity: EntityId, observation: Observation) -> Self {
        self.add_observation(entity, observation);
        self
    }

    /// Adds an encounter.
    pub fn with_encounter(self, entity: EntityId, encounter: Encounter) -> Self {
        self.add_encounter(entity, encounter);
        self
    }

    /// Adds an order.
    pub fn with_order(self, entity: EntityId, order: Order) -> Self {
        self.records.write().orders.entry(entity).or_default().push(order);
        self
    }

    /// Adds (or replaces) an entity's demographic record in place.
    pub fn add_person(&self, entity: EntityId, demographics: Demographics) {
        self.records.write().demographics.insert(entity, demographics);
    }

    /// Removes an entity's demographic record.
    pub fn remove_person(&self, entity: EntityId) {
        self.records.write().demographics.remove(&entity);
    }

    /// Adds a program enrollment in place.
    pub fn add_enrollment(&self, entity: EntityId, enrollment: ProgramEnrollment) {
        self.records
            .write()
            .enrollments
            .entry(entity)
            .or_default()
            .push(enrollment);
    }

    /// Adds an observation in place.
    pub fn add_observation(&self, entity: EntityId, observation: Observation) {
        self.records
            .write()
            .observations
            .entry(entity)
            .or_default()
            .push(observation);
    }

    /// Adds an encounter in place.
    pub fn add_encounter(&self, entity: EntityId, encounter: Encounter) {
        self.records
            .write()
            .encounters
            .entry(entity)
            .or_default()
            .push(encounter);
    }

    /// Makes every query fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of queries served so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn check(&self) -> DataSourceResult<()> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DataSourceError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }
}

impl DataSource for InMemoryDataSource {
    fn demographics(&self, entity: EntityId) -> DataSourceResult<Option<Demographics>> {
        self.check()?;
        Ok(self.records.read().demographics.get(&entity).cloned())
    }

    fn enrollments(&self, entity: EntityId) -> DataSourceResult<Vec<ProgramEnrollment>> {
        self.check()?;
        Ok(self
            .records
            .read()
            .enrollments
            .get(&entity)
            .cloned()
            .unwrap_or_default())
    }

    fn observations(
        &self,
        entity: EntityId,
        concept: ConceptId,
        window: &DateWindow,
    ) -> DataSourceResult<Vec<Observation>> {
        self.check()?;
        Ok(self
            .records
            .read()
            .observations
            .get(&entity)
            .map(|all| {
                all.iter()
                    .filter(|obs| obs.concept == concept && window.contains(obs.observed_at))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn encounters(
        &self,
        entity: EntityId,
        encounter_type: &str,
        window: &DateWindow,
    ) -> DataSourceResult<Vec<Encounter>> {
        self.check()?;
        Ok(self
            .records
            .read()
            .encounters
            .get(&entity)
            .map(|all| {
                all.iter()
                    .filter(|enc| {
                        enc.encounter_type == encounter_type && window.contains(enc.occurred_at)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn active_orders(&self, entity: EntityId, at: DateTime<Utc>) -> DataSourceResult<Vec<Order>> {
        self.check()?;
        Ok(self
            .records
            .read()
            .orders
            .get(&entity)
            .map(|all| all.iter().filter(|o| o.is_active_at(at)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{Gender, ObsValue};
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_records_are_scoped_per_entity() {
        let source = InMemoryDataSource::new()
            .with_person(1, Demographics::new(Gender::Female, None))
            .with_observation(
                1,
                Observation {
                    concept: 5089,
                    value: ObsValue::Numeric(61.0),
                    observed_at: at(2024, 1, 5),
                },
            );

        assert!(source.demographics(1).unwrap().is_some());
        assert!(source.demographics(2).unwrap().is_none());
        assert_eq!(source.observations(1, 5089, &DateWindow::all()).unwrap().len(), 1);
        assert!(source.observations(2, 5089, &DateWindow::all()).unwrap().is_empty());
        assert!(source.observations(1, 5090, &DateWindow::all()).unwrap().is_empty());
    }

    #[test]
    fn test_unavailable() {
        let source = InMemoryDataSource::new();
        source.set_unavailable(true);
        assert!(matches!(
            source.demographics(1),
            Err(DataSourceError::Unavailable(_))
        ));
        source.set_unavailable(false);
        assert!(source.demographics(1).is_ok());
        assert_eq!(source.query_count(), 2);
    }

    #[test]
    fn test_active_orders() {
        let source = InMemoryDataSource::new().with_order(
            3,
            Order {
                id: 1,
                concept: 856,
                activated_at: at(2024, 1, 1),
                stopped_at: Some(at(2024, 2, 1)),
            },
        );
        assert_eq!(source.active_orders(3, at(2024, 1, 15)).unwrap().len(), 1);
        assert!(source.active_orders(3, at(2024, 3, 1)).unwrap().is_empty());
    }
}
