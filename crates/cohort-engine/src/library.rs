//! Generic data-backed calculations.
//!
//! These cover the recurring shapes of clinical rules: the latest value of
//! an observation, the latest encounter of a type, and a boolean per entity
//! from a filter. Rule content (which concept, which encounter type) is
//! supplied by the caller at registration time.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;

use crate::calculation::{Calculation, Invocation, ParameterSpec};
use crate::context::{ParamBag, ParamKind, ParamValue};
use crate::entity::EntitySet;
use crate::error::EngineResult;
use crate::filters::Filter;
use crate::result::{ResultMap, ResultValue};
use crate::traits::{ConceptId, DateWindow, ObsValue};

/// Parameter limiting how far back a lookup searches, in days before the
/// end of the window.
pub const LOOKBACK_DAYS: &str = "lookbackDays";

/// Window from `startDate` (or `lookbackDays` before the end, if later) to
/// `endDate`/`now`.
fn lookup_window(params: &ParamBag, inv: &Invocation<'_>) -> DateWindow {
    let mut window = DateWindow::from_context(inv.context());
    if let Some(days) = inv.param(params, LOOKBACK_DAYS).and_then(ParamValue::as_i64) {
        let end = inv.context().window_end();
        // A lookback reaching past the representable range does not narrow the window.
        let lookback = Duration::try_days(days.max(0)).and_then(|span| end.checked_sub_signed(span));
        if let Some(lookback) = lookback {
            window.from = Some(window.from.map_or(lookback, |from| from.max(lookback)));
        }
    }
    window
}

fn obs_value(value: &ObsValue) -> ResultValue {
    match value {
        ObsValue::Numeric(n) => ResultValue::Numeric(*n),
        ObsValue::Coded(concept) => ResultValue::Text(concept.to_string()),
        ObsValue::Text(text) => ResultValue::Text(text.clone()),
        ObsValue::DateTime(at) => ResultValue::Date(*at),
        ObsValue::Boolean(b) => ResultValue::Boolean(*b),
    }
}

/// Most recent observation of a concept inside the window.
///
/// Produces `Structured { "value", "date" }`; entities without an
/// observation are absent.
#[derive(Debug, Clone)]
pub struct LastObservation {
    concept: ConceptId,
    parameters: Vec<ParameterSpec>,
}

impl LastObservation {
    /// Latest observation of `concept`.
    pub fn new(concept: ConceptId) -> Self {
        Self {
            concept,
            parameters: vec![ParameterSpec::optional(LOOKBACK_DAYS, ParamKind::Integer)],
        }
    }
}

impl Calculation for LastObservation {
    fn evaluate(
        &self,
        cohort: &EntitySet,
        params: &ParamBag,
        inv: &Invocation<'_>,
    ) -> EngineResult<ResultMap> {
        let window = lookup_window(params, inv);
        inv.for_each_entity(cohort, |id| {
            let latest = inv.source().latest_observation(id, self.concept, &window)?;
            Ok(latest.map(|obs| {
                let mut fields = BTreeMap::new();
                fields.insert("value".to_string(), obs_value(&obs.value));
                fields.insert("date".to_string(), ResultValue::Date(obs.observed_at));
                ResultValue::Structured(fields)
            }))
        })
    }

    fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }
}

/// Date of the most recent encounter of a type inside the window.
#[derive(Debug, Clone)]
pub struct LastEncounter {
    encounter_type: String,
    parameters: Vec<ParameterSpec>,
}

impl LastEncounter {
    /// Latest encounter of `encounter_type`.
    pub fn new(encounter_type: impl Into<String>) -> Self {
        Self {
            encounter_type: encounter_type.into(),
            parameters: vec![ParameterSpec::optional(LOOKBACK_DAYS, ParamKind::Integer)],
        }
    }
}

impl Calculation for LastEncounter {
    fn evaluate(
        &self,
        cohort: &EntitySet,
        params: &ParamBag,
        inv: &Invocation<'_>,
    ) -> EngineResult<ResultMap> {
        let window = lookup_window(params, inv);
        inv.for_each_entity(cohort, |id| {
            Ok(inv
                .source()
                .latest_encounter(id, &self.encounter_type, &window)?
                .map(|enc| ResultValue::Date(enc.occurred_at)))
        })
    }

    fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }
}

/// `true` for entities passing a filter, `false` for the rest of the cohort.
#[derive(Clone)]
pub struct FilterCalculation {
    filter: Arc<dyn Filter>,
}

impl FilterCalculation {
    /// Wraps a filter.
    pub fn new(filter: Arc<dyn Filter>) -> Self {
        Self { filter }
    }
}

impl std::fmt::Debug for FilterCalculation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FilterCalculation")
            .field(&self.filter.name())
            .finish()
    }
}

impl Calculation for FilterCalculation {
    fn evaluate(
        &self,
        cohort: &EntitySet,
        _params: &ParamBag,
        inv: &Invocation<'_>,
    ) -> EngineResult<ResultMap> {
        let passed = inv.apply_filter(self.filter.as_ref(), cohort)?;
        let mut results = ResultMap::new();
        for id in cohort.iter() {
            results.insert_value(id, passed.contains(id));
        }
        Ok(results)
    }
}
