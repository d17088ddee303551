//! The calculation contract and the per-call invocation handle.
//!
//! A [`Calculation`] turns a cohort plus parameters into a [`ResultMap`].
//! Everything it may touch during evaluation reaches it through the
//! [`Invocation`]: the frozen [`EvaluationContext`], the [`DataSource`],
//! nested calculation calls (cycle-checked by the manager), filters, the
//! worker pool and the cancellation signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::context::{EvaluationContext, ParamBag, ParamKind, ParamValue};
use crate::entity::{EntityId, EntitySet};
use crate::error::{EngineError, EngineResult};
use crate::filters::Filter;
use crate::manager::CalculationManager;
use crate::result::{ResultMap, ResultValue};
use crate::traits::DataSource;

/// A named unit of computation over a cohort.
///
/// Implementations are stateless with respect to a single call: the cohort,
/// the parameters and the invocation's context fully determine the output.
/// Any caching happens outside the calculation.
///
/// # Example
///
/// ```rust
/// use cohort_engine::{Calculation, EngineResult, EntitySet, Invocation, ParamBag, ResultMap};
///
/// struct EveryoneFlagged;
///
/// impl Calculation for EveryoneFlagged {
///     fn evaluate(
///         &self,
///         cohort: &EntitySet,
///         _params: &ParamBag,
///         inv: &Invocation<'_>,
///     ) -> EngineResult<ResultMap> {
///         inv.for_each_entity(cohort, |_| Ok(Some(true.into())))
///     }
/// }
/// ```
pub trait Calculation: Send + Sync {
    /// Evaluates the calculation for every member of `cohort`.
    ///
    /// Return `Err(EngineError::EntityEvaluation { .. })` only from per-entity
    /// work driven through [`Invocation::for_each_entity`]; any error returned
    /// from here fails the whole call.
    fn evaluate(
        &self,
        cohort: &EntitySet,
        params: &ParamBag,
        inv: &Invocation<'_>,
    ) -> EngineResult<ResultMap>;

    /// Declared parameters, validated by the manager before evaluation.
    fn parameters(&self) -> &[ParameterSpec] {
        &[]
    }
}

/// A calculation backed by a closure.
pub struct FnCalculation<F> {
    f: F,
    parameters: Vec<ParameterSpec>,
}

impl<F> FnCalculation<F> {
    /// Declares a parameter.
    pub fn with_parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }
}

/// Wraps a closure as a [`Calculation`].
pub fn from_fn<F>(f: F) -> FnCalculation<F>
where
    F: Fn(&EntitySet, &ParamBag, &Invocation<'_>) -> EngineResult<ResultMap> + Send + Sync,
{
    FnCalculation {
        f,
        parameters: Vec::new(),
    }
}

impl<F> Calculation for FnCalculation<F>
where
    F: Fn(&EntitySet, &ParamBag, &Invocation<'_>) -> EngineResult<ResultMap> + Send + Sync,
{
    fn evaluate(
        &self,
        cohort: &EntitySet,
        params: &ParamBag,
        inv: &Invocation<'_>,
    ) -> EngineResult<ResultMap> {
        (self.f)(cohort, params, inv)
    }

    fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }
}

/// Declared parameter of a calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Expected kind.
    pub kind: ParamKind,
    /// Whether evaluation fails when the parameter is absent.
    pub required: bool,
}

impl ParameterSpec {
    /// A required parameter.
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    /// An optional parameter.
    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Cooperative cancellation signal for a batch evaluation.
///
/// Clones share the same flag. The engine checks it between entities and
/// before every nested calculation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Shared, read-only state of one evaluation tree.
#[derive(Clone, Copy)]
pub(crate) struct Scope<'a> {
    pub(crate) source: &'a dyn DataSource,
    pub(crate) ctx: &'a EvaluationContext,
    pub(crate) cancel: &'a CancellationToken,
}

/// One in-progress call on the evaluation stack.
///
/// `key` is a fingerprint of the cohort and parameters. It only screens
/// candidates: a call repeats a frame when the cohort and parameters are
/// actually equal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallFrame<'a> {
    pub(crate) name: &'a str,
    pub(crate) key: u64,
    pub(crate) cohort: &'a EntitySet,
    pub(crate) params: &'a ParamBag,
    pub(crate) depth: usize,
    pub(crate) parent: Option<&'a CallFrame<'a>>,
}

impl<'a> CallFrame<'a> {
    /// This frame followed by its ancestors, innermost first.
    fn ancestry(&self) -> impl Iterator<Item = &CallFrame<'a>> {
        std::iter::successors(Some(self), |frame| frame.parent)
    }

    /// If `name` is already on the stack with the same cohort and
    /// parameters, returns the call chain from that earlier call down to the
    /// repeated one.
    pub(crate) fn find_cycle(
        &self,
        name: &str,
        key: u64,
        cohort: &EntitySet,
        params: &ParamBag,
    ) -> Option<Vec<String>> {
        let mut chain = Vec::new();
        for frame in self.ancestry() {
            chain.push(frame.name.to_string());
            if frame.name == name
                && frame.key == key
                && frame.cohort == cohort
                && frame.params == params
            {
                chain.reverse();
                chain.push(name.to_string());
                return Some(chain);
            }
        }
        None
    }
}

/// Handle passed to [`Calculation::evaluate`] for one call.
pub struct Invocation<'a> {
    pub(crate) manager: &'a CalculationManager,
    pub(crate) scope: Scope<'a>,
    pub(crate) frame: CallFrame<'a>,
}

impl<'a> Invocation<'a> {
    /// The frozen evaluation context.
    pub fn context(&self) -> &EvaluationContext {
        self.scope.ctx
    }

    /// The data source.
    pub fn source(&self) -> &dyn DataSource {
        self.scope.source
    }

    /// Shorthand for `context().now()`.
    pub fn now(&self) -> DateTime<Utc> {
        self.scope.ctx.now()
    }

    /// Name of the calculation being evaluated.
    pub fn calculation_name(&self) -> &str {
        self.frame.name
    }

    /// Nesting depth of this call (0 for a top-level call).
    pub fn depth(&self) -> usize {
        self.frame.depth
    }

    /// The manager running this call.
    pub fn manager(&self) -> &CalculationManager {
        self.manager
    }

    /// Evaluates another registered calculation over `cohort`.
    ///
    /// Fails with `CycleDetected` if that call, with the same cohort and
    /// parameters, is already in progress higher up this call stack.
    pub fn calculate(
        &self,
        name: &str,
        cohort: &EntitySet,
        params: &ParamBag,
    ) -> EngineResult<ResultMap> {
        self.manager
            .evaluate_in(name, cohort, params, self.scope, Some(&self.frame))
    }

    /// Evaluates independent sibling calculations over the same cohort, in
    /// parallel when the manager has a worker pool.
    ///
    /// Results come back in the order of `calls`; the first fatal error wins.
    pub fn calculate_all(
        &self,
        cohort: &EntitySet,
        calls: &[(&str, &ParamBag)],
    ) -> EngineResult<Vec<ResultMap>> {
        self.manager
            .par_map(calls, |(name, params)| self.calculate(name, cohort, params))
            .into_iter()
            .collect()
    }

    /// Applies a filter, clamping its output to `cohort`.
    pub fn apply_filter(&self, filter: &dyn Filter, cohort: &EntitySet) -> EngineResult<EntitySet> {
        self.check_cancelled()?;
        let passed = filter.apply(cohort, self.scope.ctx, self.scope.source)?;
        if passed.is_subset(cohort) {
            Ok(passed)
        } else {
            warn!(
                filter = filter.name(),
                calculation = self.frame.name,
                "filter returned entities outside its cohort; discarded"
            );
            Ok(passed.intersection(cohort))
        }
    }

    /// Looks up a parameter in the call's bag first, then in the context.
    pub fn param<'p>(&'p self, params: &'p ParamBag, name: &str) -> Option<&'p ParamValue> {
        params.get(name).or_else(|| self.scope.ctx.param(name))
    }

    /// Returns `Err(Cancelled)` once the batch was cancelled.
    pub fn check_cancelled(&self) -> EngineResult<()> {
        self.scope.cancel.check()
    }

    /// Maps items on the manager's worker pool (sequentially without one).
    pub fn par_map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Send + Sync,
    {
        self.manager.par_map(items, f)
    }

    /// Evaluates `f` once per entity and collects the values.
    ///
    /// `Ok(None)` leaves the entity out of the map. An entity-scoped error
    /// (`EngineError::EntityEvaluation`) is logged and recorded as that
    /// entity's failure; the remaining entities still run. Any other error
    /// aborts the whole call. Cancellation is checked before each entity.
    pub fn for_each_entity<F>(&self, cohort: &EntitySet, f: F) -> EngineResult<ResultMap>
    where
        F: Fn(EntityId) -> EngineResult<Option<ResultValue>> + Send + Sync,
    {
        let ids = cohort.to_vec();
        let outcomes = self.par_map(&ids, |&id| {
            self.check_cancelled()?;
            f(id)
        });

        let mut results = ResultMap::new();
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(Some(value)) => results.insert_value(id, value),
                Ok(None) => {}
                Err(EngineError::EntityEvaluation { reason, .. }) => {
                    warn!(
                        calculation = self.frame.name,
                        entity = id,
                        reason = %reason,
                        "entity evaluation failed; excluded from results"
                    );
                    results.record_failure(id, reason);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    }
}

impl std::fmt::Debug for Invocation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("calculation", &self.frame.name)
            .field("depth", &self.frame.depth)
            .field("now", &self.scope.ctx.now())
            .finish()
    }
}
