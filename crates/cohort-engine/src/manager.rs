//! Calculation registry and evaluation entry points.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, debug_span, info, warn};

use crate::calculation::{CallFrame, CancellationToken, Calculation, Invocation, Scope};
use crate::composition::{CompositionDefinition, CompositionEvaluator};
use crate::config::EngineConfig;
use crate::context::{params_fingerprint, EvaluationContext, ParamBag};
use crate::entity::EntitySet;
use crate::error::{EngineError, EngineResult};
use crate::result::{CalculationName, ResultMap};
use crate::traits::DataSource;

/// A registered calculation plus its flag metadata.
#[derive(Clone)]
struct Registration {
    calculation: Arc<dyn Calculation>,
    /// `Some(message)` for flag calculations.
    flag_message: Option<String>,
}

/// Collects calculation registrations before the registry is frozen.
///
/// # Example
///
/// ```rust
/// use cohort_engine::{calculation, CalculationManager, EngineConfig};
///
/// let mut builder = CalculationManager::builder();
/// builder
///     .register_flag(
///         "NeedsViralLoad",
///         calculation::from_fn(|cohort, _params, inv| {
///             inv.for_each_entity(cohort, |_| Ok(Some(false.into())))
///         }),
///         "Due for Viral Load",
///     )
///     .unwrap();
/// let manager = builder.build(EngineConfig::sequential());
///
/// assert!(manager.is_flag("NeedsViralLoad"));
/// assert_eq!(manager.flag_message("NeedsViralLoad"), Some("Due for Viral Load"));
/// ```
#[derive(Default)]
pub struct CalculationManagerBuilder {
    registrations: BTreeMap<CalculationName, Registration>,
}

impl CalculationManagerBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a calculation under `name`.
    ///
    /// A flag registered this way uses its name as the message.
    ///
    /// # Errors
    ///
    /// `DuplicateCalculation` if the name is taken.
    pub fn register<C>(&mut self, name: &str, calculation: C, is_flag: bool) -> EngineResult<&mut Self>
    where
        C: Calculation + 'static,
    {
        let message = is_flag.then(|| name.to_string());
        self.insert(name, Arc::new(calculation), message)
    }

    /// Registers a flag calculation with its user-facing message.
    pub fn register_flag<C>(
        &mut self,
        name: &str,
        calculation: C,
        message: impl Into<String>,
    ) -> EngineResult<&mut Self>
    where
        C: Calculation + 'static,
    {
        self.insert(name, Arc::new(calculation), Some(message.into()))
    }

    /// Registers an already shared calculation.
    pub fn register_shared(
        &mut self,
        name: &str,
        calculation: Arc<dyn Calculation>,
        is_flag: bool,
    ) -> EngineResult<&mut Self> {
        let message = is_flag.then(|| name.to_string());
        self.insert(name, calculation, message)
    }

    fn insert(
        &mut self,
        name: &str,
        calculation: Arc<dyn Calculation>,
        flag_message: Option<String>,
    ) -> EngineResult<&mut Self> {
        if self.registrations.contains_key(name) {
            return Err(EngineError::DuplicateCalculation(name.to_string()));
        }
        self.registrations.insert(
            name.to_string(),
            Registration {
                calculation,
                flag_message,
            },
        );
        Ok(self)
    }

    /// Freezes the registry.
    pub fn build(self, config: EngineConfig) -> CalculationManager {
        let flags = self
            .registrations
            .values()
            .filter(|r| r.flag_message.is_some())
            .count();
        info!(
            calculations = self.registrations.len(),
            flags,
            parallel = config.parallel,
            "calculation registry built"
        );

        let compositions = CompositionEvaluator::from_config(config.expression_cache.clone());
        #[cfg(feature = "parallel")]
        let pool = build_pool(&config);

        CalculationManager {
            registrations: self.registrations,
            compositions,
            config,
            #[cfg(feature = "parallel")]
            pool,
        }
    }
}

#[cfg(feature = "parallel")]
fn build_pool(config: &EngineConfig) -> Option<rayon::ThreadPool> {
    if !config.parallel {
        return None;
    }
    let result = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads.unwrap_or(0))
        .thread_name(|index| format!("cohort-worker-{}", index))
        .build();
    match result {
        Ok(pool) => Some(pool),
        Err(err) => {
            warn!(error = %err, "failed to start worker pool; evaluating sequentially");
            None
        }
    }
}

/// Read-only registry of calculations and the engine's evaluation entry point.
///
/// The registry is built once through [`CalculationManagerBuilder`] and never
/// changes afterwards, so a manager can be shared freely between threads.
/// The data source and context are passed explicitly to every call.
///
/// # Example
///
/// ```rust
/// use chrono::Utc;
/// use cohort_engine::{
///     calculation, CalculationManager, EngineConfig, EntitySet, EvaluationContext,
///     InMemoryDataSource, ParamBag,
/// };
///
/// let mut builder = CalculationManager::builder();
/// builder
///     .register(
///         "IsEven",
///         calculation::from_fn(|cohort, _params, inv| {
///             inv.for_each_entity(cohort, |id| Ok(Some((id % 2 == 0).into())))
///         }),
///         false,
///     )
///     .unwrap();
/// let manager = builder.build(EngineConfig::default());
///
/// let results = manager
///     .evaluate(
///         "IsEven",
///         &EntitySet::from([1, 2, 3, 4]),
///         &ParamBag::new(),
///         &EvaluationContext::new(Utc::now()),
///         &InMemoryDataSource::new(),
///     )
///     .unwrap();
/// assert_eq!(results.truthy().to_vec(), vec![2, 4]);
/// ```
pub struct CalculationManager {
    registrations: BTreeMap<CalculationName, Registration>,
    compositions: CompositionEvaluator,
    config: EngineConfig,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl CalculationManager {
    /// Creates a new registry builder.
    pub fn builder() -> CalculationManagerBuilder {
        CalculationManagerBuilder::new()
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the composition evaluator (with its expression cache).
    pub fn compositions(&self) -> &CompositionEvaluator {
        &self.compositions
    }

    /// Checks if a calculation is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    /// Number of registered calculations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.registrations.keys().map(String::as_str)
    }

    /// Checks if `name` is registered as a flag calculation.
    pub fn is_flag(&self, name: &str) -> bool {
        self.registrations
            .get(name)
            .map_or(false, |r| r.flag_message.is_some())
    }

    /// Names of all flag calculations, sorted.
    pub fn flag_calculations(&self) -> impl Iterator<Item = &str> + '_ {
        self.registrations
            .iter()
            .filter(|(_, r)| r.flag_message.is_some())
            .map(|(name, _)| name.as_str())
    }

    /// User-facing message of a flag calculation.
    pub fn flag_message(&self, name: &str) -> Option<&str> {
        self.registrations
            .get(name)
            .and_then(|r| r.flag_message.as_deref())
    }

    /// Evaluates one registered calculation over a cohort.
    ///
    /// # Arguments
    ///
    /// * `name` - Registered calculation name
    /// * `cohort` - Entities to evaluate
    /// * `params` - Call parameters (validated against the calculation's declared schema)
    /// * `ctx` - Frozen evaluation context shared by every nested call
    /// * `source` - Data source collaborator
    ///
    /// # Returns
    ///
    /// * `Ok(ResultMap)` - Results keyed by entity; failed entities are absent
    ///   and listed in [`ResultMap::failures`]
    /// * `Err(EngineError)` - Unknown calculation, cycle, invalid parameters,
    ///   data-source outage or any other failure of the call as a whole
    pub fn evaluate(
        &self,
        name: &str,
        cohort: &EntitySet,
        params: &ParamBag,
        ctx: &EvaluationContext,
        source: &dyn DataSource,
    ) -> EngineResult<ResultMap> {
        self.evaluate_cancellable(name, cohort, params, ctx, source, &CancellationToken::new())
    }

    /// Like [`evaluate`](Self::evaluate), aborting with `Cancelled` once
    /// `cancel` fires.
    pub fn evaluate_cancellable(
        &self,
        name: &str,
        cohort: &EntitySet,
        params: &ParamBag,
        ctx: &EvaluationContext,
        source: &dyn DataSource,
        cancel: &CancellationToken,
    ) -> EngineResult<ResultMap> {
        let scope = Scope {
            source,
            ctx,
            cancel,
        };
        self.evaluate_in(name, cohort, params, scope, None)
    }

    /// Evaluates a composition definition with `cohort` as the universe.
    pub fn evaluate_composition(
        &self,
        definition: &CompositionDefinition,
        cohort: &EntitySet,
        params: &ParamBag,
        ctx: &EvaluationContext,
        source: &dyn DataSource,
    ) -> EngineResult<EntitySet> {
        let cancel = CancellationToken::new();
        let invocation = Invocation {
            manager: self,
            scope: Scope {
                source,
                ctx,
                cancel: &cancel,
            },
            frame: CallFrame {
                name: definition.name(),
                key: call_key(cohort, params),
                cohort,
                params,
                depth: 0,
                parent: None,
            },
        };
        definition.evaluate_members(cohort, params, &invocation)
    }

    /// Maps items on the worker pool, or sequentially without one.
    pub fn par_map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Send + Sync,
    {
        #[cfg(feature = "parallel")]
        {
            if let Some(pool) = &self.pool {
                use rayon::prelude::*;
                return pool.install(|| items.par_iter().map(&f).collect());
            }
        }
        items.iter().map(f).collect()
    }

    pub(crate) fn evaluate_in(
        &self,
        name: &str,
        cohort: &EntitySet,
        params: &ParamBag,
        scope: Scope<'_>,
        parent: Option<&CallFrame<'_>>,
    ) -> EngineResult<ResultMap> {
        let (name, registration) = self
            .registrations
            .get_key_value(name)
            .ok_or_else(|| EngineError::UnknownCalculation(name.to_string()))?;
        scope.cancel.check()?;
        validate_params(name, registration.calculation.as_ref(), params, scope.ctx)?;

        let key = call_key(cohort, params);
        if let Some(chain) = parent.and_then(|frame| frame.find_cycle(name, key, cohort, params)) {
            warn!(chain = %chain.join(" -> "), "calculation cycle rejected");
            return Err(EngineError::CycleDetected { chain });
        }
        let depth = parent.map_or(0, |frame| frame.depth + 1);
        if depth >= self.config.max_depth {
            return Err(EngineError::RecursionLimit {
                calculation: name.clone(),
                limit: self.config.max_depth,
            });
        }

        if cohort.is_empty() {
            return Ok(ResultMap::new());
        }

        let span = debug_span!("evaluate", calculation = %name, cohort = cohort.len(), depth);
        let _entered = span.enter();
        let started = Instant::now();

        let invocation = Invocation {
            manager: self,
            scope,
            frame: CallFrame {
                name: name.as_str(),
                key,
                cohort,
                params,
                depth,
                parent,
            },
        };
        let mut results = registration
            .calculation
            .evaluate(cohort, params, &invocation)
            .map_err(|err| {
                debug!(error = %err, "calculation failed");
                err
            })?;

        let dropped = results.retain_cohort(cohort);
        if dropped > 0 {
            warn!(
                calculation = %name,
                dropped,
                "calculation returned entities outside its cohort; discarded"
            );
        }
        results.stamp_provenance(name);

        debug!(
            results = results.len(),
            failures = results.failures().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "calculation evaluated"
        );
        Ok(results)
    }
}

impl std::fmt::Debug for CalculationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculationManager")
            .field("calculations", &self.registrations.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

/// Fingerprint of a call's cohort and parameters. Equal calls share a key;
/// [`CallFrame::find_cycle`] confirms a match against the arguments.
fn call_key(cohort: &EntitySet, params: &ParamBag) -> u64 {
    cohort.fingerprint() ^ params_fingerprint(params).rotate_left(17)
}

/// Checks declared parameters, looking in the call's bag first and the
/// context second.
fn validate_params(
    name: &str,
    calculation: &dyn Calculation,
    params: &ParamBag,
    ctx: &EvaluationContext,
) -> EngineResult<()> {
    for spec in calculation.parameters() {
        match params.get(&spec.name).or_else(|| ctx.param(&spec.name)) {
            None if spec.required => {
                return Err(EngineError::MissingParameter {
                    calculation: name.to_string(),
                    parameter: spec.name.clone(),
                });
            }
            Some(value) if !spec.kind.accepts(value) => {
                return Err(EngineError::InvalidParameter {
                    calculation: name.to_string(),
                    parameter: spec.name.clone(),
                    expected: spec.kind,
                });
            }
            _ => {}
        }
    }
    Ok(())
}
