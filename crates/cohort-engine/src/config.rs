//! Configuration types for the calculation engine.

/// Default maximum depth of nested calculation calls.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Configuration for the [`CalculationManager`](crate::CalculationManager).
///
/// # Example
///
/// ```rust
/// use cohort_engine::{EngineConfig, ExpressionCacheConfig};
///
/// let config = EngineConfig::builder()
///     .with_parallel(true)
///     .with_worker_threads(8)
///     .with_max_depth(32)
///     .with_expression_cache(ExpressionCacheConfig { max_entries: 256 })
///     .build();
///
/// assert_eq!(config.worker_threads, Some(8));
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Evaluate entities and sibling calculations on a worker pool
    /// (requires the `parallel` feature).
    pub parallel: bool,
    /// Worker pool size (None = one per CPU). Size it to the data source's
    /// connection pool.
    pub worker_threads: Option<usize>,
    /// Maximum depth of nested calculation calls.
    pub max_depth: usize,
    /// Cache of parsed composition expressions (None = parse every time).
    pub expression_cache: Option<ExpressionCacheConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            worker_threads: None,
            max_depth: DEFAULT_MAX_DEPTH,
            expression_cache: Some(ExpressionCacheConfig::default()),
        }
    }
}

impl EngineConfig {
    /// Creates a new builder for EngineConfig.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Sequential configuration, mostly useful in tests.
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }
}

/// Builder for EngineConfig.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Enables or disables parallel evaluation.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    /// Sets the worker pool size.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = Some(threads.max(1));
        self
    }

    /// Sets the maximum nesting depth.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.config.max_depth = max_depth.max(1);
        self
    }

    /// Enables the expression cache with the given configuration.
    pub fn with_expression_cache(mut self, cache: ExpressionCacheConfig) -> Self {
        self.config.expression_cache = Some(cache);
        self
    }

    /// Disables the expression cache.
    pub fn without_expression_cache(mut self) -> Self {
        self.config.expression_cache = None;
        self
    }

    /// Builds the EngineConfig.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

/// Configuration for the parsed-expression cache.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExpressionCacheConfig {
    /// Maximum number of cached expressions.
    pub max_entries: usize,
}

impl Default for ExpressionCacheConfig {
    fn default() -> Self {
        Self { max_entries: 1_024 }
    }
}
