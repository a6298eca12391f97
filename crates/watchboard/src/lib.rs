#![forbid(unsafe_code)]

//! Facade over the watchboard transform workspace: raw samples go in,
//! an evaluated scalar or a decimated, chart-ready series comes out.
//! Ingestion, rendering, and persistence live elsewhere.

pub use wb_decimate::{DecimatedData, MAX_TARGET_POINTS, decimate_series_data, lttb};
pub use wb_expr::{
    Arg, CompiledExpression, DEFAULT_WINDOW_MS, ExprCache, FUNCTION_CATALOG, FunctionSpec, Token,
    ValidateError, parse_window, tokenize, validate_expression,
};
pub use wb_types::{Clock, DataPoint, FixedClock, HistoryPoint, SystemClock, TransformContext};

/// One dashboard instance's transform state: an owned expression cache
/// plus the clock windowed aggregates measure against. Panels share a
/// pipeline; tests construct one around a [`FixedClock`].
#[derive(Debug)]
pub struct TransformPipeline {
    cache: ExprCache,
    clock: Box<dyn Clock>,
}

impl TransformPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Box::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Box<dyn Clock>) -> Self {
        Self {
            cache: ExprCache::new(),
            clock,
        }
    }

    /// Evaluate a watch expression to its display value. Never panics;
    /// always finite.
    pub fn evaluate(&mut self, source: &str, ctx: &TransformContext) -> f64 {
        self.cache.evaluate(source, ctx, self.clock.as_ref())
    }

    /// Advisory pre-flight check for an expression authored in the UI.
    pub fn validate(&self, source: &str) -> Result<(), ValidateError> {
        validate_expression(source)
    }

    /// Reduce parallel series to what `chart_width` pixels can show.
    #[must_use]
    pub fn decimate(
        &self,
        times: &[f64],
        series: &[Vec<Option<f64>>],
        chart_width: usize,
    ) -> DecimatedData {
        decimate_series_data(times, series, chart_width)
    }

    #[must_use]
    pub fn cached_expressions(&self) -> usize {
        self.cache.len()
    }
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::new()
    }
}
