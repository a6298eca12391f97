#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One raw sample of a watch stream: epoch-millisecond timestamp plus value.
///
/// Histories are time-ordered ascending by contract with the ingestion
/// layer; the transform core does not re-validate ordering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: i64,
    pub value: f64,
}

impl HistoryPoint {
    #[must_use]
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Unit-agnostic (x, y) pair consumed by the decimator. The x axis is
/// typically chart seconds, independent of the millisecond timestamps in
/// [`HistoryPoint`]; the unit conversion happens at the charting edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub x: f64,
    pub y: f64,
}

impl DataPoint {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Per-evaluation bundle handed to the expression engine: the metric's
/// current value and own history, plus optional cross-series bindings.
///
/// Constructed fresh per evaluation call; carries no state across calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformContext {
    pub current_value: f64,
    pub history: Vec<HistoryPoint>,
    pub named_values: BTreeMap<String, f64>,
    pub named_histories: BTreeMap<String, Vec<HistoryPoint>>,
}

impl TransformContext {
    #[must_use]
    pub fn new(current_value: f64, history: Vec<HistoryPoint>) -> Self {
        Self {
            current_value,
            history,
            named_values: BTreeMap::new(),
            named_histories: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_named_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.named_values.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_named_history(
        mut self,
        name: impl Into<String>,
        history: Vec<HistoryPoint>,
    ) -> Self {
        self.named_histories.insert(name.into(), history);
        self
    }
}

/// Source of "now" for windowed aggregates.
///
/// Window functions measure elapsed time against wall-clock now at
/// evaluation time, not against any sample timestamp, so the same static
/// history can aggregate differently across two calls. Injecting the
/// clock keeps that semantic while letting tests pin time.
pub trait Clock: fmt::Debug {
    fn now_ms(&self) -> i64;
}

/// Wall-clock milliseconds since the UNIX epoch. A clock behind the
/// epoch saturates to zero; the transform core never raises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Pinned clock for deterministic window-aggregate tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}
