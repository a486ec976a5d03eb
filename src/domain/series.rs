// Sensor series domain models
use crate::error::CoreError;
use chrono::{DateTime, Utc};

pub const MAX_POINTS_MIN: u32 = 100;
pub const MAX_POINTS_MAX: u32 = 5000;
pub const MAX_POINTS_DEFAULT: u32 = 1200;

pub const TIMEOUT_MS_MIN: u64 = 500;
pub const TIMEOUT_MS_MAX: u64 = 15_000;
pub const TIMEOUT_MS_DEFAULT: u64 = 6000;

/// One sample of a series. `value` is `None` when the raw reading had no
/// usable numeric value at this timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

impl Point {
    pub fn new(timestamp: DateTime<Utc>, value: Option<f64>) -> Self {
        Self { timestamp, value }
    }
}

/// Identifies one sensor input on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub device: String,
    pub module_id: i32,
    pub input_id: i32,
}

/// A validated chart query: half-open time window plus point/time budgets.
#[derive(Debug, Clone)]
pub struct SeriesQuery {
    pub key: SeriesKey,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub max_points: u32,
    pub timeout_ms: u64,
}

impl SeriesQuery {
    /// Builds a query, clamping the budgets into their allowed bands and
    /// rejecting an empty device or an inverted/empty window.
    pub fn new(
        key: SeriesKey,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        max_points: Option<u32>,
        timeout_ms: Option<u64>,
    ) -> Result<Self, CoreError> {
        if key.device.trim().is_empty() {
            return Err(CoreError::Validation("device is required".to_string()));
        }
        if start_at >= end_at {
            return Err(CoreError::Validation(
                "start_at must be before end_at".to_string(),
            ));
        }

        Ok(Self {
            key,
            start_at,
            end_at,
            max_points: max_points
                .unwrap_or(MAX_POINTS_DEFAULT)
                .clamp(MAX_POINTS_MIN, MAX_POINTS_MAX),
            timeout_ms: timeout_ms
                .unwrap_or(TIMEOUT_MS_DEFAULT)
                .clamp(TIMEOUT_MS_MIN, TIMEOUT_MS_MAX),
        })
    }

    pub fn range_seconds(&self) -> i64 {
        (self.end_at - self.start_at).num_seconds()
    }
}

/// Output of applying a formula chain to one raw point. `value` is `None`
/// exactly when `raw` carried no finite number.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedPoint {
    pub timestamp: DateTime<Utc>,
    pub raw: Option<f64>,
    pub value: Option<f64>,
}

/// Coerces an externally-sourced textual reading into a finite number.
/// Anything unparsable or non-finite becomes `None` rather than an error.
pub fn safe_number(raw: Option<&str>) -> Option<f64> {
    let parsed: f64 = raw?.trim().parse().ok()?;
    parsed.is_finite().then_some(parsed)
}
