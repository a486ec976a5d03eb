// HTTP request handlers
use crate::domain::formula::{FormulaComputation, FormulaSelector};
use crate::domain::series::{ComputedPoint, Point, SeriesKey, SeriesQuery};
use crate::error::CoreError;
use crate::presentation::app_state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct SeriesParams {
    pub device: String,
    pub module_id: i32,
    pub input_id: i32,
    /// Preset window ending now: 1h, 4h, 1d, 1w or 1y. Wins over start/end.
    pub before: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub max_points: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl SeriesParams {
    fn into_query(self) -> Result<SeriesQuery, CoreError> {
        let (start_at, end_at) = match self.before.as_deref() {
            Some(preset) => {
                let span = preset_window(preset).ok_or_else(|| {
                    CoreError::Validation(format!("invalid preset \"{preset}\" in before"))
                })?;
                let end = Utc::now();
                (end - span, end)
            }
            None => match (self.start_at, self.end_at) {
                (Some(start), Some(end)) => (start, end),
                _ => {
                    return Err(CoreError::Validation(
                        "start_at and end_at are required without a preset".to_string(),
                    ));
                }
            },
        };

        SeriesQuery::new(
            SeriesKey {
                device: self.device,
                module_id: self.module_id,
                input_id: self.input_id,
            },
            start_at,
            end_at,
            self.max_points,
            self.timeout_ms,
        )
    }
}

fn preset_window(preset: &str) -> Option<Duration> {
    match preset {
        "1h" => Some(Duration::hours(1)),
        "4h" => Some(Duration::hours(4)),
        "1d" => Some(Duration::days(1)),
        "1w" => Some(Duration::weeks(1)),
        "1y" => Some(Duration::days(365)),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
pub struct PointDto {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

impl From<Point> for PointDto {
    fn from(point: Point) -> Self {
        Self {
            timestamp: point.timestamp,
            value: point.value,
        }
    }
}

/// Chart-ready series for one sensor input
pub async fn get_series(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<Vec<PointDto>>, CoreError> {
    let query = params.into_query()?;
    let points = state.series_service.get_series(query).await?;
    Ok(Json(points.into_iter().map(PointDto::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct ChainParams {
    pub formula_id: Option<i64>,
    pub formula_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChainStepDto {
    pub id: i64,
    pub name: String,
    pub unit: Option<String>,
    pub sequence: i32,
    pub expression: String,
}

#[derive(Debug, Serialize)]
pub struct ChainDto {
    pub group_id: i64,
    pub group_name: String,
    pub target_id: i64,
    pub steps: Vec<ChainStepDto>,
}

/// The ordered calibration chain ending at the target formula
pub async fn get_formula_chain(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ChainParams>,
) -> Result<Json<ChainDto>, CoreError> {
    let selector = FormulaSelector::from_parts(params.formula_id, params.formula_name)?;
    let chain = state.formula_service.resolve_chain(&selector).await?;

    Ok(Json(ChainDto {
        group_id: chain.group_id,
        group_name: chain.group_name,
        target_id: chain.target_id,
        steps: chain
            .steps
            .into_iter()
            .map(|step| ChainStepDto {
                id: step.id,
                name: step.name,
                unit: step.unit,
                sequence: step.sequence,
                expression: step.expression,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ComputeRequest {
    pub formula_id: Option<i64>,
    pub formula_name: Option<String>,
    pub input: f64,
    #[serde(default)]
    pub variables: HashMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct StepOutputDto {
    pub id: i64,
    pub name: String,
    pub sequence: i32,
    pub output: f64,
}

#[derive(Debug, Serialize)]
pub struct ComputationDto {
    pub target_id: i64,
    pub group_id: i64,
    pub group_name: String,
    pub unit: Option<String>,
    pub input: f64,
    pub steps: Vec<StepOutputDto>,
    pub output: f64,
}

impl From<FormulaComputation> for ComputationDto {
    fn from(result: FormulaComputation) -> Self {
        Self {
            target_id: result.target_id,
            group_id: result.group_id,
            group_name: result.group_name,
            unit: result.unit,
            input: result.input,
            steps: result
                .steps
                .into_iter()
                .map(|step| StepOutputDto {
                    id: step.id,
                    name: step.name,
                    sequence: step.sequence,
                    output: step.output,
                })
                .collect(),
            output: result.output,
        }
    }
}

/// Run a formula chain against a single input value
pub async fn compute_formula(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ComputeRequest>,
) -> Result<Json<ComputationDto>, CoreError> {
    let selector = FormulaSelector::from_parts(request.formula_id, request.formula_name)?;
    let result = state
        .formula_service
        .compute_value(&selector, request.input, &request.variables)
        .await?;
    Ok(Json(ComputationDto::from(result)))
}

// Not flattened into SeriesParams: serde_urlencoded cannot drive
// #[serde(flatten)] across non-string fields.
#[derive(Debug, Deserialize)]
pub struct ComputedSeriesParams {
    pub device: String,
    pub module_id: i32,
    pub input_id: i32,
    pub before: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub max_points: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub formula_id: Option<i64>,
    pub formula_name: Option<String>,
}

impl ComputedSeriesParams {
    fn series_params(&self) -> SeriesParams {
        SeriesParams {
            device: self.device.clone(),
            module_id: self.module_id,
            input_id: self.input_id,
            before: self.before.clone(),
            start_at: self.start_at,
            end_at: self.end_at,
            max_points: self.max_points,
            timeout_ms: self.timeout_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ComputedPointDto {
    pub timestamp: DateTime<Utc>,
    pub raw: Option<f64>,
    pub value: Option<f64>,
}

impl From<ComputedPoint> for ComputedPointDto {
    fn from(point: ComputedPoint) -> Self {
        Self {
            timestamp: point.timestamp,
            raw: point.raw,
            value: point.value,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ComputedSeriesMeta {
    pub device: String,
    pub module_id: i32,
    pub input_id: i32,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub unit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ComputedSeriesDto {
    pub series_raw: Vec<PointDto>,
    pub series_computed: Vec<ComputedPointDto>,
    pub meta: ComputedSeriesMeta,
}

/// Chart-ready series with a formula chain applied point by point
pub async fn get_computed_series(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ComputedSeriesParams>,
) -> Result<Json<ComputedSeriesDto>, CoreError> {
    let selector = FormulaSelector::from_parts(params.formula_id, params.formula_name.clone())?;
    let query = params.series_params().into_query()?;
    let meta_key = query.key.clone();
    let (start_at, end_at) = (query.start_at, query.end_at);

    let raw = state.series_service.get_series(query).await?;
    let chain = state.formula_service.resolve_chain(&selector).await?;
    let computed = state
        .formula_service
        .compute_series(&chain, &raw, &HashMap::new())
        .await?;

    Ok(Json(ComputedSeriesDto {
        series_raw: raw.into_iter().map(PointDto::from).collect(),
        series_computed: computed.into_iter().map(ComputedPointDto::from).collect(),
        meta: ComputedSeriesMeta {
            device: meta_key.device,
            module_id: meta_key.module_id,
            input_id: meta_key.input_id,
            start_at,
            end_at,
            unit: chain.unit().map(str::to_string),
        },
    }))
}
