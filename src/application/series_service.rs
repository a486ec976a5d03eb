// Series service - Chart-ready series with adaptive downsampling
use crate::application::deadline::run_with_deadline;
use crate::application::meter_repository::MeterValueRepository;
use crate::domain::series::{safe_number, Point, SeriesQuery};
use crate::error::{CoreError, CoreResult};
use crate::infrastructure::config::PlannerSettings;
use std::sync::Arc;

#[derive(Clone)]
pub struct SeriesService {
    repository: Arc<dyn MeterValueRepository>,
    planner: PlannerSettings,
}

impl SeriesService {
    pub fn new(repository: Arc<dyn MeterValueRepository>, planner: PlannerSettings) -> Self {
        Self { repository, planner }
    }

    /// Serves a chart-ready series for the query window, no more than the
    /// effective target point count, within the query's wall-clock budget.
    pub async fn get_series(&self, query: SeriesQuery) -> CoreResult<Vec<Point>> {
        let timeout_ms = query.timeout_ms;
        run_with_deadline(self.get_series_inner(query), timeout_ms).await
    }

    async fn get_series_inner(&self, query: SeriesQuery) -> CoreResult<Vec<Point>> {
        let target_points = self.planner.target_points(query.max_points);
        let bucket_seconds = self
            .planner
            .bucket_seconds(query.range_seconds(), target_points);
        let statement_timeout_ms = self.planner.statement_timeout_ms(query.timeout_ms);

        // First attempt: grouped average at the store. The outcome is
        // inspected here; an unavailable or failing aggregate routes to
        // stride sampling instead of surfacing.
        match self
            .repository
            .aggregate_series(
                &query.key,
                query.start_at,
                query.end_at,
                bucket_seconds,
                statement_timeout_ms,
            )
            .await
        {
            Ok(buckets) => {
                return Ok(buckets
                    .into_iter()
                    .map(|row| Point::new(row.bucket_start, row.average))
                    .collect());
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    device = %query.key.device,
                    module_id = query.key.module_id,
                    input_id = query.key.input_id,
                    bucket_seconds,
                    "grouped aggregation unavailable, falling back to stride sampling"
                );
            }
        }

        self.stride_sample(&query, target_points).await
    }

    /// Fallback path: fetch the whole ordered window and keep every Nth row.
    /// Trades representativeness (spikes between kept indices are lost) for
    /// bounded output size when the grouped path cannot serve the request.
    async fn stride_sample(
        &self,
        query: &SeriesQuery,
        target_points: usize,
    ) -> CoreResult<Vec<Point>> {
        let rows = self
            .repository
            .scan_series(&query.key, query.start_at, query.end_at)
            .await?;

        if rows.len() <= target_points {
            return Ok(rows
                .into_iter()
                .map(|row| Point::new(row.timestamp, safe_number(row.raw_value.as_deref())))
                .collect());
        }

        // target_points comes from configuration; guard the divisor the same
        // way bucket_seconds does.
        let stride = rows.len().div_ceil(target_points.max(1));
        Ok(rows
            .into_iter()
            .step_by(stride)
            .map(|row| Point::new(row.timestamp, safe_number(row.raw_value.as_deref())))
            .collect())
    }
}
