// Repository trait for raw meter readings
use crate::domain::series::SeriesKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One raw stored reading. The value is kept as the store's original text;
/// coercion to a number happens in the application layer.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub timestamp: DateTime<Utc>,
    pub raw_value: Option<String>,
}

/// One grouped-average bucket. `average` is `None` only when every row in
/// the bucket was excluded by the store's numeric filter.
#[derive(Debug, Clone)]
pub struct BucketRow {
    pub bucket_start: DateTime<Utc>,
    pub average: Option<f64>,
}

#[async_trait]
pub trait MeterValueRepository: Send + Sync {
    /// Every raw row for the key in `[start_at, end_at)`, ordered ascending
    /// by timestamp.
    async fn scan_series(
        &self,
        key: &SeriesKey,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RawRow>>;

    /// Grouped average over fixed-width buckets, computed store-side under
    /// `statement_timeout_ms`. Rows whose text does not match a strict
    /// signed-decimal pattern are excluded from the average, not coerced.
    /// Buckets are ordered ascending by bucket start.
    async fn aggregate_series(
        &self,
        key: &SeriesKey,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        bucket_seconds: i64,
        statement_timeout_ms: u64,
    ) -> anyhow::Result<Vec<BucketRow>>;
}
