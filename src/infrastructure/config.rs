use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub planner: PlannerSettings,
    #[serde(default)]
    pub evaluator: EvaluatorSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Thresholds for the adaptive downsampling planner. These used to be
/// hard-wired constants in the query path; keeping them here makes the
/// clamp bands explicit and overridable per deployment.
#[derive(Debug, Deserialize, Clone)]
pub struct PlannerSettings {
    #[serde(default = "default_target_min")]
    pub target_points_min: u32,
    #[serde(default = "default_target_max")]
    pub target_points_max: u32,
    #[serde(default = "default_bucket_align")]
    pub bucket_align_seconds: i64,
    #[serde(default = "default_statement_timeout_min")]
    pub statement_timeout_min_ms: u64,
    #[serde(default = "default_statement_timeout_max")]
    pub statement_timeout_max_ms: u64,
    #[serde(default = "default_batch_width")]
    pub compute_batch_width: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            target_points_min: default_target_min(),
            target_points_max: default_target_max(),
            bucket_align_seconds: default_bucket_align(),
            statement_timeout_min_ms: default_statement_timeout_min(),
            statement_timeout_max_ms: default_statement_timeout_max(),
            compute_batch_width: default_batch_width(),
        }
    }
}

impl PlannerSettings {
    /// Re-clamps the query's point budget into the band where bucket
    /// aggregation stays useful, deliberately tighter than the query's own
    /// [100, 5000] bound.
    pub fn target_points(&self, max_points: u32) -> usize {
        max_points.clamp(self.target_points_min, self.target_points_max) as usize
    }

    /// Bucket width for the range: ceil(range / target), floored at the
    /// alignment and rounded up to a multiple of it so buckets line up with
    /// the sensor sampling cadence.
    pub fn bucket_seconds(&self, range_seconds: i64, target_points: usize) -> i64 {
        let target = target_points.max(1) as i64;
        let align = self.bucket_align_seconds.max(1);
        // Manual ceiling division: i64::div_ceil is not stable yet, and both
        // divisors are positive here.
        let raw = (range_seconds + target - 1) / target;
        let aligned = (raw + align - 1) / align * align;
        aligned.max(align)
    }

    /// Store-side execution budget for the aggregate attempt.
    pub fn statement_timeout_ms(&self, timeout_ms: u64) -> u64 {
        timeout_ms.clamp(self.statement_timeout_min_ms, self.statement_timeout_max_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvaluatorSettings {
    #[serde(default = "default_step_budget")]
    pub step_budget_ms: u64,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            step_budget_ms: default_step_budget(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_target_min() -> u32 {
    300
}

fn default_target_max() -> u32 {
    1500
}

fn default_bucket_align() -> i64 {
    300
}

fn default_statement_timeout_min() -> u64 {
    500
}

fn default_statement_timeout_max() -> u64 {
    15_000
}

fn default_batch_width() -> usize {
    8
}

fn default_step_budget() -> u64 {
    200
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/default"))
        .add_source(config::Environment::with_prefix("FARM_TELEMETRY").separator("__"))
        .build()?;

    Ok(settings.try_deserialize()?)
}
