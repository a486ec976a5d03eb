// Expression evaluation seam
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("invalid expression: {0}")]
    Invalid(String),

    #[error("evaluation failed: {0}")]
    Failed(String),

    #[error("evaluation exceeded the {budget_ms}ms step budget")]
    Budget { budget_ms: u64 },

    #[error("expression returned a non-finite result")]
    NonFinite,
}

/// Evaluates one formula expression against a scoped variable set. The
/// implementation must expose exactly the variables in `scope` plus a math
/// function library, complete within a fixed per-step time budget, and
/// yield a finite number.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        expression: &str,
        scope: &HashMap<String, f64>,
    ) -> Result<f64, EvalError>;
}
