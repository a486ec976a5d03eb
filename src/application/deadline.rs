// Wall-clock deadline around an in-flight operation
use crate::error::{CoreError, CoreResult};
use std::future::Future;
use std::time::Duration;

/// Races `operation` against a wall-clock timer. If the timer fires first the
/// call fails with `Timeout` carrying the elapsed budget; the operation is not
/// actively cancelled and any late result is discarded. Callers that hold a
/// cancellable handle (e.g. a storage statement timeout) should bound the
/// underlying work themselves.
pub async fn run_with_deadline<F, T>(operation: F, timeout_ms: u64) -> CoreResult<T>
where
    F: Future<Output = Result<T, CoreError>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), operation).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout {
            elapsed_ms: timeout_ms,
        }),
    }
}
