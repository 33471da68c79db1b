use std::future::Future;

use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::Result;

/// Runs `op` up to `policy.attempts` times, sleeping `policy.delay()` between
/// attempts. Only transient errors are retried; the last error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!("retry {attempt}/{attempts} for {what}: {e}");
                sleep(policy.delay()).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
