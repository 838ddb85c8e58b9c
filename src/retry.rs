//! Bounded retry-with-sleep.
//!
//! Polling loops in this crate (IP discovery, cluster-convergence waits) are
//! bounded by an attempt count and a fixed inter-attempt delay. There is no
//! external cancellation; a caller cannot abort a poll early.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Returned when every attempt failed. Callers distinguish exhaustion from
/// ordinary errors by downcasting to this type.
#[derive(Debug, Error)]
#[error("exhausted {attempts} attempts ({delay:?} apart), last error: {last}")]
pub struct RetryError {
    pub attempts: usize,
    pub delay: Duration,
    pub last: anyhow::Error,
}

/// Run `op` up to `attempts` times, sleeping `delay` between failures.
///
/// Returns the first success, or [`RetryError`] wrapping the final failure.
pub async fn retry_after<T, F, Fut>(
    attempts: usize,
    delay: Duration,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                debug!("attempt {}/{} failed: {:#}", attempt, attempts, e);
                last = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(RetryError {
        attempts,
        delay,
        last: last.unwrap_or_else(|| anyhow::anyhow!("no attempts were made")),
    }
    .into())
}
