//! Exponential backoff retry loop for transient transport/provider errors
//! (spec section 4.5: base ~250ms, factor 2, jitter, cap ~8 retries).
//! Hand-rolled rather than pulled from a crate, the way `km_tools`'s
//! adapters hand-roll their own request loops; jitter is derived from the
//! system clock instead of adding a `rand` dependency the teacher never
//! carries.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::AdapterError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            factor: 2.0,
            max_retries: 8,
        }
    }
}

fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Retry `op` up to `policy.max_retries` times on transient errors
/// ([`AdapterError::is_transient`]), honoring a provider-supplied
/// `Retry-After` when present, else exponential backoff with jitter.
/// Non-transient errors propagate immediately.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let wait = err.retry_after().unwrap_or_else(|| {
                    let exp = policy.factor.powi(attempt as i32);
                    let millis = policy.base.as_millis() as f64 * exp * (1.0 + jitter_fraction());
                    Duration::from_millis(millis as u64)
                });
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
