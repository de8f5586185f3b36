//! Bounded retry for persistence operations.
//!
//! Every write crossing the store boundary goes through [`with_retries`]:
//! transient failures get a short, growing backoff; exhaustion surfaces a
//! [`Error::Repository`] that is fatal to the single update it accompanies
//! but never to the surrounding loop.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Default number of attempts for a persistence operation.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Base backoff between attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum backoff between attempts.
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Runs `operation` up to `attempts` times with increasing backoff.
///
/// The closure is re-invoked for every attempt; the final failure is wrapped
/// in [`Error::Repository`] carrying the attempt count and the underlying
/// cause.
///
/// # Errors
///
/// Returns [`Error::Repository`] once all attempts are exhausted.
pub async fn with_retries<T, F, Fut>(name: &str, attempts: u32, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut backoff = BACKOFF_BASE;

    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt == attempts => {
                return Err(Error::repository(name, attempts, err));
            }
            Err(err) => {
                warn!(operation = name, attempt, error = %err, "retrying persistence operation");
                let delay = backoff.min(BACKOFF_MAX) + Duration::from_millis(jitter());
                tokio::time::sleep(delay).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }

    unreachable!("retry loop returns on the final attempt")
}

/// Small jitter (0-50ms) so concurrent retries don't align.
fn jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}
