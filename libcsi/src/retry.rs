//! Bounded exponential backoff for transient cloud failures.
//!
//! Only errors the cloud client classifies as transient (rate limiting,
//! network trouble, 5xx) are retried.  The loop never sleeps past the
//! caller's deadline: when the next delay would cross it, the last error is
//! returned instead.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::cloud::CloudError;
use crate::config::RetryConfig;

/// Delay sequence `initial, 2*initial, ...` capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_backoff,
            max: config.max_backoff,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Run `op` until it succeeds, fails permanently, exhausts its attempts, or
/// would run past `deadline`.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    deadline: Instant,
    what: &str,
    mut op: F,
) -> Result<T, CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CloudError>>,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let delay = backoff.next_delay();
                if Instant::now() + delay >= deadline {
                    warn!(operation = what, error = %e, "transient error, no time left to retry");
                    return Err(e);
                }
                warn!(operation = what, attempt, ?delay, error = %e, "transient error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
