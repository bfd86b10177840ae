//! Action Waiter: drives an asynchronous cloud action to a terminal state.
//!
//! Each wait is a plain future owned by the calling RPC, so any number of
//! waits run concurrently and dropping the RPC future stops the polling.
//! The wait is bounded by both the configured `max_wait` and the caller's
//! deadline, whichever comes first.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cloud::{Action, ActionStatus, CloudVolumes};
use crate::config::{RetryConfig, WaitConfig};
use crate::error::CsiError;
use crate::retry::retry_transient;

pub struct ActionWaiter {
    cloud: Arc<dyn CloudVolumes>,
    wait: WaitConfig,
    retry: RetryConfig,
}

impl ActionWaiter {
    pub fn new(cloud: Arc<dyn CloudVolumes>, wait: WaitConfig, retry: RetryConfig) -> Self {
        Self { cloud, wait, retry }
    }

    /// Poll `action` until it succeeds or fails, or until the deadline.
    #[instrument(skip(self, action), fields(action_id = action.id, command = %action.command))]
    pub async fn wait_for(&self, action: &Action, deadline: Instant) -> Result<(), CsiError> {
        let until = deadline.min(Instant::now() + self.wait.max_wait);
        match tokio::time::timeout_at(until, self.poll(action.clone(), until)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("action did not finish in time");
                Err(CsiError::DeadlineExceeded(format!(
                    "action {} ({}) still running",
                    action.id, action.command
                )))
            }
        }
    }

    async fn poll(&self, mut action: Action, until: Instant) -> Result<(), CsiError> {
        loop {
            match action.status {
                ActionStatus::Success => {
                    debug!("action succeeded");
                    return Ok(());
                }
                ActionStatus::Error => {
                    let code = action.error.as_deref().unwrap_or("unknown");
                    warn!(code, "action failed");
                    return Err(CsiError::Internal(format!(
                        "action {} ({}) failed: {code}",
                        action.id, action.command
                    )));
                }
                ActionStatus::Pending | ActionStatus::Running => {}
            }
            tokio::time::sleep(self.wait.poll_interval).await;
            let id = action.id;
            action = retry_transient(&self.retry, until, "get_action", || {
                self.cloud.get_action(id)
            })
            .await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::cloud::fake::{FakeCloud, FakeOp};
    use crate::cloud::{CloudError, CreateVolumeOpts};
    use crate::error::Code;

    fn waiter(cloud: &Arc<FakeCloud>, max_wait: Duration) -> ActionWaiter {
        ActionWaiter::new(
            Arc::clone(cloud) as Arc<dyn CloudVolumes>,
            WaitConfig {
                poll_interval: Duration::from_millis(2),
                max_wait,
            },
            RetryConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                max_attempts: 3,
            },
        )
    }

    async fn start_action(cloud: &FakeCloud) -> Action {
        cloud
            .create_volume(CreateVolumeOpts {
                name: "v".into(),
                size_bytes: 1 << 30,
                location: "fsn1".into(),
            })
            .await
            .unwrap()
            .action
            .unwrap()
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn waits_until_success() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.set_action_polls(3);
        let action = start_action(&cloud).await;
        waiter(&cloud, Duration::from_secs(5))
            .wait_for(&action, far())
            .await
            .unwrap();
        assert_eq!(cloud.calls().get_action, 4);
    }

    #[tokio::test]
    async fn failed_action_is_an_error() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.fail_next_action("volume_error");
        let action = start_action(&cloud).await;
        let err = waiter(&cloud, Duration::from_secs(5))
            .wait_for(&action, far())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("volume_error"));
    }

    #[tokio::test]
    async fn times_out_on_max_wait() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.set_action_polls(u32::MAX);
        let action = start_action(&cloud).await;
        let err = waiter(&cloud, Duration::from_millis(30))
            .wait_for(&action, far())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn caller_deadline_wins_over_max_wait() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.set_action_polls(u32::MAX);
        let action = start_action(&cloud).await;
        let started = Instant::now();
        let err = waiter(&cloud, Duration::from_secs(60))
            .wait_for(&action, Instant::now() + Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn transient_poll_errors_are_retried() {
        let cloud = Arc::new(FakeCloud::default());
        let action = start_action(&cloud).await;
        cloud.fail_next(FakeOp::GetAction, CloudError::RateLimited("slow".into()));
        waiter(&cloud, Duration::from_secs(5))
            .wait_for(&action, far())
            .await
            .unwrap();
    }
}
