//! Deadline-bounded polling shared by every wait in a build.
//!
//! All waits use one interval, stop exactly at their deadline, and race the
//! build's cancellation token on every sleep.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cloud::{ActionHandle, ActionStatus, CloudApi};
use crate::error::BuildError;

/// Result of a single poll attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Probe<T> {
    /// The awaited condition holds.
    Ready(T),
    /// Try again after the poll interval.
    Pending,
}

/// Polls conditions until they hold, the deadline passes or the build is
/// cancelled.
#[derive(Clone, Debug)]
pub struct Poller {
    interval: Duration,
    cancel: CancellationToken,
}

impl Poller {
    /// Creates a poller with the given interval and cancellation token.
    #[must_use]
    pub const fn new(interval: Duration, cancel: CancellationToken) -> Self {
        Self { interval, cancel }
    }

    /// Returns the poll interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the cancellation token raced against every sleep.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Calls `probe` until it reports [`Probe::Ready`].
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::PollTimeout`] once `deadline` passes,
    /// [`BuildError::Cancelled`] when the token fires, or any error the
    /// probe returns.
    pub async fn poll_until<T, E, F, Fut>(
        &self,
        waiting_for: &str,
        deadline: Instant,
        mut probe: F,
    ) -> Result<T, BuildError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Probe<T>, BuildError<E>>>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BuildError::PollTimeout {
                    waiting_for: waiting_for.to_owned(),
                    waited: now.duration_since(started),
                });
            }

            attempts = attempts.saturating_add(1);
            if let Probe::Ready(value) = probe().await? {
                return Ok(value);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            debug!(waiting_for, attempts, "condition not met yet");
            tokio::select! {
                () = self.cancel.cancelled() => return Err(BuildError::Cancelled),
                () = sleep(self.interval.min(remaining)) => {}
            }
        }
    }

    /// Polls `action` until the provider reports it finished.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ActionFailed`] when the provider reports failure,
    /// [`BuildError::ProviderRequest`] when the status query fails, and the
    /// errors of [`Poller::poll_until`].
    pub async fn wait_for_action<C>(
        &self,
        api: &C,
        action: &ActionHandle,
        deadline: Instant,
    ) -> Result<(), BuildError<C::Error>>
    where
        C: CloudApi + ?Sized,
    {
        let waiting_for = format!("action {} ({})", action.id, action.command);
        self.poll_until(&waiting_for, deadline, move || async move {
            let status = api
                .action_status(action)
                .await
                .map_err(BuildError::request("action_status"))?;
            match status {
                ActionStatus::Succeeded => Ok(Probe::Ready(())),
                ActionStatus::InProgress => Ok(Probe::Pending),
                ActionStatus::Failed { message } => Err(BuildError::ActionFailed {
                    action: action.command.clone(),
                    message,
                }),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::cloud::ActionStatus;
    use crate::test_support::{ScriptedCloud, ScriptedCloudError};

    const INTERVAL: Duration = Duration::from_millis(500);

    #[fixture]
    fn poller() -> Poller {
        Poller::new(INTERVAL, CancellationToken::new())
    }

    fn action() -> ActionHandle {
        ActionHandle::new("action-1", "create_server")
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4)]
    #[tokio::test(start_paused = true)]
    async fn returns_after_n_pending_responses(poller: Poller, #[case] pending: u32) {
        let cloud = ScriptedCloud::new();
        cloud.queue_action_statuses(
            "create_server",
            (0..pending).map(|_| ActionStatus::InProgress),
        );
        let started = Instant::now();

        poller
            .wait_for_action(&cloud, &action(), started + Duration::from_secs(60))
            .await
            .expect("action should succeed");

        assert_eq!(started.elapsed(), INTERVAL * pending);
        assert_eq!(cloud.count("action_status"), pending as usize + 1);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn endless_progress_times_out_exactly_at_deadline(poller: Poller) {
        let cloud = ScriptedCloud::new();
        cloud.hang_action("create_server");
        let started = Instant::now();
        let budget = Duration::from_millis(1_750);

        let err = poller
            .wait_for_action(&cloud, &action(), started + budget)
            .await
            .expect_err("action never finishes");

        assert!(matches!(err, BuildError::PollTimeout { waited, .. } if waited == budget));
        assert_eq!(started.elapsed(), budget);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn failed_action_surfaces_provider_message(poller: Poller) {
        let cloud = ScriptedCloud::new();
        cloud.queue_action_statuses(
            "create_server",
            [
                ActionStatus::InProgress,
                ActionStatus::Failed {
                    message: String::from("quota exceeded"),
                },
            ],
        );

        let err = poller
            .wait_for_action(&cloud, &action(), Instant::now() + Duration::from_secs(60))
            .await
            .expect_err("action fails");

        assert!(matches!(
            err,
            BuildError::ActionFailed { ref action, ref message }
                if action == "create_server" && message == "quota exceeded"
        ));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn query_errors_are_provider_request_errors(poller: Poller) {
        let cloud = ScriptedCloud::new();
        cloud.fail_operation("action_status", "service unavailable");

        let err = poller
            .wait_for_action(&cloud, &action(), Instant::now() + Duration::from_secs(60))
            .await
            .expect_err("query fails");

        assert!(matches!(
            err,
            BuildError::ProviderRequest {
                operation: "action_status",
                source: ScriptedCloudError { .. }
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_sleep() {
        let cancel = CancellationToken::new();
        let poller = Poller::new(Duration::from_secs(30), cancel.clone());
        let cloud = ScriptedCloud::new();
        cloud.hang_action("create_server");
        let started = Instant::now();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = poller
            .wait_for_action(&cloud, &action(), started + Duration::from_secs(600))
            .await
            .expect_err("cancelled");

        assert!(matches!(err, BuildError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn expired_deadline_never_probes(poller: Poller) {
        let cloud = ScriptedCloud::new();
        let err = poller
            .wait_for_action(&cloud, &action(), Instant::now())
            .await
            .expect_err("deadline already passed");
        assert!(matches!(err, BuildError::PollTimeout { .. }));
        assert_eq!(cloud.count("action_status"), 0);
    }
}
