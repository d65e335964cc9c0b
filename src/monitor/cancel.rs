//! Cancellation Controller
//!
//! Turns a cancel request or an elapsed deadline into a locally conclusive
//! end: the handle stops waiting, the subscription is closed, and if the
//! remote side has not reported a terminal status within the grace period the
//! store is forced to `cancelled`.

use super::handle::TaskHandle;
use super::reconciler::{Admission, Observation, ObservationSender, Source};
use super::record::{ProgressRecord, TaskStatus};
use super::store::ProgressReader;
use crate::session::{SessionFacade, Subscription};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Why cancellation was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A caller asked for it
    Requested,
    /// The overall deadline elapsed
    Deadline,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "cancelled by client"),
            Self::Deadline => write!(f, "deadline elapsed"),
        }
    }
}

pub struct CancellationController {
    session: Arc<dyn SessionFacade>,
    observations: ObservationSender,
    reader: ProgressReader,
    grace_period: Duration,
}

impl CancellationController {
    pub fn new(
        session: Arc<dyn SessionFacade>,
        observations: ObservationSender,
        reader: ProgressReader,
        grace_period: Duration,
    ) -> Self {
        Self {
            session,
            observations,
            reader,
            grace_period,
        }
    }

    /// Cancel `handle`, close `subscription`, and return the terminal record.
    ///
    /// Returns within the grace period plus one store round trip, whether or
    /// not the remote side acknowledges.
    pub async fn request_cancel(
        &self,
        handle: &TaskHandle,
        subscription: Option<&Subscription>,
        reason: CancelReason,
    ) -> ProgressRecord {
        tracing::info!(call_id = %handle.call_id(), %reason, "Cancellation requested");
        let grace_deadline = Instant::now() + self.grace_period;
        handle.cancel();
        if let Some(subscription) = subscription {
            if timeout_at(grace_deadline, self.session.unsubscribe(subscription))
                .await
                .is_err()
            {
                tracing::warn!(resource = %subscription.resource_id(), "Unsubscribe did not complete within grace period");
            }
        }

        let remaining = grace_deadline.saturating_duration_since(Instant::now());
        if let Some(record) = self.reader.wait_for_terminal_within(remaining).await {
            tracing::info!(status = %record.status, "Remote side reached a terminal status");
            return record;
        }

        let current = self.reader.snapshot();
        tracing::warn!(
            task_id = %current.task_id,
            grace_ms = self.grace_period.as_millis() as u64,
            "No acknowledgement within grace period, forcing cancelled"
        );
        let forced = ProgressRecord {
            status: TaskStatus::Cancelled,
            sequence: current.sequence.saturating_add(1),
            detail: Some(reason.to_string()),
            ..current
        };
        match self
            .observations
            .submit(Observation::new(Source::Cancellation, forced.clone()))
            .await
        {
            Ok(Admission::Accepted(record)) => record,
            // Lost a race with a terminal observation, which is now stored
            Ok(Admission::Rejected(_)) => self.reader.snapshot(),
            Err(_) => forced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::reconciler::Reconciler;
    use crate::monitor::store::ProgressStore;
    use crate::session::scripted::{Script, ScriptedSession};
    use serde_json::Value as JsonValue;

    async fn setup(
        script: Script,
    ) -> (ScriptedSession, CancellationController, ObservationSender, TaskHandle) {
        let session = ScriptedSession::new(script);
        let store = ProgressStore::new("t1");
        let reader = store.reader();
        let (observations, _task) = Reconciler::spawn(store);
        let handle = session
            .dispatch_call("pull_model", JsonValue::Null)
            .await
            .unwrap();
        let controller = CancellationController::new(
            Arc::new(session.clone()),
            observations.clone(),
            reader,
            Duration::from_secs(2),
        );
        (session, controller, observations, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_forces_cancelled_when_remote_ignores() {
        let (session, controller, observations, handle) = setup(Script::new().hang()).await;
        observations
            .submit(Observation::new(
                Source::Push,
                ProgressRecord::new("t1", TaskStatus::Running, 40, 3),
            ))
            .await
            .unwrap();
        let mut subscription = session.subscribe("res").await.unwrap();
        let _updates = subscription.take_updates();

        let started = tokio::time::Instant::now();
        let record = controller
            .request_cancel(&handle, Some(&subscription), CancelReason::Requested)
            .await;

        assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(50));
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert_eq!(record.percent, 40);
        assert_eq!(record.detail.as_deref(), Some("cancelled by client"));
        assert!(handle.is_cancelled());
        assert_eq!(session.stats().await.active_subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_terminal_within_grace_is_kept() {
        let (_session, controller, observations, handle) = setup(Script::new().hang()).await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            observations
                .submit(Observation::new(
                    Source::Push,
                    ProgressRecord::new("t1", TaskStatus::Failed, 10, 4).with_detail("aborted"),
                ))
                .await
                .unwrap();
        });

        let record = controller
            .request_cancel(&handle, None, CancelReason::Deadline)
            .await;
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.detail.as_deref(), Some("aborted"));
    }
}
