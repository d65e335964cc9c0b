//! Monitor Loop
//!
//! Drives one remote task from dispatch to a terminal record. Push delivery,
//! polling and the wait on the call itself run side by side and all feed the
//! same reconciler; the loop ends on the first of a terminal store, a
//! resolved call, the deadline, an external cancel, or the observation
//! channels giving out.

use super::cancel::{CancelReason, CancellationController};
use super::error::MonitorError;
use super::handle::{TaskOutcome, TaskSpec};
use super::reconciler::{Observation, ObservationSender, Reconciler, Source};
use super::record::{ProgressRecord, TaskStatus};
use super::store::{ProgressReader, ProgressStore};
use crate::config::MonitorConfig;
use crate::session::{Notification, SessionFacade, Subscription};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// External control over a running monitor
#[derive(Clone)]
pub struct SessionHandle {
    cancel: CancellationToken,
    reader: ProgressReader,
}

impl SessionHandle {
    /// Ask the monitor to cancel; it returns a `cancelled` record within the
    /// grace period
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Read-only view of the task's progress
    pub fn progress(&self) -> ProgressReader {
        self.reader.clone()
    }
}

/// Trigger cancellation of the monitor behind `handle`
pub fn cancel(handle: &SessionHandle) {
    handle.cancel();
}

/// Monitor `spec` until it reaches a terminal record or `deadline` passes
pub async fn monitor(
    session: Arc<dyn SessionFacade>,
    spec: TaskSpec,
    deadline: Instant,
    config: MonitorConfig,
) -> Result<ProgressRecord, MonitorError> {
    ProgressMonitor::new(session, spec, config).run(deadline).await
}

#[derive(Debug, Clone, Copy)]
struct PushState {
    live: bool,
    last_seen: Instant,
}

enum Exit {
    Terminal(ProgressRecord),
    Joined(TaskOutcome),
    Deadline,
    Cancelled,
    Unavailable(String),
}

/// One observation session for one task
pub struct ProgressMonitor {
    session: Arc<dyn SessionFacade>,
    spec: TaskSpec,
    config: MonitorConfig,
    store: ProgressStore,
    reader: ProgressReader,
    cancel: CancellationToken,
}

impl ProgressMonitor {
    pub fn new(session: Arc<dyn SessionFacade>, spec: TaskSpec, config: MonitorConfig) -> Self {
        let store = ProgressStore::new(spec.task_id.clone());
        let reader = store.reader();
        Self {
            session,
            spec,
            config,
            store,
            reader,
            cancel: CancellationToken::new(),
        }
    }

    /// Handle for cancelling and observing from outside the loop
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cancel: self.cancel.clone(),
            reader: self.reader.clone(),
        }
    }

    /// Run with the configured timeout as deadline
    pub async fn run_with_timeout(self) -> Result<ProgressRecord, MonitorError> {
        let deadline = Instant::now() + self.config.timeout();
        self.run(deadline).await
    }

    pub async fn run(self, deadline: Instant) -> Result<ProgressRecord, MonitorError> {
        let Self {
            session,
            spec,
            config,
            mut store,
            reader,
            cancel,
        } = self;
        let started = Instant::now();

        tracing::info!(
            task_id = %spec.task_id,
            call = %spec.call,
            resource = %spec.resource_id,
            "Starting remote task"
        );
        let dispatched = tokio::select! {
            result = session.dispatch_call(&spec.call, spec.args.clone()) => Ok(result),
            _ = cancel.cancelled() => Err(Exit::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(Exit::Deadline),
        };
        let handle = match dispatched {
            Ok(result) => result.inspect_err(
                |e| tracing::warn!(task_id = %spec.task_id, "Dispatch failed: {}", e),
            )?,
            Err(exit) => {
                tracing::warn!(task_id = %spec.task_id, "Dispatch was not acknowledged");
                return abandon_dispatch(&mut store, exit, started);
            }
        };

        let (observations, reconciler) = Reconciler::spawn(store);
        let stop = CancellationToken::new();

        let subscribed = tokio::select! {
            result = session.subscribe(&spec.resource_id) => Some(result),
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep_until(deadline) => None,
        };
        let mut subscription = match subscribed {
            Some(Ok(subscription)) => {
                tracing::info!(resource = %spec.resource_id, "Subscribed to progress updates");
                Some(subscription)
            }
            Some(Err(e)) => {
                tracing::warn!(
                    resource = %spec.resource_id,
                    "Subscription failed, falling back to polling: {}",
                    e
                );
                None
            }
            None => {
                tracing::warn!(resource = %spec.resource_id, "Subscription did not complete");
                None
            }
        };
        let updates = subscription.as_mut().and_then(Subscription::take_updates);

        let (push_state, push_state_rx) = watch::channel(PushState {
            live: updates.is_some(),
            last_seen: started,
        });
        let push_task = updates.map(|updates| {
            tokio::spawn(push_loop(
                session.clone(),
                updates,
                observations.clone(),
                push_state,
                stop.clone(),
            ))
        });

        let (unavailable_tx, mut unavailable_rx) = oneshot::channel();
        let poll_task = tokio::spawn(poll_loop(
            session.clone(),
            spec.resource_id.clone(),
            observations.clone(),
            push_state_rx,
            stop.clone(),
            config.clone(),
            unavailable_tx,
        ));

        let exit = tokio::select! {
            biased;
            record = reader.wait_for_terminal() => Exit::Terminal(record),
            outcome = handle.join() => Exit::Joined(outcome),
            _ = cancel.cancelled() => Exit::Cancelled,
            _ = tokio::time::sleep_until(deadline) => Exit::Deadline,
            Ok(reason) = &mut unavailable_rx => Exit::Unavailable(reason),
        };

        let controller = CancellationController::new(
            session.clone(),
            observations.clone(),
            reader.clone(),
            config.grace_period(),
        );
        let result = match exit {
            Exit::Terminal(record) => {
                tracing::info!(task_id = %spec.task_id, status = %record.status, "Progress reached terminal status");
                check_outcome(record, handle.outcome().as_ref())
            }
            Exit::Joined(outcome) => {
                tracing::info!(task_id = %spec.task_id, ?outcome, "Remote call resolved");
                let read_deadline = deadline.min(Instant::now() + config.poll_interval());
                let record = settle(
                    session.as_ref(),
                    &spec,
                    &observations,
                    &reader,
                    &outcome,
                    read_deadline,
                )
                .await;
                check_outcome(record, Some(&outcome))
            }
            Exit::Cancelled => {
                let record = controller
                    .request_cancel(&handle, subscription.as_ref(), CancelReason::Requested)
                    .await;
                Ok(record)
            }
            Exit::Deadline => {
                let elapsed = started.elapsed();
                let last = reader.snapshot();
                tracing::warn!(task_id = %spec.task_id, ?elapsed, "Deadline elapsed at {}", last);
                controller
                    .request_cancel(&handle, subscription.as_ref(), CancelReason::Deadline)
                    .await;
                Err(MonitorError::Timeout { elapsed, last })
            }
            Exit::Unavailable(reason) => {
                tracing::error!(task_id = %spec.task_id, "Giving up on progress observation: {}", reason);
                Err(MonitorError::ObservationUnavailable(reason))
            }
        };

        // Teardown runs on every exit path.
        stop.cancel();
        if let Some(subscription) = &subscription {
            if tokio::time::timeout(config.grace_period(), session.unsubscribe(subscription))
                .await
                .is_err()
            {
                tracing::warn!(resource = %spec.resource_id, "Unsubscribe did not complete");
            }
        }
        if let Some(push_task) = push_task {
            push_task.await.ok();
        }
        poll_task.await.ok();
        drop(controller);
        drop(observations);
        if let Ok(stats) = reconciler.await {
            tracing::info!(task_id = %spec.task_id, "Reconciler finished: {}", stats);
        }

        result
    }
}

/// Feed push notifications into the reconciler until the channel closes
async fn push_loop(
    session: Arc<dyn SessionFacade>,
    mut updates: mpsc::Receiver<Notification>,
    observations: ObservationSender,
    push_state: watch::Sender<PushState>,
    stop: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = stop.cancelled() => break,
            notification = updates.recv() => notification,
        };
        let Some(notification) = notification else {
            tracing::info!("Push channel closed");
            break;
        };
        push_state.send_modify(|state| state.last_seen = Instant::now());

        let record = match notification {
            Notification::Progress(record) => record,
            Notification::ResourceUpdated { uri } => {
                let read = tokio::select! {
                    _ = stop.cancelled() => break,
                    read = session.read(&uri) => read,
                };
                match read {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::debug!(%uri, "Read after update hint failed: {}", e);
                        continue;
                    }
                }
            }
        };
        if observations
            .submit(Observation::new(Source::Push, record))
            .await
            .is_err()
        {
            break;
        }
    }
    push_state.send_modify(|state| state.live = false);
}

/// Poll the resource whenever push is unavailable or has gone quiet
async fn poll_loop(
    session: Arc<dyn SessionFacade>,
    resource_id: String,
    observations: ObservationSender,
    push_state: watch::Receiver<PushState>,
    stop: CancellationToken,
    config: MonitorConfig,
    unavailable: oneshot::Sender<String>,
) {
    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let staleness = config.staleness_threshold();
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let state = *push_state.borrow();
        if state.live && state.last_seen.elapsed() < staleness {
            continue;
        }

        let read = tokio::select! {
            _ = stop.cancelled() => return,
            read = session.read(&resource_id) => read,
        };
        match read {
            Ok(record) => {
                failures = 0;
                if observations
                    .submit(Observation::new(Source::Poll, record))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) if state.live => {
                tracing::debug!(resource = %resource_id, "Liveness poll failed: {}", e);
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    resource = %resource_id,
                    failures,
                    "Could not read progress: {}",
                    e
                );
                if failures >= config.max_read_failures {
                    unavailable
                        .send(format!(
                            "push unavailable and {} consecutive reads failed, last error: {}",
                            failures, e
                        ))
                        .ok();
                    return;
                }
            }
        }
    }
}

/// End the run before the remote call was acknowledged
fn abandon_dispatch(
    store: &mut ProgressStore,
    exit: Exit,
    started: Instant,
) -> Result<ProgressRecord, MonitorError> {
    let current = store.snapshot();
    match exit {
        Exit::Deadline => Err(MonitorError::Timeout {
            elapsed: started.elapsed(),
            last: current,
        }),
        _ => {
            let forced = ProgressRecord {
                status: TaskStatus::Cancelled,
                sequence: current.sequence.saturating_add(1),
                detail: Some(CancelReason::Requested.to_string()),
                ..current
            };
            store.update(&forced);
            Ok(store.snapshot())
        }
    }
}

/// Bring the store to a terminal record after the call resolved.
///
/// The final read gives up at `read_deadline`; the call outcome is then
/// used as is.
async fn settle(
    session: &dyn SessionFacade,
    spec: &TaskSpec,
    observations: &ObservationSender,
    reader: &ProgressReader,
    outcome: &TaskOutcome,
    read_deadline: Instant,
) -> ProgressRecord {
    if !reader.snapshot().is_terminal() {
        match tokio::time::timeout_at(read_deadline, session.read(&spec.resource_id)).await {
            Ok(Ok(record)) => {
                observations
                    .submit(Observation::new(Source::Poll, record))
                    .await
                    .ok();
            }
            Ok(Err(e)) => {
                tracing::debug!(resource = %spec.resource_id, "Final read failed: {}", e)
            }
            Err(_) => tracing::warn!(resource = %spec.resource_id, "Final read timed out"),
        }
    }

    let current = reader.snapshot();
    if current.is_terminal() {
        return current;
    }

    let sequence = current.sequence.saturating_add(1);
    let record = match outcome {
        TaskOutcome::Succeeded(_) => ProgressRecord {
            status: TaskStatus::Complete,
            percent: 100,
            sequence,
            detail: None,
            ..current
        },
        TaskOutcome::Failed(error) => ProgressRecord {
            status: TaskStatus::Failed,
            sequence,
            detail: Some(error.clone()),
            ..current
        },
        TaskOutcome::Cancelled => ProgressRecord {
            status: TaskStatus::Cancelled,
            sequence,
            ..current
        },
    };
    observations
        .submit(Observation::new(Source::Completion, record))
        .await
        .ok();
    reader.snapshot()
}

/// The call's own result and the progress resource must agree on the outcome
fn check_outcome(
    record: ProgressRecord,
    outcome: Option<&TaskOutcome>,
) -> Result<ProgressRecord, MonitorError> {
    if !record.is_terminal() {
        return Err(MonitorError::ObservationUnavailable(format!(
            "progress store closed before a terminal status, last known: {}",
            record
        )));
    }
    match (outcome, record.status) {
        (Some(TaskOutcome::Succeeded(_)), TaskStatus::Failed | TaskStatus::Cancelled) => {
            Err(MonitorError::ProtocolAnomaly(format!(
                "remote call succeeded but progress ended as {}",
                record
            )))
        }
        (Some(TaskOutcome::Failed(error)), TaskStatus::Complete) => {
            Err(MonitorError::ProtocolAnomaly(format!(
                "remote call failed ({}) but progress ended as {}",
                error, record
            )))
        }
        _ => Ok(record),
    }
}
