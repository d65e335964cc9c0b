//! Reconciler
//!
//! Merges observations from every source (push notifications, poll reads,
//! call completion, forced cancellation) into one [`ProgressStore`]. Sources
//! never touch the store; they hold an [`ObservationSender`] and the
//! reconciler task applies their observations one at a time.
//!
//! Admission of an observation `o` against the stored record `s`:
//!
//! 1. a terminal `s` absorbs everything;
//! 2. `o.sequence <= s.sequence` is stale, unless `o` is terminal;
//! 3. a backward status move is a protocol anomaly;
//! 4. a lower percent on a non-terminal `o` is a regression;
//! 5. otherwise `o` is stored and the sequence advances.
//!
//! Malformed records, backward status moves and records for another task are
//! protocol anomalies: logged, counted and discarded.

use super::record::{ProgressRecord, TaskStatus};
use super::store::ProgressStore;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 64;

/// Why an observation was not stored
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("task already reached terminal status {0}")]
    Absorbed(TaskStatus),

    #[error("stale sequence {incoming} (stored {stored})")]
    Stale { incoming: u64, stored: u64 },

    #[error("percent regressed from {stored}% to {incoming}%")]
    Regressed { incoming: u8, stored: u8 },

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("observation belongs to task {0}")]
    ForeignTask(String),
}

impl Rejection {
    /// Anomalies point at a misbehaving peer; the rest are ordinary races
    pub fn is_anomaly(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_) | Self::IllegalTransition { .. } | Self::ForeignTask(_)
        )
    }
}

/// Result of offering an observation to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Stored; carries the record as it now sits in the store
    Accepted(ProgressRecord),
    Rejected(Rejection),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Decide whether `incoming` may replace `stored`, returning the record to store
pub fn admit(stored: &ProgressRecord, incoming: &ProgressRecord) -> Result<ProgressRecord, Rejection> {
    if incoming.task_id != stored.task_id {
        return Err(Rejection::ForeignTask(incoming.task_id.clone()));
    }
    if stored.is_terminal() {
        return Err(Rejection::Absorbed(stored.status));
    }
    incoming.validate().map_err(Rejection::Malformed)?;

    // A terminal observation wins over a non-terminal store whatever its sequence.
    if incoming.sequence <= stored.sequence && !incoming.is_terminal() {
        return Err(Rejection::Stale {
            incoming: incoming.sequence,
            stored: stored.sequence,
        });
    }
    if !stored.status.can_advance_to(incoming.status) {
        return Err(Rejection::IllegalTransition {
            from: stored.status,
            to: incoming.status,
        });
    }
    if incoming.percent < stored.percent && !incoming.is_terminal() {
        return Err(Rejection::Regressed {
            incoming: incoming.percent,
            stored: stored.percent,
        });
    }

    let mut next = incoming.clone();
    next.sequence = incoming.sequence.max(stored.sequence.saturating_add(1));
    Ok(next)
}

/// Where an observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Subscription notification
    Push,
    /// Explicit resource read
    Poll,
    /// Synthesized from the remote call's result
    Completion,
    /// Forced by the cancellation controller
    Cancellation,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Poll => write!(f, "poll"),
            Self::Completion => write!(f, "completion"),
            Self::Cancellation => write!(f, "cancellation"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Observation {
    pub source: Source,
    pub record: ProgressRecord,
}

impl Observation {
    pub fn new(source: Source, record: ProgressRecord) -> Self {
        Self { source, record }
    }
}

struct Envelope {
    observation: Observation,
    resp: oneshot::Sender<Admission>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("reconciler has stopped")]
pub struct ReconcilerClosed;

/// Send capability into the reconciler
#[derive(Clone)]
pub struct ObservationSender {
    tx: mpsc::Sender<Envelope>,
}

impl ObservationSender {
    /// Offer an observation and wait for the admission decision
    pub async fn submit(&self, observation: Observation) -> Result<Admission, ReconcilerClosed> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Envelope { observation, resp })
            .await
            .map_err(|_| ReconcilerClosed)?;
        rx.await.map_err(|_| ReconcilerClosed)
    }
}

/// Per-run admission counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub accepted: usize,
    pub stale: usize,
    pub regressed: usize,
    pub absorbed: usize,
    pub anomalies: usize,
}

impl fmt::Display for ReconcileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accepted={} stale={} regressed={} absorbed={} anomalies={}",
            self.accepted, self.stale, self.regressed, self.absorbed, self.anomalies
        )
    }
}

/// Owner and only writer of a [`ProgressStore`]
pub struct Reconciler {
    store: ProgressStore,
    rx: mpsc::Receiver<Envelope>,
    stats: ReconcileStats,
}

impl Reconciler {
    /// Move `store` into a reconciler task.
    ///
    /// The task runs until every [`ObservationSender`] is dropped and then
    /// returns its counters.
    pub fn spawn(store: ProgressStore) -> (ObservationSender, JoinHandle<ReconcileStats>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let reconciler = Self {
            store,
            rx,
            stats: ReconcileStats::default(),
        };
        let handle = tokio::spawn(reconciler.run());
        (ObservationSender { tx }, handle)
    }

    async fn run(mut self) -> ReconcileStats {
        while let Some(Envelope { observation, resp }) = self.rx.recv().await {
            let admission = self.apply(&observation);
            resp.send(admission).ok();
        }
        self.stats
    }

    fn apply(&mut self, observation: &Observation) -> Admission {
        let admission = self.store.update(&observation.record);
        let record = &observation.record;
        match &admission {
            Admission::Accepted(stored) => {
                self.stats.accepted += 1;
                tracing::debug!(
                    task_id = %stored.task_id,
                    source = %observation.source,
                    sequence = stored.sequence,
                    status = %stored.status,
                    percent = stored.percent,
                    "Progress updated"
                );
            }
            Admission::Rejected(rejection) if rejection.is_anomaly() => {
                self.stats.anomalies += 1;
                tracing::warn!(
                    task_id = %record.task_id,
                    source = %observation.source,
                    sequence = record.sequence,
                    "Protocol anomaly, observation discarded: {}",
                    rejection
                );
            }
            Admission::Rejected(rejection) => {
                match rejection {
                    Rejection::Stale { .. } => self.stats.stale += 1,
                    Rejection::Regressed { .. } => self.stats.regressed += 1,
                    _ => self.stats.absorbed += 1,
                }
                tracing::debug!(
                    task_id = %record.task_id,
                    source = %observation.source,
                    sequence = record.sequence,
                    "Observation ignored: {}",
                    rejection
                );
            }
        }
        admission
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(status: TaskStatus, percent: u8, sequence: u64) -> ProgressRecord {
        ProgressRecord::new("t1", status, percent, sequence)
    }

    #[test]
    fn test_accepts_forward_progress() {
        let stored = rec(TaskStatus::Pending, 0, 1);
        let next = admit(&stored, &rec(TaskStatus::Running, 10, 2)).unwrap();
        assert_eq!(next, rec(TaskStatus::Running, 10, 2));
    }

    #[test]
    fn test_rejects_stale_sequence() {
        let stored = rec(TaskStatus::Running, 30, 5);
        assert_eq!(
            admit(&stored, &rec(TaskStatus::Running, 40, 5)),
            Err(Rejection::Stale { incoming: 5, stored: 5 })
        );
    }

    #[test]
    fn test_rejects_percent_regression() {
        let stored = rec(TaskStatus::Running, 30, 1);
        assert_eq!(
            admit(&stored, &rec(TaskStatus::Running, 20, 2)),
            Err(Rejection::Regressed { incoming: 20, stored: 30 })
        );
    }

    #[test]
    fn test_stale_terminal_wins_and_advances_sequence() {
        let stored = rec(TaskStatus::Running, 40, 5);
        let next = admit(&stored, &rec(TaskStatus::Failed, 40, 3)).unwrap();
        assert_eq!(next.status, TaskStatus::Failed);
        assert_eq!(next.sequence, 6);
    }

    #[test]
    fn test_terminal_with_lower_percent_is_accepted() {
        let stored = rec(TaskStatus::Running, 70, 8);
        let next = admit(&stored, &rec(TaskStatus::Failed, 0, 9)).unwrap();
        assert_eq!(next.percent, 0);
    }

    #[test]
    fn test_backward_transition_is_anomaly() {
        let stored = rec(TaskStatus::Verifying, 95, 4);
        let err = admit(&stored, &rec(TaskStatus::Running, 96, 5)).unwrap_err();
        assert_eq!(
            err,
            Rejection::IllegalTransition {
                from: TaskStatus::Verifying,
                to: TaskStatus::Running
            }
        );
        assert!(err.is_anomaly());
    }

    #[test]
    fn test_backward_move_with_lower_percent_is_anomaly() {
        let stored = rec(TaskStatus::Verifying, 95, 4);
        let err = admit(&stored, &rec(TaskStatus::Running, 40, 5)).unwrap_err();
        assert_eq!(
            err,
            Rejection::IllegalTransition {
                from: TaskStatus::Verifying,
                to: TaskStatus::Running
            }
        );
        assert!(err.is_anomaly());
    }

    #[test]
    fn test_sequence_saturates_at_max() {
        let stored = rec(TaskStatus::Running, 10, u64::MAX);
        assert!(matches!(
            admit(&stored, &rec(TaskStatus::Running, 20, 7)),
            Err(Rejection::Stale { .. })
        ));
        let next = admit(&stored, &rec(TaskStatus::Complete, 100, 5)).unwrap();
        assert_eq!(next.status, TaskStatus::Complete);
        assert_eq!(next.sequence, u64::MAX);
    }

    #[test]
    fn test_malformed_and_foreign_records() {
        let stored = rec(TaskStatus::Running, 10, 1);
        assert!(matches!(
            admit(&stored, &rec(TaskStatus::Running, 100, 2)),
            Err(Rejection::Malformed(_))
        ));
        assert!(matches!(
            admit(&stored, &rec(TaskStatus::Complete, 90, 2)),
            Err(Rejection::Malformed(_))
        ));
        let foreign = ProgressRecord::new("t2", TaskStatus::Running, 20, 2);
        assert_eq!(
            admit(&stored, &foreign),
            Err(Rejection::ForeignTask("t2".to_string()))
        );
    }

    #[test]
    fn test_absorbed_after_terminal() {
        let stored = rec(TaskStatus::Cancelled, 40, 3);
        assert_eq!(
            admit(&stored, &rec(TaskStatus::Complete, 100, 10)),
            Err(Rejection::Absorbed(TaskStatus::Cancelled))
        );
    }

    #[tokio::test]
    async fn test_reconciler_counts_and_stops() {
        let store = ProgressStore::new("t1");
        let reader = store.reader();
        let (sender, handle) = Reconciler::spawn(store);

        let observations = [
            (Source::Push, rec(TaskStatus::Running, 30, 1)),
            (Source::Poll, rec(TaskStatus::Running, 20, 2)),
            (Source::Poll, rec(TaskStatus::Running, 25, 1)),
            (Source::Push, rec(TaskStatus::Pending, 40, 3)),
            (Source::Push, rec(TaskStatus::Complete, 100, 4)),
            (Source::Poll, rec(TaskStatus::Running, 50, 5)),
        ];
        for (source, record) in observations {
            sender.submit(Observation::new(source, record)).await.unwrap();
        }
        drop(sender);

        let stats = handle.await.unwrap();
        assert_eq!(
            stats,
            ReconcileStats {
                accepted: 2,
                stale: 1,
                regressed: 1,
                absorbed: 1,
                anomalies: 1,
            }
        );
        assert_eq!(reader.snapshot().status, TaskStatus::Complete);
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails() {
        let store = ProgressStore::new("t1");
        let (sender, handle) = Reconciler::spawn(store);
        handle.abort();
        let _ = handle.await;

        let result = sender
            .submit(Observation::new(Source::Push, rec(TaskStatus::Running, 1, 1)))
            .await;
        assert_eq!(result, Err(ReconcilerClosed));
    }
}
