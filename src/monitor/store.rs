//! Progress Store
//!
//! Holds the latest admitted [`ProgressRecord`] for one task. The store itself
//! is the only writer and is owned by the reconciler; everyone else reads
//! through a [`ProgressReader`], which hands out snapshot copies.

use super::error::WaitError;
use super::reconciler::{admit, Admission};
use super::record::ProgressRecord;
use std::time::Duration;
use tokio::sync::watch;

/// Single-writer holder of the current record
pub struct ProgressStore {
    tx: watch::Sender<ProgressRecord>,
}

impl ProgressStore {
    /// Create a store for `task_id`, starting at `pending` / 0%
    pub fn new(task_id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(ProgressRecord::initial(task_id));
        Self { tx }
    }

    /// Apply the admission rules to `observation` and store it if accepted.
    ///
    /// Accepted records wake every reader waiting on a change.
    pub fn update(&mut self, observation: &ProgressRecord) -> Admission {
        let current = self.tx.borrow().clone();
        match admit(&current, observation) {
            Ok(next) => {
                self.tx.send_replace(next.clone());
                Admission::Accepted(next)
            }
            Err(rejection) => Admission::Rejected(rejection),
        }
    }

    pub fn snapshot(&self) -> ProgressRecord {
        self.tx.borrow().clone()
    }

    /// A read-only view that can be cloned freely
    pub fn reader(&self) -> ProgressReader {
        ProgressReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of a [`ProgressStore`]
#[derive(Clone)]
pub struct ProgressReader {
    rx: watch::Receiver<ProgressRecord>,
}

impl ProgressReader {
    /// Current record; never blocks
    pub fn snapshot(&self) -> ProgressRecord {
        self.rx.borrow().clone()
    }

    /// Wait until a record with `sequence > since_sequence` is stored.
    ///
    /// Returns [`WaitError::Closed`] as soon as the store is gone and nothing
    /// newer is available, since no later change can arrive.
    pub async fn wait_for_change(
        &self,
        since_sequence: u64,
        timeout: Duration,
    ) -> Result<ProgressRecord, WaitError> {
        let mut rx = self.rx.clone();
        let changed = rx.wait_for(|r| r.sequence > since_sequence);
        let result = match tokio::time::timeout(timeout, changed).await {
            Ok(Ok(record)) => Ok(record.clone()),
            Ok(Err(_)) => Err(WaitError::Closed),
            Err(_) => Err(WaitError::Timeout(timeout)),
        };
        result
    }

    /// Wait until the stored status is terminal.
    ///
    /// If the store closes first, the last stored record is returned as is.
    pub async fn wait_for_terminal(&self) -> ProgressRecord {
        let mut rx = self.rx.clone();
        let terminal = rx.wait_for(|r| r.is_terminal()).await.map(|r| r.clone());
        terminal.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Like [`wait_for_terminal`](Self::wait_for_terminal), bounded by `timeout`
    pub async fn wait_for_terminal_within(&self, timeout: Duration) -> Option<ProgressRecord> {
        tokio::time::timeout(timeout, self.wait_for_terminal())
            .await
            .ok()
            .filter(|r| r.is_terminal())
    }
}
