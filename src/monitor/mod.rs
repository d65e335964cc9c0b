//! Progress monitoring
//!
//! Starts a long-running remote task and keeps one authoritative view of its
//! progress while it runs. Push notifications and polled reads are both just
//! observations; the reconciler is the only writer of the store and decides
//! which of them are admitted.
//!
//! - [`record`] - progress records and the status state machine
//! - [`store`] - the latest admitted record, with read-only snapshots
//! - [`reconciler`] - admission rules and the single-writer actor
//! - [`handle`] - one in-flight remote call
//! - [`cancel`] - bounded cancellation
//! - [`runner`] - the monitor loop tying it all together

pub mod cancel;
pub mod error;
pub mod handle;
pub mod reconciler;
pub mod record;
pub mod runner;
pub mod store;

pub use cancel::{CancelReason, CancellationController};
pub use error::{DispatchError, MonitorError, ReadError, SubscribeError, WaitError};
pub use handle::{TaskCompleter, TaskHandle, TaskOutcome, TaskSpec};
pub use reconciler::{
    admit, Admission, Observation, ObservationSender, ReconcileStats, Reconciler, Rejection,
    Source,
};
pub use record::{ProgressRecord, TaskStatus};
pub use runner::{cancel, monitor, ProgressMonitor, SessionHandle};
pub use store::{ProgressReader, ProgressStore};
