//! Pullwatch - progress monitoring for long-running remote tasks
//!
//! Pullwatch starts an operation on a remote service (a model download, for
//! instance) and follows it to completion, failure or cancellation. Progress
//! arrives over two unreliable channels at once, push notifications and
//! polled reads, and is merged into a single monotonic view.
//!
//! # Modules
//!
//! - [`monitor`] - records, store, reconciler, monitor loop and cancellation
//! - [`session`] - the session facade and its in-process implementations
//! - [`mcp`] - download resource URIs and payloads
//! - [`config`] - configuration loading
//! - [`logging`] - tracing setup
//!
//! # Example
//!
//! ```rust,no_run
//! use pullwatch::config::{LoopbackConfig, MonitorConfig};
//! use pullwatch::monitor::{monitor, TaskSpec};
//! use pullwatch::session::loopback::LoopbackSession;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let session = Arc::new(LoopbackSession::new(LoopbackConfig::default()));
//! let spec = TaskSpec::pull_model("gemma3-1b", None, None);
//! let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(120);
//! let record = monitor(session, spec, deadline, MonitorConfig::default()).await?;
//! println!("{}", record);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod mcp;
pub mod monitor;
pub mod session;

pub use config::AppConfig;
pub use monitor::{
    MonitorError, ProgressMonitor, ProgressReader, ProgressRecord, SessionHandle, TaskSpec,
    TaskStatus,
};
pub use session::SessionFacade;
