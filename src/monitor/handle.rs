//! Task Handle
//!
//! One in-flight remote call: an identifier, an idempotent cancellation
//! trigger and a completion slot. The session facade resolves the slot through
//! the paired [`TaskCompleter`]; a local cancel resolves it to
//! [`TaskOutcome::Cancelled`]. Whichever happens first wins.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What to start and where to watch it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task id carried by progress records
    pub task_id: String,
    /// Remote operation name
    pub call: String,
    /// Remote operation arguments
    pub args: JsonValue,
    /// Progress resource to subscribe to and poll
    pub resource_id: String,
}

impl TaskSpec {
    pub fn new(
        task_id: impl Into<String>,
        call: impl Into<String>,
        args: JsonValue,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            call: call.into(),
            args,
            resource_id: resource_id.into(),
        }
    }

    /// A `pull_model` call watched through `litert://downloads/{model}`
    pub fn pull_model(model: &str, alias: Option<&str>, hf_token: Option<&str>) -> Self {
        let mut args = serde_json::json!({ "model": model });
        if let Some(alias) = alias {
            args["alias"] = JsonValue::from(alias);
        }
        if let Some(token) = hf_token {
            args["hf_token"] = JsonValue::from(token);
        }
        Self::new(
            model,
            "pull_model",
            args,
            crate::mcp::resource::download_uri(model),
        )
    }
}

/// Final state of the completion slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The remote call returned; carries its text result
    Succeeded(String),
    /// The remote call reported an error
    Failed(String),
    /// Cancelled locally before the call resolved
    Cancelled,
}

type Slot = Arc<watch::Sender<Option<TaskOutcome>>>;

fn resolve(slot: &Slot, outcome: TaskOutcome) -> bool {
    slot.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(outcome);
        true
    })
}

/// Handle to one remote call
#[derive(Clone)]
pub struct TaskHandle {
    call_id: Uuid,
    cancel: CancellationToken,
    slot: Slot,
}

impl TaskHandle {
    /// Create a handle and the completer the session uses to resolve it
    pub fn new() -> (Self, TaskCompleter) {
        let (tx, _rx) = watch::channel(None);
        let slot = Arc::new(tx);
        let cancel = CancellationToken::new();
        let call_id = Uuid::new_v4();
        let handle = Self {
            call_id,
            cancel: cancel.clone(),
            slot: slot.clone(),
        };
        let completer = TaskCompleter {
            call_id,
            cancel,
            slot,
            resolved: false,
        };
        (handle, completer)
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Stop waiting and resolve locally as cancelled; safe to call repeatedly.
    ///
    /// The remote side learns about it through [`TaskCompleter::cancelled`]
    /// but is free to ignore it.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(call_id = %self.call_id, "Cancelling task handle");
        }
        self.cancel.cancel();
        resolve(&self.slot, TaskOutcome::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the call to succeed, fail, or be cancelled
    pub async fn join(&self) -> TaskOutcome {
        let mut rx = self.slot.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.map(|o| o.clone());
        match outcome {
            Ok(Some(outcome)) => outcome,
            _ => TaskOutcome::Cancelled,
        }
    }

    /// The outcome if the slot is already resolved
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.slot.borrow().clone()
    }
}

/// Session-side half of a [`TaskHandle`]
///
/// Dropping it unresolved resolves the handle as failed, so a waiter is never
/// left hanging on a call the session abandoned.
pub struct TaskCompleter {
    call_id: Uuid,
    cancel: CancellationToken,
    slot: Slot,
    resolved: bool,
}

impl TaskCompleter {
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Resolve with the call's result; returns false if already resolved
    pub fn succeed(mut self, output: impl Into<String>) -> bool {
        self.resolved = true;
        resolve(&self.slot, TaskOutcome::Succeeded(output.into()))
    }

    /// Resolve with a remote error; returns false if already resolved
    pub fn fail(mut self, error: impl Into<String>) -> bool {
        self.resolved = true;
        resolve(&self.slot, TaskOutcome::Failed(error.into()))
    }

    /// Completes when the local side cancels the handle
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TaskCompleter {
    fn drop(&mut self) {
        if !self.resolved {
            resolve(&self.slot, TaskOutcome::Failed("remote call abandoned".to_string()));
        }
    }
}
