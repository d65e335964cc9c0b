//! Session facade
//!
//! The monitoring engine talks to the remote service only through
//! [`SessionFacade`]. Connection handling, framing and dispatch live behind it.
//!
//! Two implementations ship with the crate:
//!
//! - [`scripted::ScriptedSession`] replays fixed push/poll scripts, for tests
//! - [`loopback::LoopbackSession`] emulates the model download server in-process

pub mod loopback;
pub mod scripted;

use crate::monitor::error::{DispatchError, ReadError, SubscribeError};
use crate::monitor::handle::TaskHandle;
use crate::monitor::record::ProgressRecord;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Inbound push message on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The new value is carried inline
    Progress(ProgressRecord),
    /// Only the URI changed hands; the value has to be read
    ResourceUpdated { uri: String },
}

/// An open push channel for one resource
pub struct Subscription {
    id: Uuid,
    resource_id: String,
    updates: Option<mpsc::Receiver<Notification>>,
}

impl Subscription {
    pub fn new(resource_id: impl Into<String>, updates: mpsc::Receiver<Notification>) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_id: resource_id.into(),
            updates: Some(updates),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Take the inbound channel; the subscription itself stays with the owner
    /// so it can still be unsubscribed.
    pub fn take_updates(&mut self) -> Option<mpsc::Receiver<Notification>> {
        self.updates.take()
    }
}

/// Minimal view of a remote session
#[async_trait]
pub trait SessionFacade: Send + Sync {
    /// Issue a named remote operation without waiting for its result
    async fn dispatch_call(&self, name: &str, args: JsonValue) -> Result<TaskHandle, DispatchError>;

    /// Open a push channel for `resource_id`
    async fn subscribe(&self, resource_id: &str) -> Result<Subscription, SubscribeError>;

    /// One-shot read of the resource's current value
    async fn read(&self, resource_id: &str) -> Result<ProgressRecord, ReadError>;

    /// Close a subscription. Idempotent; closing drops the session's end of
    /// the update channel so the receiver observes the close.
    async fn unsubscribe(&self, subscription: &Subscription);
}
