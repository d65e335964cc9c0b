//! Scripted session
//!
//! A [`SessionFacade`] that replays a fixed [`Script`]: push notifications at
//! set delays after subscribing, a queue of poll results, and a canned outcome
//! for the remote call. It counts every interaction so tests can check that
//! subscriptions are closed on every exit path.

use super::{Notification, SessionFacade, Subscription};
use crate::monitor::error::{DispatchError, ReadError, SubscribeError};
use crate::monitor::handle::{TaskCompleter, TaskHandle};
use crate::monitor::record::ProgressRecord;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

const PUSH_BUFFER: usize = 32;

/// One push delivery, relative to the previous one
#[derive(Debug, Clone)]
pub struct PushStep {
    pub delay: Duration,
    pub notification: Notification,
}

/// One poll result
#[derive(Debug, Clone)]
pub enum ReadStep {
    Record(ProgressRecord),
    Fail(ReadError),
}

/// How the remote call resolves
#[derive(Debug, Clone)]
pub enum CallScript {
    Succeed { after: Duration, output: String },
    Fail { after: Duration, error: String },
    /// Never resolves on its own
    Hang,
}

/// Everything a [`ScriptedSession`] will do
#[derive(Debug, Clone)]
pub struct Script {
    pub push: Vec<PushStep>,
    /// Consumed front to back; the last entry repeats forever
    pub reads: Vec<ReadStep>,
    pub call: CallScript,
    pub dispatch_error: Option<DispatchError>,
    pub subscribe_error: Option<SubscribeError>,
    /// Pushed, and served to reads, once the handle is cancelled
    pub cancel_ack: Option<ProgressRecord>,
    /// Close the push channel from the remote side once the script runs out
    pub close_push_when_done: bool,
    /// Dispatch is never acknowledged
    pub stall_dispatch: bool,
    /// Reads never return
    pub stall_reads: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            push: Vec::new(),
            reads: Vec::new(),
            call: CallScript::Hang,
            dispatch_error: None,
            subscribe_error: None,
            cancel_ack: None,
            close_push_when_done: false,
            stall_dispatch: false,
            stall_reads: false,
        }
    }
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, delay: Duration, record: ProgressRecord) -> Self {
        self.push.push(PushStep {
            delay,
            notification: Notification::Progress(record),
        });
        self
    }

    /// Push a bare "resource updated" hint
    pub fn push_hint(mut self, delay: Duration, uri: impl Into<String>) -> Self {
        self.push.push(PushStep {
            delay,
            notification: Notification::ResourceUpdated { uri: uri.into() },
        });
        self
    }

    pub fn read(mut self, record: ProgressRecord) -> Self {
        self.reads.push(ReadStep::Record(record));
        self
    }

    pub fn read_error(mut self, error: ReadError) -> Self {
        self.reads.push(ReadStep::Fail(error));
        self
    }

    pub fn succeed_after(mut self, after: Duration, output: impl Into<String>) -> Self {
        self.call = CallScript::Succeed {
            after,
            output: output.into(),
        };
        self
    }

    pub fn fail_after(mut self, after: Duration, error: impl Into<String>) -> Self {
        self.call = CallScript::Fail {
            after,
            error: error.into(),
        };
        self
    }

    pub fn hang(mut self) -> Self {
        self.call = CallScript::Hang;
        self
    }

    pub fn reject_dispatch(mut self, error: DispatchError) -> Self {
        self.dispatch_error = Some(error);
        self
    }

    pub fn reject_subscribe(mut self, error: SubscribeError) -> Self {
        self.subscribe_error = Some(error);
        self
    }

    pub fn ack_cancel(mut self, record: ProgressRecord) -> Self {
        self.cancel_ack = Some(record);
        self
    }

    pub fn close_push_when_done(mut self) -> Self {
        self.close_push_when_done = true;
        self
    }

    pub fn stall_dispatch(mut self) -> Self {
        self.stall_dispatch = true;
        self
    }

    pub fn stall_reads(mut self) -> Self {
        self.stall_reads = true;
        self
    }
}

/// Interaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub dispatches: usize,
    pub subscribes: usize,
    pub unsubscribes: usize,
    pub reads: usize,
    pub active_subscriptions: usize,
}

#[derive(Default)]
struct State {
    reads: VecDeque<ReadStep>,
    last_read: Option<ReadStep>,
    subscribers: HashMap<Uuid, mpsc::Sender<Notification>>,
    cancel_acked: bool,
    stats: SessionStats,
}

struct Inner {
    script: Script,
    state: Mutex<State>,
}

impl Inner {
    async fn broadcast(&self, notification: Notification) {
        let senders: Vec<_> = self.state.lock().await.subscribers.values().cloned().collect();
        for tx in senders {
            tx.send(notification.clone()).await.ok();
        }
    }

    async fn on_cancel(&self) {
        if let Some(ack) = self.script.cancel_ack.clone() {
            self.state.lock().await.cancel_acked = true;
            self.broadcast(Notification::Progress(ack)).await;
        }
    }

    async fn replay_push(self: Arc<Self>, id: Uuid) {
        for step in &self.script.push {
            tokio::time::sleep(step.delay).await;
            let tx = match self.state.lock().await.subscribers.get(&id) {
                Some(tx) => tx.clone(),
                None => return,
            };
            if tx.send(step.notification.clone()).await.is_err() {
                return;
            }
        }
        if self.script.close_push_when_done {
            self.state.lock().await.subscribers.remove(&id);
        }
    }

    async fn resolve_call(self: Arc<Self>, completer: TaskCompleter) {
        let (after, result) = match &self.script.call {
            CallScript::Succeed { after, output } => (*after, Ok(output.clone())),
            CallScript::Fail { after, error } => (*after, Err(error.clone())),
            CallScript::Hang => {
                completer.cancelled().await;
                self.on_cancel().await;
                return;
            }
        };
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(after) => false,
            _ = completer.cancelled() => true,
        };
        if cancelled {
            self.on_cancel().await;
            return;
        }
        match result {
            Ok(output) => completer.succeed(output),
            Err(error) => completer.fail(error),
        };
    }
}

/// Deterministic fake session
#[derive(Clone)]
pub struct ScriptedSession {
    inner: Arc<Inner>,
}

impl ScriptedSession {
    pub fn new(script: Script) -> Self {
        let state = State {
            reads: script.reads.iter().cloned().collect(),
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                script,
                state: Mutex::new(state),
            }),
        }
    }

    pub async fn stats(&self) -> SessionStats {
        let state = self.inner.state.lock().await;
        SessionStats {
            active_subscriptions: state.subscribers.len(),
            ..state.stats
        }
    }
}

#[async_trait]
impl SessionFacade for ScriptedSession {
    async fn dispatch_call(&self, name: &str, _args: JsonValue) -> Result<TaskHandle, DispatchError> {
        self.inner.state.lock().await.stats.dispatches += 1;
        if self.inner.script.stall_dispatch {
            std::future::pending::<()>().await;
        }
        if let Some(error) = &self.inner.script.dispatch_error {
            return Err(error.clone());
        }
        tracing::debug!(call = name, "Scripted dispatch");

        let (handle, completer) = TaskHandle::new();
        tokio::spawn(self.inner.clone().resolve_call(completer));
        Ok(handle)
    }

    async fn subscribe(&self, resource_id: &str) -> Result<Subscription, SubscribeError> {
        let mut state = self.inner.state.lock().await;
        state.stats.subscribes += 1;
        if let Some(error) = &self.inner.script.subscribe_error {
            return Err(error.clone());
        }

        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        let subscription = Subscription::new(resource_id, rx);
        state.subscribers.insert(subscription.id(), tx);
        drop(state);

        tokio::spawn(self.inner.clone().replay_push(subscription.id()));
        Ok(subscription)
    }

    async fn read(&self, resource_id: &str) -> Result<ProgressRecord, ReadError> {
        let mut state = self.inner.state.lock().await;
        state.stats.reads += 1;
        if self.inner.script.stall_reads {
            drop(state);
            std::future::pending::<()>().await;
            return Err(ReadError::Transport("stalled".to_string()));
        }

        if state.cancel_acked {
            if let Some(ack) = &self.inner.script.cancel_ack {
                return Ok(ack.clone());
            }
        }

        let step = match state.reads.pop_front() {
            Some(step) => {
                state.last_read = Some(step.clone());
                step
            }
            None => state
                .last_read
                .clone()
                .ok_or_else(|| ReadError::NotFound(resource_id.to_string()))?,
        };
        match step {
            ReadStep::Record(record) => Ok(record),
            ReadStep::Fail(error) => Err(error),
        }
    }

    async fn unsubscribe(&self, subscription: &Subscription) {
        let mut state = self.inner.state.lock().await;
        state.stats.unsubscribes += 1;
        state.subscribers.remove(&subscription.id());
    }
}
