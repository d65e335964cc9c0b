//! Loopback session
//!
//! Emulates the model download server in-process: a registry of models, a
//! `pull_model` call that walks a download through its stages, and
//! `litert://downloads/{model}` resources whose subscribers get a bare
//! "resource updated" hint on every change, just like the real server sends.

use super::{Notification, SessionFacade, Subscription};
use crate::config::LoopbackConfig;
use crate::mcp::resource::{self, DownloadProgress, DownloadStatus};
use crate::monitor::error::{DispatchError, ReadError, SubscribeError};
use crate::monitor::handle::{TaskCompleter, TaskHandle};
use crate::monitor::record::ProgressRecord;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

const HINT_BUFFER: usize = 16;
const VERIFYING_FROM: u8 = 90;

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<Notification>,
}

struct Inner {
    config: LoopbackConfig,
    fail_at: Option<u8>,
    ignore_cancel: bool,
    push_enabled: bool,
    tool_name: String,
    resource_prefix: String,
    connected: AtomicBool,
    sequence: AtomicU64,
    downloads: RwLock<HashMap<String, DownloadProgress>>,
    subscriptions: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl Inner {
    fn uri_for(&self, model: &str) -> String {
        format!("{}{}", self.resource_prefix, model)
    }

    fn model_for<'a>(&self, uri: &'a str) -> Option<&'a str> {
        uri.strip_prefix(self.resource_prefix.as_str())
            .filter(|model| !model.is_empty())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn set_progress(&self, model: &str, progress: u8, status: DownloadStatus) {
        let mut entry = DownloadProgress::new(model, progress, status);
        entry.sequence = Some(self.next_sequence());
        self.downloads.write().await.insert(model.to_string(), entry);
        self.notify_subscribers(&self.uri_for(model)).await;
    }

    async fn notify_subscribers(&self, uri: &str) {
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(subscribers) = subscriptions.get_mut(uri) else {
            return;
        };

        let before = subscribers.len();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            let hint = Notification::ResourceUpdated {
                uri: uri.to_string(),
            };
            if subscriber.tx.try_send(hint).is_err() {
                tracing::debug!(uri, id = %subscriber.id, "Dropped update hint for slow subscriber");
            }
        }

        let pruned = before - subscribers.len();
        if subscribers.is_empty() {
            subscriptions.remove(uri);
            tracing::debug!("Removed empty subscription for: {}", uri);
        } else if pruned > 0 {
            tracing::info!("Cleaned up {} closed subscriber(s) from resource: {}", pruned, uri);
        }
    }

    /// Wait one step; true if the caller cancelled and we honour it
    async fn step(&self, completer: &TaskCompleter) -> bool {
        if self.ignore_cancel {
            tokio::time::sleep(self.config.step()).await;
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.config.step()) => false,
            _ = completer.cancelled() => true,
        }
    }

    async fn run_download(self: Arc<Self>, model: String, completer: TaskCompleter) {
        self.set_progress(&model, 0, DownloadStatus::Pending).await;

        let step = self.config.step_percent.max(1);
        let mut percent: u8 = 0;
        loop {
            if self.step(&completer).await {
                tracing::info!(model = %model, percent, "Download cancelled by client");
                self.set_progress(&model, percent, DownloadStatus::Cancelled).await;
                return;
            }

            percent = percent.saturating_add(step).min(100);
            if let Some(fail_at) = self.fail_at {
                if percent >= fail_at {
                    let error = format!("simulated failure at {}%", percent);
                    self.set_progress(&model, 0, DownloadStatus::Failed(error.clone())).await;
                    completer.fail(format!("Failed to pull model: {}", error));
                    return;
                }
            }

            if percent >= 100 {
                break;
            }
            let status = if percent >= VERIFYING_FROM {
                DownloadStatus::Verifying
            } else {
                DownloadStatus::Downloading
            };
            self.set_progress(&model, percent, status).await;
        }

        self.set_progress(&model, 100, DownloadStatus::Complete).await;
        completer.succeed(format!(
            "Successfully pulled model: {}. Check {} for progress.",
            model,
            self.uri_for(&model)
        ));
    }

    fn ensure_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// In-process stand-in for the download server
#[derive(Clone)]
pub struct LoopbackSession {
    inner: Arc<Inner>,
}

/// Builder for [`LoopbackSession`]
pub struct LoopbackBuilder {
    config: LoopbackConfig,
    fail_at: Option<u8>,
    ignore_cancel: bool,
    push_enabled: bool,
    tool_name: String,
    resource_prefix: String,
    downloaded: Vec<String>,
}

impl LoopbackBuilder {
    /// Fail the download once it reaches `percent`
    pub fn fail_at(mut self, percent: Option<u8>) -> Self {
        self.fail_at = percent;
        self
    }

    /// Keep downloading even after the client cancels
    pub fn ignore_cancel(mut self, ignore: bool) -> Self {
        self.ignore_cancel = ignore;
        self
    }

    /// Refuse subscriptions, leaving polling as the only channel
    pub fn push_enabled(mut self, enabled: bool) -> Self {
        self.push_enabled = enabled;
        self
    }

    /// Name of the tool that starts a download
    pub fn tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = name.into();
        self
    }

    /// URI prefix of the download resources
    pub fn resource_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.resource_prefix = prefix.into();
        self
    }

    /// Mark a model as already present
    pub fn downloaded(mut self, model: impl Into<String>) -> Self {
        self.downloaded.push(model.into());
        self
    }

    pub fn build(self) -> LoopbackSession {
        let downloads = self
            .config
            .models
            .iter()
            .map(|model| {
                let entry = if self.downloaded.contains(model) {
                    DownloadProgress::new(model, 100, DownloadStatus::Complete)
                } else {
                    DownloadProgress::new(model, 0, DownloadStatus::Pending)
                };
                (model.clone(), entry)
            })
            .collect::<HashMap<_, _>>();
        tracing::info!("Model registry loaded with {} models", downloads.len());

        LoopbackSession {
            inner: Arc::new(Inner {
                config: self.config,
                fail_at: self.fail_at,
                ignore_cancel: self.ignore_cancel,
                push_enabled: self.push_enabled,
                tool_name: self.tool_name,
                resource_prefix: self.resource_prefix,
                connected: AtomicBool::new(true),
                sequence: AtomicU64::new(0),
                downloads: RwLock::new(downloads),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl LoopbackSession {
    pub fn builder(config: LoopbackConfig) -> LoopbackBuilder {
        LoopbackBuilder {
            config,
            fail_at: None,
            ignore_cancel: false,
            push_enabled: true,
            tool_name: "pull_model".to_string(),
            resource_prefix: resource::DOWNLOADS_PREFIX.to_string(),
            downloaded: Vec::new(),
        }
    }

    pub fn new(config: LoopbackConfig) -> Self {
        Self::builder(config).build()
    }

    /// Registry listing; without `show_all` only completed downloads
    pub async fn list_models(&self, show_all: bool) -> Vec<String> {
        let downloads = self.inner.downloads.read().await;
        let mut models: Vec<String> = downloads
            .values()
            .filter(|d| show_all || d.status == DownloadStatus::Complete)
            .map(|d| d.model.clone())
            .collect();
        models.sort();
        models
    }

    /// Drop the connection; every later call fails with `NotConnected`
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    pub async fn subscriber_count(&self, uri: &str) -> usize {
        self.inner
            .subscriptions
            .lock()
            .await
            .get(uri)
            .map_or(0, Vec::len)
    }

    pub fn step_interval(&self) -> Duration {
        self.inner.config.step()
    }
}

#[async_trait]
impl SessionFacade for LoopbackSession {
    async fn dispatch_call(&self, name: &str, args: JsonValue) -> Result<TaskHandle, DispatchError> {
        if !self.inner.ensure_connected() {
            return Err(DispatchError::NotConnected);
        }
        if name != self.inner.tool_name {
            return Err(DispatchError::Rejected(format!("unknown tool: {}", name)));
        }
        let model = args
            .get("model")
            .and_then(JsonValue::as_str)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| DispatchError::InvalidSpec("missing 'model' argument".to_string()))?
            .to_string();
        if !self.inner.downloads.read().await.contains_key(&model) {
            return Err(DispatchError::Rejected(format!(
                "model not found in registry: {}",
                model
            )));
        }

        let (handle, completer) = TaskHandle::new();
        tracing::info!(model = %model, call_id = %handle.call_id(), "Starting loopback download");
        tokio::spawn(self.inner.clone().run_download(model, completer));
        Ok(handle)
    }

    async fn subscribe(&self, resource_id: &str) -> Result<Subscription, SubscribeError> {
        if !self.inner.ensure_connected() {
            return Err(SubscribeError::NotConnected);
        }
        if !self.inner.push_enabled {
            return Err(SubscribeError::Unsupported);
        }
        let model = self
            .inner
            .model_for(resource_id)
            .ok_or_else(|| SubscribeError::UnknownResource(resource_id.to_string()))?;
        if !self.inner.downloads.read().await.contains_key(model) {
            return Err(SubscribeError::UnknownResource(resource_id.to_string()));
        }

        let (tx, rx) = mpsc::channel(HINT_BUFFER);
        let subscription = Subscription::new(resource_id, rx);
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let subscribers = subscriptions.entry(resource_id.to_string()).or_default();
        subscribers.push(Subscriber {
            id: subscription.id(),
            tx,
        });
        tracing::info!(
            "Client subscribed to resource: {} (total subscribers: {}, id: {})",
            resource_id,
            subscribers.len(),
            subscription.id()
        );
        Ok(subscription)
    }

    async fn read(&self, resource_id: &str) -> Result<ProgressRecord, ReadError> {
        if !self.inner.ensure_connected() {
            return Err(ReadError::NotConnected);
        }
        let model = self
            .inner
            .model_for(resource_id)
            .ok_or_else(|| ReadError::NotFound(resource_id.to_string()))?;
        let text = {
            let downloads = self.inner.downloads.read().await;
            let entry = downloads
                .get(model)
                .ok_or_else(|| ReadError::NotFound(resource_id.to_string()))?;
            resource::encode(entry).map_err(|e| ReadError::Transport(e.to_string()))?
        };
        resource::decode(&text, || self.inner.next_sequence())
    }

    async fn unsubscribe(&self, subscription: &Subscription) {
        let uri = subscription.resource_id();
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if let Some(subscribers) = subscriptions.get_mut(uri) {
            subscribers.retain(|s| s.id != subscription.id());
            if subscribers.is_empty() {
                subscriptions.remove(uri);
            }
            tracing::info!("Client unsubscribed from resource: {}", uri);
        }
    }
}
