//! Best-effort notification dispatch.
//!
//! Events are queued on an unbounded channel and delivered by a background
//! task, so a slow or failing sink never holds up a worker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Startup,
    Shutdown,
    Completed,
    Failed,
    Skipped,
}

/// A terminal outcome or lifecycle change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub path: Option<PathBuf>,
    pub status: String,
    pub detail: String,
}

impl Event {
    pub fn lifecycle(kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            path: None,
            status: format!("{:?}", kind).to_lowercase(),
            detail: detail.into(),
        }
    }

    pub fn for_file(
        kind: EventKind,
        path: impl Into<PathBuf>,
        status: impl ToString,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            path: Some(path.into()),
            status: status.to_string(),
            detail: detail.into(),
        }
    }
}

/// Delivery transport for events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Sink that writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            kind = ?event.kind,
            path = ?event.path,
            status = %event.status,
            detail = %event.detail,
            "Notification"
        );
        Ok(())
    }
}

/// Cloneable handle; `notify` never blocks and never fails.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<Event>,
}

impl NotificationDispatcher {
    /// Start the delivery task. It ends once every handle is dropped and the
    /// queue is drained.
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.send(&event).await {
                    warn!(kind = ?event.kind, path = ?event.path, "Notification failed: {}", e);
                }
            }
        });
        (Self { tx }, handle)
    }

    pub fn notify(&self, event: Event) {
        if self.tx.send(event).is_err() {
            warn!("Notification dropped: dispatcher stopped");
        }
    }
}
