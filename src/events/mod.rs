//! Real-time event channel: one subscription per active dashboard, keyed by
//! the `"{tenant}:{service}"` room. Push events are hints; the state machine
//! still fetches the authoritative data.

mod sse;
pub use sse::{SseEventSource, SseFrame, SseParser};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::client::QueueClient;
use crate::model::ProcessingStatus;

pub const QUEUE_UPDATED: &str = "queue-updated";
pub const PROCESSING_STARTED: &str = "processing-started";
pub const QUEUE_CLEARED: &str = "queue-cleared";
pub const PROCESSING_STATUS: &str = "processing-status";

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    QueueUpdated,
    ProcessingStarted,
    QueueCleared,
    /// Payload is trusted as the new status.
    ProcessingStatus(ProcessingStatus),
    /// Anything else, including a status frame with an unreadable payload.
    Other(String),
}

impl QueueEvent {
    pub fn from_frame(frame: SseFrame) -> Self {
        match frame.event.as_str() {
            QUEUE_UPDATED => QueueEvent::QueueUpdated,
            PROCESSING_STARTED => QueueEvent::ProcessingStarted,
            QUEUE_CLEARED => QueueEvent::QueueCleared,
            PROCESSING_STATUS => match serde_json::from_str(&frame.data) {
                Ok(status) => QueueEvent::ProcessingStatus(status),
                Err(e) => {
                    debug!("[events] unreadable status payload: {}", e);
                    QueueEvent::Other(frame.event)
                }
            },
            _ => QueueEvent::Other(frame.event),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EventError {
    #[error("event stream connect failed: {0}")]
    Connect(String),
    #[error("event stream rejected with status {0}")]
    Status(u16),
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, room: &str) -> Result<BoxStream<'static, QueueEvent>, EventError>;
}

/// Fold one push event into the client state.
pub async fn dispatch(client: &QueueClient, event: QueueEvent) {
    debug!("[events] {:?}", event);
    let result = match event {
        QueueEvent::QueueUpdated | QueueEvent::QueueCleared => client.reload_queue().await,
        QueueEvent::ProcessingStatus(status) => client.apply_status(status).await.map(|_| ()),
        QueueEvent::ProcessingStarted | QueueEvent::Other(_) => {
            client.refresh_status().await.map(|_| ())
        }
    };
    if let Err(e) = result {
        warn!("[events] refetch after event failed: {}", e);
    }
}

pub struct EventChannel {
    client: Arc<QueueClient>,
    source: Arc<dyn EventSource>,
    room: String,
    reconnect_delay: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventChannel {
    pub fn new(client: Arc<QueueClient>, source: Arc<dyn EventSource>, room: impl Into<String>) -> Self {
        Self {
            client,
            source,
            room: room.into(),
            reconnect_delay: Duration::from_secs(15),
            task: Mutex::new(None),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub async fn is_active(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Start listening. No-op when already subscribed.
    pub async fn activate(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        info!("[events] joining room {}", self.room);
        *task = Some(tokio::spawn(listen(
            self.client.clone(),
            self.source.clone(),
            self.room.clone(),
            self.reconnect_delay,
        )));
    }

    /// Hidden dashboards drop the subscription; on resume everything that
    /// may have been missed is refetched.
    pub async fn set_visible(&self, visible: bool) {
        if !visible {
            if let Some(handle) = self.task.lock().await.take() {
                info!("[events] suspending room {}", self.room);
                handle.abort();
            }
            return;
        }
        if self.is_active().await {
            return;
        }
        self.activate().await;
        let (status, queue) = tokio::join!(self.client.refresh_status(), self.client.reload_queue());
        if let Err(e) = status.map(|_| ()).and(queue) {
            warn!("[events] refetch on resume failed: {}", e);
        }
    }
}

async fn listen(client: Arc<QueueClient>, source: Arc<dyn EventSource>, room: String, delay: Duration) {
    loop {
        match source.subscribe(&room).await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    dispatch(&client, event).await;
                }
                warn!("[events] stream for {} closed", room);
            }
            Err(e) => {
                warn!("[events] cannot subscribe to {}: {}; polling continues", room, e);
            }
        }
        tokio::time::sleep(delay).await;
    }
}
