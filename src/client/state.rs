//! Dashboard-side queue state machine.
//!
//! `QueueClient` is the explicit client context: it owns the cached view of
//! the queue, the processing status and the file catalog, plus the load and
//! process throttles. State is reconciled from three sources: responses to
//! our own calls, periodic status polls and push events.
//!
//! The view lock is never held across a network call.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

use super::api::{QueueApi, StagedUpload};
use super::error::ClientError;
use crate::config::ClientConfig;
use crate::model::{
    FileCatalog, FileKind, ItemRef, ProcessingStatus, QueueAction, QueueItem,
};
use crate::validation::{self, UploadedFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    Idle,
    Processing,
    Error,
    /// First load never reached the proxy; only a manual full reload leaves it.
    ConnectionFailed,
}

#[derive(Debug, Clone)]
pub struct QueueView {
    pub phase: Phase,
    pub queue: Vec<QueueItem>,
    pub status: Option<ProcessingStatus>,
    pub catalog: FileCatalog,
    pub stats: Option<Value>,
    pub last_error: Option<String>,
}

impl Default for QueueView {
    fn default() -> Self {
        Self {
            phase: Phase::Loading,
            queue: Vec::new(),
            status: None,
            catalog: FileCatalog::default(),
            stats: None,
            last_error: None,
        }
    }
}

impl QueueView {
    pub fn is_processing(&self) -> bool {
        self.status.as_ref().is_some_and(ProcessingStatus::is_processing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Error(String),
}

/// User-facing hooks: confirmation prompts and toasts.
pub trait Ui: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
    fn notify(&self, notice: Notice);
}

/// What a status observation caused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Unchanged,
    /// Queue length moved while idle: another session mutated the queue.
    QueueReloaded,
    /// `processing -> idle`: queue and catalog both reloaded.
    RunCompleted,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub load_throttle: Duration,
    pub process_throttle: Duration,
}

impl From<&ClientConfig> for ClientSettings {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            load_throttle: Duration::from_secs(cfg.load_throttle_secs),
            process_throttle: Duration::from_secs(cfg.process_throttle_secs),
        }
    }
}

struct Inner {
    view: QueueView,
    ever_connected: bool,
    last_load: Option<Instant>,
    last_process: Option<Instant>,
    /// Queue length as last observed, from a status or a queue response.
    known_len: Option<usize>,
}

impl Inner {
    fn set_queue(&mut self, queue: Vec<QueueItem>) {
        self.known_len = Some(queue.len());
        self.view.queue = queue;
    }
}

pub struct QueueClient {
    api: QueueApi,
    ui: Arc<dyn Ui>,
    settings: ClientSettings,
    inner: Mutex<Inner>,
    published: watch::Sender<QueueView>,
}

const BUSY_MESSAGE: &str = "The queue is being processed; changes are locked until it finishes.";

impl QueueClient {
    pub fn new(api: QueueApi, ui: Arc<dyn Ui>, settings: ClientSettings) -> Self {
        let (published, _) = watch::channel(QueueView::default());
        Self {
            api,
            ui,
            settings,
            inner: Mutex::new(Inner {
                view: QueueView::default(),
                ever_connected: false,
                last_load: None,
                last_process: None,
                known_len: None,
            }),
            published,
        }
    }

    pub async fn view(&self) -> QueueView {
        self.inner.lock().await.view.clone()
    }

    /// Every view change, for rendering.
    pub fn subscribe(&self) -> watch::Receiver<QueueView> {
        self.published.subscribe()
    }

    async fn update<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().await;
        let out = f(&mut inner);
        self.published.send_replace(inner.view.clone());
        out
    }

    /* =========================
     * Loading
     * ========================= */

    /// Fetch queue, status, catalog and stats together.
    ///
    /// Skipped (returns `Ok(false)`) when the last load is younger than the
    /// load throttle and `force` is false.
    pub async fn load_all(&self, force: bool) -> Result<bool, ClientError> {
        let throttle = self.settings.load_throttle;
        let go = self
            .update(|inner| {
                let recent = inner.last_load.is_some_and(|t| t.elapsed() < throttle);
                if recent && !force {
                    return false;
                }
                inner.last_load = Some(Instant::now());
                if inner.view.phase == Phase::ConnectionFailed {
                    inner.view.phase = Phase::Loading;
                }
                true
            })
            .await;
        if !go {
            debug!("[client] load_all throttled");
            return Ok(false);
        }

        let (queue, status, catalog, stats) = tokio::join!(
            self.api.get_queue(),
            self.api.get_status(),
            self.api.get_files(None),
            self.api.get_stats(),
        );

        let mut first_error: Option<ClientError> = None;
        let first_load_failed = self
            .update(|inner| {
                match queue {
                    Ok(q) => inner.set_queue(q.queue),
                    Err(e) => first_error = first_error.take().or(Some(e)),
                }
                let view = &mut inner.view;
                match status {
                    Ok(s) => view.status = Some(s),
                    Err(e) => first_error = first_error.take().or(Some(e)),
                }
                match catalog {
                    Ok(c) => view.catalog = c,
                    Err(e) => first_error = first_error.take().or(Some(e)),
                }
                match stats {
                    Ok(s) => view.stats = Some(s),
                    Err(e) => first_error = first_error.take().or(Some(e)),
                }

                match &first_error {
                    None => {
                        inner.ever_connected = true;
                        view.last_error = None;
                        view.phase = phase_for(view.status.as_ref());
                        false
                    }
                    Some(e) if !inner.ever_connected && e.is_transport() => {
                        view.phase = Phase::ConnectionFailed;
                        view.last_error = Some(e.to_string());
                        true
                    }
                    Some(e) => {
                        inner.ever_connected |= !e.is_transport();
                        if view.phase == Phase::Loading {
                            view.phase = Phase::Error;
                        }
                        view.last_error = Some(e.to_string());
                        false
                    }
                }
            })
            .await;

        match first_error {
            None => {
                info!("[client] loaded queue state");
                Ok(true)
            }
            Some(e) => {
                if first_load_failed {
                    warn!("[client] connection failed on first load: {}", e);
                } else {
                    self.ui.notify(Notice::Error(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Manual retry from the connection-failed view.
    pub async fn retry_connection(&self) -> Result<bool, ClientError> {
        self.load_all(true).await
    }

    pub async fn reload_queue(&self) -> Result<(), ClientError> {
        let snapshot = self.api.get_queue().await?;
        self.update(|inner| inner.set_queue(snapshot.queue)).await;
        Ok(())
    }

    pub async fn reload_files(&self) -> Result<(), ClientError> {
        let catalog = self.api.get_files(None).await?;
        self.update(|inner| inner.view.catalog = catalog).await;
        Ok(())
    }

    /// Keyword search over the file catalog; the displayed catalog is left
    /// untouched.
    pub async fn search_files(&self, keyword: &str) -> Result<FileCatalog, ClientError> {
        self.api.get_files(Some(keyword)).await
    }

    /* =========================
     * Status reconciliation
     * ========================= */

    pub async fn refresh_status(&self) -> Result<Reconciliation, ClientError> {
        let status = self.api.get_status().await?;
        self.apply_status(status).await
    }

    /// Fold a status observation (poll or push) into the view and reload
    /// whatever it implies is stale.
    pub async fn apply_status(&self, status: ProcessingStatus) -> Result<Reconciliation, ClientError> {
        let now_processing = status.is_processing();
        let observed_len = status.queue_length;
        // 在锁内记录本次观测的长度，并发的重复观测只会触发一次重载
        let (was_processing, previous_len) = self
            .update(|inner| {
                let was = inner.view.is_processing();
                let len = inner.known_len.unwrap_or(inner.view.queue.len());
                inner.known_len = Some(observed_len);
                inner.view.status = Some(status);
                if inner.view.phase != Phase::ConnectionFailed {
                    inner.view.phase = phase_for(inner.view.status.as_ref());
                }
                (was, len)
            })
            .await;

        if was_processing && !now_processing {
            info!("[client] processing run finished; reloading queue and files");
            let (queue, files) = tokio::join!(self.reload_queue(), self.reload_files());
            queue?;
            files?;
            return Ok(Reconciliation::RunCompleted);
        }

        if !now_processing && observed_len != previous_len {
            debug!("[client] queue length {} -> {}; reloading", previous_len, observed_len);
            self.reload_queue().await?;
            return Ok(Reconciliation::QueueReloaded);
        }

        Ok(Reconciliation::Unchanged)
    }

    /* =========================
     * Mutations
     * ========================= */

    async fn ensure_not_processing(&self) -> Result<(), ClientError> {
        if self.inner.lock().await.view.is_processing() {
            self.ui.notify(Notice::Error(BUSY_MESSAGE.into()));
            return Err(ClientError::Rejected(BUSY_MESSAGE.into()));
        }
        Ok(())
    }

    /// Toast the failure; a 409 from the proxy means our status is stale.
    async fn report(&self, err: ClientError) -> ClientError {
        self.ui.notify(Notice::Error(err.to_string()));
        if let ClientError::Upstream { status: 409, .. } = err {
            if let Err(e) = self.refresh_status().await {
                debug!("[client] status refresh after conflict failed: {}", e);
            }
        }
        err
    }

    async fn replace_queue(&self, queue: Vec<QueueItem>) {
        self.update(|inner| inner.set_queue(queue)).await;
    }

    pub async fn add_to_queue(&self, file_name: &str, action: QueueAction) -> Result<(), ClientError> {
        self.ensure_not_processing().await?;
        match self.api.add(file_name, action).await {
            Ok(snapshot) => {
                self.replace_queue(snapshot.queue).await;
                Ok(())
            }
            Err(e) => Err(self.report(e).await),
        }
    }

    pub async fn update_queue_item(&self, item: &ItemRef, action: QueueAction) -> Result<(), ClientError> {
        self.ensure_not_processing().await?;
        match self.api.update(item, action).await {
            Ok(snapshot) => {
                self.replace_queue(snapshot.queue).await;
                Ok(())
            }
            Err(e) => Err(self.report(e).await),
        }
    }

    pub async fn remove_queue_item(&self, item: &ItemRef) -> Result<(), ClientError> {
        self.ensure_not_processing().await?;
        match self.api.remove(item).await {
            Ok(snapshot) => {
                self.replace_queue(snapshot.queue).await;
                Ok(())
            }
            Err(e) => Err(self.report(e).await),
        }
    }

    /// Remove the item shown at `index`, addressed by id when it has one.
    pub async fn remove_at(&self, index: usize) -> Result<(), ClientError> {
        let item = {
            let inner = self.inner.lock().await;
            inner.view.queue.get(index).map(|item| ItemRef::for_item(item, index))
        };
        match item {
            Some(item) => self.remove_queue_item(&item).await,
            None => Err(ClientError::Rejected(format!("No queue item at position {index}"))),
        }
    }

    pub async fn process_queue(&self) -> Result<(), ClientError> {
        self.ensure_not_processing().await?;

        let (since_last, queued) = {
            let inner = self.inner.lock().await;
            (inner.last_process.map(|t| t.elapsed()), inner.view.queue.len())
        };
        if let Some(elapsed) = since_last {
            if elapsed < self.settings.process_throttle {
                let wait = (self.settings.process_throttle - elapsed).as_secs().max(1);
                let msg = format!("Queue was processed recently; try again in {wait}s");
                self.ui.notify(Notice::Error(msg.clone()));
                return Err(ClientError::Throttled(msg));
            }
        }

        if !self
            .ui
            .confirm(&format!("Process {queued} queued change(s) now?"))
        {
            return Err(ClientError::Declined);
        }

        if let Err(e) = self.api.process().await {
            return Err(self.report(e).await);
        }
        self.update(|inner| inner.last_process = Some(Instant::now())).await;
        self.ui.notify(Notice::Info("Queue processing started".into()));

        // 立即拉取状态，不等下一次轮询或推送
        self.refresh_status().await?;
        Ok(())
    }

    pub async fn clear_queue(&self) -> Result<(), ClientError> {
        self.ensure_not_processing().await?;
        if !self.ui.confirm("Remove every queued change?") {
            return Err(ClientError::Declined);
        }
        match self.api.clear().await {
            Ok(snapshot) => {
                self.replace_queue(snapshot.queue).await;
                Ok(())
            }
            Err(e) => Err(self.report(e).await),
        }
    }

    /// Run the gate locally, then upload. Invalid files never leave the
    /// client.
    pub async fn upload_file(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
        declared: Option<FileKind>,
        enqueue: bool,
    ) -> Result<FileKind, ClientError> {
        let file = UploadedFile {
            name: file_name.to_string(),
            content_type: Some(content_type.to_string()),
            size: bytes.len() as u64,
        };
        let gate = validation::check_basic(&file).and_then(|_| {
            let body: Value = serde_json::from_slice(&bytes).map_err(|e| {
                validation::ValidationError::new(format!("File is not valid JSON: {e}"))
            })?;
            validation::validate(&file, &body, declared)
        });
        let kind = match gate {
            Ok(kind) => kind,
            Err(e) => {
                self.ui.notify(Notice::Error(e.message.clone()));
                return Err(e.into());
            }
        };
        if enqueue {
            self.ensure_not_processing().await?;
        }

        let staged = StagedUpload {
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            bytes,
            kind,
            enqueue,
        };
        let resp = match self.api.upload(staged).await {
            Ok(resp) => resp,
            Err(e) => return Err(self.report(e).await),
        };
        if let Some(queue) = resp.get("queue").cloned() {
            if let Ok(queue) = serde_json::from_value::<Vec<QueueItem>>(queue) {
                self.replace_queue(queue).await;
            }
        }
        // 文件已存储，但入队被拒绝（通常是处理已开始）
        if let Some(reason) = resp.get("enqueueError").and_then(Value::as_str) {
            self.ui.notify(Notice::Error(format!("File stored but not queued: {reason}")));
            if let Err(e) = self.refresh_status().await {
                debug!("[client] status refresh after rejected enqueue failed: {}", e);
            }
        }
        self.reload_files().await?;
        Ok(kind)
    }
}

fn phase_for(status: Option<&ProcessingStatus>) -> Phase {
    match status {
        Some(s) if s.is_processing() => Phase::Processing,
        _ => Phase::Idle,
    }
}
