//! Queue proxy core: forwards dashboard requests to the queue processor and
//! keeps the read cache coherent with every mutation it forwards.
//!
//! Protocol agnostic. The axum layer in `crate::http` converts into and out
//! of these types.

mod error;
pub use error::ProxyError;

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::{
    cache::{CacheKey, Namespace, QueueCache},
    config::ConfigCenter,
    model::{
        AddQueueItem, FileCatalog, FileKind, ProcessingStatus, QueueAction, QueueItem,
        QueueSnapshot, Scope, UpdateQueueItem, WebhookRegistration,
    },
    upstream::{UploadPart, UpstreamClient, UpstreamError},
    validation::{self, UploadedFile},
};

/// Namespaces dropped after any forwarded queue mutation.
const MUTATION_INVALIDATES: &[Namespace] = &[Namespace::QueueData, Namespace::QueueStatus];

/// Upload as received from the dashboard.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub declared: Option<FileKind>,
    /// Enqueue the kind-specific add action once the upload is stored.
    pub enqueue: bool,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub kind: FileKind,
    pub stored_name: String,
    pub upstream: Value,
    pub queue: Option<QueueSnapshot>,
    /// Set when the file was stored but the processor refused to enqueue it.
    pub enqueue_error: Option<String>,
}

#[derive(Clone)]
pub struct QueueProxy {
    upstream: UpstreamClient,
    cache: Arc<QueueCache>,
    cc: ConfigCenter,
}

impl QueueProxy {
    pub fn new(upstream: UpstreamClient, cache: Arc<QueueCache>, cc: ConfigCenter) -> Self {
        Self { upstream, cache, cc }
    }

    pub fn cache(&self) -> &Arc<QueueCache> {
        &self.cache
    }

    /* =========================
     * Reads
     * ========================= */

    pub async fn get_queue(&self, scope: &Scope) -> Result<QueueSnapshot, ProxyError> {
        let ttl = self.cc.config().await.queue_cache_ttl_secs;
        let raw = self
            .cached(CacheKey::new(Namespace::QueueData, scope), ttl, || {
                self.upstream.call(Method::GET, scope, &["queue"], &[], None)
            })
            .await?;
        Ok(parse_queue(raw)?)
    }

    pub async fn get_status(&self, scope: &Scope) -> Result<ProcessingStatus, ProxyError> {
        let ttl = self.cc.config().await.status_cache_ttl_secs;
        let raw = self
            .cached(CacheKey::new(Namespace::QueueStatus, scope), ttl, || {
                self.upstream.call(Method::GET, scope, &["queue", "status"], &[], None)
            })
            .await?;
        Ok(decode(raw)?)
    }

    pub async fn list_files(
        &self,
        scope: &Scope,
        keyword: Option<&str>,
    ) -> Result<FileCatalog, ProxyError> {
        let query: Vec<(&str, String)> = keyword
            .filter(|k| !k.trim().is_empty())
            .map(|k| vec![("keyword", k.trim().to_string())])
            .unwrap_or_default();
        let raw = self
            .upstream
            .call(Method::GET, scope, &["files"], &query, None)
            .await?;
        Ok(decode(raw)?)
    }

    pub async fn stats(&self, scope: &Scope) -> Result<Value, ProxyError> {
        let ttl = self.cc.config().await.stats_cache_ttl_secs;
        Ok(self
            .cached(CacheKey::new(Namespace::Stats, scope), ttl, || {
                self.upstream.call(Method::GET, scope, &["stats"], &[], None)
            })
            .await?)
    }

    /* =========================
     * Mutations
     * ========================= */

    pub async fn add(&self, scope: &Scope, item: AddQueueItem) -> Result<QueueSnapshot, ProxyError> {
        if item.file_name.trim().is_empty() {
            return Err(ProxyError::InvalidArgument("fileName must not be empty".into()));
        }
        self.ensure_idle(scope).await?;
        info!("[proxy] {} add {} ({})", scope, item.file_name, item.action);
        let body = json!({ "fileName": item.file_name, "action": item.action });
        let raw = self
            .mutate(scope, Method::POST, &["queue"], Some(&body))
            .await?;
        Ok(parse_queue(raw)?)
    }

    pub async fn update(
        &self,
        scope: &Scope,
        item: &str,
        update: UpdateQueueItem,
    ) -> Result<QueueSnapshot, ProxyError> {
        self.ensure_idle(scope).await?;
        info!("[proxy] {} update {} -> {}", scope, item, update.action);
        let body = json!({ "action": update.action });
        let raw = self
            .mutate(scope, Method::PATCH, &["queue", item], Some(&body))
            .await?;
        Ok(parse_queue(raw)?)
    }

    pub async fn remove(&self, scope: &Scope, item: &str) -> Result<QueueSnapshot, ProxyError> {
        self.ensure_idle(scope).await?;
        info!("[proxy] {} remove {}", scope, item);
        let raw = self
            .mutate(scope, Method::DELETE, &["queue", item], None)
            .await?;
        Ok(parse_queue(raw)?)
    }

    pub async fn process(&self, scope: &Scope) -> Result<Value, ProxyError> {
        self.ensure_idle(scope).await?;
        info!("[proxy] {} process queue", scope);
        Ok(self
            .mutate(scope, Method::POST, &["queue", "process"], None)
            .await?)
    }

    pub async fn clear(&self, scope: &Scope) -> Result<QueueSnapshot, ProxyError> {
        self.ensure_idle(scope).await?;
        info!("[proxy] {} clear queue", scope);
        let raw = self
            .mutate(scope, Method::POST, &["queue", "clear"], None)
            .await?;
        Ok(parse_queue(raw)?)
    }

    pub async fn register_webhook(
        &self,
        scope: &Scope,
        hook: WebhookRegistration,
    ) -> Result<Value, ProxyError> {
        if !(hook.url.starts_with("http://") || hook.url.starts_with("https://")) {
            return Err(ProxyError::InvalidArgument("webhook url must be http(s)".into()));
        }
        let body = serde_json::to_value(&hook)
            .map_err(|e| ProxyError::InvalidArgument(e.to_string()))?;
        Ok(self
            .upstream
            .call(Method::POST, scope, &["queue", "webhook"], &[], Some(&body))
            .await?)
    }

    pub async fn unregister_webhook(&self, scope: &Scope) -> Result<Value, ProxyError> {
        Ok(self
            .upstream
            .call(Method::DELETE, scope, &["queue", "webhook"], &[], None)
            .await?)
    }

    /// Validate locally, forward the file, then optionally enqueue it.
    pub async fn upload(&self, scope: &Scope, req: UploadRequest) -> Result<UploadOutcome, ProxyError> {
        let file = UploadedFile {
            name: req.file_name.clone(),
            content_type: req.content_type.clone(),
            size: req.bytes.len() as u64,
        };
        validation::check_basic(&file)?;
        let body: Value = serde_json::from_slice(&req.bytes).map_err(|e| {
            validation::ValidationError::new(format!("File is not valid JSON: {e}"))
        })?;
        let kind = validation::validate(&file, &body, req.declared)?;

        let stored_name = validation::sanitize_filename(&req.file_name);
        info!("[proxy] {} upload {} as {}", scope, stored_name, kind);
        let upstream = self
            .upstream
            .upload(
                scope,
                UploadPart {
                    file_name: stored_name.clone(),
                    content_type: req
                        .content_type
                        .unwrap_or_else(|| "application/json".to_string()),
                    bytes: req.bytes,
                },
                kind,
            )
            .await?;

        // 文件已经落盘，入队失败不能让整个上传报错
        let (queue, enqueue_error) = if req.enqueue {
            let item = AddQueueItem {
                file_name: stored_name.clone(),
                action: QueueAction::add_for(kind),
            };
            match self.add(scope, item).await {
                Ok(queue) => (Some(queue), None),
                Err(e) => {
                    warn!("[proxy] {} stored {} but enqueue failed: {}", scope, stored_name, e);
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        Ok(UploadOutcome {
            kind,
            stored_name,
            upstream,
            queue,
            enqueue_error,
        })
    }

    /* =========================
     * Internals
     * ========================= */

    async fn cached<F, Fut>(&self, key: CacheKey, ttl_secs: u64, fetch: F) -> Result<Value, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, UpstreamError>>,
    {
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }
        let ticket = self.cache.ticket(&key.scope).await;
        let fresh = fetch().await?;
        self.cache
            .store(key, fresh.clone(), Duration::from_secs(ttl_secs), ticket)
            .await;
        Ok(fresh)
    }

    async fn mutate(
        &self,
        scope: &Scope,
        method: Method,
        segments: &[&str],
        body: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let result = self.upstream.call(method, scope, segments, &[], body).await?;
        self.cache.invalidate(scope, MUTATION_INVALIDATES).await;
        Ok(result)
    }

    /// Cooperative guard; the processor holds the real lock.
    async fn ensure_idle(&self, scope: &Scope) -> Result<(), ProxyError> {
        match self.get_status(scope).await {
            Ok(status) if status.is_processing() => {
                warn!("[proxy] {} mutation rejected: processing in progress", scope);
                Err(ProxyError::Busy)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("[proxy] {} status unavailable, forwarding anyway: {}", scope, e);
                Ok(())
            }
        }
    }
}

fn decode<T: DeserializeOwned>(raw: Value) -> Result<T, UpstreamError> {
    serde_json::from_value(raw).map_err(|e| UpstreamError::Decode(e.to_string()))
}

/// Accepts `{ "queue": [...] }`, a bare array, or an empty body.
fn parse_queue(raw: Value) -> Result<QueueSnapshot, UpstreamError> {
    match raw {
        Value::Null => Ok(QueueSnapshot::default()),
        Value::Array(_) => Ok(QueueSnapshot {
            queue: decode::<Vec<QueueItem>>(raw)?,
        }),
        other => decode(other),
    }
}
