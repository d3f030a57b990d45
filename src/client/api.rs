//! Typed queue calls over the retry transport.

use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::error::ClientError;
use super::transport::{ApiBody, ApiRequest, RetryTransport};
use crate::model::{FileCatalog, FileKind, ItemRef, ProcessingStatus, QueueAction, QueueSnapshot};

#[derive(Clone)]
pub struct QueueApi {
    transport: Arc<RetryTransport>,
}

/// File staged for upload after passing the local gate.
#[derive(Debug, Clone)]
pub struct StagedUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub kind: FileKind,
    pub enqueue: bool,
}

impl QueueApi {
    pub fn new(transport: Arc<RetryTransport>) -> Self {
        Self { transport }
    }

    async fn call<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ClientError> {
        let resp = self.transport.fetch(request).await?;
        if !resp.is_success() {
            return Err(ClientError::Upstream {
                status: resp.status,
                message: resp.error_message(),
            });
        }
        let body = if resp.body.is_null() { json!({}) } else { resp.body };
        serde_json::from_value(body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    pub async fn get_queue(&self) -> Result<QueueSnapshot, ClientError> {
        self.call(ApiRequest::get("queue")).await
    }

    pub async fn get_status(&self) -> Result<ProcessingStatus, ClientError> {
        self.call(ApiRequest::get("queue/status")).await
    }

    pub async fn get_files(&self, keyword: Option<&str>) -> Result<FileCatalog, ClientError> {
        let mut req = ApiRequest::get("files");
        if let Some(k) = keyword {
            req = req.query("keyword", k);
        }
        self.call(req).await
    }

    pub async fn get_stats(&self) -> Result<Value, ClientError> {
        self.call(ApiRequest::get("stats")).await
    }

    pub async fn add(&self, file_name: &str, action: QueueAction) -> Result<QueueSnapshot, ClientError> {
        let body = json!({ "fileName": file_name, "action": action });
        self.call(ApiRequest::post("queue").json(body)).await
    }

    pub async fn update(&self, item: &ItemRef, action: QueueAction) -> Result<QueueSnapshot, ClientError> {
        let req = ApiRequest::new(Method::PATCH, "queue")
            .segment(item.path_segment())
            .json(json!({ "action": action }));
        self.call(req).await
    }

    pub async fn remove(&self, item: &ItemRef) -> Result<QueueSnapshot, ClientError> {
        self.call(ApiRequest::new(Method::DELETE, "queue").segment(item.path_segment()))
            .await
    }

    pub async fn process(&self) -> Result<Value, ClientError> {
        self.call(ApiRequest::post("queue/process")).await
    }

    pub async fn clear(&self) -> Result<QueueSnapshot, ClientError> {
        self.call(ApiRequest::post("queue/clear")).await
    }

    pub async fn upload(&self, upload: StagedUpload) -> Result<Value, ClientError> {
        let mut req = ApiRequest::post("upload");
        req.body = Some(ApiBody::Upload {
            file_name: upload.file_name,
            content_type: upload.content_type,
            bytes: upload.bytes,
            file_type: upload.kind,
            enqueue: upload.enqueue,
        });
        self.call(req).await
    }
}
