// models.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{FileKind, QueueItem};
use crate::proxy::UploadOutcome;

// ======================
// Error DTO
// ======================
#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

// ======================
// Health DTO
// ======================
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cached_entries: usize,
}

// ======================
// Files query
// ======================
#[derive(Deserialize)]
pub struct FilesQuery {
    pub keyword: Option<String>,
}

// ======================
// Upload DTO
// ======================
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub file_type: FileKind,
    pub file_name: String,
    pub upstream: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<Vec<QueueItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueue_error: Option<String>,
}

impl From<UploadOutcome> for UploadResponse {
    fn from(outcome: UploadOutcome) -> Self {
        UploadResponse {
            success: true,
            file_type: outcome.kind,
            file_name: outcome.stored_name,
            upstream: outcome.upstream,
            queue: outcome.queue.map(|q| q.queue),
            enqueue_error: outcome.enqueue_error,
        }
    }
}
