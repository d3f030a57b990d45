// mod.rs
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{get, patch, post},
};
use log::info;
use serde_json::Value;
use tokio::net::TcpListener;

use crate::model::{
    AddQueueItem, FileCatalog, FileKind, ProcessingStatus, QueueSnapshot, UpdateQueueItem,
    WebhookRegistration,
};
use crate::proxy::{QueueProxy, UploadRequest};
use crate::validation::MAX_FILE_SIZE;

mod adapter;
pub mod models;

pub use adapter::{SERVICE_HEADER, Session, TENANT_HEADER};
use adapter::{json_error, map_proxy_error};

type ApiResult<T> = Result<Json<T>, Response>;

// ======================
// Handler
// ======================
async fn health(State(proxy): State<Arc<QueueProxy>>) -> Json<models::HealthResponse> {
    Json(models::HealthResponse {
        status: "ok",
        cached_entries: proxy.cache().len().await,
    })
}

async fn get_queue(State(proxy): State<Arc<QueueProxy>>, Session(scope): Session) -> ApiResult<QueueSnapshot> {
    proxy.get_queue(&scope).await.map(Json).map_err(map_proxy_error)
}

async fn get_status(
    State(proxy): State<Arc<QueueProxy>>,
    Session(scope): Session,
) -> ApiResult<ProcessingStatus> {
    proxy.get_status(&scope).await.map(Json).map_err(map_proxy_error)
}

async fn add_item(
    State(proxy): State<Arc<QueueProxy>>,
    Session(scope): Session,
    Json(req): Json<AddQueueItem>,
) -> ApiResult<QueueSnapshot> {
    proxy.add(&scope, req).await.map(Json).map_err(map_proxy_error)
}

async fn update_item(
    State(proxy): State<Arc<QueueProxy>>,
    Session(scope): Session,
    Path(item): Path<String>,
    Json(req): Json<UpdateQueueItem>,
) -> ApiResult<QueueSnapshot> {
    proxy.update(&scope, &item, req).await.map(Json).map_err(map_proxy_error)
}

async fn remove_item(
    State(proxy): State<Arc<QueueProxy>>,
    Session(scope): Session,
    Path(item): Path<String>,
) -> ApiResult<QueueSnapshot> {
    proxy.remove(&scope, &item).await.map(Json).map_err(map_proxy_error)
}

async fn process_queue(State(proxy): State<Arc<QueueProxy>>, Session(scope): Session) -> ApiResult<Value> {
    proxy.process(&scope).await.map(Json).map_err(map_proxy_error)
}

async fn clear_queue(State(proxy): State<Arc<QueueProxy>>, Session(scope): Session) -> ApiResult<QueueSnapshot> {
    proxy.clear(&scope).await.map(Json).map_err(map_proxy_error)
}

async fn register_webhook(
    State(proxy): State<Arc<QueueProxy>>,
    Session(scope): Session,
    Json(req): Json<WebhookRegistration>,
) -> ApiResult<Value> {
    proxy.register_webhook(&scope, req).await.map(Json).map_err(map_proxy_error)
}

async fn unregister_webhook(State(proxy): State<Arc<QueueProxy>>, Session(scope): Session) -> ApiResult<Value> {
    proxy.unregister_webhook(&scope).await.map(Json).map_err(map_proxy_error)
}

async fn list_files(
    State(proxy): State<Arc<QueueProxy>>,
    Session(scope): Session,
    Query(q): Query<models::FilesQuery>,
) -> ApiResult<FileCatalog> {
    proxy
        .list_files(&scope, q.keyword.as_deref())
        .await
        .map(Json)
        .map_err(map_proxy_error)
}

async fn stats(State(proxy): State<Arc<QueueProxy>>, Session(scope): Session) -> ApiResult<Value> {
    proxy.stats(&scope).await.map(Json).map_err(map_proxy_error)
}

async fn upload(
    State(proxy): State<Arc<QueueProxy>>,
    Session(scope): Session,
    mut multipart: Multipart,
) -> ApiResult<models::UploadResponse> {
    let bad_form = |msg: String| json_error(StatusCode::BAD_REQUEST, "invalid_form", msg);

    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut declared: Option<FileKind> = None;
    let mut enqueue = false;

    while let Some(field) = multipart.next_field().await.map_err(|e| bad_form(e.to_string()))? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(|e| bad_form(e.to_string()))?;
                file = Some((name, content_type, bytes.to_vec()));
            }
            "fileType" => {
                let raw = field.text().await.map_err(|e| bad_form(e.to_string()))?;
                declared = Some(FileKind::parse(&raw).ok_or_else(|| {
                    bad_form(format!("fileType must be pra, spawngear or spawner (got {raw:?})"))
                })?);
            }
            "enqueue" => {
                let raw = field.text().await.map_err(|e| bad_form(e.to_string()))?;
                enqueue = matches!(raw.trim(), "true" | "1");
            }
            _ => {}
        }
    }

    let (file_name, content_type, bytes) = file.ok_or_else(|| bad_form("missing file field".into()))?;
    let outcome = proxy
        .upload(
            &scope,
            UploadRequest {
                file_name,
                content_type,
                bytes,
                declared,
                enqueue,
            },
        )
        .await
        .map_err(map_proxy_error)?;
    Ok(Json(outcome.into()))
}

// ======================
// Router
// ======================
pub fn build_router(proxy: Arc<QueueProxy>) -> Router {
    // multipart 额外开销预留 1 MiB，超限文件交给校验层给出明确提示
    let upload_limit = (MAX_FILE_SIZE + 1024 * 1024) as usize;

    let api = Router::new()
        .route("/queue", get(get_queue).post(add_item))
        .route("/queue/status", get(get_status))
        .route("/queue/process", post(process_queue))
        .route("/queue/clear", post(clear_queue))
        .route("/queue/webhook", post(register_webhook).delete(unregister_webhook))
        .route("/queue/{item}", patch(update_item).delete(remove_item))
        .route("/files", get(list_files))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/stats", get(stats));

    Router::new()
        .route("/health", get(health))
        .nest("/api/queue-manager", api)
        .with_state(proxy)
}

// ======================
// HTTP Server 启动
// ======================
pub async fn serve_http(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Queue proxy listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(crate::signal::shutdown_signal())
        .await?;
    Ok(())
}
