//! Black-box tests: a fake queue processor and the real proxy router, each
//! on an ephemeral port, driven over HTTP.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Multipart, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use reqwest::multipart;
use serde_json::{Value, json};

use queuerelay::{
    cache::QueueCache,
    client::{
        ClientError, ClientSettings, Notice, Phase, QueueApi, QueueClient, ReqwestBackend, RetryPolicy,
        RetryTransport, Ui,
    },
    config::{Config, ConfigCenter},
    http::{SERVICE_HEADER, TENANT_HEADER, build_router},
    model::{QueueAction, Scope},
    proxy::QueueProxy,
    upstream::{API_KEY_HEADER, UpstreamClient},
};

const API_KEY: &str = "test-key";

// ======================
// Fake queue processor
// ======================

#[derive(Default)]
struct Processor {
    queue: Vec<Value>,
    processing: bool,
    next_id: u32,
    queue_reads: usize,
    status_reads: usize,
    uploads: Vec<(String, String)>,
    webhook: Option<String>,
    last_keyword: Option<String>,
    /// Start processing as soon as an upload lands.
    busy_after_upload: bool,
    /// Answer everything with 503.
    down: bool,
}

type Shared = Arc<Mutex<Processor>>;

fn authorized(headers: &HeaderMap) -> Result<(), Response> {
    match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(API_KEY) => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad key" }))).into_response()),
    }
}

fn queue_body(p: &Processor) -> Json<Value> {
    Json(json!({ "queue": p.queue }))
}

async fn read_queue(State(s): State<Shared>, headers: HeaderMap) -> Result<Json<Value>, Response> {
    authorized(&headers)?;
    let mut p = s.lock().unwrap();
    p.queue_reads += 1;
    Ok(queue_body(&p))
}

async fn read_status(State(s): State<Shared>, headers: HeaderMap) -> Result<Json<Value>, Response> {
    authorized(&headers)?;
    let mut p = s.lock().unwrap();
    p.status_reads += 1;
    let status = if p.processing { "processing" } else { "idle" };
    Ok(Json(json!({ "status": status, "queueLength": p.queue.len() })))
}

async fn add(State(s): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Result<Json<Value>, Response> {
    authorized(&headers)?;
    let mut p = s.lock().unwrap();
    p.next_id += 1;
    let id = format!("q{}", p.next_id);
    p.queue.push(json!({ "id": id, "fileName": body["fileName"], "action": body["action"] }));
    Ok(queue_body(&p))
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "message": "queue item not found" }))).into_response()
}

fn position(p: &Processor, item: &str) -> Option<usize> {
    p.queue
        .iter()
        .position(|q| q["id"] == item)
        .or_else(|| item.parse().ok().filter(|i| *i < p.queue.len()))
}

async fn update(
    State(s): State<Shared>,
    Path((_, item)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, Response> {
    let mut p = s.lock().unwrap();
    let i = position(&p, &item).ok_or_else(not_found)?;
    p.queue[i]["action"] = body["action"].clone();
    Ok(queue_body(&p))
}

async fn remove(State(s): State<Shared>, Path((_, item)): Path<(String, String)>) -> Result<Json<Value>, Response> {
    let mut p = s.lock().unwrap();
    let i = position(&p, &item).ok_or_else(not_found)?;
    p.queue.remove(i);
    Ok(queue_body(&p))
}

async fn process(State(s): State<Shared>) -> Json<Value> {
    s.lock().unwrap().processing = true;
    Json(json!({ "message": "processing started" }))
}

async fn clear(State(s): State<Shared>) -> Json<Value> {
    let mut p = s.lock().unwrap();
    p.queue.clear();
    queue_body(&p)
}

async fn set_webhook(State(s): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    s.lock().unwrap().webhook = body["url"].as_str().map(str::to_string);
    Json(json!({ "registered": true }))
}

async fn drop_webhook(State(s): State<Shared>) -> Json<Value> {
    s.lock().unwrap().webhook = None;
    Json(json!({ "registered": false }))
}

async fn files(State(s): State<Shared>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    s.lock().unwrap().last_keyword = q.get("keyword").cloned();
    Json(json!({
        "pra": { "remoteNotInConfig": ["North.json"], "cfgFiles": [] },
        "spawner": { "remoteNotInConfig": [], "cfgFiles": ["Flag_White.json"] }
    }))
}

async fn stats() -> Json<Value> {
    Json(json!({ "restarts": 3 }))
}

async fn upload(State(s): State<Shared>, mut form: Multipart) -> Json<Value> {
    let mut name = String::new();
    let mut kind = String::new();
    while let Some(field) = form.next_field().await.unwrap() {
        match field.name().unwrap_or_default() {
            "file" => {
                name = field.file_name().unwrap_or_default().to_string();
                let _ = field.bytes().await.unwrap();
            }
            "fileType" => kind = field.text().await.unwrap(),
            _ => {}
        }
    }
    let mut p = s.lock().unwrap();
    p.uploads.push((name, kind));
    if p.busy_after_upload {
        p.processing = true;
    }
    Json(json!({ "success": true }))
}

async fn outage(State(s): State<Shared>, req: Request, next: Next) -> Response {
    let down = s.lock().unwrap().down;
    if down {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "message": "maintenance" }))).into_response();
    }
    next.run(req).await
}

fn processor_router(state: Shared) -> Router {
    Router::new()
        .route("/services/{service}/queue", get(read_queue).post(add))
        .route("/services/{service}/queue/status", get(read_status))
        .route("/services/{service}/queue/process", post(process))
        .route("/services/{service}/queue/clear", post(clear))
        .route("/services/{service}/queue/webhook", post(set_webhook).delete(drop_webhook))
        .route("/services/{service}/queue/{item}", patch(update).delete(remove))
        .route("/services/{service}/files", get(files))
        .route("/services/{service}/upload", post(upload))
        .route("/services/{service}/stats", get(stats))
        .layer(middleware::from_fn_with_state(state.clone(), outage))
        .with_state(state)
}

// ======================
// Harness
// ======================

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(app: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Harness {
    processor: Shared,
    _upstream: TestServer,
    proxy: TestServer,
    http: reqwest::Client,
    scope: Scope,
}

impl Harness {
    async fn start() -> Self {
        let processor: Shared = Arc::default();
        let upstream = TestServer::spawn(processor_router(processor.clone())).await;

        let cc = ConfigCenter::from_config(Config {
            upstream_url: upstream.base_url.clone(),
            api_key: Some(API_KEY.into()),
            ..Config::default()
        });
        let client = UpstreamClient::new(cc.clone(), &cc.snapshot().await).unwrap();
        let proxy = Arc::new(QueueProxy::new(client, Arc::new(QueueCache::new()), cc));
        let proxy = TestServer::spawn(build_router(proxy)).await;

        Self {
            processor,
            _upstream: upstream,
            proxy,
            http: reqwest::Client::new(),
            scope: Scope::new("tenant-a", "svc-1"),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/queue-manager/{}", self.proxy.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.api_url(path))
            .header(TENANT_HEADER, &self.scope.tenant)
            .header(SERVICE_HEADER, &self.scope.service)
    }

    fn session(&self) -> QueueClient {
        let backend = ReqwestBackend::new(self.api_url(""), self.scope.clone()).unwrap();
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        };
        let transport = Arc::new(RetryTransport::new(Arc::new(backend), policy));
        QueueClient::new(
            QueueApi::new(transport),
            Arc::new(AutoConfirm),
            ClientSettings {
                load_throttle: Duration::from_secs(60),
                process_throttle: Duration::from_secs(300),
            },
        )
    }
}

struct AutoConfirm;

impl Ui for AutoConfirm {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }

    fn notify(&self, _notice: Notice) {}
}

fn pra_file() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "areaName": "North",
        "PRABoxes": [[[10, 20, 30], [0, 45, 0], [100, 200, 300]]],
        "safePositions3D": [[1, 2, 3]]
    }))
    .unwrap()
}

// ======================
// Tests
// ======================

#[tokio::test]
async fn reads_are_cached_and_writes_invalidate() {
    let h = Harness::start().await;

    for _ in 0..3 {
        let res = h.request(reqwest::Method::GET, "queue").send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    assert_eq!(h.processor.lock().unwrap().queue_reads, 1);

    let res = h
        .request(reqwest::Method::POST, "queue")
        .json(&json!({ "fileName": "Flag_White", "action": "remove" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = h.request(reqwest::Method::GET, "queue").send().await.unwrap().json().await.unwrap();
    assert_eq!(body["queue"][0]["fileName"], "Flag_White");
    assert_eq!(h.processor.lock().unwrap().queue_reads, 2);
}

#[tokio::test]
async fn two_sessions_converge_on_the_same_queue() {
    let h = Harness::start().await;
    let a = h.session();
    let b = h.session();

    b.load_all(true).await.unwrap();
    assert!(b.view().await.queue.is_empty());

    let (ra, rb) = tokio::join!(
        a.add_to_queue("Flag_White", QueueAction::Remove),
        b.add_to_queue("Flag_White", QueueAction::Remove),
    );
    ra.unwrap();
    rb.unwrap();

    // whichever session answered first still holds a length-1 queue until it polls
    a.refresh_status().await.unwrap();
    b.refresh_status().await.unwrap();
    for session in [&a, &b] {
        let view = session.view().await;
        assert_eq!(view.queue.len(), 2);
        assert!(view.queue.iter().all(|q| q.file_name == "Flag_White" && q.action == QueueAction::Remove));
    }
}

#[tokio::test]
async fn item_update_and_removal_by_id() {
    let h = Harness::start().await;
    let s = h.session();
    s.add_to_queue("Flag_White", QueueAction::Remove).await.unwrap();
    s.add_to_queue("Flag_Red", QueueAction::Add).await.unwrap();

    let first = queuerelay::model::ItemRef::for_item(&s.view().await.queue[0], 0);
    s.update_queue_item(&first, QueueAction::RemoveSpawner).await.unwrap();
    assert_eq!(s.view().await.queue[0].action, QueueAction::RemoveSpawner);

    s.remove_at(0).await.unwrap();
    let view = s.view().await;
    assert_eq!(view.queue.len(), 1);
    assert_eq!(view.queue[0].file_name, "Flag_Red");
}

#[tokio::test]
async fn mutations_conflict_while_processing() {
    let h = Harness::start().await;
    h.processor.lock().unwrap().processing = true;

    let res = h
        .request(reqwest::Method::POST, "queue")
        .json(&json!({ "fileName": "Flag_White", "action": "remove" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "processing");
    assert!(h.processor.lock().unwrap().queue.is_empty());

    // the dashboard refuses locally once it knows
    let s = h.session();
    s.load_all(true).await.unwrap();
    assert_eq!(s.view().await.phase, Phase::Processing);
    let reads = h.processor.lock().unwrap().status_reads;
    let err = s.clear_queue().await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected(_)));
    assert_eq!(h.processor.lock().unwrap().status_reads, reads);
}

#[tokio::test]
async fn clearing_twice_leaves_an_empty_queue() {
    let h = Harness::start().await;
    let s = h.session();
    s.add_to_queue("Flag_White", QueueAction::Remove).await.unwrap();

    s.clear_queue().await.unwrap();
    s.clear_queue().await.unwrap();
    assert!(s.view().await.queue.is_empty());

    let body: Value = h.request(reqwest::Method::GET, "queue").send().await.unwrap().json().await.unwrap();
    assert_eq!(body["queue"], json!([]));
}

#[tokio::test]
async fn invalid_uploads_are_rejected_before_forwarding() {
    let h = Harness::start().await;

    let cases: Vec<(&str, &str, Vec<u8>)> = vec![
        ("../escape.json", "application/json", pra_file()),
        ("notes.txt", "text/plain", pra_file()),
        ("area.json", "image/png", pra_file()),
        ("area.json", "application/json", b"{ not json".to_vec()),
        ("area.json", "application/json", br#"{"areaName":"x","PRABoxes":[[[1,2],[0,0,0],[1,2,3]]],"safePositions3D":[]}"#.to_vec()),
        ("area.json", "application/json", vec![b' '; 5 * 1024 * 1024 + 1]),
    ];
    for (name, mime, bytes) in cases {
        let part = multipart::Part::bytes(bytes).file_name(name.to_string()).mime_str(mime).unwrap();
        let form = multipart::Form::new().part("file", part).text("fileType", "pra");
        let res = h.request(reqwest::Method::POST, "upload").multipart(form).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{name} / {mime}");
    }
    assert!(h.processor.lock().unwrap().uploads.is_empty());
}

#[tokio::test]
async fn valid_upload_is_forwarded_and_enqueued() {
    let h = Harness::start().await;
    let s = h.session();

    let kind = s
        .upload_file("North Area.json", "application/json", pra_file(), None, true)
        .await
        .unwrap();
    assert_eq!(kind, queuerelay::model::FileKind::Pra);

    let p = h.processor.lock().unwrap();
    assert_eq!(p.uploads, vec![("North_Area.json".to_string(), "pra".to_string())]);
    assert_eq!(p.queue[0]["action"], "add_pra");
    drop(p);

    let view = s.view().await;
    assert_eq!(view.queue.len(), 1);
    assert_eq!(view.catalog.pra.remote_not_in_config, vec!["North.json"]);
}

#[tokio::test]
async fn requests_without_session_scope_are_unauthorized() {
    let h = Harness::start().await;
    let res = h.http.get(h.api_url("queue")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = h.http.get(format!("{}/health", h.proxy.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn unreachable_proxy_shows_connection_failed() {
    let backend = ReqwestBackend::new("http://127.0.0.1:9/api/queue-manager", Scope::new("t", "s")).unwrap();
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter: Duration::ZERO,
    };
    let transport = Arc::new(RetryTransport::new(Arc::new(backend), policy));
    let s = QueueClient::new(
        QueueApi::new(transport.clone()),
        Arc::new(AutoConfirm),
        ClientSettings {
            load_throttle: Duration::from_secs(60),
            process_throttle: Duration::from_secs(300),
        },
    );

    assert!(s.load_all(true).await.is_err());
    assert_eq!(s.view().await.phase, Phase::ConnectionFailed);
    assert!(!transport.connection().connected);
}

#[tokio::test]
async fn upload_survives_a_rejected_enqueue() {
    let h = Harness::start().await;
    h.processor.lock().unwrap().busy_after_upload = true;
    let s = h.session();

    let kind = s
        .upload_file("North.json", "application/json", pra_file(), None, true)
        .await
        .unwrap();
    assert_eq!(kind, queuerelay::model::FileKind::Pra);

    let p = h.processor.lock().unwrap();
    assert_eq!(p.uploads.len(), 1);
    assert!(p.queue.is_empty());
    drop(p);

    let view = s.view().await;
    assert!(view.queue.is_empty());
    assert_eq!(view.phase, Phase::Processing);
    assert_eq!(view.catalog.pra.remote_not_in_config, vec!["North.json"]);
}

#[tokio::test]
async fn enqueue_error_is_reported_in_upload_response() {
    let h = Harness::start().await;
    h.processor.lock().unwrap().busy_after_upload = true;

    let part = multipart::Part::bytes(pra_file())
        .file_name("North.json")
        .mime_str("application/json")
        .unwrap();
    let form = multipart::Form::new()
        .part("file", part)
        .text("fileType", "pra")
        .text("enqueue", "true");
    let res = h.request(reqwest::Method::POST, "upload").multipart(form).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body.get("queue").is_none());
    assert!(body["enqueueError"].as_str().unwrap().contains("processed"));
}

#[tokio::test]
async fn webhook_registration_is_forwarded() {
    let h = Harness::start().await;

    let res = h
        .request(reqwest::Method::POST, "queue/webhook")
        .json(&json!({ "url": "https://hooks.example.com/queue", "secret": "s3" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        h.processor.lock().unwrap().webhook.as_deref(),
        Some("https://hooks.example.com/queue")
    );

    let res = h
        .request(reqwest::Method::POST, "queue/webhook")
        .json(&json!({ "url": "ftp://hooks.example.com/queue" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_argument");
    assert!(h.processor.lock().unwrap().webhook.is_some());

    let res = h.request(reqwest::Method::DELETE, "queue/webhook").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(h.processor.lock().unwrap().webhook.is_none());
}

#[tokio::test]
async fn upstream_status_and_message_pass_through() {
    let h = Harness::start().await;

    let res = h.request(reqwest::Method::DELETE, "queue/unknown").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "upstream_error");
    assert_eq!(body["message"], "queue item not found");

    let s = h.session();
    let missing = queuerelay::model::ItemRef::Id("unknown".into());
    match s.update_queue_item(&missing, QueueAction::Remove).await {
        Err(ClientError::Upstream { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "queue item not found");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn file_search_forwards_keyword() {
    let h = Harness::start().await;
    let s = h.session();

    let catalog = s.search_files("North").await.unwrap();
    assert_eq!(catalog.pra.remote_not_in_config, vec!["North.json"]);
    assert_eq!(h.processor.lock().unwrap().last_keyword.as_deref(), Some("North"));

    // blank keywords are dropped by the proxy
    s.search_files("  ").await.unwrap();
    assert_eq!(h.processor.lock().unwrap().last_keyword, None);
}

#[tokio::test]
async fn retry_recovers_once_processor_is_back() {
    let h = Harness::start().await;
    h.processor.lock().unwrap().down = true;
    let s = h.session();

    assert!(s.load_all(true).await.is_err());
    assert_eq!(s.view().await.phase, Phase::ConnectionFailed);

    h.processor.lock().unwrap().down = false;
    assert!(s.retry_connection().await.unwrap());
    let view = s.view().await;
    assert_eq!(view.phase, Phase::Idle);
    assert_eq!(view.last_error, None);
}
