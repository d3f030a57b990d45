//! Retry-aware transport used by every dashboard queue call.
//!
//! Server (5xx) and network failures are retried with capped linear backoff
//! plus jitter. Client errors (4xx) are returned straight away: they point
//! at a caller bug and retrying them changes nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use reqwest::{Method, Url, multipart};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::http::{SERVICE_HEADER, TENANT_HEADER};
use crate::model::{FileKind, Scope};

/// ===============================
/// Request / response
/// ===============================

#[derive(Debug, Clone)]
pub enum ApiBody {
    Json(Value),
    Upload {
        file_name: String,
        content_type: String,
        bytes: Vec<u8>,
        file_type: FileKind,
        enqueue: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Unencoded path segments relative to the proxy base.
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<ApiBody>,
}

impl ApiRequest {
    /// `path` is a fixed route such as `queue/status`; caller-supplied
    /// values go through [`ApiRequest::segment`].
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    /// Append one segment; it is percent-encoded when the URL is built.
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn path(&self) -> String {
        self.segments.join("/")
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(ApiBody::Json(body));
        self
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    /// `message`/`error` field of an error body.
    pub fn error_message(&self) -> String {
        for field in ["message", "error"] {
            if let Some(Value::String(s)) = self.body.get(field) {
                return s.clone();
            }
        }
        match &self.body {
            Value::String(s) if !s.is_empty() => s.clone(),
            _ => format!("request failed with status {}", self.status),
        }
    }
}

/// ===============================
/// Backend seam
/// ===============================

#[derive(Debug, Clone, Error)]
#[error("network error: {0}")]
pub struct BackendError(pub String);

/// One HTTP exchange, no retries. Injected so sessions and tests can swap it.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, BackendError>;
}

/// reqwest backend talking to the queue proxy on behalf of one session.
pub struct ReqwestBackend {
    http: reqwest::Client,
    base: Url,
    scope: Scope,
}

impl ReqwestBackend {
    pub fn new(base_url: impl Into<String>, scope: Scope) -> Result<Self, BackendError> {
        let base_url = base_url.into();
        let base = Url::parse(&base_url).map_err(|e| BackendError(format!("{base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError(e.to_string()))?;
        Ok(Self { http, base, scope })
    }

    fn url(&self, request: &ApiRequest) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(&request.segments);
        Ok(url)
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, BackendError> {
        let url = self.url(request)?;
        let mut req = self
            .http
            .request(request.method.clone(), url)
            .header(TENANT_HEADER, &self.scope.tenant)
            .header(SERVICE_HEADER, &self.scope.service);
        if !request.query.is_empty() {
            req = req.query(&request.query);
        }
        req = match &request.body {
            None => req,
            Some(ApiBody::Json(v)) => req.json(v),
            Some(ApiBody::Upload {
                file_name,
                content_type,
                bytes,
                file_type,
                enqueue,
            }) => {
                let part = multipart::Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(content_type)
                    .map_err(|e| BackendError(e.to_string()))?;
                let form = multipart::Form::new()
                    .part("file", part)
                    .text("fileType", file_type.as_str())
                    .text("enqueue", enqueue.to_string());
                req.multipart(form)
            }
        };

        let resp = req.send().await.map_err(|e| BackendError(e.to_string()))?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(|e| BackendError(e.to_string()))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok(ApiResponse { status, body })
    }
}

/// ===============================
/// Retry policy / connection state
/// ===============================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub connected: bool,
    pub retrying: bool,
    pub retry_count: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
            jitter: Duration::from_millis(cfg.retry_jitter_ms),
        }
    }

    /// `min(base * (attempt + 1), cap)`, jitter excluded.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt + 1).min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..jitter_ms)
        } else {
            0
        };
        self.backoff(attempt) + Duration::from_millis(extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed after {attempts} attempt(s): {message}")]
    Network { attempts: u32, message: String },
    #[error("server error {status} after {attempts} attempt(s): {message}")]
    Server {
        attempts: u32,
        status: u16,
        message: String,
    },
}

pub struct RetryTransport {
    backend: Arc<dyn HttpBackend>,
    policy: RetryPolicy,
    connection: watch::Sender<ConnectionState>,
}

impl RetryTransport {
    pub fn new(backend: Arc<dyn HttpBackend>, policy: RetryPolicy) -> Self {
        let (connection, _) = watch::channel(ConnectionState {
            max_retries: policy.max_attempts,
            ..ConnectionState::default()
        });
        Self {
            backend,
            policy,
            connection,
        }
    }

    pub fn connection(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Live connection state for a status indicator.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub async fn fetch(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.fetch_with_retry(request, self.policy.max_attempts).await
    }

    /// Issues at most `max_attempts` calls. Returns the first 2xx/4xx
    /// response, or the last failure once attempts run out.
    pub async fn fetch_with_retry(
        &self,
        request: ApiRequest,
        max_attempts: u32,
    ) -> Result<ApiResponse, TransportError> {
        let max_attempts = max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let error = match self.backend.send(&request).await {
                Ok(resp) if !resp.is_server_error() => {
                    self.connection.send_modify(|c| {
                        c.connected = true;
                        c.retrying = false;
                        c.retry_count = 0;
                    });
                    return Ok(resp);
                }
                Ok(resp) => TransportError::Server {
                    attempts: attempt + 1,
                    status: resp.status,
                    message: resp.error_message(),
                },
                Err(e) => TransportError::Network {
                    attempts: attempt + 1,
                    message: e.0,
                },
            };

            if attempt + 1 < max_attempts {
                let delay = self.policy.jittered(attempt);
                warn!(
                    "[transport] {} {} failed ({}), retry {}/{} in {:?}",
                    request.method,
                    request.path(),
                    error,
                    attempt + 1,
                    max_attempts - 1,
                    delay
                );
                self.connection.send_modify(|c| {
                    c.retrying = true;
                    c.retry_count = attempt + 1;
                    c.max_retries = max_attempts;
                });
                tokio::time::sleep(delay).await;
            }
            last_error = Some(error);
        }

        self.connection.send_modify(|c| {
            c.connected = false;
            c.retrying = false;
        });
        debug!("[transport] {} {} gave up", request.method, request.path());
        Err(last_error.unwrap_or(TransportError::Network {
            attempts: max_attempts,
            message: "no attempt made".into(),
        }))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backend shared by the client tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    pub type Handler = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse, BackendError> + Send + Sync>;

    /// Answers from a queue of scripted results first, then from `fallback`.
    pub struct ScriptedBackend {
        script: Mutex<VecDeque<Result<ApiResponse, BackendError>>>,
        fallback: Handler,
        pub calls: Mutex<Vec<(Method, String)>>,
    }

    impl ScriptedBackend {
        pub fn new(fallback: Handler) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn push(&self, result: Result<ApiResponse, BackendError>) {
            self.script.lock().unwrap().push_back(result);
        }

        pub fn count(&self, method: &Method, path: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, p)| m == method && p == path)
                .count()
        }

        pub fn total(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpBackend for ScriptedBackend {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, BackendError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.method.clone(), request.path()));
            let scripted = self.script.lock().unwrap().pop_front();
            match scripted {
                Some(result) => result,
                None => (self.fallback)(request),
            }
        }
    }

    pub fn ok(body: Value) -> Result<ApiResponse, BackendError> {
        Ok(ApiResponse { status: 200, body })
    }

    pub fn status(code: u16) -> Result<ApiResponse, BackendError> {
        Ok(ApiResponse {
            status: code,
            body: serde_json::json!({ "message": format!("status {code}") }),
        })
    }

    pub fn down() -> Result<ApiResponse, BackendError> {
        Err(BackendError("connection refused".into()))
    }
}
