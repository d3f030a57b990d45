//! HTTP client for the external queue processing service.

use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use reqwest::{Method, Url, multipart};
use serde_json::Value;
use thiserror::Error;

use crate::config::{Config, ConfigCenter};
use crate::http::TENANT_HEADER;
use crate::model::{FileKind, Scope};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("queue service unreachable: {0}")]
    Network(String),
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("invalid response from queue service: {0}")]
    Decode(String),
    #[error("bad upstream url: {0}")]
    Url(String),
}

/// File part of an upload forwarded upstream.
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    cc: ConfigCenter,
}

impl UpstreamClient {
    pub fn new(cc: ConfigCenter, cfg: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .user_agent(concat!("queuerelay/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy_url) = &cfg.proxy {
            if !proxy_url.is_empty() {
                info!("[upstream] using proxy: {}", proxy_url);
                let proxy = reqwest::Proxy::all(proxy_url)
                    .with_context(|| format!("Invalid proxy URL: {}", proxy_url))?;
                builder = builder.proxy(proxy);
            }
        }

        let http = builder.build().context("Failed to build reqwest client")?;
        Ok(Self { http, cc })
    }

    /// `{upstream_url}/services/{service}/{segments...}`, each segment encoded.
    async fn url(&self, scope: &Scope, segments: &[&str]) -> Result<Url, UpstreamError> {
        let base = self.cc.config().await.upstream_url.clone();
        let mut url = Url::parse(&base).map_err(|e| UpstreamError::Url(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| UpstreamError::Url(base.clone()))?
            .pop_if_empty()
            .push("services")
            .push(&scope.service)
            .extend(segments);
        Ok(url)
    }

    async fn authorize(&self, req: reqwest::RequestBuilder, scope: &Scope) -> reqwest::RequestBuilder {
        let req = req.header(TENANT_HEADER, &scope.tenant);
        match self.cc.config().await.api_key.clone() {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    pub async fn call(
        &self,
        method: Method,
        scope: &Scope,
        segments: &[&str],
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let url = self.url(scope, segments).await?;
        debug!("[upstream] {} {}", method, url);

        let mut req = self.http.request(method, url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let req = self.authorize(req, scope).await;
        let resp = req.send().await.map_err(|e| UpstreamError::Network(e.to_string()))?;
        read_response(resp).await
    }

    pub async fn upload(
        &self,
        scope: &Scope,
        part: UploadPart,
        kind: FileKind,
    ) -> Result<Value, UpstreamError> {
        let url = self.url(scope, &["upload"]).await?;
        debug!("[upstream] POST {} ({} bytes, {})", url, part.bytes.len(), kind);

        let file = multipart::Part::bytes(part.bytes)
            .file_name(part.file_name)
            .mime_str(&part.content_type)
            .map_err(|e| UpstreamError::Url(e.to_string()))?;
        let form = multipart::Form::new()
            .part("file", file)
            .text("fileType", kind.as_str());

        let req = self.authorize(self.http.post(url).multipart(form), scope).await;
        let resp = req.send().await.map_err(|e| UpstreamError::Network(e.to_string()))?;
        read_response(resp).await
    }
}

async fn read_response(resp: reqwest::Response) -> Result<Value, UpstreamError> {
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| UpstreamError::Network(e.to_string()))?;

    if !status.is_success() {
        let message = error_message(&bytes)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("upstream error").to_string());
        warn!("[upstream] {} {}", status.as_u16(), message);
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            message,
        });
    }

    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Decode(e.to_string()))
}

/// `error` or `message` field of a JSON body, else the raw text.
fn error_message(bytes: &[u8]) -> Option<String> {
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(bytes) {
        for field in ["message", "error"] {
            if let Some(Value::String(s)) = map.get(field) {
                return Some(s.clone());
            }
        }
    }
    let text = String::from_utf8_lossy(bytes).trim().to_string();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_json_fields() {
        assert_eq!(error_message(br#"{"message":"queue locked"}"#).as_deref(), Some("queue locked"));
        assert_eq!(error_message(br#"{"error":"bad action"}"#).as_deref(), Some("bad action"));
        assert_eq!(error_message(b"plain failure").as_deref(), Some("plain failure"));
        assert_eq!(error_message(b"  "), None);
    }

    #[tokio::test]
    async fn url_encodes_service_segment() {
        let cc = ConfigCenter::from_config(Config {
            upstream_url: "http://proc.local:9000/api/".into(),
            ..Config::default()
        });
        let client = UpstreamClient::new(cc.clone(), &cc.snapshot().await).unwrap();
        let url = client
            .url(&Scope::new("t", "svc 1"), &["queue", "status"])
            .await
            .unwrap();
        assert_eq!(url.as_str(), "http://proc.local:9000/api/services/svc%201/queue/status");
    }
}
