// adapter.rs
use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};

use super::models::ErrorResponse;
use crate::model::Scope;
use crate::proxy::ProxyError;
use crate::upstream::UpstreamError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const SERVICE_HEADER: &str = "x-service-id";

// ===============================
// Session scope (set by the auth layer in front of us)
// ===============================

pub struct Session(pub Scope);

impl<S: Send + Sync> FromRequestParts<S> for Session {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        match (header(TENANT_HEADER), header(SERVICE_HEADER)) {
            (Some(tenant), Some(service)) => Ok(Session(Scope::new(tenant, service))),
            _ => Err(json_error(
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "session is not scoped to a tenant and service",
            )),
        }
    }
}

// ===============================
// Errors -> HTTP
// ===============================

pub fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: message.into(),
        }),
    )
        .into_response()
}

/// 将 ProxyError 映射为 HTTP 响应；上游状态码原样透传
pub fn map_proxy_error(err: ProxyError) -> Response {
    let message = err.to_string();
    match err {
        ProxyError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        ProxyError::InvalidArgument(_) => json_error(StatusCode::BAD_REQUEST, "invalid_argument", message),
        ProxyError::Busy => json_error(StatusCode::CONFLICT, "processing", message),
        ProxyError::Upstream(UpstreamError::Status { status, .. }) => {
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            json_error(code, "upstream_error", message)
        }
        ProxyError::Upstream(UpstreamError::Network(_)) => {
            json_error(StatusCode::BAD_GATEWAY, "upstream_unreachable", message)
        }
        ProxyError::Upstream(UpstreamError::Decode(_)) => {
            json_error(StatusCode::BAD_GATEWAY, "upstream_invalid", message)
        }
        ProxyError::Upstream(UpstreamError::Url(_)) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "misconfigured", message)
        }
    }
}
