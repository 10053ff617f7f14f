//! HTTP transport to the backend.
//!
//! The repositories and the sync manager only see [`RemoteApi`], so tests
//! swap in a scripted double and the production build wires [`HttpApi`].

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{SyncConfig, DEFAULT_REQUEST_TIMEOUT};
use crate::error::SyncError;
use crate::mapper::value_str;

/// Minimal request surface the sync core needs from the backend.
#[allow(async_fn_in_trait)]
pub trait RemoteApi: Send + Sync {
    /// Send `method path` with an optional JSON body. A replayed outbox
    /// entry passes its stored `idempotency_key` so the server can
    /// deduplicate repeated creates.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, SyncError>;

    /// Multipart file upload to `path` under the given form field.
    async fn upload(
        &self,
        path: &str,
        field: &str,
        filename: &str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> Result<Value, SyncError>;
}

/// `reqwest`-backed [`RemoteApi`] with a shared bearer token.
pub struct HttpApi {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        Self::with_timeout(&config.base_url, config.request_timeout)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    /// Install or clear the session token used for subsequent requests.
    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token;
        }
    }

    pub fn has_token(&self) -> bool {
        self.token
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn bearer(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }

    async fn dispatch(&self, req: reqwest::RequestBuilder) -> Result<Value, SyncError> {
        let req = match self.bearer() {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let resp = req.send().await.map_err(|e| map_transport_error(&e))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
        }

        let message = extract_api_message(&text, status);
        warn!(status = status.as_u16(), %message, "api request failed");
        Err(SyncError::http(status.as_u16(), &message))
    }
}

impl RemoteApi for HttpApi {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, SyncError> {
        debug!(%method, path, "api request");
        let mut req = self.client.request(method, self.url(path));
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        self.dispatch(req).await
    }

    async fn upload(
        &self,
        path: &str,
        field: &str,
        filename: &str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> Result<Value, SyncError> {
        debug!(path, field, filename, "api upload");
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| SyncError::transport(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part(field.to_string(), part);
        let req = self.client.post(self.url(path)).multipart(form);
        self.dispatch(req).await
    }
}

/// Connection-level failures become [`SyncError::Offline`] so callers fall
/// back to the outbox; everything else keeps its transport detail.
fn map_transport_error(err: &reqwest::Error) -> SyncError {
    if err.is_connect() || err.is_timeout() {
        return SyncError::Offline;
    }
    SyncError::transport(&err.to_string())
}

/// Pull a human-readable message out of an error body. The backend answers
/// with `detail`, `error` or `message` depending on the endpoint; fall back
/// to the HTTP reason phrase when the body is opaque.
fn extract_api_message(body: &str, status: StatusCode) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = value_str(&json, &["detail", "error", "message"]) {
            return msg;
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() && trimmed.len() <= 200 {
        return trimmed.to_string();
    }
    format!(
        "HTTP {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("error")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_api_message_prefers_detail_field() {
        let body = r#"{"detail": "No autorizado", "error": "ignored"}"#;
        let msg = extract_api_message(body, StatusCode::UNAUTHORIZED);
        assert_eq!(msg, "No autorizado");
    }

    #[test]
    fn test_extract_api_message_falls_back_to_error_then_message() {
        let msg = extract_api_message(r#"{"error": "boom"}"#, StatusCode::BAD_REQUEST);
        assert_eq!(msg, "boom");
        let msg = extract_api_message(r#"{"message": "nope"}"#, StatusCode::BAD_REQUEST);
        assert_eq!(msg, "nope");
    }

    #[test]
    fn test_extract_api_message_uses_reason_for_opaque_bodies() {
        let long_html = "<html>".repeat(100);
        let msg = extract_api_message(&long_html, StatusCode::BAD_GATEWAY);
        assert_eq!(msg, "HTTP 502 Bad Gateway");
    }

    #[test]
    fn test_extract_api_message_keeps_short_plaintext_bodies() {
        let msg = extract_api_message("gone", StatusCode::NOT_FOUND);
        assert_eq!(msg, "gone");
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let api = HttpApi::new("http://localhost:8000/").unwrap();
        assert_eq!(api.url("/v1/productos/"), "http://localhost:8000/v1/productos/");
        assert_eq!(api.url("v1/productos/"), "http://localhost:8000/v1/productos/");
    }

    #[test]
    fn test_from_config_applies_base_url() {
        let cfg = SyncConfig::new("http://localhost:8000/")
            .with_request_timeout(Duration::from_secs(5));
        let api = HttpApi::from_config(&cfg).unwrap();
        assert_eq!(api.url("v1/productos/"), "http://localhost:8000/v1/productos/");
    }

    #[test]
    fn test_token_roundtrip() {
        let api = HttpApi::new("http://localhost:8000").unwrap();
        assert!(!api.has_token());
        api.set_token(Some("abc".into()));
        assert!(api.has_token());
        api.set_token(None);
        assert!(!api.has_token());
    }
}
