//! Scripted [`RemoteApi`] double for unit tests.

use reqwest::Method;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;

use crate::api::RemoteApi;
use crate::error::SyncError;

/// One recorded request, in arrival order.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    pub idempotency_key: Option<String>,
}

type Responder =
    Box<dyn Fn(&str, &str, Option<&Value>) -> Result<Value, SyncError> + Send + Sync>;

/// Records every call and answers via a scripted responder. An optional
/// delay makes in-flight overlap observable for concurrency tests.
pub struct MockApi {
    calls: Mutex<Vec<RecordedCall>>,
    responder: Responder,
    delay: Option<Duration>,
}

impl MockApi {
    pub fn new(
        responder: impl Fn(&str, &str, Option<&Value>) -> Result<Value, SyncError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            delay: None,
        }
    }

    /// Answer every call with the same value.
    pub fn ok(value: Value) -> Self {
        Self::new(move |_, _, _| Ok(value.clone()))
    }

    /// Fail every call with the given HTTP status.
    pub fn failing(status: u16) -> Self {
        Self::new(move |_, _, _| Err(SyncError::http(status, "scripted failure")))
    }

    /// Fail every call at the connection level.
    pub fn offline() -> Self {
        Self::new(|_, _, _| Err(SyncError::Offline))
    }

    /// Sleep this long inside every call before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("mock call log").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock call log").len()
    }

    fn record(&self, method: &str, path: &str, body: Option<&Value>, key: Option<&str>) {
        self.calls.lock().expect("mock call log").push(RecordedCall {
            method: method.to_string(),
            path: path.to_string(),
            body: body.cloned(),
            idempotency_key: key.map(str::to_string),
        });
    }
}

impl RemoteApi for MockApi {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, SyncError> {
        self.record(method.as_str(), path, body, idempotency_key);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(method.as_str(), path, body)
    }

    async fn upload(
        &self,
        path: &str,
        _field: &str,
        _filename: &str,
        _mime: &str,
        _bytes: Vec<u8>,
    ) -> Result<Value, SyncError> {
        self.record("UPLOAD", path, None, None);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)("UPLOAD", path, None)
    }
}
