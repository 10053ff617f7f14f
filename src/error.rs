//! Error type for the sync core.
//!
//! Network failures are classified once, here, and the classification is
//! shared by the synchronous repository paths and the outbox processors:
//! a retryable failure means "enqueue and keep the optimistic row", a
//! non-retryable one means "roll back and surface to the caller".

use thiserror::Error;

/// Fallback shown when the server gives us nothing usable.
pub const GENERIC_API_ERROR: &str = "No se pudo completar la operacion";

#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote API failure. `status` is `None` for connection-level errors
    /// (no response received, timeout, DNS).
    #[error("{message}")]
    Api { status: Option<u16>, message: String },

    /// The connectivity oracle reports no network.
    #[error("sin conexion de red")]
    Offline,

    /// Local SQLite store failure. Treated as fatal by callers; the store
    /// is assumed healthy everywhere else.
    #[error("local store: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The store mutex was poisoned by a panicking writer.
    #[error("local store lock poisoned")]
    StorePoisoned,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// A durable attachment failed to round-trip through base64.
    #[error("adjunto: {0}")]
    Attachment(#[from] base64::DecodeError),

    /// An outbox entry whose type/op combination has no processor.
    #[error("entrada de outbox no soportada: {0}")]
    UnsupportedEntry(String),

    /// Local form validation rejected the input before any network call.
    #[error("{0}")]
    Validation(String),
}

impl SyncError {
    /// Network-level constructor for errors with no HTTP response.
    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Api {
            status: None,
            message: message.into(),
        }
    }

    /// HTTP-level constructor.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        SyncError::Api {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Transient failure: retrying later may succeed without user action.
    ///
    /// Covers connection-level failures (no status), HTTP 5xx, 408 and 429.
    /// Every other 4xx is terminal for the attempt (validation, not-found,
    /// conflict, auth).
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Api { status: None, .. } => true,
            SyncError::Api {
                status: Some(code), ..
            } => *code >= 500 || *code == 408 || *code == 429,
            SyncError::Offline => true,
            _ => false,
        }
    }

    /// Whether a failed write should fall back to the outbox instead of
    /// rolling back the optimistic mutation.
    pub fn should_enqueue(&self) -> bool {
        matches!(self, SyncError::Offline) || self.is_retryable()
    }

    /// Message suitable for a user-facing notification.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Api { message, .. } if !message.trim().is_empty() => message.clone(),
            SyncError::Api { status, .. } => status
                .map(|s| format!("HTTP {s}"))
                .unwrap_or_else(|| GENERIC_API_ERROR.to_string()),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_level_errors_are_retryable() {
        let err = SyncError::transport("Cannot reach backend");
        assert!(err.is_retryable());
        assert!(err.should_enqueue());
    }

    #[test]
    fn test_5xx_408_429_are_retryable() {
        for code in [500, 502, 503, 504, 408, 429] {
            assert!(
                SyncError::http(code, "x").is_retryable(),
                "HTTP {code} should be retryable"
            );
        }
    }

    #[test]
    fn test_other_4xx_are_terminal() {
        for code in [400, 401, 403, 404, 409, 422] {
            let err = SyncError::http(code, "x");
            assert!(!err.is_retryable(), "HTTP {code} should not be retryable");
            assert!(!err.should_enqueue());
        }
    }

    #[test]
    fn test_offline_enqueues_without_being_an_http_error() {
        assert!(SyncError::Offline.should_enqueue());
    }

    #[test]
    fn test_validation_is_terminal() {
        let err = SyncError::Validation("El nombre es obligatorio".into());
        assert!(!err.is_retryable());
        assert!(!err.should_enqueue());
        assert_eq!(err.user_message(), "El nombre es obligatorio");
    }

    #[test]
    fn test_user_message_prefers_server_detail() {
        let err = SyncError::http(400, "nombre es requerido");
        assert_eq!(err.user_message(), "nombre es requerido");

        let blank = SyncError::Api {
            status: Some(500),
            message: "  ".into(),
        };
        assert_eq!(blank.user_message(), "HTTP 500");
    }
}
