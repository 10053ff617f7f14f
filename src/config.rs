//! Runtime configuration, built once at application start and handed to the
//! transport and the sync manager.

use std::time::Duration;

use crate::outbox::SYNCED_RETENTION;

/// Default per-request timeout for the backend API.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backend base URL, e.g. `https://api.puntosabor.cl`.
    pub base_url: String,
    /// Per-request timeout applied to every API call.
    pub request_timeout: Duration,
    /// How long synced outbox entries stay visible before pruning.
    pub retention: Duration,
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retention: SYNCED_RETENTION,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SyncConfig::new("https://api.puntosabor.cl");
        assert_eq!(cfg.base_url, "https://api.puntosabor.cl");
        assert_eq!(cfg.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(cfg.retention, SYNCED_RETENTION);
    }

    #[test]
    fn test_builder_overrides() {
        let cfg = SyncConfig::new("http://localhost:8000")
            .with_request_timeout(Duration::from_secs(5))
            .with_retention(Duration::from_secs(60));
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.retention, Duration::from_secs(60));
    }
}
