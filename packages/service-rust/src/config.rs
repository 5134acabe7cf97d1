//! Service-level configuration and tracing bootstrap.

use std::time::Duration;

use causeway_core::{SessionId, DEFAULT_SEQUENCE_LANES};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Configuration for one embedding service.
///
/// Loading it from files or the environment is left to the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Name reported in spans and logs, e.g. `"identity"`.
    pub service_name: String,
    /// Fixed session id. A random one is drawn at bootstrap when `None`.
    pub session_id: Option<SessionId>,
    /// Striped lanes per transaction/action id generator.
    pub sequence_lanes: usize,
    /// Whether a failed completion in an executor stops the process.
    pub stop_app_if_error: bool,
    /// Upper bound on the shutdown drain.
    pub drain_timeout: Duration,
    pub log_format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            session_id: None,
            sequence_lanes: DEFAULT_SEQUENCE_LANES,
            stop_app_if_error: true,
            drain_timeout: Duration::from_secs(30),
            log_format: LogFormat::Text,
            log_filter: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// The configured session id, or a fresh random one.
    #[must_use]
    pub fn resolve_session_id(&self) -> SessionId {
        self.session_id.unwrap_or_else(SessionId::generate)
    }

    /// `RUST_LOG` if set and valid, else [`log_filter`](Self::log_filter),
    /// else `info`.
    #[must_use]
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global tracing subscriber described by `config`.
///
/// # Errors
///
/// Returns [`TryInitError`] if a global subscriber is already installed.
pub fn init_tracing(config: &ServiceConfig) -> Result<(), TryInitError> {
    let json = config.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServiceConfig::default();
        assert!(config.service_name.is_empty());
        assert!(config.session_id.is_none());
        assert_eq!(config.sequence_lanes, 8);
        assert!(config.stop_app_if_error);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn fixed_session_id_is_kept() {
        let config = ServiceConfig {
            session_id: Some(SessionId::new(42)),
            ..ServiceConfig::new("identity")
        };
        assert_eq!(config.service_name, "identity");
        assert_eq!(config.resolve_session_id(), SessionId::new(42));
    }

    #[test]
    fn random_session_id_is_nonzero() {
        let config = ServiceConfig::new("website");
        assert_ne!(config.resolve_session_id().get(), 0);
    }

    #[test]
    fn invalid_filter_falls_back() {
        let config = ServiceConfig {
            log_filter: "[[not a filter".to_string(),
            ..ServiceConfig::default()
        };
        // Must not panic whatever RUST_LOG holds.
        let _ = config.env_filter();
    }
}
