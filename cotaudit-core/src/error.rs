//! Error types for the cotaudit core.
//!
//! Uses `thiserror` for public API error types. Per-call backend failures
//! (`BackendError`) are mostly absorbed by the monitor and perturbation engine
//! as conservative score substitutions; only `AuditError` reaches callers.

/// Top-level error type for a reasoning request.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Model backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl AuditError {
    /// Stable machine-readable kind for API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditError::BackendUnavailable { .. } => "backend_unavailable",
            AuditError::Validation(_) => "validation_error",
            AuditError::Config(_) => "config_error",
            AuditError::Cancelled => "cancelled",
            AuditError::InvalidStateTransition { .. } => "internal",
        }
    }

    /// Human-readable message safe to show to clients.
    ///
    /// Validation and config errors describe the caller's own input and are
    /// passed through. Backend and internal failures are reduced to a fixed
    /// sentence so raw provider output never leaves the process.
    pub fn public_message(&self) -> String {
        match self {
            AuditError::BackendUnavailable { .. } => {
                "The model backend is unavailable; no candidate reasoning could be generated"
                    .to_string()
            }
            AuditError::Validation(e) => e.to_string(),
            AuditError::Config(e) => e.to_string(),
            AuditError::Cancelled => "The request was cancelled".to_string(),
            AuditError::InvalidStateTransition { .. } => {
                "Internal pipeline error".to_string()
            }
        }
    }
}

/// Errors from a single Model Backend call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Backend call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Backend not configured: {message}")]
    NotConfigured { message: String },

    #[error("Backend call cancelled")]
    Cancelled,
}

impl BackendError {
    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::RateLimited { .. }
                | BackendError::Connection { .. }
                | BackendError::Timeout { .. }
        )
    }
}

/// Malformed request shape, rejected before any backend call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Input must not be empty")]
    EmptyInput,

    #[error("Input is too long: {len} characters (max {max})")]
    InputTooLong { len: usize, max: usize },

    #[error("Invalid request id: {reason}")]
    InvalidRequestId { reason: String },

    #[error("Context value for '{key}' must be a string, number, boolean, or null")]
    InvalidContextValue { key: String },
}

/// Errors from the configuration system.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Unknown model backend '{name}' (expected mock, openai, or gemini)")]
    UnknownBackend { name: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Failed to write config file {path}: {message}")]
    Io { path: String, message: String },
}

/// A type alias for results using the top-level `AuditError`.
pub type Result<T> = std::result::Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_backend_unavailable() {
        let err = AuditError::BackendUnavailable {
            message: "all 3 candidate generations failed".into(),
        };
        assert_eq!(
            err.to_string(),
            "Model backend unavailable: all 3 candidate generations failed"
        );
        assert_eq!(err.kind(), "backend_unavailable");
    }

    #[test]
    fn test_public_message_hides_backend_details() {
        let err = AuditError::BackendUnavailable {
            message: "HTTP 500: {\"error\": \"internal trace id 0xdeadbeef\"}".into(),
        };
        let public = err.public_message();
        assert!(!public.contains("0xdeadbeef"));
        assert!(!public.contains("HTTP 500"));
    }

    #[test]
    fn test_validation_error_passthrough() {
        let err: AuditError = ValidationError::EmptyInput.into();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(err.public_message(), "Input must not be empty");
    }

    #[test]
    fn test_config_error_display() {
        let err = AuditError::Config(ConfigError::UnknownBackend {
            name: "claude-local".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Unknown model backend 'claude-local' (expected mock, openai, or gemini)"
        );
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_backend_error_transient() {
        assert!(BackendError::Timeout { timeout_ms: 100 }.is_transient());
        assert!(BackendError::RateLimited { retry_after_secs: 2 }.is_transient());
        assert!(
            BackendError::Connection {
                message: "reset".into()
            }
            .is_transient()
        );
        assert!(
            !BackendError::AuthFailed {
                provider: "openai".into()
            }
            .is_transient()
        );
        assert!(!BackendError::Cancelled.is_transient());
    }

    #[test]
    fn test_input_too_long_display() {
        let err = ValidationError::InputTooLong { len: 20, max: 10 };
        assert_eq!(
            err.to_string(),
            "Input is too long: 20 characters (max 10)"
        );
    }

    #[test]
    fn test_invalid_state_transition_is_internal() {
        let err = AuditError::InvalidStateTransition {
            from: "scoring".into(),
            to: "generating".into(),
        };
        assert_eq!(err.kind(), "internal");
        assert_eq!(err.public_message(), "Internal pipeline error");
    }
}
