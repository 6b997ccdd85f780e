//! Orchestrator error types with rich context

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Orchestrator error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Device/Session Errors (validation, never retried)
    // ─────────────────────────────────────────────────────────────
    #[error("Unknown device: {id}")]
    NotFound { id: String },

    #[error("Invalid transition: {message}")]
    InvalidTransition { message: String },

    #[error("Mirror session for {device_id} is already active")]
    AlreadyActive { device_id: String },

    #[error("Rejected by policy: {reason}")]
    PolicyRejected { reason: String },

    // ─────────────────────────────────────────────────────────────
    // External Tool Errors
    // ─────────────────────────────────────────────────────────────
    #[error("'{tool}' not found. Ensure it is installed and in your PATH.")]
    ToolNotFound { tool: String },

    #[error("External tool failure: {message}")]
    ExternalToolFailure { message: String },

    #[error("Failed to spawn process: {reason}")]
    ProcessSpawn { reason: String },

    #[error("Tool output could not be parsed: {message}")]
    Protocol { message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel send error: {message}")]
    ChannelSend { message: String },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            message: message.into(),
        }
    }

    pub fn already_active(device_id: impl Into<String>) -> Self {
        Self::AlreadyActive {
            device_id: device_id.into(),
        }
    }

    pub fn policy(reason: impl Into<String>) -> Self {
        Self::PolicyRejected {
            reason: reason.into(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::ExternalToolFailure {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            message: message.into(),
        }
    }

    /// Whether the failure came from the caller's request rather than the world.
    ///
    /// Validation errors are returned synchronously and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::InvalidTransition { .. }
                | Error::AlreadyActive { .. }
                | Error::PolicyRejected { .. }
        )
    }

    /// Check if this is a recoverable error (the next monitor cycle may clear it)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ExternalToolFailure { .. }
                | Error::Protocol { .. }
                | Error::Timeout { .. }
                | Error::Cancelled { .. }
                | Error::ChannelSend { .. }
        )
    }

    /// The bare failure text, without the variant's display prefix.
    ///
    /// Used as the reason in `DeviceStatus::Error`.
    pub fn reason(&self) -> String {
        match self {
            Error::InvalidTransition { message }
            | Error::ExternalToolFailure { message }
            | Error::Protocol { message }
            | Error::Config { message }
            | Error::ChannelSend { message } => message.clone(),
            Error::PolicyRejected { reason } | Error::ProcessSpawn { reason } => reason.clone(),
            other => other.to_string(),
        }
    }

    /// An owned copy, for handing one failure to several waiters.
    ///
    /// I/O errors keep their kind and message; JSON errors become `Protocol`.
    pub fn replicate(&self) -> Error {
        match self {
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Json(e) => Error::protocol(e.to_string()),
            Error::NotFound { id } => Error::not_found(id.clone()),
            Error::InvalidTransition { message } => Error::invalid_transition(message.clone()),
            Error::AlreadyActive { device_id } => Error::already_active(device_id.clone()),
            Error::PolicyRejected { reason } => Error::policy(reason.clone()),
            Error::ToolNotFound { tool } => Error::ToolNotFound { tool: tool.clone() },
            Error::ExternalToolFailure { message } => Error::tool(message.clone()),
            Error::ProcessSpawn { reason } => Error::ProcessSpawn {
                reason: reason.clone(),
            },
            Error::Protocol { message } => Error::protocol(message.clone()),
            Error::Timeout { operation, after } => Error::timeout(operation.clone(), *after),
            Error::Cancelled { operation } => Error::cancelled(operation.clone()),
            Error::Config { message } => Error::config(message.clone()),
            Error::ConfigNotFound { path } => Error::ConfigNotFound { path: path.clone() },
            Error::ChannelSend { message } => Error::channel_send(message.clone()),
            Error::ChannelClosed => Error::ChannelClosed,
        }
    }

    /// Check if this error should stop the service at startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ToolNotFound { .. } | Error::ConfigNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::not_found("d1");
        assert_eq!(err.to_string(), "Unknown device: d1");

        let err = Error::ToolNotFound {
            tool: "adb".to_string(),
        };
        assert!(err.to_string().contains("'adb' not found"));

        let err = Error::timeout("connect d2", Duration::from_secs(10));
        assert_eq!(err.to_string(), "connect d2 timed out after 10s");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_validation_errors_are_not_recoverable() {
        for err in [
            Error::not_found("x"),
            Error::invalid_transition("offline"),
            Error::already_active("x"),
            Error::policy("blocked"),
        ] {
            assert!(err.is_validation(), "{err} should be a validation error");
            assert!(!err.is_recoverable(), "{err} should not be retried");
        }
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::tool("adb exited 1").is_recoverable());
        assert!(Error::timeout("exec", Duration::from_secs(1)).is_recoverable());
        assert!(Error::cancelled("connect").is_recoverable());
        assert!(!Error::policy("blocked").is_recoverable());
    }

    #[test]
    fn test_reason_strips_display_prefix() {
        assert_eq!(Error::tool("unauthorized").reason(), "unauthorized");
        assert_eq!(Error::policy("too large").reason(), "too large");
        assert_eq!(
            Error::ToolNotFound { tool: "adb".into() }.reason(),
            "'adb' not found. Ensure it is installed and in your PATH."
        );
    }

    #[test]
    fn test_replicate_keeps_variant() {
        assert!(matches!(
            Error::ToolNotFound { tool: "adb".into() }.replicate(),
            Error::ToolNotFound { tool } if tool == "adb"
        ));
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"));
        assert!(matches!(io.replicate(), Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::ToolNotFound {
            tool: "adb".into()
        }
        .is_fatal());
        assert!(!Error::tool("crash").is_fatal());
        assert!(!Error::timeout("exec", Duration::ZERO).is_fatal());
    }
}
