//! Error types for the hibernation engine

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the idle-detection and scheduling engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Input failed validation (bad schedule window, empty name, ...)
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// A named entity (profile, schedule, template, ...) does not exist
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The operation would violate a consistency rule
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Remote communication with an instance or telemetry backend failed
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A lifecycle action was attempted and failed on the remote side
    #[error("action {action} failed on instance {instance}: {message}")]
    ActionExecution {
        instance: String,
        action: String,
        message: String,
    },

    /// Reading or writing persisted state failed
    #[error("persistence error at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn action(
        instance: impl Into<String>,
        action: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ActionExecution {
            instance: instance.into(),
            action: action.into(),
            message: message.into(),
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = EngineError::not_found("profile", "turbo");
        assert_eq!(err.to_string(), "profile not found: turbo");
    }

    #[test]
    fn test_action_execution_display() {
        let err = EngineError::action("ws-gpu-1", "hibernate", "instance not in running state");
        let message = err.to_string();
        assert!(message.contains("hibernate"));
        assert!(message.contains("ws-gpu-1"));
    }

    #[test]
    fn test_persistence_preserves_source() {
        use std::error::Error;

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = EngineError::persistence("/tmp/state.json", io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_serialization_conversion() {
        let bad = serde_json::from_str::<serde_json::Value>("{");
        let err: EngineError = bad.unwrap_err().into();
        assert!(matches!(err, EngineError::Serialization(_)));
    }
}
