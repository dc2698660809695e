//! Centralized error types for the Overwatch core runtime.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to machine-readable codes for API boundaries
//! - Collects module-level errors (transport, model, action) into one taxonomy

use serde::Serialize;
use thiserror::Error;

use crate::model::ModelError;
use crate::source::TransportError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the Overwatch runtime.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum OverwatchError {
    /// Workflow or node configuration failed validation at deploy time.
    ///
    /// Carries the accumulated validation messages; the workflow is never
    /// started when this is returned.
    #[error("Invalid configuration: {0:?}")]
    Config(Vec<String>),

    /// Transport could not be established after the retry budget.
    #[error("Source unreachable: {0}")]
    SourceUnreachable(String),

    /// Inference engine failed to load.
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// Per-frame processing error inside a node.
    #[error("Node runtime error: {0}")]
    NodeRuntime(String),

    /// Action exhausted its retries.
    #[error("Action delivery failed: {0}")]
    ActionDelivery(String),

    /// Alarm state machine rejected a transition.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request conflicts with current state (e.g. duplicate watcher).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal runtime error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OverwatchError {
    /// Returns a machine-readable error code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::SourceUnreachable(_) => "source_unreachable",
            Self::ModelLoad(_) => "model_load_error",
            Self::NodeRuntime(_) => "node_runtime_error",
            Self::ActionDelivery(_) => "action_delivery_error",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl ErrorCode for OverwatchError {
    fn code(&self) -> &'static str {
        OverwatchError::code(self)
    }
}

/// Convenient Result alias for application-wide operations.
pub type OverwatchResult<T> = Result<T, OverwatchError>;

impl From<TransportError> for OverwatchError {
    fn from(err: TransportError) -> Self {
        Self::SourceUnreachable(err.to_string())
    }
}

impl From<ModelError> for OverwatchError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::NotRegistered(_) | ModelError::Load(_) => Self::ModelLoad(err.to_string()),
            ModelError::Inference(_) => Self::NodeRuntime(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OverwatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}

impl From<std::io::Error> for OverwatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_returns_correct_code() {
        let err = OverwatchError::Config(vec!["bad polygon".into()]);
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn invalid_transition_returns_correct_code() {
        let err = OverwatchError::InvalidTransition("NEW -> CONTAINED".into());
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn model_errors_split_between_load_and_runtime() {
        let load: OverwatchError = ModelError::Load("weights missing".into()).into();
        assert_eq!(load.code(), "model_load_error");

        let infer: OverwatchError = ModelError::Inference("shape mismatch".into()).into();
        assert_eq!(infer.code(), "node_runtime_error");
    }
}
