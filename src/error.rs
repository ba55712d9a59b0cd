//! Error types for the alert control plane
//!
//! Every fallible core operation returns [`ControlError`]. The invoking layer
//! (REST handler, scheduled job, consumer loop) decides what to do with it;
//! [`ControlError::status_code`] gives the HTTP-equivalent mapping.

use crate::storage::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Main error type for alert state and device routing operations
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("No current state is set")]
    NoCurrentState,

    #[error("State not found: {name}")]
    StateNotFound { name: String },

    #[error("Relative counter change requested but the ledger is empty")]
    NoPriorCounter,

    #[error("Malformed routing key `{routing_key}`: expected <device_type>.<device_uid>.<command>")]
    MalformedRoutingKey { routing_key: String },

    #[error("Payload decode failed: {message}")]
    PayloadDecodeFailure { message: String },

    #[error("Publish to `{topic}` failed: {message}")]
    PublishFailure { topic: String, message: String },

    #[error("Current state swap conflicted {attempts} times")]
    TransactionConflict { attempts: u32 },

    #[error("Invalid state patch: {message}")]
    InvalidPatch { message: String },

    #[error("Storage error: {0}")]
    Storage(#[source] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),
}

/// Serializable error classification for callers that report errors outward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoCurrentState,
    StateNotFound,
    NoPriorCounter,
    MalformedRoutingKey,
    PayloadDecodeFailure,
    PublishFailure,
    TransactionConflict,
    InvalidPatch,
    Storage,
    Configuration,
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::NoCurrentState => ErrorKind::NoCurrentState,
            ControlError::StateNotFound { .. } => ErrorKind::StateNotFound,
            ControlError::NoPriorCounter => ErrorKind::NoPriorCounter,
            ControlError::MalformedRoutingKey { .. } => ErrorKind::MalformedRoutingKey,
            ControlError::PayloadDecodeFailure { .. } => ErrorKind::PayloadDecodeFailure,
            ControlError::PublishFailure { .. } => ErrorKind::PublishFailure,
            ControlError::TransactionConflict { .. } => ErrorKind::TransactionConflict,
            ControlError::InvalidPatch { .. } => ErrorKind::InvalidPatch,
            ControlError::Storage(_) => ErrorKind::Storage,
            ControlError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::PublishFailure { .. } | ControlError::TransactionConflict { .. }
        )
    }

    /// HTTP-equivalent status for the invoking layer
    pub fn status_code(&self) -> u16 {
        match self {
            ControlError::StateNotFound { .. } => 404,
            ControlError::Storage(StoreError::NotFound(_)) => 404,
            ControlError::NoCurrentState
            | ControlError::NoPriorCounter
            | ControlError::MalformedRoutingKey { .. }
            | ControlError::PayloadDecodeFailure { .. }
            | ControlError::InvalidPatch { .. } => 400,
            ControlError::Storage(StoreError::UniqueViolation { .. }) => 409,
            ControlError::PublishFailure { .. } | ControlError::TransactionConflict { .. } => 503,
            ControlError::Storage(_) | ControlError::Configuration(_) => 500,
        }
    }

    pub fn state_not_found<S: Into<String>>(name: S) -> Self {
        Self::StateNotFound { name: name.into() }
    }

    pub fn malformed_routing_key<S: Into<String>>(routing_key: S) -> Self {
        Self::MalformedRoutingKey {
            routing_key: routing_key.into(),
        }
    }

    pub fn publish_failure<T: Into<String>, M: std::fmt::Display>(topic: T, message: M) -> Self {
        Self::PublishFailure {
            topic: topic.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_patch<S: Into<String>>(message: S) -> Self {
        Self::InvalidPatch {
            message: message.into(),
        }
    }
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => ControlError::StateNotFound { name },
            other => ControlError::Storage(other),
        }
    }
}

/// Result type for control plane operations
pub type ControlResult<T> = Result<T, ControlError>;
