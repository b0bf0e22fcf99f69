//! Error types for Teambook operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Machine-readable error codes returned across the host boundary.
///
/// Serialized in snake_case; this is the wire form CLI/MCP/HTTP consumers
/// match on (e.g. `rate_limit`, `not_your_lock`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Validation
    InvalidChannel,
    InvalidRecipient,
    InvalidItem,
    EmptyMessage,
    ContentTooLong,
    InvalidScore,
    InvalidHookType,

    // Quota / rate
    RateLimit,
    WatchLimit,
    LockLimit,
    QueueFull,
    HookLimit,
    SynthesisLimit,

    // State
    NotLocked,
    NotYourLock,
    NotYourTask,
    AlreadyCompleted,
    TaskNotFound,
    NoteNotFound,
    EvolutionNotFound,
    RecipientUnknown,
    CannotDmSelf,

    // Backend
    DatabaseError,
    VectorStoreError,
    EncryptionError,

    // Fallback
    UnknownError,
}

impl ErrorCode {
    /// Wire representation, stable across interfaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidChannel => "invalid_channel",
            ErrorCode::InvalidRecipient => "invalid_recipient",
            ErrorCode::InvalidItem => "invalid_item",
            ErrorCode::EmptyMessage => "empty_message",
            ErrorCode::ContentTooLong => "content_too_long",
            ErrorCode::InvalidScore => "invalid_score",
            ErrorCode::InvalidHookType => "invalid_hook_type",
            ErrorCode::RateLimit => "rate_limit",
            ErrorCode::WatchLimit => "watch_limit",
            ErrorCode::LockLimit => "lock_limit",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::HookLimit => "hook_limit",
            ErrorCode::SynthesisLimit => "synthesis_limit",
            ErrorCode::NotLocked => "not_locked",
            ErrorCode::NotYourLock => "not_your_lock",
            ErrorCode::NotYourTask => "not_your_task",
            ErrorCode::AlreadyCompleted => "already_completed",
            ErrorCode::TaskNotFound => "task_not_found",
            ErrorCode::NoteNotFound => "note_not_found",
            ErrorCode::EvolutionNotFound => "evolution_not_found",
            ErrorCode::RecipientUnknown => "recipient_unknown",
            ErrorCode::CannotDmSelf => "cannot_dm_self",
            ErrorCode::DatabaseError => "database_error",
            ErrorCode::VectorStoreError => "vector_store_error",
            ErrorCode::EncryptionError => "encryption_error",
            ErrorCode::UnknownError => "unknown_error",
        }
    }

    /// A remedy hint where one is obvious; surfaced as `suggestion` in
    /// structured responses.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            ErrorCode::RateLimit => Some("wait 60 seconds"),
            ErrorCode::InvalidChannel => Some("use a channel name like 'general'"),
            ErrorCode::ContentTooLong => Some("split the content or allow truncation"),
            ErrorCode::WatchLimit => Some("unwatch an item you no longer need"),
            ErrorCode::LockLimit => Some("release a lock you still hold"),
            ErrorCode::SynthesisLimit => Some("wait for the hourly window to reset"),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// TEAMBOOK ERROR
// ============================================================================

/// Structured error carried across the kernel boundary.
///
/// Validation and quota errors are returned as values, never panics; hosts
/// render them into pipe/JSON/JSON-RPC forms.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct TeambookError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TeambookError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// CLI-friendly rendering: `!CODE: message` plus compact details.
    pub fn to_cli_string(&self) -> String {
        match &self.details {
            Some(details) => format!("!{}: {} ({})", self.code, self.message, details),
            None => format!("!{}: {}", self.code, self.message),
        }
    }

    // Convenience constructors for the common cases.

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimit, message)
    }

    pub fn invalid_item(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidItem, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }
}

impl From<StorageError> for TeambookError {
    fn from(err: StorageError) -> Self {
        TeambookError::new(ErrorCode::DatabaseError, err.to_string())
    }
}

/// Result type alias for kernel operations.
pub type TeambookResult<T> = Result<T, TeambookError>;

// ============================================================================
// STORAGE ERROR
// ============================================================================

/// Errors internal to the storage adapter. Callers above the adapter see
/// these wrapped into `database_error` unless the operation is retried.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {record} {id}")]
    NotFound { record: &'static str, id: i64 },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("transient contention: {0}")]
    Contention(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn query(err: impl fmt::Display) -> Self {
        StorageError::Query(err.to_string())
    }

    /// Transient errors may be retried by the adapter before surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Contention(_))
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_form() {
        assert_eq!(ErrorCode::NotYourLock.as_str(), "not_your_lock");
        let json = serde_json::to_string(&ErrorCode::RateLimit).expect("serialize");
        assert_eq!(json, "\"rate_limit\"");
    }

    #[test]
    fn test_cli_string() {
        let err = TeambookError::new(ErrorCode::LockLimit, "max 10 locks per AI");
        assert_eq!(err.to_cli_string(), "!lock_limit: max 10 locks per AI");
    }

    #[test]
    fn test_storage_error_wraps_to_database_error() {
        let err: TeambookError = StorageError::Unavailable("down".to_string()).into();
        assert_eq!(err.code, ErrorCode::DatabaseError);
    }

    #[test]
    fn test_suggestions_present_where_obvious() {
        assert!(ErrorCode::RateLimit.suggestion().is_some());
        assert!(ErrorCode::TaskNotFound.suggestion().is_none());
    }
}
