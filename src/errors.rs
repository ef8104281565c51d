//! Crate-wide error taxonomy.
//!
//! Every fallible public operation returns [`ReverieError`]. Unlike a bare `Display`
//! string, each variant carries `recoverable` and an optional `suggestion` so a UI
//! surface can decide how to react without string-matching the message.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReverieError>;

#[derive(Error, Debug, Clone)]
pub enum ReverieError {
    #[error("lock acquisition failed for '{operation}': held by a conflicting operation")]
    LockAcquisition { operation: String },

    #[error("lock acquisition for '{operation}' timed out after {waited_ms}ms")]
    LockTimeout { operation: String, waited_ms: u64 },

    #[error("lock release failed for '{operation}': {reason}")]
    LockRelease { operation: String, reason: String },

    #[error("force release drained {} lock(s): {reason}", names.len())]
    ForceRelease { names: Vec<String>, reason: String },

    #[error("deadlock detected acquiring '{operation}': cycle through {}", cycle.join(" -> "))]
    Deadlock { operation: String, cycle: Vec<String> },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("backpressure buffer overflow: exceeded {limit_bytes} bytes")]
    BackpressureOverflow { limit_bytes: usize },

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },

    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("circuit open for '{endpoint_key}', cooldown remaining {cooldown_remaining_ms}ms")]
    CircuitOpen {
        endpoint_key: String,
        cooldown_remaining_ms: u64,
    },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("safe mode: {message}")]
    SafeMode { message: String },

    #[error("tab is read-only, write path '{operation}' refused")]
    ReadOnlyAuthority { operation: String },
}

impl ReverieError {
    /// Whether a caller can reasonably retry or work around this error, versus it
    /// indicating a programming defect that must be fixed in code.
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            ReverieError::LockRelease { .. } | ReverieError::ForceRelease { .. } | ReverieError::Deadlock { .. }
        )
    }

    /// A short, user-facing hint on what to do next. `None` when the message itself
    /// is already the full story (e.g. a programming-defect error).
    pub fn suggestion(&self) -> Option<String> {
        match self {
            ReverieError::LockAcquisition { operation } => {
                Some(format!("another operation is using '{operation}'; try again shortly"))
            }
            ReverieError::LockTimeout { .. } => {
                Some("a concurrent operation is still running; wait and retry".to_string())
            }
            ReverieError::Validation { .. } => Some("check the input and try again".to_string()),
            ReverieError::Timeout(_) => Some("retry, or try a different provider".to_string()),
            ReverieError::RateLimit { retry_after_ms } => {
                Some(format!("retry in {}s", (*retry_after_ms).div_ceil(1000)))
            }
            ReverieError::Auth { .. } => Some("re-enter your API key".to_string()),
            ReverieError::CircuitOpen {
                cooldown_remaining_ms,
                ..
            } => Some(format!(
                "try again in {}s, or switch providers",
                (*cooldown_remaining_ms).div_ceil(1000)
            )),
            ReverieError::Connection { .. } => Some("check the connection and retry".to_string()),
            ReverieError::Storage { .. } => Some("you may retry the save".to_string()),
            ReverieError::SafeMode { .. } => {
                Some("encryption-dependent features are disabled until this is resolved".to_string())
            }
            ReverieError::ReadOnlyAuthority { .. } => {
                Some("switch to the primary tab to perform this action".to_string())
            }
            _ => None,
        }
    }

    pub fn lock_acquisition(operation: impl Into<String>) -> Self {
        ReverieError::LockAcquisition {
            operation: operation.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ReverieError::Validation {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ReverieError::Parse {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        ReverieError::Storage {
            message: message.into(),
        }
    }
}
