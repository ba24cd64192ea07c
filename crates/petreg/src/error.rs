//! Error taxonomy for the acquisition engine.

use serde::{Deserialize, Serialize};

/// All errors that can occur while acquiring data from the source.
///
/// Per-key failures never escape the retry controller; they are classified
/// and absorbed there. Only session bootstrap and configuration errors reach
/// the caller, and even those are folded into `Dataset::error`.
#[derive(thiserror::Error, Debug)]
pub enum AcquireError {
    /// Entry page or endpoint unreachable.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// 401-class response; the session must be rebuilt.
    #[error("Session rejected by source (HTTP {status})")]
    AuthExpired { status: u16 },

    /// 429-class response.
    #[error("Rate limited by source (HTTP {status})")]
    RateLimited { status: u16 },

    /// Response arrived but carried no body.
    #[error("Empty payload")]
    EmptyPayload,

    /// Any other non-success status.
    #[error("HTTP error {status}")]
    Http { status: u16 },

    /// Payload parsed but yielded no record.
    #[error("Decode error: {0}")]
    Decode(String),

    /// All attempts for one key failed. Internal to the retry controller.
    #[error("Retries exhausted for {key} after {attempts} attempts")]
    ExhaustedRetries { key: String, attempts: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure classes understood by the retry policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    EmptyPayload,
    AuthFailure,
    RateLimited,
    Transport,
    Undecodable,
}

impl AcquireError {
    /// Map this error onto its retry policy class.
    pub fn classify(&self) -> FailureClass {
        match self {
            AcquireError::EmptyPayload => FailureClass::EmptyPayload,
            AcquireError::AuthExpired { .. } => FailureClass::AuthFailure,
            AcquireError::RateLimited { .. } => FailureClass::RateLimited,
            AcquireError::Decode(_) | AcquireError::Json(_) => FailureClass::Undecodable,
            AcquireError::Connectivity(_)
            | AcquireError::Http { .. }
            | AcquireError::ExhaustedRetries { .. }
            | AcquireError::Config(_)
            | AcquireError::Io(_) => FailureClass::Transport,
        }
    }

    /// Map an HTTP status onto the error taxonomy. `None` for 2xx.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            401 | 403 => Some(AcquireError::AuthExpired { status }),
            429 => Some(AcquireError::RateLimited { status }),
            _ => Some(AcquireError::Http { status }),
        }
    }
}

impl From<reqwest::Error> for AcquireError {
    fn from(e: reqwest::Error) -> Self {
        AcquireError::Connectivity(e.to_string())
    }
}

pub type AcquireResult<T> = Result<T, AcquireError>;
