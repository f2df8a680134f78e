// Type definitions shared across the engine

use std::time::Duration;

use crate::run::RunStatus;

/// Why a single external call (source query or generation) did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, 5xx, or the collaborator is down. Retried.
    SourceUnavailable,
    /// Bad credentials or a query the source rejects. Never retried.
    AuthOrQueryInvalid,
    /// Quota exceeded. Retried, honoring the retry hint when present.
    RateLimited,
    /// The caller's cancellation token fired.
    Cancelled,
}

impl FailureKind {
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::SourceUnavailable | FailureKind::RateLimited)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::SourceUnavailable => write!(f, "source_unavailable"),
            FailureKind::AuthOrQueryInvalid => write!(f, "auth_or_query_invalid"),
            FailureKind::RateLimited => write!(f, "rate_limited"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Failure of one external call, as reported by a collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CallFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Server-provided hint for when to try again (e.g. `Retry-After`).
    pub retry_after: Option<Duration>,
}

impl CallFailure {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::SourceUnavailable, message: message.into(), retry_after: None }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::AuthOrQueryInvalid, message: message.into(), retry_after: None }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::RateLimited,
            message: "rate limit exceeded".to_string(),
            retry_after,
        }
    }

    pub fn cancelled() -> Self {
        Self { kind: FailureKind::Cancelled, message: "call cancelled".to_string(), retry_after: None }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LLMRequest {
    pub model: String,
    pub messages: Vec<LLMMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LLMMessage {
    pub role: String, // "user", "assistant", "system"
    pub content: String,
}

impl LLMMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid intent: {0}")]
    InvalidIntent(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid run transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Persistence(e.to_string())
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;
