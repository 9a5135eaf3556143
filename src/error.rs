//! Classified-error taxonomy
//!
//! Every failure that crosses the engine boundary is tagged with one of a
//! closed set of kinds. The kind determines the recovery path: retry with
//! backoff, escalate to the user, pause globally, or crash the session.

use serde::{Deserialize, Serialize};

/// The closed set of classified error kinds (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 401 / expired token / missing credential. No auto-retry.
    Auth,
    /// 403 / forbidden scope / missing grant. No auto-retry.
    Permission,
    /// Transport failure, 5xx, timeout. Retried with exponential backoff.
    Network,
    /// Bad input, phase violation, validation error. No retry.
    Logic,
    /// 402 from a billing layer. Engages the global pause.
    PaymentRequired,
    /// Invariant breach, store failure. Crashes the session.
    Internal,
}

impl ErrorKind {
    /// Whether the scheduler should automatically retry a failure of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network)
    }

    /// Whether this kind blocks the workflow pending user action
    /// (`needs_attention`), as opposed to being retried or crashing.
    pub fn needs_attention(self) -> bool {
        matches!(self, ErrorKind::Auth | ErrorKind::Permission | ErrorKind::Logic)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Permission => "permission",
            ErrorKind::Network => "network",
            ErrorKind::Logic => "logic",
            ErrorKind::PaymentRequired => "payment_required",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// A classified error carrying a human-readable message alongside its kind.
///
/// This is the error type handler code, the tool gate, and the session
/// orchestrator all speak. It is deliberately flat (no source chain) since
/// it is meant to be persisted as `HandlerRun.error` / `workflow.error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logic, message)
    }

    pub fn payment_required(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PaymentRequired, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
