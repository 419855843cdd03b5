//! Error taxonomy shared by every gateway subsystem.
//!
//! All failures inside the gateway collapse into a closed set of
//! [`ErrorKind`]s. The dispatcher keys its retry policy off the kind, the
//! request surface maps kinds onto transport status codes, and the health
//! tracker aggregates per-kind failure counters. Provider adapters are
//! responsible for classifying vendor-specific failures into one of these
//! kinds before they reach the rest of the system.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Closed classification of gateway failures.
///
/// The set is deliberately small and stable: downstream consumers (retry
/// policy, transport mapping, health counters) switch on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The operation exceeded its deadline.
    Timeout,
    /// The provider signalled too-many-requests.
    RateLimit,
    /// Connection, DNS, reset, or refused-connection failure.
    Network,
    /// The provider rejected credentials or forbade the request.
    Authentication,
    /// The provider accepted the call but the requested model is invalid,
    /// removed, or inconsistent with the supplied options.
    ModelError,
    /// A provider 5xx equivalent or a malformed payload. Retryable.
    Internal,
    /// The gateway rejected the input before dispatch.
    Validation,
    /// The quota enforcer rejected the request pre-dispatch.
    BudgetExceeded,
    /// A dependency's terminal failure cascaded into this task.
    UpstreamFailed,
    /// Cooperative cancellation from a parent.
    Cancelled,
}

impl ErrorKind {
    /// Stable snake_case name, matching the serialized representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::Authentication => "authentication",
            ErrorKind::ModelError => "model_error",
            ErrorKind::Internal => "internal",
            ErrorKind::Validation => "validation",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::UpstreamFailed => "upstream_failed",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether the dispatcher may retry an attempt that failed with this kind.
    ///
    /// Only transient provider-side conditions are retryable. Validation and
    /// budget rejections never enter the retry path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::Internal
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified gateway failure: an [`ErrorKind`] plus a short human string.
///
/// The message is intended to be user-visible; it never carries raw provider
/// payloads or secrets.
#[derive(Debug, Clone)]
pub struct GatewayError {
    /// Classification used for retry decisions and transport mapping.
    pub kind: ErrorKind,
    /// Short human-readable description of what went wrong.
    pub message: String,
}

impl GatewayError {
    /// Construct an error with an explicit kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Convenience constructor for [`ErrorKind::Timeout`].
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Convenience constructor for [`ErrorKind::RateLimit`].
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    /// Convenience constructor for [`ErrorKind::Network`].
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Convenience constructor for [`ErrorKind::Authentication`].
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    /// Convenience constructor for [`ErrorKind::ModelError`].
    pub fn model_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelError, message)
    }

    /// Convenience constructor for [`ErrorKind::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Convenience constructor for [`ErrorKind::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Convenience constructor for [`ErrorKind::BudgetExceeded`].
    pub fn budget_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BudgetExceeded, message)
    }

    /// Convenience constructor for [`ErrorKind::UpstreamFailed`].
    pub fn upstream_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamFailed, message)
    }

    /// Convenience constructor for [`ErrorKind::Cancelled`].
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Forwarded from [`ErrorKind::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for GatewayError {}
