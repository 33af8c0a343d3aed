//! Core types and error definitions for the Conduit agent-communication layer.
//!
//! This crate provides the foundational types shared across all Conduit crates:
//! the error taxonomy every layer speaks, the identity of a configured agent,
//! and the boundary validation applied to agent replies.
//!
//! # Main types
//!
//! - [`ConduitError`] — Unified error enum (connection, timeout, circuit, validation, agent).
//! - [`ConduitResult`] — Convenience alias for `Result<T, ConduitError>`.
//! - [`ErrorKind`] — Serializable taxonomy tag reported to callers.
//! - [`AgentIdentity`] — Immutable description of one agent and its addresses.
//! - [`ReplyShape`] — Tagged union of known reply shapes with an opaque fallback.

/// Agent identity and address validation.
pub mod identity;
/// Reply payload shapes and boundary validation.
pub mod payload;

pub use identity::AgentIdentity;
pub use payload::{AgentErrorBody, ReplyShape, ShapeHint};

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for the Conduit layer.
///
/// Variants mirror the failure taxonomy: transport problems are retryable,
/// payload and business-level failures are not.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    /// Failure to establish or maintain a transport connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A call exceeded its time budget at some layer.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Fast-fail because the named breaker is open.
    #[error("Circuit open: {breaker}")]
    CircuitOpen {
        /// Name of the breaker that rejected the call.
        breaker: String,
    },

    /// Malformed request or response payload.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The agent reported a business-level failure.
    #[error("Agent error [{error_type}]: {message}")]
    Agent {
        /// Machine-readable error type reported by the agent.
        error_type: String,
        /// Human-readable message reported by the agent.
        message: String,
    },

    /// The caller cancelled the operation.
    #[error("Cancelled")]
    Cancelled,

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConduitError`].
pub type ConduitResult<T> = Result<T, ConduitError>;

/// Serializable taxonomy tag for a [`ConduitError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// [`ConduitError::Connection`].
    Connection,
    /// [`ConduitError::Timeout`].
    Timeout,
    /// [`ConduitError::CircuitOpen`].
    CircuitOpen,
    /// Malformed payloads and JSON errors.
    Validation,
    /// [`ConduitError::Agent`].
    Agent,
    /// [`ConduitError::Cancelled`].
    Cancelled,
    /// Config and I/O errors inside the layer itself.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::CircuitOpen => write!(f, "circuit_open"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Agent => write!(f, "agent"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl ConduitError {
    /// Taxonomy tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConduitError::Connection(_) => ErrorKind::Connection,
            ConduitError::Timeout(_) => ErrorKind::Timeout,
            ConduitError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ConduitError::Validation(_) | ConduitError::Json(_) => ErrorKind::Validation,
            ConduitError::Agent { .. } => ErrorKind::Agent,
            ConduitError::Cancelled => ErrorKind::Cancelled,
            ConduitError::Config(_) | ConduitError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry with backoff may succeed.
    ///
    /// Only transport-level failures qualify. Circuit-open errors are handled
    /// by transport fallback, never by waiting on the same path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConduitError::Connection(_) | ConduitError::Timeout(_))
    }

    /// Whether the error should make the hybrid adapter try the other transport.
    pub fn is_transport_unavailable(&self) -> bool {
        matches!(
            self,
            ConduitError::Connection(_) | ConduitError::CircuitOpen { .. }
        )
    }

    /// Build an agent error from the machine-readable body an agent returned.
    pub fn from_agent_body(body: AgentErrorBody) -> Self {
        if body.error_type.eq_ignore_ascii_case("validation") {
            ConduitError::Validation(body.message)
        } else {
            ConduitError::Agent {
                error_type: body.error_type,
                message: body.message,
            }
        }
    }
}
