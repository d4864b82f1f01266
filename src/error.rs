//! Error taxonomy for the agent core.
//!
//! Every failure that crosses a component boundary is a [`DbError`] with a
//! stable machine-readable kind (see [`DbError::kind`]). Tool-internal
//! failures are captured into function responses instead of propagating, so
//! the model can reason about them; everything else surfaces as an
//! [`Error`](crate::events::AgentEvent::Error) event carrying the kind.

use thiserror::Error;

/// Result type alias used throughout the core.
pub type Result<T> = std::result::Result<T, DbError>;

/// Main error type for the agent core.
#[derive(Error, Debug)]
pub enum DbError {
    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to establish a database connection
    #[error("connection failed: {0}")]
    Connect(String),

    /// Authentication or authorization failure against a database or API
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Connection string scheme not recognized by the adapter factory
    #[error("unsupported dialect: {0}")]
    UnsupportedDialect(String),

    /// Statement execution failure
    #[error("query failed: {message}")]
    Query {
        message: String,
        /// Driver-specific detail, preserved verbatim
        detail: Option<String>,
    },

    /// Transaction used in an invalid state (e.g. nested begin without savepoints)
    #[error("transaction state error: {0}")]
    TxState(String),

    /// Mutation attempted through a read-only connection
    #[error("read-only connection: {0}")]
    ReadOnly(String),

    /// Operation exceeded its deadline
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    /// Operation aborted via the abort signal
    #[error("operation cancelled")]
    Cancelled,

    /// Model emitted a tool call the core could not decode
    #[error("invalid tool call: {0}")]
    InvalidToolCall(String),

    /// Tool ran and failed
    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    /// User rejected a confirmation-gated tool call
    #[error("rejected by user: {0}")]
    RiskRejected(String),

    /// Transport-level LLM failure (network, 5xx after retries)
    #[error("LLM transport error: {0}")]
    LlmTransport(String),

    /// LLM replied with something the service could not normalize
    #[error("LLM protocol error: {0}")]
    LlmProtocol(String),

    /// 429 from the provider after retries were exhausted
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// History compression failed
    #[error("compression failed: {0}")]
    Compression(String),

    /// Invariant violation inside the core
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Stable machine-readable kind string for this error.
    ///
    /// These strings are part of the wire contract: they appear in error
    /// events and in structured function responses fed back to the model.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Connect(_) => "ConnectError",
            Self::Auth(_) => "AuthError",
            Self::UnsupportedDialect(_) => "UnsupportedDialectError",
            Self::Query { .. } => "QueryError",
            Self::TxState(_) => "TxStateError",
            Self::ReadOnly(_) => "ReadOnlyError",
            Self::Timeout(_) => "TimeoutError",
            Self::Cancelled => "CancelledError",
            Self::InvalidToolCall(_) => "InvalidToolCallError",
            Self::ToolExecution(_) => "ToolExecutionError",
            Self::RiskRejected(_) => "RiskRejectedError",
            Self::LlmTransport(_) => "LLMTransportError",
            Self::LlmProtocol(_) => "LLMProtocolError",
            Self::RateLimit(_) => "RateLimitError",
            Self::Compression(_) => "CompressionError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Create a query error with no driver detail.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            detail: None,
        }
    }

    /// Create a query error preserving the driver-level cause.
    pub fn query_with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    /// Whether this error terminates the current stream without being a failure.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Structured response body fed back to the model on tool failure.
    #[must_use]
    pub fn to_response_value(&self) -> serde_json::Value {
        let detail = match self {
            Self::Query { detail, .. } => detail.clone(),
            _ => None,
        };
        serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
                "detail": detail,
            }
        })
    }
}
