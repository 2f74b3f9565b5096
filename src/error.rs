use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The gateway-bound operations of the refinement flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Discussion,
    Synthesis,
    Evolution,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Discussion => "discussion",
            Operation::Synthesis => "synthesis",
            Operation::Evolution => "evolution",
        };
        f.write_str(name)
    }
}

/// Failures of the completion service itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("completion service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Error, Debug)]
pub enum InsightError {
    #[error("upstream {operation} call failed: {source}")]
    Upstream {
        operation: Operation,
        #[source]
        source: GatewayError,
    },

    #[error("{operation} rejected: {reason}")]
    Precondition { operation: Operation, reason: String },

    #[error("Unknown highlight: {0}")]
    UnknownHighlight(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Document store error: {0}")]
    Store(String),

    #[error("Evolution of document {document_id} with highlights [{}] failed: {source}", .highlight_ids.join(", "))]
    EvolutionFailed {
        document_id: String,
        highlight_ids: Vec<String>,
        #[source]
        source: Box<InsightError>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl InsightError {
    pub fn upstream(operation: Operation, source: GatewayError) -> Self {
        Self::Upstream { operation, source }
    }

    pub fn precondition(operation: Operation, reason: impl Into<String>) -> Self {
        Self::Precondition {
            operation,
            reason: reason.into(),
        }
    }

    /// True when the failure came from the completion service and a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { .. } => true,
            Self::EvolutionFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, InsightError>;
