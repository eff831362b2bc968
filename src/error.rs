use std::time::Duration;

use thiserror::Error;

/// Classified failure from a provider call. Kept as a plain enum (not
/// `ArbiterError`) so the dispatcher can branch on transience without
/// unwrapping the crate-wide error type.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    RateLimited { retry_after_secs: Option<u64> },
    ServerError { status: u16, body: String },
    NetworkError(String),
    AuthenticationFailed(String),
    ContextLengthExceeded { status: u16, body: String },
    StreamError(String),
    StreamInterrupted { chunks_received: usize },
    EmptyStream,
    MalformedResponse(String),
}

impl ProviderError {
    /// Transient errors are retried with backoff and never advance the
    /// workflow.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::NetworkError(_)
                | Self::StreamError(_)
                | Self::StreamInterrupted { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }

    pub fn is_context_length(&self) -> bool {
        matches!(self, Self::ContextLengthExceeded { .. })
    }

    /// Classify a non-200 HTTP response. 400s are inspected for the
    /// context-length signature so callers can trim and retry once.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 if is_context_length_body(&body) => Self::ContextLengthExceeded { status, body },
            401 | 403 => Self::AuthenticationFailed(body),
            429 => Self::RateLimited {
                retry_after_secs: extract_retry_after(&body),
            },
            500..=599 => Self::ServerError { status, body },
            _ => Self::MalformedResponse(format!("unexpected status code {}: {}", status, body)),
        }
    }

    pub fn suggested_delay(&self) -> Duration {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Duration::from_secs(*secs),
            _ => Duration::from_secs(1),
        }
    }
}

fn is_context_length_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("prompt is too long")
        || lower.contains("context window")
}

fn extract_retry_after(body: &str) -> Option<u64> {
    let lower = body.to_lowercase();
    for pattern in ["retry after ", "retry-after: ", "retry_after="] {
        if let Some(idx) = lower.find(pattern) {
            let digits: String = lower[idx + pattern.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(secs) = digits.parse() {
                return Some(secs);
            }
        }
    }
    None
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(secs) => write!(f, "rate limited, retry after {}s", secs),
                None => write!(f, "rate limited"),
            },
            Self::ServerError { status, body } => write!(f, "server error {}: {}", status, body),
            Self::NetworkError(msg) => write!(f, "network error: {}", msg),
            Self::AuthenticationFailed(msg) => write!(f, "authentication failed: {}", msg),
            Self::ContextLengthExceeded { status, .. } => {
                write!(f, "context length exceeded (status {})", status)
            }
            Self::StreamError(msg) => write!(f, "stream error: {}", msg),
            Self::StreamInterrupted { chunks_received } => {
                write!(f, "stream interrupted after {} chunks", chunks_received)
            }
            Self::EmptyStream => write!(f, "stream ended without receiving any data"),
            Self::MalformedResponse(msg) => write!(f, "malformed response: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

#[derive(Error, Debug)]
pub enum ArbiterError {
    #[error("Bead not found: {0}")]
    BeadNotFound(String),

    #[error("Workflow definition not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow validation failed: {0}")]
    WorkflowValidation(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution {execution_id} is terminal and cannot advance")]
    ExecutionTerminal { execution_id: String },

    #[error("Ambiguous transition from {node} on outcome {outcome}: {matches} edges match")]
    AmbiguousTransition {
        node: String,
        outcome: String,
        matches: usize,
    },

    #[error("No edge from {node} matches outcome {outcome}")]
    NoMatchingEdge { node: String, outcome: String },

    #[error("No agent with role {role} available for bead {bead_id}")]
    NoAgentAvailable { role: String, bead_id: String },

    #[error("No provider available for complexity {0}")]
    NoProviderAvailable(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Agent output parse failure: {0}")]
    ActionParse(String),

    #[error("Lesson store error: {0}")]
    LessonStore(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Credential store error: {0}")]
    Credentials(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ArbiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited {
            retry_after_secs: None
        }
        .is_transient());
        assert!(ProviderError::ServerError {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(ProviderError::NetworkError("reset".into()).is_transient());
        assert!(!ProviderError::AuthenticationFailed("bad key".into()).is_transient());
        assert!(!ProviderError::ContextLengthExceeded {
            status: 400,
            body: String::new()
        }
        .is_transient());
    }

    #[test]
    fn test_context_length_detection() {
        let err = ProviderError::from_status(
            400,
            r#"{"error":{"code":"context_length_exceeded"}}"#.to_string(),
        );
        assert!(err.is_context_length());

        let err = ProviderError::from_status(400, "bad request".to_string());
        assert!(!err.is_context_length());
    }

    #[test]
    fn test_auth_and_server_classification() {
        assert!(ProviderError::from_status(401, "invalid key".into()).is_auth());
        assert!(ProviderError::from_status(503, "unavailable".into()).is_transient());
    }

    #[test]
    fn test_retry_after_extraction() {
        let err = ProviderError::from_status(429, "rate limited, retry after 30 seconds".into());
        assert_eq!(err.suggested_delay(), Duration::from_secs(30));
    }
}
