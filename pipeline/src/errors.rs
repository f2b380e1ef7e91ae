use hyper::StatusCode;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Errors that can occur while handling an invocation
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required destination or identifier is not configured. Fails the whole invocation.
    #[error("Missing required configuration: {0}")]
    Configuration(String),

    /// Retryable failure talking to a downstream sink.
    #[error("Sink request failed: {0}")]
    TransientSink(String),

    /// Cache or registry failure on a best-effort path.
    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to read request body: {0}")]
    RequestBody(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Status returned to the invoker when a handler fails as a whole.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::InvalidPayload(_) | PipelineError::RequestBody(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::TransientSink(_)
            | PipelineError::CollaboratorUnavailable(_)
            | PipelineError::HttpClient(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a retry of the same call may succeed. The retry loops and the batch dispatcher give
    /// up on the first error for which this is false.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientSink(_)
                | PipelineError::CollaboratorUnavailable(_)
                | PipelineError::HttpClient(_)
                | PipelineError::Io(_)
        )
    }
}

/// Outcome of delivering a notification to one subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The subscriber is no longer reachable and should be pruned from the registry.
    #[error("subscriber is gone")]
    Gone,

    #[error("delivery failed: {0}")]
    Failed(String),
}
