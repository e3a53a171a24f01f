use thiserror::Error;

/// Typed errors produced by the translator and the Converse driver.
///
/// Only the HTTP layer turns these into status codes and OpenAI-shaped error
/// bodies; everything below it propagates `ServiceError` with `?`.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed or unsupported request content. Surfaces as 400.
    #[error("{0}")]
    InvalidRequest(String),

    /// Request omitted the model and no default is configured. Surfaces as 400.
    #[error("model is required")]
    ModelRequired,

    /// No upstream client has been configured yet. Surfaces as 503.
    #[error("bedrock client is not configured")]
    ClientNotConfigured,

    /// Upstream Converse/ConverseStream failure. Surfaces as 502, or as an
    /// in-band error event once an SSE body is open.
    #[error("{0}")]
    Upstream(String),

    /// The SSE channel to the client is gone; terminates the stream loop.
    #[error("stream write failed: client disconnected")]
    StreamClosed,
}

impl ServiceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ServiceError::InvalidRequest(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        ServiceError::Upstream(message.into())
    }
}
