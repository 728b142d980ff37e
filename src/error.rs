//! Error types for mailbot.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mail channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to fetch messages on channel {name}: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Model {model} not available on provider {provider}")]
    ModelNotAvailable { provider: String, model: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

impl LlmError {
    /// Whether retrying the same call later might succeed.
    ///
    /// Auth and model errors are configuration problems and stay broken
    /// until someone fixes the environment.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { .. }
            | Self::RateLimited { .. }
            | Self::InvalidResponse { .. }
            | Self::Timeout { .. } => true,
            Self::ModelNotAvailable { .. } | Self::AuthFailed { .. } => false,
        }
    }
}

/// Field extraction errors.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// The model answered, but not with a JSON object.
    #[error("Model response is not a JSON object: {raw}")]
    MalformedResponse { raw: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Per-email pipeline errors. Malformed model output is not an error here;
/// it becomes a normal outcome without properties.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}
