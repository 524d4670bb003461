//! Error types shared by provider adapters and the chat pipeline.
//!
//! Only [`ProviderError`] values cross the pipeline boundary as hard failures.
//! Tool lookup, argument parsing and iteration-ceiling conditions are absorbed
//! into conversation content and never show up here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} is unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl ProviderError {
    pub fn unavailable(provider: &str, reason: impl Into<String>) -> Self {
        ProviderError::Unavailable {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    /// Maps a transport failure from `send()`.
    pub fn from_send(provider: &str, base_url: &str, err: reqwest::Error) -> Self {
        if err.is_connect() {
            ProviderError::Connection(format!(
                "Cannot connect to {} at {}: {}",
                provider, base_url, err
            ))
        } else if err.is_timeout() {
            ProviderError::Request("Request timed out".to_string())
        } else {
            ProviderError::Request(err.to_string())
        }
    }

    /// Maps a non-success HTTP status. `body` is the response text, if readable.
    pub fn from_status(status: reqwest::StatusCode, model: &str, body: String) -> Self {
        match status {
            reqwest::StatusCode::NOT_FOUND => ProviderError::ModelNotFound(model.to_string()),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                ProviderError::Auth("Check your API key".to_string())
            }
            _ => ProviderError::Status {
                status: status.as_u16(),
                body,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Context extraction failed: {0}")]
    Context(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// A failure that aborted a pipeline run, tagged with the stage it came from.
#[derive(Debug, Error)]
#[error("pipeline stage '{stage}' failed: {source}")]
pub struct PipelineError {
    pub stage: &'static str,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    pub fn new(stage: &'static str, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(
            self.source,
            StageError::Provider(ProviderError::Unavailable { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::unavailable("openai", "API key is not set");
        assert_eq!(err.to_string(), "openai is unavailable: API key is not set");

        let err = ProviderError::Status {
            status: 500,
            body: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Server returned status 500: boom");

        let err = ProviderError::ModelNotFound("gpt-x".to_string());
        assert_eq!(err.to_string(), "Model not found: gpt-x");
    }

    #[test]
    fn test_from_status_mapping() {
        let err = ProviderError::from_status(reqwest::StatusCode::NOT_FOUND, "m", String::new());
        assert!(matches!(err, ProviderError::ModelNotFound(ref m) if m == "m"));

        let err =
            ProviderError::from_status(reqwest::StatusCode::UNAUTHORIZED, "m", String::new());
        assert!(matches!(err, ProviderError::Auth(_)));

        let err = ProviderError::from_status(
            reqwest::StatusCode::BAD_GATEWAY,
            "m",
            "upstream".to_string(),
        );
        assert!(matches!(err, ProviderError::Status { status: 502, .. }));
    }

    #[test]
    fn test_pipeline_error_carries_stage() {
        let err = PipelineError::new(
            "llm_completion",
            ProviderError::Connection("refused".to_string()),
        );
        assert_eq!(err.stage, "llm_completion");
        assert!(err.to_string().contains("llm_completion"));
        assert!(err.to_string().contains("refused"));
        assert!(!err.is_unavailable());

        let err = PipelineError::new(
            "llm_completion",
            ProviderError::unavailable("anthropic", "disabled"),
        );
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_stage_error_from_provider_is_transparent() {
        let err: StageError = ProviderError::Parse("bad json".to_string()).into();
        assert_eq!(err.to_string(), "Parse error: bad json");
    }
}
