use std::path::PathBuf;

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Error from a single provider call with a single credential.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    /// Request URLs can carry credentials, so they never reach the message.
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Http(e.without_url())
    }
}

/// How the orchestrator should react to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rate limit or quota signal; rotate to another credential.
    ExhaustedCredential,
    /// Timeout, network error, bad status or malformed payload; try the next provider.
    Transient,
}

impl ProviderError {
    /// Classify the failure.
    ///
    /// 429, 402 and 403 responses, and any error body mentioning a quota or a
    /// limit, mean the credential is spent. Everything else is transient.
    pub fn kind(&self) -> FailureKind {
        match self {
            ProviderError::Api { status, message } => {
                let body = message.to_lowercase();
                if matches!(status, 429 | 402 | 403)
                    || body.contains("quota")
                    || body.contains("limit")
                {
                    FailureKind::ExhaustedCredential
                } else {
                    FailureKind::Transient
                }
            }
            ProviderError::Http(e) if e.status().map(|s| s.as_u16()) == Some(429) => {
                FailureKind::ExhaustedCredential
            }
            _ => FailureKind::Transient,
        }
    }

    pub fn is_exhausted_credential(&self) -> bool {
        self.kind() == FailureKind::ExhaustedCredential
    }
}

/// Terminal errors surfaced by the fallback orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("No providers available")]
    NoProvidersAvailable,

    #[error("All providers failed: {last_error}")]
    AllProvidersFailed { last_error: String },

    #[error("All keys failed: {last_error}")]
    AllKeysFailed { last_error: String },
}
