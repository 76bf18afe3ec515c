pub mod fal;
pub mod gemini;
pub mod openai_compat;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ProviderKind, ProviderSettings};
use crate::error::ProviderError;
use crate::types::{CompletionRequest, CompletionResponse, ImageResponse};
use crate::util::truncate_string;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Longest vendor error body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

/// A chat completion vendor. One call, one credential; rotation and fallback
/// live in the orchestrator.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name used in responses and logs.
    fn name(&self) -> &str;

    /// Model used when the requested one belongs to another vendor.
    fn default_model(&self) -> &str;

    /// Send a chat completion request with the given key.
    async fn chat(
        &self,
        api_key: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;
}

/// An image generation vendor.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn generate_image(
        &self,
        api_key: &str,
        prompt: &str,
        width: u32,
        height: u32,
    ) -> Result<ImageResponse, ProviderError>;
}

/// Build the chat client for a provider entry. Image-only kinds yield `None`.
pub fn create_provider(settings: &ProviderSettings) -> Option<Arc<dyn LlmProvider>> {
    match settings.kind {
        ProviderKind::OpenAiCompat => Some(Arc::new(openai_compat::OpenAiCompatProvider::new(
            settings.name.clone(),
            settings.api_base.clone(),
            settings.default_model.clone(),
        ))),
        ProviderKind::Gemini => Some(Arc::new(gemini::GeminiProvider::new(
            settings.name.clone(),
            settings.api_base.clone(),
            settings.default_model.clone(),
        ))),
        ProviderKind::Fal => None,
    }
}

/// Build the image client for a provider entry. Chat-only kinds yield `None`.
pub fn create_image_provider(settings: &ProviderSettings) -> Option<Arc<dyn ImageProvider>> {
    match settings.kind {
        ProviderKind::Fal => Some(Arc::new(fal::FalProvider::new(
            settings.name.clone(),
            settings.api_base.clone(),
            settings.default_model.clone(),
        ))),
        ProviderKind::OpenAiCompat | ProviderKind::Gemini => None,
    }
}

/// Pick the model to send to a provider.
///
/// A Gemini model only makes sense on Gemini and vice versa; when falling back
/// across vendors the provider's own default is used instead.
pub fn model_for_provider(kind: ProviderKind, default_model: &str, requested: &str) -> String {
    let requested_is_gemini = requested.to_lowercase().contains("gemini");
    let same_family = match kind {
        ProviderKind::Gemini => requested_is_gemini,
        ProviderKind::OpenAiCompat => !requested_is_gemini,
        ProviderKind::Fal => requested.starts_with("fal-ai/"),
    };
    if requested.is_empty() || !same_family {
        default_model.to_string()
    } else {
        requested.to_string()
    }
}

/// Turn a non-2xx response into `ProviderError::Api`, keeping the body so
/// quota messages can be recognised.
pub(crate) async fn error_for_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        message: truncate_string(&text, MAX_ERROR_BODY, "..."),
    })
}

/// Read the body and decode it into the vendor's typed schema.
pub(crate) async fn decode_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| ProviderError::MalformedResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_for_provider_same_family() {
        assert_eq!(
            model_for_provider(ProviderKind::Gemini, "gemini-2.0-flash", "gemini-1.5-pro"),
            "gemini-1.5-pro"
        );
        assert_eq!(
            model_for_provider(ProviderKind::OpenAiCompat, "gpt-4o-mini", "deepseek-r1"),
            "deepseek-r1"
        );
    }

    #[test]
    fn test_model_for_provider_cross_family() {
        assert_eq!(
            model_for_provider(ProviderKind::Gemini, "gemini-2.0-flash", "gpt-4o-mini"),
            "gemini-2.0-flash"
        );
        assert_eq!(
            model_for_provider(ProviderKind::OpenAiCompat, "gpt-4o-mini", "gemini-2.0-flash"),
            "gpt-4o-mini"
        );
        assert_eq!(
            model_for_provider(ProviderKind::OpenAiCompat, "gpt-4o-mini", ""),
            "gpt-4o-mini"
        );
    }

    #[test]
    fn test_create_provider_by_kind() {
        let chat = ProviderSettings::new("llm7", ProviderKind::OpenAiCompat, "gpt-4o-mini", 1);
        let image = ProviderSettings::new("fal", ProviderKind::Fal, "fal-ai/flux/schnell", 1);
        assert_eq!(create_provider(&chat).unwrap().name(), "llm7");
        assert!(create_provider(&image).is_none());
        assert_eq!(create_image_provider(&image).unwrap().default_model(), "fal-ai/flux/schnell");
        assert!(create_image_provider(&chat).is_none());
    }
}
