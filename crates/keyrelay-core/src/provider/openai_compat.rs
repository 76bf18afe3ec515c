use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{CompletionRequest, CompletionResponse, Role};
use crate::util::http;

use super::{decode_body, error_for_status, LlmProvider, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};

pub const LLM7_API_BASE: &str = "https://api.llm7.io/v1";

/// OpenAI-compatible chat completions provider.
/// Defaults to the LLM7 gateway; any OpenAI-style endpoint works through `api_base`.
pub struct OpenAiCompatProvider {
    name: String,
    api_base: String,
    default_model: String,
}

impl OpenAiCompatProvider {
    pub fn new(name: String, api_base: Option<String>, default_model: String) -> Self {
        let base = api_base.unwrap_or_else(|| LLM7_API_BASE.to_string());
        Self {
            name,
            api_base: base.trim_end_matches('/').to_string(),
            default_model,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: Option<u32>,
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn chat(
        &self,
        api_key: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.api_base);

        let body = ChatBody {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            stream: false,
            temperature: request.options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: request.options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        };

        debug!("{} request to {} with model {}", self.name, url, request.model);

        let response = http::client()
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let response = error_for_status(response).await?;
        let data: ChatCompletion = decode_body(response).await?;
        let (content, model, tokens) = parse_chat_completion(data)?;

        let mut out = CompletionResponse::new(
            content,
            self.name.clone(),
            model.unwrap_or_else(|| request.model.clone()),
        );
        out.token_count = tokens;
        Ok(out)
    }
}

fn parse_chat_completion(
    data: ChatCompletion,
) -> Result<(String, Option<String>, Option<u32>), ProviderError> {
    let choice = data
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::MalformedResponse("No choices in response".to_string()))?;

    let content = choice
        .message
        .and_then(|m| m.content)
        .ok_or_else(|| ProviderError::MalformedResponse("No message content in choice".to_string()))?;

    Ok((content, data.model, data.usage.and_then(|u| u.total_tokens)))
}
