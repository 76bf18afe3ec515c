use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{CompletionRequest, CompletionResponse, Message, Role};
use crate::util::http;

use super::{decode_body, error_for_status, LlmProvider, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Keeps the key out of the request URL.
const API_KEY_HEADER: &str = "x-goog-api-key";

const DEFAULT_TOP_P: f64 = 0.95;
const DEFAULT_TOP_K: u32 = 40;

/// Google Gemini API provider.
pub struct GeminiProvider {
    name: String,
    api_base: String,
    default_model: String,
}

impl GeminiProvider {
    pub fn new(name: String, api_base: Option<String>, default_model: String) -> Self {
        let base = api_base.unwrap_or_else(|| GEMINI_API_BASE.to_string());
        Self {
            name,
            api_base: base.trim_end_matches('/').to_string(),
            default_model,
        }
    }

    /// Normalize model name: strip "gemini/" and "models/" prefixes.
    fn normalize_model<'a>(&self, model: &'a str) -> &'a str {
        let model = model.strip_prefix("gemini/").unwrap_or(model);
        model.strip_prefix("models/").unwrap_or(model)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentBody<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    max_output_tokens: u32,
    top_p: f64,
    top_k: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Split messages into Gemini's system instruction and turn list.
fn convert_messages(messages: &[Message]) -> (Option<Content<'_>>, Vec<Content<'_>>) {
    let mut system_instruction = None;
    let mut contents = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                system_instruction = Some(Content {
                    role: None,
                    parts: vec![TextPart { text: &msg.content }],
                });
            }
            Role::User => contents.push(Content {
                role: Some("user"),
                parts: vec![TextPart { text: &msg.content }],
            }),
            Role::Assistant => contents.push(Content {
                role: Some("model"),
                parts: vec![TextPart { text: &msg.content }],
            }),
        }
    }

    (system_instruction, contents)
}

fn parse_generate_content(
    data: GenerateContentResponse,
) -> Result<(String, Option<u32>), ProviderError> {
    let tokens = data.usage_metadata.and_then(|u| u.total_token_count);

    let Some(candidate) = data.candidates.into_iter().next() else {
        let reason = data
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .map(|r| format!("No candidates in response (blocked: {r})"))
            .unwrap_or_else(|| "No candidates in response".to_string());
        return Err(ProviderError::MalformedResponse(reason));
    };

    let parts = candidate
        .content
        .map(|c| c.parts)
        .ok_or_else(|| ProviderError::MalformedResponse("No content in candidate".to_string()))?;

    let texts: Vec<String> = parts.into_iter().filter_map(|p| p.text).collect();
    if texts.is_empty() {
        return Err(ProviderError::MalformedResponse("No text parts in candidate".to_string()));
    }

    Ok((texts.concat(), tokens))
}

#[async_trait]
impl LlmProvider for GeminiProvider {
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
        let model_name = self.normalize_model(&request.model);
        let url = format!(
            "{}/models/{}:generateContent",
            self.api_base,
            urlencoding::encode(model_name)
        );

        let (system_instruction, contents) = convert_messages(&request.messages);
        let opts = &request.options;
        let body = GenerateContentBody {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: opts.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                max_output_tokens: opts.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                top_p: opts.top_p.unwrap_or(DEFAULT_TOP_P),
                top_k: opts.top_k.unwrap_or(DEFAULT_TOP_K),
            },
        };

        debug!("{} request with model {}", self.name, model_name);

        let response = http::client()
            .post(&url)
            .header(API_KEY_HEADER, api_key)
            .json(&body)
            .send()
            .await?;

        let response = error_for_status(response).await?;
        let data: GenerateContentResponse = decode_body(response).await?;
        let model = data
            .model_version
            .clone()
            .unwrap_or_else(|| model_name.to_string());
        let (content, tokens) = parse_generate_content(data)?;

        let mut out = CompletionResponse::new(content, self.name.clone(), model);
        out.token_count = tokens;
        Ok(out)
    }
}
