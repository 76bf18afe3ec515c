use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::types::ImageResponse;
use crate::util::http;

use super::{decode_body, error_for_status, ImageProvider};

pub const FAL_API_BASE: &str = "https://fal.run";

/// fal.ai synchronous image generation.
pub struct FalProvider {
    name: String,
    api_base: String,
    default_model: String,
}

impl FalProvider {
    pub fn new(name: String, api_base: Option<String>, default_model: String) -> Self {
        let base = api_base.unwrap_or_else(|| FAL_API_BASE.to_string());
        Self {
            name,
            api_base: base.trim_end_matches('/').to_string(),
            default_model,
        }
    }
}

#[derive(Debug, Serialize)]
struct ImageBody<'a> {
    prompt: &'a str,
    image_size: ImageSize,
    num_images: u32,
}

#[derive(Debug, Serialize)]
struct ImageSize {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct ImageResult {
    #[serde(default)]
    images: Vec<GeneratedImage>,
}

#[derive(Debug, Deserialize)]
struct GeneratedImage {
    url: Option<String>,
}

fn first_image_url(data: ImageResult) -> Result<String, ProviderError> {
    data.images
        .into_iter()
        .find_map(|i| i.url.filter(|u| !u.is_empty()))
        .ok_or_else(|| ProviderError::MalformedResponse("No image url in response".to_string()))
}

#[async_trait]
impl ImageProvider for FalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate_image(
        &self,
        api_key: &str,
        prompt: &str,
        width: u32,
        height: u32,
    ) -> Result<ImageResponse, ProviderError> {
        let url = format!("{}/{}", self.api_base, self.default_model);
        let body = ImageBody {
            prompt,
            image_size: ImageSize { width, height },
            num_images: 1,
        };

        debug!("{} image request to {} ({}x{})", self.name, url, width, height);

        let response = http::client()
            .post(&url)
            .header("Authorization", format!("Key {api_key}"))
            .json(&body)
            .send()
            .await?;

        let response = error_for_status(response).await?;
        let data: ImageResult = decode_body(response).await?;

        Ok(ImageResponse {
            url: first_image_url(data)?,
            model: self.default_model.clone(),
            provider: self.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_image_url() {
        let data: ImageResult = serde_json::from_str(
            r#"{"images":[{"url":"https://fal.media/a.png","width":512,"height":512}],"seed":1}"#,
        )
        .unwrap();
        assert_eq!(first_image_url(data).unwrap(), "https://fal.media/a.png");
    }

    #[test]
    fn test_missing_images_is_malformed() {
        let data: ImageResult = serde_json::from_str(r#"{"detail":"ok"}"#).unwrap();
        assert!(matches!(
            first_image_url(data),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_body_shape() {
        let body = ImageBody {
            prompt: "a cat",
            image_size: ImageSize { width: 512, height: 768 },
            num_images: 1,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["image_size"]["height"], 768);
        assert_eq!(value["num_images"], 1);
    }
}
