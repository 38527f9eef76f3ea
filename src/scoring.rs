use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::data_models::VerdictScale;
use crate::error::ScoringError;

pub const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20240620";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl ImageAttachment {
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            media_type: "image/png".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoringRequest {
    pub instruction: String,
    pub body_text: Option<String>,
    pub image: Option<ImageAttachment>,
}

/// Returns the raw verdict token; parsing it against the scale is the caller's job.
#[async_trait]
pub trait ScoringClient: Send + Sync {
    async fn score(&self, request: ScoringRequest) -> Result<String, ScoringError>;
}

/// Fixed instruction wording, filled with the query and the answer format.
#[derive(Debug, Clone)]
pub struct InstructionTemplate {
    query: String,
    scale: VerdictScale,
}

impl InstructionTemplate {
    pub fn new(query: impl Into<String>, scale: VerdictScale) -> Self {
        Self {
            query: query.into(),
            scale,
        }
    }

    pub fn scale(&self) -> &VerdictScale {
        &self.scale
    }

    /// Wording follows what is actually attached, which may be less than the mode asked for.
    pub fn render(&self, has_text: bool, has_image: bool) -> String {
        let attached = match (has_text, has_image) {
            (true, true) => {
                "Attached to this message is a screenshot of an article, followed by the extracted text of the same article."
            }
            (false, true) => "Attached to this message is a screenshot of an article.",
            _ => "Attached to this message is the extracted text of an article.",
        };
        format!(
            "{attached} Your task is to evaluate the relevance of the attached article to the prompt: '{query}'. {answer}\n\nHow relevant is the article to the prompt?",
            query = self.query,
            answer = self.scale.describe()
        )
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: ANTHROPIC_MESSAGES_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 64,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Scores through the Anthropic Messages API.
pub struct AnthropicScorer {
    config: AnthropicConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

impl AnthropicScorer {
    pub fn new(config: AnthropicConfig) -> Result<Self, ScoringError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ScoringError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn build_content(request: ScoringRequest) -> Vec<ContentBlock> {
        let mut content = vec![ContentBlock::Text {
            text: request.instruction,
        }];
        if let Some(image) = request.image {
            content.push(ContentBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: image.media_type,
                    data: BASE64.encode(image.data),
                },
            });
        }
        if let Some(body) = request.body_text {
            content.push(ContentBlock::Text { text: body });
        }
        content
    }
}

#[async_trait]
impl ScoringClient for AnthropicScorer {
    async fn score(&self, request: ScoringRequest) -> Result<String, ScoringError> {
        if request.body_text.is_none() && request.image.is_none() {
            return Err(ScoringError::EmptyRequest);
        }

        let payload = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            messages: vec![Message {
                role: "user",
                content: Self::build_content(request),
            }],
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ScoringError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScoringError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ScoringError::Malformed(e.to_string()))?;

        // Only the first block is considered.
        let first = parsed
            .content
            .into_iter()
            .next()
            .ok_or_else(|| ScoringError::Malformed("response has no content blocks".to_string()))?;
        if first.kind != "text" {
            return Err(ScoringError::Malformed(format!(
                "first content block is {:?}, not text",
                first.kind
            )));
        }
        first
            .text
            .ok_or_else(|| ScoringError::Malformed("text block without text".to_string()))
    }
}
