use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_TOKENS: u32 = 500;

const PROMPT: &str = concat!(
    "Review this website as an experienced designer would. In plain, conversational language describe: ",
    "how the layout is organised; ",
    "which colours it uses and how they feel; ",
    "how text and images are arranged; ",
    "how easy it is to navigate; ",
    "what works well and what could be improved. ",
    "Write naturally, as if explaining the design to a friend."
);

/// Returned in mock mode in place of a model call.
pub const MOCK_DESCRIPTION: &str = concat!(
    "Modern, clean design. Balanced layout with a clear visual hierarchy. ",
    "Neutral colours with accents that draw attention. ",
    "Readable typography and well-managed spacing. ",
    "Navigation is intuitive and follows common web conventions."
);

/// Used when the model answers without any text.
const EMPTY_DESCRIPTION: &str = "Analysis unavailable";

/// Turns a screenshot into design commentary.
#[async_trait]
pub trait Describe: Send + Sync {
    async fn describe(&self, image: &[u8]) -> Result<String, DescribeError>;
}

/// Client for OpenAI chat completions with image input.
pub struct OpenAiDescriber {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    mock: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiDescriber {
    /// `timeout` bounds each request end to end, so a stalled endpoint
    /// surfaces as a retryable transport error.
    pub fn new(
        api_key: Option<String>,
        model: String,
        mock: bool,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            mock,
        })
    }

    /// Point the client at an OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Describe for OpenAiDescriber {
    async fn describe(&self, image: &[u8]) -> Result<String, DescribeError> {
        if self.mock {
            return Ok(MOCK_DESCRIPTION.to_string());
        }
        let api_key = self.api_key.as_ref().ok_or(DescribeError::MissingCredential)?;

        let data_uri = format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let request_body = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": PROMPT },
                    { "type": "image_url", "image_url": { "url": data_uri, "detail": "high" } }
                ]
            }],
            "max_tokens": MAX_TOKENS
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DescribeError::Status(status));
        }

        let chat: ChatResponse = response.json().await?;
        let text = chat
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .unwrap_or_else(|| EMPTY_DESCRIPTION.to_string());

        Ok(text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DescribeError {
    #[error("OpenAI API key is not configured")]
    MissingCredential,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Description service answered {0}")]
    Status(StatusCode),
}

impl DescribeError {
    /// Worth another delivery: transport failures, rate limiting, server
    /// errors.
    pub fn is_transient(&self) -> bool {
        match self {
            DescribeError::MissingCredential => false,
            DescribeError::Http(e) => !e.is_decode(),
            DescribeError::Status(status) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
        }
    }
}
