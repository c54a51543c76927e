//! OpenAI-compatible chat completions client

use super::reply::{ChatMessage, ReplyRequest, ReplyService};
use crate::{Result, RoadcastError};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Configuration for the chat completions endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiReplyConfig {
    /// API key; never written back to config files
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    pub base_url: String,

    pub model: String,

    /// Temperature for sampling
    pub temperature: f32,

    /// Maximum tokens per reply
    pub max_tokens: u32,

    pub timeout_secs: u64,
}

impl Default for OpenAiReplyConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 150,
            timeout_secs: 30,
        }
    }
}

impl OpenAiReplyConfig {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RoadcastError::MissingCredential("OPENAI_API_KEY".into()))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Build the JSON body for a chat completion
pub fn build_chat_body(config: &OpenAiReplyConfig, request: &ReplyRequest) -> serde_json::Value {
    let body = ChatRequest {
        model: &config.model,
        messages: request.messages(),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    };
    serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
}

/// Extract the reply text from a chat completion response body
pub fn parse_chat_response(body: &str) -> Result<String> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| RoadcastError::TransportFailure(format!("Malformed response: {}", e)))?;

    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| RoadcastError::EmptyResponse("No reply content in response".into()))
}

/// Map a non-success HTTP status to the crate's error taxonomy
pub(crate) fn error_for_status(status: StatusCode, body: &str) -> RoadcastError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RoadcastError::MissingCredential(format!("Service rejected the API key ({})", status))
        }
        _ => RoadcastError::TransportFailure(format!(
            "HTTP {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        )),
    }
}

pub(crate) fn transport_error(e: reqwest::Error) -> RoadcastError {
    RoadcastError::TransportFailure(e.to_string())
}

/// Reply service backed by an OpenAI-compatible endpoint
pub struct OpenAiReplyService {
    config: OpenAiReplyConfig,
    client: reqwest::Client,
}

impl OpenAiReplyService {
    pub fn new(config: OpenAiReplyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                RoadcastError::ConfigError(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self { config, client })
    }

    async fn complete(&self, request: &ReplyRequest) -> Result<String> {
        let key = self.config.key()?;
        let body = build_chat_body(&self.config, request);

        debug!(
            "POST {} ({} messages)",
            self.config.endpoint(),
            request.history.len() + 2
        );

        let response = self
            .client
            .post(self.config.endpoint())
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(error_for_status(status, &text));
        }

        parse_chat_response(&text)
    }
}

impl ReplyService for OpenAiReplyService {
    fn generate_reply<'a>(&'a self, request: &'a ReplyRequest) -> BoxFuture<'a, Result<String>> {
        self.complete(request).boxed()
    }
}
