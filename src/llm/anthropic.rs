//! Anthropic Messages API Provider（reqwest 直连）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::ProviderError;
use crate::llm::Provider;
use crate::memory::{Message, Role};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<WireBlock>,
}

#[derive(Deserialize)]
struct WireBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

pub struct AnthropicProvider {
    name: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: Option<&str>,
        model: &str,
        api_key: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            http: reqwest::Client::new(),
        }
    }

    /// system 消息合并进顶层 system 字段；Tool 结果以 user 身份发送
    fn build_request<'a>(&'a self, messages: &'a [Message]) -> WireRequest<'a> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let wire = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| WireMessage {
                role: if m.role == Role::Assistant { "assistant" } else { "user" },
                content: m.content.as_str(),
            })
            .collect();
        WireRequest {
            model: &self.model,
            max_tokens: DEFAULT_MAX_TOKENS,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages: wire,
        }
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Transport(format!("request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::Transport(format!("connection failed: {e}"))
    } else if e.is_decode() {
        ProviderError::InvalidResponse(e.to_string())
    } else {
        ProviderError::Transport(e.to_string())
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Unavailable("api key not configured".to_string()))?;
        let body = self.build_request(messages);

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: WireResponse = response.json().await.map_err(transport_error)?;
        let text: String = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "no text content in response".to_string(),
            ));
        }
        Ok(text)
    }
}
