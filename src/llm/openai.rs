//! OpenAI 兼容 Provider
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek、OpenAI、自建代理均走这里。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::ProviderError;
use crate::llm::Provider;
use crate::memory::{Message, Role};

pub struct OpenAiProvider {
    name: String,
    client: Client<OpenAIConfig>,
    model: String,
    has_key: bool,
}

impl OpenAiProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: Option<&str>,
        model: &str,
        api_key: Option<String>,
    ) -> Self {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        let has_key = api_key.is_some();
        let mut config = OpenAIConfig::new().with_api_key(api_key.unwrap_or_default());
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            name: name.into(),
            client: Client::with_config(config),
            model: model.to_string(),
            has_key,
        }
    }

    /// Tool 角色没有对应的 tool_call_id，按带前缀的 user 消息发送
    fn to_openai_messages(
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, ProviderError> {
        let invalid = |e: async_openai::error::OpenAIError| ProviderError::InvalidRequest(e.to_string());
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::Tool => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(format!("[tool result]\n{}", m.content))
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                })
            })
            .collect()
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.has_key
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::to_openai_messages(messages)?)
            .build()
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| ProviderError::Other(e.to_string()))?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                provider = %self.name,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "token usage"
            );
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("empty response from model".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_availability_requires_key() {
        let p = OpenAiProvider::new("openai", None, "gpt-4o-mini", None);
        assert!(!p.is_available().await);
        let p = OpenAiProvider::new("openai", None, "gpt-4o-mini", Some("  ".into()));
        assert!(!p.is_available().await);
        let p = OpenAiProvider::new("openai", None, "gpt-4o-mini", Some("sk-test".into()));
        assert!(p.is_available().await);
    }

    #[test]
    fn test_tool_role_maps_to_user() {
        let msgs = OpenAiProvider::to_openai_messages(&[
            Message::system("s"),
            Message::tool("listing"),
        ])
        .unwrap();
        assert!(matches!(msgs[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(msgs[1], ChatCompletionRequestMessage::User(_)));
    }
}
