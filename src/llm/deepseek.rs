//! DeepSeek Provider（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)

use crate::llm::OpenAiProvider;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek Provider；未指定 base_url / model 时使用官方端点与 deepseek-chat
pub fn deepseek_provider(
    name: impl Into<String>,
    base_url: Option<&str>,
    model: Option<&str>,
    api_key: Option<String>,
) -> OpenAiProvider {
    OpenAiProvider::new(
        name,
        Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)),
        model.unwrap_or(DEEPSEEK_CHAT),
        api_key,
    )
}
