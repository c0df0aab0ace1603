//! Provider 抽象
//!
//! 每个后端（OpenAI 兼容 / Anthropic / Mock）实现 Provider：name、is_available（懒检查）、chat（非流式）。

use async_trait::async_trait;

use crate::core::ProviderError;
use crate::memory::Message;

/// 可互换的对话后端
#[async_trait]
pub trait Provider: Send + Sync {
    /// 注册名，用于日志、偏好选择与 RetryAttempt 记录
    fn name(&self) -> &str;

    /// 是否可用（凭证齐全等）；RetryEngine 在每次使用前调用
    async fn is_available(&self) -> bool {
        true
    }

    /// 非流式完成：消息序列 -> 模型输出文本
    async fn chat(&self, messages: &[Message]) -> Result<String, ProviderError>;
}
