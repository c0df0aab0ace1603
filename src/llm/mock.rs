//! Mock Provider（用于测试与离线运行，无需 API）
//!
//! - MockProvider：回显最后一条 User 消息
//! - ScriptedProvider：按脚本依次返回预设结果，并记录每次收到的消息序列

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::ProviderError;
use crate::llm::Provider;
use crate::memory::{Message, Role};

/// 回显 Provider
#[derive(Debug)]
pub struct MockProvider {
    name: String,
}

impl MockProvider {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::named("mock")
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from {}: {}", self.name, last_user))
    }
}

/// 脚本化 Provider：先消费 script，耗尽后重复 fallback
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Option<Result<String, ProviderError>>,
    available: AtomicBool,
    received: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            available: AtomicBool::new(true),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn then_ok(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()))
    }

    pub fn then_err(self, err: ProviderError) -> Self {
        self.push(Err(err))
    }

    pub fn always_ok(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(Ok(text.into()));
        self
    }

    pub fn always_err(mut self, err: ProviderError) -> Self {
        self.fallback = Some(Err(err));
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// 每次 chat 收到的完整消息序列
    pub fn received(&self) -> Vec<Vec<Message>> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.received.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn push(self, item: Result<String, ProviderError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
        self
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, ProviderError> {
        if let Ok(mut received) = self.received.lock() {
            received.push(messages.to_vec());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match (next, &self.fallback) {
            (Some(item), _) => item,
            (None, Some(fallback)) => fallback.clone(),
            (None, None) => Err(ProviderError::InvalidResponse(format!(
                "script for {} exhausted",
                self.name
            ))),
        }
    }
}
