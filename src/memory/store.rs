//! 对话存储抽象
//!
//! ConversationStore 与编排器解耦：测试用 InMemoryStore，生产可换 JsonFileStore 等持久实现。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::memory::Message;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 加载某身份的完整对话；不存在时返回空
    async fn load(&self, identity: &str) -> anyhow::Result<Vec<Message>>;

    /// 按顺序追加消息
    async fn append(&self, identity: &str, messages: &[Message]) -> anyhow::Result<()>;
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load(&self, identity: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .conversations
            .read()
            .await
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, identity: &str, messages: &[Message]) -> anyhow::Result<()> {
        self.conversations
            .write()
            .await
            .entry(identity.to_string())
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_append_preserves_order() {
        let store = InMemoryStore::new();
        store
            .append("alice", &[Message::user("1"), Message::assistant("2")])
            .await
            .unwrap();
        store.append("alice", &[Message::tool("3")]).await.unwrap();
        let msgs = store.load("alice").await.unwrap();
        let contents: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["1", "2", "3"]);
        assert!(store.load("bob").await.unwrap().is_empty());
    }
}
