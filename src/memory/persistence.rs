//! 对话持久化
//!
//! 每个身份一个 JSON Lines 文件（`<dir>/<identity>.jsonl`），只追加；每行含 role、content 与写入时间。

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::memory::{ConversationStore, Message, Role};

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredMessage {
    role: Role,
    content: String,
    at: String,
}

/// 文件持久化：目录不存在时在首次写入时创建
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// 身份名只保留字母数字与 `-` `_`，避免借身份名穿越目录
    fn path_for(&self, identity: &str) -> PathBuf {
        let safe: String = identity
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let safe = if safe.is_empty() { "_".to_string() } else { safe };
        self.dir.join(format!("{safe}.jsonl"))
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn load(&self, identity: &str) -> anyhow::Result<Vec<Message>> {
        let path = self.path_for(identity);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut messages = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let stored: StoredMessage = serde_json::from_str(line)?;
            messages.push(Message {
                role: stored.role,
                content: stored.content,
            });
        }
        Ok(messages)
    }

    async fn append(&self, identity: &str, messages: &[Message]) -> anyhow::Result<()> {
        let path = self.path_for(identity);
        let mut buf = String::new();
        let at = chrono::Utc::now().to_rfc3339();
        for m in messages {
            let stored = StoredMessage {
                role: m.role,
                content: m.content.clone(),
                at: at.clone(),
            };
            buf.push_str(&serde_json::to_string(&stored)?);
            buf.push('\n');
        }
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(buf.as_bytes())?;
            file.sync_data()?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("convs"));
        store
            .append("user-1", &[Message::user("hi"), Message::assistant("hello\nthere")])
            .await
            .unwrap();

        let reopened = JsonFileStore::new(dir.path().join("convs"));
        let msgs = reopened.load("user-1").await.unwrap();
        assert_eq!(msgs, vec![Message::user("hi"), Message::assistant("hello\nthere")]);
    }

    #[tokio::test]
    async fn test_identity_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.append("../evil", &[Message::user("x")]).await.unwrap();
        assert!(dir.path().join("___evil.jsonl").exists());
    }
}
