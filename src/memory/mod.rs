//! 记忆层：对话消息、对话存储抽象与持久化实现

pub mod conversation;
pub mod persistence;
pub mod store;

pub use conversation::{Message, Role};
pub use persistence::JsonFileStore;
pub use store::{ConversationStore, InMemoryStore};
