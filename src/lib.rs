//! Relay - 多后端对话编排引擎
//!
//! 模块划分：
//! - **agent**: ChatOrchestrator（显式构造、per-identity 锁、Chat 契约）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、退避策略、重试引擎
//! - **llm**: Provider 抽象、注册表与实现（OpenAI 兼容 / DeepSeek / Anthropic / Mock）
//! - **memory**: 对话消息与存储（内存 / JSON Lines）
//! - **observability**: tracing 初始化
//! - **react**: 工具指令解析、过程事件、Agent 主循环
//! - **sandbox**: 路径 jail、文件操作、白名单命令、simulate 影子树
//! - **tools**: Tool trait、注册表、执行器与沙箱工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod sandbox;
pub mod tools;

pub use agent::{ChatOptions, ChatOrchestrator, ChatOutcome, ChatReply};
