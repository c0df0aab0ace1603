//! 错误分类体系
//!
//! 三层：传输层（FailureKind / ProviderError / CallOutcome，可重试）、
//! 沙箱层（SandboxError，安全类错误永不重试）、编排层（AgentError）。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::retry::RetryAttempt;

/// Provider 调用失败的分类（ErrorClassifier 的输出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimit,
    ServerError,
    NetworkError,
    InvalidResponse,
    ProviderUnavailable,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::ServerError => "server_error",
            FailureKind::NetworkError => "network_error",
            FailureKind::InvalidResponse => "invalid_response",
            FailureKind::ProviderUnavailable => "provider_unavailable",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider 实现返回的错误
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// 请求本身无法构造（换 Provider 或重试都无济于事）
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// 结构化变体直接映射，其余走关键字分类
    pub fn kind(&self) -> FailureKind {
        match self {
            ProviderError::Http { status, .. } => match status {
                408 | 504 => FailureKind::Timeout,
                429 => FailureKind::RateLimit,
                401 | 403 | 404 => FailureKind::ProviderUnavailable,
                s if *s >= 500 => FailureKind::ServerError,
                _ => crate::core::ErrorClassifier::classify(&self.to_string()),
            },
            ProviderError::InvalidResponse(_) => FailureKind::InvalidResponse,
            ProviderError::Unavailable(_) => FailureKind::ProviderUnavailable,
            ProviderError::Transport(msg) => match crate::core::ErrorClassifier::classify(msg) {
                FailureKind::Unknown => FailureKind::NetworkError,
                kind => kind,
            },
            ProviderError::InvalidRequest(msg) | ProviderError::Other(msg) => {
                crate::core::ErrorClassifier::classify(msg)
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::InvalidRequest(_))
    }
}

/// 每次 Provider 调用归约成的标签结果：成功 / 可重试 / 致命
#[derive(Debug, Clone)]
pub enum CallOutcome<T> {
    Success(T),
    Retryable(FailureKind, String),
    Fatal(FailureKind, String),
}

impl<T> CallOutcome<T> {
    /// 从原始错误文本构造可重试结果（经 ErrorClassifier 分类）
    pub fn retryable_from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        CallOutcome::Retryable(crate::core::ErrorClassifier::classify(&text), text)
    }
}

impl<T> From<Result<T, ProviderError>> for CallOutcome<T> {
    fn from(result: Result<T, ProviderError>) -> Self {
        match result {
            Ok(v) => CallOutcome::Success(v),
            Err(e) if e.is_fatal() => CallOutcome::Fatal(e.kind(), e.to_string()),
            Err(e) => CallOutcome::Retryable(e.kind(), e.to_string()),
        }
    }
}

/// 沙箱操作错误；前五个为安全类，输入确定则结果确定，不重试
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("path escapes the jail root: {0}")]
    PathEscape(String),

    #[error("path is blocked: {0}")]
    BlockedPath(String),

    #[error("file extension is blocked: {0}")]
    BlockedExtension(String),

    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("deletion requires confirm=true and the exact confirmation phrase")]
    ConfirmationRequired,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{what} exceeds limit of {limit} bytes")]
    TooLarge { what: String, limit: usize },

    #[error("command timed out after {0}s")]
    CommandTimeout(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            SandboxError::PathEscape(_)
                | SandboxError::BlockedPath(_)
                | SandboxError::BlockedExtension(_)
                | SandboxError::CommandNotAllowed(_)
                | SandboxError::ConfirmationRequired
        )
    }

    /// 稳定的错误码，写入 tool-result 消息供模型自我修正
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::PathEscape(_) => "PathEscape",
            SandboxError::BlockedPath(_) => "BlockedPath",
            SandboxError::BlockedExtension(_) => "BlockedExtension",
            SandboxError::CommandNotAllowed(_) => "CommandNotAllowed",
            SandboxError::ConfirmationRequired => "ConfirmationRequired",
            SandboxError::NotFound(_) => "NotFound",
            SandboxError::TooLarge { .. } => "TooLarge",
            SandboxError::CommandTimeout(_) => "Timeout",
            SandboxError::Io(_) => "IoError",
        }
    }
}

/// 工具层错误
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("tool timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "UnknownTool",
            ToolError::InvalidArgs(_) => "InvalidArgs",
            ToolError::Timeout(_) => "Timeout",
            ToolError::Sandbox(e) => e.code(),
        }
    }
}

/// 编排层错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 非致命：作为错误消息回灌对话
    #[error("tool directive parse error: {0}")]
    ToolParse(String),

    #[error("all providers exhausted after {} attempts: {last_error}", attempts.len())]
    AllProvidersExhausted {
        attempts: Vec<RetryAttempt>,
        last_error: String,
    },

    /// 非致命：最后一次模型输出仍作为最终回答返回
    #[error("step bound of {0} reached")]
    StepBoundExceeded(usize),

    #[error("request cancelled")]
    Cancelled,

    #[error("no providers configured")]
    NoProviders,

    #[error("conversation store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::ToolParse(_) => "ToolParseError",
            AgentError::AllProvidersExhausted { .. } => "AllProvidersExhausted",
            AgentError::StepBoundExceeded(_) => "StepBoundExceeded",
            AgentError::Cancelled => "Cancelled",
            AgentError::NoProviders => "NoProviders",
            AgentError::Store(_) => "StoreError",
            AgentError::Config(_) => "ConfigError",
        }
    }
}
