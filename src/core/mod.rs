//! 核心层：错误分类体系、错误分类器、退避策略、重试引擎

pub mod backoff;
pub mod classifier;
pub mod error;
pub mod retry;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use classifier::ErrorClassifier;
pub use error::{AgentError, CallOutcome, FailureKind, ProviderError, SandboxError, ToolError};
pub use retry::{RetryAttempt, RetryConfig, RetryEngine, RetryHook, RetryResult};
