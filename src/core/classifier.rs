//! 错误分类器：错误文本 -> FailureKind
//!
//! 大小写不敏感的关键字匹配，按固定顺序逐组检查，首个命中的组胜出。

use crate::core::FailureKind;

/// 有序关键字组；顺序即优先级
const KEYWORD_GROUPS: &[(FailureKind, &[&str])] = &[
    (
        FailureKind::Timeout,
        &["timeout", "timed out", "deadline exceeded", "408"],
    ),
    (
        FailureKind::RateLimit,
        &["rate limit", "rate_limit", "ratelimit", "too many requests", "429", "quota"],
    ),
    (
        FailureKind::ServerError,
        &[
            "internal server error",
            "server error",
            "bad gateway",
            "500",
            "502",
            "503",
            "504",
        ],
    ),
    (
        FailureKind::NetworkError,
        &[
            "connection",
            "network",
            "dns",
            "refused",
            "reset by peer",
            "unreachable",
            "broken pipe",
            "eof",
        ],
    ),
    (
        FailureKind::InvalidResponse,
        &[
            "invalid response",
            "malformed",
            "unexpected",
            "parse",
            "decode",
            "json",
            "empty response",
        ],
    ),
    (
        FailureKind::ProviderUnavailable,
        &[
            "unavailable",
            "not available",
            "not configured",
            "overloaded",
            "api key",
            "unauthorized",
            "forbidden",
            "401",
            "403",
            "model not found",
        ],
    ),
];

/// 纯函数分类器，无状态
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(text: &str) -> FailureKind {
        let lower = text.to_lowercase();
        KEYWORD_GROUPS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(kind, _)| *kind)
            .unwrap_or(FailureKind::Unknown)
    }
}
