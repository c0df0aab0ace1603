//! 重试引擎
//!
//! 反复以当前 Provider 调用回调：失败则分类、记录 RetryAttempt、累加该 Provider 的失败计数，
//! 按切换启发式（连续次数达阈值，或累计失败达 3）换到最久未失败的其余 Provider，
//! 再按 BackoffPolicy 休眠。首次成功即停止；无论成败都返回完整尝试历史。

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{BackoffPolicy, CallOutcome, FailureKind};
use crate::llm::registry::{least_recently_failed, RegisteredProvider};
use crate::llm::Provider;

/// 累计失败达到此值即切换 Provider
pub const PROVIDER_FAILURE_LIMIT: u32 = 3;

/// 重试钩子：(attempt, provider, error)；返回 Err 或 panic 都不会中断重试
pub type RetryHook = Arc<dyn Fn(u32, &str, &str) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// 同一 Provider 上连续尝试达到此值即切换
    pub switch_threshold: u32,
    /// 单次 Provider 调用超时
    pub call_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            switch_threshold: 2,
            call_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// 单次尝试记录
#[derive(Debug, Clone, Serialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub provider: String,
    pub success: bool,
    pub retry_reason: Option<FailureKind>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// 整体结果；attempts.len() <= max_attempts
#[derive(Debug)]
pub struct RetryResult<T> {
    pub success: bool,
    pub value: Option<T>,
    pub final_provider: Option<String>,
    pub attempts: Vec<RetryAttempt>,
    pub total_duration: Duration,
    pub last_error: Option<String>,
    pub cancelled: bool,
}

pub struct RetryEngine {
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 执行带重试与 Provider 切换的调用；providers 的顺序决定首选
    pub async fn execute<T, F, Fut>(
        &self,
        providers: &[Arc<RegisteredProvider>],
        mut call: F,
        on_retry: Option<&RetryHook>,
        cancel: &CancellationToken,
    ) -> RetryResult<T>
    where
        F: FnMut(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = CallOutcome<T>>,
    {
        let start = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let switch_threshold = self.config.switch_threshold.max(1);

        let mut attempts: Vec<RetryAttempt> = Vec::new();
        let mut last_error = None;
        let mut cancelled = false;

        let Some(mut current) = providers.first().cloned() else {
            return RetryResult {
                success: false,
                value: None,
                final_provider: None,
                attempts,
                total_duration: start.elapsed(),
                last_error: Some("no providers configured".to_string()),
                cancelled,
            };
        };
        let mut consecutive = 0u32;

        for n in 1..=max_attempts {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let attempt_start = Instant::now();
            let name = current.name().to_string();
            // 可用性探测与调用共用一个超时，并同样响应取消
            let timeout = self.config.call_timeout;
            let provider = current.provider();
            let attempt_fut = async {
                if !provider.is_available().await {
                    return CallOutcome::Retryable(
                        FailureKind::ProviderUnavailable,
                        format!("provider {name} is not available"),
                    );
                }
                call(Arc::clone(&provider)).await
            };
            let raced = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout(timeout, attempt_fut) => Some(r),
            };
            let outcome = match raced {
                None => {
                    cancelled = true;
                    break;
                }
                Some(Ok(outcome)) => outcome,
                Some(Err(_)) => CallOutcome::Retryable(
                    FailureKind::Timeout,
                    format!("provider call timed out after {}s", timeout.as_secs_f64()),
                ),
            };
            let duration_ms = attempt_start.elapsed().as_millis() as u64;

            let (kind, message) = match outcome {
                CallOutcome::Success(value) => {
                    current.record_success();
                    attempts.push(RetryAttempt {
                        attempt: n,
                        provider: name.clone(),
                        success: true,
                        retry_reason: None,
                        error: None,
                        duration_ms,
                    });
                    tracing::debug!(provider = %name, attempt = n, "provider call succeeded");
                    return RetryResult {
                        success: true,
                        value: Some(value),
                        final_provider: Some(name),
                        attempts,
                        total_duration: start.elapsed(),
                        last_error,
                        cancelled,
                    };
                }
                CallOutcome::Fatal(kind, message) => {
                    current.record_failure();
                    tracing::error!(provider = %name, attempt = n, %kind, error = %message, "fatal provider failure");
                    attempts.push(RetryAttempt {
                        attempt: n,
                        provider: name,
                        success: false,
                        retry_reason: Some(kind),
                        error: Some(message.clone()),
                        duration_ms,
                    });
                    last_error = Some(message);
                    break;
                }
                CallOutcome::Retryable(kind, message) => (kind, message),
            };

            let total_failures = current.record_failure();
            consecutive += 1;
            tracing::warn!(
                provider = %name,
                attempt = n,
                max_attempts,
                %kind,
                error = %message,
                "provider call failed"
            );
            attempts.push(RetryAttempt {
                attempt: n,
                provider: name.clone(),
                success: false,
                retry_reason: Some(kind),
                error: Some(message.clone()),
                duration_ms,
            });
            last_error = Some(message.clone());

            if n == max_attempts {
                break;
            }

            if consecutive >= switch_threshold || total_failures >= PROVIDER_FAILURE_LIMIT {
                if let Some(next) = least_recently_failed(providers, &name) {
                    tracing::info!(from = %name, to = %next.name(), consecutive, total_failures, "switching provider");
                    current = next;
                    consecutive = 0;
                }
            }

            if let Some(hook) = on_retry {
                run_hook(hook, n, &name, &message);
            }

            let delay = self.config.backoff.delay(n, Some(kind));
            let slept = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            if !slept {
                cancelled = true;
                break;
            }
        }

        RetryResult {
            success: false,
            value: None,
            final_provider: Some(current.name().to_string()),
            attempts,
            total_duration: start.elapsed(),
            last_error,
            cancelled,
        }
    }
}

fn run_hook(hook: &RetryHook, attempt: u32, provider: &str, error: &str) {
    match std::panic::catch_unwind(AssertUnwindSafe(|| hook(attempt, provider, error))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(attempt, error = %e, "retry hook failed"),
        Err(_) => tracing::warn!(attempt, "retry hook panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BackoffStrategy;
    use crate::llm::{MockProvider, ProviderRegistry};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32, switch_threshold: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            switch_threshold,
            call_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                strategy: BackoffStrategy::Fixed,
                base_delay: 0.001,
                max_delay: 0.01,
                jitter: false,
                jitter_factor: 0.0,
            },
        }
    }

    fn registry(names: &[&str]) -> ProviderRegistry {
        let mut r = ProviderRegistry::new();
        for n in names {
            r.register(Arc::new(MockProvider::named(*n)));
        }
        r
    }

    #[tokio::test]
    async fn test_failover_on_rate_limit() {
        let r = registry(&["a", "b"]);
        let engine = RetryEngine::new(fast_config(5, 2));
        let result = engine
            .execute(
                &r.ordered(None),
                |p| async move {
                    if p.name() == "a" {
                        CallOutcome::retryable_from_text("rate limit exceeded")
                    } else {
                        CallOutcome::Success("ok")
                    }
                },
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.final_provider.as_deref(), Some("b"));
        assert_eq!(result.attempts[0].retry_reason, Some(FailureKind::RateLimit));
        assert_eq!(result.attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_never_exceeds_max_attempts() {
        for max in 1..=6u32 {
            let r = registry(&["a", "b"]);
            let engine = RetryEngine::new(fast_config(max, 2));
            let calls = AtomicU32::new(0);
            let result: RetryResult<()> = engine
                .execute(
                    &r.ordered(None),
                    |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { CallOutcome::retryable_from_text("502 bad gateway") }
                    },
                    None,
                    &CancellationToken::new(),
                )
                .await;
            assert!(!result.success);
            assert!(calls.load(Ordering::SeqCst) <= max);
            assert_eq!(result.attempts.len() as u32, max);
        }
    }

    #[tokio::test]
    async fn test_fatal_stops_immediately() {
        let r = registry(&["a", "b"]);
        let engine = RetryEngine::new(fast_config(5, 2));
        let result: RetryResult<()> = engine
            .execute(
                &r.ordered(None),
                |_| async { CallOutcome::Fatal(FailureKind::Unknown, "bad request".into()) },
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.last_error.as_deref(), Some("bad request"));
    }

    #[tokio::test]
    async fn test_cumulative_failures_force_switch() {
        let r = registry(&["a", "b"]);
        // a 已有 2 次历史失败：本次再失败一次即达 3
        let a = r.get("a").unwrap();
        a.record_failure();
        a.record_failure();
        let engine = RetryEngine::new(fast_config(5, 10));
        let result = engine
            .execute(
                &r.ordered(None),
                |p| async move {
                    if p.name() == "a" {
                        CallOutcome::retryable_from_text("connection reset by peer")
                    } else {
                        CallOutcome::Success(1)
                    }
                },
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.attempts[1].provider, "b");
    }

    #[tokio::test]
    async fn test_hook_failure_does_not_abort() {
        let r = registry(&["a"]);
        let engine = RetryEngine::new(fast_config(3, 2));
        let hook_calls = Arc::new(AtomicU32::new(0));
        let counter = hook_calls.clone();
        let hook: RetryHook = Arc::new(move |attempt: u32, _provider: &str, _err: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            if attempt == 1 {
                panic!("hook exploded");
            }
            anyhow::bail!("hook error")
        });
        let result: RetryResult<()> = engine
            .execute(
                &r.ordered(None),
                |_| async { CallOutcome::retryable_from_text("timeout") },
                Some(&hook),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.attempts.len(), 3);
        // 最后一次尝试后不再休眠，也不触发钩子
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop() {
        let r = registry(&["a"]);
        let engine = RetryEngine::new(fast_config(5, 2));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: RetryResult<()> = engine
            .execute(&r.ordered(None), |_| async { CallOutcome::Success(()) }, None, &cancel)
            .await;
        assert!(result.cancelled);
        assert!(result.attempts.is_empty());
    }

    struct HangingProbe;

    #[async_trait::async_trait]
    impl Provider for HangingProbe {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn is_available(&self) -> bool {
            std::future::pending::<()>().await;
            true
        }

        async fn chat(&self, _messages: &[crate::memory::Message]) -> Result<String, crate::core::ProviderError> {
            Ok("unreachable".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_availability_probe_honours_cancel_and_timeout() {
        let mut r = ProviderRegistry::new();
        r.register(Arc::new(HangingProbe));
        let calls = AtomicU32::new(0);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut config = fast_config(3, 2);
        config.call_timeout = Duration::from_secs(3600);
        let result: RetryResult<()> = RetryEngine::new(config)
            .execute(
                &r.ordered(None),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { CallOutcome::Success(()) }
                },
                None,
                &cancel,
            )
            .await;
        assert!(result.cancelled);
        assert!(result.attempts.is_empty());

        let mut config = fast_config(1, 2);
        config.call_timeout = Duration::from_millis(20);
        let result: RetryResult<()> = RetryEngine::new(config)
            .execute(
                &r.ordered(None),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { CallOutcome::Success(()) }
                },
                None,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.attempts[0].retry_reason, Some(FailureKind::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_call_timeout_is_classified() {
        let r = registry(&["a"]);
        let mut config = fast_config(1, 2);
        config.call_timeout = Duration::from_millis(20);
        let engine = RetryEngine::new(config);
        let result: RetryResult<()> = engine
            .execute(
                &r.ordered(None),
                |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    CallOutcome::Success(())
                },
                None,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.attempts[0].retry_reason, Some(FailureKind::Timeout));
    }
}
