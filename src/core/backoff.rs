//! 退避策略：attempt（从 1 开始）+ strategy -> 延迟
//!
//! rate_limit 失败先翻倍再封顶；开启 jitter 时在封顶后加上 `delay × factor × random()`，再次封顶。

use std::time::Duration;

use serde::Deserialize;

use crate::core::FailureKind;

/// 单次延迟的绝对上限（秒），防止未校验的配置产生溢出
const DELAY_CEILING_SECS: f64 = 86_400.0;

/// fib(1..) 预计算表；超出表长时取末项
const FIBONACCI: [u64; 20] = [
    1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610, 987, 1597, 2584, 4181, 6765,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    /// 秒
    pub base_delay: f64,
    /// 秒
    pub max_delay: f64,
    pub jitter: bool,
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: 1.0,
            max_delay: 30.0,
            jitter: true,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// 不含抖动的确定性延迟（秒）
    pub fn base_delay_secs(&self, attempt: u32, kind: Option<FailureKind>) -> f64 {
        let n = attempt.max(1);
        let raw = match self.strategy {
            BackoffStrategy::Exponential => self.base_delay * 2f64.powi((n - 1).min(62) as i32),
            BackoffStrategy::Linear => self.base_delay * n as f64,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Fibonacci => {
                let idx = (n as usize - 1).min(FIBONACCI.len() - 1);
                self.base_delay * FIBONACCI[idx] as f64
            }
        };
        let raw = if kind == Some(FailureKind::RateLimit) {
            raw * 2.0
        } else {
            raw
        };
        clamp_secs(raw.min(self.max_delay))
    }

    /// 实际延迟（秒），含抖动
    pub fn delay_secs(&self, attempt: u32, kind: Option<FailureKind>) -> f64 {
        let delay = self.base_delay_secs(attempt, kind);
        if !self.jitter || self.jitter_factor <= 0.0 {
            return delay;
        }
        let extra = delay * self.jitter_factor * rand::random::<f64>();
        clamp_secs((delay + extra).min(self.max_delay))
    }

    pub fn delay(&self, attempt: u32, kind: Option<FailureKind>) -> Duration {
        Duration::try_from_secs_f64(self.delay_secs(attempt, kind)).unwrap_or(Duration::ZERO)
    }

    /// 校验参数：延迟与抖动系数须为有限非负数
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("base_delay", self.base_delay),
            ("max_delay", self.max_delay),
            ("jitter_factor", self.jitter_factor),
        ];
        for (field, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{field} must be a finite, non-negative number (got {value})"));
            }
        }
        Ok(())
    }
}

/// NaN 视为 0，其余限制在 [0, DELAY_CEILING_SECS]
fn clamp_secs(secs: f64) -> f64 {
    if secs.is_nan() {
        0.0
    } else {
        secs.clamp(0.0, DELAY_CEILING_SECS)
    }
}
