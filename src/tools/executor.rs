//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, args) 在超时内调用 registry.execute；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::ToolError;
use crate::tools::ToolRegistry;

/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

/// 工具执行器：对每次调用施加超时
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// 执行指定工具；超时返回 ToolError::Timeout，并输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: serde_json::Value) -> Result<String, ToolError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = match timeout(self.timeout, self.registry.execute(tool_name, args)).await {
            Ok(r) => r,
            Err(_) => Err(ToolError::Timeout(tool_name.to_string())),
        };

        let (ok, outcome, code) = match &result {
            Ok(_) => (true, "ok", None),
            Err(ToolError::Sandbox(e)) if e.is_security() => (false, "denied", Some(e.code())),
            Err(ToolError::Timeout(_)) => (false, "timeout", Some("Timeout")),
            Err(e) => (false, "error", Some(e.code())),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "code": code,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        if outcome == "denied" {
            tracing::warn!(audit = %audit.to_string(), "tool");
        } else {
            tracing::info!(audit = %audit.to_string(), "tool");
        }
        result
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
