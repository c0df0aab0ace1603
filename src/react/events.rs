//! Agent 过程事件：用于流式展示思考、Provider 重试、工具调用与最终回复

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 正在请求模型（step 为已执行的工具步数）
    Thinking { step: usize, step_bound: usize },
    /// Provider 调用失败，即将重试
    ProviderRetry {
        attempt: u32,
        provider: String,
        error: String,
    },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具结果（预览，避免过长）
    ToolResult {
        tool: String,
        ok: bool,
        preview: String,
    },
    Final {
        text: String,
        provider: String,
        steps: usize,
    },
    Error { text: String },
}
