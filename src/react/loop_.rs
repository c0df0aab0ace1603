//! Agent 主循环
//!
//! AWAIT_MODEL -> (TOOL_REQUESTED -> TOOL_EXECUTED -> AWAIT_MODEL)* -> DONE
//!
//! 每轮：system + 对话 -> RetryEngine（可选首选 Provider）-> 解析至多一个工具指令 ->
//! 执行并把模型原文与工具结果追加到对话 -> 下一轮；无指令或达到步数上限即结束。
//! 对话的修改在失败时保留（由调用方决定是否持久化）。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, CallOutcome, RetryEngine, RetryHook, ToolError};
use crate::llm::ProviderRegistry;
use crate::memory::Message;
use crate::react::{parse_tool_call, AgentEvent, TOOL_CLOSE, TOOL_OPEN};
use crate::tools::{ToolExecutor, ToolRegistry};

/// 单次请求默认的工具步数上限
pub const DEFAULT_STEP_BOUND: usize = 5;
/// ToolResult 事件预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 循环结束时的结果
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// 最后一次模型输出
    pub text: String,
    pub provider: String,
    /// 计入上限的步数（工具执行 + 解析错误回灌）
    pub steps: usize,
    pub bound_reached: bool,
}

/// Agent 会话配置
pub struct AgentSession<'a> {
    pub registry: &'a ProviderRegistry,
    pub engine: &'a RetryEngine,
    pub tools: &'a ToolExecutor,
    pub cancel_token: CancellationToken,
    pub step_bound: usize,
    /// 可选：优先尝试的 Provider
    pub preferred_provider: Option<&'a str>,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a UnboundedSender<AgentEvent>>,
}

impl<'a> AgentSession<'a> {
    pub fn new(
        registry: &'a ProviderRegistry,
        engine: &'a RetryEngine,
        tools: &'a ToolExecutor,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            engine,
            tools,
            cancel_token,
            step_bound: DEFAULT_STEP_BOUND,
            preferred_provider: None,
            event_tx: None,
        }
    }

    pub fn with_step_bound(mut self, step_bound: usize) -> Self {
        self.step_bound = step_bound;
        self
    }

    pub fn with_preferred_provider(mut self, provider: Option<&'a str>) -> Self {
        self.preferred_provider = provider;
        self
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn send_event(&self, ev: AgentEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(ev);
        }
    }

    /// 把 Provider 重试转发为 ProviderRetry 事件
    fn retry_hook(&self) -> Option<RetryHook> {
        let tx = self.event_tx?.clone();
        let hook: RetryHook = Arc::new(move |attempt: u32, provider: &str, error: &str| {
            tx.send(AgentEvent::ProviderRetry {
                attempt,
                provider: provider.to_string(),
                error: error.to_string(),
            })
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
        });
        Some(hook)
    }
}

/// 系统提示词：基础提示 + 工具清单 + 指令格式
pub fn build_system_prompt(base: &str, tools: &ToolRegistry) -> String {
    format!(
        "{base}\n\n\
         You can act on the workspace with these tools:\n{tools}\n\
         To call a tool, include exactly one block in your reply:\n\
         {TOOL_OPEN}{{\"name\": \"<tool>\", \"args\": {{...}}}}{TOOL_CLOSE}\n\
         The tool result arrives in the next message. Reply without a {TOOL_OPEN} block when you are done.",
        tools = tools.prompt_section()
    )
}

/// 工具结果消息：成功给出输出，失败给出稳定错误码，便于模型自我修正
pub fn format_tool_result(tool: &str, result: &Result<String, ToolError>) -> String {
    match result {
        Ok(output) => format!("[tool_result {tool} ok]\n{output}"),
        Err(ToolError::Sandbox(e)) if e.is_security() => format!(
            "[tool_result {tool} error={}]\n{e}\nThis operation is not permitted; do not retry it unchanged.",
            e.code()
        ),
        Err(e) => format!("[tool_result {tool} error={}]\n{e}", e.code()),
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", text.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 执行 Agent 循环
///
/// conversation 为该身份的完整历史；本次请求的用户消息、模型输出与工具结果依次追加其后。
pub async fn agent_loop(
    session: &AgentSession<'_>,
    system_prompt: &str,
    conversation: &mut Vec<Message>,
    user_input: &str,
) -> Result<LoopOutcome, AgentError> {
    let cancel = &session.cancel_token;
    let hook = session.retry_hook();
    conversation.push(Message::user(user_input));

    let mut steps = 0usize;
    loop {
        if cancel.is_cancelled() {
            session.send_event(AgentEvent::Error { text: "cancelled".to_string() });
            return Err(AgentError::Cancelled);
        }

        let providers = session.registry.ordered(session.preferred_provider);
        if providers.is_empty() {
            return Err(AgentError::NoProviders);
        }

        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(Message::system(system_prompt));
        messages.extend(conversation.iter().cloned());
        let outgoing = &messages;

        session.send_event(AgentEvent::Thinking {
            step: steps,
            step_bound: session.step_bound,
        });
        let result = session
            .engine
            .execute(
                &providers,
                |provider| async move { CallOutcome::from(provider.chat(outgoing).await) },
                hook.as_ref(),
                cancel,
            )
            .await;

        if result.cancelled {
            session.send_event(AgentEvent::Error { text: "cancelled".to_string() });
            return Err(AgentError::Cancelled);
        }
        let (text, provider) = match (result.value, result.final_provider) {
            (Some(text), Some(provider)) if result.success => (text, provider),
            _ => {
                let last_error = result
                    .last_error
                    .unwrap_or_else(|| "no successful attempt".to_string());
                tracing::error!(attempts = result.attempts.len(), error = %last_error, "all providers exhausted");
                session.send_event(AgentEvent::Error { text: last_error.clone() });
                return Err(AgentError::AllProvidersExhausted {
                    attempts: result.attempts,
                    last_error,
                });
            }
        };

        let parsed = parse_tool_call(&text);
        let directive_present = !matches!(parsed, Ok(None));
        if !directive_present || steps >= session.step_bound {
            let bound_reached = directive_present;
            if bound_reached {
                tracing::warn!(
                    step_bound = session.step_bound,
                    "{}",
                    AgentError::StepBoundExceeded(session.step_bound)
                );
            }
            conversation.push(Message::assistant(text.clone()));
            session.send_event(AgentEvent::Final {
                text: text.clone(),
                provider: provider.clone(),
                steps,
            });
            return Ok(LoopOutcome {
                text,
                provider,
                steps,
                bound_reached,
            });
        }

        conversation.push(Message::assistant(text));
        steps += 1;
        match parsed {
            Ok(Some(call)) => {
                let args = call.args_value();
                tracing::info!(tool = %call.name, step = steps, provider = %provider, "tool requested");
                session.send_event(AgentEvent::ToolCall {
                    tool: call.name.clone(),
                    args: args.clone(),
                });
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    r = session.tools.execute(&call.name, args) => Some(r),
                };
                let Some(outcome) = outcome else {
                    session.send_event(AgentEvent::Error { text: "cancelled".to_string() });
                    return Err(AgentError::Cancelled);
                };
                let message = format_tool_result(&call.name, &outcome);
                session.send_event(AgentEvent::ToolResult {
                    tool: call.name,
                    ok: outcome.is_ok(),
                    preview: preview(&message),
                });
                conversation.push(Message::tool(message));
            }
            Err(e) => {
                tracing::warn!(step = steps, error = %e, "malformed tool directive");
                conversation.push(Message::tool(format!(
                    "[tool_result error=ToolParseError]\n{e}\nUse exactly one {TOOL_OPEN}{{\"name\": ..., \"args\": {{...}}}}{TOOL_CLOSE} block."
                )));
            }
            Ok(None) => {}
        }
    }
}
