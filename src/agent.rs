//! 对话编排器
//!
//! ChatOrchestrator 显式持有 ProviderRegistry、RetryEngine、沙箱工具与对话存储，
//! 由调用方构造一次后共享（不依赖全局单例）。同一身份的并发请求经 per-identity 锁串行化。
//! from_config 按配置组装全部组件。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ProviderKind, ProviderSection};
use crate::core::{AgentError, RetryAttempt, RetryEngine};
use crate::llm::{
    deepseek_provider, AnthropicProvider, MockProvider, OpenAiProvider, Provider, ProviderHealth,
    ProviderRegistry,
};
use crate::memory::{ConversationStore, InMemoryStore, JsonFileStore};
use crate::react::{agent_loop, build_system_prompt, AgentEvent, AgentSession, DEFAULT_STEP_BOUND};
use crate::sandbox::{SandboxedExecutor, CURRENT_IDENTITY};
use crate::tools::{sandbox_tools, ToolExecutor};

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-latest";

/// 单次 chat 的可选参数
#[derive(Default, Clone)]
pub struct ChatOptions {
    /// 覆盖默认系统提示词（工具清单仍会附加）
    pub system_prompt_override: Option<String>,
    /// 优先尝试的 Provider
    pub preferred_provider: Option<String>,
    pub cancel_token: CancellationToken,
    pub event_tx: Option<UnboundedSender<AgentEvent>>,
}

impl ChatOptions {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt_override = Some(prompt.into());
        self
    }

    pub fn with_preferred_provider(mut self, provider: impl Into<String>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// 成功的 chat 结果
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub text: String,
    pub provider: String,
    pub steps: usize,
    /// 因步数上限结束（text 为最后一次模型输出）
    pub bound_reached: bool,
}

/// 面向路由层的线上结构：`{success, response_text, provider_used, steps_taken}` 或 `{success:false, error}`
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps_taken: Option<usize>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub step_bound_reached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    /// 仅在 AllProvidersExhausted 时携带
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<RetryAttempt>,
}

impl From<Result<ChatReply, AgentError>> for ChatOutcome {
    fn from(result: Result<ChatReply, AgentError>) -> Self {
        match result {
            Ok(reply) => ChatOutcome {
                success: true,
                response_text: Some(reply.text),
                provider_used: Some(reply.provider),
                steps_taken: Some(reply.steps),
                step_bound_reached: reply.bound_reached,
                error: None,
                error_code: None,
                attempts: Vec::new(),
            },
            Err(e) => {
                let error_code = Some(e.code());
                let error = Some(e.to_string());
                let attempts = match e {
                    AgentError::AllProvidersExhausted { attempts, .. } => attempts,
                    _ => Vec::new(),
                };
                ChatOutcome {
                    success: false,
                    response_text: None,
                    provider_used: None,
                    steps_taken: None,
                    step_bound_reached: false,
                    error,
                    error_code,
                    attempts,
                }
            }
        }
    }
}

pub struct ChatOrchestrator {
    registry: ProviderRegistry,
    engine: RetryEngine,
    sandbox: Arc<SandboxedExecutor>,
    tools: ToolExecutor,
    store: Arc<dyn ConversationStore>,
    system_prompt: String,
    step_bound: usize,
    identity_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatOrchestrator {
    /// 显式构造；工具由沙箱派生
    pub fn new(
        registry: ProviderRegistry,
        engine: RetryEngine,
        sandbox: Arc<SandboxedExecutor>,
        allowed_programs: &[String],
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let tools = sandbox_tools(Arc::clone(&sandbox), allowed_programs);
        Self {
            registry,
            engine,
            sandbox,
            tools,
            store,
            system_prompt: crate::config::AgentSection::default().system_prompt,
            step_bound: DEFAULT_STEP_BOUND,
            identity_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_step_bound(mut self, step_bound: usize) -> Self {
        self.step_bound = step_bound;
        self
    }

    /// 按配置组装：Provider（按 priority 稳定排序）、沙箱、对话存储、重试引擎
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        cfg.retry
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;
        let registry = build_registry(&cfg.providers)?;
        let sandbox = SandboxedExecutor::new(&cfg.sandbox)
            .map_err(|e| AgentError::Config(format!("sandbox: {e}")))?;
        let store: Arc<dyn ConversationStore> = match &cfg.agent.conversation_dir {
            Some(dir) => Arc::new(JsonFileStore::new(dir)),
            None => Arc::new(InMemoryStore::new()),
        };
        let allowed: Vec<String> = cfg.sandbox.allowed_commands.keys().cloned().collect();
        Ok(Self::new(
            registry,
            RetryEngine::new(cfg.retry.to_retry_config()),
            Arc::new(sandbox),
            &allowed,
            store,
        )
        .with_system_prompt(cfg.agent.system_prompt.clone())
        .with_step_bound(cfg.agent.step_bound))
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn sandbox(&self) -> &Arc<SandboxedExecutor> {
        &self.sandbox
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        self.registry.health()
    }

    fn identity_lock(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.identity_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(identity.to_string()).or_default())
    }

    /// 无人等待时移除该身份的锁
    fn release_identity(&self, identity: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.identity_locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(identity);
        }
    }

    /// 处理一条用户消息；失败时本次已产生的对话修改仍会写入存储，便于调用方续接
    pub async fn chat(
        &self,
        identity: &str,
        message: &str,
        options: ChatOptions,
    ) -> Result<ChatReply, AgentError> {
        let lock = self.identity_lock(identity);
        let result = {
            let guard = tokio::select! {
                biased;
                _ = options.cancel_token.cancelled() => None,
                g = lock.lock() => Some(g),
            };
            match guard {
                Some(_guard) => self.chat_locked(identity, message, &options).await,
                None => Err(AgentError::Cancelled),
            }
        };
        self.release_identity(identity, lock);
        result
    }

    /// chat 并转为线上结构
    pub async fn chat_outcome(&self, identity: &str, message: &str, options: ChatOptions) -> ChatOutcome {
        self.chat(identity, message, options).await.into()
    }

    async fn chat_locked(
        &self,
        identity: &str,
        message: &str,
        options: &ChatOptions,
    ) -> Result<ChatReply, AgentError> {
        let mut conversation = self
            .store
            .load(identity)
            .await
            .map_err(|e| AgentError::Store(e.to_string()))?;
        let prior = conversation.len();

        let base = options
            .system_prompt_override
            .as_deref()
            .unwrap_or(&self.system_prompt);
        let system = build_system_prompt(base, self.tools.registry());

        let mut session = AgentSession::new(
            &self.registry,
            &self.engine,
            &self.tools,
            options.cancel_token.clone(),
        )
        .with_step_bound(self.step_bound)
        .with_preferred_provider(options.preferred_provider.as_deref());
        if let Some(tx) = &options.event_tx {
            session = session.with_event_tx(tx);
        }

        tracing::info!(identity = %identity, history = prior, "chat request");
        // 命令工作目录按身份隔离
        let result = CURRENT_IDENTITY
            .scope(
                identity.to_string(),
                agent_loop(&session, &system, &mut conversation, message),
            )
            .await;

        let appended = self
            .store
            .append(identity, &conversation[prior..])
            .await
            .map_err(|e| AgentError::Store(e.to_string()));

        match (result, appended) {
            (Ok(outcome), Ok(())) => {
                tracing::info!(
                    identity = %identity,
                    provider = %outcome.provider,
                    steps = outcome.steps,
                    bound_reached = outcome.bound_reached,
                    "chat finished"
                );
                Ok(ChatReply {
                    text: outcome.text,
                    provider: outcome.provider,
                    steps: outcome.steps,
                    bound_reached: outcome.bound_reached,
                })
            }
            (Ok(_), Err(store_err)) => Err(store_err),
            (Err(e), appended) => {
                if let Err(store_err) = appended {
                    tracing::error!(identity = %identity, error = %store_err, "failed to persist partial conversation");
                }
                tracing::warn!(identity = %identity, error = %e, "chat failed");
                Err(e)
            }
        }
    }
}

/// 按配置构建 Provider 注册表；priority 存在时稳定排序（未设置者排在其后，保持声明顺序）
pub fn build_registry(sections: &[ProviderSection]) -> Result<ProviderRegistry, AgentError> {
    let mut ordered: Vec<&ProviderSection> = sections.iter().collect();
    ordered.sort_by_key(|s| s.priority.unwrap_or(u32::MAX));

    let mut registry = ProviderRegistry::new();
    for section in ordered {
        let name = section.display_name();
        if registry.get(&name).is_some() {
            return Err(AgentError::Config(format!("duplicate provider name: {name}")));
        }
        let provider: Arc<dyn Provider> = match section.kind {
            ProviderKind::Openai => Arc::new(OpenAiProvider::new(
                name,
                section.base_url.as_deref(),
                section.model.as_deref().unwrap_or(DEFAULT_OPENAI_MODEL),
                section.resolve_api_key(),
            )),
            ProviderKind::Deepseek => Arc::new(deepseek_provider(
                name,
                section.base_url.as_deref(),
                section.model.as_deref(),
                section.resolve_api_key(),
            )),
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
                name,
                section.base_url.as_deref(),
                section.model.as_deref().unwrap_or(DEFAULT_ANTHROPIC_MODEL),
                section.resolve_api_key(),
            )),
            ProviderKind::Mock => Arc::new(MockProvider::named(name)),
        };
        registry.register(provider);
    }

    if registry.is_empty() {
        tracing::warn!("no providers configured, falling back to the mock provider");
        registry.register(Arc::new(MockProvider::default()));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(kind: ProviderKind, name: &str, priority: Option<u32>) -> ProviderSection {
        ProviderSection {
            kind,
            name: Some(name.to_string()),
            model: None,
            base_url: None,
            api_key: Some("sk-test".to_string()),
            api_key_env: None,
            priority,
        }
    }

    #[test]
    fn test_registry_priority_is_stable() {
        let registry = build_registry(&[
            section(ProviderKind::Mock, "first", None),
            section(ProviderKind::Deepseek, "ds", Some(1)),
            section(ProviderKind::Mock, "second", None),
            section(ProviderKind::Openai, "oa", Some(0)),
        ])
        .unwrap();
        assert_eq!(registry.names(), vec!["oa", "ds", "first", "second"]);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let err = build_registry(&[
            section(ProviderKind::Mock, "same", None),
            section(ProviderKind::Anthropic, "same", None),
        ]);
        assert!(matches!(err, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_empty_config_falls_back_to_mock() {
        let registry = build_registry(&[]).unwrap();
        assert_eq!(registry.names(), vec!["mock"]);
    }

    #[test]
    fn test_outcome_shapes() {
        let ok: ChatOutcome = Ok(ChatReply {
            text: "hi".into(),
            provider: "a".into(),
            steps: 2,
            bound_reached: false,
        })
        .into();
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["response_text"], "hi");
        assert_eq!(v["provider_used"], "a");
        assert_eq!(v["steps_taken"], 2);
        assert!(v.get("error").is_none());

        let err: ChatOutcome = Err(AgentError::AllProvidersExhausted {
            attempts: vec![RetryAttempt {
                attempt: 1,
                provider: "a".into(),
                success: false,
                retry_reason: Some(crate::core::FailureKind::RateLimit),
                error: Some("rate limit".into()),
                duration_ms: 3,
            }],
            last_error: "rate limit".into(),
        })
        .into();
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error_code"], "AllProvidersExhausted");
        assert_eq!(v["attempts"][0]["retry_reason"], "rate_limit");
        assert!(v.get("response_text").is_none());
    }

    #[test]
    fn test_from_config_rejects_invalid_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.sandbox.jail_root = dir.path().join("ws");
        cfg.retry.max_delay_secs = -1.0;
        assert!(matches!(
            ChatOrchestrator::from_config(&cfg),
            Err(AgentError::Config(_))
        ));
    }
}
