//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__RETRY__MAX_ATTEMPTS=3`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{BackoffPolicy, BackoffStrategy, RetryConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub retry: RetrySection,
    pub providers: Vec<ProviderSection>,
    pub sandbox: SandboxSection,
}

/// [agent] 段：步数上限、系统提示词、对话存储目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub step_bound: usize,
    pub system_prompt: String,
    /// 未设置时使用进程内存储
    pub conversation_dir: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            step_bound: 5,
            system_prompt: "You are a careful engineering assistant working inside a sandboxed workspace."
                .to_string(),
            conversation_dir: None,
        }
    }
}

/// [retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub strategy: BackoffStrategy,
    pub switch_threshold: u32,
    pub jitter: bool,
    pub jitter_factor: f64,
    pub call_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 1.0,
            max_delay_secs: 30.0,
            strategy: BackoffStrategy::Exponential,
            switch_threshold: 2,
            jitter: true,
            jitter_factor: 0.1,
            call_timeout_secs: 60,
        }
    }
}

impl RetrySection {
    /// 延迟与抖动系数须为有限非负数
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        self.to_retry_config()
            .backoff
            .validate()
            .map_err(|e| config::ConfigError::Message(format!("retry: {e}")))
    }

    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            switch_threshold: self.switch_threshold,
            call_timeout: Duration::from_secs(self.call_timeout_secs.max(1)),
            backoff: BackoffPolicy {
                strategy: self.strategy,
                base_delay: self.base_delay_secs,
                max_delay: self.max_delay_secs,
                jitter: self.jitter,
                jitter_factor: self.jitter_factor,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Deepseek,
    Anthropic,
    Mock,
}

/// [[providers]] 条目；声明顺序即注册顺序，priority 存在时按其稳定排序
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    pub kind: ProviderKind,
    pub name: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 从该环境变量读取 API Key（api_key 未设置时）
    pub api_key_env: Option<String>,
    pub priority: Option<u32>,
}

impl ProviderSection {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            match self.kind {
                ProviderKind::Openai => "openai",
                ProviderKind::Deepseek => "deepseek",
                ProviderKind::Anthropic => "anthropic",
                ProviderKind::Mock => "mock",
            }
            .to_string()
        })
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| self.api_key_env.as_ref().and_then(|v| std::env::var(v).ok()))
    }
}

/// [sandbox] 段：jail 根、影子树、屏蔽列表、大小/超时上限、命令白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub jail_root: PathBuf,
    /// simulate 模式的影子树根；未设置时为 jail 根旁的 `.<name>-shadow`
    pub shadow_root: Option<PathBuf>,
    pub simulate: bool,
    pub blocked_dirs: Vec<String>,
    pub blocked_files: Vec<String>,
    pub blocked_extensions: Vec<String>,
    pub max_read_lines: usize,
    pub max_read_bytes: usize,
    pub max_write_bytes: usize,
    pub max_list_entries: usize,
    pub max_output_bytes: usize,
    pub command_timeout_secs: u64,
    pub max_command_timeout_secs: u64,
    pub delete_confirm_phrase: String,
    /// 程序名 -> 允许的子命令；`"*"` 表示任意
    pub allowed_commands: HashMap<String, Vec<String>>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            jail_root: PathBuf::from("workspace"),
            shadow_root: None,
            simulate: false,
            blocked_dirs: default_blocked_dirs(),
            blocked_files: default_blocked_files(),
            blocked_extensions: default_blocked_extensions(),
            max_read_lines: 2000,
            max_read_bytes: 1024 * 1024,
            max_write_bytes: 1024 * 1024,
            max_list_entries: 500,
            max_output_bytes: 64 * 1024,
            command_timeout_secs: 30,
            max_command_timeout_secs: 120,
            delete_confirm_phrase: "DELETE".to_string(),
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_blocked_dirs() -> Vec<String> {
    strings(&[
        ".git",
        ".svn",
        ".hg",
        "node_modules",
        "target",
        "__pycache__",
        ".venv",
        "venv",
        ".ssh",
        ".aws",
        ".gnupg",
    ])
}

fn default_blocked_files() -> Vec<String> {
    strings(&[
        ".env",
        ".npmrc",
        ".pypirc",
        ".netrc",
        "id_rsa",
        "id_ed25519",
        "credentials.json",
    ])
}

fn default_blocked_extensions() -> Vec<String> {
    strings(&[
        ".exe", ".dll", ".so", ".dylib", ".o", ".a", ".class", ".pyc", ".bin", ".pem", ".key",
    ])
}

fn default_allowed_commands() -> HashMap<String, Vec<String>> {
    let any = || vec!["*".to_string()];
    HashMap::from([
        ("ls".to_string(), any()),
        ("cat".to_string(), any()),
        ("head".to_string(), any()),
        ("tail".to_string(), any()),
        ("wc".to_string(), any()),
        ("grep".to_string(), any()),
        ("find".to_string(), any()),
        ("echo".to_string(), any()),
        (
            "git".to_string(),
            strings(&["status", "diff", "log", "show", "branch"]),
        ),
    ])
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.retry.validate()?;
    Ok(cfg)
}
