//! 命令工具：白名单与超时由沙箱的 CommandRunner 负责
//!
//! 非零退出码不算工具失败，退出码与输出一并返回给模型。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::sandbox::SandboxedExecutor;
use crate::tools::{parse_args, render, Tool};

#[derive(Debug, Deserialize)]
struct RunArgs {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

pub struct RunCommandTool {
    sandbox: Arc<SandboxedExecutor>,
    description: String,
}

impl RunCommandTool {
    pub fn new(sandbox: Arc<SandboxedExecutor>, allowed: &[String]) -> Self {
        let mut allowed = allowed.to_vec();
        allowed.sort();
        let description = format!(
            "Run a whitelisted command in the workspace (no shell, no pipes, redirection or `$`). \
             `cd <dir>` changes the working directory and `pwd` prints it. Allowed programs: {}.",
            allowed.join(", ")
        );
        Self { sandbox, description }
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Command line, e.g. \"git status\"" },
                "timeout_secs": { "type": "integer", "description": "Optional wall-clock limit" }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let args: RunArgs = parse_args(args)?;
        let output = self
            .sandbox
            .run_command(&args.command, args.timeout_secs)
            .await?;
        Ok(render(&output))
    }
}
