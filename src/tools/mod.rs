//! 工具箱：Tool trait、注册表、执行器，以及基于沙箱的内置工具

pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod shell;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::sandbox::SandboxedExecutor;

pub use executor::ToolExecutor;
pub use filesystem::{DeleteFileTool, ListDirTool, ReadFileTool, WriteFileTool};
pub use registry::{Tool, ToolRegistry};
pub use shell::RunCommandTool;

/// 工具超时比命令最长超时多留的余量（秒）
const TOOL_TIMEOUT_MARGIN_SECS: u64 = 5;

/// 注册全部沙箱工具并构造执行器
pub fn sandbox_tools(sandbox: Arc<SandboxedExecutor>, allowed_programs: &[String]) -> ToolExecutor {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool::new(Arc::clone(&sandbox)));
    registry.register(WriteFileTool::new(Arc::clone(&sandbox)));
    registry.register(ListDirTool::new(Arc::clone(&sandbox)));
    registry.register(DeleteFileTool::new(Arc::clone(&sandbox)));
    registry.register(RunCommandTool::new(Arc::clone(&sandbox), allowed_programs));
    let timeout = sandbox.limits().max_command_timeout_secs + TOOL_TIMEOUT_MARGIN_SECS;
    ToolExecutor::new(registry, timeout)
}

pub(crate) fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))
}

pub(crate) fn render<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
}
