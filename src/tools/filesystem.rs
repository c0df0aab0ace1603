//! 沙箱文件系统工具
//!
//! read_file / write_file / list_dir / delete_file，均为 SandboxedExecutor 的薄适配层：
//! 解析 JSON 参数，调用沙箱，返回 JSON 结果。路径校验全部在沙箱内完成。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::sandbox::SandboxedExecutor;
use crate::tools::{parse_args, render, Tool};

#[derive(Debug, Deserialize)]
struct ReadArgs {
    path: String,
    #[serde(default)]
    max_lines: Option<usize>,
}

pub struct ReadFileTool {
    sandbox: Arc<SandboxedExecutor>,
}

impl ReadFileTool {
    pub fn new(sandbox: Arc<SandboxedExecutor>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file inside the workspace. Long files are truncated to max_lines."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" },
                "max_lines": { "type": "integer", "description": "Optional line limit" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let args: ReadArgs = parse_args(args)?;
        let content = self.sandbox.read_file(&args.path, args.max_lines)?;
        Ok(render(&content))
    }
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

pub struct WriteFileTool {
    sandbox: Arc<SandboxedExecutor>,
}

impl WriteFileTool {
    pub fn new(sandbox: Arc<SandboxedExecutor>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or fully replace a file inside the workspace. Missing directories are created."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" },
                "content": { "type": "string", "description": "Complete new file content" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let args: WriteArgs = parse_args(args)?;
        let report = self.sandbox.write_file(&args.path, &args.content)?;
        Ok(render(&report))
    }
}

#[derive(Debug, Deserialize)]
struct ListArgs {
    #[serde(default = "default_list_path")]
    path: String,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    max_depth: Option<usize>,
}

fn default_list_path() -> String {
    ".".to_string()
}

pub struct ListDirTool {
    sandbox: Arc<SandboxedExecutor>,
}

impl ListDirTool {
    pub fn new(sandbox: Arc<SandboxedExecutor>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a directory inside the workspace, optionally recursive up to max_depth."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory relative to the workspace root (default \".\")" },
                "recursive": { "type": "boolean" },
                "max_depth": { "type": "integer" }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let args: ListArgs = parse_args(args)?;
        let listing = self
            .sandbox
            .list_directory(&args.path, args.recursive, args.max_depth)?;
        Ok(render(&listing))
    }
}

#[derive(Debug, Deserialize)]
struct DeleteArgs {
    path: String,
    #[serde(default)]
    confirm: bool,
    #[serde(default)]
    confirm_phrase: String,
}

pub struct DeleteFileTool {
    sandbox: Arc<SandboxedExecutor>,
}

impl DeleteFileTool {
    pub fn new(sandbox: Arc<SandboxedExecutor>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file inside the workspace. Requires confirm=true and the exact confirmation phrase."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "confirm": { "type": "boolean" },
                "confirm_phrase": {
                    "type": "string",
                    "description": format!("Must be exactly \"{}\"", self.sandbox.limits().delete_confirm_phrase)
                }
            },
            "required": ["path", "confirm", "confirm_phrase"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let args: DeleteArgs = parse_args(args)?;
        let report = self
            .sandbox
            .delete_file(&args.path, args.confirm, &args.confirm_phrase)?;
        Ok(render(&report))
    }
}
