//! 工具指令解析
//!
//! 模型输出中任意位置的 `<TOOL>{"name": ..., "args": {...}}</TOOL>` 块即一次工具调用请求。
//! 每轮至多一个；多个块、未闭合标签、非法 JSON 均视为解析错误（非致命，回灌给模型）。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::AgentError;

pub const TOOL_OPEN: &str = "<TOOL>";
pub const TOOL_CLOSE: &str = "</TOOL>";

/// 从一轮模型输出中解析出的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn args_value(&self) -> Value {
        Value::Object(self.args.clone())
    }
}

fn directive_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<TOOL>(.*?)</TOOL>").ok())
        .as_ref()
}

/// 无指令返回 Ok(None)
pub fn parse_tool_call(output: &str) -> Result<Option<ToolCall>, AgentError> {
    let re = directive_re()
        .ok_or_else(|| AgentError::ToolParse("directive pattern failed to compile".to_string()))?;
    let bodies: Vec<&str> = re
        .captures_iter(output)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    if output.matches(TOOL_OPEN).count() > bodies.len() {
        return Err(AgentError::ToolParse(format!(
            "found {TOOL_OPEN} without a matching {TOOL_CLOSE}"
        )));
    }

    match bodies.len() {
        0 => Ok(None),
        1 => parse_body(bodies[0]).map(Some),
        n => Err(AgentError::ToolParse(format!(
            "found {n} tool directives; emit exactly one {TOOL_OPEN}...{TOOL_CLOSE} block per turn"
        ))),
    }
}

fn parse_body(body: &str) -> Result<ToolCall, AgentError> {
    let value: Value = serde_json::from_str(body.trim())
        .map_err(|e| AgentError::ToolParse(format!("directive is not valid JSON: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| AgentError::ToolParse("directive must be a JSON object".to_string()))?;

    let name = obj
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AgentError::ToolParse("directive needs a non-empty string \"name\"".to_string()))?;

    let args = match obj.get("args") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(_) => {
            return Err(AgentError::ToolParse(
                "\"args\" must be a JSON object".to_string(),
            ))
        }
    };

    Ok(ToolCall {
        name: name.to_string(),
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_has_no_call() {
        assert_eq!(parse_tool_call("Just an answer.").unwrap(), None);
    }

    #[test]
    fn test_single_directive_anywhere() {
        let out = "Let me look.\n<TOOL>{\"name\":\"list_dir\",\"args\":{\"path\":\".\"}}</TOOL>\nthanks";
        let call = parse_tool_call(out).unwrap().unwrap();
        assert_eq!(call.name, "list_dir");
        assert_eq!(call.args["path"], ".");
    }

    #[test]
    fn test_multiline_body_and_missing_args() {
        let out = "<TOOL>\n{\n  \"name\": \"list_dir\"\n}\n</TOOL>";
        let call = parse_tool_call(out).unwrap().unwrap();
        assert!(call.args.is_empty());
    }

    #[test]
    fn test_malformed_directives() {
        let cases = [
            "<TOOL>{not json}</TOOL>",
            "<TOOL>[1,2]</TOOL>",
            "<TOOL>{\"args\":{}}</TOOL>",
            "<TOOL>{\"name\":\"  \"}</TOOL>",
            "<TOOL>{\"name\":\"x\",\"args\":[1]}</TOOL>",
            "<TOOL>{\"name\":\"x\"}",
            "<TOOL>{\"name\":\"x\"}</TOOL> <TOOL>{\"name\":",
        ];
        for c in cases {
            assert!(matches!(parse_tool_call(c), Err(AgentError::ToolParse(_))), "{c}");
        }
    }

    #[test]
    fn test_multiple_directives_rejected() {
        let out = "<TOOL>{\"name\":\"a\"}</TOOL> and <TOOL>{\"name\":\"b\"}</TOOL>";
        let err = parse_tool_call(out).unwrap_err();
        assert!(err.to_string().contains("2 tool directives"));
    }
}
