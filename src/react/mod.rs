//! 认知层：工具指令解析、过程事件、Agent 主循环

pub mod events;
pub mod loop_;
pub mod parser;

pub use events::AgentEvent;
pub use loop_::{agent_loop, build_system_prompt, format_tool_result, AgentSession, LoopOutcome, DEFAULT_STEP_BOUND};
pub use parser::{parse_tool_call, ToolCall, TOOL_CLOSE, TOOL_OPEN};
