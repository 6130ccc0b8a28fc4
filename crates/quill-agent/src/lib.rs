pub mod approvals;
pub mod compact;
mod context;
pub mod images;
pub mod project;
pub mod prompt;
pub mod tool_loop;

pub use context::AgentContext;
pub use tool_loop::{
    ApprovalAnswer, ApprovalCallback, DEFAULT_MAX_TURNS, ToolCallRecord, ToolLoopConfig,
    ToolLoopResult, ToolUseLoop, USER_DENIED,
};
