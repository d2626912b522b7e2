//! Tool abstraction and dispatch.

pub mod core;

pub use core::{
    FnTool, PendingChange, ThinkTool, TodoItem, TodoStatus, TodoTool, Tool, ToolContext,
    ToolExecutor, ToolFuture, ToolOutcome, ToolSet, parse_tool_args,
};
