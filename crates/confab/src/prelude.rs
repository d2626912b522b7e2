//! Convenience re-exports for common `confab` types.
//!
//! Meant to be glob-imported when embedding the agent loop:
//!
//! ```ignore
//! use confab::prelude::*;
//! ```
//!
//! This pulls in the types needed for the vast majority of agent programs:
//! the [`OpenAiClient`], [`Message`] constructors, [`Runner`] + config,
//! [`Tool`] trait + [`ToolSet`], the session store, and event handlers.
//! Specialized types (stream events, summarizer internals, the dispatch
//! gate) are intentionally excluded; import those from their modules
//! directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ChatRequest, Message, OpenAiClient, ToolCall, ToolDef, UsageInfo, json_schema_for};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    AgentConfig, AgentEvent, CompositeEventHandler, DecisionRouter, EventHandler, FileChange,
    FnEventHandler, LoggingHandler, MemorySessionStore, NoopHandler, PermissionDecision,
    PermissionMode, PreviewMode, PreviewVerdict, RunError, RunOutcome, Runner, SessionMeta,
    SessionStatus, SessionStore,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::ContextConfig;

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    FnTool, ThinkTool, TodoItem, TodoTool, Tool, ToolContext, ToolExecutor, ToolFuture,
    ToolOutcome, ToolSet, parse_tool_args,
};
