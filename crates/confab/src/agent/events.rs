//! Events, handlers, and run results for the [`Runner`](super::runner::Runner).
//!
//! The runner communicates with callers through [`AgentEvent`] variants that
//! cover the full lifecycle of a session, from iteration start through tool
//! dispatch to completion. Callers implement [`EventHandler`] to observe
//! these events for logging, UI rendering, metrics, or persistence.
//!
//! Events are strictly informational. Permission and preview decisions flow
//! back through the [`DecisionRouter`](super::decision::DecisionRouter),
//! never through handler return values, so a handler can forward events to
//! another thread or process without blocking the loop.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Full control (UI, metrics, decision UIs) |

use crate::{Message, UsageInfo};
use crate::tools::TodoItem;
use std::fmt;
use tracing::{debug, info, trace, warn};

// ── File changes ───────────────────────────────────────────────────

/// What a file mutation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Created,
    Modified,
}

/// A recorded file mutation from a tool call.
///
/// Line counts are full-file counts when no diff source is available:
/// a created file reports all its lines as added, a modified file reports
/// the new content as added and the old content as removed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileChange {
    /// Workdir-relative path.
    pub path: String,
    pub kind: FileChangeKind,
    pub added_lines: usize,
    pub removed_lines: usize,
    /// The tool call that produced the change.
    pub tool_call_id: String,
}

// ── Session status ─────────────────────────────────────────────────

/// Coarse session state broadcast to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    Completed,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the runner during a session.
#[derive(Debug)]
pub enum AgentEvent<'a> {
    /// A new iteration is starting.
    IterationStart {
        iteration: u32,
        max_iterations: u32,
        estimated_tokens: usize,
        usage_ratio: f64,
    },
    /// Session status changed.
    Status(SessionStatus),
    /// Incremental assistant text (streaming).
    TextDelta(&'a str),
    /// Incremental reasoning text (streaming).
    ReasoningDelta(&'a str),
    /// A complete message was appended to the session history.
    MessageRecorded(&'a Message),
    /// The LLM requested tool calls this iteration.
    ToolCallsReceived { iteration: u32, count: usize },
    /// A tool call is waiting on an external permission decision.
    PermissionRequested {
        request_id: u64,
        name: &'a str,
        arguments: &'a str,
    },
    /// A batch of file mutations is waiting on preview approval.
    PreviewRequested { request_id: u64, count: usize },
    /// The compliance engine flagged a tool call. Hard flags block the
    /// call; soft flags let it proceed.
    ComplianceFlagged {
        name: &'a str,
        hard: bool,
        reason: &'a str,
    },
    /// A single tool is about to execute.
    ToolExecuting { name: &'a str, arguments: &'a str },
    /// A single tool finished.
    ToolResult {
        name: &'a str,
        call_id: &'a str,
        result: &'a str,
        success: bool,
    },
    /// File mutations were recorded for this session.
    FileChangesRecorded(&'a [FileChange]),
    /// The todo checklist changed.
    TodosUpdated(&'a [TodoItem]),
    /// The session's architecture decision records changed.
    AdrsUpdated(&'a [String]),
    /// Token usage reported by the provider for one turn.
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// Tool results were rewritten by the pruner before a request.
    Pruned { rewritten: usize },
    /// A transcript summary was appended to the memory note.
    MemoryFlushed { summary_chars: usize },
    /// Older history was replaced with a summary message.
    Compacted { replaced_messages: usize },
    /// A repetitive tool call was flagged by the loop detector.
    LoopWarning { name: &'a str, strikes: u32 },
    /// The session hit the iteration limit without finishing.
    IterationLimitReached { max_iterations: u32 },
    /// The agent finished (final text, no more tool calls).
    Finished,
}

impl AgentEvent<'_> {
    /// Extract total tokens from a `TokenUsage` event as `u64`.
    pub fn total_tokens(&self) -> Option<u64> {
        if let AgentEvent::TokenUsage {
            prompt_tokens,
            completion_tokens,
        } = self
        {
            Some(*prompt_tokens as u64 + *completion_tokens as u64)
        } else {
            None
        }
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// Handler for runner events.
///
/// Implement this trait to react to session events. Handlers observe; they
/// never gate execution. The default implementation does nothing.
pub trait EventHandler: Send + Sync {
    /// Called for each event during the session.
    fn on_event(&self, event: &AgentEvent<'_>) {
        let _ = event;
    }
}

/// A no-op event handler.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// # Example
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let AgentEvent::TextDelta(delta) = event {
///         print!("{delta}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&AgentEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&AgentEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&AgentEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &AgentEvent<'_>) {
        (self.0)(event)
    }
}

/// An event handler that delegates to multiple inner handlers in order.
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain. Handlers are called in registration order.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &AgentEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &AgentEvent<'_>) {
        match event {
            AgentEvent::IterationStart {
                iteration,
                max_iterations,
                estimated_tokens,
                usage_ratio,
            } => {
                info!(
                    "[iteration {}/{}] ~{} tokens ({:.0}% of effective window)",
                    iteration,
                    max_iterations,
                    estimated_tokens,
                    usage_ratio * 100.0,
                );
            }
            AgentEvent::Status(status) => {
                debug!("Session status: {status}");
            }
            AgentEvent::TextDelta(delta) => {
                let preview: String = delta.chars().take(80).collect();
                trace!("Stream text delta: {preview}");
            }
            AgentEvent::ReasoningDelta(delta) => {
                let preview: String = delta.chars().take(80).collect();
                trace!("Stream reasoning delta: {preview}");
            }
            AgentEvent::MessageRecorded(message) => {
                debug!(
                    "Recorded {} message ({} chars)",
                    message.role,
                    message.text().chars().count(),
                );
            }
            AgentEvent::ToolCallsReceived { iteration, count } => {
                debug!("{count} tool call(s) in iteration {iteration}");
            }
            AgentEvent::PermissionRequested {
                request_id, name, ..
            } => {
                info!("Permission requested for tool {name} (request {request_id})");
            }
            AgentEvent::PreviewRequested { request_id, count } => {
                info!("Preview requested for {count} change(s) (request {request_id})");
            }
            AgentEvent::ComplianceFlagged { name, hard, reason } => {
                if *hard {
                    warn!("Compliance blocked tool {name}: {reason}");
                } else {
                    warn!("Compliance notice for tool {name}: {reason}");
                }
            }
            AgentEvent::ToolExecuting { name, .. } => {
                debug!("Executing tool: {name}");
            }
            AgentEvent::ToolResult {
                name,
                result,
                success,
                ..
            } => {
                debug!("Tool {name} result: {} bytes, success={success}", result.len());
            }
            AgentEvent::FileChangesRecorded(changes) => {
                info!("{} file change(s) recorded", changes.len());
            }
            AgentEvent::TodosUpdated(todos) => {
                debug!("Todo list updated ({} items)", todos.len());
            }
            AgentEvent::AdrsUpdated(adrs) => {
                debug!("ADRs updated ({} records)", adrs.len());
            }
            AgentEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
            } => {
                debug!("Tokens: prompt={prompt_tokens}, completion={completion_tokens}");
            }
            AgentEvent::Pruned { rewritten } => {
                info!("Pruned {rewritten} tool result(s) before request");
            }
            AgentEvent::MemoryFlushed { summary_chars } => {
                info!("Flushed {summary_chars} chars of summary to memory");
            }
            AgentEvent::Compacted { replaced_messages } => {
                info!("Compacted {replaced_messages} message(s) into a summary");
            }
            AgentEvent::LoopWarning { name, strikes } => {
                warn!("Repetitive call to {name} (strike {strikes})");
            }
            AgentEvent::IterationLimitReached { max_iterations } => {
                info!("Session hit iteration limit ({max_iterations})");
            }
            AgentEvent::Finished => {
                info!("Agent finished (no more tool calls)");
            }
        }
    }
}

// ── Run result ─────────────────────────────────────────────────────

/// A terminal session error with a retryability hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    /// Human-readable description, also delivered as a chat message.
    pub message: String,
    /// Whether resubmitting the same prompt could plausibly succeed.
    pub retryable: bool,
}

impl RunError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RunError {}

/// The result of a complete [`Runner::run()`](super::runner::Runner::run).
#[derive(Debug)]
pub struct RunOutcome {
    /// Session id the run executed under.
    pub session_id: String,
    /// Accumulated assistant text across all iterations.
    pub text_output: Vec<String>,
    /// Provider-reported usage accumulated across all turns.
    pub usage: UsageInfo,
    /// Number of iterations executed.
    pub iterations_used: u32,
    /// Wall-clock duration of the run.
    pub duration: std::time::Duration,
    /// Whether the agent finished naturally (final text, no tool calls).
    pub finished: bool,
    /// Whether the session was aborted from outside.
    pub aborted: bool,
}

impl RunOutcome {
    /// Concatenated text output from all iterations.
    pub fn text(&self) -> String {
        self.text_output.join("\n\n")
    }
}
