//! Tool abstraction for LLM function-calling agents.
//!
//! The [`Tool`] trait defines the interface every tool implements: a static
//! API definition (name, description, JSON Schema) and an async `execute`
//! method that receives a [`ToolContext`]. Tools are collected into a
//! [`ToolSet`], which handles dispatch, definition export, validation,
//! timeouts, and result truncation. The dispatch gate talks to the set
//! through the [`ToolExecutor`] trait so tests can substitute their own.

use crate::ToolDef;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Default timeout for tool execution.
pub const DEFAULT_TOOL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Boxed future returned by [`Tool::execute`].
///
/// Type alias to keep trait signatures and implementations readable.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = ToolOutcome> + Send + 'a>>;

// ── ToolOutcome ────────────────────────────────────────────────────

/// The result of one tool execution.
///
/// `output` is what the model sees as the tool result. `data` carries
/// optional structured payload for the host (e.g. diff stats) that never
/// enters the conversation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    pub data: Option<serde_json::Value>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: format!("Error: {}", message.into()),
            data: None,
        }
    }

    /// Attach structured data (builder pattern).
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ── ToolContext ────────────────────────────────────────────────────

/// Shared callback type for context notifications.
type ChangeCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Per-session execution context handed to every tool.
///
/// Carries the working directory, the session id, an optional path-safety
/// predicate, and change callbacks the runner uses to re-broadcast todo,
/// charter, and decision-record updates as events.
#[derive(Clone)]
pub struct ToolContext {
    pub workdir: PathBuf,
    pub session_id: String,
    path_guard: Option<Arc<dyn Fn(&Path) -> bool + Send + Sync>>,
    pub on_todos_changed: Option<ChangeCallback<Vec<TodoItem>>>,
    pub on_charter_changed: Option<ChangeCallback<String>>,
    pub on_adrs_changed: Option<ChangeCallback<Vec<String>>>,
}

impl ToolContext {
    pub fn new(workdir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            session_id: session_id.into(),
            path_guard: None,
            on_todos_changed: None,
            on_charter_changed: None,
            on_adrs_changed: None,
        }
    }

    /// Restrict file access with a predicate. Tools call
    /// [`path_allowed`](Self::path_allowed) before touching a path.
    pub fn with_path_guard(
        mut self,
        guard: impl Fn(&Path) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.path_guard = Some(Arc::new(guard));
        self
    }

    pub fn with_on_todos_changed(
        mut self,
        f: impl Fn(&Vec<TodoItem>) + Send + Sync + 'static,
    ) -> Self {
        self.on_todos_changed = Some(Arc::new(f));
        self
    }

    pub fn with_on_charter_changed(
        mut self,
        f: impl Fn(&String) + Send + Sync + 'static,
    ) -> Self {
        self.on_charter_changed = Some(Arc::new(f));
        self
    }

    pub fn with_on_adrs_changed(
        mut self,
        f: impl Fn(&Vec<String>) + Send + Sync + 'static,
    ) -> Self {
        self.on_adrs_changed = Some(Arc::new(f));
        self
    }

    /// Whether a path is inside the allowed area. Without a guard, paths
    /// under the workdir are allowed and everything else is not.
    pub fn path_allowed(&self, path: &Path) -> bool {
        if let Some(guard) = &self.path_guard {
            return guard(path);
        }
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        };
        resolved.starts_with(&self.workdir)
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("workdir", &self.workdir)
            .field("session_id", &self.session_id)
            .finish()
    }
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A proposed file change extracted from a tool call, used to build
/// before/after previews and for bookkeeping after execution.
#[derive(Debug, Clone)]
pub struct PendingChange {
    /// Target path, as passed in the arguments.
    pub path: String,
    /// The argument key holding the proposed content, so an edited preview
    /// can be substituted back into the call.
    pub content_key: String,
    /// The proposed new content.
    pub new_content: String,
}

/// A tool that an LLM agent can invoke via function-calling.
///
/// Implementors provide:
/// - A static definition ([`Tool::definition`]) describing the tool's name,
///   description, and JSON Schema parameters for the LLM.
/// - An async [`Tool::execute`] method that receives the raw JSON arguments
///   string plus the [`ToolContext`] and returns a [`ToolOutcome`].
///
/// Uses a boxed future so that the trait is dyn-compatible (object-safe).
pub trait Tool: Send + Sync {
    /// The tool definition sent to the LLM API.
    fn definition(&self) -> ToolDef;

    /// Execute the tool with the given raw JSON arguments string.
    ///
    /// Failures should be reported through [`ToolOutcome::error`] rather
    /// than panicking; the outcome goes back to the LLM either way.
    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a>;

    /// The tool's name (convenience — delegates to definition).
    fn name(&self) -> String {
        self.definition().function.name.clone()
    }

    /// Whether this tool mutates files. Mutating tools go through the
    /// change-preview step of the dispatch gate.
    fn is_mutation(&self) -> bool {
        false
    }

    /// For mutating tools: the file change these arguments propose.
    /// Non-mutating tools return `None`.
    fn change_preview(&self, _arguments: &serde_json::Value) -> Option<PendingChange> {
        None
    }
}

// ── ToolExecutor ───────────────────────────────────────────────────

/// Dispatch seam between the dispatch gate and a tool collection.
/// [`ToolSet`] is the standard implementation.
pub trait ToolExecutor: Send + Sync {
    /// All tool definitions for the LLM API.
    fn definitions(&self) -> Vec<ToolDef>;

    /// Execute a tool call by name.
    fn execute<'a>(&'a self, name: &'a str, arguments: &'a str, ctx: &'a ToolContext)
    -> ToolFuture<'a>;

    /// Whether the named tool mutates files.
    fn is_mutation_tool(&self, name: &str) -> bool;

    /// The file change a call to the named tool proposes, if any.
    fn change_preview(&self, name: &str, arguments: &serde_json::Value) -> Option<PendingChange>;
}

// ── ToolSet ────────────────────────────────────────────────────────

/// A collection of tools that can be dispatched by name.
///
/// Manages tool registration, definition export (for the LLM API), and
/// dispatch with timing, validation, and truncation.
///
/// # Example
///
/// ```ignore
/// let tools = ToolSet::new()
///     .with_max_result_bytes(15_000)
///     .with_arg_validation(true)
///     .with_default_timeout(Some(Duration::from_secs(30)))
///     .with(MyCustomTool::new())
///     .with_if(verbose, DebugTool::new());
///
/// let defs = tools.definitions();
/// ```
pub struct ToolSet {
    tools: HashMap<String, Box<dyn Tool>>,
    max_result_bytes: usize,
    /// Whether to validate tool arguments against JSON Schema before execution.
    validate_args: bool,
    /// Default timeout for tool execution. `None` disables timeouts.
    default_timeout: Option<std::time::Duration>,
    /// Tool names that mutate files (populated from `Tool::is_mutation()`).
    mutation_tools: HashSet<String>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("max_result_bytes", &self.max_result_bytes)
            .finish()
    }
}

impl ToolSet {
    /// Create an empty tool set.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: false,
            default_timeout: None,
            mutation_tools: HashSet::new(),
        }
    }

    /// Set the maximum result size in bytes before truncation.
    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Enable JSON Schema argument validation before tool execution.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Set a default timeout for tool execution. Applies to all tools.
    /// Pass `None` to disable timeouts.
    pub fn with_default_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name();
        if tool.is_mutation() {
            self.mutation_tools.insert(name.clone());
        }
        self.tools.insert(name, Box::new(tool));
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Conditionally register a tool (builder pattern).
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    async fn dispatch(&self, name: &str, arguments: &str, ctx: &ToolContext) -> ToolOutcome {
        let tool = match self.tools.get(name) {
            Some(t) => t,
            None => return ToolOutcome::error(format!("unknown tool '{name}'")),
        };

        // Validate arguments against JSON Schema if enabled.
        if self.validate_args
            && let Some(error) = validate_tool_arguments(tool.as_ref(), arguments)
        {
            return ToolOutcome {
                success: false,
                output: error,
                data: None,
            };
        }

        log_tool_call(name, arguments);
        let start = std::time::Instant::now();

        // Execute with optional timeout.
        let mut outcome = if let Some(timeout_duration) = self.default_timeout {
            match tokio::time::timeout(timeout_duration, tool.execute(arguments, ctx)).await {
                Ok(o) => o,
                Err(_) => {
                    let elapsed = start.elapsed();
                    info!(
                        "Tool {name} timed out after {:.1}s (limit: {:.0}s)",
                        elapsed.as_secs_f64(),
                        timeout_duration.as_secs_f64(),
                    );
                    ToolOutcome::error(format!(
                        "tool '{name}' timed out after {:.0} seconds. \
                         Consider breaking the task into smaller steps or using \
                         different arguments.",
                        timeout_duration.as_secs_f64(),
                    ))
                }
            }
        } else {
            tool.execute(arguments, ctx).await
        };

        let elapsed = start.elapsed();
        debug!(
            "Tool {name} completed in {:.0}ms ({} bytes, success={})",
            elapsed.as_secs_f64() * 1000.0,
            outcome.output.len(),
            outcome.success,
        );
        trace!(
            "Tool {name} result preview: {}",
            outcome.output.chars().take(300).collect::<String>()
        );

        outcome.output = truncate_result(outcome.output, self.max_result_bytes);
        outcome
    }
}

impl ToolExecutor for ToolSet {
    fn definitions(&self) -> Vec<ToolDef> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    fn execute<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a str,
        ctx: &'a ToolContext,
    ) -> ToolFuture<'a> {
        Box::pin(self.dispatch(name, arguments, ctx))
    }

    fn is_mutation_tool(&self, name: &str) -> bool {
        self.mutation_tools.contains(name)
    }

    fn change_preview(&self, name: &str, arguments: &serde_json::Value) -> Option<PendingChange> {
        self.tools.get(name)?.change_preview(arguments)
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

// ── FnTool ────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler = Box<
    dyn Fn(String, ToolContext) -> Pin<Box<dyn Future<Output = ToolOutcome> + Send>>
        + Send
        + Sync,
>;

/// A closure-based tool that auto-parses arguments and delegates to a handler.
///
/// Eliminates the boilerplate of defining a struct + `impl Tool` for simple
/// tools whose execute logic is a pure async function. The generic
/// constructor performs type erasure so `FnTool` is a concrete,
/// dyn-compatible type.
///
/// Use [`FnTool`] for stateless tools. For tools that need shared state,
/// define a struct and implement the [`Tool`] trait directly.
///
/// # Example
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct SearchArgs {
///     query: String,
/// }
///
/// let tool = FnTool::new(
///     ToolDef::new("search", "Search the index", json_schema_for::<SearchArgs>()),
///     |args: SearchArgs, _ctx| async move {
///         ToolOutcome::ok(format!("results for {}", args.query))
///     },
/// );
/// ```
pub struct FnTool {
    def: ToolDef,
    handler: ErasedToolHandler,
    mutation: bool,
}

impl FnTool {
    /// Create a new closure-based tool.
    ///
    /// The handler receives parsed arguments of type `A` (auto-deserialized
    /// from the raw JSON string) and the execution context. Parse errors are
    /// automatically formatted for the LLM.
    pub fn new<A, F, Fut>(def: ToolDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolOutcome> + Send + 'static,
    {
        let erased =
            move |raw: String, ctx: ToolContext| -> Pin<Box<dyn Future<Output = ToolOutcome> + Send>> {
                let args: A = match serde_json::from_str(&raw) {
                    Ok(a) => a,
                    Err(e) => {
                        return Box::pin(async move {
                            ToolOutcome::error(format!(
                                "invalid tool arguments: {e}. \
                                 Please provide valid JSON matching the tool's parameter schema."
                            ))
                        });
                    }
                };
                Box::pin(handler(args, ctx))
            };

        Self {
            def,
            handler: Box::new(erased),
            mutation: false,
        }
    }

    /// Mark this tool as a mutation (builder pattern).
    pub fn mutation(mut self, is_mutation: bool) -> Self {
        self.mutation = is_mutation;
        self
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        let fut = (self.handler)(arguments.to_string(), ctx.clone());
        Box::pin(fut)
    }

    fn is_mutation(&self) -> bool {
        self.mutation
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.function.name)
            .field("mutation", &self.mutation)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate tool arguments against the tool's declared JSON Schema.
///
/// Returns `None` if valid, or `Some(error_string)` if validation fails.
/// The error string is formatted for the LLM to understand and self-correct.
pub fn validate_tool_arguments(tool: &dyn Tool, arguments: &str) -> Option<String> {
    let args_value: serde_json::Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            return Some(format!(
                "Error: invalid JSON arguments for tool '{}': {e}. \
                 Please provide valid JSON matching the tool's parameter schema.",
                tool.name()
            ));
        }
    };

    let schema = tool.definition().function.parameters;

    let validator = match jsonschema::validator_for(&schema) {
        Ok(v) => v,
        Err(_) => return None, // If schema itself is invalid, skip validation.
    };

    let errors: Vec<String> = validator
        .iter_errors(&args_value)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Error: argument validation failed for tool '{}':\n{}\n\
             Please fix the arguments and try again.",
            tool.name(),
            errors.join("\n")
        ))
    }
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.len() > 120 { "..." } else { "" }
    );
    debug!("[tool] {name} full args ({} bytes)", arguments.len());
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate a string to at most `max` characters, appending a notice if
/// trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    let total = s.chars().count();
    if total > max {
        let kept: String = s.chars().take(max).collect();
        format!("{kept}...\n[truncated: {total} chars total]")
    } else {
        s
    }
}

/// Parse raw JSON arguments into a typed struct.
///
/// Returns a formatted error string suitable for wrapping in a
/// [`ToolOutcome::error`]; the LLM will see the error and self-correct.
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(arguments: &str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| {
        format!(
            "invalid tool arguments: {e}. \
             Please provide valid JSON matching the tool's parameter schema."
        )
    })
}

// ── Pseudo-tools ───────────────────────────────────────────────────

/// A no-op scratchpad tool that gives the LLM a structured way to reason
/// between iterations. The input is returned unchanged.
pub struct ThinkTool;

/// Typed arguments for the `think` pseudo-tool.
#[derive(Deserialize, JsonSchema)]
pub struct ThinkArgs {
    /// Your step-by-step reasoning or analysis.
    pub reasoning: String,
}

impl Tool for ThinkTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "think",
            "Use this tool to think through a problem step-by-step before \
             acting. Write your reasoning as the 'reasoning' argument. This is a \
             scratchpad; it does not perform any action.",
            crate::json_schema_for::<ThinkArgs>(),
        )
    }

    fn execute<'a>(&'a self, arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            match serde_json::from_str::<ThinkArgs>(&arguments) {
                Ok(args) => ToolOutcome::ok(args.reasoning),
                Err(_) => ToolOutcome::ok("[no reasoning provided]"),
            }
        })
    }
}

/// Status of a todo item.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TodoStatus::Pending => write!(f, "[ ]"),
            TodoStatus::InProgress => write!(f, "[~]"),
            TodoStatus::Completed => write!(f, "[x]"),
        }
    }
}

/// A single todo item.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TodoItem {
    pub task: String,
    pub status: TodoStatus,
}

/// A persistent, mutable task checklist tool. The LLM can add, complete,
/// list, and remove tasks across iterations. Every change is reported
/// through [`ToolContext::on_todos_changed`] so the runner can persist the
/// list and broadcast an update event.
pub struct TodoTool {
    items: Mutex<Vec<TodoItem>>,
}

impl TodoTool {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Seed the checklist, e.g. from a restored session.
    pub fn with_items(items: Vec<TodoItem>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    fn format_list(items: &[TodoItem]) -> String {
        if items.is_empty() {
            return "Todo list is empty.".into();
        }
        let mut out = String::from("Todo list:\n");
        for (i, item) in items.iter().enumerate() {
            out.push_str(&format!("  {}. {} {}\n", i + 1, item.status, item.task));
        }
        out
    }
}

impl Default for TodoTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Action for the todo tool.
#[derive(Deserialize, JsonSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoAction {
    Add,
    Complete,
    InProgress,
    Remove,
    List,
}

/// Typed arguments for the `todo` pseudo-tool.
#[derive(Deserialize, JsonSchema)]
pub struct TodoArgs {
    /// The action to perform on the todo list.
    pub action: TodoAction,
    /// The task description (required for 'add').
    #[serde(default)]
    pub task: Option<String>,
    /// The task number (1-indexed, for 'complete'/'in_progress'/'remove').
    #[serde(default)]
    pub number: Option<i64>,
}

impl Tool for TodoTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "todo",
            "Manage a persistent task checklist. Use this to track what's \
             done, what's in progress, and what remains. Actions: 'add' (add a \
             task), 'complete' (mark task done by number), 'in_progress' (mark \
             task as in-progress by number), 'remove' (remove task by number), \
             'list' (show all tasks).",
            crate::json_schema_for::<TodoArgs>(),
        )
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        let arguments = arguments.to_string();

        Box::pin(async move {
            let parsed: TodoArgs = match serde_json::from_str(&arguments) {
                Ok(a) => a,
                Err(e) => {
                    return ToolOutcome::error(format!(
                        "invalid arguments: {e}. Use: add, complete, in_progress, remove, list."
                    ));
                }
            };

            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            let mut changed = true;

            let output = match parsed.action {
                TodoAction::Add => {
                    let task = match parsed.task {
                        Some(t) if !t.is_empty() => t,
                        _ => return ToolOutcome::error("'task' is required for 'add' action."),
                    };
                    items.push(TodoItem {
                        task,
                        status: TodoStatus::Pending,
                    });
                    Self::format_list(&items)
                }
                TodoAction::Complete | TodoAction::InProgress | TodoAction::Remove => {
                    let idx = match parsed.number {
                        Some(n) if n >= 1 && (n as usize) <= items.len() => (n - 1) as usize,
                        _ => {
                            return ToolOutcome::error(format!(
                                "invalid task number. {}",
                                Self::format_list(&items)
                            ));
                        }
                    };
                    match parsed.action {
                        TodoAction::Complete => items[idx].status = TodoStatus::Completed,
                        TodoAction::InProgress => items[idx].status = TodoStatus::InProgress,
                        TodoAction::Remove => {
                            items.remove(idx);
                        }
                        _ => unreachable!(),
                    }
                    Self::format_list(&items)
                }
                TodoAction::List => {
                    changed = false;
                    Self::format_list(&items)
                }
            };

            if changed && let Some(cb) = &ctx.on_todos_changed {
                cb(&items.clone());
            }

            ToolOutcome::ok(output)
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────
