//! The tool dispatch gate.
//!
//! Every tool call requested by the model passes through a fixed pipeline
//! before (and instead of) raw execution:
//!
//! 1. Argument parse, with one repair attempt for truncated JSON.
//! 2. Permission check (Ask mode): suspend on an external decision.
//! 3. Compliance check against the session charter, when one is active.
//! 4. Change preview for file-mutating tools, with edit substitution.
//! 5. Execution through the [`ToolExecutor`], plus file-change bookkeeping.
//!
//! Whatever happens, the gate produces a tool-role message linked to the
//! call id, so the conversation stays well-formed even for denied, blocked,
//! or unparseable calls. The abort flag is polled at every suspension point.

use crate::ToolCall;
use crate::Message;
use crate::agent::config::{PermissionMode, PreviewMode};
use crate::agent::decision::{DecisionRouter, PermissionDecision, PreviewVerdict};
use crate::agent::events::{AgentEvent, EventHandler, FileChange, FileChangeKind};
use crate::tools::{PendingChange, ToolContext, ToolExecutor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How often suspension points re-check the abort flag.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How much of an unparseable argument string is echoed back to the model.
const RAW_ARGS_PREVIEW_CHARS: usize = 200;

// ── Compliance ─────────────────────────────────────────────────────

/// Outcome class of a compliance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceStatus {
    Pass,
    /// Flagged but allowed to proceed.
    SoftFail,
    /// Blocked.
    HardFail,
}

/// Result of evaluating one tool call against the charter.
#[derive(Debug, Clone)]
pub struct ComplianceVerdict {
    pub status: ComplianceStatus,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

impl ComplianceVerdict {
    pub fn pass() -> Self {
        Self {
            status: ComplianceStatus::Pass,
            reason: None,
            warnings: Vec::new(),
        }
    }

    /// Whether the call may execute.
    pub fn allowed(&self) -> bool {
        self.status != ComplianceStatus::HardFail
    }
}

/// The tool call under evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ToolIntent<'a> {
    pub name: &'a str,
    pub arguments: &'a serde_json::Value,
}

/// The session policy a tool call is checked against: the charter text and
/// any architecture decision records recorded alongside it.
#[derive(Debug, Clone, Copy)]
pub struct CharterPolicy<'a> {
    pub charter: &'a str,
    pub adrs: &'a [String],
}

/// Evaluates tool calls against a session charter. Only consulted when the
/// session carries a charter.
pub trait ComplianceEngine: Send + Sync {
    fn check(&self, intent: ToolIntent<'_>, policy: CharterPolicy<'_>) -> ComplianceVerdict;
}

// ── Previews ───────────────────────────────────────────────────────

/// One previewed file change: current content (if the file exists) and the
/// proposed replacement.
#[derive(Debug, Clone)]
pub struct ChangePreview {
    pub path: String,
    pub before: Option<String>,
    pub after: String,
}

/// A batch of previewed changes awaiting a single approval.
#[derive(Debug, Clone)]
pub struct PreviewBatch {
    pub request_id: u64,
    pub items: Vec<ChangePreview>,
}

// ── Argument repair ────────────────────────────────────────────────

/// Parse a raw tool-argument string, attempting one repair on failure.
///
/// Streams sometimes cut arguments off mid-object. The repair strips a
/// trailing comma and closes any unclosed braces, which recovers the
/// common truncation shapes. Anything else stays an error; the tool is
/// never invoked with unparseable input.
pub fn parse_or_repair_arguments(raw: &str) -> Result<serde_json::Value, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(serde_json::json!({}));
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => Ok(value),
        Err(original) => {
            let repaired = repair_truncated_json(trimmed);
            serde_json::from_str(&repaired).map_err(|_| original.to_string())
        }
    }
}

fn repair_truncated_json(raw: &str) -> String {
    let mut candidate = raw.trim_end().to_string();
    while candidate.ends_with(',') {
        candidate.pop();
        candidate = candidate.trim_end().to_string();
    }

    // Close unterminated braces, skipping brace characters inside strings.
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in candidate.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }
    if in_string {
        candidate.push('"');
    }
    for _ in 0..depth.max(0) {
        candidate.push('}');
    }
    candidate
}

// ── Gate ───────────────────────────────────────────────────────────

/// Result of putting one tool call through the gate.
#[derive(Debug)]
pub struct GateOutcome {
    /// Tool-role message linked to the call id. Always present except when
    /// aborted.
    pub message: Message,
    pub success: bool,
    /// File mutations to record and broadcast.
    pub file_changes: Vec<FileChange>,
    /// Whether the gate gave up because the abort flag was set. When true,
    /// `message` is a placeholder and must not be persisted.
    pub aborted: bool,
}

impl GateOutcome {
    fn denied(call_id: &str, text: impl Into<String>) -> Self {
        Self {
            message: Message::tool_result(call_id, format!("Error: {}", text.into())),
            success: false,
            file_changes: Vec::new(),
            aborted: false,
        }
    }

    fn aborted(call_id: &str) -> Self {
        Self {
            message: Message::tool_result(call_id, "aborted"),
            success: false,
            file_changes: Vec::new(),
            aborted: true,
        }
    }
}

/// The dispatch gate. Borrowed collaborators come from the runner; the
/// gate itself is stateless across calls.
pub struct DispatchGate<'a> {
    pub executor: &'a dyn ToolExecutor,
    pub handler: &'a dyn EventHandler,
    pub router: &'a DecisionRouter,
    pub compliance: Option<&'a dyn ComplianceEngine>,
    pub permission_mode: PermissionMode,
    pub preview_mode: PreviewMode,
}

impl DispatchGate<'_> {
    /// Run one tool call through the full pipeline.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        policy: Option<CharterPolicy<'_>>,
        abort: &AtomicBool,
    ) -> GateOutcome {
        let name = call.function.name.as_str();
        let call_id = call.id.as_str();

        // 1. Argument parse + repair.
        let mut args = match parse_or_repair_arguments(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                let preview: String = call
                    .function
                    .arguments
                    .chars()
                    .take(RAW_ARGS_PREVIEW_CHARS)
                    .collect();
                return GateOutcome::denied(
                    call_id,
                    format!("could not parse arguments for '{name}': {e}. Raw input: {preview}"),
                );
            }
        };

        // 2. Permission.
        if self.permission_mode == PermissionMode::Ask {
            let (request_id, rx) = self.router.request_permission();
            self.handler.on_event(&AgentEvent::PermissionRequested {
                request_id,
                name,
                arguments: &call.function.arguments,
            });
            match self.await_decision(request_id, rx, abort).await {
                None => return GateOutcome::aborted(call_id),
                Some(PermissionDecision { approved: false, reason }) => {
                    let reason = reason.unwrap_or_else(|| "denied by user".into());
                    return GateOutcome::denied(
                        call_id,
                        format!("tool call denied: {reason}"),
                    );
                }
                Some(PermissionDecision { approved: true, .. }) => {}
            }
        }

        // 3. Compliance, only with an active charter.
        if let Some(engine) = self.compliance
            && let Some(policy) = policy
        {
            let verdict = engine.check(
                ToolIntent {
                    name,
                    arguments: &args,
                },
                policy,
            );
            let reason = verdict.reason.clone().unwrap_or_default();
            match verdict.status {
                ComplianceStatus::Pass => {}
                ComplianceStatus::SoftFail => {
                    self.handler.on_event(&AgentEvent::ComplianceFlagged {
                        name,
                        hard: false,
                        reason: &reason,
                    });
                }
                ComplianceStatus::HardFail => {
                    self.handler.on_event(&AgentEvent::ComplianceFlagged {
                        name,
                        hard: true,
                        reason: &reason,
                    });
                    return GateOutcome::denied(
                        call_id,
                        format!("blocked by session charter: {reason}"),
                    );
                }
            }
            for warning in &verdict.warnings {
                warn!("Compliance warning for {name}: {warning}");
            }
        }

        // 4. Change preview for mutations.
        let mut pending = None;
        if self.executor.is_mutation_tool(name) {
            pending = self.executor.change_preview(name, &args);
        }
        let mut before_content = None;
        if let Some(change) = &pending {
            before_content = std::fs::read_to_string(resolve_path(ctx, &change.path)).ok();

            if self.preview_mode == PreviewMode::Ask {
                let (request_id, rx) = self.router.request_preview();
                let batch = PreviewBatch {
                    request_id,
                    items: vec![ChangePreview {
                        path: change.path.clone(),
                        before: before_content.clone(),
                        after: change.new_content.clone(),
                    }],
                };
                debug!("Previewing {} change(s) for {name}", batch.items.len());
                self.handler.on_event(&AgentEvent::PreviewRequested {
                    request_id,
                    count: batch.items.len(),
                });
                match self.await_decision(request_id, rx, abort).await {
                    None => return GateOutcome::aborted(call_id),
                    Some(PreviewVerdict { approved: false, .. }) => {
                        return GateOutcome::denied(call_id, "changes rejected by user");
                    }
                    Some(PreviewVerdict { approved: true, items }) => {
                        // Substitute edited content back into the call.
                        if let Some(edited) = items
                            .iter()
                            .find(|i| i.path == change.path)
                            .and_then(|i| i.edited_content.clone())
                        {
                            args[change.content_key.as_str()] =
                                serde_json::Value::String(edited);
                            pending = self.executor.change_preview(name, &args);
                        }
                    }
                }
            }
        }

        // 5. Execution, with the abort flag polled alongside.
        let final_args =
            serde_json::to_string(&args).unwrap_or_else(|_| call.function.arguments.clone());
        self.handler.on_event(&AgentEvent::ToolExecuting {
            name,
            arguments: &final_args,
        });
        let outcome = tokio::select! {
            outcome = self.executor.execute(name, &final_args, ctx) => outcome,
            _ = wait_for_abort(abort) => return GateOutcome::aborted(call_id),
        };

        let mut file_changes = Vec::new();
        if outcome.success && let Some(change) = &pending {
            file_changes.push(bookkeep_change(
                ctx,
                change,
                before_content.as_deref(),
                call_id,
            ));
        }

        GateOutcome {
            message: Message::tool_result(call_id, outcome.output.clone()),
            success: outcome.success,
            file_changes,
            aborted: false,
        }
    }

    async fn await_decision<T>(
        &self,
        request_id: u64,
        mut rx: oneshot::Receiver<T>,
        abort: &AtomicBool,
    ) -> Option<T> {
        loop {
            if abort.load(Ordering::Relaxed) {
                self.router.cancel(request_id);
                return None;
            }
            match tokio::time::timeout(ABORT_POLL_INTERVAL, &mut rx).await {
                Ok(Ok(decision)) => return Some(decision),
                Ok(Err(_)) => {
                    // Sender dropped without a decision; treat as abort.
                    return None;
                }
                Err(_) => continue,
            }
        }
    }
}

async fn wait_for_abort(abort: &AtomicBool) {
    loop {
        if abort.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(ABORT_POLL_INTERVAL).await;
    }
}

fn resolve_path(ctx: &ToolContext, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        ctx.workdir.join(p)
    }
}

fn workdir_relative(ctx: &ToolContext, path: &str) -> String {
    Path::new(path)
        .strip_prefix(&ctx.workdir)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

fn line_count(text: &str) -> usize {
    if text.is_empty() { 0 } else { text.lines().count() }
}

fn bookkeep_change(
    ctx: &ToolContext,
    change: &PendingChange,
    before: Option<&str>,
    call_id: &str,
) -> FileChange {
    FileChange {
        path: workdir_relative(ctx, &change.path),
        kind: if before.is_some() {
            FileChangeKind::Modified
        } else {
            FileChangeKind::Created
        },
        added_lines: line_count(&change.new_content),
        removed_lines: line_count(before.unwrap_or_default()),
        tool_call_id: call_id.to_string(),
    }
}
