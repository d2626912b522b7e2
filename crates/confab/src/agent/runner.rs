//! The agent execution loop.
//!
//! The [`Runner`] replays a session's history, sends it with the tool
//! definitions to the model, routes every returned tool call through the
//! [`DispatchGate`], appends the results, and repeats until the model
//! produces a text-only response or a limit is hit.
//!
//! Context management runs at the top of every iteration: the usage ratio
//! from the character estimator decides whether to flush a memory summary,
//! compact old history, and how aggressively to prune tool results from the
//! working copy sent to the API. Recorded history is append-only; pruning
//! only ever touches the outgoing copy.
//!
//! All collaborators are injected: the session store, the tool executor,
//! the compliance engine, the decision router, and the event handler. The
//! runner holds no global state.
//!
//! ```ignore
//! let client = OpenAiClient::new(base_url, api_key)?;
//! let tools = ToolSet::new().with(MyTool);
//! let store = Arc::new(MemorySessionStore::new());
//! let handler = LoggingHandler;
//!
//! let runner = Runner::new(&client, &tools, store, AgentConfig::new("gpt-4o", "You are helpful."))
//!     .with_event_handler(&handler);
//! let outcome = runner.run("session-1", "Summarize the README").await?;
//! println!("{}", outcome.text());
//! ```

use crate::api::ModelClient;
use crate::api::retry::is_transient_error;
use crate::api::streaming::{StreamEvent, StreamOutcome, TurnMeta, collect_text, collect_tool_calls};
use crate::agent::config::AgentConfig;
use crate::agent::decision::DecisionRouter;
use crate::agent::events::{AgentEvent, EventHandler, NoopHandler, RunError, RunOutcome, SessionStatus};
use crate::agent::gate::{CharterPolicy, ComplianceEngine, DispatchGate};
use crate::agent::loop_detector::{LoopDetector, LoopVerdict};
use crate::agent::session::{SessionMeta, SessionStore};
use crate::context::{
    MemoryStore, Summarizer, compaction_cutoff_index, estimate_for_messages, prune,
    read_memory_note,
};
use crate::tools::{TodoItem, ToolContext, ToolExecutor};
use crate::{ChatRequest, Message, ToolDef, UsageInfo};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// The agent execution loop. Borrows the client, executor, compliance
/// engine, and event handler; shares the store, router, and abort flag.
pub struct Runner<'a> {
    client: &'a dyn ModelClient,
    executor: &'a dyn ToolExecutor,
    store: Arc<dyn SessionStore>,
    config: AgentConfig,
    event_handler: &'a dyn EventHandler,
    router: Arc<DecisionRouter>,
    compliance: Option<&'a dyn ComplianceEngine>,
    memory_store: MemoryStore,
    abort: Arc<AtomicBool>,
}

impl<'a> Runner<'a> {
    pub fn new(
        client: &'a dyn ModelClient,
        executor: &'a dyn ToolExecutor,
        store: Arc<dyn SessionStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            client,
            executor,
            store,
            config,
            event_handler: &NoopHandler,
            router: Arc::new(DecisionRouter::new()),
            compliance: None,
            memory_store: MemoryStore::new(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach an event handler.
    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = handler;
        self
    }

    /// Share a decision router. Required for Ask permission or preview
    /// modes; the owner resolves requests from outside the loop.
    pub fn with_router(mut self, router: Arc<DecisionRouter>) -> Self {
        self.router = router;
        self
    }

    /// Attach a compliance engine. Only consulted for sessions that carry
    /// a charter.
    pub fn with_compliance(mut self, engine: &'a dyn ComplianceEngine) -> Self {
        self.compliance = Some(engine);
        self
    }

    /// Share an abort flag. Setting it stops the session at the next
    /// suspension point.
    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// The router decisions are resolved against.
    pub fn router(&self) -> Arc<DecisionRouter> {
        self.router.clone()
    }

    /// Run one prompt through the loop for the given session.
    pub async fn run(&self, session_id: &str, prompt: &str) -> Result<RunOutcome, RunError> {
        self.config.validate().map_err(RunError::fatal)?;
        let start = Instant::now();

        // ── Initializing ──
        let mut meta = self
            .store
            .get_session(session_id)
            .map_err(RunError::fatal)?
            .unwrap_or_else(|| SessionMeta::new(session_id));
        meta.status = SessionStatus::Running;
        self.emit(&AgentEvent::Status(SessionStatus::Running));

        let mut history = self.store.get_history(session_id).map_err(RunError::fatal)?;
        if meta.last_prompt.as_deref() != Some(prompt) {
            let user = Message::user(prompt);
            self.record(session_id, &user)?;
            history.push(user);
            meta.last_prompt = Some(prompt.to_string());
        }
        self.store.update_session(&meta).map_err(RunError::fatal)?;

        info!(
            "Session {session_id} started: model={}, {} prior message(s)",
            self.config.model,
            history.len().saturating_sub(1),
        );

        let mut usage_total = UsageInfo::default();
        let mut text_output: Vec<String> = Vec::new();
        let mut detector = LoopDetector::new();
        let mut memory_flushed = false;
        let mut todos_snapshot = self.store.get_todos(session_id).map_err(RunError::fatal)?;
        let tool_ctx = self.build_tool_context(session_id);

        for iteration in 1..=self.config.max_iterations {
            if self.abort.load(Ordering::Relaxed) {
                return Ok(self.finish_aborted(
                    session_id,
                    start,
                    iteration - 1,
                    text_output,
                    usage_total,
                ));
            }

            // Tool definitions are re-read every iteration so a hot-reloaded
            // executor takes effect mid-session.
            let tool_defs = self.executor.definitions();

            if let Some(hint) = detector.take_hint() {
                let msg = Message::user(hint);
                self.record(session_id, &msg)?;
                history.push(msg);
            }

            let todos = self.store.get_todos(session_id).map_err(RunError::fatal)?;
            let system_msg = Message::system(self.build_system_prompt(&tool_defs, &todos));

            let mut request_messages = Vec::with_capacity(history.len() + 1);
            request_messages.push(system_msg.clone());
            request_messages.extend(history.iter().cloned());
            let estimated = estimate_for_messages(&request_messages);
            let ratio = self.config.context.usage_ratio(estimated);
            self.emit(&AgentEvent::IterationStart {
                iteration,
                max_iterations: self.config.max_iterations,
                estimated_tokens: estimated,
                usage_ratio: ratio,
            });

            // ── Memory flush ──
            if self.config.memory.enabled
                && !memory_flushed
                && ratio >= self.config.context.memory_flush_ratio
                && let Some(path) = self.config.memory.config.memory_file.clone()
            {
                let model = self
                    .config
                    .memory
                    .config
                    .flush_model
                    .clone()
                    .unwrap_or_else(|| self.config.model.clone());
                let summarizer = Summarizer::new(self.client, model, &self.config.context);
                match summarizer.summarize_for_memory(&history).await {
                    Ok(Some(note)) => {
                        if let Err(e) = self.memory_store.append_section(&path, &note).await {
                            warn!("Memory flush write failed: {e}");
                        } else {
                            self.emit(&AgentEvent::MemoryFlushed {
                                summary_chars: note.chars().count(),
                            });
                        }
                        memory_flushed = true;
                    }
                    Ok(None) => memory_flushed = true,
                    Err(e) => warn!("Memory flush summarization failed: {e}"),
                }
            }

            // ── Compaction ──
            if self.config.compaction.enabled
                && ratio >= self.config.context.compaction_ratio
                && let Some(cutoff) =
                    compaction_cutoff_index(&history, self.config.context.keep_last_turns)
                && cutoff > 0
            {
                let model = self
                    .config
                    .compaction
                    .config
                    .model
                    .clone()
                    .unwrap_or_else(|| self.config.model.clone());
                let summarizer = Summarizer::new(self.client, model, &self.config.context);
                let summary = summarizer.summarize_for_compaction(&history[..cutoff]).await;
                if !summary.is_empty() {
                    let summary_msg = Message::user(format!(
                        "Summary of the earlier conversation:\n\n{summary}"
                    ));
                    let removed = self
                        .store
                        .replace_messages_before_index_with_summary(
                            session_id,
                            cutoff,
                            summary_msg,
                        )
                        .map_err(RunError::fatal)?;
                    history = self.store.get_history(session_id).map_err(RunError::fatal)?;
                    self.emit(&AgentEvent::Compacted {
                        replaced_messages: removed,
                    });
                }
            }

            // ── Prune the working copy ──
            let working = prune(&history, &self.config.context);
            let rewritten = working
                .iter()
                .zip(history.iter())
                .filter(|(a, b)| a.content != b.content)
                .count();
            if rewritten > 0 {
                self.emit(&AgentEvent::Pruned { rewritten });
            }

            let mut messages = Vec::with_capacity(working.len() + 1);
            messages.push(system_msg);
            messages.extend(working);

            let request = ChatRequest {
                model: Some(self.config.model.clone()),
                messages,
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                tools: if tool_defs.is_empty() {
                    None
                } else {
                    Some(tool_defs.clone())
                },
                ..Default::default()
            };

            // ── Streaming + retry ──
            let outcome = match self.stream_with_retry(&request).await {
                Ok(o) => o,
                Err(e) => return Err(self.finish_error(session_id, e)),
            };
            if outcome.aborted {
                // Partial text was already forwarded as deltas.
                return Ok(self.finish_aborted(
                    session_id,
                    start,
                    iteration,
                    text_output,
                    usage_total,
                ));
            }

            let turn = TurnMeta::from_events(&outcome.events);
            if let Some(usage) = &turn.usage {
                usage_total.accumulate(usage);
                self.emit(&AgentEvent::TokenUsage {
                    prompt_tokens: usage.prompt_tokens.unwrap_or(0),
                    completion_tokens: usage.completion_tokens.unwrap_or(0),
                });
            }

            let text = collect_text(&outcome.events);
            let calls = collect_tool_calls(&outcome.events);
            if !text.is_empty() {
                text_output.push(text.clone());
            }

            // ── Final response ──
            if calls.is_empty() {
                let final_msg = Message::assistant_text(text);
                self.record(session_id, &final_msg)?;
                self.emit(&AgentEvent::Finished);
                meta.status = SessionStatus::Completed;
                let _ = self.store.update_session(&meta);
                self.emit(&AgentEvent::Status(SessionStatus::Completed));
                let duration = start.elapsed();
                info!(
                    "Session {session_id} completed in {:.1}s, {} iteration(s), {} token(s)",
                    duration.as_secs_f64(),
                    iteration,
                    usage_total.total_tokens.unwrap_or(0),
                );
                return Ok(RunOutcome {
                    session_id: session_id.to_string(),
                    text_output,
                    usage: usage_total,
                    iterations_used: iteration,
                    duration,
                    finished: true,
                    aborted: false,
                });
            }

            // ── Tool calls ──
            match detector.observe(&calls) {
                LoopVerdict::Exhausted { name } => {
                    return Err(self.finish_error(
                        session_id,
                        RunError::fatal(format!(
                            "the agent kept repeating the tool '{name}' with identical \
                             arguments and was stopped after repeated corrections"
                        )),
                    ));
                }
                LoopVerdict::Warned { name, strikes } => {
                    self.emit(&AgentEvent::LoopWarning {
                        name: &name,
                        strikes,
                    });
                }
                LoopVerdict::Clean => {}
            }
            self.emit(&AgentEvent::ToolCallsReceived {
                iteration,
                count: calls.len(),
            });

            let mut assistant = Message::assistant_tool_calls(calls.clone());
            if !text.is_empty() {
                assistant.content = Some(text.clone().into());
            }
            self.record(session_id, &assistant)?;
            history.push(assistant);

            let gate = DispatchGate {
                executor: self.executor,
                handler: self.event_handler,
                router: &self.router,
                compliance: self.compliance,
                permission_mode: self.config.permission_mode,
                preview_mode: self.config.preview_mode,
            };

            // Strictly in array order; parallel batches also run one at a time.
            for (idx, call) in calls.iter().enumerate() {
                let policy = meta.charter.as_deref().map(|charter| CharterPolicy {
                    charter,
                    adrs: &meta.adrs,
                });
                let result = gate.dispatch(call, &tool_ctx, policy, &self.abort).await;
                if result.aborted {
                    // The assistant tool-call message is already recorded;
                    // every call id must still get a paired tool result or
                    // the replayed history is rejected by providers.
                    for unfinished in &calls[idx..] {
                        let placeholder = Message::tool_result(
                            unfinished.id.as_str(),
                            "Error: aborted before completion",
                        );
                        self.record(session_id, &placeholder)?;
                    }
                    return Ok(self.finish_aborted(
                        session_id,
                        start,
                        iteration,
                        text_output,
                        usage_total,
                    ));
                }
                let result_text = result.message.text();
                self.emit(&AgentEvent::ToolResult {
                    name: &call.function.name,
                    call_id: &call.id,
                    result: &result_text,
                    success: result.success,
                });
                self.record(session_id, &result.message)?;
                history.push(result.message);

                if !result.file_changes.is_empty() {
                    self.store
                        .add_file_changes(session_id, &result.file_changes)
                        .map_err(RunError::fatal)?;
                    self.emit(&AgentEvent::FileChangesRecorded(&result.file_changes));
                }

                // Tool callbacks may have updated todos or the charter.
                let todos = self.store.get_todos(session_id).map_err(RunError::fatal)?;
                if todos != todos_snapshot {
                    self.emit(&AgentEvent::TodosUpdated(&todos));
                    todos_snapshot = todos;
                }
                if let Some(refreshed) = self.store.get_session(session_id).map_err(RunError::fatal)? {
                    if refreshed.adrs != meta.adrs {
                        self.emit(&AgentEvent::AdrsUpdated(&refreshed.adrs));
                    }
                    meta.charter = refreshed.charter;
                    meta.adrs = refreshed.adrs;
                }
            }
        }

        // ── Iteration cap ──
        self.emit(&AgentEvent::IterationLimitReached {
            max_iterations: self.config.max_iterations,
        });
        Err(self.finish_error(
            session_id,
            RunError::fatal(format!(
                "session exceeded the maximum of {} iterations without finishing",
                self.config.max_iterations
            )),
        ))
    }

    // ── Internals ─────────────────────────────────────────────────

    fn emit(&self, event: &AgentEvent<'_>) {
        self.event_handler.on_event(event);
    }

    fn record(&self, session_id: &str, message: &Message) -> Result<(), RunError> {
        self.store
            .record_message(session_id, message)
            .map_err(RunError::fatal)?;
        self.emit(&AgentEvent::MessageRecorded(message));
        Ok(())
    }

    async fn stream_with_retry(&self, request: &ChatRequest) -> Result<StreamOutcome, RunError> {
        let mut attempt: u32 = 0;
        loop {
            if self.abort.load(Ordering::Relaxed) {
                return Ok(StreamOutcome {
                    events: Vec::new(),
                    aborted: true,
                });
            }
            let mut on_event = |event: &StreamEvent| match event {
                StreamEvent::TextDelta(delta) => {
                    self.emit(&AgentEvent::TextDelta(delta));
                }
                StreamEvent::ReasoningDelta(delta) => {
                    self.emit(&AgentEvent::ReasoningDelta(delta));
                }
                _ => {}
            };
            let result = self
                .client
                .chat_stream_live(request, &self.abort, &mut on_event)
                .await;
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    let transient = is_transient_error(&e);
                    if transient && attempt < self.config.retry.max_retries {
                        let delay = self.config.retry.delay_for_attempt(attempt);
                        warn!(
                            "Transient API failure (attempt {}): {e}. Retrying in {}ms",
                            attempt + 1,
                            delay.as_millis(),
                        );
                        if sleep_with_abort(delay, &self.abort).await {
                            return Ok(StreamOutcome {
                                events: Vec::new(),
                                aborted: true,
                            });
                        }
                        attempt += 1;
                        continue;
                    }
                    return Err(RunError {
                        message: e,
                        retryable: transient,
                    });
                }
            }
        }
    }

    fn build_system_prompt(&self, tool_defs: &[ToolDef], todos: &[TodoItem]) -> String {
        let mut prompt = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| "You are a capable assistant.".to_string());

        if !tool_defs.is_empty() {
            prompt.push_str("\n\n## Available tools\n");
            for def in tool_defs {
                prompt.push_str(&format!(
                    "- {}: {}\n",
                    def.function.name, def.function.description
                ));
            }
        }

        if !todos.is_empty() {
            prompt.push_str("\n## Current task list\n");
            for (i, item) in todos.iter().enumerate() {
                prompt.push_str(&format!("{}. {} {}\n", i + 1, item.status, item.task));
            }
        }

        if self.config.memory.enabled
            && let Some(path) = &self.config.memory.config.memory_file
            && let Some(note) = read_memory_note(path, self.config.memory.config.max_memory_lines)
        {
            prompt.push_str("\n## Notes from previous sessions\n");
            prompt.push_str(&note);
            prompt.push('\n');
        }

        prompt
    }

    fn build_tool_context(&self, session_id: &str) -> ToolContext {
        let todo_store = self.store.clone();
        let todo_session = session_id.to_string();
        let charter_store = self.store.clone();
        let charter_session = session_id.to_string();
        let adr_store = self.store.clone();
        let adr_session = session_id.to_string();
        ToolContext::new(&self.config.workdir, session_id)
            .with_on_todos_changed(move |todos| {
                if let Err(e) = todo_store.save_todos(&todo_session, todos) {
                    warn!("Failed to persist todos: {e}");
                }
            })
            .with_on_charter_changed(move |charter| {
                match charter_store.get_session(&charter_session) {
                    Ok(Some(mut meta)) => {
                        meta.charter = Some(charter.clone());
                        if let Err(e) = charter_store.update_session(&meta) {
                            warn!("Failed to persist charter: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Failed to load session for charter update: {e}"),
                }
            })
            .with_on_adrs_changed(move |adrs| {
                match adr_store.get_session(&adr_session) {
                    Ok(Some(mut meta)) => {
                        meta.adrs = adrs.clone();
                        if let Err(e) = adr_store.update_session(&meta) {
                            warn!("Failed to persist ADRs: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Failed to load session for ADR update: {e}"),
                }
            })
    }

    fn finish_aborted(
        &self,
        session_id: &str,
        start: Instant,
        iterations_used: u32,
        text_output: Vec<String>,
        usage: UsageInfo,
    ) -> RunOutcome {
        info!("Session {session_id} aborted");
        if let Ok(Some(mut meta)) = self.store.get_session(session_id) {
            meta.status = SessionStatus::Idle;
            let _ = self.store.update_session(&meta);
        }
        // No success or error result on abort, only an idle status.
        self.emit(&AgentEvent::Status(SessionStatus::Idle));
        RunOutcome {
            session_id: session_id.to_string(),
            text_output,
            usage,
            iterations_used,
            duration: start.elapsed(),
            finished: false,
            aborted: true,
        }
    }

    fn finish_error(&self, session_id: &str, error: RunError) -> RunError {
        warn!("Session {session_id} failed: {}", error.message);
        let chat = Message::assistant_text(format!(
            "The session ended with an error: {}. You can retry the request, \
             check your endpoint and API key settings, or try a different model.",
            error.message
        ));
        if self.record(session_id, &chat).is_err() {
            warn!("Failed to record error message for session {session_id}");
        }
        if let Ok(Some(mut meta)) = self.store.get_session(session_id) {
            meta.status = SessionStatus::Error;
            let _ = self.store.update_session(&meta);
        }
        self.emit(&AgentEvent::Status(SessionStatus::Error));
        error
    }
}

/// Sleep that wakes early when the abort flag flips. Returns `true` when
/// aborted.
async fn sleep_with_abort(duration: Duration, abort: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if abort.load(Ordering::Relaxed) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let step = (deadline - now).min(Duration::from_millis(100));
        tokio::time::sleep(step).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::session::MemorySessionStore;
    use crate::api::ClientFuture;
    use crate::context::ContextConfig;
    use crate::{ChatCompletion, ToolDef};
    use crate::agent::config::Toggle;
    use crate::tools::{FnTool, ToolOutcome, ToolSet};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Plays back a fixed sequence of stream responses, one per call.
    struct ScriptedClient {
        turns: Mutex<VecDeque<Result<Vec<StreamEvent>, String>>>,
        chat_calls: AtomicUsize,
        chat_response: String,
    }

    impl ScriptedClient {
        fn new(turns: Vec<Result<Vec<StreamEvent>, String>>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
                chat_calls: AtomicUsize::new(0),
                chat_response: String::new(),
            }
        }

        fn with_chat_response(mut self, text: &str) -> Self {
            self.chat_response = text.to_string();
            self
        }
    }

    impl ModelClient for ScriptedClient {
        fn chat<'a>(&'a self, _body: &'a ChatRequest) -> ClientFuture<'a, ChatCompletion> {
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            let content = self.chat_response.clone();
            Box::pin(async move {
                Ok(ChatCompletion {
                    id: None,
                    model: None,
                    content: Some(content),
                    tool_calls: Vec::new(),
                    usage: None,
                    finish_reason: Some("stop".into()),
                })
            })
        }

        fn chat_stream_live<'a>(
            &'a self,
            _body: &'a ChatRequest,
            stop: &'a AtomicBool,
            on_event: &'a mut (dyn FnMut(&StreamEvent) + Send),
        ) -> ClientFuture<'a, StreamOutcome> {
            Box::pin(async move {
                if stop.load(Ordering::Relaxed) {
                    return Ok(StreamOutcome {
                        events: Vec::new(),
                        aborted: true,
                    });
                }
                let next = self
                    .turns
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Ok(Vec::new()));
                let events = next?;
                for event in &events {
                    on_event(event);
                }
                Ok(StreamOutcome {
                    events,
                    aborted: false,
                })
            })
        }
    }

    fn text_turn(text: &str) -> Result<Vec<StreamEvent>, String> {
        Ok(vec![StreamEvent::TextDelta(text.to_string())])
    }

    fn tool_turn(name: &str, args: &str) -> Result<Vec<StreamEvent>, String> {
        Ok(vec![StreamEvent::ToolCallDelta {
            index: 0,
            id: None,
            name: Some(name.to_string()),
            arguments_delta: args.to_string(),
        }])
    }

    /// Records coarse event tags so tests can assert on emission order.
    #[derive(Default)]
    struct RecordingHandler(Mutex<Vec<String>>);

    impl RecordingHandler {
        fn tags(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl EventHandler for RecordingHandler {
        fn on_event(&self, event: &AgentEvent<'_>) {
            let tag = match event {
                AgentEvent::Status(status) => format!("status:{status}"),
                AgentEvent::MemoryFlushed { .. } => "memory_flushed".to_string(),
                AgentEvent::Finished => "finished".to_string(),
                _ => return,
            };
            self.0.lock().unwrap().push(tag);
        }
    }

    fn test_runner<'a>(
        client: &'a ScriptedClient,
        tools: &'a ToolSet,
        store: Arc<MemorySessionStore>,
    ) -> Runner<'a> {
        Runner::new(client, tools, store, AgentConfig::new("gpt-4o", "Test prompt."))
    }

    fn echo_tool(name: &str) -> FnTool {
        FnTool::new(
            ToolDef::new(name, "Echo", serde_json::json!({"type": "object"})),
            |_: serde_json::Value, _ctx| async move { ToolOutcome::ok("done") },
        )
    }

    #[test]
    fn system_prompt_lists_tools_and_todos() {
        let client = ScriptedClient::new(Vec::new());
        let tools = ToolSet::new().with(FnTool::new(
            ToolDef::new(
                "search",
                "Search the index",
                serde_json::json!({"type": "object"}),
            ),
            |_: serde_json::Value, _ctx| async move { ToolOutcome::ok("") },
        ));
        let store = Arc::new(MemorySessionStore::new());
        let runner = test_runner(&client, &tools, store);

        let todos = vec![TodoItem {
            task: "write tests".into(),
            status: crate::tools::TodoStatus::InProgress,
        }];
        let prompt = runner.build_system_prompt(&tools.definitions(), &todos);
        assert!(prompt.starts_with("Test prompt."));
        assert!(prompt.contains("- search: Search the index"));
        assert!(prompt.contains("[~] write tests"));
    }

    #[test]
    fn tool_context_callbacks_persist_through_the_store() {
        let client = ScriptedClient::new(Vec::new());
        let tools = ToolSet::new();
        let store = Arc::new(MemorySessionStore::new());
        store.update_session(&SessionMeta::new("s1")).unwrap();
        let runner = test_runner(&client, &tools, store.clone());

        let ctx = runner.build_tool_context("s1");
        if let Some(cb) = &ctx.on_todos_changed {
            cb(&vec![TodoItem {
                task: "persisted".into(),
                status: crate::tools::TodoStatus::Pending,
            }]);
        }
        assert_eq!(store.get_todos("s1").unwrap()[0].task, "persisted");

        if let Some(cb) = &ctx.on_charter_changed {
            cb(&"no network calls".to_string());
        }
        assert_eq!(
            store.get_session("s1").unwrap().unwrap().charter.as_deref(),
            Some("no network calls")
        );

        if let Some(cb) = &ctx.on_adrs_changed {
            cb(&vec!["ADR-1: single binary".to_string()]);
        }
        assert_eq!(
            store.get_session("s1").unwrap().unwrap().adrs,
            vec!["ADR-1: single binary".to_string()]
        );
    }

    #[tokio::test]
    async fn abort_before_the_first_call_emits_only_an_idle_status() {
        let client = ScriptedClient::new(vec![text_turn("never seen")]);
        let tools = ToolSet::new();
        let store = Arc::new(MemorySessionStore::new());
        let handler = RecordingHandler::default();
        let abort = Arc::new(AtomicBool::new(true));
        let runner = test_runner(&client, &tools, store.clone())
            .with_event_handler(&handler)
            .with_abort(abort);

        let outcome = runner.run("s1", "do something").await.unwrap();
        assert!(outcome.aborted);
        assert!(!outcome.finished);
        assert_eq!(outcome.iterations_used, 0);
        assert!(outcome.text_output.is_empty());

        // No success, no error: just running then idle.
        assert_eq!(handler.tags(), vec!["status:running", "status:idle"]);
        assert_eq!(
            store.get_session("s1").unwrap().unwrap().status,
            SessionStatus::Idle
        );
        // Only the user prompt made it into history.
        let history = store.get_history("s1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, crate::MessageRole::User);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_mid_batch_pairs_every_tool_call() {
        // Two parallel calls: the first flips the abort flag, the second
        // would run forever. Every call id must still get a tool result.
        let events = vec![
            StreamEvent::ToolCallDelta {
                index: 0,
                id: None,
                name: Some("arm".to_string()),
                arguments_delta: "{}".to_string(),
            },
            StreamEvent::ToolCallDelta {
                index: 1,
                id: None,
                name: Some("wait".to_string()),
                arguments_delta: "{}".to_string(),
            },
        ];
        let client = ScriptedClient::new(vec![Ok(events)]);

        let abort = Arc::new(AtomicBool::new(false));
        let abort_from_tool = abort.clone();
        let tools = ToolSet::new()
            .with(FnTool::new(
                ToolDef::new("arm", "Arm", serde_json::json!({"type": "object"})),
                move |_: serde_json::Value, _ctx| {
                    let flag = abort_from_tool.clone();
                    async move {
                        flag.store(true, Ordering::Relaxed);
                        ToolOutcome::ok("armed")
                    }
                },
            ))
            .with(FnTool::new(
                ToolDef::new("wait", "Wait", serde_json::json!({"type": "object"})),
                |_: serde_json::Value, _ctx| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    ToolOutcome::ok("never")
                },
            ));

        let store = Arc::new(MemorySessionStore::new());
        let runner = test_runner(&client, &tools, store.clone()).with_abort(abort);
        let outcome = runner.run("s1", "go").await.unwrap();
        assert!(outcome.aborted);

        let history = store.get_history("s1").unwrap();
        // user, assistant with 2 tool calls, then one result per call.
        assert_eq!(history.len(), 4);
        let assistant = &history[1];
        let call_ids: Vec<&str> = assistant
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(call_ids, vec!["call_0", "call_1"]);
        for call_id in call_ids {
            assert!(
                history[2..]
                    .iter()
                    .any(|m| m.tool_call_id.as_deref() == Some(call_id)),
                "no tool result recorded for {call_id}"
            );
        }
        assert_eq!(history[2].text(), "armed");
        assert!(history[3].text().contains("aborted before completion"));
    }

    #[tokio::test]
    async fn memory_flush_runs_once_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let note_path = dir.path().join("MEMORY.md");

        // Two iterations above the flush threshold: flush must fire once.
        let client = ScriptedClient::new(vec![tool_turn("ping", "{}"), text_turn("done")])
            .with_chat_response(r#"{"memory": "- remembered fact"}"#);
        let tools = ToolSet::new().with(echo_tool("ping"));
        let store = Arc::new(MemorySessionStore::new());
        let handler = RecordingHandler::default();

        let mut config = AgentConfig::new("gpt-4o", "Test prompt.")
            .with_memory_file(&note_path)
            .with_context(ContextConfig {
                context_window: 60,
                reserve_output: 0,
                safety_margin: 1.0,
                ..Default::default()
            });
        config.compaction = Toggle::disabled();

        let runner = Runner::new(&client, &tools, store, config).with_event_handler(&handler);
        let outcome = runner.run("s1", &"x".repeat(200)).await.unwrap();
        assert!(outcome.finished);

        assert_eq!(client.chat_calls.load(Ordering::SeqCst), 1);
        let note = std::fs::read_to_string(&note_path).unwrap();
        assert!(note.contains("- remembered fact"));
        let flushes = handler
            .tags()
            .iter()
            .filter(|t| t.as_str() == "memory_flushed")
            .count();
        assert_eq!(flushes, 1);
    }

    #[tokio::test]
    async fn transient_stream_error_retries_then_succeeds() {
        let client = ScriptedClient::new(vec![
            Err("API HTTP 429: rate limited".to_string()),
            text_turn("recovered"),
        ]);
        let tools = ToolSet::new();
        let store = Arc::new(MemorySessionStore::new());
        let runner = test_runner(&client, &tools, store);

        let outcome = runner.run("s1", "hello").await.unwrap();
        assert!(outcome.finished);
        assert_eq!(outcome.iterations_used, 1);
        assert_eq!(outcome.text(), "recovered");
        assert!(client.turns.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_stream_error_is_terminal() {
        let client = ScriptedClient::new(vec![Err("API HTTP 401: bad key".to_string())]);
        let tools = ToolSet::new();
        let store = Arc::new(MemorySessionStore::new());
        let runner = test_runner(&client, &tools, store.clone());

        let err = runner.run("s1", "hello").await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("401"));
        assert_eq!(
            store.get_session("s1").unwrap().unwrap().status,
            SessionStatus::Error
        );
    }

    #[tokio::test]
    async fn iteration_cap_is_a_terminal_error() {
        let client = ScriptedClient::new(vec![
            tool_turn("ping", r#"{"n": 1}"#),
            tool_turn("ping", r#"{"n": 2}"#),
            text_turn("never reached"),
        ]);
        let tools = ToolSet::new().with(echo_tool("ping"));
        let store = Arc::new(MemorySessionStore::new());
        let config = AgentConfig::new("gpt-4o", "Test prompt.").with_max_iterations(2);
        let runner = Runner::new(&client, &tools, store.clone(), config);

        let err = runner.run("s1", "go").await.unwrap_err();
        assert!(err.message.contains("maximum of 2 iterations"));
        assert!(!err.retryable);
        assert_eq!(
            store.get_session("s1").unwrap().unwrap().status,
            SessionStatus::Error
        );

        // The recorded chat message carries remediation hints.
        let history = store.get_history("s1").unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.role, crate::MessageRole::Assistant);
        assert!(last.text().contains("retry"));
        assert!(last.text().contains("different model"));
    }

    #[tokio::test]
    async fn compaction_path_shrinks_the_estimate() {
        // The store-level half of compaction: replace everything before the
        // cutoff with a short summary and verify the estimate drops while
        // the last turns survive verbatim.
        let store = MemorySessionStore::new();
        let config = ContextConfig::default();
        for i in 0..10 {
            store
                .record_message("s1", &Message::user(format!("prompt {i}: {}", "x".repeat(2000))))
                .unwrap();
            store
                .record_message("s1", &Message::assistant_text(format!("answer {i}")))
                .unwrap();
        }
        let history = store.get_history("s1").unwrap();
        let before_tokens = estimate_for_messages(&history);

        let cutoff = compaction_cutoff_index(&history, config.keep_last_turns).unwrap();
        store
            .replace_messages_before_index_with_summary(
                "s1",
                cutoff,
                Message::user("Summary of the earlier conversation:\n\nshort"),
            )
            .unwrap();

        let after = store.get_history("s1").unwrap();
        let after_tokens = estimate_for_messages(&after);
        assert!(after_tokens < before_tokens);
        // The last keep_last_turns user turns are untouched.
        let user_count = after
            .iter()
            .filter(|m| m.role == crate::MessageRole::User && !m.text().starts_with("Summary"))
            .count();
        assert_eq!(user_count, config.keep_last_turns);
        assert_eq!(after.last().unwrap().text(), "answer 9");
    }

    #[tokio::test]
    async fn sleep_with_abort_wakes_early() {
        let abort = AtomicBool::new(false);
        // Not aborted: runs the full (tiny) duration.
        assert!(!sleep_with_abort(Duration::from_millis(10), &abort).await);
        abort.store(true, Ordering::Relaxed);
        let start = Instant::now();
        assert!(sleep_with_abort(Duration::from_secs(30), &abort).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
