//! Staged summarization for memory flush and history compaction.
//!
//! Long transcripts cannot be summarized in one call: the input may itself
//! exceed what the summary model accepts. The staged pipeline chunks the
//! input, summarizes each chunk independently, then merges the partials
//! until the result fits a target budget. Context-limit rejections on a
//! chunk are handled by halving the input and retrying; a chunk that still
//! fails is dropped rather than failing the whole pass.

use crate::api::ModelClient;
use crate::api::retry::is_context_limit_error;
use crate::context::estimator::{CHARS_PER_TOKEN, ContextConfig, estimate_tokens};
use crate::{ChatRequest, Message};
use tracing::{debug, warn};

/// Retries for a chunk call that hits the model's context limit. Each retry
/// halves the chunk input.
const CONTEXT_LIMIT_RETRIES: u32 = 2;

/// Character cap applied to a transcript before summarization.
const PRE_TRUNCATE_MAX_CHARS: usize = 60_000;

/// Fraction of the cap kept from the transcript head. The tail gets the
/// rest; recent turns carry more of what a summary needs.
const PRE_TRUNCATE_HEAD_FRACTION: f64 = 0.35;

const CHUNK_PROMPT: &str = "\
Summarize the following conversation excerpt concisely. Focus on:
- What was accomplished (completed subtasks, files modified)
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths, commands, and function names mentioned
- What remains to be done

Rules:
- Only include facts explicitly stated in the excerpt. Do not infer.
- Preserve file paths, commands, and error messages verbatim.
- Be concise. Every token must earn its place.";

const MERGE_PROMPT: &str = "\
The following are partial summaries of consecutive excerpts from one
conversation. Merge them into a single cohesive summary. Integrate,
deduplicate, and update; do not simply append. Preserve file paths,
commands, and error messages verbatim.";

const MEMORY_PROMPT: &str = "\
Extract durable knowledge from the following session transcript: decisions
made, facts established, file paths, commands that worked, and open TODOs.
Skip conversational filler and anything session-specific.

Respond with ONLY a JSON object of the form {\"memory\": \"...\"} where the
value is the extracted notes as Markdown. No other text.";

const COMPACTION_PROMPT: &str = "\
Produce a factual summary of the following conversation so it can replace
the original messages as context. Preserve: user requirements, decisions
made, file paths, commands run, errors encountered, parameters chosen, and
open TODOs. State facts plainly; do not editorialize.";

/// LLM-backed summarizer bound to a client, model, and context config.
pub struct Summarizer<'a> {
    client: &'a dyn ModelClient,
    model: String,
    config: &'a ContextConfig,
}

impl<'a> Summarizer<'a> {
    pub fn new(
        client: &'a dyn ModelClient,
        model: impl Into<String>,
        config: &'a ContextConfig,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            config,
        }
    }

    /// Summarize arbitrary text through the staged pipeline:
    /// chunk, summarize each chunk, then merge until the result fits
    /// `summary_target_budget`.
    pub async fn summarize_in_stages(
        &self,
        text: &str,
        chunk_instructions: &str,
        merge_instructions: &str,
    ) -> Result<String, String> {
        let chunk_chars = self.config.summary_chunk_budget * CHARS_PER_TOKEN;
        let chunks = chunk_text(text, chunk_chars);
        debug!(
            "Staged summarization: {} chars in {} chunk(s)",
            text.chars().count(),
            chunks.len()
        );

        let mut partials = Vec::new();
        for chunk in &chunks {
            let partial = self
                .summarize_chunk(chunk, chunk_instructions, self.config.summary_output_budget)
                .await?;
            if !partial.trim().is_empty() {
                partials.push(partial);
            }
        }

        if partials.is_empty() {
            return Ok(String::new());
        }
        if partials.len() == 1 {
            return Ok(partials.remove(0));
        }

        let mut merged = partials.join("\n\n");
        if estimate_tokens(&merged) <= self.config.summary_target_budget {
            return Ok(merged);
        }

        // First merge pass at the normal output budget.
        merged = self
            .summarize_chunk(&merged, merge_instructions, self.config.summary_output_budget)
            .await?;

        // Still over target: one aggressive pass with half the output room.
        if estimate_tokens(&merged) > self.config.summary_target_budget {
            let instructions = format!("{merge_instructions}\nBe more concise.");
            merged = self
                .summarize_chunk(
                    &merged,
                    &instructions,
                    (self.config.summary_output_budget / 2).max(1),
                )
                .await?;
        }

        Ok(merged)
    }

    /// One summarization call. A context-limit rejection halves the input
    /// and retries; after the retries are spent the chunk degrades to an
    /// empty string instead of failing the pass.
    async fn summarize_chunk(
        &self,
        input: &str,
        instructions: &str,
        output_budget: u32,
    ) -> Result<String, String> {
        let mut current: String = input.to_string();
        let mut attempt = 0;

        loop {
            let request = ChatRequest {
                model: Some(self.model.clone()),
                messages: vec![Message::system(instructions), Message::user(current.as_str())],
                max_tokens: output_budget,
                temperature: 0.3,
                ..Default::default()
            };

            match self.client.chat(&request).await {
                Ok(completion) => return Ok(completion.content.unwrap_or_default()),
                Err(e) if is_context_limit_error(&e) && attempt < CONTEXT_LIMIT_RETRIES => {
                    attempt += 1;
                    let chars: Vec<char> = current.chars().collect();
                    current = chars[..chars.len() / 2].iter().collect();
                    warn!(
                        "Summary chunk hit context limit, retrying with {} chars (attempt {attempt})",
                        current.chars().count()
                    );
                }
                Err(e) if is_context_limit_error(&e) => {
                    warn!("Summary chunk still over context limit after retries, dropping it");
                    return Ok(String::new());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Distill durable knowledge from a transcript for the memory note.
    ///
    /// The model is asked for a strict `{"memory": "..."}` JSON envelope;
    /// a response that fails to parse is used as-is, since a usable note
    /// beats a lost one. Returns `None` for an empty transcript or an
    /// empty result.
    pub async fn summarize_for_memory(
        &self,
        messages: &[Message],
    ) -> Result<Option<String>, String> {
        let transcript = format_transcript(messages);
        if transcript.trim().is_empty() {
            return Ok(None);
        }
        let truncated = pre_truncate(&transcript, PRE_TRUNCATE_MAX_CHARS);

        let raw = self
            .summarize_in_stages(&truncated, MEMORY_PROMPT, MERGE_PROMPT)
            .await?;
        let memory = parse_memory_envelope(&raw);
        if memory.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(memory))
    }

    /// Produce the summary text that will replace compacted history.
    /// Returns an empty string on failure; the caller skips compaction then.
    pub async fn summarize_for_compaction(&self, messages: &[Message]) -> String {
        let transcript = format_transcript(messages);
        if transcript.trim().is_empty() {
            return String::new();
        }
        let truncated = pre_truncate(&transcript, PRE_TRUNCATE_MAX_CHARS);

        match self
            .summarize_in_stages(&truncated, COMPACTION_PROMPT, MERGE_PROMPT)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Compaction summary failed: {e}");
                String::new()
            }
        }
    }
}

/// Split text into chunks of at most `chunk_chars` characters.
pub fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    if chunk_chars == 0 {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars
        .chunks(chunk_chars)
        .map(|c| c.iter().collect())
        .collect()
}

/// Flatten a message list into a plain `[role]: text` log.
pub fn format_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        let text = msg.text();
        if !text.is_empty() {
            out.push_str(&format!("[{}]: {text}\n\n", msg.role));
        }
        if let Some(calls) = &msg.tool_calls {
            for call in calls {
                out.push_str(&format!(
                    "[{} calls {}]: {}\n\n",
                    msg.role, call.function.name, call.function.arguments
                ));
            }
        }
    }
    out
}

/// Cap a transcript at `max_chars`, keeping a head slice and a larger tail
/// slice with a marker in between.
pub fn pre_truncate(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }

    let head = (max_chars as f64 * PRE_TRUNCATE_HEAD_FRACTION) as usize;
    let tail = max_chars - head;
    let head_text: String = chars[..head].iter().collect();
    let tail_text: String = chars[chars.len() - tail..].iter().collect();
    let omitted = chars.len() - head - tail;
    format!("{head_text}\n[... {omitted} chars of transcript omitted ...]\n{tail_text}")
}

/// Parse the `{"memory": "..."}` envelope, falling back to the raw text.
fn parse_memory_envelope(raw: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw.trim())
        && let Some(memory) = value.get("memory").and_then(|m| m.as_str())
    {
        return memory.to_string();
    }
    raw.trim().to_string()
}

/// Where to cut the history for compaction.
///
/// Counts user-prompt messages; when there are no more than
/// `keep_last_turns` of them there is nothing to compact and `None` is
/// returned. Otherwise returns the index of the `keep_last_turns`-th user
/// prompt from the end: everything before that index gets replaced by the
/// summary, everything from it on is kept verbatim.
pub fn compaction_cutoff_index(messages: &[Message], keep_last_turns: usize) -> Option<usize> {
    let user_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == crate::MessageRole::User)
        .map(|(i, _)| i)
        .collect();

    if user_indices.len() <= keep_last_turns {
        return None;
    }
    Some(user_indices[user_indices.len() - keep_last_turns])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_covers_all_input() {
        let text = "a".repeat(2_500);
        let chunks = chunk_text(&text, 1_000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1_000);
        assert_eq!(chunks[2].len(), 500);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunking_empty_text_yields_no_chunks() {
        assert!(chunk_text("", 1_000).is_empty());
    }

    #[test]
    fn transcript_includes_roles_and_tool_calls() {
        let messages = vec![
            Message::user("read the config"),
            Message::assistant_tool_calls(vec![crate::ToolCall {
                id: "c1".into(),
                call_type: crate::CallType::Function,
                function: crate::FunctionCallData {
                    name: "read_file".into(),
                    arguments: r#"{"path":"app.toml"}"#.into(),
                },
            }]),
            Message::tool_result("c1", "timeout = 30"),
        ];
        let transcript = format_transcript(&messages);
        assert!(transcript.contains("[user]: read the config"));
        assert!(transcript.contains("[assistant calls read_file]"));
        assert!(transcript.contains("[tool]: timeout = 30"));
    }

    #[test]
    fn pre_truncate_keeps_head_and_larger_tail() {
        let text: String = ('a'..='z').cycle().take(10_000).collect();
        let truncated = pre_truncate(&text, 1_000);
        assert!(truncated.contains("chars of transcript omitted"));

        let marker_pos = truncated.find("[...").unwrap();
        let head_len = marker_pos;
        let tail_len = truncated.len() - truncated.find("...]\n").unwrap() - 5;
        assert!(tail_len > head_len, "tail ({tail_len}) should exceed head ({head_len})");
    }

    #[test]
    fn pre_truncate_short_text_unchanged() {
        assert_eq!(pre_truncate("short", 1_000), "short");
    }

    #[test]
    fn memory_envelope_parses_json() {
        let raw = r#"{"memory": "- prefers rebase over merge"}"#;
        assert_eq!(parse_memory_envelope(raw), "- prefers rebase over merge");
    }

    #[test]
    fn memory_envelope_falls_back_to_raw_text() {
        let raw = "- prefers rebase over merge";
        assert_eq!(parse_memory_envelope(raw), raw);
        // JSON without the expected key also falls back.
        assert_eq!(parse_memory_envelope(r#"{"note": "x"}"#), r#"{"note": "x"}"#);
    }

    #[test]
    fn cutoff_none_when_few_user_turns() {
        let messages = vec![
            Message::system("sys"),
            Message::user("one"),
            Message::assistant_text("a"),
            Message::user("two"),
            Message::assistant_text("b"),
        ];
        assert_eq!(compaction_cutoff_index(&messages, 2), None);
        assert_eq!(compaction_cutoff_index(&messages, 5), None);
    }

    #[test]
    fn cutoff_lands_before_kept_turns() {
        let mut messages = vec![Message::system("sys")];
        for i in 0..8 {
            messages.push(Message::user(format!("prompt {i}")));
            messages.push(Message::assistant_text(format!("answer {i}")));
        }
        // Keep the last 6 of 8 user turns: the cutoff is the index of
        // user prompt 2, so prompts 0 and 1 get compacted.
        let cutoff = compaction_cutoff_index(&messages, 6).unwrap();
        assert_eq!(messages[cutoff].text(), "prompt 2");
        let kept_users = messages[cutoff..]
            .iter()
            .filter(|m| m.role == crate::MessageRole::User)
            .count();
        assert_eq!(kept_users, 6);
    }

    #[test]
    fn cutoff_boundary_exactly_one_over() {
        let mut messages = Vec::new();
        for i in 0..7 {
            messages.push(Message::user(format!("p{i}")));
            messages.push(Message::assistant_text("a"));
        }
        let cutoff = compaction_cutoff_index(&messages, 6).unwrap();
        assert_eq!(messages[cutoff].text(), "p1");
    }
}
