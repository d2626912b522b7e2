//! Tool-result pruning: trim or clear old tool results to free window space.
//!
//! Tool results are the single largest context consumer in any agent loop.
//! A file read can inject 30KB; a grep can return hundreds of lines. Most of
//! this is irrelevant after the model has processed it. Pruning rewrites old
//! tool-result content without any LLM call; the full result still exists in
//! the session history and in the environment.
//!
//! [`prune`] is pure: it takes the message list and the config, and returns
//! a rewritten copy for the current model call. Stored history is never
//! touched.

use crate::context::estimator::{ContextConfig, estimate_for_messages};
use crate::{Message, MessageContent, MessageRole};

/// Prefix used for hard-cleared tool result placeholders.
///
/// Both the placeholder writer and the "already cleared?" check reference
/// this constant so they can't drift out of sync.
pub const CLEARED_PREFIX: &str = "[Cleared:";

/// Marker inserted between the kept head and tail of a soft-trimmed result.
pub const OMISSION_MARKER: &str = "chars omitted";

/// Rewrite old tool results according to estimated usage.
///
/// - At or below the soft-trim threshold the input is returned unchanged.
/// - Between soft-trim and hard-clear, non-exempt tool results keep their
///   head and tail with an omission marker in between.
/// - Above hard-clear, non-exempt tool results are replaced with a
///   placeholder stating the original length.
///
/// The most recent `keep_last_tool_results` tool messages are always exempt.
/// Only tool-role messages with plain text content are rewritten; user and
/// assistant turns pass through untouched, and no message is ever removed,
/// so assistant tool calls keep their paired results.
pub fn prune(messages: &[Message], config: &ContextConfig) -> Vec<Message> {
    let ratio = config.usage_ratio(estimate_for_messages(messages));
    if ratio <= config.soft_trim_ratio {
        return messages.to_vec();
    }
    let hard = ratio > config.hard_clear_ratio;

    // Indices of tool messages, newest last; the tail is exempt.
    let tool_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == MessageRole::Tool)
        .map(|(i, _)| i)
        .collect();
    let exempt_from = tool_indices
        .len()
        .saturating_sub(config.keep_last_tool_results);
    let prunable: &[usize] = &tool_indices[..exempt_from];

    let mut out = messages.to_vec();
    for &idx in prunable {
        let Some(MessageContent::Text(content)) = &messages[idx].content else {
            continue;
        };
        if content.starts_with(CLEARED_PREFIX) || has_trim_marker(content) {
            continue;
        }

        let rewritten = if hard {
            hard_clear(content)
        } else {
            match soft_trim(content, config) {
                Some(trimmed) => trimmed,
                None => continue,
            }
        };
        out[idx].content = Some(MessageContent::Text(rewritten));
    }
    out
}

/// Replace a tool result with a length-only placeholder.
fn hard_clear(content: &str) -> String {
    format!("{CLEARED_PREFIX} tool result of {} chars]", content.chars().count())
}

/// Whether the content already carries a trim marker line in the exact
/// shape [`soft_trim`] writes. A payload that merely mentions the marker
/// text somewhere is still eligible for pruning.
fn has_trim_marker(content: &str) -> bool {
    content.lines().any(|line| {
        line.strip_prefix("[... ")
            .and_then(|rest| rest.strip_suffix(" ...]"))
            .and_then(|rest| rest.strip_suffix(OMISSION_MARKER))
            .is_some_and(|count| {
                let count = count.trim();
                !count.is_empty() && count.chars().all(|c| c.is_ascii_digit())
            })
    })
}

/// Keep the head and tail of a tool result with an omission marker.
/// Returns `None` when the content is already within the kept size.
fn soft_trim(content: &str, config: &ContextConfig) -> Option<String> {
    let chars: Vec<char> = content.chars().collect();
    let head = config.soft_trim_head_chars;
    let tail = config.soft_trim_tail_chars;
    if chars.len() <= head + tail {
        return None;
    }

    let omitted = chars.len() - head - tail;
    let head_text: String = chars[..head].iter().collect();
    let tail_text: String = chars[chars.len() - tail..].iter().collect();
    Some(format!(
        "{head_text}\n[... {omitted} {OMISSION_MARKER} ...]\n{tail_text}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::estimator::ContextConfig;

    /// A config small enough that a few fat tool results cross thresholds.
    fn tight_config() -> ContextConfig {
        ContextConfig {
            context_window: 10_000,
            reserve_output: 0,
            safety_margin: 1.0,
            soft_trim_head_chars: 100,
            soft_trim_tail_chars: 200,
            keep_last_tool_results: 1,
            ..Default::default()
        }
    }

    fn conversation(result_size: usize, results: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("sys"), Message::user("task")];
        for i in 0..results {
            msgs.push(Message::tool_result(
                format!("call-{i}"),
                "x".repeat(result_size),
            ));
        }
        msgs
    }

    #[test]
    fn under_budget_returns_input_unchanged() {
        let config = tight_config();
        let msgs = conversation(100, 3);
        let pruned = prune(&msgs, &config);
        for (a, b) in msgs.iter().zip(&pruned) {
            assert_eq!(a.text(), b.text());
        }
    }

    #[test]
    fn soft_trim_keeps_head_and_tail() {
        let config = tight_config();
        // ~3 * 4500 chars = ~3375 tokens on a 10k window: above soft (0.30),
        // below hard (0.50).
        let msgs = conversation(4_500, 3);
        let pruned = prune(&msgs, &config);

        let trimmed = pruned[2].text();
        assert!(trimmed.contains(OMISSION_MARKER));
        assert!(trimmed.starts_with(&"x".repeat(100)));
        assert!(trimmed.ends_with(&"x".repeat(200)));
        assert!(trimmed.len() < 4_500);
    }

    #[test]
    fn hard_clear_replaces_with_length_placeholder() {
        let config = tight_config();
        // ~3 * 8000 chars = 6000 tokens: above hard_clear (0.50).
        let msgs = conversation(8_000, 3);
        let pruned = prune(&msgs, &config);

        let cleared = pruned[2].text();
        assert!(cleared.starts_with(CLEARED_PREFIX));
        assert!(cleared.contains("8000 chars"));
    }

    #[test]
    fn recent_tool_results_exempt() {
        let config = ContextConfig {
            keep_last_tool_results: 2,
            ..tight_config()
        };
        let msgs = conversation(8_000, 3);
        let pruned = prune(&msgs, &config);

        // Oldest rewritten, two most recent intact.
        assert!(pruned[2].text().starts_with(CLEARED_PREFIX));
        assert_eq!(pruned[3].text(), "x".repeat(8_000));
        assert_eq!(pruned[4].text(), "x".repeat(8_000));
    }

    #[test]
    fn non_tool_messages_untouched() {
        let config = tight_config();
        let mut msgs = conversation(8_000, 3);
        msgs.push(Message::assistant_text("a".repeat(8_000)));
        let pruned = prune(&msgs, &config);
        assert_eq!(pruned.last().unwrap().text(), "a".repeat(8_000));
    }

    #[test]
    fn prune_never_removes_messages() {
        let config = tight_config();
        let msgs = conversation(8_000, 5);
        let pruned = prune(&msgs, &config);
        assert_eq!(pruned.len(), msgs.len());
        for (a, b) in msgs.iter().zip(&pruned) {
            assert_eq!(a.tool_call_id, b.tool_call_id);
        }
    }

    #[test]
    fn prune_is_idempotent() {
        let config = tight_config();
        let msgs = conversation(4_500, 3);
        let once = prune(&msgs, &config);
        let twice = prune(&once, &config);
        for (a, b) in once.iter().zip(&twice) {
            assert_eq!(a.text(), b.text());
        }
    }

    #[test]
    fn marker_text_in_payload_does_not_block_trimming() {
        let config = tight_config();
        let mut msgs = conversation(4_500, 3);
        // A tool result that happens to mention the marker phrase is not
        // the same as one that was already trimmed.
        msgs[2].content = Some(MessageContent::Text(format!(
            "log line: 42 {OMISSION_MARKER} by the upstream filter\n{}",
            "y".repeat(4_500)
        )));
        let pruned = prune(&msgs, &config);
        assert!(pruned[2].text().len() < 4_500);
        assert!(pruned[2].text().contains("...]"));

        // The genuine trimmed shape is left alone on a second pass.
        let twice = prune(&pruned, &config);
        assert_eq!(twice[2].text(), pruned[2].text());
    }

    #[test]
    fn already_cleared_placeholders_not_rewritten() {
        let config = tight_config();
        let mut msgs = conversation(8_000, 3);
        msgs[2].content = Some(MessageContent::Text(format!(
            "{CLEARED_PREFIX} tool result of 9999 chars]"
        )));
        let before = msgs[2].text();
        let pruned = prune(&msgs, &config);
        assert_eq!(pruned[2].text(), before);
    }
}
