//! Token estimation and context-window configuration.
//!
//! The estimator is a character-count heuristic used to decide *when* to
//! prune, flush, and compact. It is deliberately cheap and deliberately
//! approximate; the token counts the provider reports after each response
//! are the authoritative numbers for accounting.

use crate::{Message, MessageContent};

/// Characters per token for the estimation heuristic.
pub const CHARS_PER_TOKEN: usize = 4;

/// Fixed per-message overhead in tokens (role markers, separators).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 8;

/// Fixed token estimate for an image content part. Image data is opaque to
/// the character heuristic, so each part counts as a flat placeholder.
pub const IMAGE_PART_TOKENS: usize = 512;

/// Estimate the token count of a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// Estimate the total tokens consumed by a message list, including
/// per-message overhead and image placeholders.
pub fn estimate_for_messages(messages: &[Message]) -> usize {
    messages.iter().map(estimate_for_message).sum()
}

fn estimate_for_message(msg: &Message) -> usize {
    let content_tokens = match &msg.content {
        None => 0,
        Some(MessageContent::Text(s)) => estimate_tokens(s),
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|p| match p {
                crate::ContentPart::Text { text } => estimate_tokens(text),
                crate::ContentPart::ImageRef { .. } => IMAGE_PART_TOKENS,
            })
            .sum(),
    };

    // Tool-call arguments ride on assistant messages and occupy window too.
    let call_tokens = msg.tool_calls.as_ref().map_or(0, |calls| {
        calls
            .iter()
            .map(|c| estimate_tokens(&c.function.name) + estimate_tokens(&c.function.arguments))
            .sum()
    });

    content_tokens + call_tokens + MESSAGE_OVERHEAD_TOKENS
}

/// Immutable per-session context-window tunables.
///
/// The four ratios partition estimated usage into escalating responses:
/// below `soft_trim_ratio` nothing happens; between `soft_trim_ratio` and
/// `hard_clear_ratio` old tool results are trimmed; above `hard_clear_ratio`
/// they are cleared entirely; `memory_flush_ratio` and `compaction_ratio`
/// trigger the summarization-based recovery paths.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// The model's advertised context window, in tokens.
    pub context_window: usize,
    /// Tokens reserved for the model's response.
    pub reserve_output: usize,
    /// Divisor applied after the output reserve; values above 1.0 leave
    /// headroom for estimation error.
    pub safety_margin: f64,

    pub soft_trim_ratio: f64,
    pub hard_clear_ratio: f64,
    pub memory_flush_ratio: f64,
    pub compaction_ratio: f64,

    /// The most recent N tool results are never pruned.
    pub keep_last_tool_results: usize,
    /// Compaction keeps at least this many recent user turns verbatim.
    pub keep_last_turns: usize,

    /// Characters kept from the head of a soft-trimmed tool result.
    pub soft_trim_head_chars: usize,
    /// Characters kept from the tail of a soft-trimmed tool result.
    pub soft_trim_tail_chars: usize,

    /// Input token budget per summarization chunk.
    pub summary_chunk_budget: usize,
    /// Output token budget for each summarization call.
    pub summary_output_budget: u32,
    /// Token budget the merged summary should fit within.
    pub summary_target_budget: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            reserve_output: 8_192,
            safety_margin: 1.25,
            soft_trim_ratio: 0.30,
            hard_clear_ratio: 0.50,
            memory_flush_ratio: 0.70,
            compaction_ratio: 0.85,
            keep_last_tool_results: 3,
            keep_last_turns: 6,
            soft_trim_head_chars: 1_000,
            soft_trim_tail_chars: 2_000,
            summary_chunk_budget: 8_000,
            summary_output_budget: 1_024,
            summary_target_budget: 2_048,
        }
    }
}

impl ContextConfig {
    /// Validate the configuration. The threshold ratios must be strictly
    /// increasing and within (0, 1]; windows and budgets must be positive.
    /// A config that fails validation is never run.
    pub fn validate(&self) -> Result<(), String> {
        if self.context_window == 0 {
            return Err("context_window must be positive".to_string());
        }
        if self.safety_margin < 1.0 {
            return Err(format!(
                "safety_margin must be >= 1.0, got {}",
                self.safety_margin
            ));
        }
        let ordered = 0.0 < self.soft_trim_ratio
            && self.soft_trim_ratio < self.hard_clear_ratio
            && self.hard_clear_ratio < self.memory_flush_ratio
            && self.memory_flush_ratio < self.compaction_ratio
            && self.compaction_ratio <= 1.0;
        if !ordered {
            return Err(format!(
                "threshold ratios must satisfy 0 < soft_trim ({}) < hard_clear ({}) \
                 < memory_flush ({}) < compaction ({}) <= 1",
                self.soft_trim_ratio,
                self.hard_clear_ratio,
                self.memory_flush_ratio,
                self.compaction_ratio,
            ));
        }
        if self.summary_chunk_budget == 0 || self.summary_target_budget == 0 {
            return Err("summary budgets must be positive".to_string());
        }
        Ok(())
    }

    /// The usable window after reserving output room and applying the
    /// safety margin: `floor((context_window - reserve_output) / margin)`.
    pub fn effective_window(&self) -> usize {
        let after_reserve = self.context_window.saturating_sub(self.reserve_output);
        (after_reserve as f64 / self.safety_margin).floor() as usize
    }

    /// Estimated usage as a fraction of the effective window. A degenerate
    /// effective window reports full saturation rather than dividing by
    /// zero; ratios above 1.0 are valid overflow signals.
    pub fn usage_ratio(&self, estimated_tokens: usize) -> f64 {
        let effective = self.effective_window();
        if effective == 0 {
            return 1.0;
        }
        estimated_tokens as f64 / effective as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContentPart, ImageUrl, MessageRole};

    fn make_message(content: &str) -> Message {
        Message {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn four_chars_per_token() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn message_estimate_includes_overhead() {
        let msgs = vec![make_message(&"a".repeat(400))];
        assert_eq!(estimate_for_messages(&msgs), 100 + MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn image_parts_count_as_placeholder() {
        let with_image = Message::user(MessageContent::Parts(vec![
            ContentPart::Text {
                text: "look".into(),
            },
            ContentPart::ImageRef {
                image_url: ImageUrl {
                    url: "data:image/png;base64,".to_string() + &"A".repeat(100_000),
                },
            },
        ]));
        let tokens = estimate_for_messages(std::slice::from_ref(&with_image));
        // The huge data URI must not leak into the estimate.
        assert_eq!(
            tokens,
            estimate_tokens("look") + IMAGE_PART_TOKENS + MESSAGE_OVERHEAD_TOKENS
        );
    }

    #[test]
    fn effective_window_applies_reserve_and_margin() {
        let config = ContextConfig {
            context_window: 100_000,
            reserve_output: 20_000,
            safety_margin: 1.25,
            ..Default::default()
        };
        assert_eq!(config.effective_window(), 64_000);
    }

    #[test]
    fn usage_ratio_saturates_on_degenerate_window() {
        let config = ContextConfig {
            context_window: 1_000,
            reserve_output: 2_000,
            ..Default::default()
        };
        assert_eq!(config.effective_window(), 0);
        assert_eq!(config.usage_ratio(500), 1.0);
    }

    #[test]
    fn usage_ratio_can_exceed_one() {
        let config = ContextConfig {
            context_window: 10_000,
            reserve_output: 0,
            safety_margin: 1.0,
            ..Default::default()
        };
        assert!(config.usage_ratio(15_000) > 1.0);
    }

    #[test]
    fn default_config_validates() {
        assert!(ContextConfig::default().validate().is_ok());
    }

    #[test]
    fn misordered_ratios_rejected() {
        let config = ContextConfig {
            soft_trim_ratio: 0.6,
            hard_clear_ratio: 0.5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("soft_trim"));
    }

    #[test]
    fn compaction_ratio_above_one_rejected() {
        let config = ContextConfig {
            compaction_ratio: 1.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_window_rejected() {
        let config = ContextConfig {
            context_window: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
