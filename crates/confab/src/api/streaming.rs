//! Server-Sent Events (SSE) streaming for chat completions.
//!
//! Provides [`StreamEvent`] and the [`OpenAiClient::chat_stream_live`]
//! method for receiving incremental text deltas and tool-call fragments from
//! the model. The runner forwards deltas to its event handler as they
//! arrive, and the abort flag is checked between chunks so a cancelled
//! session stops mid-stream with whatever text was already received.

use crate::{ChatRequest, OpenAiClient, UsageInfo};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

/// A single event from an SSE stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// An incremental text content delta.
    TextDelta(String),
    /// An incremental reasoning/thinking delta.
    ReasoningDelta(String),
    /// A tool call chunk (accumulated by index until complete).
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    /// Response id and model, from the first chunk that carries them.
    Meta {
        id: Option<String>,
        model: Option<String>,
    },
    /// The finish reason reported on the final choice chunk.
    Finish(String),
    /// Token usage information (sent in the final chunk when requested).
    Usage(UsageInfo),
    /// The stream is complete.
    Done,
}

/// Result of a live stream: the events received, and whether the stream was
/// cut short by the abort flag.
#[derive(Debug)]
pub struct StreamOutcome {
    pub events: Vec<StreamEvent>,
    pub aborted: bool,
}

/// Per-response metadata assembled from stream events. Ephemeral; consumed
/// for accounting and logging, never stored in history.
#[derive(Debug, Clone, Default)]
pub struct TurnMeta {
    pub response_id: Option<String>,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<UsageInfo>,
}

impl TurnMeta {
    /// Build metadata from a completed (or aborted) event sequence.
    pub fn from_events(events: &[StreamEvent]) -> Self {
        let mut meta = TurnMeta::default();
        for event in events {
            match event {
                StreamEvent::Meta { id, model } => {
                    if meta.response_id.is_none() {
                        meta.response_id = id.clone();
                    }
                    if meta.model.is_none() {
                        meta.model = model.clone();
                    }
                }
                StreamEvent::Finish(reason) => meta.finish_reason = Some(reason.clone()),
                StreamEvent::Usage(usage) => meta.usage = Some(usage.clone()),
                _ => {}
            }
        }
        meta
    }
}

/// Raw SSE data chunk.
#[derive(Deserialize, Debug)]
struct StreamChunk {
    id: Option<String>,
    model: Option<String>,
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

impl OpenAiClient {
    /// Send a streaming chat request, invoking `on_event` for each event as
    /// it arrives off the wire.
    ///
    /// `stop` is polled between chunks; when it flips, the stream is dropped
    /// and the events received so far are returned with `aborted: true`.
    /// The full event list is returned either way so the caller can
    /// assemble text, tool calls and usage post-hoc.
    pub async fn chat_stream_live(
        &self,
        body: &ChatRequest,
        stop: &AtomicBool,
        mut on_event: impl FnMut(&StreamEvent),
    ) -> Result<StreamOutcome, String> {
        let mut stream_body =
            serde_json::to_value(body).map_err(|e| format!("failed to serialize request: {e}"))?;
        stream_body["stream"] = serde_json::Value::Bool(true);
        stream_body["stream_options"] = serde_json::json!({ "include_usage": true });

        debug!("Sending streaming chat request");

        let mut resp = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&stream_body)
            .send()
            .await
            .map_err(|e| format!("streaming request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("API HTTP {status}: {text}"));
        }

        let mut events = Vec::new();
        let mut buffer = String::new();
        let mut done = false;

        // Read the SSE stream incrementally via chunk() so long responses
        // don't hit a single-body timeout, and so aborts take effect
        // between chunks instead of after the full body.
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| format!("failed to read streaming chunk: {e}"))?
        {
            if stop.load(Ordering::Relaxed) {
                debug!("Stream aborted after {} events", events.len());
                return Ok(StreamOutcome {
                    events,
                    aborted: true,
                });
            }

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process all complete lines in the buffer.
            while let Some(newline_pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline_pos).collect();
                let line = line.trim();
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if line == "data: [DONE]" {
                    let ev = StreamEvent::Done;
                    on_event(&ev);
                    events.push(ev);
                    done = true;
                    break;
                }
                if let Some(data) = line.strip_prefix("data: ") {
                    let before = events.len();
                    parse_sse_data(data, &mut events);
                    for ev in &events[before..] {
                        on_event(ev);
                    }
                }
            }

            if done {
                break;
            }
        }

        // Process any remaining data in the buffer (incomplete final line).
        let remaining = buffer.trim();
        if !remaining.is_empty()
            && remaining != "data: [DONE]"
            && let Some(data) = remaining.strip_prefix("data: ")
        {
            let before = events.len();
            parse_sse_data(data, &mut events);
            for ev in &events[before..] {
                on_event(ev);
            }
        }

        if !events.iter().any(|e| matches!(e, StreamEvent::Done)) {
            let ev = StreamEvent::Done;
            on_event(&ev);
            events.push(ev);
        }

        debug!("Stream completed with {} events", events.len());
        Ok(StreamOutcome {
            events,
            aborted: false,
        })
    }
}

/// Parse a single SSE `data:` payload into stream events.
fn parse_sse_data(data: &str, events: &mut Vec<StreamEvent>) {
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            if (chunk.id.is_some() || chunk.model.is_some())
                && !events.iter().any(|e| matches!(e, StreamEvent::Meta { .. }))
            {
                events.push(StreamEvent::Meta {
                    id: chunk.id,
                    model: chunk.model,
                });
            }

            if let Some(usage) = chunk.usage {
                events.push(StreamEvent::Usage(usage));
            }

            if let Some(choices) = chunk.choices {
                for choice in choices {
                    if let Some(delta) = choice.delta {
                        if let Some(content) = delta.content
                            && !content.is_empty()
                        {
                            events.push(StreamEvent::TextDelta(content));
                        }
                        if let Some(reasoning) = delta.reasoning
                            && !reasoning.is_empty()
                        {
                            events.push(StreamEvent::ReasoningDelta(reasoning));
                        }
                        if let Some(tool_calls) = delta.tool_calls {
                            for tc in tool_calls {
                                let func = tc.function.unwrap_or(StreamFunctionDelta {
                                    name: None,
                                    arguments: None,
                                });
                                events.push(StreamEvent::ToolCallDelta {
                                    index: tc.index.unwrap_or(0),
                                    id: tc.id,
                                    name: func.name,
                                    arguments_delta: func.arguments.unwrap_or_default(),
                                });
                            }
                        }
                    }
                    if let Some(reason) = choice.finish_reason {
                        trace!("Stream finish_reason: {reason}");
                        events.push(StreamEvent::Finish(reason));
                    }
                }
            }
        }
        Err(e) => {
            warn!("Failed to parse SSE chunk: {e} — data: {data}");
        }
    }
}

/// Assemble a complete text string from a sequence of stream events.
pub fn collect_text(events: &[StreamEvent]) -> String {
    let mut text = String::new();
    for event in events {
        if let StreamEvent::TextDelta(delta) = event {
            text.push_str(delta);
        }
    }
    text
}

/// Assemble complete tool calls from fragment deltas, keyed by index.
///
/// Fragments for the same index may arrive spread across many chunks: the
/// first usually carries the id and name, the rest append argument text.
/// A fragment with no id on any chunk gets a synthetic `call_{index}` id so
/// the tool-result linkage stays intact.
pub fn collect_tool_calls(events: &[StreamEvent]) -> Vec<crate::ToolCall> {
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Partial {
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    }

    let mut partials: BTreeMap<usize, Partial> = BTreeMap::new();
    for event in events {
        if let StreamEvent::ToolCallDelta {
            index,
            id,
            name,
            arguments_delta,
        } = event
        {
            let partial = partials.entry(*index).or_default();
            if partial.id.is_none() {
                partial.id = id.clone();
            }
            if partial.name.is_none() {
                partial.name = name.clone();
            }
            partial.arguments.push_str(arguments_delta);
        }
    }

    partials
        .into_iter()
        .filter(|(_, p)| p.name.is_some())
        .map(|(index, p)| crate::ToolCall {
            id: p.id.unwrap_or_else(|| format!("call_{index}")),
            call_type: crate::CallType::Function,
            function: crate::FunctionCallData {
                name: p.name.unwrap_or_default(),
                arguments: p.arguments,
            },
        })
        .collect()
}

/// Extract usage info from stream events (if present).
pub fn extract_usage(events: &[StreamEvent]) -> Option<UsageInfo> {
    for event in events.iter().rev() {
        if let StreamEvent::Usage(usage) = event {
            return Some(usage.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_text_from_deltas() {
        let events = vec![
            StreamEvent::TextDelta("Hello ".into()),
            StreamEvent::TextDelta("world!".into()),
            StreamEvent::Done,
        ];
        assert_eq!(collect_text(&events), "Hello world!");
    }

    #[test]
    fn extract_usage_from_events() {
        let events = vec![
            StreamEvent::TextDelta("hi".into()),
            StreamEvent::Usage(UsageInfo {
                prompt_tokens: Some(100),
                completion_tokens: Some(50),
                total_tokens: Some(150),
            }),
            StreamEvent::Done,
        ];
        let usage = extract_usage(&events).unwrap();
        assert_eq!(usage.prompt_tokens, Some(100));
    }

    #[test]
    fn extract_usage_returns_none_when_missing() {
        let events = vec![StreamEvent::TextDelta("hi".into()), StreamEvent::Done];
        assert!(extract_usage(&events).is_none());
    }

    #[test]
    fn sse_chunk_parses_into_events() {
        let data = r#"{"id":"resp-1","model":"gpt-4o","choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        let mut events = Vec::new();
        parse_sse_data(data, &mut events);
        assert!(matches!(&events[0], StreamEvent::Meta { id: Some(i), .. } if i == "resp-1"));
        assert!(matches!(&events[1], StreamEvent::TextDelta(t) if t == "Hi"));
    }

    #[test]
    fn sse_tool_call_fragments_keep_index() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call-2","function":{"name":"grep","arguments":"{\"pat"}}]},"finish_reason":null}]}"#;
        let mut events = Vec::new();
        parse_sse_data(data, &mut events);
        assert!(matches!(
            &events[0],
            StreamEvent::ToolCallDelta { index: 1, id: Some(i), name: Some(n), arguments_delta }
                if i == "call-2" && n == "grep" && arguments_delta == "{\"pat"
        ));
    }

    #[test]
    fn tool_calls_assemble_across_fragments() {
        let events = vec![
            StreamEvent::ToolCallDelta {
                index: 0,
                id: Some("call-1".into()),
                name: Some("grep".into()),
                arguments_delta: "{\"q\": ".into(),
            },
            StreamEvent::ToolCallDelta {
                index: 1,
                id: None,
                name: Some("read".into()),
                arguments_delta: "{}".into(),
            },
            StreamEvent::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments_delta: "\"x\"}".into(),
            },
            StreamEvent::Done,
        ];
        let calls = collect_tool_calls(&events);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call-1");
        assert_eq!(calls[0].function.name, "grep");
        assert_eq!(calls[0].function.arguments, "{\"q\": \"x\"}");
        // Missing id gets a synthetic one derived from the index.
        assert_eq!(calls[1].id, "call_1");
    }

    #[test]
    fn turn_meta_assembles_from_events() {
        let events = vec![
            StreamEvent::Meta {
                id: Some("resp-9".into()),
                model: Some("gpt-4o".into()),
            },
            StreamEvent::TextDelta("ok".into()),
            StreamEvent::Finish("stop".into()),
            StreamEvent::Usage(UsageInfo {
                prompt_tokens: Some(10),
                completion_tokens: Some(2),
                total_tokens: Some(12),
            }),
            StreamEvent::Done,
        ];
        let meta = TurnMeta::from_events(&events);
        assert_eq!(meta.response_id.as_deref(), Some("resp-9"));
        assert_eq!(meta.finish_reason.as_deref(), Some("stop"));
        assert_eq!(meta.usage.unwrap().total_tokens, Some(12));
    }
}
