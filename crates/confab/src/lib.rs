//! Agent execution loop and context-window manager for tool-using chat agents.
//!
//! `confab` provides the runtime core of a chat agent: the
//! [`Runner`](agent::runner::Runner) — a reusable agentic loop that sends a
//! conversation to an OpenAI-compatible chat completions endpoint, executes
//! the tool calls the model requests, appends the results, and repeats until
//! the model produces a text-only response or a limit is reached — plus the
//! context-window machinery (estimation, pruning, summarization, memory
//! flush, compaction) that keeps long sessions inside the model's window.
//!
//! # Getting started
//!
//! ```ignore
//! use confab::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api_key = std::env::var("OPENAI_API_KEY")?;
//!     let client = OpenAiClient::new("https://api.openai.com/v1", api_key)?;
//!
//!     let tools = ToolSet::new().with(EchoTool);
//!     let store = Arc::new(MemorySessionStore::new());
//!     let config = AgentConfig::new("gpt-4o", "You are a helpful assistant.");
//!
//!     let outcome = Runner::new(&client, &tools, store, config)
//!         .with_event_handler(&LoggingHandler)
//!         .run("sess-1", "Summarize src/main.rs")
//!         .await?;
//!
//!     println!("{}", outcome.text());
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Run the agent loop:** [`Runner`](agent::runner::Runner) and
//!   [`AgentConfig`](agent::config::AgentConfig).
//! - **Define tools:** the [`ToolExecutor`](tools::core::ToolExecutor) and
//!   [`Tool`](tools::core::Tool) traits, [`ToolSet`](tools::core::ToolSet)
//!   for collection/dispatch.
//! - **Observe the loop:** implement
//!   [`EventHandler`](agent::events::EventHandler); every stream delta,
//!   message record, permission request, and status transition flows through
//!   it. Permission and preview decisions come back through the
//!   [`DecisionRouter`](agent::decision::DecisionRouter).
//! - **Manage the window:** [`ContextConfig`](context::estimator::ContextConfig)
//!   for thresholds, [`context::pruner`] for tool-result trimming,
//!   [`context::summarizer`] for staged summarization, memory flush, and
//!   compaction.
//!
//! # Design principles
//!
//! 1. **The session history is append-only.** Pruning rewrites a working
//!    copy for the current call; compaction is the only operation that
//!    rewrites stored history, and it does so explicitly through the
//!    [`SessionStore`](agent::session::SessionStore).
//! 2. **Provider-reported usage is authoritative.** The character-based
//!    estimator drives pruning and flush thresholds; accounting always uses
//!    the token counts the provider returns.
//! 3. **Collaborators are injected.** The runner takes its session store,
//!    tool executor, event handler, decision router, and compliance engine
//!    as explicit arguments. No globals, no ambient state.

pub mod agent;
pub mod api;
pub mod context;
pub mod prelude;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

/// Default model when the caller does not specify one.
pub const DEFAULT_MODEL: &str = "gpt-4o";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. This is the bridge between strong Rust types
/// and the `serde_json::Value` that the OpenAI function-calling API expects.
///
/// # Example
///
/// ```
/// use confab::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct GrepArgs {
///     pattern: String,
///     #[serde(default)]
///     path: Option<String>,
/// }
///
/// let schema = json_schema_for::<GrepArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"pattern".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body in the OpenAI chat-completions shape.
/// Unused optional fields are omitted from serialization.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub messages: Vec<Message>,

    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

/// Streaming options. `include_usage` asks the provider to append a final
/// usage chunk to the SSE stream.
#[derive(Serialize, Debug)]
pub struct StreamOptions {
    pub include_usage: bool,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

/// JSON output format type.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ResponseFormatType {
    #[serde(rename = "json_object")]
    JsonObject,
    #[serde(rename = "json_schema")]
    JsonSchema,
}

/// JSON output mode.
#[derive(Serialize, Debug)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub fmt_type: ResponseFormatType,
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Message content: either plain text or an ordered list of typed parts.
/// Serializes as a bare string or an array, matching the wire format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// The text of this content: the string itself, or all text parts
    /// joined with newlines.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageRef { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Whether this content carries any image parts.
    pub fn has_images(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts
                .iter()
                .any(|p| matches!(p, ContentPart::ImageRef { .. })),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// A typed content part inside a multimodal message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    /// Reference to image data (a URL or data URI).
    #[serde(rename = "image_url")]
    ImageRef { image_url: ImageUrl },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

/// A message in the conversation.
///
/// Every `Tool` message's `tool_call_id` refers to the id of a tool call on
/// a preceding assistant message. Context management rewrites tool-message
/// content but never removes the message, so the pairing always holds.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    /// The message's text content, empty when absent.
    pub fn text(&self) -> String {
        self.content.as_ref().map(|c| c.as_text()).unwrap_or_default()
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the API (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call returned by the model. `function.arguments` is an untrusted
/// provider-streamed string; parsing and repair happen at dispatch time.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

// ── Response types ─────────────────────────────────────────────────

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    id: Option<String>,
    model: Option<String>,
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Clean return type from `OpenAiClient::chat()`.
#[derive(Debug)]
pub struct ChatCompletion {
    pub id: Option<String>,
    pub model: Option<String>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

/// Token usage statistics as reported by the provider. These counts are
/// authoritative for accounting; the character estimator is not.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl UsageInfo {
    /// Fold another usage report into this one, field by field.
    pub fn accumulate(&mut self, other: &UsageInfo) {
        self.prompt_tokens =
            Some(self.prompt_tokens.unwrap_or(0) + other.prompt_tokens.unwrap_or(0));
        self.completion_tokens =
            Some(self.completion_tokens.unwrap_or(0) + other.completion_tokens.unwrap_or(0));
        self.total_tokens = Some(self.total_tokens.unwrap_or(0) + other.total_tokens.unwrap_or(0));
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for any OpenAI-compatible chat completions endpoint.
///
/// Errors from the transport and from the API are surfaced as strings that
/// include the HTTP status and the raw response body, so callers can
/// classify them (see [`api::retry`]) without a side channel.
pub struct OpenAiClient {
    pub(crate) client: reqwest::Client,
    pub(crate) api_key: String,
    base_url: String,
}

impl OpenAiClient {
    /// Create a new client for the given base URL (e.g.
    /// `https://api.openai.com/v1`) and API key.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("confab/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url,
        })
    }

    /// The chat completions URL this client posts to.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Send a chat completion request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, String> {
        let msg_count = body.messages.len();
        let tool_count = body.tools.as_ref().map_or(0, |t| t.len());
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}, temp={}",
            body.model.as_deref().unwrap_or("(none)"),
            msg_count,
            tool_count,
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        let elapsed = start.elapsed();
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            elapsed.as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            // Keep the raw body in the error string so classifiers can see
            // provider-specific messages (context limits, rate limits).
            return Err(format!("API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(err) = parsed.error {
            return Err(format!("API error: {}", err.message));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        let choice = parsed.choices.and_then(|c| c.into_iter().next());

        match choice {
            Some(c) => Ok(ChatCompletion {
                id: parsed.id,
                model: parsed.model,
                content: c.message.content,
                tool_calls: c.message.tool_calls.unwrap_or_default(),
                usage: parsed.usage,
                finish_reason: c.finish_reason,
            }),
            None => Ok(ChatCompletion {
                id: parsed.id,
                model: parsed.model,
                content: None,
                tool_calls: vec![],
                usage: parsed.usage,
                finish_reason: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.text(), "hello");

        let user = Message::user("world");
        assert_eq!(user.role, MessageRole::User);

        let tool = Message::tool_result("call-1", "result");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn content_serializes_as_string_or_array() {
        let plain = Message::user("hi");
        let json = serde_json::to_value(&plain).unwrap();
        assert_eq!(json["content"], "hi");

        let multi = Message::user(MessageContent::Parts(vec![
            ContentPart::Text {
                text: "look at this".into(),
            },
            ContentPart::ImageRef {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".into(),
                },
            },
        ]));
        let json = serde_json::to_value(&multi).unwrap();
        assert!(json["content"].is_array());
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
    }

    #[test]
    fn content_text_joins_parts_and_skips_images() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "a".into() },
            ContentPart::ImageRef {
                image_url: ImageUrl {
                    url: "https://example.com/x.png".into(),
                },
            },
            ContentPart::Text { text: "b".into() },
        ]);
        assert_eq!(content.as_text(), "a\nb");
        assert!(content.has_images());
    }

    #[test]
    fn chat_request_default_skips_none_fields() {
        let req = ChatRequest {
            model: Some("test-model".into()),
            messages: vec![Message::user("hi")],
            max_tokens: 100,
            temperature: 0.5,
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("stream").is_none());
        assert!(json.get("stop").is_none());
    }

    #[test]
    fn usage_accumulates_across_reports() {
        let mut total = UsageInfo::default();
        total.accumulate(&UsageInfo {
            prompt_tokens: Some(100),
            completion_tokens: Some(20),
            total_tokens: Some(120),
        });
        total.accumulate(&UsageInfo {
            prompt_tokens: Some(150),
            completion_tokens: Some(30),
            total_tokens: Some(180),
        });
        assert_eq!(total.prompt_tokens, Some(250));
        assert_eq!(total.completion_tokens, Some(50));
        assert_eq!(total.total_tokens, Some(300));
    }
}
