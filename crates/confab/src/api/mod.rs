//! API interaction layer: HTTP client support, streaming, and retry.
//!
//! These modules handle everything between the
//! [`Runner`](crate::agent::runner::Runner) loop and the chat completions
//! endpoint:
//!
//! - [`retry`] — transient error detection (408, 429, 5xx, network failures)
//!   with exponential backoff, plus the context-limit classifier the
//!   summarizer uses. Never retries 400/401 errors.
//! - [`streaming`] — SSE parser for incremental text and tool-call deltas,
//!   with abort checks between chunks. Produces
//!   [`StreamEvent`](streaming::StreamEvent) values and per-response
//!   [`TurnMeta`](streaming::TurnMeta).

pub mod retry;
pub mod streaming;

// Re-export commonly used items at the module level.
pub use retry::RetryConfig;
pub use streaming::{StreamEvent, StreamOutcome, TurnMeta};

use crate::{ChatCompletion, ChatRequest, OpenAiClient};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;

/// Boxed future returned by [`ModelClient`] methods, keeping the trait
/// dyn-compatible.
pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// Chat-completions seam between the loop and the provider.
///
/// [`OpenAiClient`] is the production implementation; tests drive the
/// runner with scripted implementations instead of a live endpoint.
pub trait ModelClient: Send + Sync {
    /// One non-streamed completion call.
    fn chat<'a>(&'a self, body: &'a ChatRequest) -> ClientFuture<'a, ChatCompletion>;

    /// One streamed completion call. Events are forwarded through
    /// `on_event` as they arrive; `stop` is polled between chunks.
    fn chat_stream_live<'a>(
        &'a self,
        body: &'a ChatRequest,
        stop: &'a AtomicBool,
        on_event: &'a mut (dyn FnMut(&StreamEvent) + Send),
    ) -> ClientFuture<'a, StreamOutcome>;
}

impl ModelClient for OpenAiClient {
    fn chat<'a>(&'a self, body: &'a ChatRequest) -> ClientFuture<'a, ChatCompletion> {
        Box::pin(OpenAiClient::chat(self, body))
    }

    fn chat_stream_live<'a>(
        &'a self,
        body: &'a ChatRequest,
        stop: &'a AtomicBool,
        on_event: &'a mut (dyn FnMut(&StreamEvent) + Send),
    ) -> ClientFuture<'a, StreamOutcome> {
        Box::pin(OpenAiClient::chat_stream_live(self, body, stop, on_event))
    }
}
