//! Context window management: estimation, pruning, summarization, memory.
//!
//! The context window is the scarcest resource in any LLM agent. This module
//! provides layered strategies for keeping usage under control, escalating
//! with estimated pressure:
//!
//! 1. **[`estimator`]** — cheap character-based token estimation plus the
//!    [`ContextConfig`] thresholds that decide when each layer engages.
//!
//! 2. **[`pruner`]** — trims or clears old tool results in a working copy of
//!    the message list. Highest ROI recovery: no LLM call needed, and the
//!    stored history keeps the originals.
//!
//! 3. **[`summarizer`]** — staged LLM summarization backing the two heavier
//!    recovery paths: memory flush (distill durable knowledge to the note
//!    file) and compaction (replace old history with a summary message).
//!
//! 4. **[`memory`]** — the per-workdir memory note: serialized timestamped
//!    appends, read-back with truncation for prompt injection.
//!
//! All layers run automatically inside the
//! [`Runner`](crate::agent::runner::Runner) loop.

pub mod estimator;
pub mod memory;
pub mod pruner;
pub mod summarizer;

// Re-export commonly used items at the module level.
pub use estimator::{ContextConfig, estimate_for_messages, estimate_tokens};
pub use memory::{MemoryStore, read_memory_note};
pub use pruner::prune;
pub use summarizer::{Summarizer, compaction_cutoff_index};
