//! Agent runtime: the [`Runner`] execution loop and its supporting modules.
//!
//! This module contains everything needed to run an LLM agent session:
//!
//! - [`runner::Runner`] — the core execution loop. Start here.
//! - [`config::AgentConfig`] — model, iteration limits, context thresholds,
//!   permission and preview modes.
//! - [`events`] — [`EventHandler`] trait and [`AgentEvent`] enum for
//!   observing the loop. Includes [`LoggingHandler`],
//!   [`CompositeEventHandler`], and [`FnEventHandler`].
//! - [`decision`] — [`DecisionRouter`] for resolving permission and preview
//!   requests from outside the loop.
//! - [`gate`] — the per-call dispatch pipeline (parse, permission,
//!   compliance, preview, execution).
//! - [`loop_detector`] — repetitive-call detection with corrective hints.
//! - [`session`] — [`SessionStore`] seam plus the in-memory store.

pub mod config;
pub mod decision;
pub mod events;
pub mod gate;
pub mod loop_detector;
pub mod runner;
pub mod session;

// Re-export commonly used items at the module level.
pub use config::{AgentConfig, PermissionMode, PreviewMode, Toggle};
pub use decision::{DecisionRouter, PermissionDecision, PreviewItemDecision, PreviewVerdict};
pub use events::{
    AgentEvent, CompositeEventHandler, EventHandler, FileChange, FileChangeKind, FnEventHandler,
    LoggingHandler, NoopHandler, RunError, RunOutcome, SessionStatus,
};
pub use gate::{
    CharterPolicy, ComplianceEngine, ComplianceStatus, ComplianceVerdict, DispatchGate, ToolIntent,
};
pub use loop_detector::{LoopDetector, LoopVerdict};
pub use runner::Runner;
pub use session::{MemorySessionStore, SessionMeta, SessionStore};
