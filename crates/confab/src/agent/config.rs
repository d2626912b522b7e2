//! Configuration types for the [`Runner`](super::runner::Runner).
//!
//! Context management (pruning, memory flush, compaction) is **enabled by
//! default** with thresholds from [`ContextConfig`]. Override specific
//! modules through [`AgentConfig`] struct fields, or use the builder
//! methods for common settings.
//!
//! # Examples
//!
//! Minimal configuration:
//!
//! ```ignore
//! let config = AgentConfig::new("gpt-4o", "You are helpful.");
//! ```
//!
//! Customized configuration with builder methods:
//!
//! ```ignore
//! let config = AgentConfig::new("gpt-4o", "You are helpful.")
//!     .with_max_iterations(30)
//!     .with_temperature(0.3)
//!     .with_retries(3)
//!     .with_permission_mode(PermissionMode::Ask);
//! ```

use crate::api::retry::RetryConfig;
use crate::context::ContextConfig;
use std::path::PathBuf;

// ── Generic toggle ────────────────────────────────────────────────

/// Generic enabled/disabled wrapper for module configurations.
///
/// Captures the common pattern of `{ enabled: bool, config: T }`. When
/// `enabled` is `false`, the module is skipped regardless of the inner
/// config values.
#[derive(Debug, Clone)]
pub struct Toggle<T: Default> {
    /// Whether this module is active.
    pub enabled: bool,
    /// Module-specific configuration.
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

// ── Permission and preview modes ──────────────────────────────────

/// How tool calls are authorized before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    /// Every tool call runs without asking.
    #[default]
    Auto,
    /// Every tool call emits a permission request and waits for an
    /// external decision before running.
    Ask,
}

/// Whether file-mutating tool calls go through a before/after preview
/// approval step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreviewMode {
    /// Mutations execute directly.
    #[default]
    Disabled,
    /// Mutations emit a preview batch and wait for approval. The approver
    /// may return edited content, which is substituted into the call.
    Ask,
}

// ── Memory config ─────────────────────────────────────────────────

/// Configuration for the persistent memory note.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Path to the memory note file. When set, the runner reads this file
    /// when rebuilding the system prompt and appends flush summaries to it.
    pub memory_file: Option<PathBuf>,
    /// Maximum number of lines to include from the note before truncation.
    pub max_memory_lines: usize,
    /// Model used for flush summarization. Falls back to the main model.
    pub flush_model: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_file: None,
            max_memory_lines: 200,
            flush_model: None,
        }
    }
}

/// Memory flush module configuration.
pub type AgentMemoryConfig = Toggle<MemoryConfig>;

// ── Compaction config ─────────────────────────────────────────────

/// Configuration for history compaction.
#[derive(Debug, Clone, Default)]
pub struct CompactionConfig {
    /// Model used for compaction summarization. Falls back to the main model.
    pub model: Option<String>,
}

/// Compaction module configuration.
pub type AgentCompactionConfig = Toggle<CompactionConfig>;

// ── Main agent config ─────────────────────────────────────────────

/// Configuration for a [`Runner`](super::runner::Runner) session.
///
/// Controls model selection, iteration limits, sampling, retry policy,
/// context thresholds, and the permission/preview gates. Callers only need
/// to set `model` and optionally `system_prompt` for standard use.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model identifier (e.g. `"gpt-4o"`).
    pub model: String,
    /// Base system prompt. Memory notes and todo state are appended to it
    /// when the per-iteration prompt is rebuilt.
    pub system_prompt: Option<String>,
    /// Maximum loop iterations before the session errors out.
    pub max_iterations: u32,
    /// Maximum tokens per LLM response.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Retry configuration for transient API failures.
    pub retry: RetryConfig,
    /// Context-window thresholds and budgets.
    pub context: ContextConfig,
    /// Working directory handed to tools through the `ToolContext`.
    pub workdir: PathBuf,
    /// How tool calls are authorized.
    pub permission_mode: PermissionMode,
    /// Whether mutations go through change preview.
    pub preview_mode: PreviewMode,
    /// Memory flush configuration. Enabled by default; only fires when a
    /// memory file is configured and the usage ratio crosses the flush
    /// threshold.
    pub memory: AgentMemoryConfig,
    /// Compaction configuration. Enabled by default.
    pub compaction: AgentCompactionConfig,
}

impl AgentConfig {
    /// Create a config with a model and system prompt.
    pub fn new(model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: Some(system_prompt.into()),
            ..Default::default()
        }
    }

    // ── Builder methods ───────────────────────────────────────────
    //
    // Only routinely customized settings get builder methods. Threshold
    // knobs live on the `context` field and can be set directly.

    /// Set the maximum number of loop iterations.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the maximum tokens per LLM response.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Enable automatic retries for transient API failures (429, 5xx,
    /// network errors). Uses exponential backoff.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry = RetryConfig::with_retries(max_retries);
        self
    }

    /// Set the context-window configuration.
    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    /// Set the working directory for tool execution.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Set the permission mode.
    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    /// Set the preview mode for file mutations.
    pub fn with_preview_mode(mut self, mode: PreviewMode) -> Self {
        self.preview_mode = mode;
        self
    }

    /// Set the path to the persistent memory note.
    pub fn with_memory_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.memory.config.memory_file = Some(path.into());
        self
    }

    /// Validate the configuration. Checks the context thresholds and the
    /// iteration limit.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_iterations == 0 {
            return Err("max_iterations must be positive".into());
        }
        self.context.validate()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            system_prompt: None,
            max_iterations: 50,
            max_tokens: 4096,
            temperature: 0.7,
            retry: RetryConfig::default(),
            context: ContextConfig::default(),
            workdir: PathBuf::from("."),
            permission_mode: PermissionMode::default(),
            preview_mode: PreviewMode::default(),
            memory: AgentMemoryConfig::default(),
            compaction: AgentCompactionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(AgentConfig::default().validate().is_ok());
        assert_eq!(AgentConfig::default().max_iterations, 50);
    }

    #[test]
    fn zero_iterations_rejected() {
        let config = AgentConfig::default().with_max_iterations(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_chains_compose() {
        let config = AgentConfig::new("gpt-4o", "help")
            .with_max_iterations(7)
            .with_temperature(0.1)
            .with_permission_mode(PermissionMode::Ask)
            .with_memory_file("/tmp/MEMORY.md");
        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.permission_mode, PermissionMode::Ask);
        assert!(config.memory.config.memory_file.is_some());
    }

    #[test]
    fn toggle_disabled_keeps_inner_defaults() {
        let memory = AgentMemoryConfig::disabled();
        assert!(!memory.enabled);
        assert_eq!(memory.config.max_memory_lines, 200);
    }
}
