//! Run one prompt through the agent loop against an OpenAI-compatible
//! endpoint and stream the response to stdout.
//!
//! Reads the API key from the `OPENAI_API_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Basic run
//! confab "Summarize the README in this directory"
//!
//! # Different endpoint and model
//! confab --base-url http://localhost:11434/v1 --model llama3.1 "..."
//!
//! # Ask before every tool call, preview file changes
//! confab --ask --preview "Refactor src/config.rs"
//!
//! # Persistent memory across sessions
//! confab --memory-file ~/.confab/MEMORY.md "Continue yesterday's work"
//!
//! # Verbose loop internals
//! RUST_LOG=confab=debug confab "..."
//! ```

use clap::Parser;
use confab::prelude::*;
use schemars::JsonSchema;
use serde::Deserialize;
use std::io::Write as _;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Run one prompt through a tool-using agent loop.
///
/// Reads the API key from the OPENAI_API_KEY environment variable.
#[derive(Parser)]
#[command(name = "confab")]
struct Cli {
    /// The user prompt
    prompt: String,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    base_url: String,

    /// Model to use
    #[arg(long, default_value = confab::DEFAULT_MODEL)]
    model: String,

    /// Working directory for file tools
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Session id; reusing an id continues its history for the process
    /// lifetime
    #[arg(long, default_value = "cli")]
    session: String,

    /// Ask on stdin before every tool call
    #[arg(long)]
    ask: bool,

    /// Show file changes and ask before writing
    #[arg(long)]
    preview: bool,

    /// Maximum loop iterations
    #[arg(long, default_value_t = 50)]
    max_iterations: u32,

    /// Maximum tokens per response
    #[arg(long, default_value_t = 4096)]
    max_tokens: u32,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    /// Path to a persistent memory note
    #[arg(long)]
    memory_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| "OPENAI_API_KEY environment variable is not set".to_string())?;
    let client = OpenAiClient::new(&cli.base_url, api_key)?;

    let workdir = cli
        .workdir
        .canonicalize()
        .map_err(|e| format!("invalid workdir '{}': {e}", cli.workdir.display()))?;

    let tools = demo_tool_set();
    let store: Arc<MemorySessionStore> = Arc::new(MemorySessionStore::new());
    let router = Arc::new(DecisionRouter::new());
    let abort = Arc::new(AtomicBool::new(false));

    // Ctrl-C flips the abort flag; the loop stops at the next suspension
    // point and prints whatever was already streamed.
    let abort_signal = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, stopping after the current step...");
            abort_signal.store(true, Ordering::Relaxed);
        }
    });

    let mut config = AgentConfig::new(&cli.model, default_system_prompt())
        .with_max_iterations(cli.max_iterations)
        .with_max_tokens(cli.max_tokens)
        .with_temperature(cli.temperature)
        .with_retries(3)
        .with_workdir(&workdir);
    if cli.ask {
        config = config.with_permission_mode(PermissionMode::Ask);
    }
    if cli.preview {
        config = config.with_preview_mode(PreviewMode::Ask);
    }
    if let Some(path) = &cli.memory_file {
        config = config.with_memory_file(path);
    }

    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with(CliHandler {
            router: router.clone(),
        });

    let runner = Runner::new(&client, &tools, store, config)
        .with_event_handler(&handler)
        .with_router(router)
        .with_abort(abort);

    let outcome = runner
        .run(&cli.session, &cli.prompt)
        .await
        .map_err(|e| e.message)?;

    println!();
    if outcome.aborted {
        eprintln!("[aborted after {} iteration(s)]", outcome.iterations_used);
    } else {
        eprintln!(
            "[{} iteration(s), {} token(s), {:.1}s]",
            outcome.iterations_used,
            outcome.usage.total_tokens.unwrap_or(0),
            outcome.duration.as_secs_f64(),
        );
    }
    Ok(())
}

fn default_system_prompt() -> String {
    "You are a careful assistant working in the user's directory. \
     Use the available tools to inspect and modify files. Keep the todo \
     list current on multi-step tasks, and finish with a concise summary \
     of what you did."
        .to_string()
}

// ── Demo tools ─────────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct ReadFileArgs {
    /// Path to read, relative to the working directory.
    path: String,
}

#[derive(Deserialize, JsonSchema)]
struct ListDirArgs {
    /// Directory to list, relative to the working directory.
    #[serde(default)]
    path: Option<String>,
}

fn demo_tool_set() -> ToolSet {
    ToolSet::new()
        .with_arg_validation(true)
        .with_default_timeout(Some(std::time::Duration::from_secs(30)))
        .with(ThinkTool)
        .with(TodoTool::new())
        .with(FnTool::new(
            ToolDef::new(
                "read_file",
                "Read a text file from the working directory.",
                json_schema_for::<ReadFileArgs>(),
            ),
            |args: ReadFileArgs, ctx: ToolContext| async move {
                let path = ctx.workdir.join(&args.path);
                if !ctx.path_allowed(&path) {
                    return ToolOutcome::error(format!("path '{}' is outside the working directory", args.path));
                }
                match std::fs::read_to_string(&path) {
                    Ok(content) => ToolOutcome::ok(content),
                    Err(e) => ToolOutcome::error(format!("could not read '{}': {e}", args.path)),
                }
            },
        ))
        .with(FnTool::new(
            ToolDef::new(
                "list_dir",
                "List the entries of a directory in the working directory.",
                json_schema_for::<ListDirArgs>(),
            ),
            |args: ListDirArgs, ctx: ToolContext| async move {
                let rel = args.path.unwrap_or_else(|| ".".into());
                let path = ctx.workdir.join(&rel);
                if !ctx.path_allowed(&path) {
                    return ToolOutcome::error(format!("path '{rel}' is outside the working directory"));
                }
                let entries = match std::fs::read_dir(&path) {
                    Ok(entries) => entries,
                    Err(e) => return ToolOutcome::error(format!("could not list '{rel}': {e}")),
                };
                let mut names: Vec<String> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| {
                        let suffix = if e.path().is_dir() { "/" } else { "" };
                        format!("{}{suffix}", e.file_name().to_string_lossy())
                    })
                    .collect();
                names.sort();
                ToolOutcome::ok(names.join("\n"))
            },
        ))
        .with(WriteFileTool)
}

#[derive(Deserialize, JsonSchema)]
struct WriteFileArgs {
    /// Path to write, relative to the working directory.
    path: String,
    /// Full new content of the file.
    content: String,
}

/// File writer with preview support: the proposed content can be inspected
/// and edited before the write happens.
struct WriteFileTool;

impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "write_file",
            "Create or overwrite a text file in the working directory.",
            json_schema_for::<WriteFileArgs>(),
        )
    }

    fn is_mutation(&self) -> bool {
        true
    }

    fn change_preview(
        &self,
        arguments: &serde_json::Value,
    ) -> Option<confab::tools::PendingChange> {
        Some(confab::tools::PendingChange {
            path: arguments.get("path")?.as_str()?.to_string(),
            content_key: "content".into(),
            new_content: arguments.get("content")?.as_str()?.to_string(),
        })
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        let arguments = arguments.to_string();
        let ctx = ctx.clone();
        Box::pin(async move {
            let args: WriteFileArgs = match parse_tool_args(&arguments) {
                Ok(a) => a,
                Err(e) => return ToolOutcome::error(e),
            };
            let path = ctx.workdir.join(&args.path);
            if !ctx.path_allowed(&path) {
                return ToolOutcome::error(format!(
                    "path '{}' is outside the working directory",
                    args.path
                ));
            }
            if let Some(parent) = path.parent()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                return ToolOutcome::error(format!("could not create directories: {e}"));
            }
            match std::fs::write(&path, &args.content) {
                Ok(()) => ToolOutcome::ok(format!(
                    "wrote {} bytes to {}",
                    args.content.len(),
                    args.path
                )),
                Err(e) => ToolOutcome::error(format!("could not write '{}': {e}", args.path)),
            }
        })
    }
}

// ── CLI event handler ──────────────────────────────────────────────

/// Streams assistant text to stdout and answers permission/preview
/// requests from the terminal.
struct CliHandler {
    router: Arc<DecisionRouter>,
}

impl EventHandler for CliHandler {
    fn on_event(&self, event: &AgentEvent<'_>) {
        match event {
            AgentEvent::TextDelta(delta) => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            AgentEvent::ToolExecuting { name, arguments } => {
                let preview: String = arguments.chars().take(100).collect();
                eprintln!("  [tool] {name}({preview})");
            }
            AgentEvent::ToolResult {
                name,
                success: false,
                ..
            } => {
                eprintln!("  [tool] {name} failed");
            }
            AgentEvent::PermissionRequested {
                request_id,
                name,
                arguments,
            } => {
                // Prompt on a plain thread so the loop's abort polling
                // stays responsive while we wait for input.
                let router = self.router.clone();
                let request_id = *request_id;
                let name = name.to_string();
                let arguments = arguments.to_string();
                std::thread::spawn(move || {
                    eprintln!("\n  Tool request: {name}({arguments})");
                    eprint!("  Allow? [y/N] ");
                    let mut line = String::new();
                    let approved = std::io::stdin().read_line(&mut line).is_ok()
                        && matches!(line.trim(), "y" | "Y" | "yes");
                    let decision = if approved {
                        PermissionDecision::approve()
                    } else {
                        PermissionDecision::deny("denied at the terminal")
                    };
                    router.resolve_permission(request_id, decision);
                });
            }
            AgentEvent::PreviewRequested { request_id, count } => {
                let router = self.router.clone();
                let request_id = *request_id;
                let count = *count;
                std::thread::spawn(move || {
                    eprint!("\n  Apply {count} file change(s)? [y/N] ");
                    let mut line = String::new();
                    let approved = std::io::stdin().read_line(&mut line).is_ok()
                        && matches!(line.trim(), "y" | "Y" | "yes");
                    let verdict = if approved {
                        PreviewVerdict::approve()
                    } else {
                        PreviewVerdict::reject()
                    };
                    router.resolve_preview(request_id, verdict);
                });
            }
            AgentEvent::FileChangesRecorded(changes) => {
                for change in *changes {
                    eprintln!(
                        "  [{:?}] {} (+{} -{})",
                        change.kind, change.path, change.added_lines, change.removed_lines
                    );
                }
            }
            _ => {}
        }
    }
}
