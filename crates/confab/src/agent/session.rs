//! Session persistence seam.
//!
//! The runner never owns its history: every recorded message, todo list,
//! and file change goes through a [`SessionStore`] handed in at
//! construction. The crate ships [`MemorySessionStore`] for the CLI and
//! tests; embedders provide their own store to put sessions in a database.

use crate::Message;
use crate::agent::events::{FileChange, SessionStatus};
use crate::tools::TodoItem;
use std::collections::HashMap;
use std::sync::Mutex;

/// Metadata for one session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub id: String,
    pub status: SessionStatus,
    /// The most recently recorded user prompt. Used to avoid re-appending
    /// an identical prompt when a session is resumed.
    pub last_prompt: Option<String>,
    /// Optional behavioral charter evaluated by the compliance engine.
    pub charter: Option<String>,
    /// Architecture decision records accompanying the charter. Passed to
    /// the compliance engine alongside every check.
    pub adrs: Vec<String>,
}

impl SessionMeta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Idle,
            last_prompt: None,
            charter: None,
            adrs: Vec::new(),
        }
    }
}

/// Storage for session metadata, history, todos, and file changes.
///
/// Implementations must be safe to share behind an `Arc` across tasks.
/// All methods are synchronous; stores backed by remote storage should
/// buffer writes internally.
pub trait SessionStore: Send + Sync {
    /// Fetch session metadata, `None` when the session does not exist.
    fn get_session(&self, session_id: &str) -> Result<Option<SessionMeta>, String>;

    /// Create or update session metadata.
    fn update_session(&self, meta: &SessionMeta) -> Result<(), String>;

    /// Full recorded message history, oldest first.
    fn get_history(&self, session_id: &str) -> Result<Vec<Message>, String>;

    /// Append one message to the history.
    fn record_message(&self, session_id: &str, message: &Message) -> Result<(), String>;

    /// Replace every message before `index` with a single summary message.
    /// Returns the number of messages removed.
    fn replace_messages_before_index_with_summary(
        &self,
        session_id: &str,
        index: usize,
        summary: Message,
    ) -> Result<usize, String>;

    /// Persist the todo checklist.
    fn save_todos(&self, session_id: &str, todos: &[TodoItem]) -> Result<(), String>;

    /// Current todo checklist, empty when none was saved.
    fn get_todos(&self, session_id: &str) -> Result<Vec<TodoItem>, String>;

    /// Append file-change records.
    fn add_file_changes(&self, session_id: &str, changes: &[FileChange]) -> Result<(), String>;

    /// All file changes recorded for the session.
    fn get_file_changes(&self, session_id: &str) -> Result<Vec<FileChange>, String>;
}

// ── In-memory store ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SessionRecord {
    meta: Option<SessionMeta>,
    history: Vec<Message>,
    todos: Vec<TodoItem>,
    file_changes: Vec<FileChange>,
}

/// In-memory [`SessionStore`] for the CLI and tests. Everything is lost on
/// drop.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Result<T, String> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| "session store lock poisoned".to_string())?;
        let record = sessions.entry(session_id.to_string()).or_default();
        Ok(f(record))
    }
}

impl SessionStore for MemorySessionStore {
    fn get_session(&self, session_id: &str) -> Result<Option<SessionMeta>, String> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| "session store lock poisoned".to_string())?;
        Ok(sessions.get(session_id).and_then(|r| r.meta.clone()))
    }

    fn update_session(&self, meta: &SessionMeta) -> Result<(), String> {
        self.with_record(&meta.id, |record| {
            record.meta = Some(meta.clone());
        })
    }

    fn get_history(&self, session_id: &str) -> Result<Vec<Message>, String> {
        self.with_record(session_id, |record| record.history.clone())
    }

    fn record_message(&self, session_id: &str, message: &Message) -> Result<(), String> {
        self.with_record(session_id, |record| {
            record.history.push(message.clone());
        })
    }

    fn replace_messages_before_index_with_summary(
        &self,
        session_id: &str,
        index: usize,
        summary: Message,
    ) -> Result<usize, String> {
        self.with_record(session_id, |record| {
            let cutoff = index.min(record.history.len());
            record.history.splice(0..cutoff, [summary]);
            cutoff
        })
    }

    fn save_todos(&self, session_id: &str, todos: &[TodoItem]) -> Result<(), String> {
        self.with_record(session_id, |record| {
            record.todos = todos.to_vec();
        })
    }

    fn get_todos(&self, session_id: &str) -> Result<Vec<TodoItem>, String> {
        self.with_record(session_id, |record| record.todos.clone())
    }

    fn add_file_changes(&self, session_id: &str, changes: &[FileChange]) -> Result<(), String> {
        self.with_record(session_id, |record| {
            record.file_changes.extend(changes.iter().cloned());
        })
    }

    fn get_file_changes(&self, session_id: &str) -> Result<Vec<FileChange>, String> {
        self.with_record(session_id, |record| record.file_changes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::FileChangeKind;

    #[test]
    fn history_round_trips() {
        let store = MemorySessionStore::new();
        store.record_message("s1", &Message::user("hello")).unwrap();
        store
            .record_message("s1", &Message::assistant_text("hi"))
            .unwrap();
        let history = store.get_history("s1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "hello");
    }

    #[test]
    fn missing_session_reads_are_empty() {
        let store = MemorySessionStore::new();
        assert!(store.get_session("nope").unwrap().is_none());
        assert!(store.get_history("nope").unwrap().is_empty());
        assert!(store.get_todos("nope").unwrap().is_empty());
    }

    #[test]
    fn summary_replaces_prefix() {
        let store = MemorySessionStore::new();
        for i in 0..6 {
            store
                .record_message("s1", &Message::user(format!("prompt {i}")))
                .unwrap();
        }
        let removed = store
            .replace_messages_before_index_with_summary(
                "s1",
                4,
                Message::user("Summary of earlier conversation: ..."),
            )
            .unwrap();
        assert_eq!(removed, 4);
        let history = store.get_history("s1").unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].text().starts_with("Summary"));
        assert_eq!(history[2].text(), "prompt 5");
    }

    #[test]
    fn file_changes_accumulate() {
        let store = MemorySessionStore::new();
        store
            .add_file_changes(
                "s1",
                &[FileChange {
                    path: "src/lib.rs".into(),
                    kind: FileChangeKind::Modified,
                    added_lines: 5,
                    removed_lines: 3,
                    tool_call_id: "c1".into(),
                }],
            )
            .unwrap();
        store
            .add_file_changes(
                "s1",
                &[FileChange {
                    path: "README.md".into(),
                    kind: FileChangeKind::Created,
                    added_lines: 12,
                    removed_lines: 0,
                    tool_call_id: "c2".into(),
                }],
            )
            .unwrap();
        assert_eq!(store.get_file_changes("s1").unwrap().len(), 2);
    }

    #[test]
    fn meta_update_preserves_history() {
        let store = MemorySessionStore::new();
        store.record_message("s1", &Message::user("hello")).unwrap();
        let mut meta = SessionMeta::new("s1");
        meta.last_prompt = Some("hello".into());
        store.update_session(&meta).unwrap();
        assert_eq!(store.get_history("s1").unwrap().len(), 1);
        assert_eq!(
            store.get_session("s1").unwrap().unwrap().last_prompt.as_deref(),
            Some("hello")
        );
    }
}
