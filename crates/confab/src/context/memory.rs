//! Persistent memory notes: timestamped appends and prompt injection.
//!
//! Each workdir gets one memory note file. Memory flushes append a
//! timestamped section of distilled knowledge; at session start the note is
//! read back (truncated to a line budget) and injected into the system
//! prompt.
//!
//! Appends to one path are serialized through a per-path async lock, so two
//! sessions flushing against the same workdir cannot interleave their
//! sections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tokio::sync::Mutex;
use tracing::debug;

/// Serializes appends to memory note files, one lock per path.
#[derive(Default)]
pub struct MemoryStore {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append a timestamped section to the memory note at `path`, creating
    /// the file (and its parent directory) if needed. Concurrent appends to
    /// the same path are queued, never interleaved.
    pub async fn append_section(&self, path: &Path, text: &str) -> Result<(), String> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create memory directory: {e}"))?;
        }

        let existing = std::fs::read_to_string(path).unwrap_or_default();
        let stamp = Local::now().format("%Y-%m-%d %H:%M");
        let section = format!("## Session notes ({stamp})\n\n{}\n", text.trim_end());
        let updated = if existing.trim().is_empty() {
            section
        } else {
            format!("{}\n\n{section}", existing.trim_end())
        };

        std::fs::write(path, updated).map_err(|e| format!("failed to write memory note: {e}"))?;
        debug!("Appended {} chars to memory note {}", text.len(), path.display());
        Ok(())
    }
}

/// Read the memory note at `path` for system-prompt injection.
///
/// Returns `None` if the file doesn't exist or can't be read. If the file
/// exceeds `max_lines`, truncates and appends a note indicating truncation.
pub fn read_memory_note(path: &Path, max_lines: usize) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;

    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();

    if total <= max_lines {
        Some(content)
    } else {
        let truncated: String = lines[..max_lines].join("\n");
        Some(format!(
            "{truncated}\n\n[memory note truncated at {max_lines} of {total} lines]"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_creates_and_extends_note() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.md");
        let store = MemoryStore::new();

        store.append_section(&path, "first fact").await.unwrap();
        store.append_section(&path, "second fact").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("## Session notes").count(), 2);
        let first = content.find("first fact").unwrap();
        let second = content.find("second fact").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn append_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/memory.md");
        let store = MemoryStore::new();

        store.append_section(&path, "fact").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn concurrent_appends_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.md");
        let store = Arc::new(MemoryStore::new());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_section(&path, &format!("fact {i}"))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        for i in 0..8 {
            assert!(content.contains(&format!("fact {i}")), "missing fact {i}");
        }
        assert_eq!(content.matches("## Session notes").count(), 8);
    }

    #[test]
    fn read_note_missing_file() {
        assert!(read_memory_note(Path::new("/nonexistent/memory.md"), 200).is_none());
    }

    #[test]
    fn read_note_over_limit_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.md");
        let lines: Vec<String> = (0..50).map(|i| format!("Line {i}")).collect();
        std::fs::write(&path, lines.join("\n")).unwrap();

        let content = read_memory_note(&path, 10).unwrap();
        assert!(content.contains("Line 9"));
        assert!(!content.contains("Line 10"));
        assert!(content.contains("truncated at 10 of 50 lines"));
    }

    #[test]
    fn read_note_under_limit_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.md");
        std::fs::write(&path, "# Notes\n\nSome facts.\n").unwrap();

        let content = read_memory_note(&path, 200).unwrap();
        assert!(content.contains("Some facts"));
        assert!(!content.contains("truncated"));
    }
}
