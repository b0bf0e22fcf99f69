//! Write-through cache of this process's recent notes.
//!
//! The last ten notes written here are mirrored to a small JSON file so a
//! fresh session can show recent contributions without a backend round
//! trip, and so `"last"` id references resolve even before any read.
//! Cache failures are never fatal.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use teambook_core::{AiId, NoteId, Timestamp, WRITE_CACHE_SIZE};
use tracing::debug;

const CACHE_FILE: &str = "my_notes_cache.json";
const CACHED_CONTENT_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedNote {
    pub note_id: NoteId,
    pub content: String,
    pub summary: Option<String>,
    pub teambook: String,
    pub cached_at: Timestamp,
    pub author: AiId,
}

pub struct WriteCache {
    path: PathBuf,
    entries: Mutex<Vec<CachedNote>>,
}

impl WriteCache {
    pub fn open(data_dir: &PathBuf) -> Self {
        let path = data_dir.join(CACHE_FILE);
        let entries = std::fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Record a successful write, newest first, keeping the last N.
    pub fn record(&self, note_id: NoteId, content: &str, summary: Option<&str>, teambook: &str, author: &AiId) {
        let entry = CachedNote {
            note_id,
            content: content.chars().take(CACHED_CONTENT_CHARS).collect(),
            summary: summary.map(String::from),
            teambook: teambook.to_string(),
            cached_at: Utc::now(),
            author: author.clone(),
        };
        let snapshot = {
            let mut entries = self.entries.lock().expect("cache poisoned");
            entries.insert(0, entry);
            entries.truncate(WRITE_CACHE_SIZE);
            entries.clone()
        };
        if let Ok(raw) = serde_json::to_vec_pretty(&snapshot) {
            if let Err(err) = std::fs::write(&self.path, raw) {
                debug!(error = %err, "write cache flush failed");
            }
        }
    }

    /// The most recently written note id, if any.
    pub fn last_note_id(&self) -> Option<NoteId> {
        self.entries
            .lock()
            .expect("cache poisoned")
            .first()
            .map(|entry| entry.note_id)
    }

    pub fn recent(&self) -> Vec<CachedNote> {
        self.entries.lock().expect("cache poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teambook_core::RecordIdType;

    #[test]
    fn test_cache_keeps_last_n_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = WriteCache::open(&dir.path().to_path_buf());
        let alpha = AiId::from("alpha-001");
        for i in 1..=(WRITE_CACHE_SIZE as i64 + 5) {
            cache.record(NoteId::new(i), &format!("note {}", i), None, "demo", &alpha);
        }
        let recent = cache.recent();
        assert_eq!(recent.len(), WRITE_CACHE_SIZE);
        assert_eq!(recent[0].note_id, NoteId::new(WRITE_CACHE_SIZE as i64 + 5));
        assert_eq!(cache.last_note_id(), Some(NoteId::new(WRITE_CACHE_SIZE as i64 + 5)));
    }

    #[test]
    fn test_cache_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        {
            let cache = WriteCache::open(&root);
            cache.record(NoteId::new(9), "persisted", None, "demo", &AiId::from("alpha-001"));
        }
        let cache = WriteCache::open(&root);
        assert_eq!(cache.last_note_id(), Some(NoteId::new(9)));
    }
}
