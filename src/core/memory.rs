//! Memory Store: durable per-chat notes.
//!
//! Notes arrive from two sources: the chat agent's memory block (`auto`) and
//! the `memory add` command (`manual`). They are rendered into a
//! `[MEMORY CONTEXT]` block prepended to chat-tier prompts.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use rusqlite::{Connection, params};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteSource {
    Auto,
    Manual,
}

impl NoteSource {
    fn as_str(self) -> &'static str {
        match self {
            NoteSource::Auto => "auto",
            NoteSource::Manual => "manual",
        }
    }

    fn from_name(value: &str) -> Self {
        match value {
            "manual" => NoteSource::Manual,
            _ => NoteSource::Auto,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryNote {
    pub id: i64,
    pub chat_id: i64,
    pub text: String,
    pub source: NoteSource,
    pub created_at: String,
}

pub struct MemoryStore {
    db: Arc<Mutex<Connection>>,
}

impl MemoryStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Connection::open(path.as_ref())?;
        Self::init(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn init(db: &Connection) -> Result<()> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS memory_notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'auto',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        Ok(())
    }

    /// Store one note. The text is trimmed; empty text is rejected.
    pub async fn add_note(&self, chat_id: i64, text: &str, source: NoteSource) -> Result<i64> {
        let text = text.trim();
        if text.is_empty() {
            bail!("refusing to store an empty memory note");
        }
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO memory_notes (chat_id, text, source) VALUES (?1, ?2, ?3)",
            params![chat_id, text, source.as_str()],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// All notes for a chat in insertion order.
    pub async fn list_notes(&self, chat_id: i64) -> Result<Vec<MemoryNote>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, chat_id, text, source, created_at
             FROM memory_notes WHERE chat_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| {
            Ok(MemoryNote {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                text: row.get(2)?,
                source: NoteSource::from_name(&row.get::<_, String>(3)?),
                created_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn delete_note(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM memory_notes WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Render the chat's notes as a context prefix, or `None` when there are
    /// no notes.
    pub async fn context_block(&self, chat_id: i64) -> Result<Option<String>> {
        let notes = self.list_notes(chat_id).await?;
        if notes.is_empty() {
            return Ok(None);
        }
        let mut block = String::from("[MEMORY CONTEXT]\n");
        for note in &notes {
            block.push_str("- ");
            block.push_str(&note.text);
            block.push('\n');
        }
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notes_are_per_chat_and_ordered() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.add_note(1, "likes rust", NoteSource::Auto).await.unwrap();
        store
            .add_note(1, "deploys on fridays", NoteSource::Manual)
            .await
            .unwrap();
        store.add_note(2, "other chat", NoteSource::Auto).await.unwrap();

        let notes = store.list_notes(1).await.unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].text, "likes rust");
        assert_eq!(notes[1].source, NoteSource::Manual);
    }

    #[tokio::test]
    async fn add_note_trims_and_rejects_empty() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.add_note(1, "  padded  ", NoteSource::Auto).await.unwrap();
        let notes = store.list_notes(1).await.unwrap();
        assert_eq!(notes[0].text, "padded");

        assert!(store.add_note(1, "   ", NoteSource::Auto).await.is_err());
    }

    #[tokio::test]
    async fn context_block_formats_bullets() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert!(store.context_block(1).await.unwrap().is_none());

        store.add_note(1, "a", NoteSource::Auto).await.unwrap();
        store.add_note(1, "b", NoteSource::Auto).await.unwrap();
        let block = store.context_block(1).await.unwrap().unwrap();
        assert!(block.starts_with("[MEMORY CONTEXT]\n"));
        assert!(block.contains("- a\n"));
        assert!(block.contains("- b\n"));
    }

    #[tokio::test]
    async fn delete_note_removes_row() {
        let store = MemoryStore::open_in_memory().unwrap();
        let id = store.add_note(1, "gone soon", NoteSource::Auto).await.unwrap();
        assert!(store.delete_note(id).await.unwrap());
        assert!(!store.delete_note(id).await.unwrap());
        assert!(store.list_notes(1).await.unwrap().is_empty());
    }
}
