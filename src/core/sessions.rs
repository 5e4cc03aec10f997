//! Session Store: per-(chat, tier) assistant session handles.
//!
//! The assistant CLI hands back an opaque session id per conversation; this
//! store maps `(chat, tier)` to the latest handle so follow-up calls can
//! resume context. State lives in memory and is mirrored to a JSON file on
//! every mutation. Reads are concurrent, writes serialize on the lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::core::config::Tier;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionData {
    pub session_id: String,
    pub project_dir: PathBuf,
    pub last_used_at: String,
}

/// File representation: one row per (chat, tier).
#[derive(serde::Serialize, serde::Deserialize)]
struct SessionRow {
    chat_id: i64,
    tier: Tier,
    #[serde(flatten)]
    data: SessionData,
}

pub struct SessionStore {
    path: PathBuf,
    inner: RwLock<HashMap<(i64, Tier), SessionData>>,
}

impl SessionStore {
    /// Open the store, loading any previously saved sessions. A corrupt or
    /// missing file starts empty rather than failing startup.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut map = HashMap::new();
        if let Ok(bytes) = tokio::fs::read(&path).await {
            match serde_json::from_slice::<Vec<SessionRow>>(&bytes) {
                Ok(rows) => {
                    for row in rows {
                        map.insert((row.chat_id, row.tier), row.data);
                    }
                }
                Err(e) => warn!("Ignoring unreadable session file {:?}: {}", path, e),
            }
        }
        Ok(Self {
            path,
            inner: RwLock::new(map),
        })
    }

    pub async fn get(&self, chat_id: i64, tier: Tier) -> Option<SessionData> {
        self.inner.read().await.get(&(chat_id, tier)).cloned()
    }

    pub async fn get_session_id(&self, chat_id: i64, tier: Tier) -> Option<String> {
        self.get(chat_id, tier).await.map(|d| d.session_id)
    }

    /// Store a new handle for (chat, tier), replacing any prior one.
    pub async fn set(
        &self,
        chat_id: i64,
        session_id: &str,
        project_dir: &Path,
        tier: Tier,
    ) -> Result<()> {
        let mut map = self.inner.write().await;
        map.insert(
            (chat_id, tier),
            SessionData {
                session_id: session_id.to_string(),
                project_dir: project_dir.to_path_buf(),
                last_used_at: Utc::now().to_rfc3339(),
            },
        );
        self.save(&map).await
    }

    /// Remove the handle for one tier, or for all tiers when `tier` is
    /// `None`.
    pub async fn clear(&self, chat_id: i64, tier: Option<Tier>) -> Result<()> {
        let mut map = self.inner.write().await;
        match tier {
            Some(tier) => {
                map.remove(&(chat_id, tier));
            }
            None => map.retain(|(chat, _), _| *chat != chat_id),
        }
        self.save(&map).await
    }

    pub async fn all(&self) -> Vec<(i64, Tier, SessionData)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|((chat_id, tier), data)| (*chat_id, *tier, data.clone()))
            .collect()
    }

    async fn save(&self, map: &HashMap<(i64, Tier), SessionData>) -> Result<()> {
        let rows: Vec<SessionRow> = map
            .iter()
            .map(|((chat_id, tier), data)| SessionRow {
                chat_id: *chat_id,
                tier: *tier,
                data: data.clone(),
            })
            .collect();
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(&rows)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path().join("sessions.json"))
            .await
            .unwrap();

        store
            .set(7, "sess-a", Path::new("/tmp/p"), Tier::Chat)
            .await
            .unwrap();
        assert_eq!(
            store.get_session_id(7, Tier::Chat).await.as_deref(),
            Some("sess-a")
        );
        assert!(store.get(7, Tier::Worker).await.is_none());

        store
            .set(7, "sess-b", Path::new("/tmp/p"), Tier::Chat)
            .await
            .unwrap();
        assert_eq!(
            store.get_session_id(7, Tier::Chat).await.as_deref(),
            Some("sess-b")
        );
    }

    #[tokio::test]
    async fn clear_one_tier_and_all_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path().join("sessions.json"))
            .await
            .unwrap();
        store
            .set(1, "a", Path::new("/w"), Tier::Chat)
            .await
            .unwrap();
        store
            .set(1, "b", Path::new("/w"), Tier::Orchestrator)
            .await
            .unwrap();
        store
            .set(2, "c", Path::new("/w"), Tier::Chat)
            .await
            .unwrap();

        store.clear(1, Some(Tier::Chat)).await.unwrap();
        assert!(store.get(1, Tier::Chat).await.is_none());
        assert!(store.get(1, Tier::Orchestrator).await.is_some());

        store.clear(1, None).await.unwrap();
        assert!(store.get(1, Tier::Orchestrator).await.is_none());
        assert!(store.get(2, Tier::Chat).await.is_some());
    }

    #[tokio::test]
    async fn sessions_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        {
            let store = SessionStore::load(&path).await.unwrap();
            store
                .set(42, "persisted", Path::new("/proj"), Tier::Chat)
                .await
                .unwrap();
        }
        let reloaded = SessionStore::load(&path).await.unwrap();
        let data = reloaded.get(42, Tier::Chat).await.unwrap();
        assert_eq!(data.session_id, "persisted");
        assert_eq!(data.project_dir, PathBuf::from("/proj"));
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, b"not json at all").await.unwrap();
        let store = SessionStore::load(&path).await.unwrap();
        assert!(store.all().await.is_empty());
    }
}
