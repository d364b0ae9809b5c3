//! JSON file session repository
//!
//! One pretty-printed `<session-id>.json` file per session. Writes go to a
//! temporary sibling first and are renamed into place, so a crash never
//! leaves a half-written session behind.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{sort_recent_first, SessionRepository};
use crate::ids::SessionId;
use crate::session::Session;

const EXTENSION: &str = "json";

/// Session repository backed by a directory of JSON files
#[derive(Clone, Debug)]
pub struct JsonFileRepository {
    dir: PathBuf,
}

impl JsonFileRepository {
    /// Open (creating if needed) a repository directory
    pub async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Directory holding the session files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &SessionId) -> anyhow::Result<PathBuf> {
        let raw = id.as_str();
        // Ids become file names; refuse anything that could escape the directory
        if raw.is_empty()
            || !raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!("invalid session id: {raw:?}");
        }
        Ok(self.dir.join(format!("{raw}.{EXTENSION}")))
    }

    async fn write_atomic(&self, path: &Path, session: &Session) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(session).context("failed to serialize session")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to move session into {}", path.display()))?;
        debug!(session_id = %session.id, path = %path.display(), "Session written");
        Ok(())
    }

    async fn read(path: &Path) -> anyhow::Result<Session> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[async_trait]
impl SessionRepository for JsonFileRepository {
    async fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to list {}", self.dir.display()))?;

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match Self::read(&path).await {
                Ok(session) => sessions.push(session),
                // One corrupt file must not hide the others
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session file"),
            }
        }
        sort_recent_first(&mut sessions);
        Ok(sessions)
    }

    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<Session>> {
        let path = self.path_for(id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read(&path).await.map(Some)
    }

    async fn create_session(&self, session: &Session) -> anyhow::Result<()> {
        let path = self.path_for(&session.id)?;
        if tokio::fs::try_exists(&path).await? {
            anyhow::bail!("session {} already exists", session.id);
        }
        self.write_atomic(&path, session).await
    }

    async fn replace_session(&self, session: &Session) -> anyhow::Result<()> {
        let path = self.path_for(&session.id)?;
        self.write_atomic(&path, session).await
    }

    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeKind};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn repo() -> (TempDir, JsonFileRepository) {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileRepository::open(dir.path().join("sessions"))
            .await
            .unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_tree() {
        let (_dir, repo) = repo().await;
        let mut session = Session::new("Tree");
        let root = session.root_id.clone();
        session
            .nodes
            .insert_child(
                &root,
                Node::new(NodeKind::Composite {
                    user_message: "Q".to_string(),
                    assistant_message: Some("A".to_string()),
                    thinking: None,
                }),
            )
            .unwrap();

        repo.create_session(&session).await.unwrap();
        let loaded = repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(loaded.is_well_formed());
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let (_dir, repo) = repo().await;
        let mut session = Session::new("Before");
        repo.create_session(&session).await.unwrap();
        assert!(repo.create_session(&session).await.is_err());

        session.title = "After".to_string();
        repo.replace_session(&session).await.unwrap();
        let loaded = repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "After");

        // No temp files left behind
        let mut entries = std::fs::read_dir(repo.dir()).unwrap();
        let only = entries.next().unwrap().unwrap();
        assert!(entries.next().is_none());
        assert_eq!(only.path().extension().unwrap(), "json");

        repo.delete_session(&session.id).await.unwrap();
        repo.delete_session(&session.id).await.unwrap();
        assert!(repo.get_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_files() {
        let (_dir, repo) = repo().await;
        let mut older = Session::new("Older");
        older.updated_at = 10;
        let mut newer = Session::new("Newer");
        newer.updated_at = 20;
        repo.create_session(&older).await.unwrap();
        repo.create_session(&newer).await.unwrap();
        std::fs::write(repo.dir().join("broken.json"), "{ not json").unwrap();
        std::fs::write(repo.dir().join("notes.txt"), "ignored").unwrap();

        let titles: Vec<String> = repo
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.title)
            .collect();
        assert_eq!(titles, vec!["Newer".to_string(), "Older".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let (_dir, repo) = repo().await;
        let id = SessionId::from("../escape");
        assert!(repo.get_session(&id).await.is_err());
        assert!(repo.delete_session(&id).await.is_err());
    }
}
