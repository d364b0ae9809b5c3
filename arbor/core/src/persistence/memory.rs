//! In-memory session repository

use async_trait::async_trait;
use dashmap::DashMap;

use super::{sort_recent_first, SessionRepository};
use crate::ids::SessionId;
use crate::session::Session;

/// Session repository held in a concurrent map
#[derive(Debug, Default)]
pub struct MemoryRepository {
    sessions: DashMap<SessionId, Session>,
}

impl MemoryRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sort_recent_first(&mut sessions);
        Ok(sessions)
    }

    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|e| e.value().clone()))
    }

    async fn create_session(&self, session: &Session) -> anyhow::Result<()> {
        if self.sessions.contains_key(&session.id) {
            anyhow::bail!("session {} already exists", session.id);
        }
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn replace_session(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()> {
        self.sessions.remove(id);
        Ok(())
    }
}
