//! Session Persistence
//!
//! Sessions are stored and replaced as whole units. There is no field-level
//! API: every mutation in the coordinator ends with one `replace_session`
//! call carrying the full tree.
//!
//! # Available Repositories
//!
//! - **Memory**: `DashMap`-backed, for tests and ephemeral use
//! - **JSON file**: one pretty-printed file per session under a data directory

mod json_file;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::ids::SessionId;
use crate::session::Session;

pub use json_file::JsonFileRepository;
pub use memory::MemoryRepository;

/// Durable storage for sessions
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// All stored sessions, most recently updated first
    async fn list_sessions(&self) -> anyhow::Result<Vec<Session>>;

    /// Load one session
    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<Session>>;

    /// Store a new session
    async fn create_session(&self, session: &Session) -> anyhow::Result<()>;

    /// Overwrite a session (keyed by id) with its full current state
    async fn replace_session(&self, session: &Session) -> anyhow::Result<()>;

    /// Remove a session; removing an absent session is not an error
    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()>;
}

#[async_trait]
impl<R: SessionRepository + ?Sized> SessionRepository for Arc<R> {
    async fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        (**self).list_sessions().await
    }

    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<Session>> {
        (**self).get_session(id).await
    }

    async fn create_session(&self, session: &Session) -> anyhow::Result<()> {
        (**self).create_session(session).await
    }

    async fn replace_session(&self, session: &Session) -> anyhow::Result<()> {
        (**self).replace_session(session).await
    }

    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()> {
        (**self).delete_session(id).await
    }
}

/// Sort sessions most recently updated first
pub(crate) fn sort_recent_first(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
