use anyhow::Result;
use async_trait::async_trait;

use crate::db::Database;
use crate::models::SessionLog;

/// Durable home of session records.
///
/// `SessionStore` treats the backend as the source of truth and only falls back to its
/// in-memory mirror once the backend has failed.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<SessionLog>>;

    async fn save(&self, session: &SessionLog) -> Result<()>;

    async fn remove(&self, session_id: &str) -> Result<()>;

    async fn current_session_id(&self) -> Result<Option<String>>;

    async fn set_current_session_id(&self, session_id: Option<&str>) -> Result<()>;
}

#[async_trait]
impl SessionBackend for Database {
    async fn load(&self, session_id: &str) -> Result<Option<SessionLog>> {
        self.get_session_record(session_id).await
    }

    async fn save(&self, session: &SessionLog) -> Result<()> {
        self.put_session_record(session).await
    }

    async fn remove(&self, session_id: &str) -> Result<()> {
        self.delete_session_record(session_id).await.map(|_| ())
    }

    async fn current_session_id(&self) -> Result<Option<String>> {
        self.get_current_session_id().await
    }

    async fn set_current_session_id(&self, session_id: Option<&str>) -> Result<()> {
        match session_id {
            Some(id) => self.put_current_session_id(id).await,
            None => self.clear_current_session_id().await,
        }
    }
}
