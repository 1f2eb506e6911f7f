use anyhow::Result;

use crate::db::{
    helpers::{decode_json, encode_json, session_key, CURRENT_SESSION_KEY},
    Database,
};
use crate::models::SessionLog;

impl Database {
    pub async fn get_session_record(&self, session_id: &str) -> Result<Option<SessionLog>> {
        match self.get_value(&session_key(session_id)).await? {
            Some(raw) => decode_json(&raw, "session record").map(Some),
            None => Ok(None),
        }
    }

    pub async fn put_session_record(&self, session: &SessionLog) -> Result<()> {
        let raw = encode_json(session, "session record")?;
        self.put_value(&session_key(&session.id), raw).await
    }

    pub async fn delete_session_record(&self, session_id: &str) -> Result<bool> {
        self.delete_value(&session_key(session_id)).await
    }

    pub async fn get_current_session_id(&self) -> Result<Option<String>> {
        self.get_value(CURRENT_SESSION_KEY).await
    }

    pub async fn put_current_session_id(&self, session_id: &str) -> Result<()> {
        self.put_value(CURRENT_SESSION_KEY, session_id.to_string())
            .await
    }

    pub async fn clear_current_session_id(&self) -> Result<()> {
        self.delete_value(CURRENT_SESSION_KEY).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use crate::db::Database;
    use crate::models::{SessionAppend, SessionLog, VideoRef};

    fn open(dir: &TempDir) -> Database {
        Database::new(dir.path().join("nested").join("store.sqlite3")).unwrap()
    }

    #[tokio::test]
    async fn session_record_round_trips_through_kv() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        let mut session = SessionLog::new("s1".into(), "p1".into(), Utc::now());
        session.apply(SessionAppend::Video(VideoRef {
            id: "v1".into(),
            title: "Clip".into(),
        }));
        db.put_session_record(&session).await.unwrap();

        let loaded = db.get_session_record("s1").await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(db.get_session_record("missing").await.unwrap().is_none());

        let stamp: String = db
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT updated_at FROM kv WHERE key = 'session:s1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());
    }

    #[tokio::test]
    async fn current_pointer_is_independent_of_records() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        assert!(db.get_current_session_id().await.unwrap().is_none());
        db.put_current_session_id("s1").await.unwrap();
        db.put_current_session_id("s2").await.unwrap();
        assert_eq!(db.get_current_session_id().await.unwrap().as_deref(), Some("s2"));

        db.clear_current_session_id().await.unwrap();
        assert!(db.get_current_session_id().await.unwrap().is_none());
        assert!(!db.delete_session_record("s2").await.unwrap());
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            let session = SessionLog::new("s1".into(), "p1".into(), Utc::now());
            db.put_session_record(&session).await.unwrap();
        }

        let db = open(&dir);
        assert!(db.get_session_record("s1").await.unwrap().is_some());
    }
}
