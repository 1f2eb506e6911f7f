//! Conflict-safe session persistence.
//!
//! Every mutation goes through [`SessionStore::merge`], which re-reads the persisted
//! record, applies the caller's append, and writes it back while holding `merge_lock`.
//! Producers that finish at the same moment therefore queue behind each other instead of
//! overwriting each other's snapshot. The in-memory mirror is only written under that lock;
//! plain reads never touch it, so a slow read cannot put back a snapshot a merge has
//! already superseded.

mod backend;

pub use backend::SessionBackend;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::models::{SessionAppend, SessionLog, SessionStatus};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

struct StoreInner {
    backend: Option<Arc<dyn SessionBackend>>,
    mirror: Mutex<HashMap<String, SessionLog>>,
    current_id: Mutex<Option<String>>,
    merge_lock: AsyncMutex<()>,
    degraded: AtomicBool,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self::build(Some(backend))
    }

    /// Store with no durable backend; records live only as long as the process.
    pub fn in_memory() -> Self {
        Self::build(None)
    }

    fn build(backend: Option<Arc<dyn SessionBackend>>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                mirror: Mutex::new(HashMap::new()),
                current_id: Mutex::new(None),
                merge_lock: AsyncMutex::new(()),
                degraded: AtomicBool::new(false),
            }),
        }
    }

    /// True once a backend failure has switched the store to in-memory operation.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    pub async fn create_session(&self, participant_id: &str) -> SessionLog {
        let session = SessionLog::new(
            Uuid::new_v4().to_string(),
            participant_id.to_string(),
            Utc::now(),
        );

        {
            let _guard = self.inner.merge_lock.lock().await;
            self.write_through(&session).await;
        }
        self.set_current(Some(&session.id)).await;

        log_info!(
            "Created session {} for participant {}",
            session.id,
            session.participant_id
        );
        session
    }

    /// Freshest known copy of a session.
    pub async fn get(&self, session_id: &str) -> Option<SessionLog> {
        self.read_fresh(session_id).await
    }

    /// Rehydrates the session the current-session pointer refers to.
    pub async fn current_session(&self) -> Option<SessionLog> {
        let current = match self.live_backend() {
            Some(backend) => match backend.current_session_id().await {
                Ok(id) => id,
                Err(err) => {
                    self.degrade("read current session pointer", &err);
                    self.mirrored_current_id()
                }
            },
            None => self.mirrored_current_id(),
        };

        match current {
            Some(id) => self.read_fresh(&id).await,
            None => None,
        }
    }

    /// Read-fresh, mutate, write-back under the merge lock.
    ///
    /// Returns `false` when the session does not exist (never created, or reset).
    pub async fn merge<F>(&self, session_id: &str, mutator: F) -> bool
    where
        F: FnOnce(&mut SessionLog) + Send,
    {
        let _guard = self.inner.merge_lock.lock().await;

        let Some(mut session) = self.read_locked(session_id).await else {
            log_debug!("merge skipped: session {} not found", session_id);
            return false;
        };

        mutator(&mut session);
        self.write_through(&session).await;
        true
    }

    pub async fn append(&self, session_id: &str, append: SessionAppend) -> bool {
        let collection = append.collection();
        let applied = self
            .merge(session_id, move |session| session.apply(append))
            .await;
        if applied {
            log_debug!("Appended to {} of session {}", collection, session_id);
        }
        applied
    }

    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> bool {
        self.merge(session_id, move |session| session.status = status)
            .await
    }

    /// Destroys a session record. Clears the current pointer if it referenced it.
    pub async fn reset(&self, session_id: &str) -> bool {
        let existed = {
            let _guard = self.inner.merge_lock.lock().await;

            let mirrored = self.mirror().remove(session_id).is_some();
            let persisted = match self.live_backend() {
                Some(backend) => match backend.load(session_id).await {
                    Ok(found) => {
                        if let Err(err) = backend.remove(session_id).await {
                            self.degrade("remove session", &err);
                        }
                        found.is_some()
                    }
                    Err(err) => {
                        self.degrade("load session for reset", &err);
                        false
                    }
                },
                None => false,
            };
            mirrored || persisted
        };

        if self.mirrored_current_id().as_deref() == Some(session_id) {
            self.set_current(None).await;
        } else if let Some(backend) = self.live_backend() {
            if let Ok(Some(current)) = backend.current_session_id().await {
                if current == session_id {
                    self.set_current(None).await;
                }
            }
        }

        if existed {
            log_info!("Session {} reset", session_id);
        }
        existed
    }

    /// Marks a session left `Running` by a previous process as `Interrupted`.
    pub async fn recover_interrupted(&self) -> Option<String> {
        let session = self.current_session().await?;
        if session.status != SessionStatus::Running {
            return None;
        }

        log_warn!(
            "Recovered incomplete session {}; marking as Interrupted",
            session.id
        );
        self.set_status(&session.id, SessionStatus::Interrupted)
            .await
            .then_some(session.id)
    }

    /// Fails when the session is missing; used where the caller must know.
    pub async fn require(&self, session_id: &str) -> Result<SessionLog> {
        match self.read_fresh(session_id).await {
            Some(session) => Ok(session),
            None => bail!("session {session_id} not found"),
        }
    }

    /// Backend copy when available, else the mirror. Leaves the mirror untouched.
    async fn read_fresh(&self, session_id: &str) -> Option<SessionLog> {
        if let Some(backend) = self.live_backend() {
            match backend.load(session_id).await {
                Ok(found) => return found,
                Err(err) => self.degrade("load session", &err),
            }
        }

        self.mirror().get(session_id).cloned()
    }

    /// Like `read_fresh`, but also syncs the mirror. Caller must hold `merge_lock`.
    async fn read_locked(&self, session_id: &str) -> Option<SessionLog> {
        if let Some(backend) = self.live_backend() {
            match backend.load(session_id).await {
                Ok(Some(session)) => {
                    self.mirror()
                        .insert(session_id.to_string(), session.clone());
                    return Some(session);
                }
                Ok(None) => {
                    self.mirror().remove(session_id);
                    return None;
                }
                Err(err) => self.degrade("load session", &err),
            }
        }

        self.mirror().get(session_id).cloned()
    }

    async fn write_through(&self, session: &SessionLog) {
        if let Some(backend) = self.live_backend() {
            if let Err(err) = backend.save(session).await {
                self.degrade("save session", &err);
            }
        }
        self.mirror().insert(session.id.clone(), session.clone());
    }

    async fn set_current(&self, session_id: Option<&str>) {
        *self.current_guard() = session_id.map(str::to_string);
        if let Some(backend) = self.live_backend() {
            if let Err(err) = backend.set_current_session_id(session_id).await {
                self.degrade("write current session pointer", &err);
            }
        }
    }

    fn live_backend(&self) -> Option<Arc<dyn SessionBackend>> {
        if self.is_degraded() {
            return None;
        }
        self.inner.backend.clone()
    }

    fn degrade(&self, action: &str, err: &anyhow::Error) {
        if !self.inner.degraded.swap(true, Ordering::SeqCst) {
            log_warn!(
                "Persistence failed ({action}): {err:#}; continuing with in-memory session state"
            );
        }
    }

    fn mirrored_current_id(&self) -> Option<String> {
        self.current_guard().clone()
    }

    fn mirror(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionLog>> {
        match self.inner.mirror.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn current_guard(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        match self.inner.current_id.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
