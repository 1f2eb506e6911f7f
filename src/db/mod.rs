use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};
use rusqlite::Connection;
use tokio::sync::oneshot;

pub mod helpers;
mod migrations;
pub mod repositories;

use migrations::run_migrations;

const MEMORY_PATH: &str = ":memory:";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Message {
    Run(Job),
    Close,
}

struct Worker {
    jobs: mpsc::Sender<Message>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let mut guard = match self.thread.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(handle) = guard.take() else {
            return;
        };
        if self.jobs.send(Message::Close).is_err() {
            debug!("kv worker already gone at shutdown");
        }
        if let Err(join_err) = handle.join() {
            error!("Failed to join kv worker: {join_err:?}");
        }
    }
}

/// Handle to the SQLite key-value store.
///
/// A single worker thread owns the connection; every call is shipped to it as a boxed
/// closure, so statements from different callers never interleave.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    location: Arc<PathBuf>,
}

impl Database {
    /// Opens (or creates) the database file, creating missing parent directories.
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
        Self::start(db_path)
    }

    /// Private, process-lifetime database. Nothing is written to disk.
    pub fn in_memory() -> Result<Self> {
        Self::start(PathBuf::from(MEMORY_PATH))
    }

    pub fn path(&self) -> &Path {
        self.location.as_path()
    }

    fn start(location: PathBuf) -> Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Message>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let thread_location = location.clone();

        let handle = thread::Builder::new()
            .name("affect-sync-kv".into())
            .spawn(move || {
                let mut conn = match open_connection(&thread_location) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                serve(&mut conn, jobs_rx);
            })
            .context("failed to spawn kv worker thread")?;

        ready_rx
            .recv()
            .context("kv worker exited before signaling readiness")??;

        info!("Session database ready at {}", location.display());

        Ok(Self {
            worker: Arc::new(Worker {
                jobs: jobs_tx,
                thread: Mutex::new(Some(handle)),
            }),
            location: Arc::new(location),
        })
    }

    /// Runs `task` on the worker thread and waits for its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let job: Job = Box::new(move |conn| {
            if reply_tx.send(task(conn)).is_err() {
                debug!("kv caller went away before its result was ready");
            }
        });

        self.worker
            .jobs
            .send(Message::Run(job))
            .map_err(|err| anyhow!("failed to send job to kv worker: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("kv worker terminated unexpectedly"))?
    }
}

fn open_connection(location: &Path) -> Result<Connection> {
    let mut conn = if location == Path::new(MEMORY_PATH) {
        Connection::open_in_memory().context("failed to open in-memory SQLite database")?
    } else {
        let conn = Connection::open(location).with_context(|| {
            format!("failed to open SQLite database {}", location.display())
        })?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            error!("Failed to enable WAL mode: {err}");
        }
        conn
    };

    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;
    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

fn serve(conn: &mut Connection, jobs: mpsc::Receiver<Message>) {
    while let Ok(message) = jobs.recv() {
        match message {
            Message::Run(job) => job(conn),
            Message::Close => break,
        }
    }
    info!("kv worker shutting down");
}
