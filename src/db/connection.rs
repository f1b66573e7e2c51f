use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

const WORKER_NAME: &str = "runwalk-db";

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum WorkerMessage {
    Run(Job),
    Stop,
}

/// Owns the worker thread. Dropping the last handle stops and joins it.
struct Worker {
    jobs: mpsc::Sender<WorkerMessage>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn spawn<O>(open: O) -> Result<Self>
    where
        O: FnOnce() -> rusqlite::Result<Connection> + Send + 'static,
    {
        let (jobs, inbox) = mpsc::channel::<WorkerMessage>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread = thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || {
                let mut conn = match prepare_connection(open) {
                    Ok(conn) => {
                        if ready_tx.send(Ok(())).is_err() {
                            return;
                        }
                        conn
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                while let Ok(message) = inbox.recv() {
                    match message {
                        WorkerMessage::Run(job) => job(&mut conn),
                        WorkerMessage::Stop => break,
                    }
                }
                info!("Database worker stopped");
            })
            .context("failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before it was ready")??;

        Ok(Self {
            jobs,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let Some(thread) = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        if self.jobs.send(WorkerMessage::Stop).is_err() {
            warn!("Database worker already gone at shutdown");
        }
        if let Err(err) = thread.join() {
            error!("Database worker panicked: {err:?}");
        }
    }
}

fn prepare_connection<O>(open: O) -> Result<Connection>
where
    O: FnOnce() -> rusqlite::Result<Connection>,
{
    let mut conn = open().context("failed to open SQLite database")?;
    if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
        warn!("Could not enable foreign keys: {err}");
    }
    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

/// Handle to the device's SQLite store. Every statement runs on one worker
/// thread, so writes are applied in the order they were issued.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    path: Option<Arc<PathBuf>>,
}

impl Database {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let file = path.clone();
        let worker = Worker::spawn(move || {
            let conn = Connection::open(&file)?;
            if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                warn!("Could not switch {} to WAL: {err}", file.display());
            }
            Ok(conn)
        })?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            worker: Arc::new(worker),
            path: Some(Arc::new(path)),
        })
    }

    /// Private in-memory store, gone when the last handle drops.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            worker: Arc::new(Worker::spawn(Connection::open_in_memory)?),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    /// Runs `task` on the worker thread and waits for its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, outcome) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            // The caller may have been cancelled; nothing to do then.
            let _ = reply.send(task(conn));
        });

        self.worker
            .jobs
            .send(WorkerMessage::Run(job))
            .map_err(|_| anyhow!("database worker is not running"))?;

        outcome
            .await
            .map_err(|_| anyhow!("database worker dropped the request"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tasks_run_on_the_worker_and_return_results() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.path().is_none());

        db.execute(|conn| {
            conn.execute_batch("CREATE TABLE log (n INTEGER)")?;
            Ok(())
        })
        .await
        .unwrap();

        for n in 0..5i64 {
            db.execute(move |conn| {
                conn.execute("INSERT INTO log (n) VALUES (?1)", [n])?;
                Ok(())
            })
            .await
            .unwrap();
        }

        let order: Vec<i64> = db
            .execute(|conn| {
                let mut stmt = conn.prepare("SELECT n FROM log ORDER BY rowid")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .unwrap();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);

        let failed = db
            .execute(|conn| {
                conn.execute_batch("SELECT * FROM missing")?;
                Ok(())
            })
            .await;
        assert!(failed.is_err());
    }

    #[tokio::test]
    async fn file_store_is_created_under_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runwalk.sqlite3");
        let db = Database::new(path.clone()).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        assert!(path.exists());
    }
}
