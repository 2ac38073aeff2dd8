use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Semaphore;

use crate::error::StoreError;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

/// A small pool of reusable SQLite connections.
///
/// Every operation runs on the blocking thread pool, so a locked database
/// never stalls the async runtime. The timeout only covers waiting for an
/// operation to start: once a closure runs, its outcome is always reported,
/// so a write is never acknowledged as failed after it committed.
pub struct DatabasePool {
    path: PathBuf,
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<Connection>>>,
    timeout: Duration,
}

impl DatabasePool {
    pub fn new(path: impl Into<PathBuf>, max_connections: usize) -> Self {
        Self {
            path: path.into(),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            idle: Arc::new(Mutex::new(Vec::new())),
            timeout: OPERATION_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn timed_out(&self) -> StoreError {
        log::error!("Database operation on {:?} timed out", self.path);
        StoreError::Timeout(self.timeout)
    }

    pub async fn execute_with_timeout<F, T>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = match tokio::time::timeout(self.timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(e)) => return Err(StoreError::Task(format!("pool closed: {}", e))),
            Err(_) => return Err(self.timed_out()),
        };

        let phase = Arc::new(AtomicU8::new(QUEUED));
        let task_phase = Arc::clone(&phase);
        let timeout = self.timeout;
        let path = self.path.clone();
        let idle = Arc::clone(&self.idle);
        let mut task = tokio::task::spawn_blocking(move || {
            if task_phase
                .compare_exchange(QUEUED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(StoreError::Timeout(timeout));
            }
            let reused = idle.lock().ok().and_then(|mut conns| conns.pop());
            let mut conn = match reused {
                Some(conn) => conn,
                None => open_connection(&path)?,
            };
            let result = operation(&mut conn);
            if let Ok(mut conns) = idle.lock() {
                conns.push(conn);
            }
            result
        });

        let joined = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                let abandoned = phase
                    .compare_exchange(QUEUED, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
                if abandoned {
                    return Err(self.timed_out());
                }
                log::warn!("Database operation on {:?} is slow, waiting for it", self.path);
                task.await
            }
        };
        joined.map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(conn)
}

pub fn init_database(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Task(format!("cannot create {:?}: {}", parent, e)))?;
        }
    }
    let conn = open_connection(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            uid INTEGER PRIMARY KEY,
            message TEXT NOT NULL DEFAULT '',
            interval INTEGER NOT NULL DEFAULT 5,
            chats TEXT NOT NULL DEFAULT '[]',
            logs INTEGER NOT NULL DEFAULT 0,
            log_chat TEXT,
            running INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_users_running ON users (running);",
    )?;
    Ok(())
}
