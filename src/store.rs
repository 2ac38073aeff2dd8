use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::database::DatabasePool;
use crate::error::{StoreError, ValidationError};
use crate::peers::ChatRef;
use crate::utils::KeyedLocks;

pub type UserId = i64;

/// Durable per-user configuration and scheduler status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    pub uid: UserId,
    pub message: String,
    pub interval_secs: u64,
    /// Insertion ordered; duplicates are kept.
    pub chats: Vec<ChatRef>,
    pub logging_enabled: bool,
    pub log_chat: Option<ChatRef>,
    /// Mirrors the scheduler's live job map.
    pub running: bool,
}

impl UserRecord {
    pub fn new(uid: UserId, interval_secs: u64) -> Self {
        Self {
            uid,
            message: String::new(),
            interval_secs,
            chats: Vec::new(),
            logging_enabled: false,
            log_chat: None,
            running: false,
        }
    }
}

pub fn parse_interval(text: &str) -> Result<u64, ValidationError> {
    match text.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(ValidationError::Interval(text.trim().to_string())),
    }
}

/// Per-user configuration records backed by SQLite.
///
/// Every mutation is a single `BEGIN IMMEDIATE` transaction committed before
/// the call returns, and mutations for one user id are serialized.
pub struct ConfigStore {
    db: Arc<DatabasePool>,
    locks: KeyedLocks<UserId>,
    default_interval: u64,
}

impl ConfigStore {
    pub fn new(db: Arc<DatabasePool>, default_interval: u64) -> Self {
        Self {
            db,
            locks: KeyedLocks::new(),
            default_interval: default_interval.max(1),
        }
    }

    /// Returns the record, creating the default one on first access.
    pub async fn get(&self, uid: UserId) -> Result<UserRecord, StoreError> {
        let default_interval = self.default_interval;
        self.db
            .execute_with_timeout(move |conn| {
                let interval = i64::try_from(default_interval).unwrap_or(i64::MAX);
                conn.execute(
                    "INSERT OR IGNORE INTO users (uid, interval) VALUES (?1, ?2)",
                    params![uid, interval],
                )?;
                Ok(load(conn, uid)?.unwrap_or_else(|| UserRecord::new(uid, default_interval)))
            })
            .await
    }

    /// Returns the record without creating it.
    pub async fn find(&self, uid: UserId) -> Result<Option<UserRecord>, StoreError> {
        self.db.execute_with_timeout(move |conn| load(conn, uid)).await
    }

    /// Read-modify-write under the user's lock.
    pub async fn update<F, R>(&self, uid: UserId, mutator: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut UserRecord) -> R + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.locks.lock(&uid).await;
        let default_interval = self.default_interval;
        self.db
            .execute_with_timeout(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut record =
                    load(&tx, uid)?.unwrap_or_else(|| UserRecord::new(uid, default_interval));
                let result = mutator(&mut record);
                record.uid = uid;
                record.interval_secs = record.interval_secs.max(1);
                save(&tx, &record)?;
                tx.commit()?;
                Ok(result)
            })
            .await
    }

    pub async fn remove(&self, uid: UserId) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(&uid).await;
        self.db
            .execute_with_timeout(move |conn| {
                Ok(conn.execute("DELETE FROM users WHERE uid = ?1", [uid])? > 0)
            })
            .await
    }

    pub async fn list_chats(&self, uid: UserId) -> Result<Vec<ChatRef>, StoreError> {
        Ok(self.find(uid).await?.map(|r| r.chats).unwrap_or_default())
    }

    pub async fn add_chat(&self, uid: UserId, chat: ChatRef) -> Result<(), StoreError> {
        self.update(uid, move |r| r.chats.push(chat)).await
    }

    /// Removes the first occurrence. Returns whether anything was removed.
    pub async fn remove_chat(&self, uid: UserId, chat: ChatRef) -> Result<bool, StoreError> {
        self.update(uid, move |r| match r.chats.iter().position(|c| *c == chat) {
            Some(index) => {
                r.chats.remove(index);
                true
            }
            None => false,
        })
        .await
    }

    pub async fn set_message(&self, uid: UserId, message: String) -> Result<(), StoreError> {
        self.update(uid, move |r| r.message = message).await
    }

    pub async fn set_interval(&self, uid: UserId, secs: u64) -> Result<(), StoreError> {
        self.update(uid, move |r| r.interval_secs = secs.max(1)).await
    }

    #[cfg(test)]
    pub async fn set_logging(&self, uid: UserId, enabled: bool) -> Result<(), StoreError> {
        self.update(uid, move |r| r.logging_enabled = enabled).await
    }

    /// Flips the logging flag and returns the new value.
    pub async fn toggle_logging(&self, uid: UserId) -> Result<bool, StoreError> {
        self.update(uid, |r| {
            r.logging_enabled = !r.logging_enabled;
            r.logging_enabled
        })
        .await
    }

    pub async fn set_log_chat(&self, uid: UserId, chat: Option<ChatRef>) -> Result<(), StoreError> {
        self.update(uid, move |r| r.log_chat = chat).await
    }

    /// Only touches existing records.
    pub async fn set_running(&self, uid: UserId, running: bool) -> Result<(), StoreError> {
        let _guard = self.locks.lock(&uid).await;
        self.db
            .execute_with_timeout(move |conn| {
                conn.execute(
                    "UPDATE users SET running = ?1, updated_at = ?2 WHERE uid = ?3",
                    params![running, chrono::Utc::now().to_rfc3339(), uid],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn running_users(&self) -> Result<Vec<UserId>, StoreError> {
        self.db
            .execute_with_timeout(|conn| {
                let mut stmt =
                    conn.prepare("SELECT uid FROM users WHERE running = 1 ORDER BY uid")?;
                let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
                let mut users = Vec::new();
                for row in rows {
                    users.push(row?);
                }
                Ok(users)
            })
            .await
    }
}

fn load(conn: &Connection, uid: UserId) -> Result<Option<UserRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT message, interval, chats, logs, log_chat, running FROM users WHERE uid = ?1",
            [uid],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((message, interval, chats, logs, log_chat, running)) = row else {
        return Ok(None);
    };
    let chats: Vec<ChatRef> = serde_json::from_str(&chats)?;
    let log_chat = log_chat.map(ChatRef::from_stored);
    Ok(Some(UserRecord {
        uid,
        message,
        interval_secs: u64::try_from(interval).unwrap_or(1).max(1),
        chats,
        logging_enabled: logs,
        log_chat,
        running,
    }))
}

fn save(conn: &Connection, record: &UserRecord) -> Result<(), StoreError> {
    let chats = serde_json::to_string(&record.chats)?;
    let interval = i64::try_from(record.interval_secs).unwrap_or(i64::MAX);
    conn.execute(
        "INSERT INTO users (uid, message, interval, chats, logs, log_chat, running, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(uid) DO UPDATE SET
            message = excluded.message,
            interval = excluded.interval,
            chats = excluded.chats,
            logs = excluded.logs,
            log_chat = excluded.log_chat,
            running = excluded.running,
            updated_at = excluded.updated_at",
        params![
            record.uid,
            record.message,
            interval,
            chats,
            record.logging_enabled,
            record.log_chat.as_ref().map(ChatRef::as_str),
            record.running,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}
