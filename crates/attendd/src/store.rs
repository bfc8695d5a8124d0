//! SQLite persistence: enrolled users, reference embeddings, attendance sessions.
//!
//! One synchronous connection behind a mutex. Async callers go through
//! `tokio::task::spawn_blocking`.

use attend_core::gallery::{GallerySource, StoredFaceRow};
use attend_core::{Embedding, UserRef};
use chrono::{DateTime, Utc};
use rusqlite::{ffi, params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("member code already enrolled: {0}")]
    DuplicateCode(String),
    #[error("unknown member code: {0}")]
    UnknownUser(String),
    #[error("member already has an open session: {0}")]
    SessionAlreadyOpen(String),
    #[error("embedding encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An open attendance session joined with its user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentMember {
    pub session_id: i64,
    pub user_id: i64,
    pub code: String,
    pub name: String,
    pub entry_time: DateTime<Utc>,
}

/// A closed attendance session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedSession {
    pub session_id: i64,
    pub user_id: i64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub duration_minutes: i64,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_user(&self, code: &str, name: &str) -> Result<UserRef> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO users (code, name, created_at) VALUES (?1, ?2, ?3)",
            params![code, name, Utc::now()],
        );
        match inserted {
            Ok(_) => Ok(UserRef {
                id: conn.last_insert_rowid(),
                code: code.to_string(),
                name: name.to_string(),
            }),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateCode(code.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a user; embeddings and sessions go with it. `false` if unknown.
    pub fn remove_user(&self, code: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM users WHERE code = ?1", params![code])?;
        Ok(removed > 0)
    }

    pub fn find_user(&self, code: &str) -> Result<Option<UserRef>> {
        let user = self
            .conn()
            .query_row(
                "SELECT id, code, name FROM users WHERE code = ?1",
                params![code],
                |row| {
                    Ok(UserRef {
                        id: row.get(0)?,
                        code: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<UserRef>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, code, name FROM users ORDER BY code")?;
        let users = stmt
            .query_map([], |row| {
                Ok(UserRef {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    name: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Append reference embeddings for `code` in one transaction.
    ///
    /// Earlier embeddings are kept. Returns the user's total afterwards.
    pub fn append_embeddings(&self, code: &str, embeddings: &[Embedding]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let user_id: i64 = tx
            .query_row("SELECT id FROM users WHERE code = ?1", params![code], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::UnknownUser(code.to_string()))?;

        let now = Utc::now();
        for embedding in embeddings {
            let blob = serde_json::to_string(&embedding.values)?;
            tx.execute(
                "INSERT INTO face_embeddings (user_id, embedding, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, blob, now],
            )?;
        }

        let total: i64 = tx.query_row(
            "SELECT COUNT(*) FROM face_embeddings WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(total as usize)
    }

    #[cfg(test)]
    pub fn embedding_count(&self, code: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM face_embeddings f JOIN users u ON u.id = f.user_id WHERE u.code = ?1",
            params![code],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Open a session. At most one open session per user is enforced by
    /// a partial unique index.
    pub fn open_session(&self, user: &UserRef, entry_time: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO attendance_sessions (user_id, entry_time) VALUES (?1, ?2)",
            params![user.id, entry_time],
        );
        match inserted {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::SessionAlreadyOpen(user.code.clone())),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(test)]
    pub fn has_open_session(&self, user_id: i64) -> Result<bool> {
        let open: Option<i64> = self
            .conn()
            .query_row(
                "SELECT id FROM attendance_sessions WHERE user_id = ?1 AND exit_time IS NULL",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(open.is_some())
    }

    /// Close the user's open session. `None` if there was none.
    pub fn close_session(&self, user_id: i64, exit_time: DateTime<Utc>) -> Result<Option<CompletedSession>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let open: Option<(i64, DateTime<Utc>)> = tx
            .query_row(
                "SELECT id, entry_time FROM attendance_sessions WHERE user_id = ?1 AND exit_time IS NULL",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((session_id, entry_time)) = open else {
            return Ok(None);
        };

        let duration_minutes = (exit_time - entry_time).num_minutes().max(0);
        tx.execute(
            "UPDATE attendance_sessions SET exit_time = ?2, duration_minutes = ?3 WHERE id = ?1",
            params![session_id, exit_time, duration_minutes],
        )?;
        tx.commit()?;

        Ok(Some(CompletedSession {
            session_id,
            user_id,
            entry_time,
            exit_time,
            duration_minutes,
        }))
    }

    /// Every open session, newest entry first.
    pub fn open_sessions(&self) -> Result<Vec<PresentMember>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT s.id, u.id, u.code, u.name, s.entry_time
             FROM attendance_sessions s JOIN users u ON u.id = s.user_id
             WHERE s.exit_time IS NULL
             ORDER BY s.entry_time DESC, s.id DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PresentMember {
                    session_id: row.get(0)?,
                    user_id: row.get(1)?,
                    code: row.get(2)?,
                    name: row.get(3)?,
                    entry_time: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Closed sessions of one user, newest entry first.
    pub fn completed_sessions(&self, user_id: i64, limit: usize) -> Result<Vec<CompletedSession>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, entry_time, exit_time, duration_minutes
             FROM attendance_sessions
             WHERE user_id = ?1 AND exit_time IS NOT NULL
             ORDER BY entry_time DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(CompletedSession {
                    session_id: row.get(0)?,
                    user_id: row.get(1)?,
                    entry_time: row.get(2)?,
                    exit_time: row.get(3)?,
                    duration_minutes: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl GallerySource for Store {
    type Error = StoreError;

    fn fetch_rows(&self) -> Result<Vec<StoredFaceRow>> {
        let conn = self.conn();
        // Read the blob as raw text so a malformed value never fails the query.
        let mut stmt = conn.prepare(
            "SELECT u.id, u.code, u.name, CAST(f.embedding AS TEXT)
             FROM face_embeddings f JOIN users u ON u.id = f.user_id
             ORDER BY u.id, f.id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredFaceRow {
                    user_id: row.get(0)?,
                    code: row.get(1)?,
                    name: row.get(2)?,
                    blob: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// A UNIQUE index rejected the row. Foreign key and NOT NULL failures are not this.
fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE)
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    embedding TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_face_embeddings_user ON face_embeddings(user_id);

CREATE TABLE IF NOT EXISTS attendance_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    entry_time TEXT NOT NULL,
    exit_time TEXT,
    duration_minutes INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_one_open_session
    ON attendance_sessions(user_id) WHERE exit_time IS NULL;
";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_add_and_find_user() {
        let s = store();
        let u = s.add_user("SV100", "Linh").unwrap();
        assert_eq!(s.find_user("SV100").unwrap(), Some(u));
        assert_eq!(s.find_user("SV999").unwrap(), None);
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let s = store();
        s.add_user("SV100", "Linh").unwrap();
        assert!(matches!(s.add_user("SV100", "Other"), Err(StoreError::DuplicateCode(c)) if c == "SV100"));
    }

    #[test]
    fn test_embeddings_append() {
        let s = store();
        s.add_user("SV100", "Linh").unwrap();
        assert_eq!(s.append_embeddings("SV100", &[Embedding::new(vec![1.0, 0.0])]).unwrap(), 1);
        assert_eq!(
            s.append_embeddings("SV100", &[Embedding::new(vec![0.0, 1.0]), Embedding::new(vec![0.6, 0.8])])
                .unwrap(),
            3
        );
        assert_eq!(s.fetch_rows().unwrap().len(), 3);
    }

    #[test]
    fn test_append_for_unknown_user() {
        let s = store();
        let err = s.append_embeddings("NOPE", &[Embedding::new(vec![1.0])]).unwrap_err();
        assert!(matches!(err, StoreError::UnknownUser(_)));
    }

    #[test]
    fn test_remove_user_cascades() {
        let s = store();
        let u = s.add_user("SV100", "Linh").unwrap();
        s.append_embeddings("SV100", &[Embedding::new(vec![1.0, 0.0])]).unwrap();
        s.open_session(&u, Utc::now()).unwrap();

        assert!(s.remove_user("SV100").unwrap());
        assert!(s.fetch_rows().unwrap().is_empty());
        assert!(s.open_sessions().unwrap().is_empty());
        assert!(!s.remove_user("SV100").unwrap());
    }

    #[test]
    fn test_fetch_rows_tolerates_malformed_blob() {
        let s = store();
        let u = s.add_user("SV100", "Linh").unwrap();
        s.conn()
            .execute(
                "INSERT INTO face_embeddings (user_id, embedding, created_at) VALUES (?1, 'not json', ?2)",
                params![u.id, Utc::now()],
            )
            .unwrap();
        let rows = s.fetch_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].blob, "not json");
    }

    #[test]
    fn test_single_open_session() {
        let s = store();
        let u = s.add_user("SV100", "Linh").unwrap();
        s.open_session(&u, Utc::now()).unwrap();
        assert!(s.has_open_session(u.id).unwrap());
        assert!(matches!(s.open_session(&u, Utc::now()), Err(StoreError::SessionAlreadyOpen(_))));
    }

    #[test]
    fn test_close_session_duration() {
        let s = store();
        let u = s.add_user("SV100", "Linh").unwrap();
        let entry = Utc::now() - Duration::minutes(95) - Duration::seconds(20);
        s.open_session(&u, entry).unwrap();

        let closed = s.close_session(u.id, Utc::now()).unwrap().unwrap();
        assert_eq!(closed.duration_minutes, 95);
        assert!(!s.has_open_session(u.id).unwrap());
        assert!(s.close_session(u.id, Utc::now()).unwrap().is_none());

        // A closed session frees the user to check in again.
        s.open_session(&u, Utc::now()).unwrap();
        assert_eq!(s.completed_sessions(u.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_open_sessions_newest_first() {
        let s = store();
        let a = s.add_user("A", "Ada").unwrap();
        let b = s.add_user("B", "Bo").unwrap();
        let now = Utc::now();
        s.open_session(&a, now - Duration::minutes(30)).unwrap();
        s.open_session(&b, now - Duration::minutes(5)).unwrap();

        let present = s.open_sessions().unwrap();
        let codes: Vec<_> = present.iter().map(|p| p.code.as_str()).collect();
        assert_eq!(codes, vec!["B", "A"]);
    }

    #[test]
    fn test_history_newest_first_and_limited() {
        let s = store();
        let u = s.add_user("SV100", "Linh").unwrap();
        let day = Utc::now() - Duration::days(3);
        for offset in [0, 2, 1] {
            let entry = day + Duration::days(offset);
            s.open_session(&u, entry).unwrap();
            s.close_session(u.id, entry + Duration::minutes(45)).unwrap().unwrap();
        }

        let history = s.completed_sessions(u.id, 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].entry_time, day + Duration::days(2));
        assert_eq!(history[1].entry_time, day + Duration::days(1));
        assert!(history.iter().all(|h| h.duration_minutes == 45));
    }

    #[test]
    fn test_session_for_missing_user_is_not_already_open() {
        let s = store();
        let ghost = UserRef { id: 4242, code: "GHOST".into(), name: "Gone".into() };
        let err = s.open_session(&ghost, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }
}
