use chrono::{DateTime, SecondsFormat, Utc};
use faceguard_core::types::EmbeddingError;
use faceguard_core::{
    AccessLogEntry, AccessLogSink, AccessOutcome, CollaboratorError, Embedding, GalleryEntry, GallerySource,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("a user with email {0} is already enrolled")]
    DuplicateEmail(String),
    #[error("user {0} not found")]
    UserNotFound(i64),
    #[error("nothing to update")]
    EmptyUpdate,
    #[error("user {id} has a corrupt embedding: {source}")]
    CorruptEmbedding { id: i64, source: EmbeddingError },
}

impl From<StoreError> for CollaboratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CorruptEmbedding { id, source } => CollaboratorError::Corrupt {
                id,
                reason: source.to_string(),
            },
            other => CollaboratorError::Storage(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Access-log row joined with the user's name (if the user still exists).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessLogRecord {
    pub id: i64,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub outcome: AccessOutcome,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_users: u64,
    pub total_access_logs: u64,
    pub granted: u64,
    pub denied: u64,
    pub last_access: Option<DateTime<Utc>>,
    pub database_path: Option<PathBuf>,
}

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS users (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        name       TEXT NOT NULL,
        email      TEXT NOT NULL UNIQUE,
        embedding  BLOB NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS access_logs (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id    INTEGER REFERENCES users(id) ON DELETE SET NULL,
        outcome    TEXT NOT NULL,
        confidence REAL NOT NULL,
        timestamp  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_access_logs_timestamp ON access_logs(timestamp);
";

/// SQLite-backed user gallery and access log.
///
/// A single connection behind a mutex; every operation is one short
/// statement (or transaction), so callers on different threads serialize here.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Directory {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn, Some(path.to_path_buf()))?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enroll a user. Emails are unique.
    pub fn add_user(&self, name: &str, email: &str, embedding: &Embedding) -> Result<i64, StoreError> {
        let conn = self.conn();
        let now = format_ts(&Utc::now());
        let inserted = conn.execute(
            "INSERT INTO users (name, email, embedding, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![name, email, embedding.to_bytes(), now],
        );
        match inserted {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                tracing::info!(user_id = id, name, "user enrolled");
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::DuplicateEmail(email.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let user = self
            .conn()
            .query_row(
                "SELECT id, name, email, created_at, updated_at FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user = self
            .conn()
            .query_row(
                "SELECT id, name, email, created_at, updated_at FROM users WHERE email = ?1",
                params![email],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// All users, ordered by name.
    pub fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, email, created_at, updated_at FROM users ORDER BY name, id")?;
        let users = stmt.query_map([], user_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Change a user's name and/or email. Fields left `None` keep their value.
    pub fn update_user(&self, id: i64, name: Option<&str>, email: Option<&str>) -> Result<(), StoreError> {
        if name.is_none() && email.is_none() {
            return Err(StoreError::EmptyUpdate);
        }
        let updated = self.conn().execute(
            "UPDATE users SET name = COALESCE(?1, name), email = COALESCE(?2, email), updated_at = ?3
             WHERE id = ?4",
            params![name, email, format_ts(&Utc::now()), id],
        );
        match updated {
            Ok(0) => Err(StoreError::UserNotFound(id)),
            Ok(_) => {
                tracing::info!(user_id = id, name, email, "user updated");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::DuplicateEmail(email.unwrap_or_default().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a user. Their access-log rows stay, with a NULL user id.
    pub fn delete_user(&self, id: i64) -> Result<(), StoreError> {
        let removed = self.conn().execute("DELETE FROM users WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::UserNotFound(id));
        }
        tracing::info!(user_id = id, "user removed");
        Ok(())
    }

    /// Every enrolled user with a decodable embedding.
    ///
    /// Rows with a corrupt blob are skipped with a warning so one bad
    /// record does not lock everybody out.
    pub fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, embedding FROM users ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, Vec<u8>>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut gallery = Vec::with_capacity(rows.len());
        for (user_id, name, blob) in rows {
            match Embedding::from_bytes(&blob) {
                Ok(embedding) => gallery.push(GalleryEntry {
                    user_id,
                    name,
                    embedding,
                }),
                Err(source) => {
                    let err = StoreError::CorruptEmbedding { id: user_id, source };
                    tracing::warn!(user_id, error = %err, "skipping user");
                }
            }
        }
        Ok(gallery)
    }

    pub fn append_log(&self, entry: &AccessLogEntry) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO access_logs (user_id, outcome, confidence, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.user_id,
                entry.outcome.as_str(),
                f64::from(entry.confidence),
                format_ts(&entry.timestamp)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent access attempts first.
    pub fn recent_logs(&self, limit: usize) -> Result<Vec<AccessLogRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT l.id, l.user_id, u.name, l.outcome, l.confidence, l.timestamp
             FROM access_logs l LEFT JOIN users u ON l.user_id = u.id
             ORDER BY l.timestamp DESC, l.id DESC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map(params![limit], |row| {
                Ok(AccessLogRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    user_name: row.get(2)?,
                    outcome: parse_outcome(3, row.get(3)?)?,
                    confidence: row.get::<_, f64>(4)? as f32,
                    timestamp: parse_ts(5, row.get(5)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn();
        let total_users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        let (total_logs, granted, last): (i64, i64, Option<String>) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(outcome = 'granted'), 0), MAX(timestamp) FROM access_logs",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        let last_access = last.map(|s| parse_ts(2, s)).transpose()?;

        Ok(StoreStats {
            total_users: total_users.max(0) as u64,
            total_access_logs: total_logs.max(0) as u64,
            granted: granted.max(0) as u64,
            denied: (total_logs - granted).max(0) as u64,
            last_access,
            database_path: self.path.clone(),
        })
    }
}

impl GallerySource for Store {
    fn load_gallery(&self) -> Result<Vec<GalleryEntry>, CollaboratorError> {
        Ok(Store::load_gallery(self)?)
    }
}

impl AccessLogSink for Store {
    fn append_log(&self, entry: &AccessLogEntry) -> Result<(), CollaboratorError> {
        Store::append_log(self, entry)?;
        Ok(())
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        created_at: parse_ts(3, row.get(3)?)?,
        updated_at: parse_ts(4, row.get(4)?)?,
    })
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_outcome(idx: usize, raw: String) -> rusqlite::Result<AccessOutcome> {
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn embedding(seed: f32) -> Embedding {
        Embedding {
            values: (0..128).map(|i| seed + i as f32 * 0.01).collect(),
            model_version: Some("test".into()),
        }
    }

    fn log(user_id: Option<i64>, outcome: AccessOutcome, secs_ago: i64) -> AccessLogEntry {
        AccessLogEntry {
            user_id,
            outcome,
            confidence: if user_id.is_some() { 72.5 } else { 0.0 },
            timestamp: Utc::now() - Duration::seconds(secs_ago),
        }
    }

    #[test]
    fn test_add_and_get_user() {
        let store = Store::open_in_memory().unwrap();
        let id = store.add_user("Ana", "ana@example.com", &embedding(0.1)).unwrap();

        let user = store.get_user(id).unwrap().unwrap();
        assert_eq!(user.name, "Ana");
        assert_eq!(user.email, "ana@example.com");
        assert_eq!(store.get_user_by_email("ana@example.com").unwrap(), Some(user));
        assert_eq!(store.get_user(id + 100).unwrap(), None);
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.add_user("Ana", "ana@example.com", &embedding(0.1)).unwrap();
        let err = store.add_user("Other", "ana@example.com", &embedding(0.2)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail(ref e) if e == "ana@example.com"));
        assert_eq!(store.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_update_user() {
        let store = Store::open_in_memory().unwrap();
        let ana = store.add_user("Ana", "ana@example.com", &embedding(0.1)).unwrap();
        store.add_user("Luis", "luis@example.com", &embedding(0.2)).unwrap();
        let before = store.get_user(ana).unwrap().unwrap();
        assert_eq!(before.created_at, before.updated_at);

        store.update_user(ana, Some("Ana Maria"), None).unwrap();
        let renamed = store.get_user(ana).unwrap().unwrap();
        assert_eq!(renamed.name, "Ana Maria");
        assert_eq!(renamed.email, "ana@example.com");
        assert_eq!(renamed.created_at, before.created_at);
        assert!(renamed.updated_at >= before.updated_at);

        store.update_user(ana, None, Some("am@example.com")).unwrap();
        assert_eq!(store.get_user(ana).unwrap().unwrap().email, "am@example.com");

        let err = store.update_user(ana, None, Some("luis@example.com")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail(ref e) if e == "luis@example.com"));
        assert!(matches!(store.update_user(ana, None, None), Err(StoreError::EmptyUpdate)));
        assert!(matches!(store.update_user(ana + 100, Some("X"), None), Err(StoreError::UserNotFound(_))));
        assert_eq!(store.get_user(ana).unwrap().unwrap().name, "Ana Maria");
    }

    #[test]
    fn test_list_users_sorted_by_name() {
        let store = Store::open_in_memory().unwrap();
        store.add_user("Zoe", "z@example.com", &embedding(0.1)).unwrap();
        store.add_user("Ana", "a@example.com", &embedding(0.2)).unwrap();
        let names: Vec<_> = store.list_users().unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(names, ["Ana", "Zoe"]);
    }

    #[test]
    fn test_gallery_round_trips_embeddings() {
        let store = Store::open_in_memory().unwrap();
        let e = embedding(0.5);
        let id = store.add_user("Ana", "ana@example.com", &e).unwrap();

        let gallery = store.load_gallery().unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].user_id, id);
        assert_eq!(gallery[0].embedding, e);
    }

    #[test]
    fn test_gallery_skips_corrupt_blob() {
        let store = Store::open_in_memory().unwrap();
        store.add_user("Ana", "ana@example.com", &embedding(0.5)).unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO users (name, email, embedding, created_at, updated_at)
                 VALUES ('Bad', 'bad@example.com', x'0102', ?1, ?1)",
                params![format_ts(&Utc::now())],
            )
            .unwrap();

        let gallery = store.load_gallery().unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].name, "Ana");
    }

    #[test]
    fn test_delete_user_keeps_logs() {
        let store = Store::open_in_memory().unwrap();
        let id = store.add_user("Ana", "ana@example.com", &embedding(0.1)).unwrap();
        store.append_log(&log(Some(id), AccessOutcome::Granted, 0)).unwrap();

        store.delete_user(id).unwrap();
        assert!(matches!(store.delete_user(id), Err(StoreError::UserNotFound(_))));

        let logs = store.recent_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].user_id, None);
        assert_eq!(logs[0].user_name, None);
        assert_eq!(logs[0].outcome, AccessOutcome::Granted);
    }

    #[test]
    fn test_recent_logs_newest_first_with_limit() {
        let store = Store::open_in_memory().unwrap();
        let id = store.add_user("Ana", "ana@example.com", &embedding(0.1)).unwrap();
        store.append_log(&log(Some(id), AccessOutcome::Granted, 30)).unwrap();
        store.append_log(&log(None, AccessOutcome::Denied, 10)).unwrap();
        store.append_log(&log(Some(id), AccessOutcome::Granted, 20)).unwrap();

        let logs = store.recent_logs(2).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].outcome, AccessOutcome::Denied);
        assert_eq!(logs[1].user_name.as_deref(), Some("Ana"));
        assert_eq!(logs[1].confidence, 72.5);
        assert!(logs[0].timestamp > logs[1].timestamp);
    }

    #[test]
    fn test_stats() {
        let store = Store::open_in_memory().unwrap();
        let empty = store.stats().unwrap();
        assert_eq!(empty.total_users, 0);
        assert_eq!(empty.total_access_logs, 0);
        assert_eq!(empty.last_access, None);

        let id = store.add_user("Ana", "ana@example.com", &embedding(0.1)).unwrap();
        let newest = log(None, AccessOutcome::Denied, 0);
        store.append_log(&log(Some(id), AccessOutcome::Granted, 5)).unwrap();
        store.append_log(&newest).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_users, 1);
        assert_eq!(stats.total_access_logs, 2);
        assert_eq!(stats.granted, 1);
        assert_eq!(stats.denied, 1);
        let last = stats.last_access.unwrap();
        assert!((last - newest.timestamp).num_milliseconds().abs() < 1);
    }

    #[test]
    fn test_collaborator_traits() {
        let store = Store::open_in_memory().unwrap();
        store.add_user("Ana", "ana@example.com", &embedding(0.1)).unwrap();

        let source: &dyn GallerySource = &store;
        assert_eq!(source.load_gallery().unwrap().len(), 1);

        let sink: &dyn AccessLogSink = &store;
        sink.append_log(&log(None, AccessOutcome::Denied, 0)).unwrap();
        assert_eq!(store.stats().unwrap().total_access_logs, 1);
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = std::env::temp_dir().join(format!("faceguard-store-{}", std::process::id()));
        let path = dir.join("nested").join("faceguard.db");
        {
            let store = Store::open(&path).unwrap();
            store.add_user("Ana", "ana@example.com", &embedding(0.1)).unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.list_users().unwrap().len(), 1);
        assert_eq!(reopened.stats().unwrap().database_path, Some(path.clone()));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
