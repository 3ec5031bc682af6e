//! # SQLite Store
//!
//! A [`CertStorer`] keeping records in a single SQLite table.
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{CertRecord, CertStorer, MAX_TIMESTAMP, StoreError, check_timestamps, now};

/// How long a statement waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "key_id, principals, created_at, expires_at, revoked, raw_cert";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS issued_certs (
    key_id TEXT PRIMARY KEY NOT NULL,
    principals TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0,
    raw_cert BLOB NOT NULL DEFAULT x''
);
CREATE INDEX IF NOT EXISTS issued_certs_revoked ON issued_certs (revoked, expires_at);
";

/// A certificate store backed by SQLite.
///
/// Every operation is a single statement, so concurrent revocations and inserts are ordered by
/// SQLite itself. Principals are stored as a JSON array.
///
/// Schema:
/// - issued_certs: (key_id TEXT PRIMARY KEY, principals TEXT, created_at INTEGER,
///   expires_at INTEGER, revoked INTEGER, raw_cert BLOB)
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Opens or creates the database at `path` and makes sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, path)
    }

    /// Opens a private database that disappears when the store is closed.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        debug!("opened certificate database {:?}", path);
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Get the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CertRecord> {
    let principals: String = row.get(1)?;
    let principals = serde_json::from_str(&principals)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let created_at: i64 = row.get(2)?;
    let expires: i64 = row.get(3)?;
    Ok(CertRecord {
        key_id: row.get(0)?,
        principals,
        created_at: created_at.max(0) as u64,
        expires: expires.max(0) as u64,
        revoked: row.get(4)?,
        raw: row.get(5)?,
    })
}

impl CertStorer for SqliteStore {
    fn set_record(&self, record: &CertRecord) -> Result<(), StoreError> {
        let principals = serde_json::to_string(&record.principals)?;
        let (created_at, expires) = check_timestamps(record)?;
        debug!("storing certificate {}", record.key_id);
        self.lock()?.execute(
            "INSERT INTO issued_certs (key_id, principals, created_at, expires_at, revoked, raw_cert)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key_id) DO UPDATE SET
                principals = excluded.principals,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                revoked = MAX(revoked, excluded.revoked),
                raw_cert = excluded.raw_cert",
            params![
                record.key_id,
                principals,
                created_at,
                expires,
                record.revoked,
                record.raw
            ],
        )?;
        Ok(())
    }

    fn get(&self, key_id: &str) -> Result<CertRecord, StoreError> {
        let record = self
            .lock()?
            .query_row(
                &format!("SELECT {} FROM issued_certs WHERE key_id = ?1", COLUMNS),
                params![key_id],
                record_from_row,
            )
            .optional()?;
        record.ok_or_else(|| {
            debug!("certificate {} not found", key_id);
            StoreError::NotFound(key_id.to_string())
        })
    }

    fn list(&self) -> Result<Vec<CertRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM issued_certs ORDER BY key_id",
            COLUMNS
        ))?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn revoke(&self, key_id: &str) -> Result<(), StoreError> {
        let changed = self.lock()?.execute(
            "UPDATE issued_certs SET revoked = 1 WHERE key_id = ?1 AND revoked = 0",
            params![key_id],
        )?;
        if changed > 0 {
            info!("revoking certificate {}", key_id);
        } else {
            debug!("certificate {} unknown or already revoked", key_id);
        }
        Ok(())
    }

    fn get_revoked(&self) -> Result<Vec<CertRecord>, StoreError> {
        let now = now().min(MAX_TIMESTAMP) as i64;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM issued_certs WHERE revoked = 1 AND expires_at > ?1 ORDER BY key_id",
            COLUMNS
        ))?;
        let records = stmt
            .query_map(params![now], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        debug!("closing certificate database {:?}", self.path);
        let conn = self.conn.into_inner().map_err(|_| StoreError::Poisoned)?;
        conn.close().map_err(|(_, e)| StoreError::Storage(e))
    }
}
