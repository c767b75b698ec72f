//! SQLite-backed storage implementation for document persistence.
//!
//! This module provides a persistent storage backend using SQLite for storing
//! document state and the history log. The exclusive section required by
//! [`DocumentStore::commit_locked`] is an `IMMEDIATE` transaction, which takes
//! the database write lock up front, so commits from other processes sharing
//! the file are serialized as well.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use super::engine;
use super::storage::{DeltaLog, DocumentStore, MergeFn, StorageResult};
use super::types::{DeltaEntry, DocSummary, DocTarget, timestamp_to_datetime};
use crate::error::QuireError;

/// How long a connection waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ENTRY_COLUMNS: &str = "id, target_type, target_id, author, time, update_blob";

/// SQLite-backed document storage.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    ///
    /// This will create the necessary tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or if schema
    /// initialization fails.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the storage is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| QuireError::LockPoisoned)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Current state of every document
            CREATE TABLE IF NOT EXISTS documents (
                target_type TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                state BLOB NOT NULL,
                fields TEXT NOT NULL DEFAULT '{}',
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (target_type, target_id)
            );

            -- Append-only history, one row per flush
            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_type TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                author TEXT,
                time INTEGER NOT NULL,
                update_blob BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_target ON history(target_type, target_id, id);
            "#,
        )?;
        Ok(())
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<DeltaEntry> {
    Ok(DeltaEntry {
        id: row.get(0)?,
        target: DocTarget::new(row.get::<_, String>(1)?, row.get(2)?),
        author: row.get(3)?,
        time: timestamp_to_datetime(row.get(4)?),
        update: row.get(5)?,
    })
}

fn insert_entry(
    conn: &Connection,
    target: &DocTarget,
    author: Option<&str>,
    update: &[u8],
) -> StorageResult<i64> {
    conn.execute(
        "INSERT INTO history (target_type, target_id, author, time, update_blob)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            target.target_type,
            target.target_id,
            author,
            Utc::now().timestamp_millis(),
            update
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl DeltaLog for SqliteStorage {
    fn append_entry(
        &self,
        target: &DocTarget,
        author: Option<&str>,
        update: &[u8],
    ) -> StorageResult<i64> {
        let conn = self.conn()?;
        insert_entry(&conn, target, author, update)
    }

    fn entries_until(
        &self,
        target: &DocTarget,
        until_id: i64,
        inclusive: bool,
    ) -> StorageResult<Vec<DeltaEntry>> {
        let conn = self.conn()?;
        let comparison = if inclusive { "<=" } else { "<" };
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM history
             WHERE target_type = ?1 AND target_id = ?2 AND id {comparison} ?3
             ORDER BY id ASC"
        ))?;
        let entries = stmt
            .query_map(
                params![target.target_type, target.target_id, until_id],
                row_to_entry,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn get_entry(&self, target: &DocTarget, id: i64) -> StorageResult<Option<DeltaEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM history
                     WHERE target_type = ?1 AND target_id = ?2 AND id = ?3"
                ),
                params![target.target_type, target.target_id, id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn list_entries(
        &self,
        target: &DocTarget,
        offset: usize,
        limit: usize,
        recent_first: bool,
    ) -> StorageResult<Vec<DeltaEntry>> {
        let conn = self.conn()?;
        let order = if recent_first { "DESC" } else { "ASC" };
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM history
             WHERE target_type = ?1 AND target_id = ?2
             ORDER BY id {order}
             LIMIT ?3 OFFSET ?4"
        ))?;
        let entries = stmt
            .query_map(
                params![
                    target.target_type,
                    target.target_id,
                    limit as i64,
                    offset as i64
                ],
                row_to_entry,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn count_entries(&self, target: &DocTarget) -> StorageResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM history WHERE target_type = ?1 AND target_id = ?2",
            params![target.target_type, target.target_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn latest_entry_id(&self, target: &DocTarget) -> StorageResult<Option<i64>> {
        let conn = self.conn()?;
        let id: Option<i64> = conn.query_row(
            "SELECT MAX(id) FROM history WHERE target_type = ?1 AND target_id = ?2",
            params![target.target_type, target.target_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }
}

impl DocumentStore for SqliteStorage {
    fn create_doc(&self, target_type: &str) -> StorageResult<DocTarget> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let next_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(target_id), 0) + 1 FROM documents WHERE target_type = ?1",
            params![target_type],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO documents (target_type, target_id, state, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                target_type,
                next_id,
                engine::empty_state(),
                Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;

        Ok(DocTarget::new(target_type, next_id))
    }

    fn save_doc(&self, target: &DocTarget, state: &[u8]) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO documents (target_type, target_id, state, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(target_type, target_id)
             DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![
                target.target_type,
                target.target_id,
                state,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn load_doc(&self, target: &DocTarget) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                "SELECT state FROM documents WHERE target_type = ?1 AND target_id = ?2",
                params![target.target_type, target.target_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    fn contains_doc(&self, target: &DocTarget) -> StorageResult<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM documents WHERE target_type = ?1 AND target_id = ?2",
                params![target.target_type, target.target_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn list_summaries(&self, target_type: &str) -> StorageResult<Vec<DocSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT target_id, fields, updated_at FROM documents
             WHERE target_type = ?1 ORDER BY target_id ASC",
        )?;
        let rows = stmt
            .query_map(params![target_type], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(target_id, fields, updated_at)| {
                Ok(DocSummary {
                    target: DocTarget::new(target_type, target_id),
                    fields: serde_json::from_str(&fields)?,
                    updated_at: timestamp_to_datetime(updated_at),
                })
            })
            .collect()
    }

    fn list_docs(&self, target_type: &str) -> StorageResult<Vec<DocTarget>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT target_id FROM documents WHERE target_type = ?1 ORDER BY target_id ASC",
        )?;
        let targets = stmt
            .query_map(params![target_type], |row| {
                Ok(DocTarget::new(target_type, row.get(0)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(targets)
    }

    fn commit_locked(
        &self,
        target: &DocTarget,
        author: Option<&str>,
        merge: &mut MergeFn<'_>,
    ) -> StorageResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let base: Vec<u8> = tx
            .query_row(
                "SELECT state FROM documents WHERE target_type = ?1 AND target_id = ?2",
                params![target.target_type, target.target_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| QuireError::DocumentNotFound(target.clone()))?;

        // Dropping `tx` on any early return rolls everything back
        let merged = merge(&base)?;

        tx.execute(
            "UPDATE documents SET state = ?3, fields = ?4, updated_at = ?5
             WHERE target_type = ?1 AND target_id = ?2",
            params![
                target.target_type,
                target.target_id,
                merged.state,
                serde_json::to_string(&merged.fields)?,
                Utc::now().timestamp_millis()
            ],
        )?;
        let id = insert_entry(&tx, target, author, &merged.delta)?;
        tx.commit()?;

        Ok(id)
    }
}
