//! Storage layer for rescuelink.
//!
//! This module provides the device's persistent key-value store, backed by
//! `SQLite`. The local alert queues and the user profile live here.

pub mod migrations;
pub mod schema;

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const UPSERT_SQL: &str = r"
INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
";

/// Computes the new value of a key from its current value.
pub type UpdateFn<'a> = Box<dyn FnOnce(Option<String>) -> Result<String> + 'a>;

/// A persistent string key-value store.
pub trait KeyValueStore: Send + Sync + Debug {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Returns whether the key existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn remove(&self, key: &str) -> Result<bool>;

    /// Replace the value of `key` with `f(current)` as one atomic step.
    ///
    /// No other writer, in this process or another one sharing the same
    /// store, can change `key` between the read and the write. If `f` fails
    /// nothing is written.
    ///
    /// The default implementation is only atomic against itself when the
    /// store is not shared; stores that can be shared override it.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or an error if the store cannot be read
    /// or written.
    fn update(&self, key: &str, f: UpdateFn<'_>) -> Result<()> {
        let next = f(self.get(key)?)?;
        self.set(key, &next)
    }

    /// Read several values at once, in the order of `keys`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn multi_get(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>> {
        keys.iter()
            .map(|key| Ok(((*key).to_string(), self.get(key)?)))
            .collect()
    }

    /// Write several values.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn multi_set(&self, entries: &[(&str, &str)]) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }
}

/// `SQLite`-backed [`KeyValueStore`].
///
/// The connection sits behind a mutex so one `Storage` can be shared between
/// the monitoring session and concurrent deliveries.
#[derive(Debug)]
pub struct Storage {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // Other processes (a running monitor, a manual `sos`) share this file
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("storage connection lock poisoned"))
    }

    /// All stored keys, most recently written first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY updated_at DESC, key ASC")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Get statistics about the storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn()?;

        let total_keys: i64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;

        let last: Option<String> = conn
            .query_row(
                "SELECT updated_at FROM kv WHERE updated_at IS NOT NULL ORDER BY updated_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let last_write = last
            .and_then(|s| NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S").ok())
            .map(|naive| naive.and_utc());

        let schema_version = migrations::get_schema_version(&conn)?;
        drop(conn);

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            total_keys,
            last_write,
            schema_version,
            db_size_bytes,
        })
    }
}

impl KeyValueStore for Storage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(UPSERT_SQL, params![key, value])?;
        debug!(key, bytes = value.len(), "stored value");
        Ok(())
    }

    fn update(&self, key: &str, f: UpdateFn<'_>) -> Result<()> {
        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock before the read
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        let next = f(current)?;
        tx.execute(UPSERT_SQL, params![key, next])?;
        tx.commit()?;
        debug!(key, bytes = next.len(), "updated value");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(affected > 0)
    }

    fn multi_set(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_SQL)?;
            for (key, value) in entries {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Statistics about the storage.
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Number of stored keys.
    pub total_keys: i64,
    /// When a key was last written.
    pub last_write: Option<DateTime<Utc>>,
    /// Schema version of the database.
    pub schema_version: i32,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}
