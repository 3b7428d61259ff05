//! Schema versioning for the key-value database.
//!
//! The version lives in the `metadata` table. Each step in [`MIGRATIONS`]
//! runs in an immediate transaction together with the version bump, and
//! re-reads the version inside it, so two processes opening the same file
//! never apply a step twice.

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::{Error, Result};

use super::schema::{CREATE_KV_UPDATED_INDEX, SCHEMA_STATEMENTS};

/// Schema version this build writes.
pub const CURRENT_VERSION: i32 = 1;

const SCHEMA_VERSION_KEY: &str = "schema_version";

type Migration = fn(&Connection) -> Result<()>;

/// Upgrade steps, indexed by the version they produce.
const MIGRATIONS: &[(i32, Migration)] = &[(1, index_updated_at)];

/// Create missing tables and bring the schema up to [`CURRENT_VERSION`].
///
/// # Errors
///
/// Returns an error if a statement fails, or if the database was written by
/// a newer schema than this build understands.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        conn.execute(statement, [])?;
    }

    let found = get_schema_version(conn)?;
    if found > CURRENT_VERSION {
        return Err(Error::DatabaseMigration {
            message: format!(
                "database schema v{found} is newer than supported v{CURRENT_VERSION}"
            ),
        });
    }

    for &(version, step) in MIGRATIONS.iter().filter(|(v, _)| *v > found) {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        if get_schema_version(&tx)? >= version {
            continue;
        }
        step(&tx).map_err(|e| Error::DatabaseMigration {
            message: format!("step to v{version} failed: {e}"),
        })?;
        write_schema_version(&tx, version)?;
        tx.commit()?;
        tracing::debug!(version, "schema migrated");
    }

    Ok(())
}

/// Stored schema version; 0 for a database that has never been migrated.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        None => Ok(0),
        Some(raw) => raw.trim().parse().map_err(|_| Error::DatabaseMigration {
            message: format!("unreadable schema version '{raw}'"),
        }),
    }
}

fn write_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (SCHEMA_VERSION_KEY, version.to_string()),
    )?;
    Ok(())
}

fn index_updated_at(conn: &Connection) -> Result<()> {
    conn.execute(CREATE_KV_UPDATED_INDEX, [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn tables_only_db() -> Connection {
        let conn = memory_db();
        for statement in SCHEMA_STATEMENTS {
            conn.execute(statement, []).unwrap();
        }
        conn
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |_| Ok(()),
        )
        .optional()
        .unwrap()
        .is_some()
    }

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let conn = memory_db();
        initialize_schema(&conn).unwrap();

        assert!(table_exists(&conn, "kv"));
        assert!(table_exists(&conn, "metadata"));
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_initialize_twice_is_harmless() {
        let conn = memory_db();
        initialize_schema(&conn).unwrap();
        conn.execute("INSERT INTO kv (key, value) VALUES ('k', '1')", [])
            .unwrap();

        initialize_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_VERSION);
        let value: String = conn
            .query_row("SELECT value FROM kv WHERE key = 'k'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(value, "1");
    }

    #[test]
    fn test_unversioned_metadata_reads_as_zero() {
        let conn = tables_only_db();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);
    }

    #[test]
    fn test_garbage_version_is_an_error() {
        let conn = tables_only_db();
        write_schema_version(&conn, 1).unwrap();
        conn.execute(
            "UPDATE metadata SET value = 'one' WHERE key = ?1",
            [SCHEMA_VERSION_KEY],
        )
        .unwrap();

        let err = get_schema_version(&conn).unwrap_err();
        assert!(err.to_string().contains("unreadable schema version"));
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = tables_only_db();
        write_schema_version(&conn, CURRENT_VERSION + 1).unwrap();

        let err = initialize_schema(&conn).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn test_updated_at_index_exists() {
        let conn = memory_db();
        initialize_schema(&conn).unwrap();

        let index: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master
                 WHERE type = 'index' AND tbl_name = 'kv' AND name LIKE '%updated_at%'",
                [],
                |row| row.get(0),
            )
            .optional()
            .unwrap();
        assert!(index.is_some());
    }

    #[test]
    fn test_two_handles_on_one_file_migrate_once() {
        let dir = std::env::temp_dir().join(format!("rescuelink-migrate-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("shared.db");

        let first = Connection::open(&path).unwrap();
        let second = Connection::open(&path).unwrap();
        initialize_schema(&first).unwrap();
        initialize_schema(&second).unwrap();

        assert_eq!(get_schema_version(&second).unwrap(), CURRENT_VERSION);

        drop((first, second));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_migrations_are_ordered_and_end_at_current() {
        let versions: Vec<i32> = MIGRATIONS.iter().map(|(v, _)| *v).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.last(), Some(&CURRENT_VERSION));
    }
}
