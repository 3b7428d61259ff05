//! `SQLite` schema definitions for rescuelink.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the key-value table.
///
/// Queues and the user profile are stored here as JSON strings.
/// `updated_at` is set on every write.
pub const CREATE_KV_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// SQL statement to create an index on `updated_at`.
pub const CREATE_KV_UPDATED_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_kv_updated_at ON kv(updated_at DESC)
";

/// All base schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[CREATE_KV_TABLE, CREATE_METADATA_TABLE];
