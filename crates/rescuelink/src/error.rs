//! Error types for rescuelink.
//!
//! Library code returns [`Error`]. The remote store boundary has its own
//! [`RemoteError`](crate::remote::RemoteError) so the delivery manager can
//! turn any remote failure into a soft delivery result.

use std::path::PathBuf;
use thiserror::Error;

use crate::remote::RemoteError;

/// Errors raised by storage, configuration and device access.
#[derive(Error, Debug)]
pub enum Error {
    // Local storage
    /// The key-value database could not be opened.
    #[error("cannot open alert database {path}: {source}")]
    DatabaseOpen {
        /// Database file.
        path: PathBuf,
        /// `SQLite` error.
        #[source]
        source: rusqlite::Error,
    },

    /// A statement against the key-value database failed.
    #[error("alert database error: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// The schema could not be brought up to date.
    #[error("schema migration: {message}")]
    DatabaseMigration {
        /// What failed.
        message: String,
    },

    /// A persisted queue could not be decoded.
    #[error("local queue '{key}' is corrupt: {message}")]
    QueueCorrupt {
        /// Storage key of the queue.
        key: String,
        /// Decoder message.
        message: String,
    },

    // Configuration
    /// The layered configuration could not be read.
    #[error("cannot load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// A configuration value is out of range or malformed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Which value and why.
        message: String,
    },

    // Device
    /// The motion sensor is not available on this device.
    #[error("motion sensor '{name}' is unavailable; crash detection disabled")]
    SensorUnavailable {
        /// Name of the motion source.
        name: &'static str,
    },

    /// A required device permission was denied.
    #[error("{permission} permission denied. {instructions}")]
    PermissionMissing {
        /// Permission name, e.g. `location`.
        permission: String,
        /// How the user can grant it.
        instructions: String,
    },

    /// No location fix could be obtained in time.
    #[error("current location unavailable; check location permission and signal")]
    LocationUnavailable,

    /// Reading a sensor replay failed.
    #[error("invalid sensor replay at line {line}: {message}")]
    Replay {
        /// 1-based line number in the replay file.
        line: usize,
        /// Parser message.
        message: String,
    },

    // Remote
    /// The remote document store rejected or failed a request.
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    // Filesystem and encoding
    /// Reading a file failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The data directory could not be created.
    #[error("cannot create data directory {path}: {source}")]
    DirectoryCreate {
        /// Directory path.
        path: PathBuf,
        /// Filesystem error.
        #[source]
        source: std::io::Error,
    },

    /// A stored or replayed value is not valid JSON.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// A task or invariant failed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

/// `Result` with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Internal error with a message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Permission denied, with instructions for the user.
    #[must_use]
    pub fn permission_missing(
        permission: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self::PermissionMissing {
            permission: permission.into(),
            instructions: instructions.into(),
        }
    }

    /// Queue value under `key` could not be decoded.
    #[must_use]
    pub fn queue_corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueCorrupt {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Replay line `line` could not be parsed.
    #[must_use]
    pub fn replay(line: usize, message: impl Into<String>) -> Self {
        Self::Replay {
            line,
            message: message.into(),
        }
    }

    /// Whether crash detection cannot run at all.
    #[must_use]
    pub fn is_sensor_unavailable(&self) -> bool {
        matches!(self, Self::SensorUnavailable { .. })
    }

    /// Whether a device permission was denied.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::PermissionMissing { .. })
    }
}
