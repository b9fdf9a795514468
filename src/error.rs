//! Error types for the varstore engine.

use std::fmt;
use std::io;

/// The result type used throughout varstore.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for varstore operations.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(io::Error),

    /// A storage backend was misconfigured (missing or invalid connection
    /// parameters). Raised during backend initialization; the storage is
    /// not registered.
    Config(String),

    /// The underlying database reported a failure.
    Database(String),

    /// A value could not be serialized or deserialized.
    Serialization(String),

    /// A persisted record references a serializer that is not registered.
    UnknownType(String),

    /// A variable path is malformed, or a dynamic segment failed to
    /// resolve to a usable name or index.
    InvalidPath(String),

    /// A non-list value was encountered where a list was expected
    /// mid-walk. Surfaced as an error rather than a silent no-op since
    /// silently returning "absent" would mask data corruption.
    NotAList(String),

    /// The engine is in an invalid state for the requested operation.
    InvalidState(String),
}

impl Error {
    /// Creates a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Error::Database(msg.into())
    }

    /// Creates a new serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Error::Serialization(msg.into())
    }

    /// Creates a new unknown-type error.
    pub fn unknown_type(msg: impl Into<String>) -> Self {
        Error::UnknownType(msg.into())
    }

    /// Creates a new invalid-path error.
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Error::InvalidPath(msg.into())
    }

    /// Creates a new not-a-list error.
    pub fn not_a_list(msg: impl Into<String>) -> Self {
        Error::NotAList(msg.into())
    }

    /// Creates a new invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Database(msg) => write!(f, "Database error: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::UnknownType(msg) => write!(f, "Unknown type: {}", msg),
            Error::InvalidPath(msg) => write!(f, "Invalid path: {}", msg),
            Error::NotAList(msg) => write!(f, "Not a list: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

#[cfg(feature = "mysql-backend")]
impl From<mysql::Error> for Error {
    fn from(err: mysql::Error) -> Self {
        Error::Database(err.to_string())
    }
}
