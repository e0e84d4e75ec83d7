use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to resolve query '{query}': {source}")]
    Resolve {
        query: String,
        #[source]
        source: Box<Error>,
    },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

/// Coarse classification callers can branch on without matching every
/// driver-specific variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    StorageUnavailable,
    InvalidQuery,
    NotFound,
    Conflict,
    Cancelled,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_)
            | Error::Redb(_)
            | Error::RedbDatabase(_)
            | Error::RedbStorage(_)
            | Error::RedbTransaction(_)
            | Error::RedbTable(_)
            | Error::RedbCommit(_)
            | Error::Sqlite(_)
            | Error::Json(_) => ErrorKind::StorageUnavailable,
            Error::Config(_) | Error::DataDir(_) => ErrorKind::Config,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::Conflict,
            Error::InvalidQuery(_) => ErrorKind::InvalidQuery,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Resolve { source, .. } => source.kind(),
        }
    }

    pub(crate) fn post_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: "post",
            name: id.to_string(),
        }
    }
}
