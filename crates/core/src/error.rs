use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid name: {name}")]
    InvalidName { name: String },

    #[error("already exists: {name} in folder {folder_id}")]
    AlreadyExists { folder_id: i64, name: String },

    #[error("path not found: {message}")]
    PathNotFound { message: String },

    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("transient error: {message}")]
    Transient { message: String },

    #[error("integrity check failed: {message}")]
    Integrity { message: String },

    #[error("decryption authentication failure")]
    Crypto,

    #[error("catalogue backup corrupt: {message}")]
    CatalogueCorrupt { message: String },

    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("cancelled")]
    Cancelled,

    #[error("remote channel error: {message}")]
    Remote { message: String },

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },

    #[error("internal error: {message}")]
    Other { message: String },
}

impl Error {
    /// Errors the transfer engine recovers from locally via retry-with-backoff.
    /// Everything else marks the task failed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited(_) | Error::Transient { .. } | Error::Integrity { .. }
        )
    }
}
