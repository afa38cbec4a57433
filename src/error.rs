//! Public error type of the coordination layer.
//!
//! Every variant carries a stable code (`Error::code`) in the `LEVEL_*`
//! namespace so callers can branch on it without matching display text.
//! Engine internals keep using `anyhow::Result`; those errors surface here
//! as `Error::Engine`.

use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key cannot be null or missing")]
    InvalidKey,

    #[error("value cannot be null or missing")]
    InvalidValue,

    #[error("location must be a non-empty path")]
    InvalidLocation,

    #[error("database is not open")]
    NotOpen,

    #[error("entry not found")]
    NotFound,

    #[error("batch is not open")]
    BatchNotOpen,

    #[error("batch is busy with a pending write")]
    Busy,

    #[error("invalid filter pattern {pattern:?}: {cause}")]
    InvalidFilter { pattern: String, cause: regex::Error },

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("no live cache for token {0}")]
    InvalidCacheToken(u64),

    #[error("{0}")]
    LegacyUsage(String),

    #[error("failed to open database at {}: {cause:#}", location.display())]
    Open { location: PathBuf, cause: anyhow::Error },

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

impl Error {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidKey => "LEVEL_INVALID_KEY",
            Error::InvalidValue => "LEVEL_INVALID_VALUE",
            Error::InvalidLocation => "LEVEL_INVALID_LOCATION",
            Error::NotOpen => "LEVEL_DATABASE_NOT_OPEN",
            Error::NotFound => "LEVEL_NOT_FOUND",
            Error::BatchNotOpen => "LEVEL_BATCH_NOT_OPEN",
            Error::Busy => "LEVEL_BUSY",
            Error::InvalidFilter { .. } => "LEVEL_INVALID_FILTER",
            Error::ColumnNotFound(_) => "LEVEL_COLUMN_NOT_FOUND",
            Error::InvalidCacheToken(_) => "LEVEL_INVALID_CACHE",
            Error::LegacyUsage(_) => "LEVEL_LEGACY",
            Error::Open { .. } => "LEVEL_DATABASE_OPEN_FAILED",
            Error::Engine(_) => "LEVEL_ENGINE",
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    pub(crate) fn join(e: tokio::task::JoinError) -> Self {
        Error::Engine(anyhow::Error::new(e).context("engine task failed"))
    }
}
