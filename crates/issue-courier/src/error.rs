//! Error taxonomy for a courier run.
//!
//! Each pipeline component raises its own kind. The orchestrator never
//! recovers from any of them; it cleans up and hands the error to `main`.

use std::fmt;

/// All errors that can end a courier run.
#[derive(thiserror::Error, Debug)]
pub enum CourierError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Discriminant of [`CourierError`], used for the `Failed` run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Authentication,
    NotFound,
    Download,
    Delivery,
    Storage,
}

impl CourierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CourierError::Configuration(_) => ErrorKind::Configuration,
            CourierError::Authentication(_) => ErrorKind::Authentication,
            CourierError::NotFound(_) => ErrorKind::NotFound,
            CourierError::Download(_) => ErrorKind::Download,
            CourierError::Delivery(_) => ErrorKind::Delivery,
            CourierError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Wrap an `anyhow` chain from the capability layer, keeping every cause.
    pub(crate) fn authentication(err: anyhow::Error) -> Self {
        CourierError::Authentication(format!("{err:#}"))
    }

    pub(crate) fn not_found(err: anyhow::Error) -> Self {
        CourierError::NotFound(format!("{err:#}"))
    }

    pub(crate) fn download(err: anyhow::Error) -> Self {
        CourierError::Download(format!("{err:#}"))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Authentication => "authentication",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Download => "download",
            ErrorKind::Delivery => "delivery",
            ErrorKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// Convenience result type.
pub type CourierResult<T> = Result<T, CourierError>;
