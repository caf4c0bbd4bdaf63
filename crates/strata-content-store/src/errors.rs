use std::sync::Arc;

use thiserror::Error;

/// An error type for the content-store crate.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("content `{0}` was not found")]
    NotFound(String),
    #[error("invalid content hash: {0}")]
    InvalidHash(#[from] hex::FromHexError),
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// A result type that can be used to indicate errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;
