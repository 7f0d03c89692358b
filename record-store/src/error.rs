//! Engine-facing error type.
//!
//! Every failure carries an HTTP-style status code plus a stable
//! `reason` / `message` pair. Callers match on the strings in tests, so
//! they change only deliberately.

use record_common::StorageError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} {reason}: {message}")]
pub struct Error {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(400, reason, message)
    }

    pub fn forbidden(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(403, reason, message)
    }

    pub fn not_found(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(404, reason, message)
    }

    pub fn conflict(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(409, reason, message)
    }

    pub fn locked(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(423, reason, message)
    }

    pub fn internal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(500, reason, message)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(path) => Self::not_found(
                "Record not found",
                format!("Record version '{path}' does not exist"),
            ),
            StorageError::Backend(msg) => Self::internal("Internal server error", msg),
        }
    }
}
