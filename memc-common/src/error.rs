//! # Error Types
//!
//! Purpose: One structured error shape for every non-success outcome a
//! request can complete with, whether it came from the wire or the client.
//!
//! ## Notes
//! - `NOT_FOUND`, `NOT_STORED` and `EXISTS` are ordinary server answers, but
//!   they travel through the same error channel as faults so every command
//!   reports misses the same way.
//! - `ErrorKind::as_str()` returns the wire token, which is also what
//!   `Display` prints.

use std::fmt;

/// Result alias used across the memcache client crates.
pub type McResult<T> = Result<T, McError>;

/// Category of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No live socket, the write failed, or the connection dropped while the
    /// request was outstanding.
    ConnectionError,
    /// Generic `ERROR` line: the server did not understand the command.
    Error,
    /// `CLIENT_ERROR`: rejected parameters, or client-side validation.
    ClientError,
    /// `SERVER_ERROR`: the server failed while handling the command.
    ServerError,
    /// `NOT_FOUND`: key missing (or no hits for a retrieval).
    NotFound,
    /// `NOT_STORED`: add/replace/append/prepend precondition failed.
    NotStored,
    /// `EXISTS`: CAS token mismatch.
    Exists,
}

impl ErrorKind {
    /// Returns the protocol token for this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::Error => "ERROR",
            ErrorKind::ClientError => "CLIENT_ERROR",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::NotStored => "NOT_STORED",
            ErrorKind::Exists => "EXISTS",
        }
    }

    /// Maps a status line token to its kind, if it is one of the
    /// miss/conflict answers of the storage commands.
    pub fn from_status(token: &str) -> Option<ErrorKind> {
        match token {
            "NOT_FOUND" => Some(ErrorKind::NotFound),
            "NOT_STORED" => Some(ErrorKind::NotStored),
            "EXISTS" => Some(ErrorKind::Exists),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured request error: a kind plus a free-form description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McError {
    pub kind: ErrorKind,
    pub description: String,
}

impl McError {
    /// Builds an error with an explicit description.
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        McError {
            kind,
            description: description.into(),
        }
    }

    /// Builds an error that carries only its kind.
    pub fn bare(kind: ErrorKind) -> Self {
        McError::new(kind, String::new())
    }

    pub fn connection(description: impl Into<String>) -> Self {
        McError::new(ErrorKind::ConnectionError, description)
    }

    pub fn client(description: impl Into<String>) -> Self {
        McError::new(ErrorKind::ClientError, description)
    }

    pub fn not_found() -> Self {
        McError::bare(ErrorKind::NotFound)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl fmt::Display for McError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.description)
        }
    }
}

impl std::error::Error for McError {}
