//! Error definitions for LinkSvc

use std::io;
use thiserror::Error;

/// Engine-level error types
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid microservice name: {0}")]
    Identity(String),

    #[error("Message bus error: {0}")]
    Bus(String),

    #[error("Status store error: {0}")]
    Store(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Timeout")]
    Timeout,
}

impl RelayError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Result type alias for LinkSvc engine operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors returned by an endpoint's connect, read, write and read_allowed
/// calls.
///
/// Everything except `Fatal` is recoverable: the connection loop disconnects
/// and, if allowed, tries again after the reconnect delay. `Fatal` ends the
/// connection loop.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Runtime(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    NotConnected(String),

    #[error("{0}")]
    Fatal(String),
}

impl LinkError {
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Label used in log lines, e.g. `Connection Failed: <kind> : <message>`
    pub fn kind(&self) -> String {
        match self {
            LinkError::Io(e) => format!("{:?}", e.kind()),
            LinkError::Runtime(_) => "RuntimeError".to_string(),
            LinkError::Timeout(_) => "Timeout".to_string(),
            LinkError::NotConnected(_) => "NotConnected".to_string(),
            LinkError::Fatal(_) => "FatalError".to_string(),
        }
    }

    /// `<kind> : <message>`
    pub fn formatted(&self) -> String {
        format!("{} : {}", self.kind(), self)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Fatal(_))
    }

    /// Expected failures of a network link. These are not reported in detail.
    pub fn is_common(&self) -> bool {
        match self {
            LinkError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
            ),
            LinkError::Runtime(msg) => msg.contains("canceled") || msg.contains("timeout"),
            LinkError::Timeout(_) | LinkError::NotConnected(_) => true,
            LinkError::Fatal(_) => false,
        }
    }
}

/// Result type alias for endpoint calls
pub type LinkResult<T> = Result<T, LinkError>;
