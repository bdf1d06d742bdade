//! Task and call-protocol error types.

use serde::{Deserialize, Serialize};
use std::any::Any;
use thiserror::Error;

/// Result type for task operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `RemoteError::kind` used when a worker forwards an interrupt.
pub const FORWARDED_INTERRUPT: &str = "ForwardedInterrupt";

/// `RemoteError::kind` used for protocol violations.
pub const PROTOCOL_VIOLATION: &str = "ProtocolViolation";

/// Transmissible form of a failure raised by a function in another process.
///
/// Only the kind and the rendered message survive the trip: arbitrary Rust
/// error values are flattened on the sending side and cannot be downcast on
/// the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Error class name, e.g. "ValueError" or "UnknownCallable".
    pub kind: String,
    /// Human readable message.
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Flatten an `anyhow::Error`, keeping a wrapped `RemoteError` verbatim.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(remote) = err.downcast_ref::<RemoteError>() {
            return remote.clone();
        }
        if let Some(local) = err.downcast_ref::<Error>() {
            return Self::from(local);
        }
        Self::new("Error", format!("{err:#}"))
    }

    /// Build from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new("Panic", message)
    }

    pub fn is_forwarded_interrupt(&self) -> bool {
        self.kind == FORWARDED_INTERRUPT
    }

    /// Convert back into a local error on the receiving side.
    pub fn into_error(self) -> Error {
        if self.is_forwarded_interrupt() {
            Error::ForwardedInterrupt
        } else {
            Error::Remote(self)
        }
    }
}

impl From<&Error> for RemoteError {
    fn from(err: &Error) -> Self {
        match err {
            Error::Remote(remote) => remote.clone(),
            Error::ForwardedInterrupt => Self::new(FORWARDED_INTERRUPT, err.to_string()),
            Error::ProtocolViolation(_) => Self::new(PROTOCOL_VIOLATION, err.to_string()),
            Error::UnknownCallable(name) => Self::new("UnknownCallable", name.clone()),
            other => Self::new(format!("{:?}", other.kind()), other.to_string()),
        }
    }
}

impl From<Error> for RemoteError {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("SerializationError", err.to_string())
    }
}

/// Errors that can occur while spawning, talking to, or calling into workers.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer closed its end, died, or the pipe broke.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The peer vanished or forwarded an interrupt; treat it as a local interrupt.
    #[error("interrupt forwarded from peer process")]
    ForwardedInterrupt,

    /// The function run in the other process failed.
    #[error("remote call failed: {0}")]
    Remote(RemoteError),

    /// An unexpected message arrived. Indicates a bug, not a runtime condition.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A frame header announced more bytes than the channel accepts.
    #[error("frame of {0} bytes exceeds the channel limit")]
    FrameTooLarge(usize),

    /// A closure was handed to a strategy that needs a registered function.
    #[error("{0} cannot be sent to an exec'd worker; register it by name")]
    NotTransmissible(&'static str),

    /// No function registered under this name.
    #[error("unknown callable: {0}")]
    UnknownCallable(String),

    /// Another call session already serves this process.
    #[error("a call session is already active in this process")]
    SessionActive,

    /// A process handle was waited on from a process that did not create it.
    #[error("process handle used outside the process that created it")]
    NotParent,

    /// Spawning the worker failed.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame (de)serialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rustix::io::Errno> for Error {
    fn from(errno: rustix::io::Errno) -> Self {
        Error::Io(errno.into())
    }
}

/// Coarse classification used by recovery code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectionLost,
    Interrupted,
    Remote,
    Protocol,
    Usage,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Error::ForwardedInterrupt => ErrorKind::Interrupted,
            Error::Remote(_) => ErrorKind::Remote,
            Error::ProtocolViolation(_) | Error::FrameTooLarge(_) => ErrorKind::Protocol,
            Error::NotTransmissible(_)
            | Error::UnknownCallable(_)
            | Error::SessionActive
            | Error::NotParent => ErrorKind::Usage,
            Error::Spawn(_) | Error::Io(_) | Error::Json(_) => ErrorKind::Io,
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        self.kind() == ErrorKind::ConnectionLost
    }

    pub(crate) fn connection_lost(context: impl std::fmt::Display) -> Self {
        Error::ConnectionLost(context.to_string())
    }
}
