//! Error types for the server engine.
//!
//! Session I/O failures never surface here; they are captured on the session
//! and handed to `ServerHandler::on_session_disconnected` instead.

use crate::endpoint::EndPoint;
use crate::server::SessionId;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned synchronously by the context and server APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// An endpoint could not be bound or put into listening state.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: EndPoint,
        #[source]
        source: io::Error,
    },

    /// Runtime or thread construction failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// `start`/`run` called while already running.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Operation requires a running context or server.
    #[error("{0} is not running")]
    NotRunning(&'static str),

    /// `reset_guard` called on a context started without a guard.
    #[error("io context was started without a guard")]
    NoGuard,

    /// No live session has this id.
    #[error("unknown session id {0}")]
    UnknownSession(SessionId),

    /// The session already requested a local stop.
    #[error("session {0} is stopping, write rejected")]
    SessionStopping(SessionId),

    /// A blocking wait was attempted from a thread it would have to wait on.
    #[error("{0} would deadlock when called from this thread")]
    WouldDeadlock(&'static str),

    /// One or more reactor workers terminated abnormally.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl Error {
    /// Whether this error reports API misuse rather than an environment failure.
    pub fn is_logic(&self) -> bool {
        matches!(
            self,
            Error::AlreadyRunning(_)
                | Error::NotRunning(_)
                | Error::NoGuard
                | Error::UnknownSession(_)
                | Error::SessionStopping(_)
                | Error::WouldDeadlock(_)
        )
    }
}

/// Terminal failure of a single reactor worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub worker: usize,
    pub message: String,
}

/// Every worker failure collected by `IoContext::future_get_once`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateError {
    failures: Vec<WorkerFailure>,
}

impl AggregateError {
    /// Returns `None` when there is nothing to report.
    pub fn from_failures(failures: Vec<WorkerFailure>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self { failures })
        }
    }

    pub fn failures(&self) -> &[WorkerFailure] {
        &self.failures
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} io worker(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}worker {}: {}", failure.worker, failure.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
