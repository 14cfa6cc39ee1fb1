//! Error taxonomy for worker scheduling and launching
//!
//! Every failure is classified with an [`ErrorCode`] so the consuming proxy
//! layer can pick a client-facing status (404 for missing apps, 503 for
//! capacity and startup problems) without matching on individual variants.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Coarse classification of a [`WorkerError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The application, its directory or its run-as account does not exist
    NotFound,
    /// No free resources (ports) or the application is at its connection limit
    OutOfCapacity,
    /// The worker process exited or timed out before accepting connections
    StartupFailed,
    /// The application configuration cannot be launched as given
    ConfigError,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Get the HTTP status code the proxy layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::OutOfCapacity => 503,
            ErrorCode::StartupFailed => 503,
            ErrorCode::ConfigError => 500,
            ErrorCode::Internal => 500,
        }
    }

    /// Get the error code as a string for response headers and logs
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::OutOfCapacity => "OUT_OF_CAPACITY",
            ErrorCode::StartupFailed => "STARTUP_FAILED",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Errors produced while acquiring, spawning or launching a worker.
///
/// `Clone` because one spawn result is handed to every caller waiting on the
/// same worker entry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("No user specified")]
    NoRunAs,

    #[error("run_as must be resolved to a single user before launch, got {0:?}")]
    UnresolvedRunAs(Vec<String>),

    #[error("User {0} does not exist")]
    UserNotFound(String),

    #[error("User {0} does not have a home directory")]
    NoHomeDirectory(String),

    #[error("No app directory specified")]
    NoAppDir,

    #[error("App dir {} does not exist", .0.display())]
    AppDirNotFound(PathBuf),

    #[error("Trying to launch an application that is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Aborting attempt to launch worker process as root")]
    SuperuserLaunch,

    #[error("Couldn't find a free port")]
    NoFreePort,

    #[error("{0}")]
    OutOfCapacity(String),

    #[error("No transport has been configured")]
    NoTransport,

    /// The policy was dropped from its registry; ask the registry again
    #[error("Scheduling policy has been retired")]
    Retired,

    #[error("The application exited during initialization.")]
    ExitedDuringInit { console_log: Option<PathBuf> },

    #[error("The application took too long to respond.")]
    StartupTimeout { console_log: Option<PathBuf> },

    #[error("Failed to create bookmark state directory {}: {message}", .path.display())]
    Bookmark { path: PathBuf, message: String },

    #[error("Failed to create log file {}: {message}", .path.display())]
    LogFile { path: PathBuf, message: String },

    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        WorkerError::Io(Arc::new(err))
    }
}

impl WorkerError {
    /// Classify this error
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkerError::UserNotFound(_)
            | WorkerError::NoHomeDirectory(_)
            | WorkerError::AppDirNotFound(_) => ErrorCode::NotFound,
            WorkerError::NoFreePort | WorkerError::OutOfCapacity(_) => ErrorCode::OutOfCapacity,
            WorkerError::ExitedDuringInit { .. } | WorkerError::StartupTimeout { .. } => {
                ErrorCode::StartupFailed
            }
            WorkerError::NoRunAs
            | WorkerError::UnresolvedRunAs(_)
            | WorkerError::NoAppDir
            | WorkerError::NotADirectory(_)
            | WorkerError::SuperuserLaunch
            | WorkerError::NoTransport => ErrorCode::ConfigError,
            WorkerError::Bookmark { .. }
            | WorkerError::LogFile { .. }
            | WorkerError::Spawn(_)
            | WorkerError::Retired
            | WorkerError::Io(_) => ErrorCode::Internal,
        }
    }

    /// True for configuration errors the proxy should answer with "not found"
    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }

    /// True for errors caused by a resource or connection limit
    pub fn is_out_of_capacity(&self) -> bool {
        self.code() == ErrorCode::OutOfCapacity
    }

    /// Path of the captured worker console log, for startup failures
    pub fn console_log(&self) -> Option<&Path> {
        match self {
            WorkerError::ExitedDuringInit { console_log }
            | WorkerError::StartupTimeout { console_log } => console_log.as_deref(),
            _ => None,
        }
    }
}
