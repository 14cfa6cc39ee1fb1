//! What to run, as whom, and with which settings

use crate::config::AppSettings;
use crate::error::WorkerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// The identity a worker runs as.
///
/// A list of candidates is squashed to a single user by the routing layer
/// before an `AppSpec` reaches the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunAs {
    User(String),
    Candidates(Vec<String>),
}

impl fmt::Display for RunAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunAs::User(user) => f.write_str(user),
            RunAs::Candidates(users) => f.write_str(&users.join(",")),
        }
    }
}

/// Immutable description of an application worker.
///
/// Two specs with the same [`key`](AppSpec::key) share scheduling state.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSpec {
    app_dir: PathBuf,
    run_as: Option<RunAs>,
    prefix: String,
    log_dir: Option<PathBuf>,
    settings: AppSettings,
}

impl AppSpec {
    pub fn new(
        app_dir: impl Into<PathBuf>,
        run_as: Option<RunAs>,
        prefix: impl Into<String>,
        log_dir: Option<PathBuf>,
        settings: AppSettings,
    ) -> Self {
        Self {
            app_dir: app_dir.into(),
            run_as,
            prefix: prefix.into(),
            log_dir,
            settings,
        }
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn run_as(&self) -> Option<&RunAs> {
        self.run_as.as_ref()
    }

    /// The single user this spec runs as
    pub fn run_as_user(&self) -> Result<&str, WorkerError> {
        match &self.run_as {
            None => Err(WorkerError::NoRunAs),
            Some(RunAs::User(user)) if user.is_empty() => Err(WorkerError::NoRunAs),
            Some(RunAs::User(user)) => Ok(user),
            Some(RunAs::Candidates(users)) => Err(WorkerError::UnresolvedRunAs(users.clone())),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    /// Stable key derived from every field
    pub fn key(&self) -> String {
        let settings = serde_json::to_string(&self.settings).unwrap_or_default();
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.app_dir.display(),
            self.run_as.as_ref().map(ToString::to_string).unwrap_or_default(),
            self.prefix,
            self.log_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
            settings
        )
    }

    /// Path of the log file for a new worker, or `None` when logs are
    /// discarded.
    ///
    /// `<appdir-basename>-<runAs>-<YYYYMMDD-HHMMSS>-<suffix>.log`
    pub fn log_file_path(&self, suffix: &str) -> Option<PathBuf> {
        let log_dir = self.log_dir.as_ref()?;
        let base = self
            .app_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let run_as = self.run_as.as_ref().map(ToString::to_string).unwrap_or_default();
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        Some(log_dir.join(format!("{}-{}-{}-{}.log", base, run_as, timestamp, suffix)))
    }
}
