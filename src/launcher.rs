//! Launching worker processes
//!
//! The launcher checks that the app can be run at all (account, home
//! directory, app directory), prepares the log file and bookmark state
//! directories, then spawns the adapter under the run-as account. Sensitive
//! settings travel over the child's stdin, never through argv or the
//! environment, which other users can read from the process table.

use crate::accounts::{self, Account};
use crate::app_spec::AppSpec;
use crate::config::{LauncherConfig, WorkerMode};
use crate::error::WorkerError;
use crate::process::{AppWorker, WorkerProcess};
use crate::transport::Endpoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::{debug, error, info, trace, warn};

/// Prefix of the stdout line carrying the worker's pid and versions
pub const LAUNCH_INFO_TAG: &str = "worker_launch_info: ";

/// After this stdout line nothing more is parsed
pub const END_MARKER: &str = "==END==";

/// Set to a non-empty value to copy worker stderr into our own log
pub const STDERR_PASSTHROUGH_ENV: &str = "WORKERGATE_LOG_STDERR";

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const LOG_DIR_MODE: u32 = 0o755;
const BOOKMARK_ROOT_MODE: u32 = 0o711;
const BOOKMARK_USER_MODE: u32 = 0o700;

/// Starts worker processes
#[async_trait]
pub trait Launcher: Send + Sync + fmt::Debug {
    /// Start a worker for `app` listening on `endpoint`.
    ///
    /// `log_file` is where the worker's stderr goes; `None` discards it.
    async fn launch(
        &self,
        app: &AppSpec,
        endpoint: &Endpoint,
        log_file: Option<&Path>,
        worker_id: &str,
    ) -> Result<Arc<dyn WorkerProcess>, WorkerError>;

    /// Delete a worker log after an expected exit. Failures are logged only.
    async fn remove_log_file(&self, _app: &AppSpec, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove log file");
        }
    }
}

/// Settings handed to the worker over stdin, as one JSON line
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerInput<'a> {
    app_dir: &'a Path,
    port: String,
    ga_tracking_id: &'a str,
    shared_secret: &'a str,
    server_version: &'static str,
    worker_id: &'a str,
    mode: WorkerMode,
    log_file_path: String,
    disable_protocols: String,
    reconnect: bool,
    sanitize_errors: bool,
    bookmark_state_dir: Option<&'a Path>,
}

impl<'a> WorkerInput<'a> {
    fn new(app: &'a AppSpec, endpoint: &'a Endpoint, worker_id: &'a str, log_file_path: String) -> Self {
        let settings = app.settings();
        let defaults = &settings.app_defaults;
        Self {
            app_dir: app.app_dir(),
            port: endpoint.worker_address(),
            ga_tracking_id: settings.ga_tracking_id.as_deref().unwrap_or(""),
            shared_secret: endpoint.shared_secret(),
            server_version: SERVER_VERSION,
            worker_id,
            mode: settings.mode,
            log_file_path,
            disable_protocols: defaults.disable_protocols.join(","),
            reconnect: defaults.reconnect,
            sanitize_errors: defaults.sanitize_errors,
            bookmark_state_dir: defaults.bookmark_state_dir.as_deref(),
        }
    }
}

/// Payload of the [`LAUNCH_INFO_TAG`] line
#[derive(Debug, Deserialize)]
struct LaunchInfo {
    pid: u32,
    #[serde(default)]
    versions: serde_json::Map<String, serde_json::Value>,
}

/// Where worker stderr ends up
enum LogSink {
    Discard,
    /// The worker writes the file itself
    Worker(PathBuf),
    File(PathBuf, tokio::fs::File),
}

/// Program, arguments and extra environment for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Launches adapters as local OS processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: LauncherConfig,
    stderr_passthrough: bool,
}

impl ProcessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        let from_env = std::env::var(STDERR_PASSTHROUGH_ENV)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        Self {
            stderr_passthrough: config.stderr_passthrough || from_env,
            config,
        }
    }

    /// The command that hosts the app, wrapped in `su` when switching users
    pub fn spawn_spec(&self, app: &AppSpec, user: &str, switch_user: bool) -> SpawnSpec {
        let (program, args, env) = match app.settings().mode {
            WorkerMode::Shiny | WorkerMode::Rmd => (
                self.config.r_program.clone(),
                vec![
                    "--no-save".to_string(),
                    "--slave".to_string(),
                    "-f".to_string(),
                    self.config.r_adapter_script.clone(),
                ],
                Vec::new(),
            ),
            WorkerMode::ShinyPython => (
                app.settings()
                    .app_defaults
                    .python
                    .clone()
                    .unwrap_or_else(|| self.config.python_program.clone()),
                vec![self.config.python_adapter_script.clone()],
                vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            ),
        };

        if !switch_user {
            return SpawnSpec { program, args, env };
        }

        let mut command = vec![program];
        command.extend(args);
        let script = format!(
            "cd {} && {}",
            shell_words::quote(&app.app_dir().to_string_lossy()),
            shell_words::join(&command)
        );

        // -s is Linux only; elsewhere su keeps the caller's environment, so
        // ask for a login environment instead
        let mut su_args: Vec<String> = if cfg!(target_os = "linux") {
            vec!["-s".into(), "/bin/bash".into(), "--login".into()]
        } else {
            vec!["-".into()]
        };
        su_args.extend(["-p".into(), "--".into(), user.to_string(), "-c".into(), script]);

        SpawnSpec {
            program: "su".to_string(),
            args: su_args,
            env,
        }
    }

    async fn prepare_log(
        &self,
        app: &AppSpec,
        account: &Account,
        log_file: Option<&Path>,
    ) -> Result<LogSink, WorkerError> {
        let Some(path) = log_file else {
            return Ok(LogSink::Discard);
        };
        let mode = app.settings().app_defaults.log_file_mode;
        if app.settings().log_as_user {
            create_log_as_user(path, account, mode).await?;
            return Ok(LogSink::Worker(path.to_path_buf()));
        }
        let file = open_log_file(path, account, mode)?;
        Ok(LogSink::File(path.to_path_buf(), tokio::fs::File::from_std(file)))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        app: &AppSpec,
        endpoint: &Endpoint,
        log_file: Option<&Path>,
        worker_id: &str,
    ) -> Result<Arc<dyn WorkerProcess>, WorkerError> {
        let user = app.run_as_user()?;
        let account =
            accounts::lookup(user)?.ok_or_else(|| WorkerError::UserNotFound(user.to_string()))?;
        if !account.has_home() {
            return Err(WorkerError::NoHomeDirectory(user.to_string()));
        }
        if app.app_dir().as_os_str().is_empty() {
            return Err(WorkerError::NoAppDir);
        }
        if tokio::fs::metadata(app.app_dir()).await.is_err() {
            return Err(WorkerError::AppDirNotFound(app.app_dir().to_path_buf()));
        }

        let switch_user = accounts::process_user().as_deref() != Some(user);
        if !switch_user && accounts::is_superuser() {
            return Err(WorkerError::SuperuserLaunch);
        }

        let sink = self.prepare_log(app, &account, log_file).await?;

        if !tokio::fs::metadata(app.app_dir()).await?.is_dir() {
            return Err(WorkerError::NotADirectory(app.app_dir().to_path_buf()));
        }
        if let Some(root) = app.settings().app_defaults.bookmark_state_dir.as_deref() {
            if !root.as_os_str().is_empty() {
                create_bookmark_dirs(root, &account)?;
            }
        }

        let log_file_path = match &sink {
            LogSink::Worker(path) => path.display().to_string(),
            _ => String::new(),
        };
        let input = serde_json::to_string(&WorkerInput::new(app, endpoint, worker_id, log_file_path))
            .map_err(|e| WorkerError::Spawn(e.to_string()))?
            + "\n";

        let spec = self.spawn_spec(app, user, switch_user);
        let capture_stderr = matches!(sink, LogSink::File(..)) || self.stderr_passthrough;
        let capture_stderr = capture_stderr && !matches!(sink, LogSink::Worker(_));

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(app.app_dir())
            .env_clear()
            .env("HOME", &account.home)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if capture_stderr { Stdio::piped() } else { Stdio::null() })
            // Own process group so signals reach the whole worker tree
            .process_group(0);
        for key in ["LANG", "PATH"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        trace!(program = %spec.program, worker_id, "Starting worker process");
        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Spawn(format!("{}: {}", spec.program, e)))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let worker = AppWorker::watch(child, self.config.kill_grace_period());
        info!(
            worker_id,
            pid = ?worker.child_pid(),
            app_dir = %app.app_dir().display(),
            endpoint = %endpoint,
            "Worker process spawned"
        );

        if let Some(stdout) = stdout {
            tokio::spawn(read_launch_info(stdout, Arc::clone(&worker)));
        }
        if let Some(stderr) = stderr {
            let file = match sink {
                LogSink::File(path, file) => Some((path, file)),
                _ => None,
            };
            tokio::spawn(pump_stderr(
                stderr,
                file,
                self.stderr_passthrough,
                app.app_dir().to_path_buf(),
                Arc::clone(&worker),
            ));
        }

        if let Some(mut stdin) = stdin {
            let written = async {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await
            }
            .await;
            if let Err(e) = written {
                warn!(worker_id, error = %e, "Unable to write to worker process. Attempting to kill it.");
                worker.kill(false);
            }
        }

        Ok(worker)
    }

    async fn remove_log_file(&self, app: &AppSpec, path: &Path) {
        if path == Path::new("/dev/null") {
            return;
        }
        if !app.settings().log_as_user {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove log file");
            }
            return;
        }

        // The file belongs to the run-as user, so delete it as that user
        let account = match app.run_as_user().and_then(|user| {
            accounts::lookup(user)?.ok_or_else(|| WorkerError::UserNotFound(user.to_string()))
        }) {
            Ok(account) => account,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove log file");
                return;
            }
        };
        let status = Command::new("rm")
            .arg("-f")
            .arg(path)
            .uid(account.uid)
            .gid(account.gid)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => debug!(path = %path.display(), "Removed log file"),
            Ok(status) => warn!(path = %path.display(), %status, "Failed to remove log file"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove log file"),
        }
    }
}

/// Scan stdout for the launch info line until the end marker, then drain it
async fn read_launch_info(stdout: ChildStdout, worker: Arc<AppWorker>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut scanning = true;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if scanning => {
                if let Some(json) = line.strip_prefix(LAUNCH_INFO_TAG) {
                    match serde_json::from_str::<LaunchInfo>(json) {
                        Ok(info) => {
                            worker.set_worker_pid(info.pid);
                            debug!(pid = info.pid, versions = ?info.versions, "Worker reported launch info");
                        }
                        Err(e) => warn!(error = %e, "Malformed launch info from worker"),
                    }
                } else if line == END_MARKER {
                    trace!(pid = ?worker.pid(), "Closing backchannel");
                    scanning = false;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Error reading worker stdout");
                break;
            }
        }
    }
}

async fn pump_stderr(
    stderr: ChildStderr,
    mut file: Option<(PathBuf, tokio::fs::File)>,
    passthrough: bool,
    app_dir: PathBuf,
    worker: Arc<AppWorker>,
) {
    let mut lines = BufReader::new(stderr).lines();
    let mut warned = false;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Error on worker stderr");
                break;
            }
        };
        if passthrough {
            info!(app_dir = %app_dir.display(), pid = ?worker.pid(), "{}", line);
        }
        if let Some((path, f)) = file.as_mut() {
            let written = async {
                f.write_all(line.as_bytes()).await?;
                f.write_all(b"\n").await
            }
            .await;
            if let Err(e) = written {
                // Report at most once per worker
                if !warned {
                    warned = true;
                    warn!(path = %path.display(), error = %e, "Error writing to log file");
                }
            }
        }
    }
    if let Some((_, mut f)) = file {
        let _ = f.flush().await;
    }
}

/// Open the log file for appending, owned by `account` with `mode`.
///
/// The log directory is created (0755, owned by `account`) if missing.
pub fn open_log_file(path: &Path, account: &Account, mode: u32) -> Result<std::fs::File, WorkerError> {
    if let Some(dir) = path.parent() {
        ensure_log_dir(dir, account);
    }

    let file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .mode(mode)
        .open(path)
        .map_err(|e| WorkerError::LogFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if let Err(e) = std::os::unix::fs::fchown(&file, Some(account.uid), Some(account.gid)) {
        error!(path = %path.display(), error = %e, "Error attempting to change ownership of log file");
    }
    if let Err(e) = file.set_permissions(std::fs::Permissions::from_mode(mode)) {
        error!(path = %path.display(), error = %e, "Error attempting to change permissions on log file");
    }
    Ok(file)
}

fn ensure_log_dir(dir: &Path, account: &Account) {
    match std::fs::DirBuilder::new().mode(LOG_DIR_MODE).create(dir) {
        Ok(()) => {
            if let Err(e) = std::os::unix::fs::chown(dir, Some(account.uid), Some(account.gid)) {
                warn!(dir = %dir.display(), error = %e, "Failed to change ownership of log directory");
            }
        }
        Err(e) => match std::fs::metadata(dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => error!(dir = %dir.display(), "Log directory existed, was a file"),
            Err(_) => error!(dir = %dir.display(), error = %e, "Log directory creation failed"),
        },
    }
}

/// Create the log file as the run-as user, for workers that write it
/// themselves
async fn create_log_as_user(path: &Path, account: &Account, mode: u32) -> Result<(), WorkerError> {
    const SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && touch "$1" && chmod "$2" "$1""#;
    let status = Command::new("sh")
        .arg("-c")
        .arg(SCRIPT)
        .arg("sh")
        .arg(path)
        .arg(format!("{:o}", mode))
        .uid(account.uid)
        .gid(account.gid)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        let err = WorkerError::LogFile {
            path: path.to_path_buf(),
            message: format!("helper exited with {}", status),
        };
        error!(error = %err, "Failed to create log file");
        return Err(err);
    }
    Ok(())
}

/// Create `<root>` (0711) and `<root>/<user>` (0700, owned by the user).
///
/// Existing directories are fine; any other failure aborts the launch.
pub fn create_bookmark_dirs(root: &Path, account: &Account) -> Result<(), WorkerError> {
    create_bookmark_dir(root, BOOKMARK_ROOT_MODE, None)?;
    create_bookmark_dir(&root.join(&account.name), BOOKMARK_USER_MODE, Some(account))
}

fn create_bookmark_dir(dir: &Path, mode: u32, owner: Option<&Account>) -> Result<(), WorkerError> {
    let label = if owner.is_some() { "User bookmark" } else { "Bookmark" };
    match std::fs::DirBuilder::new().mode(mode).create(dir) {
        Ok(()) => {
            info!(dir = %dir.display(), "{} state directory created", label);
            // mkdir is subject to the umask
            if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode)) {
                warn!(dir = %dir.display(), error = %e, "Failed to set bookmark directory permissions");
            }
            if let Some(account) = owner {
                if let Err(e) = std::os::unix::fs::chown(dir, Some(account.uid), Some(account.gid)) {
                    warn!(dir = %dir.display(), error = %e, "Failed to change bookmark directory owner");
                }
            }
            Ok(())
        }
        Err(e) => match std::fs::metadata(dir) {
            Ok(meta) => {
                if !meta.is_dir() {
                    error!(dir = %dir.display(), "{} state directory existed, was a file", label);
                }
                Ok(())
            }
            Err(_) => {
                error!(dir = %dir.display(), error = %e, "{} state directory creation failed", label);
                Err(WorkerError::Bookmark {
                    path: dir.to_path_buf(),
                    message: e.to_string(),
                })
            }
        },
    }
}
