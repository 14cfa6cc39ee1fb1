use crate::app_spec::{AppSpec, RunAs};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Largest idle timeout the scheduler will arm, in milliseconds
const MAX_IDLE_TIMEOUT_MS: u64 = i32::MAX as u64;

/// Global configuration for the worker gate
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How worker processes are launched and stopped
    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Application configurations keyed by name
    #[serde(default)]
    pub apps: HashMap<String, AppConfig>,
}

/// How endpoints are allocated for worker processes
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A loopback TCP port chosen by the OS (default)
    #[default]
    Tcp,
    /// A randomly named unix domain socket under `socket_dir`
    Unix,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for forwarder listeners (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Endpoint allocation strategy
    #[serde(default)]
    pub transport: TransportKind,

    /// Directory for worker sockets (unix transport only)
    pub socket_dir: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            transport: TransportKind::default(),
            socket_dir: None,
            pid_file: None,
        }
    }
}

/// Settings for the process launcher
#[derive(Debug, Deserialize, Clone)]
pub struct LauncherConfig {
    /// R interpreter used for `shiny` and `rmd` apps
    #[serde(default = "default_r_program")]
    pub r_program: String,

    /// Adapter script R runs to host the app
    #[serde(default = "default_r_adapter_script")]
    pub r_adapter_script: String,

    /// Python interpreter used for `shiny-python` apps when the app does not
    /// name its own
    #[serde(default = "default_python_program")]
    pub python_program: String,

    /// Adapter script python runs to host the app
    #[serde(default = "default_python_adapter_script")]
    pub python_adapter_script: String,

    /// Seconds between SIGINT and the automatic SIGTERM
    #[serde(default = "default_kill_grace_period")]
    pub kill_grace_period_secs: u64,

    /// Copy worker stderr lines into our own log
    #[serde(default)]
    pub stderr_passthrough: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            r_program: default_r_program(),
            r_adapter_script: default_r_adapter_script(),
            python_program: default_python_program(),
            python_adapter_script: default_python_adapter_script(),
            kill_grace_period_secs: default_kill_grace_period(),
            stderr_passthrough: false,
        }
    }
}

impl LauncherConfig {
    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period_secs)
    }
}

/// Which adapter hosts the application
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerMode {
    #[default]
    Shiny,
    Rmd,
    ShinyPython,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMode::Shiny => "shiny",
            WorkerMode::Rmd => "rmd",
            WorkerMode::ShinyPython => "shiny-python",
        }
    }
}

/// Admission control settings
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct SchedulerSettings {
    /// Maximum concurrent connections per worker (0 = unlimited)
    #[serde(default)]
    pub max_requests: u32,
}

/// Per-application tunables
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AppDefaults {
    /// Seconds a new worker has to start accepting connections
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,

    /// Seconds without connections before a worker is reaped (<= 0 disables)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: i64,

    /// Upper bound between health-check connect attempts, in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Delay between the idle timeout firing and the kill, in milliseconds
    #[serde(default = "default_idle_linger")]
    pub idle_linger_ms: u64,

    /// Keep worker logs after an expected exit
    #[serde(default)]
    pub preserve_logs: bool,

    #[serde(default = "default_true")]
    pub reconnect: bool,

    #[serde(default = "default_true")]
    pub sanitize_errors: bool,

    /// Protocols the worker should refuse to offer
    #[serde(default)]
    pub disable_protocols: Vec<String>,

    /// Root of per-user bookmark state directories
    pub bookmark_state_dir: Option<PathBuf>,

    /// Permission bits for worker log files
    #[serde(default = "default_log_file_mode")]
    pub log_file_mode: u32,

    /// Python interpreter for `shiny-python` apps
    pub python: Option<String>,
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            init_timeout_secs: default_init_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            health_check_interval_ms: default_health_interval(),
            idle_linger_ms: default_idle_linger(),
            preserve_logs: false,
            reconnect: true,
            sanitize_errors: true,
            disable_protocols: Vec::new(),
            bookmark_state_dir: None,
            log_file_mode: default_log_file_mode(),
            python: None,
        }
    }
}

impl AppDefaults {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    /// Idle timeout, or `None` if idle workers are never reaped
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs <= 0 {
            return None;
        }
        let ms = (self.idle_timeout_secs as u64).saturating_mul(1000);
        if ms > MAX_IDLE_TIMEOUT_MS {
            warn!(
                idle_timeout_secs = self.idle_timeout_secs,
                max_secs = MAX_IDLE_TIMEOUT_MS / 1000,
                "Idle timeout too high, using the maximum instead. Use a negative value to disable the timeout altogether"
            );
            return Some(Duration::from_millis(MAX_IDLE_TIMEOUT_MS));
        }
        Some(Duration::from_millis(ms))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn idle_linger(&self) -> Duration {
        Duration::from_millis(self.idle_linger_ms)
    }
}

/// Settings bundle carried by an [`AppSpec`]
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct AppSettings {
    #[serde(default)]
    pub mode: WorkerMode,

    /// Let the worker write its own log file, as the run-as user
    #[serde(default)]
    pub log_as_user: bool,

    pub ga_tracking_id: Option<String>,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub app_defaults: AppDefaults,
}

/// Configuration for a single application
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Port the forwarder listens on for this app (optional)
    pub listen_port: Option<u16>,

    /// Directory containing the application
    pub app_dir: String,

    /// Account the worker runs as
    pub run_as: Option<RunAs>,

    /// URL prefix the app is mounted under
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Directory for worker logs (no logs if unset)
    pub log_dir: Option<String>,

    #[serde(default)]
    pub settings: AppSettings,
}

impl AppConfig {
    /// Build the immutable spec handed to the scheduler
    pub fn to_spec(&self) -> AppSpec {
        AppSpec::new(
            &self.app_dir,
            self.run_as.clone(),
            &self.prefix,
            self.log_dir.as_deref().map(PathBuf::from),
            self.settings.clone(),
        )
    }

    /// Validate the app configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.app_dir.is_empty() {
            return Err(format!("App '{}': 'app_dir' is required", name));
        }
        if !Path::new(&self.app_dir).is_absolute() {
            return Err(format!("App '{}': 'app_dir' must be an absolute path", name));
        }
        match &self.run_as {
            None => return Err(format!("App '{}': 'run_as' is required", name)),
            Some(RunAs::Candidates(users)) if users.is_empty() => {
                return Err(format!("App '{}': 'run_as' must name at least one user", name));
            }
            Some(_) => {}
        }
        if self.listen_port == Some(0) {
            return Err(format!("App '{}': 'listen_port' must be greater than 0", name));
        }
        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_r_program() -> String {
    "R".to_string()
}

fn default_r_adapter_script() -> String {
    "/usr/lib/workergate/R/SockJSAdapter.R".to_string()
}

fn default_python_program() -> String {
    "python3".to_string()
}

fn default_python_adapter_script() -> String {
    "/usr/lib/workergate/python/SockJSAdapter.py".to_string()
}

fn default_kill_grace_period() -> u64 {
    20 // SIGINT, then SIGTERM after 20 seconds
}

fn default_init_timeout() -> u64 {
    60
}

fn default_idle_timeout() -> i64 {
    5
}

fn default_health_interval() -> u64 {
    500
}

fn default_idle_linger() -> u64 {
    5000
}

fn default_log_file_mode() -> u32 {
    0o640
}

fn default_prefix() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.transport == TransportKind::Unix {
            match self.server.socket_dir.as_deref() {
                Some(dir) if Path::new(dir).is_absolute() => {}
                _ => errors.push(
                    "Server: unix transport requires an absolute 'socket_dir'".to_string(),
                ),
            }
        }

        let mut names: Vec<&String> = self.apps.keys().collect();
        names.sort();
        for name in names {
            if let Err(e) = self.apps[name].validate(name) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
