//! Supervision of a single worker OS process
//!
//! [`AppWorker`] owns the spawned child, resolves an [`ExitNotification`]
//! exactly once when it terminates and implements the two-stage kill
//! protocol: `SIGINT` first, `SIGTERM` if the worker is still around after
//! the grace period.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How a worker process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<Signal>,
}

impl ExitStatus {
    /// Status reported when the process never ran or could not be waited on
    pub fn synthetic() -> Self {
        Self {
            code: Some(-1),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal().and_then(|s| Signal::try_from(s).ok()),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (_, Some(signal)) => write!(f, "signal {}", signal.as_str()),
            (Some(code), None) => write!(f, "code {}", code),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Resolves an [`ExitNotification`]; only the first resolution counts
#[derive(Debug)]
pub struct ExitResolver {
    tx: watch::Sender<Option<ExitStatus>>,
}

impl ExitResolver {
    /// Returns false if the notification had already been resolved
    pub fn resolve(&self, status: ExitStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status);
            true
        })
    }
}

/// One-shot exit result, shared by every interested party
#[derive(Debug, Clone)]
pub struct ExitNotification {
    rx: watch::Receiver<Option<ExitStatus>>,
}

impl ExitNotification {
    pub fn channel() -> (ExitResolver, ExitNotification) {
        let (tx, rx) = watch::channel(None);
        (ExitResolver { tx }, ExitNotification { rx })
    }

    pub fn status(&self) -> Option<ExitStatus> {
        *self.rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the process to exit.
    ///
    /// If the resolver is dropped without resolving, the synthetic status
    /// is returned.
    pub async fn wait(&self) -> ExitStatus {
        let mut rx = self.rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        result.unwrap_or_else(ExitStatus::synthetic)
    }
}

/// A launched worker as seen by the scheduler
pub trait WorkerProcess: Send + Sync + fmt::Debug {
    /// Pid of the worker itself, once known, else the spawned pid
    fn pid(&self) -> Option<u32>;

    fn exit(&self) -> &ExitNotification;

    fn is_running(&self) -> bool {
        !self.exit().has_exited()
    }

    /// Ask the worker to stop. `force` sends `SIGTERM` right away; otherwise
    /// `SIGINT` is sent and escalated after the grace period. No-op once the
    /// worker has exited.
    fn kill(&self, force: bool);
}

/// A worker backed by a real child process
#[derive(Debug)]
pub struct AppWorker {
    child_pid: Option<u32>,
    /// Pid from the launch handshake, 0 until it arrives
    worker_pid: AtomicU32,
    exit: ExitNotification,
    grace_period: Duration,
}

impl AppWorker {
    /// Take ownership of `child` and resolve the exit notification when it
    /// terminates.
    pub fn watch(mut child: Child, grace_period: Duration) -> Arc<Self> {
        let child_pid = child.id();
        let (resolver, exit) = ExitNotification::channel();

        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    warn!(pid = ?child_pid, error = %e, "Failed to wait for worker process");
                    ExitStatus::synthetic()
                }
            };
            debug!(pid = ?child_pid, %status, "Worker process exited");
            resolver.resolve(status);
        });

        Arc::new(Self {
            child_pid,
            worker_pid: AtomicU32::new(0),
            exit,
            grace_period,
        })
    }

    /// Record the pid the worker reported about itself
    pub fn set_worker_pid(&self, pid: u32) {
        self.worker_pid.store(pid, Ordering::SeqCst);
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    fn send(pid: Pid, sig: Signal) {
        if let Err(e) = signal::kill(pid, sig) {
            warn!(pid = pid.as_raw(), signal = sig.as_str(), error = %e, "Failed to signal worker");
        }
    }
}

impl WorkerProcess for AppWorker {
    fn pid(&self) -> Option<u32> {
        match self.worker_pid.load(Ordering::SeqCst) {
            0 => self.child_pid,
            pid => Some(pid),
        }
    }

    fn exit(&self) -> &ExitNotification {
        &self.exit
    }

    fn kill(&self, force: bool) {
        if self.exit.has_exited() {
            return;
        }
        let Some(pid) = self.pid() else {
            return;
        };
        let pid = Pid::from_raw(pid as i32);

        if force {
            info!(pid = pid.as_raw(), "Sending SIGTERM to worker");
            Self::send(pid, Signal::SIGTERM);
            return;
        }

        info!(pid = pid.as_raw(), "Sending SIGINT to worker");
        Self::send(pid, Signal::SIGINT);

        let exit = self.exit.clone();
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            tokio::select! {
                _ = exit.wait() => {}
                _ = tokio::time::sleep(grace_period) => {
                    if !exit.has_exited() {
                        warn!(
                            pid = pid.as_raw(),
                            grace_period_secs = grace_period.as_secs(),
                            "Worker ignored SIGINT, sending SIGTERM"
                        );
                        Self::send(pid, Signal::SIGTERM);
                    }
                }
            }
        });
    }
}
