//! In-memory transport, launcher and process used by unit tests

use crate::app_spec::{AppSpec, RunAs};
use crate::config::AppSettings;
use crate::error::WorkerError;
use crate::launcher::Launcher;
use crate::process::{ExitNotification, ExitResolver, ExitStatus, WorkerProcess};
use crate::transport::{Endpoint, Transport};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// A process that exits as soon as it is signalled
#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    resolver: ExitResolver,
    exit: ExitNotification,
    kills: Mutex<Vec<bool>>,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Arc<Self> {
        let (resolver, exit) = ExitNotification::channel();
        Arc::new(Self {
            pid,
            resolver,
            exit,
            kills: Mutex::new(Vec::new()),
        })
    }

    pub fn exit_with(&self, status: ExitStatus) {
        self.resolver.resolve(status);
    }

    /// The `force` flag of every kill received while running
    pub fn kills(&self) -> Vec<bool> {
        self.kills.lock().clone()
    }
}

impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn exit(&self) -> &ExitNotification {
        &self.exit
    }

    fn kill(&self, force: bool) {
        if self.exit.has_exited() {
            return;
        }
        self.kills.lock().push(force);
        let signal = if force { Signal::SIGTERM } else { Signal::SIGINT };
        self.resolver.resolve(ExitStatus {
            code: None,
            signal: Some(signal),
        });
    }
}

/// Ports that currently accept connections
#[derive(Debug, Default)]
pub struct FakeNetwork {
    listening: Mutex<HashSet<u16>>,
}

impl FakeNetwork {
    fn listen(&self, port: u16) {
        self.listening.lock().insert(port);
    }

    fn is_listening(&self, port: u16) -> bool {
        self.listening.lock().contains(&port)
    }
}

#[derive(Debug)]
pub struct FakeTransport {
    network: Arc<FakeNetwork>,
    next_port: AtomicU16,
    allocs: AtomicUsize,
}

impl FakeTransport {
    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn alloc(&self) -> Result<Endpoint, WorkerError> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Ok(Endpoint::tcp(self.next_port.fetch_add(1, Ordering::SeqCst)))
    }

    async fn is_listening(&self, endpoint: &Endpoint) -> bool {
        endpoint.port().is_some_and(|port| self.network.is_listening(port))
    }
}

/// What the next launched worker does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchBehavior {
    /// Starts listening right away
    Listen,
    /// Runs but never accepts connections
    NeverListen,
    /// Exits with code 1 before listening
    ExitDuringInit,
    /// Launch is refused because the app dir does not exist
    MissingAppDir,
}

#[derive(Debug)]
pub struct FakeLauncher {
    network: Arc<FakeNetwork>,
    behavior: Mutex<LaunchBehavior>,
    next_pid: AtomicU32,
    launched: Mutex<Vec<Arc<FakeProcess>>>,
    removed_logs: Mutex<Vec<PathBuf>>,
}

impl FakeLauncher {
    pub fn set_behavior(&self, behavior: LaunchBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn launched(&self) -> Vec<Arc<FakeProcess>> {
        self.launched.lock().clone()
    }

    pub fn removed_logs(&self) -> Vec<PathBuf> {
        self.removed_logs.lock().clone()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(
        &self,
        app: &AppSpec,
        endpoint: &Endpoint,
        _log_file: Option<&Path>,
        _worker_id: &str,
    ) -> Result<Arc<dyn WorkerProcess>, WorkerError> {
        let behavior = *self.behavior.lock();
        if behavior == LaunchBehavior::MissingAppDir {
            return Err(WorkerError::AppDirNotFound(app.app_dir().to_path_buf()));
        }

        let process = FakeProcess::new(self.next_pid.fetch_add(1, Ordering::SeqCst));
        self.launched.lock().push(Arc::clone(&process));
        match behavior {
            LaunchBehavior::Listen => {
                if let Some(port) = endpoint.port() {
                    self.network.listen(port);
                }
            }
            LaunchBehavior::ExitDuringInit => process.exit_with(ExitStatus {
                code: Some(1),
                signal: None,
            }),
            LaunchBehavior::NeverListen | LaunchBehavior::MissingAppDir => {}
        }
        Ok(process)
    }

    async fn remove_log_file(&self, _app: &AppSpec, path: &Path) {
        self.removed_logs.lock().push(path.to_path_buf());
    }
}

/// A transport and launcher sharing one fake network
pub fn fakes() -> (Arc<FakeTransport>, Arc<FakeLauncher>) {
    let network = Arc::new(FakeNetwork::default());
    let transport = Arc::new(FakeTransport {
        network: Arc::clone(&network),
        next_port: AtomicU16::new(40000),
        allocs: AtomicUsize::new(0),
    });
    let launcher = Arc::new(FakeLauncher {
        network,
        behavior: Mutex::new(LaunchBehavior::Listen),
        next_pid: AtomicU32::new(1000),
        launched: Mutex::new(Vec::new()),
        removed_logs: Mutex::new(Vec::new()),
    });
    (transport, launcher)
}

/// `/apps/hello` run as alice, logging to `/var/log/workergate`
pub fn app_spec(idle_timeout_secs: i64, max_requests: u32) -> AppSpec {
    let mut settings = AppSettings::default();
    settings.app_defaults.idle_timeout_secs = idle_timeout_secs;
    settings.scheduler.max_requests = max_requests;
    AppSpec::new(
        "/apps/hello",
        Some(RunAs::User("alice".to_string())),
        "/",
        Some(PathBuf::from("/var/log/workergate")),
        settings,
    )
}
