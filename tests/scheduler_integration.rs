//! Integration tests that launch the mock worker as a real process
//!
//! Build the mock first:
//! `cargo build --release --manifest-path tests/mock_worker/Cargo.toml`
//!
//! Tests are skipped when the mock binary is missing or when running as
//! root, since the launcher refuses to run workers as the superuser.

use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, User};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use workergate::app_spec::{AppSpec, RunAs};
use workergate::config::{AppSettings, LauncherConfig};
use workergate::error::WorkerError;
use workergate::launcher::ProcessLauncher;
use workergate::registry::SchedulerRegistry;
use workergate::transport::{TcpTransport, UnixSocketTransport};
use workergate::worker::{ConnKind, WorkerHandle};

const WAIT: Duration = Duration::from_secs(20);

fn mock_worker_path() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/mock_worker/target/release/mock-worker");
    path
}

fn can_run() -> bool {
    if !mock_worker_path().exists() {
        eprintln!("Skipping test: mock worker not built");
        return false;
    }
    if nix::unistd::geteuid().is_root() {
        eprintln!("Skipping test: running as root");
        return false;
    }
    true
}

fn current_user() -> String {
    User::from_uid(nix::unistd::getuid())
        .unwrap()
        .map(|u| u.name)
        .unwrap()
}

/// An app directory, a log directory and a registry launching the mock
struct Fixture {
    root: TempDir,
    app_dir: PathBuf,
    log_dir: PathBuf,
    registry: Arc<SchedulerRegistry>,
}

impl Fixture {
    fn new(behavior: Option<&str>, kill_grace_period_secs: u64) -> Self {
        let root = tempfile::tempdir().unwrap();
        let app_dir = root.path().join("hello");
        let log_dir = root.path().join("logs");
        std::fs::create_dir(&app_dir).unwrap();
        if let Some(behavior) = behavior {
            std::fs::write(app_dir.join("behavior"), behavior).unwrap();
        }

        let launcher = ProcessLauncher::new(LauncherConfig {
            r_program: mock_worker_path().to_string_lossy().into_owned(),
            kill_grace_period_secs,
            ..LauncherConfig::default()
        });
        let registry = SchedulerRegistry::new(Arc::new(launcher));
        registry.set_transport(Arc::new(TcpTransport::new()));

        Self {
            root,
            app_dir,
            log_dir,
            registry,
        }
    }

    fn app(&self, configure: impl FnOnce(&mut AppSettings)) -> AppSpec {
        let mut settings = AppSettings::default();
        settings.app_defaults.idle_timeout_secs = 0;
        configure(&mut settings);
        AppSpec::new(
            &self.app_dir,
            Some(RunAs::User(current_user())),
            "/hello/",
            Some(self.log_dir.clone()),
            settings,
        )
    }
}

async fn echo_tcp(port: u16) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"hello worker").await.unwrap();
    let mut buf = vec![0u8; 12];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    buf
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn log_contents(handle: &WorkerHandle) -> String {
    std::fs::read_to_string(handle.log_file().unwrap()).unwrap_or_default()
}

#[tokio::test]
async fn test_tcp_worker_serves_connections() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(None, 20);
    let app = fixture.app(|_| {});

    let handle = tokio::time::timeout(WAIT, fixture.registry.get_worker(&app))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echo_tcp(handle.port().unwrap()).await, b"hello worker");

    // The log is named after the app, the user and the port
    let log = handle.log_file().unwrap().to_path_buf();
    assert_eq!(log.parent(), Some(fixture.log_dir.as_path()));
    let name = log.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with(&format!("hello-{}-", current_user())));
    assert!(name.ends_with(&format!("-{}.log", handle.port().unwrap())));
    wait_until(|| log_contents(&handle).contains("Mock worker: listening")).await;

    handle.kill(true);
    let status = tokio::time::timeout(WAIT, handle.exit().wait()).await.unwrap();
    assert_eq!(status.signal, Some(Signal::SIGTERM));
}

#[tokio::test]
async fn test_unix_socket_worker() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(None, 20);
    let socket_dir = fixture.root.path().join("sockets");
    fixture
        .registry
        .set_transport(Arc::new(UnixSocketTransport::new(&socket_dir).unwrap()));
    let app = fixture.app(|_| {});

    let handle = tokio::time::timeout(WAIT, fixture.registry.get_worker(&app))
        .await
        .unwrap()
        .unwrap();
    let path = handle.socket_path().unwrap().to_path_buf();
    assert!(path.starts_with(&socket_dir));

    let mut stream = UnixStream::connect(&path).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ping");

    handle.kill(true);
    tokio::time::timeout(WAIT, handle.exit().wait()).await.unwrap();
}

#[tokio::test]
async fn test_handshake_reports_worker_pid() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(None, 20);
    let app = fixture.app(|_| {});
    let handle = tokio::time::timeout(WAIT, fixture.registry.get_worker(&app))
        .await
        .unwrap()
        .unwrap();

    let pid = handle.pid().unwrap();
    assert!(signal::kill(Pid::from_raw(pid as i32), None).is_ok());

    handle.kill(true);
    tokio::time::timeout(WAIT, handle.exit().wait()).await.unwrap();
}

#[tokio::test]
async fn test_external_signal_is_reported_and_cleaned_up() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(None, 20);
    let app = fixture.app(|_| {});
    let handle = tokio::time::timeout(WAIT, fixture.registry.get_worker(&app))
        .await
        .unwrap()
        .unwrap();
    handle.acquire(ConnKind::Http);

    signal::kill(Pid::from_raw(handle.pid().unwrap() as i32), Signal::SIGABRT).unwrap();
    let status = tokio::time::timeout(WAIT, handle.exit().wait()).await.unwrap();
    assert_eq!(status.signal, Some(Signal::SIGABRT));

    wait_until(|| fixture.registry.is_empty()).await;
    assert!(handle.is_closed());
    handle.release(ConnKind::Http);
    // Unexpected exits keep their logs
    assert!(handle.log_file().unwrap().exists());
}

#[tokio::test]
async fn test_missing_app_dir_is_not_found() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(None, 20);
    let app = AppSpec::new(
        fixture.app_dir.join("missing"),
        Some(RunAs::User(current_user())),
        "/",
        Some(fixture.log_dir.clone()),
        AppSettings::default(),
    );

    let err = fixture.registry.get_worker(&app).await.unwrap_err();
    assert!(matches!(err, WorkerError::AppDirNotFound(_)));
    assert!(err.is_not_found());
    assert_eq!(err.code().status_code(), 404);
}

#[tokio::test]
async fn test_exit_during_init_attaches_console_log() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(Some("exit-during-init"), 20);
    let app = fixture.app(|_| {});

    let err = tokio::time::timeout(WAIT, fixture.registry.get_worker(&app))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, WorkerError::ExitedDuringInit { .. }));
    assert_eq!(err.to_string(), "The application exited during initialization.");

    let console_log = err.console_log().unwrap().to_path_buf();
    wait_until(|| {
        std::fs::read_to_string(&console_log)
            .unwrap_or_default()
            .contains("failing during init")
    })
    .await;
}

#[tokio::test]
async fn test_worker_that_never_listens_times_out() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(Some("never-listen"), 20);
    let app = fixture.app(|s| s.app_defaults.init_timeout_secs = 1);

    let err = tokio::time::timeout(WAIT, fixture.registry.get_worker(&app))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, WorkerError::StartupTimeout { .. }));
    assert_eq!(err.code().status_code(), 503);

    // The orphaned process is killed and its policy dropped
    wait_until(|| fixture.registry.is_empty()).await;
}

#[tokio::test]
async fn test_slow_start_passes_health_check() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(Some("slow-start 700"), 20);
    let app = fixture.app(|s| s.app_defaults.health_check_interval_ms = 100);

    let handle = tokio::time::timeout(WAIT, fixture.registry.get_worker(&app))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echo_tcp(handle.port().unwrap()).await, b"hello worker");

    handle.kill(true);
    tokio::time::timeout(WAIT, handle.exit().wait()).await.unwrap();
}

#[tokio::test]
async fn test_ignored_sigint_escalates_to_sigterm() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(Some("ignore-sigint"), 1);
    let app = fixture.app(|_| {});
    let handle = tokio::time::timeout(WAIT, fixture.registry.get_worker(&app))
        .await
        .unwrap()
        .unwrap();

    handle.kill(false);
    let status = tokio::time::timeout(WAIT, handle.exit().wait()).await.unwrap();
    assert_eq!(status.signal, Some(Signal::SIGTERM));
    wait_until(|| log_contents(&handle).contains("ignoring SIGINT")).await;
}

#[tokio::test]
async fn test_idle_worker_is_reaped_and_log_deleted() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(None, 20);
    let app = fixture.app(|s| {
        s.app_defaults.idle_timeout_secs = 1;
        s.app_defaults.idle_linger_ms = 200;
    });

    let handle = tokio::time::timeout(WAIT, fixture.registry.get_worker(&app))
        .await
        .unwrap()
        .unwrap();
    handle.acquire(ConnKind::Sock);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(handle.exit().status().is_none());
    handle.release(ConnKind::Sock);

    let status = tokio::time::timeout(WAIT, handle.exit().wait()).await.unwrap();
    assert_eq!(status.signal, Some(Signal::SIGINT));

    let log: &Path = handle.log_file().unwrap();
    wait_until(|| !log.exists()).await;
    wait_until(|| fixture.registry.is_empty()).await;
}

#[tokio::test]
async fn test_preserved_logs_survive_reaping() {
    if !can_run() {
        return;
    }
    let fixture = Fixture::new(None, 20);
    let app = fixture.app(|s| {
        s.app_defaults.idle_timeout_secs = 1;
        s.app_defaults.idle_linger_ms = 200;
        s.app_defaults.preserve_logs = true;
    });

    let handle = tokio::time::timeout(WAIT, fixture.registry.get_worker(&app))
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(WAIT, handle.exit().wait()).await.unwrap();
    wait_until(|| fixture.registry.is_empty()).await;
    assert!(handle.log_file().unwrap().exists());
}
