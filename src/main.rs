use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use workergate::config::{Config, TransportKind};
use workergate::forwarder::Forwarder;
use workergate::launcher::ProcessLauncher;
use workergate::registry::SchedulerRegistry;
use workergate::transport::{TcpTransport, Transport, UnixSocketTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("workergate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let launcher = Arc::new(ProcessLauncher::new(config.launcher.clone()));
    let registry = SchedulerRegistry::new(launcher);
    registry.set_transport(build_transport(&config)?);

    // One forwarder per application with a public port
    let mut forwarders = Vec::new();
    for (name, app) in &config.apps {
        let Some(port) = app.listen_port.filter(|p| *p > 0) else {
            continue;
        };
        let addr: SocketAddr = format!("{}:{}", config.server.bind, port).parse().map_err(|e| {
            error!(app = %name, bind = %config.server.bind, port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address for app '{}': {}", name, e)
        })?;

        let forwarder = Forwarder::bind(name.clone(), addr, app.to_spec(), Arc::clone(&registry), shutdown_rx.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen on {} for app '{}': {}", addr, name, e))?;

        let name = name.clone();
        forwarders.push(tokio::spawn(async move {
            if let Err(e) = forwarder.run().await {
                error!(app = %name, error = %e, "Forwarder error");
            }
        }));
    }

    if forwarders.is_empty() {
        warn!("No application has a listen_port; nothing to forward");
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP dumps worker state
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, dumping workers");
                    let dump = registry.dump();
                    let workers: usize = dump.iter().map(|d| d.workers.len()).sum();
                    info!(applications = dump.len(), workers, "Dump finished");
                }
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all workers...");
    registry.shutdown();

    // Wait for forwarders to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in forwarders {
            let _ = handle.await;
        }
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn build_transport(config: &Config) -> anyhow::Result<Arc<dyn Transport>> {
    match config.server.transport {
        TransportKind::Tcp => Ok(Arc::new(TcpTransport::new())),
        TransportKind::Unix => {
            let socket_dir = config
                .server
                .socket_dir
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("server.socket_dir is required for the unix transport"))?;
            let transport = UnixSocketTransport::new(socket_dir)
                .map_err(|e| anyhow::anyhow!("Failed to prepare socket dir '{}': {}", socket_dir, e))?;
            Ok(Arc::new(transport))
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        transport = ?config.server.transport,
        apps = config.apps.len(),
        "Starting"
    );
    for (name, app) in &config.apps {
        info!(
            app = %name,
            app_dir = %app.app_dir,
            run_as = ?app.run_as,
            listen_port = ?app.listen_port,
            mode = app.settings.mode.as_str(),
            max_requests = app.settings.scheduler.max_requests,
            "Application"
        );
    }
}

/// PID file handle that maintains an exclusive lock
struct PidFile {
    _lock: Flock<File>,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        // Truncate only once the lock is held so a running instance keeps its pid
        let file = OpenOptions::new().write(true).create(true).truncate(false).open(path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                anyhow::bail!("Another instance is already running (PID file is locked)")
            }
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };

        lock.set_len(0)?;
        writeln!(lock, "{}", std::process::id())?;

        // Keep the lock alive for the life of the process
        Ok(Self { _lock: lock })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workergate.pid");

        let first = PidFile::create(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        let err = PidFile::create(&path).err().unwrap();
        assert!(err.to_string().contains("already running"));
        // The losing attempt must not clobber the holder's pid
        assert_eq!(std::fs::read_to_string(&path).unwrap(), contents);

        drop(first);
        assert!(PidFile::create(&path).is_ok());
    }
}
