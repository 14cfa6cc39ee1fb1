//! Raw TCP forwarding from an application's public port to its worker
//!
//! Each accepted connection asks the registry for the application's worker,
//! counts itself against the worker while open and pipes bytes both ways.

use crate::app_spec::AppSpec;
use crate::registry::SchedulerRegistry;
use crate::transport::EndpointAddress;
use crate::worker::{ConnKind, WorkerHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct Forwarder {
    name: String,
    listener: TcpListener,
    app: Arc<AppSpec>,
    registry: Arc<SchedulerRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Forwarder {
    pub async fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        app: AppSpec,
        registry: Arc<SchedulerRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            name: name.into(),
            listener,
            app: Arc::new(app),
            registry,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(app = %self.name, addr = %addr, "Forwarder listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let app = Arc::clone(&self.app);
                            let registry = Arc::clone(&self.registry);
                            let name = self.name.clone();
                            tokio::spawn(async move {
                                if let Err(e) = forward(stream, &app, &registry).await {
                                    debug!(app = %name, peer = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(app = %self.name, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(app = %self.name, "Forwarder shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Releases the connection when the client goes away, however that happens
struct ActiveConnection(WorkerHandle);

impl ActiveConnection {
    /// Count the connection, claiming the oldest pending reservation if any
    fn open(handle: WorkerHandle) -> Self {
        handle.acquire(ConnKind::Sock);
        if handle.shift_pending_release_timer() {
            handle.release(ConnKind::Pending);
        }
        Self(handle)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.release(ConnKind::Sock);
    }
}

async fn forward(mut client: TcpStream, app: &AppSpec, registry: &SchedulerRegistry) -> std::io::Result<()> {
    let handle = match registry.get_worker(app).await {
        Ok(handle) => handle,
        Err(e) => {
            let code = e.code();
            warn!(
                app_dir = %app.app_dir().display(),
                code = code.as_header_value(),
                status = code.status_code(),
                error = %e,
                console_log = ?e.console_log(),
                "No worker available"
            );
            return Ok(());
        }
    };

    let connection = ActiveConnection::open(handle);
    match connection.0.endpoint().address() {
        EndpointAddress::Tcp(port) => {
            let upstream = TcpStream::connect(("127.0.0.1", *port)).await?;
            pipe(&mut client, upstream).await
        }
        EndpointAddress::Unix { path, .. } => {
            let upstream = UnixStream::connect(path).await?;
            pipe(&mut client, upstream).await
        }
    }
}

async fn pipe<U>(client: &mut TcpStream, mut upstream: U) -> std::io::Result<()>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (sent, received) = tokio::io::copy_bidirectional(client, &mut upstream).await?;
    debug!(sent, received, "Connection closed");
    Ok(())
}
