//! Endpoint allocation for worker processes
//!
//! A worker listens either on a loopback TCP port or on a unix socket in a
//! dedicated directory. Every endpoint also carries a random shared secret
//! the worker uses to reject connections that did not come from us.

use crate::error::WorkerError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::RngCore;
use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tracing::{error, info};

/// Retries after the first `EADDRINUSE` before giving up
pub const MAX_BIND_RETRIES: u32 = 5;

/// Permissions for a socket directory we create
const SOCKET_DIR_MODE: u32 = 0o733;

/// Random bytes, hex encoded
pub(crate) fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Where a worker listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddress {
    Tcp(u16),
    Unix { path: PathBuf, name: String },
}

/// An allocated address plus the secret shared with the worker
#[derive(Debug, Clone)]
pub struct Endpoint {
    address: EndpointAddress,
    shared_secret: String,
}

impl Endpoint {
    pub fn tcp(port: u16) -> Self {
        Self {
            address: EndpointAddress::Tcp(port),
            shared_secret: random_hex(16),
        }
    }

    /// Socket `<dir>/<name>.sock`; the short name is the first 12 characters
    pub fn unix(socket_dir: &Path, name: &str) -> Self {
        Self {
            address: EndpointAddress::Unix {
                path: socket_dir.join(format!("{}.sock", name)),
                name: name.chars().take(12).collect(),
            },
            shared_secret: random_hex(16),
        }
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn port(&self) -> Option<u16> {
        match self.address {
            EndpointAddress::Tcp(port) => Some(port),
            EndpointAddress::Unix { .. } => None,
        }
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match &self.address {
            EndpointAddress::Tcp(_) => None,
            EndpointAddress::Unix { path, .. } => Some(path),
        }
    }

    pub fn shared_secret(&self) -> &str {
        &self.shared_secret
    }

    /// The address as handed to the worker: a port number or a socket path
    pub fn worker_address(&self) -> String {
        match &self.address {
            EndpointAddress::Tcp(port) => port.to_string(),
            EndpointAddress::Unix { path, .. } => path.display().to_string(),
        }
    }

    pub fn log_file_suffix(&self) -> String {
        match &self.address {
            EndpointAddress::Tcp(port) => port.to_string(),
            EndpointAddress::Unix { name, .. } => name.clone(),
        }
    }

    /// True if something accepts connections on this endpoint
    pub async fn is_listening(&self) -> bool {
        match &self.address {
            EndpointAddress::Tcp(port) => TcpStream::connect(("127.0.0.1", *port)).await.is_ok(),
            EndpointAddress::Unix { path, .. } => UnixStream::connect(path).await.is_ok(),
        }
    }

    /// Release the endpoint.
    ///
    /// Nothing to do: the OS reclaims a port when the worker exits, and
    /// socket files are left for the next worker to replace.
    pub fn free(&self) {}
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            EndpointAddress::Tcp(port) => write!(f, "port {}", port),
            EndpointAddress::Unix { name, .. } => write!(f, "socket {}", name),
        }
    }
}

/// Allocates endpoints for new workers
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn alloc(&self) -> Result<Endpoint, WorkerError>;

    /// One connect attempt against an endpoint this transport allocated
    async fn is_listening(&self, endpoint: &Endpoint) -> bool {
        endpoint.is_listening().await
    }
}

/// Binds a throwaway listener and returns the port it got
pub type PortBinder = Arc<dyn Fn() -> BoxFuture<'static, io::Result<u16>> + Send + Sync>;

/// Lets the OS pick a free loopback port.
///
/// The port is released before the worker binds it, so another process can
/// take it in between; the worker then fails its health check like any other
/// startup failure.
pub struct TcpTransport {
    binder: PortBinder,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_binder(Arc::new(|| {
            Box::pin(async {
                let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
                let port = listener.local_addr()?.port();
                Ok(port)
            })
        }))
    }

    pub fn with_binder(binder: PortBinder) -> Self {
        Self { binder }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn alloc(&self) -> Result<Endpoint, WorkerError> {
        let mut tries = 0;
        loop {
            match (self.binder)().await {
                Ok(port) => return Ok(Endpoint::tcp(port)),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    info!(error = %e, "Could not bind port");
                    if tries == MAX_BIND_RETRIES {
                        error!(tries = tries + 1, "Giving up on binding port");
                        return Err(WorkerError::NoFreePort);
                    }
                    tries += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Hands out randomly named sockets in one directory
#[derive(Debug)]
pub struct UnixSocketTransport {
    socket_dir: PathBuf,
}

impl UnixSocketTransport {
    /// Use `socket_dir`, creating it if needed
    pub fn new(socket_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let socket_dir = socket_dir.into();
        info!(socket_dir = %socket_dir.display(), "Socket dir");
        if !socket_dir.is_dir() {
            info!("Socket dir does not exist, will create it");
            std::fs::create_dir_all(&socket_dir)?;
            // mkdir honours the umask, so set the mode explicitly
            std::fs::set_permissions(&socket_dir, std::fs::Permissions::from_mode(SOCKET_DIR_MODE))?;
        }
        Ok(Self { socket_dir })
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn alloc(&self) -> Result<Endpoint, WorkerError> {
        Ok(Endpoint::unix(&self.socket_dir, &random_hex(16)))
    }
}
