//! Worker table entries and the handle given to consumers
//!
//! A [`WorkerEntry`] is registered in its scheduler's table before the
//! worker even has an endpoint. It counts open connections and arms an idle
//! timer whenever the count drops to zero. A page load reserves a pending
//! connection for the session it implies; a release timer frees the
//! reservation if the session never arrives. Once the worker passes its health
//! check the entry resolves to a [`ReadyWorker`], and callers receive a
//! [`WorkerHandle`] that combines the two.

use crate::error::WorkerError;
use crate::process::{ExitNotification, WorkerProcess};
use crate::transport::Endpoint;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Kind of connection assigned to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Http,
    Sock,
    /// Reserved for a session that has not connected yet
    Pending,
}

impl ConnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnKind::Http => "http",
            ConnKind::Sock => "sock",
            ConnKind::Pending => "pending",
        }
    }
}

/// A worker that passed its health check
#[derive(Debug, Clone)]
pub struct ReadyWorker {
    pub endpoint: Endpoint,
    pub log_file: Option<PathBuf>,
    pub process: Arc<dyn WorkerProcess>,
}

type ReadySlot = Option<Result<ReadyWorker, WorkerError>>;

#[derive(Debug, Default)]
struct Connections {
    http: u32,
    sock: u32,
    pending: u32,
    idle_timer: Option<JoinHandle<()>>,
    pending_timers: VecDeque<(u64, JoinHandle<()>)>,
    next_timer_id: u64,
}

impl Connections {
    fn total(&self) -> u32 {
        self.http + self.sock + self.pending
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

/// One row of a scheduler's worker table
#[derive(Debug)]
pub struct WorkerEntry {
    id: String,
    data: Map<String, Value>,
    connections: Mutex<Connections>,
    idle_timeout: Option<Duration>,
    idle_tx: mpsc::UnboundedSender<Instant>,
    closed: AtomicBool,
    ready: watch::Sender<ReadySlot>,
}

impl WorkerEntry {
    /// Create an entry; the receiver yields the time of each idle timer expiry
    pub fn new(
        id: String,
        data: Map<String, Value>,
        idle_timeout: Option<Duration>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Instant>) {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(None);
        let entry = Arc::new(Self {
            id,
            data,
            connections: Mutex::new(Connections::default()),
            idle_timeout,
            idle_tx,
            closed: AtomicBool::new(false),
            ready,
        });
        (entry, idle_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Caller-supplied data attached at spawn time
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn http_conn(&self) -> u32 {
        self.connections.lock().http
    }

    pub fn sock_conn(&self) -> u32 {
        self.connections.lock().sock
    }

    pub fn pending_conn(&self) -> u32 {
        self.connections.lock().pending
    }

    /// Connections of every kind, pending reservations included
    pub fn connection_count(&self) -> u32 {
        self.connections.lock().total()
    }

    /// Open sessions plus sessions expected to connect
    pub fn session_count(&self) -> u32 {
        let conns = self.connections.lock();
        conns.sock + conns.pending
    }

    /// True while an idle timer is pending
    pub fn idle_timer_armed(&self) -> bool {
        self.connections
            .lock()
            .idle_timer
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn acquire(&self, kind: ConnKind) {
        let mut conns = self.connections.lock();
        match kind {
            ConnKind::Http => conns.http += 1,
            ConnKind::Sock => conns.sock += 1,
            ConnKind::Pending => conns.pending += 1,
        }
        trace!(
            worker_id = %self.id,
            kind = kind.as_str(),
            http = conns.http,
            sock = conns.sock,
            pending = conns.pending,
            "Acquired connection"
        );
        conns.cancel_idle_timer();
    }

    /// Counters saturate at zero. No-op once the entry is closed.
    pub fn release(&self, kind: ConnKind) {
        if self.is_closed() {
            return;
        }
        let mut conns = self.connections.lock();
        match kind {
            ConnKind::Http => conns.http = conns.http.saturating_sub(1),
            ConnKind::Sock => conns.sock = conns.sock.saturating_sub(1),
            ConnKind::Pending if conns.pending == 0 => {
                trace!(worker_id = %self.id, "No pending connection to release");
                return;
            }
            ConnKind::Pending => conns.pending -= 1,
        }
        trace!(
            worker_id = %self.id,
            kind = kind.as_str(),
            http = conns.http,
            sock = conns.sock,
            pending = conns.pending,
            "Released connection"
        );
        self.arm_idle_timer(&mut conns);
    }

    /// Arm the idle timer if nothing is connected
    pub fn start_idle_timer(&self) {
        let mut conns = self.connections.lock();
        self.arm_idle_timer(&mut conns);
    }

    fn arm_idle_timer(&self, conns: &mut Connections) {
        if conns.total() > 0 {
            return;
        }
        let Some(timeout) = self.idle_timeout else {
            trace!(worker_id = %self.id, "No clients connected, but idle reaping is disabled");
            return;
        };
        trace!(worker_id = %self.id, "No clients connected. Starting idle timer");
        conns.cancel_idle_timer();
        let idle_tx = self.idle_tx.clone();
        conns.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = idle_tx.send(Instant::now());
        }));
    }

    /// Release one pending connection after `timeout` unless the timer is
    /// shifted off first. Timers are queued oldest first.
    pub fn push_pending_release_timer(self: &Arc<Self>, timeout: Duration) {
        let entry = Arc::downgrade(self);
        let mut conns = self.connections.lock();
        let id = conns.next_timer_id;
        conns.next_timer_id += 1;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(entry) = entry.upgrade() {
                entry.expire_pending_release_timer(id);
            }
        });
        conns.pending_timers.push_back((id, timer));
    }

    /// Cancel the oldest pending release timer. Returns false if none is queued.
    pub fn shift_pending_release_timer(&self) -> bool {
        match self.connections.lock().pending_timers.pop_front() {
            Some((_, timer)) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_release_timers(&self) -> usize {
        self.connections.lock().pending_timers.len()
    }

    fn expire_pending_release_timer(&self, id: u64) {
        {
            let mut conns = self.connections.lock();
            if conns.pending_timers.front().is_some_and(|(front, _)| *front == id) {
                conns.pending_timers.pop_front();
            } else {
                warn!(worker_id = %self.id, "Pending release timer expired out of order");
                conns.pending_timers.retain(|(timer_id, _)| *timer_id != id);
            }
        }
        if self.is_closed() {
            return;
        }
        self.release(ConnKind::Pending);
    }

    /// Mark the entry as removed from its table
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut conns = self.connections.lock();
        conns.cancel_idle_timer();
        for (_, timer) in conns.pending_timers.drain(..) {
            timer.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Settle the spawn outcome; later calls are ignored
    pub fn resolve(&self, result: Result<ReadyWorker, WorkerError>) -> bool {
        self.ready.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    pub fn is_pending(&self) -> bool {
        self.ready.borrow().is_none()
    }

    /// The ready worker, if the spawn succeeded
    pub fn ready_worker(&self) -> Option<ReadyWorker> {
        match &*self.ready.borrow() {
            Some(Ok(worker)) => Some(worker.clone()),
            _ => None,
        }
    }

    /// Wait for the spawn outcome
    pub async fn handle(self: &Arc<Self>) -> Result<WorkerHandle, WorkerError> {
        let mut rx = self.ready.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(worker)) => Ok(WorkerHandle {
                entry: Arc::clone(self),
                worker,
            }),
            Some(Err(e)) => Err(e),
            None => Err(WorkerError::Spawn("worker entry dropped before startup finished".into())),
        }
    }
}

/// A ready worker as seen by the proxy layer.
///
/// Call [`acquire`](Self::acquire) when a connection is routed to the worker
/// and [`release`](Self::release) when it closes.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    entry: Arc<WorkerEntry>,
    worker: ReadyWorker,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        self.entry.id()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.worker.endpoint
    }

    pub fn port(&self) -> Option<u16> {
        self.worker.endpoint.port()
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.worker.endpoint.socket_path()
    }

    pub fn shared_secret(&self) -> &str {
        self.worker.endpoint.shared_secret()
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.worker.log_file.as_deref()
    }

    pub fn exit(&self) -> &ExitNotification {
        self.worker.process.exit()
    }

    pub fn pid(&self) -> Option<u32> {
        self.worker.process.pid()
    }

    pub fn acquire(&self, kind: ConnKind) {
        self.entry.acquire(kind);
    }

    pub fn release(&self, kind: ConnKind) {
        self.entry.release(kind);
    }

    pub fn connection_count(&self) -> u32 {
        self.entry.connection_count()
    }

    pub fn session_count(&self) -> u32 {
        self.entry.session_count()
    }

    pub fn push_pending_release_timer(&self, timeout: Duration) {
        self.entry.push_pending_release_timer(timeout);
    }

    pub fn shift_pending_release_timer(&self) -> bool {
        self.entry.shift_pending_release_timer()
    }

    pub fn kill(&self, force: bool) {
        self.worker.process.kill(force);
    }

    pub fn is_closed(&self) -> bool {
        self.entry.is_closed()
    }
}
