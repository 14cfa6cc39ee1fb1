//! Worker table and spawn orchestration for one application key
//!
//! Spawning a worker runs through: table placeholder, endpoint allocation,
//! launch, health check, ready. The placeholder goes into the table before
//! anything suspends, and it leaves the table only when the worker's exit
//! notification fires (or its startup fails). Every exit frees the endpoint,
//! and a worker reaped for idleness also has its log deleted.
//!
//! # Usage
//!
//! `Scheduler` is shared behind an `Arc`; [`Scheduler::new`] returns
//! `Arc<Self>` because spawning hands a clone of it to background tasks.

use crate::app_spec::AppSpec;
use crate::error::WorkerError;
use crate::launcher::Launcher;
use crate::process::{ExitStatus, WorkerProcess};
use crate::transport::{random_hex, Endpoint, Transport};
use crate::worker::{ReadyWorker, WorkerEntry, WorkerHandle};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Delays between the first health-check connects, before settling on the
/// configured interval
const CONNECT_RAMP_MS: [u64; 12] = [50, 50, 100, 100, 100, 100, 100, 200, 200, 300, 300, 300];

/// Diagnostic view of one table entry
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: String,
    /// `starting`, `ready` or `failed`
    pub state: &'static str,
    pub endpoint: Option<String>,
    pub pid: Option<u32>,
    pub log_file: Option<PathBuf>,
    pub http_conn: u32,
    pub sock_conn: u32,
    pub pending_conn: u32,
}

pub struct Scheduler {
    key: String,
    workers: Mutex<HashMap<String, Arc<WorkerEntry>>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    launcher: Arc<dyn Launcher>,
    /// Receives our key whenever the table becomes empty
    vacant_tx: Option<mpsc::UnboundedSender<String>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("key", &self.key)
            .field("workers", &self.worker_count())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        key: String,
        launcher: Arc<dyn Launcher>,
        vacant_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            workers: Mutex::new(HashMap::new()),
            transport: RwLock::new(None),
            launcher,
            vacant_tx,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn workers(&self) -> Vec<Arc<WorkerEntry>> {
        self.workers.lock().values().cloned().collect()
    }

    /// Any one entry, starting or ready
    pub fn first_worker(&self) -> Option<Arc<WorkerEntry>> {
        self.workers.lock().values().next().cloned()
    }

    pub fn get_worker(&self, id: &str) -> Option<Arc<WorkerEntry>> {
        self.workers.lock().get(id).cloned()
    }

    /// Register a new worker and start it in the background.
    ///
    /// The entry is in the table when this returns; await
    /// [`WorkerEntry::handle`] for the outcome.
    pub fn spawn_worker(self: &Arc<Self>, app: &AppSpec, data: Map<String, Value>) -> Arc<WorkerEntry> {
        let id = random_hex(8);
        let (entry, idle_rx) = WorkerEntry::new(id.clone(), data, app.settings().app_defaults.idle_timeout());
        self.workers.lock().insert(id, Arc::clone(&entry));

        let scheduler = Arc::clone(self);
        let app = app.clone();
        let spawning = Arc::clone(&entry);
        tokio::spawn(async move {
            scheduler.run_worker(app, spawning, idle_rx).await;
        });
        entry
    }

    /// Spawn a worker and wait until it is ready
    pub async fn spawn_worker_p(
        self: &Arc<Self>,
        app: &AppSpec,
        data: Map<String, Value>,
    ) -> Result<WorkerHandle, WorkerError> {
        self.spawn_worker(app, data).handle().await
    }

    async fn run_worker(
        self: Arc<Self>,
        app: AppSpec,
        entry: Arc<WorkerEntry>,
        idle_rx: mpsc::UnboundedReceiver<Instant>,
    ) {
        let Some(transport) = self.transport() else {
            self.abandon(&entry, WorkerError::NoTransport);
            return;
        };
        let endpoint = match transport.alloc().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.abandon(&entry, e);
                return;
            }
        };
        let log_file = app.log_file_path(&endpoint.log_file_suffix());

        debug!(
            worker_id = entry.id(),
            app_dir = %app.app_dir().display(),
            run_as = ?app.run_as(),
            endpoint = %endpoint,
            "Launching worker"
        );
        let process = match self.launcher.launch(&app, &endpoint, log_file.as_deref(), entry.id()).await {
            Ok(process) => process,
            Err(e) => {
                warn!(worker_id = entry.id(), error = %e, "Worker failed to launch");
                entry.resolve(Err(e));
                // Nothing ran; clean up as for a synthetic exit
                self.on_exit(&app, &entry, &endpoint, log_file.as_deref(), ExitStatus::synthetic(), false)
                    .await;
                return;
            }
        };

        let delete_log = Arc::new(AtomicBool::new(false));
        tokio::spawn({
            let scheduler = Arc::clone(&self);
            let app = app.clone();
            let entry = Arc::clone(&entry);
            let endpoint = endpoint.clone();
            let log_file = log_file.clone();
            let process = Arc::clone(&process);
            let delete_log = Arc::clone(&delete_log);
            async move {
                let status = process.exit().wait().await;
                let delete = delete_log.load(Ordering::SeqCst);
                scheduler
                    .on_exit(&app, &entry, &endpoint, log_file.as_deref(), status, delete)
                    .await;
            }
        });

        let defaults = &app.settings().app_defaults;
        let exit = process.exit().clone();
        let connected = tokio::select! {
            connected = tokio::time::timeout(
                defaults.init_timeout(),
                poll_until_listening(transport.as_ref(), &endpoint, defaults.health_check_interval()),
            ) => connected.is_ok(),
            // The exit watcher reports the failure
            _ = exit.wait() => return,
        };

        if !connected {
            trace!(worker_id = entry.id(), endpoint = %endpoint, "Giving up on connecting");
            self.remove(&entry);
            entry.resolve(Err(WorkerError::StartupTimeout { console_log: log_file.clone() }));
            // Nobody holds a handle to it, so it must not keep running
            process.kill(true);
            return;
        }

        info!(worker_id = entry.id(), endpoint = %endpoint, pid = ?process.pid(), "Worker ready");
        entry.resolve(Ok(ReadyWorker {
            endpoint,
            log_file,
            process: Arc::clone(&process),
        }));
        // Reap workers that are spawned but never used
        entry.start_idle_timer();

        reap_when_idle(entry, process, idle_rx, defaults.idle_linger(), delete_log).await;
    }

    /// Fail a worker that never got an endpoint
    fn abandon(&self, entry: &Arc<WorkerEntry>, err: WorkerError) {
        warn!(worker_id = entry.id(), error = %err, "Worker failed to start");
        if self.remove(entry) {
            self.notify_vacant();
        }
        entry.resolve(Err(err));
    }

    /// Close the entry and drop it from the table; true if the table is now
    /// empty
    fn remove(&self, entry: &WorkerEntry) -> bool {
        entry.close();
        let mut workers = self.workers.lock();
        workers.remove(entry.id());
        workers.is_empty()
    }

    fn notify_vacant(&self) {
        if let Some(tx) = &self.vacant_tx {
            let _ = tx.send(self.key.clone());
        }
    }

    async fn on_exit(
        &self,
        app: &AppSpec,
        entry: &Arc<WorkerEntry>,
        endpoint: &Endpoint,
        log_file: Option<&Path>,
        status: ExitStatus,
        delete_log: bool,
    ) {
        debug!(worker_id = entry.id(), %status, "Worker exited");
        if self.remove(entry) {
            self.notify_vacant();
        }
        endpoint.free();
        trace!(endpoint = %endpoint, "Endpoint returned");

        // Reports the failure if the worker died before its health check
        // passed; a no-op otherwise
        entry.resolve(Err(WorkerError::ExitedDuringInit {
            console_log: log_file.map(Path::to_path_buf),
        }));

        if !delete_log {
            return;
        }
        let Some(path) = log_file else {
            return;
        };
        if app.settings().app_defaults.preserve_logs {
            trace!(path = %path.display(), "Declining to delete log file of successful execution");
            return;
        }
        trace!(path = %path.display(), "Normal exit, deleting log file");
        self.launcher.remove_log_file(app, path).await;
    }

    /// Force-kill every ready worker
    pub fn shutdown(&self) {
        for entry in self.workers() {
            if let Some(worker) = entry.ready_worker() {
                worker.process.kill(true);
            }
        }
    }

    /// Describe every worker, logging each one
    pub fn dump(&self) -> Vec<WorkerSummary> {
        let workers = self.workers();
        info!(key = %self.key.replace('\n', " "), count = workers.len(), "Dumping worker(s)");
        let summaries: Vec<WorkerSummary> = workers.iter().map(|e| summarize(e)).collect();
        for summary in &summaries {
            info!(
                worker_id = %summary.id,
                state = summary.state,
                endpoint = ?summary.endpoint,
                pid = ?summary.pid,
                log_file = ?summary.log_file,
                http_conn = summary.http_conn,
                sock_conn = summary.sock_conn,
                pending_conn = summary.pending_conn,
                "Worker"
            );
        }
        info!("Dump completed");
        summaries
    }
}

fn summarize(entry: &WorkerEntry) -> WorkerSummary {
    let ready = entry.ready_worker();
    let state = match (&ready, entry.is_pending()) {
        (Some(_), _) => "ready",
        (None, true) => "starting",
        (None, false) => "failed",
    };
    WorkerSummary {
        id: entry.id().to_string(),
        state,
        endpoint: ready.as_ref().map(|w| w.endpoint.to_string()),
        pid: ready.as_ref().and_then(|w| w.process.pid()),
        log_file: ready.as_ref().and_then(|w| w.log_file.clone()),
        http_conn: entry.http_conn(),
        sock_conn: entry.sock_conn(),
        pending_conn: entry.pending_conn(),
    }
}

/// Connect until something answers, ramping up to `max_interval` between
/// attempts
async fn poll_until_listening(transport: &dyn Transport, endpoint: &Endpoint, max_interval: Duration) {
    let mut ramp = CONNECT_RAMP_MS
        .iter()
        .map(|ms| Duration::from_millis(*ms).min(max_interval));
    let started = Instant::now();
    loop {
        trace!(endpoint = %endpoint, "Attempting to connect");
        if transport.is_listening(endpoint).await {
            trace!(
                endpoint = %endpoint,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Successfully connected"
            );
            return;
        }
        tokio::time::sleep(ramp.next().unwrap_or(max_interval)).await;
    }
}

/// Kill the worker once it has been idle for the linger period
async fn reap_when_idle(
    entry: Arc<WorkerEntry>,
    process: Arc<dyn WorkerProcess>,
    mut idle_rx: mpsc::UnboundedReceiver<Instant>,
    linger: Duration,
    delete_log: Arc<AtomicBool>,
) {
    let exit = process.exit().clone();
    loop {
        let mut idle_since = tokio::select! {
            _ = exit.wait() => return,
            signal = idle_rx.recv() => match signal {
                Some(fired_at) => fired_at,
                None => return,
            },
        };
        trace!(worker_id = entry.id(), "Idle timeout expired");

        // The linger runs from the most recent expiry
        loop {
            tokio::select! {
                _ = exit.wait() => return,
                _ = tokio::time::sleep_until(idle_since + linger) => {}
            }
            let mut latest = None;
            while let Ok(fired_at) = idle_rx.try_recv() {
                latest = Some(fired_at);
            }
            match latest {
                Some(fired_at) if fired_at > idle_since => idle_since = fired_at,
                _ => break,
            }
        }
        // Connections may have come and gone while we lingered
        if entry.connection_count() > 0 || entry.idle_timer_armed() {
            trace!(worker_id = entry.id(), "Worker became active again");
            continue;
        }

        delete_log.store(true, Ordering::SeqCst);
        if !process.is_running() {
            trace!(worker_id = entry.id(), "Process is already gone");
            return;
        }
        info!(worker_id = entry.id(), pid = ?process.pid(), "Stopping idle worker");
        process.kill(false);
        return;
    }
}
