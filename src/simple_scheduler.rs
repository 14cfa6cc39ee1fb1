//! Scheduling policy: one worker per application, with admission control
//!
//! Every request for an application is routed to its single worker, which
//! is spawned on demand. When `max_requests` is set, connections beyond it
//! are turned away with [`WorkerError::OutOfCapacity`] instead of spawning a
//! second process.

use crate::app_spec::AppSpec;
use crate::error::WorkerError;
use crate::launcher::Launcher;
use crate::scheduler::{Scheduler, WorkerSummary};
use crate::transport::Transport;
use crate::worker::{WorkerEntry, WorkerHandle};
use parking_lot::Mutex;
use serde_json::Map;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const OUT_OF_CAPACITY: &str = "This application cannot handle another connection.";

/// URL that starts a new session; it is held to the soft limit
const NEW_SESSION_URL: &str = "/";

#[derive(Debug)]
pub struct SimpleScheduler {
    scheduler: Arc<Scheduler>,
    /// Serializes "check table, then spawn" so concurrent first requests
    /// share one worker
    admission: Mutex<()>,
    /// Set under `admission` once the registry has dropped this policy
    retired: AtomicBool,
}

impl SimpleScheduler {
    pub fn new(
        key: String,
        launcher: Arc<dyn Launcher>,
        vacant_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler: Scheduler::new(key, launcher, vacant_tx),
            admission: Mutex::new(()),
            retired: AtomicBool::new(false),
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        self.scheduler.set_transport(transport);
    }

    pub fn worker_count(&self) -> usize {
        self.scheduler.worker_count()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Retire the policy if it has no workers. A retired policy admits
    /// nothing; callers get [`WorkerError::Retired`].
    pub(crate) fn retire_if_vacant(&self) -> bool {
        let _admission = self.admission.lock();
        if self.scheduler.worker_count() > 0 {
            return false;
        }
        self.retired.store(true, Ordering::SeqCst);
        true
    }

    /// Get the application's worker, spawning it if needed. Only the hard
    /// connection limit applies.
    pub async fn acquire_worker(&self, app: &AppSpec) -> Result<WorkerHandle, WorkerError> {
        let entry = self.admit(app, None)?;
        entry.handle().await
    }

    /// Like [`acquire_worker`](Self::acquire_worker), but requests for `/`
    /// start a new session and must fit under the soft limit.
    pub async fn acquire_worker_for(&self, app: &AppSpec, url: &str) -> Result<WorkerHandle, WorkerError> {
        let entry = self.admit(app, Some(url))?;
        entry.handle().await
    }

    /// Pick the worker for a request, or spawn it. Pending reservations
    /// count against the limits.
    pub(crate) fn admit(&self, app: &AppSpec, url: Option<&str>) -> Result<Arc<WorkerEntry>, WorkerError> {
        let _admission = self.admission.lock();
        if self.is_retired() {
            return Err(WorkerError::Retired);
        }

        let Some(entry) = self.scheduler.first_worker() else {
            trace!(key = %app.app_dir().display(), "No worker yet, spawning");
            return Ok(self.scheduler.spawn_worker(app, Map::new()));
        };

        let limit = match url {
            Some(NEW_SESSION_URL) => soft_limit(app.settings().scheduler.max_requests),
            _ => app.settings().scheduler.max_requests,
        };
        let connections = entry.connection_count();
        if limit > 0 && connections >= limit {
            debug!(
                worker_id = entry.id(),
                connections,
                limit,
                url = url.unwrap_or_default(),
                "Worker is at capacity"
            );
            return Err(WorkerError::OutOfCapacity(OUT_OF_CAPACITY.to_string()));
        }
        Ok(entry)
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    pub fn dump(&self) -> Vec<WorkerSummary> {
        self.scheduler.dump()
    }
}

/// Connection limit for new sessions, leaving headroom below `hard` for
/// sessions already in progress. Zero means unlimited.
pub fn soft_limit(hard: u32) -> u32 {
    if hard == 0 {
        return 0;
    }
    let hard = i64::from(hard);
    let eighty_percent = (hard as f64 * 0.8).round() as i64;
    eighty_percent.min((hard - 10).max(2)) as u32
}
