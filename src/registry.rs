//! Registry of scheduling policies, one per application key
//!
//! Policies are created on first request and dropped again once their
//! scheduler reports that the last worker for the key is gone. All policies
//! share one transport.

use crate::app_spec::AppSpec;
use crate::error::WorkerError;
use crate::launcher::Launcher;
use crate::scheduler::WorkerSummary;
use crate::simple_scheduler::SimpleScheduler;
use crate::transport::{TcpTransport, Transport};
use crate::worker::{WorkerEntry, WorkerHandle};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Workers of one application key
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerDump {
    pub key: String,
    pub workers: Vec<WorkerSummary>,
}

type PolicyMap = DashMap<String, Arc<SimpleScheduler>>;

pub struct SchedulerRegistry {
    policies: Arc<PolicyMap>,
    transport: RwLock<Arc<dyn Transport>>,
    launcher: Arc<dyn Launcher>,
    vacant_tx: mpsc::UnboundedSender<String>,
}

impl SchedulerRegistry {
    /// Create a registry using the TCP transport.
    ///
    /// Must be called from within a tokio runtime; the vacancy listener runs
    /// as a background task.
    pub fn new(launcher: Arc<dyn Launcher>) -> Arc<Self> {
        let policies: Arc<PolicyMap> = Arc::new(DashMap::new());
        let (vacant_tx, vacant_rx) = mpsc::unbounded_channel();
        tokio::spawn(remove_vacant(Arc::downgrade(&policies), vacant_rx));

        Arc::new(Self {
            policies,
            transport: RwLock::new(Arc::new(TcpTransport::new())),
            launcher,
            vacant_tx,
        })
    }

    /// Switch every current and future policy to `transport`
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Arc::clone(&transport);
        for policy in self.policies.iter() {
            policy.set_transport(Arc::clone(&transport));
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.read().clone()
    }

    /// The policy currently registered for `key`
    pub fn policy(&self, key: &str) -> Option<Arc<SimpleScheduler>> {
        self.policies.get(key).map(|p| Arc::clone(p.value()))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    fn policy_for(&self, app: &AppSpec) -> Arc<SimpleScheduler> {
        let key = app.key();
        if let Some(policy) = self.policies.get(&key) {
            return Arc::clone(policy.value());
        }

        // Read the transport before taking the map's shard lock
        let transport = self.transport();
        let policy = self.policies.entry(key.clone()).or_insert_with(|| {
            debug!(app_dir = %app.app_dir().display(), "Creating scheduling policy");
            let policy = SimpleScheduler::new(key, Arc::clone(&self.launcher), Some(self.vacant_tx.clone()));
            policy.set_transport(transport);
            policy
        });
        Arc::clone(policy.value())
    }

    /// Get a worker for `app`, spawning one if necessary
    pub async fn get_worker(&self, app: &AppSpec) -> Result<WorkerHandle, WorkerError> {
        self.admit(app, None)?.handle().await
    }

    /// Get a worker for a request to `url`; new sessions are held to the
    /// soft connection limit
    pub async fn get_worker_for(&self, app: &AppSpec, url: &str) -> Result<WorkerHandle, WorkerError> {
        self.admit(app, Some(url))?.handle().await
    }

    fn admit(&self, app: &AppSpec, url: Option<&str>) -> Result<Arc<WorkerEntry>, WorkerError> {
        loop {
            match self.policy_for(app).admit(app, url) {
                // Removed from the map before the retired flag was released
                Err(WorkerError::Retired) => {
                    trace!(app_dir = %app.app_dir().display(), "Scheduling policy retired, retrying")
                }
                admitted => return admitted,
            }
        }
    }

    /// Force-kill every worker of every application
    pub fn shutdown(&self) {
        info!(policies = self.policies.len(), "Shutting down all workers");
        for policy in self.policies.iter() {
            policy.shutdown();
        }
    }

    pub fn dump(&self) -> Vec<SchedulerDump> {
        let policies: Vec<(String, Arc<SimpleScheduler>)> = self
            .policies
            .iter()
            .map(|p| (p.key().clone(), Arc::clone(p.value())))
            .collect();
        policies
            .into_iter()
            .map(|(key, policy)| SchedulerDump {
                key,
                workers: policy.dump(),
            })
            .collect()
    }
}

/// Drop policies whose scheduler reported an empty table. A worker may have
/// been spawned after the report went out, so check again.
async fn remove_vacant(policies: Weak<PolicyMap>, mut vacant_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(key) = vacant_rx.recv().await {
        let Some(policies) = policies.upgrade() else {
            return;
        };
        remove_if_vacant(&policies, &key);
    }
}

/// The check and the retirement share the policy's admission lock, so a
/// caller holding the old policy cannot spawn into it once it is gone.
fn remove_if_vacant(policies: &PolicyMap, key: &str) -> bool {
    let removed = policies.remove_if(key, |_, policy| policy.retire_if_vacant()).is_some();
    if removed {
        debug!(key = %key.replace('\n', " "), "Removed vacant scheduling policy");
    }
    removed
}
