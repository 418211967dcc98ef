//! Local mirror of cluster Deployments
//!
//! Fed by a kube-runtime watcher: the initial list, then incremental
//! create/update/delete events. The watch is restarted every resync period,
//! which re-lists and replaces the whole index to heal missed events.
//! Readers never see an error; a stale or empty view is preferred.

use crate::workload::WorkloadKey;
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Api;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

/// Default period between full re-lists
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Configuration for the workload mirror
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Period between full re-lists (default: 5 minutes)
    pub resync_period: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC_PERIOD,
        }
    }
}

/// How a watch stream stopped being driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// The shutdown signal fired
    Shutdown,
    /// The stream ended on its own
    Ended,
}

/// Eventually-consistent index of Deployments keyed by `namespace/name`
pub struct WorkloadMirror {
    index: DashMap<WorkloadKey, Deployment>,
    synced: watch::Sender<bool>,
    config: MirrorConfig,
}

impl WorkloadMirror {
    pub fn new(config: MirrorConfig) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            index: DashMap::new(),
            synced,
            config,
        }
    }

    /// True once the initial listing has been applied
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial listing has been applied; false on timeout
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.synced.subscribe();
        let synced = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await,
            Ok(Ok(_))
        );
        synced
    }

    /// Keys of all known workloads, in no particular order
    pub fn list_keys(&self) -> Vec<WorkloadKey> {
        self.index.iter().map(|r| r.key().clone()).collect()
    }

    /// Point lookup
    pub fn get(&self, key: &WorkloadKey) -> Option<Deployment> {
        self.index.get(key).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Apply one watcher event to the index
    pub fn apply(&self, event: Event<Deployment>) {
        match event {
            Event::Applied(deployment) => {
                if let Some(key) = WorkloadKey::from_deployment(&deployment) {
                    debug!(key = %key, "Workload applied");
                    self.index.insert(key, deployment);
                }
            }
            Event::Deleted(deployment) => {
                if let Some(key) = WorkloadKey::from_deployment(&deployment) {
                    debug!(key = %key, "Workload deleted");
                    self.index.remove(&key);
                }
            }
            Event::Restarted(deployments) => {
                let fresh: Vec<(WorkloadKey, Deployment)> = deployments
                    .into_iter()
                    .filter_map(|d| WorkloadKey::from_deployment(&d).map(|k| (k, d)))
                    .collect();
                let keep: HashSet<&WorkloadKey> = fresh.iter().map(|(k, _)| k).collect();
                self.index.retain(|k, _| keep.contains(k));
                let count = fresh.len();
                for (key, deployment) in fresh {
                    self.index.insert(key, deployment);
                }

                debug!(count, "Workload listing applied");
                self.synced.send_if_modified(|synced| {
                    let first = !*synced;
                    *synced = true;
                    first
                });
            }
        }
    }

    /// Drive a watch stream into the index until it ends or shutdown fires
    pub async fn drive<S>(&self, stream: S, shutdown: &mut broadcast::Receiver<()>) -> DriveOutcome
    where
        S: Stream<Item = Result<Event<Deployment>, watcher::Error>>,
    {
        tokio::pin!(stream);
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!(error = %e, "Workload watch error, retrying"),
                    None => return DriveOutcome::Ended,
                },
                _ = shutdown.recv() => return DriveOutcome::Shutdown,
            }
        }
    }

    /// Watch Deployments through `api` until shutdown
    pub async fn run(&self, api: Api<Deployment>, shutdown: broadcast::Receiver<()>) {
        self.run_with(
            || watcher::watcher(api.clone(), watcher::Config::default()).default_backoff(),
            shutdown,
        )
        .await
    }

    /// Drive streams from `open_watch` until shutdown, opening a fresh one every
    /// resync period or whenever the current one ends
    pub async fn run_with<F, S>(&self, mut open_watch: F, mut shutdown: broadcast::Receiver<()>)
    where
        F: FnMut() -> S,
        S: Stream<Item = Result<Event<Deployment>, watcher::Error>>,
    {
        info!(
            resync_secs = self.config.resync_period.as_secs(),
            "Starting workload mirror"
        );

        loop {
            let stream = open_watch();

            tokio::select! {
                outcome = self.drive(stream, &mut shutdown) => match outcome {
                    DriveOutcome::Shutdown => break,
                    DriveOutcome::Ended => warn!("Workload watch stream ended, restarting"),
                },
                _ = tokio::time::sleep(self.config.resync_period) => {
                    debug!("Resyncing workload mirror");
                }
            }
        }

        info!("Shutting down workload mirror");
    }
}

impl Default for WorkloadMirror {
    fn default() -> Self {
        Self::new(MirrorConfig::default())
    }
}
