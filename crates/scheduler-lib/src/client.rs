//! Cluster access for Deployments
//!
//! The toggle protocol only needs to fetch a single Deployment and write it
//! back guarded by its resource version. [`DeploymentClient`] is that seam;
//! [`KubeDeployments`] implements it against the API server.

use crate::workload::WorkloadKey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::error::ErrorResponse;
use kube::{Client, Config};
use std::path::{Path, PathBuf};
use tracing::info;

/// Fetch / conditional-update capability over Deployments
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    /// Fetch the latest version; `Ok(None)` if the object does not exist
    async fn get(&self, key: &WorkloadKey) -> Result<Option<Deployment>, kube::Error>;

    /// Replace the object; fails with a 409 if its resource version is stale
    async fn replace(&self, deployment: &Deployment) -> Result<Deployment, kube::Error>;
}

/// True if the error is an optimistic-concurrency conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// True if the error reports a missing object
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// API server backed Deployment client
#[derive(Clone)]
pub struct KubeDeployments {
    client: Client,
}

impl KubeDeployments {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: Option<&str>) -> Api<Deployment> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl DeploymentClient for KubeDeployments {
    async fn get(&self, key: &WorkloadKey) -> Result<Option<Deployment>, kube::Error> {
        self.api(key.namespace.as_deref()).get_opt(&key.name).await
    }

    async fn replace(&self, deployment: &Deployment) -> Result<Deployment, kube::Error> {
        let key = WorkloadKey::from_deployment(deployment).ok_or_else(|| {
            kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "deployment has no name".to_string(),
                reason: "Invalid".to_string(),
                code: 422,
            })
        })?;
        self.api(key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), deployment)
            .await
    }
}

/// Build a Kubernetes client
///
/// Resolution order: explicit kubeconfig path, then `~/.kube/config` if it
/// exists, then the standard inference chain (`KUBECONFIG`, in-cluster
/// service account).
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let path = kubeconfig.map(Path::to_path_buf).or_else(default_kubeconfig);

    let config = match path {
        Some(path) if path.is_file() => {
            info!(path = %path.display(), "Using kubeconfig file to configure k8s API connection");
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        other => {
            if let Some(path) = other {
                info!(path = %path.display(), "Kubeconfig file not found, inferring configuration");
            }
            Config::infer()
                .await
                .context("Failed to infer Kubernetes configuration")?
        }
    };

    Client::try_from(config).context("Failed to create Kubernetes client")
}

fn default_kubeconfig() -> Option<PathBuf> {
    if std::env::var_os("KUBECONFIG").is_some() {
        return None;
    }
    home::home_dir().map(|home| home.join(".kube").join("config"))
}

#[cfg(any(test, feature = "test-util"))]
pub use fake::InMemoryDeployments;

#[cfg(any(test, feature = "test-util"))]
mod fake {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message,
            reason: reason.to_string(),
            code,
        })
    }

    /// In-memory Deployment store with API-server style resource versions
    ///
    /// Supports injecting conflicts and write failures, and counts the writes
    /// that were actually accepted.
    #[derive(Default)]
    pub struct InMemoryDeployments {
        objects: DashMap<WorkloadKey, Deployment>,
        version: AtomicU64,
        writes: AtomicUsize,
        pending_conflicts: AtomicUsize,
        pending_failures: AtomicUsize,
        fail_gets: AtomicBool,
    }

    impl InMemoryDeployments {
        pub fn new() -> Self {
            Self::default()
        }

        /// Store a Deployment, assigning it a fresh resource version
        pub fn insert(&self, mut deployment: Deployment) -> WorkloadKey {
            let key = WorkloadKey::from_deployment(&deployment).unwrap_or_else(|| WorkloadKey {
                namespace: None,
                name: String::new(),
            });
            deployment.metadata.resource_version = Some(self.next_version());
            self.objects.insert(key.clone(), deployment);
            key
        }

        pub fn remove(&self, key: &WorkloadKey) -> Option<Deployment> {
            self.objects.remove(key).map(|(_, d)| d)
        }

        /// Current stored object
        pub fn snapshot(&self, key: &WorkloadKey) -> Option<Deployment> {
            self.objects.get(key).map(|d| d.clone())
        }

        /// Number of accepted writes
        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        /// Reject the next `n` writes with a 409 conflict
        pub fn fail_next_with_conflict(&self, n: usize) {
            self.pending_conflicts.store(n, Ordering::SeqCst);
        }

        /// Reject the next `n` writes with a 500 error
        pub fn fail_next_with_error(&self, n: usize) {
            self.pending_failures.store(n, Ordering::SeqCst);
        }

        /// Make every fetch fail with a 500 error
        pub fn fail_gets(&self, fail: bool) {
            self.fail_gets.store(fail, Ordering::SeqCst);
        }

        fn next_version(&self) -> String {
            (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
        }

        fn take(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl DeploymentClient for InMemoryDeployments {
        async fn get(&self, key: &WorkloadKey) -> Result<Option<Deployment>, kube::Error> {
            if self.fail_gets.load(Ordering::SeqCst) {
                return Err(api_error(500, "InternalError", "get failed".to_string()));
            }
            Ok(self.snapshot(key))
        }

        async fn replace(&self, deployment: &Deployment) -> Result<Deployment, kube::Error> {
            let key = WorkloadKey::from_deployment(deployment)
                .ok_or_else(|| api_error(422, "Invalid", "deployment has no name".to_string()))?;

            if Self::take(&self.pending_conflicts) {
                return Err(api_error(409, "Conflict", format!("{} was modified", key)));
            }
            if Self::take(&self.pending_failures) {
                return Err(api_error(500, "InternalError", format!("{} write failed", key)));
            }

            let mut entry = self
                .objects
                .get_mut(&key)
                .ok_or_else(|| api_error(404, "NotFound", format!("{} not found", key)))?;
            if entry.metadata.resource_version != deployment.metadata.resource_version {
                return Err(api_error(409, "Conflict", format!("{} was modified", key)));
            }

            let mut stored = deployment.clone();
            stored.metadata.resource_version = Some(self.next_version());
            *entry = stored.clone();
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(stored)
        }
    }
}
