//! Suspend / resume protocol
//!
//! A toggle is a read-modify-write of `spec.replicas` plus the
//! `scheduler.replicas-memory` annotation. The write carries the resource
//! version that was read, so a concurrent writer turns it into a 409 and the
//! whole read-modify-write is retried against the fresh object.

use crate::client::{is_conflict, is_not_found, DeploymentClient};
use crate::observability::SchedulerMetrics;
use crate::workload::{apply_plan, ScalePlan, ScaleSnapshot, ScaleState, WorkloadKey};
use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Toggle failures
#[derive(Debug, Error)]
pub enum ToggleError {
    #[error("failed to get latest version of deployment {key}: {source}")]
    FetchFailed {
        key: WorkloadKey,
        #[source]
        source: kube::Error,
    },

    #[error("update of deployment {key} conflicted with a concurrent writer")]
    Conflict { key: WorkloadKey },

    #[error("update of deployment {key} still conflicting after {attempts} attempts")]
    ConflictExhausted { key: WorkloadKey, attempts: u32 },

    #[error("update of deployment {key} failed: {source}")]
    UpdateFailed {
        key: WorkloadKey,
        #[source]
        source: kube::Error,
    },

    #[error("deployment {key} cannot be resumed: {source}")]
    InvalidReplicasMemory {
        key: WorkloadKey,
        #[source]
        source: crate::workload::InvalidMemory,
    },

    #[error("deployment object has no name")]
    Unnamed,
}

/// What a successful toggle did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum ToggleOutcome {
    /// Scaled to zero, remembering the previous count
    Suspended { remembered: i32 },
    /// Scaled back to the remembered count
    Resumed { replicas: i32 },
    /// Already in the target state
    Unchanged,
    /// Suspended without a remembered count; left untouched
    NothingToRestore,
    /// The workload no longer exists
    NotFound,
}

impl ToggleOutcome {
    /// True if the toggle wrote to the cluster
    pub fn changed(&self) -> bool {
        matches!(
            self,
            ToggleOutcome::Suspended { .. } | ToggleOutcome::Resumed { .. }
        )
    }
}

/// Bounded exponential backoff for conflicting writes
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default: 5)
    pub max_attempts: u32,
    /// Delay before the first retry (default: 10ms)
    pub base_delay: Duration,
    /// Multiplier applied after each retry (default: 2)
    pub factor: u32,
    /// Upper bound for a single delay (default: 1s)
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            factor: 2,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

/// Perform one read-modify-write on a Deployment already in hand
///
/// No re-fetch and no retry: a stale object surfaces as
/// [`ToggleError::Conflict`].
pub async fn attempt_toggle(
    client: &dyn DeploymentClient,
    mut deployment: Deployment,
    target: ScaleState,
) -> Result<ToggleOutcome, ToggleError> {
    let key = WorkloadKey::from_deployment(&deployment).ok_or(ToggleError::Unnamed)?;

    let plan = ScaleSnapshot::of(&deployment)
        .plan(target)
        .map_err(|source| ToggleError::InvalidReplicasMemory {
            key: key.clone(),
            source,
        })?;

    let outcome = match plan {
        ScalePlan::Unchanged => return Ok(ToggleOutcome::Unchanged),
        ScalePlan::NothingToRestore => {
            warn!(
                namespace = %key.namespace(),
                name = %key.name,
                "No remembered replica count, leaving deployment scaled down"
            );
            return Ok(ToggleOutcome::NothingToRestore);
        }
        ScalePlan::Suspend { remember } => {
            info!(namespace = %key.namespace(), name = %key.name, replicas = remember, "Scaling down deployment");
            ToggleOutcome::Suspended {
                remembered: remember,
            }
        }
        ScalePlan::Resume { replicas } => {
            info!(namespace = %key.namespace(), name = %key.name, replicas, "Scaling up deployment");
            ToggleOutcome::Resumed { replicas }
        }
    };

    apply_plan(&mut deployment, &plan);

    match client.replace(&deployment).await {
        Ok(_) => Ok(outcome),
        Err(e) if is_conflict(&e) => Err(ToggleError::Conflict { key }),
        Err(source) => Err(ToggleError::UpdateFailed { key, source }),
    }
}

/// Fetch the latest version of a Deployment and toggle it once
pub async fn toggle_once(
    client: &dyn DeploymentClient,
    key: &WorkloadKey,
    target: ScaleState,
) -> Result<ToggleOutcome, ToggleError> {
    let deployment = match client.get(key).await {
        Ok(Some(d)) => d,
        Ok(None) => {
            debug!(key = %key, "Deployment no longer exists, nothing to toggle");
            return Ok(ToggleOutcome::NotFound);
        }
        Err(e) if is_not_found(&e) => {
            debug!(key = %key, "Deployment no longer exists, nothing to toggle");
            return Ok(ToggleOutcome::NotFound);
        }
        Err(source) => {
            return Err(ToggleError::FetchFailed {
                key: key.clone(),
                source,
            })
        }
    };

    attempt_toggle(client, deployment, target).await
}

/// Toggle a Deployment, retrying the whole read-modify-write on conflicts
pub async fn toggle(
    client: &dyn DeploymentClient,
    key: &WorkloadKey,
    target: ScaleState,
    policy: &RetryPolicy,
) -> Result<ToggleOutcome, ToggleError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match toggle_once(client, key, target).await {
            Err(ToggleError::Conflict { .. }) if attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                debug!(
                    key = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Update conflicted, retrying with latest version"
                );
                SchedulerMetrics::new().inc_conflict_retries();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(ToggleError::Conflict { key }) => {
                return Err(ToggleError::ConflictExhausted {
                    key,
                    attempts: max_attempts,
                })
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryDeployments;
    use crate::workload::fixtures::deployment;
    use crate::workload::{annotation, replicas, REPLICAS_MEMORY_ANNOTATION};

    fn store_with(replicas: i32, annotations: &[(&str, &str)]) -> (InMemoryDeployments, WorkloadKey) {
        let store = InMemoryDeployments::new();
        let key = store.insert(deployment("ns", "web", replicas, annotations));
        (store, key)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(3), Duration::from_millis(40));
        assert_eq!(policy.delay_after(20), Duration::from_secs(1));
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_suspend_is_idempotent() {
        let (store, key) = store_with(5, &[]);
        let policy = fast_policy();

        let first = toggle(&store, &key, ScaleState::Suspended, &policy).await.unwrap();
        assert_eq!(first, ToggleOutcome::Suspended { remembered: 5 });

        let second = toggle(&store, &key, ScaleState::Suspended, &policy).await.unwrap();
        assert_eq!(second, ToggleOutcome::Unchanged);

        let stored = store.snapshot(&key).unwrap();
        assert_eq!(replicas(&stored), 0);
        assert_eq!(annotation(&stored, REPLICAS_MEMORY_ANNOTATION), Some("5"));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_resume_when_running_is_noop() {
        let (store, key) = store_with(3, &[]);

        let outcome = toggle(&store, &key, ScaleState::Running, &fast_policy()).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Unchanged);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_suspend_resume_round_trip() {
        let (store, key) = store_with(5, &[]);
        let policy = fast_policy();

        toggle(&store, &key, ScaleState::Suspended, &policy).await.unwrap();
        let outcome = toggle(&store, &key, ScaleState::Running, &policy).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Resumed { replicas: 5 });

        let stored = store.snapshot(&key).unwrap();
        assert_eq!(replicas(&stored), 5);
        assert_eq!(annotation(&stored, REPLICAS_MEMORY_ANNOTATION), None);
    }

    #[tokio::test]
    async fn test_suspend_overwrites_stale_memory() {
        let (store, key) = store_with(4, &[(REPLICAS_MEMORY_ANNOTATION, "9")]);

        toggle(&store, &key, ScaleState::Suspended, &fast_policy()).await.unwrap();
        let stored = store.snapshot(&key).unwrap();
        assert_eq!(annotation(&stored, REPLICAS_MEMORY_ANNOTATION), Some("4"));
    }

    #[tokio::test]
    async fn test_resume_without_memory_leaves_workload_alone() {
        let (store, key) = store_with(0, &[]);

        let outcome = toggle(&store, &key, ScaleState::Running, &fast_policy()).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::NothingToRestore);
        assert_eq!(replicas(&store.snapshot(&key).unwrap()), 0);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_resume_with_invalid_memory_fails() {
        let (store, key) = store_with(0, &[(REPLICAS_MEMORY_ANNOTATION, "three")]);

        let err = toggle(&store, &key, ScaleState::Running, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, ToggleError::InvalidReplicasMemory { .. }));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_missing_workload_is_noop() {
        let store = InMemoryDeployments::new();
        let key = WorkloadKey::new("ns", "gone");

        let outcome = toggle(&store, &key, ScaleState::Suspended, &fast_policy()).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_conflicts_below_bound_are_retried() {
        let (store, key) = store_with(2, &[]);
        store.fail_next_with_conflict(3);

        let outcome = toggle(&store, &key, ScaleState::Suspended, &fast_policy()).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Suspended { remembered: 2 });
        assert_eq!(replicas(&store.snapshot(&key).unwrap()), 0);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_exhaust_retries() {
        let (store, key) = store_with(2, &[]);
        store.fail_next_with_conflict(10);

        let err = toggle(&store, &key, ScaleState::Suspended, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToggleError::ConflictExhausted { attempts: 5, .. }
        ));
        assert_eq!(replicas(&store.snapshot(&key).unwrap()), 2);
    }

    #[tokio::test]
    async fn test_other_write_failures_are_not_retried() {
        let (store, key) = store_with(2, &[]);
        store.fail_next_with_error(1);

        let err = toggle(&store, &key, ScaleState::Suspended, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, ToggleError::UpdateFailed { .. }));

        // the injected failure was consumed by the single attempt
        let outcome = toggle(&store, &key, ScaleState::Suspended, &fast_policy()).await.unwrap();
        assert!(outcome.changed());
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces() {
        let (store, key) = store_with(2, &[]);
        store.fail_gets(true);

        let err = toggle(&store, &key, ScaleState::Suspended, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, ToggleError::FetchFailed { .. }));
    }

    #[tokio::test]
    async fn test_attempt_toggle_with_stale_object_conflicts() {
        let (store, key) = store_with(2, &[]);
        let stale = store.snapshot(&key).unwrap();

        // a concurrent writer bumps the resource version
        let fresh = store.snapshot(&key).unwrap();
        store.replace(&fresh).await.unwrap();

        let err = attempt_toggle(&store, stale, ScaleState::Suspended).await.unwrap_err();
        assert!(matches!(err, ToggleError::Conflict { .. }));
        assert_eq!(replicas(&store.snapshot(&key).unwrap()), 2);
    }

    #[tokio::test]
    async fn test_toggle_once_does_not_retry() {
        let (store, key) = store_with(2, &[]);
        store.fail_next_with_conflict(1);

        let err = toggle_once(&store, &key, ScaleState::Suspended).await.unwrap_err();
        assert!(matches!(err, ToggleError::Conflict { .. }));

        let outcome = toggle_once(&store, &key, ScaleState::Suspended).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Suspended { remembered: 2 });
    }
}
