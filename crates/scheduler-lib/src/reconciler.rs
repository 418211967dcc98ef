//! Reconciliation loop
//!
//! Once the mirror has synced, every tick walks the mirrored workloads,
//! evaluates each enabled workload's off-schedule window against the clock
//! and drives it toward the matching state. Failures are per workload; one bad
//! workload never stops the others.

use crate::client::DeploymentClient;
use crate::health::{Component, HealthRegistry};
use crate::mirror::WorkloadMirror;
use crate::observability::{SchedulerMetrics, StructuredLogger};
use crate::schedule::{parse_schedule, Clock};
use crate::toggle::{toggle, RetryPolicy, ToggleOutcome};
use crate::workload::{annotations, is_schedule_enabled, ScaleState, WorkloadKey};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for the reconciliation loop
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Period between ticks (default: 5 seconds)
    pub tick_interval: Duration,
    /// How long to wait for the mirror's initial listing (default: 60 seconds)
    pub cache_sync_timeout: Duration,
    /// Backoff for conflicting writes
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            cache_sync_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("timed out after {0:?} waiting for workload cache to sync")]
    CacheSyncTimeout(Duration),
}

/// Counts for one pass over the mirror
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub examined: usize,
    pub enabled: usize,
    pub suspended: usize,
    pub resumed: usize,
    pub unchanged: usize,
    pub parse_errors: usize,
    pub toggle_errors: usize,
}

impl TickReport {
    pub fn errors(&self) -> usize {
        self.parse_errors + self.toggle_errors
    }
}

pub struct Reconciler {
    client: Arc<dyn DeploymentClient>,
    mirror: Arc<WorkloadMirror>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    metrics: SchedulerMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn DeploymentClient>,
        mirror: Arc<WorkloadMirror>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            client,
            mirror,
            clock,
            config,
            metrics: SchedulerMetrics::new(),
            logger: StructuredLogger::new("replica-scheduler"),
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Evaluate every mirrored workload once
    pub async fn reconcile_once(&self) -> TickReport {
        let mut report = TickReport::default();
        let keys = self.mirror.list_keys();
        self.metrics.set_workloads_watched(keys.len());

        for key in keys {
            // deleted since the key listing
            let Some(deployment) = self.mirror.get(&key) else {
                continue;
            };
            report.examined += 1;

            let annotations = annotations(&deployment);
            if !is_schedule_enabled(annotations) {
                continue;
            }
            report.enabled += 1;

            let range = match parse_schedule(annotations) {
                Ok(range) => range,
                Err(e) => {
                    error!(namespace = %key.namespace(), name = %key.name, error = %e, "Failed to parse schedule");
                    report.parse_errors += 1;
                    continue;
                }
            };

            let target = if range.in_range_now(self.clock.as_ref()) {
                ScaleState::Suspended
            } else {
                ScaleState::Running
            };
            debug!(key = %key, schedule = %range, target = %target, "Evaluated schedule");

            self.drive(&key, target, &mut report).await;
        }

        report
    }

    async fn drive(&self, key: &WorkloadKey, target: ScaleState, report: &mut TickReport) {
        match toggle(self.client.as_ref(), key, target, &self.config.retry).await {
            Ok(ToggleOutcome::Suspended { remembered }) => {
                report.suspended += 1;
                self.logger.log_suspended(key, remembered, "schedule");
            }
            Ok(ToggleOutcome::Resumed { replicas }) => {
                report.resumed += 1;
                self.logger.log_resumed(key, replicas, "schedule");
            }
            Ok(_) => report.unchanged += 1,
            Err(e) => {
                let action = match target {
                    ScaleState::Suspended => "scale down",
                    ScaleState::Running => "scale up",
                };
                error!(namespace = %key.namespace(), name = %key.name, action, error = %e, "Failed to toggle deployment");
                report.toggle_errors += 1;
            }
        }
    }

    /// Tick until shutdown; returns an error only if the mirror never syncs
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ReconcileError> {
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            sync_timeout_secs = self.config.cache_sync_timeout.as_secs(),
            "Waiting for workload cache to sync"
        );

        tokio::select! {
            synced = self.mirror.wait_for_sync(self.config.cache_sync_timeout) => {
                if !synced {
                    let err = ReconcileError::CacheSyncTimeout(self.config.cache_sync_timeout);
                    error!(error = %err, "Workload cache did not sync");
                    if let Some(health) = &self.health {
                        health.set_unhealthy(Component::Reconciler, err.to_string()).await;
                    }
                    return Err(err);
                }
            }
            _ = shutdown.recv() => {
                info!("Shutdown requested before workload cache synced");
                return Ok(());
            }
        }

        info!(workloads = self.mirror.len(), "Workload cache synced, starting reconciliation loop");

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let report = self.reconcile_once().await;
                    let elapsed = start.elapsed();

                    self.metrics.observe_tick(elapsed.as_secs_f64(), &report);
                    if report.suspended + report.resumed + report.errors() > 0 {
                        self.logger.log_tick(&report, elapsed.as_millis());
                    } else {
                        debug!(examined = report.examined, enabled = report.enabled, "Reconciliation tick finished");
                    }
                    self.report_health(&report).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down reconciliation loop");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn report_health(&self, report: &TickReport) {
        let Some(health) = &self.health else {
            return;
        };
        if report.errors() == 0 {
            health.set_healthy(Component::Reconciler).await;
        } else {
            warn!(errors = report.errors(), "Reconciliation tick had errors");
            health
                .set_degraded(
                    Component::Reconciler,
                    format!("{} workload(s) failed in last tick", report.errors()),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryDeployments;
    use crate::health::ComponentStatus;
    use crate::schedule::FixedClock;
    use crate::workload::fixtures::deployment;
    use crate::workload::{
        annotation, replicas, ENABLED_ANNOTATION, REPLICAS_MEMORY_ANNOTATION, SCHEDULE_ANNOTATION,
    };
    use chrono::NaiveTime;
    use kube::runtime::watcher::Event;

    struct Harness {
        store: Arc<InMemoryDeployments>,
        mirror: Arc<WorkloadMirror>,
        clock: Arc<FixedClock>,
        reconciler: Reconciler,
    }

    impl Harness {
        fn new(hour: u32, minute: u32) -> Self {
            let store = Arc::new(InMemoryDeployments::new());
            let mirror = Arc::new(WorkloadMirror::default());
            let clock = Arc::new(FixedClock::at(hour, minute));
            let config = ReconcilerConfig {
                tick_interval: Duration::from_millis(10),
                cache_sync_timeout: Duration::from_secs(1),
                retry: RetryPolicy {
                    base_delay: Duration::from_millis(1),
                    ..RetryPolicy::default()
                },
            };
            let reconciler = Reconciler::new(store.clone(), mirror.clone(), clock.clone(), config);
            Self {
                store,
                mirror,
                clock,
                reconciler,
            }
        }

        fn add(&self, name: &str, replicas: i32, annotations: &[(&str, &str)]) -> WorkloadKey {
            self.store.insert(deployment("ns", name, replicas, annotations))
        }

        /// Mirror the current store contents, as a fresh listing would
        fn sync(&self, keys: &[&WorkloadKey]) {
            let listing = keys
                .iter()
                .filter_map(|k| self.store.snapshot(k))
                .collect();
            self.mirror.apply(Event::Restarted(listing));
        }
    }

    fn scheduled(window: &str) -> Vec<(&'static str, String)> {
        vec![
            (ENABLED_ANNOTATION, "true".to_string()),
            (SCHEDULE_ANNOTATION, window.to_string()),
        ]
    }

    fn as_pairs<'a>(v: &'a [(&'static str, String)]) -> Vec<(&'static str, &'a str)> {
        v.iter().map(|(k, s)| (*k, s.as_str())).collect()
    }

    #[tokio::test]
    async fn test_end_to_end_night_window() {
        let h = Harness::new(23, 30);
        let night = scheduled("22:00-06:00");
        let key = h.add("web", 3, &as_pairs(&night));
        h.sync(&[&key]);

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.suspended, 1);
        let stored = h.store.snapshot(&key).unwrap();
        assert_eq!(replicas(&stored), 0);
        assert_eq!(annotation(&stored, REPLICAS_MEMORY_ANNOTATION), Some("3"));

        h.clock.set(NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        h.sync(&[&key]);
        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.resumed, 1);
        let stored = h.store.snapshot(&key).unwrap();
        assert_eq!(replicas(&stored), 3);
        assert_eq!(annotation(&stored, REPLICAS_MEMORY_ANNOTATION), None);
    }

    #[tokio::test]
    async fn test_malformed_schedule_does_not_block_others() {
        let h = Harness::new(23, 30);
        let broken = scheduled("not-a-schedule");
        let night = scheduled("22:00-06:00");
        let a = h.add("a", 2, &as_pairs(&broken));
        let b = h.add("b", 4, &as_pairs(&night));
        h.sync(&[&a, &b]);

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.parse_errors, 1);
        assert_eq!(report.suspended, 1);
        assert_eq!(replicas(&h.store.snapshot(&a).unwrap()), 2);
        assert_eq!(replicas(&h.store.snapshot(&b).unwrap()), 0);
    }

    #[tokio::test]
    async fn test_toggle_failure_does_not_block_others() {
        let h = Harness::new(23, 30);
        let night = scheduled("22:00-06:00");
        let a = h.add("a", 2, &as_pairs(&night));
        let b = h.add("b", 4, &as_pairs(&night));
        h.sync(&[&a, &b]);
        h.store.fail_next_with_error(1);

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.toggle_errors, 1);
        assert_eq!(report.suspended, 1);
        assert_eq!(h.store.writes(), 1);
    }

    #[tokio::test]
    async fn test_disabled_and_unscheduled_workloads_are_skipped() {
        let h = Harness::new(23, 30);
        let plain = h.add("plain", 2, &[]);
        let off = h.add(
            "off",
            2,
            &[(ENABLED_ANNOTATION, "false"), (SCHEDULE_ANNOTATION, "22:00-06:00")],
        );
        let no_window = h.add("no-window", 2, &[(ENABLED_ANNOTATION, "True")]);
        h.sync(&[&plain, &off, &no_window]);

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.examined, 3);
        assert_eq!(report.enabled, 1);
        assert_eq!(report.parse_errors, 1);
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_workload_outside_window_stays_running() {
        let h = Harness::new(12, 0);
        let night = scheduled("22:00-06:00");
        let key = h.add("web", 3, &as_pairs(&night));
        h.sync(&[&key]);

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_workload_deleted_from_cluster_is_noop() {
        let h = Harness::new(23, 30);
        let night = scheduled("22:00-06:00");
        let key = h.add("web", 3, &as_pairs(&night));
        h.sync(&[&key]);
        h.store.remove(&key);

        let report = h.reconciler.reconcile_once().await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.toggle_errors, 0);
    }

    #[tokio::test]
    async fn test_run_fails_when_cache_never_syncs() {
        tokio::time::pause();
        let h = Harness::new(23, 30);
        let health = HealthRegistry::new();
        let reconciler = h.reconciler.with_health(health.clone());
        let (_tx, rx) = broadcast::channel(1);

        let err = reconciler.run(rx).await.unwrap_err();
        assert!(matches!(err, ReconcileError::CacheSyncTimeout(_)));
        assert_eq!(
            health.report().await.components[&Component::Reconciler].status,
            ComponentStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_run_ticks_until_shutdown() {
        let h = Harness::new(23, 30);
        let night = scheduled("22:00-06:00");
        let key = h.add("web", 3, &as_pairs(&night));
        h.sync(&[&key]);

        let health = HealthRegistry::new();
        let reconciler = Arc::new(h.reconciler.with_health(health.clone()));
        let (tx, rx) = broadcast::channel(1);
        let handle = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run(rx).await })
        };

        for _ in 0..100 {
            if replicas(&h.store.snapshot(&key).unwrap()) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(replicas(&h.store.snapshot(&key).unwrap()), 0);

        tx.send(()).unwrap();
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(health.report().await.status, ComponentStatus::Healthy);
    }
}
