//! Observability for the replica scheduler
//!
//! Provides:
//! - Prometheus metrics (tick latency, watched workloads, toggles and errors)
//! - Structured JSON logging of scheduling events with tracing

use crate::reconciler::TickReport;
use crate::workload::WorkloadKey;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for tick duration (in seconds)
const TICK_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

static GLOBAL_METRICS: OnceLock<SchedulerMetricsInner> = OnceLock::new();

struct SchedulerMetricsInner {
    ticks: IntCounter,
    tick_duration_seconds: Histogram,
    workloads_watched: IntGauge,
    workloads_enabled: IntGauge,
    toggles: IntCounterVec,
    toggle_errors: IntCounter,
    schedule_errors: IntCounter,
    conflict_retries: IntCounter,
}

impl SchedulerMetricsInner {
    fn new() -> Self {
        Self {
            ticks: register_int_counter!(
                "replica_scheduler_ticks_total",
                "Total number of reconciliation ticks"
            )
            .expect("Failed to register ticks_total"),

            tick_duration_seconds: register_histogram!(
                "replica_scheduler_tick_duration_seconds",
                "Time spent evaluating all workloads in one tick",
                TICK_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_duration_seconds"),

            workloads_watched: register_int_gauge!(
                "replica_scheduler_workloads_watched",
                "Number of Deployments currently in the local mirror"
            )
            .expect("Failed to register workloads_watched"),

            workloads_enabled: register_int_gauge!(
                "replica_scheduler_workloads_enabled",
                "Number of Deployments with scheduling enabled in the last tick"
            )
            .expect("Failed to register workloads_enabled"),

            toggles: register_int_counter_vec!(
                "replica_scheduler_toggles_total",
                "Total number of replica changes written",
                &["action"]
            )
            .expect("Failed to register toggles_total"),

            toggle_errors: register_int_counter!(
                "replica_scheduler_toggle_errors_total",
                "Total number of failed suspend/resume attempts"
            )
            .expect("Failed to register toggle_errors_total"),

            schedule_errors: register_int_counter!(
                "replica_scheduler_schedule_errors_total",
                "Total number of unparsable schedule annotations seen"
            )
            .expect("Failed to register schedule_errors_total"),

            conflict_retries: register_int_counter!(
                "replica_scheduler_conflict_retries_total",
                "Total number of writes retried after a version conflict"
            )
            .expect("Failed to register conflict_retries_total"),
        }
    }
}

/// Handle to the process-wide scheduler metrics
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct SchedulerMetrics {
    _private: (),
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SchedulerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SchedulerMetricsInner {
        GLOBAL_METRICS.get_or_init(SchedulerMetricsInner::new)
    }

    /// Record a finished tick
    pub fn observe_tick(&self, duration_secs: f64, report: &TickReport) {
        let inner = self.inner();
        inner.ticks.inc();
        inner.tick_duration_seconds.observe(duration_secs);
        inner.workloads_enabled.set(report.enabled as i64);
        inner
            .toggles
            .with_label_values(&["suspend"])
            .inc_by(report.suspended as u64);
        inner
            .toggles
            .with_label_values(&["resume"])
            .inc_by(report.resumed as u64);
        inner.toggle_errors.inc_by(report.toggle_errors as u64);
        inner.schedule_errors.inc_by(report.parse_errors as u64);
    }

    pub fn set_workloads_watched(&self, count: usize) {
        self.inner().workloads_watched.set(count as i64);
    }

    /// Count a replica change made outside the reconciliation loop
    pub fn inc_toggle(&self, action: &str) {
        self.inner().toggles.with_label_values(&[action]).inc();
    }

    pub fn inc_toggle_errors(&self) {
        self.inner().toggle_errors.inc();
    }

    pub fn inc_conflict_retries(&self) {
        self.inner().conflict_retries.inc();
    }
}

/// Structured logger for scheduling events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, tick_interval_secs: u64, utc: bool) {
        info!(
            event = "scheduler_started",
            instance = %self.instance,
            version = %version,
            tick_interval_secs,
            clock = if utc { "utc" } else { "local" },
            "Replica scheduler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "scheduler_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Replica scheduler shutting down"
        );
    }

    pub fn log_suspended(&self, key: &WorkloadKey, remembered: i32, source: &str) {
        info!(
            event = "workload_suspended",
            instance = %self.instance,
            namespace = %key.namespace(),
            name = %key.name,
            remembered_replicas = remembered,
            source = %source,
            "Workload scaled to zero"
        );
    }

    pub fn log_resumed(&self, key: &WorkloadKey, replicas: i32, source: &str) {
        info!(
            event = "workload_resumed",
            instance = %self.instance,
            namespace = %key.namespace(),
            name = %key.name,
            replicas,
            source = %source,
            "Workload replicas restored"
        );
    }

    pub fn log_tick(&self, report: &TickReport, elapsed_ms: u128) {
        if report.toggle_errors > 0 || report.parse_errors > 0 {
            warn!(
                event = "tick_complete",
                instance = %self.instance,
                examined = report.examined,
                enabled = report.enabled,
                suspended = report.suspended,
                resumed = report.resumed,
                parse_errors = report.parse_errors,
                toggle_errors = report.toggle_errors,
                elapsed_ms = elapsed_ms as u64,
                "Reconciliation tick finished with errors"
            );
        } else {
            info!(
                event = "tick_complete",
                instance = %self.instance,
                examined = report.examined,
                enabled = report.enabled,
                suspended = report.suspended,
                resumed = report.resumed,
                elapsed_ms = elapsed_ms as u64,
                "Reconciliation tick finished"
            );
        }
    }
}
