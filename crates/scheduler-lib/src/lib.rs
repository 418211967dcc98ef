//! Library for time-of-day replica scheduling of Kubernetes Deployments
//!
//! This crate provides the core functionality for:
//! - Mirroring Deployments from the cluster
//! - Parsing and evaluating off-schedule windows
//! - Suspending and resuming workloads with conflict-safe writes
//! - The periodic reconciliation loop
//! - Health checks and observability

pub mod client;
pub mod health;
pub mod mirror;
pub mod observability;
pub mod reconciler;
pub mod schedule;
pub mod toggle;
pub mod workload;

pub use client::{connect, DeploymentClient, KubeDeployments};
pub use health::{Component, ComponentStatus, HealthRegistry, HealthReport};
pub use mirror::{MirrorConfig, WorkloadMirror};
pub use observability::{SchedulerMetrics, StructuredLogger};
pub use reconciler::{ReconcileError, Reconciler, ReconcilerConfig, TickReport};
pub use schedule::{parse_schedule, Clock, FixedClock, ScheduleError, SystemClock, TimeRange};
pub use toggle::{attempt_toggle, toggle, toggle_once, RetryPolicy, ToggleError, ToggleOutcome};
pub use workload::{ScaleState, WorkloadKey};
