//! Component health and the readiness gate
//!
//! Three components report in: the workload mirror, the reconciliation loop
//! and the control API. Readiness additionally needs the gate to be open,
//! which happens once the mirror's first listing lands (or an operator opens
//! it by hand) and is undone by a hold.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Parts of the scheduler that report health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Mirror,
    Reconciler,
    ControlApi,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Component::Mirror => "mirror",
            Component::Reconciler => "reconciler",
            Component::ControlApi => "control_api",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but the last cycle reported errors
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

/// Last reported state of one component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the status last changed
    pub since: DateTime<Utc>,
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Gate {
    AwaitingSync,
    Open,
    Held(String),
}

/// Shared component health plus the readiness gate
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<Component, ComponentReport>>>,
    gate: Arc<RwLock<Gate>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(BTreeMap::new())),
            gate: Arc::new(RwLock::new(Gate::AwaitingSync)),
        }
    }

    /// Start tracking `component` as healthy
    pub async fn register(&self, component: Component) {
        self.record(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_healthy(&self, component: Component) {
        self.record(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, component: Component, message: impl Into<String>) {
        self.record(component, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, component: Component, message: impl Into<String>) {
        self.record(component, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    // `since` only moves when the status does, so a component that stays
    // degraded across ticks keeps its original timestamp.
    async fn record(&self, component: Component, status: ComponentStatus, message: Option<String>) {
        let mut components = self.components.write().await;
        let since = match components.get(&component) {
            Some(previous) if previous.status == status => previous.since,
            _ => Utc::now(),
        };
        components.insert(
            component,
            ComponentReport {
                status,
                message,
                since,
            },
        );
    }

    /// Open the readiness gate
    pub async fn open(&self) {
        *self.gate.write().await = Gate::Open;
    }

    /// Close the readiness gate until the next `open`
    pub async fn hold(&self, reason: impl Into<String>) {
        *self.gate.write().await = Gate::Held(reason.into());
    }

    /// Worst component status wins; no components means healthy
    pub async fn report(&self) -> HealthReport {
        let components = self.components.read().await.clone();
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthReport { status, components }
    }

    /// Why the scheduler should not receive traffic, if anything
    pub async fn not_ready_reason(&self) -> Option<String> {
        match &*self.gate.read().await {
            Gate::AwaitingSync => return Some("waiting for workload cache sync".to_string()),
            Gate::Held(reason) => return Some(reason.clone()),
            Gate::Open => {}
        }

        self.components
            .read()
            .await
            .iter()
            .find(|(_, c)| !c.status.is_operational())
            .map(|(component, c)| match &c.message {
                Some(message) => format!("{} unhealthy: {}", component, message),
                None => format!("{} unhealthy", component),
            })
    }

    pub async fn is_ready(&self) -> bool {
        self.not_ready_reason().await.is_none()
    }
}
