//! Schedule status of Deployments, read straight from the cluster

use anyhow::{Context, Result};
use chrono::{Local, NaiveTime, Utc};
use colored::Colorize;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams};
use scheduler_lib::schedule::{parse_schedule, ScheduleError};
use scheduler_lib::workload::{
    annotation, annotations, is_schedule_enabled, ScaleSnapshot, WorkloadKey,
    REPLICAS_MEMORY_ANNOTATION,
};
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

use crate::output::{color_bool, color_state, print_json, print_table, OutputFormat};

/// Scheduling view of one Deployment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadStatus {
    pub namespace: String,
    pub name: String,
    pub enabled: bool,
    /// Canonical window, or the raw text if it does not parse
    pub schedule: Option<String>,
    pub schedule_valid: bool,
    /// Whether the window contains the current time; unknown without a valid window
    pub in_window: Option<bool>,
    pub state: String,
    pub replicas: i32,
    pub remembered_replicas: Option<String>,
}

#[derive(Tabled, Serialize)]
struct StatusRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Schedule")]
    schedule: String,
    #[tabled(rename = "In Window")]
    in_window: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Replicas")]
    replicas: i32,
    #[tabled(rename = "Memory")]
    remembered: String,
}

impl From<&WorkloadStatus> for StatusRow {
    fn from(s: &WorkloadStatus) -> Self {
        let schedule = match (&s.schedule, s.schedule_valid) {
            (Some(text), true) => text.clone(),
            (Some(text), false) => format!("{} (invalid)", text).red().to_string(),
            (None, _) => "-".to_string(),
        };
        Self {
            namespace: s.namespace.clone(),
            name: s.name.clone(),
            enabled: color_bool(s.enabled),
            schedule,
            in_window: s.in_window.map(color_bool).unwrap_or_else(|| "-".to_string()),
            state: color_state(&s.state),
            replicas: s.replicas,
            remembered: s.remembered_replicas.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Build the status of each Deployment at wall-clock time `now`
///
/// Deployments without `scheduler.enabled` are left out unless `include_all`.
pub fn collect_status(deployments: &[Deployment], now: NaiveTime, include_all: bool) -> Vec<WorkloadStatus> {
    let mut rows: Vec<WorkloadStatus> = deployments
        .iter()
        .filter_map(|d| {
            let key = WorkloadKey::from_deployment(d)?;
            let annotations = annotations(d);
            let enabled = is_schedule_enabled(annotations);
            if !enabled && !include_all {
                return None;
            }

            let (schedule, schedule_valid, in_window) = match parse_schedule(annotations) {
                Ok(range) => (Some(range.to_string()), true, Some(range.contains(now))),
                Err(ScheduleError::MissingAnnotation) => (None, false, None),
                Err(ScheduleError::InvalidFormat { text, .. }) => (Some(text), false, None),
            };
            let snapshot = ScaleSnapshot::of(d);

            Some(WorkloadStatus {
                namespace: key.namespace().to_string(),
                name: key.name,
                enabled,
                schedule,
                schedule_valid,
                in_window,
                state: snapshot.state().to_string(),
                replicas: snapshot.replicas,
                remembered_replicas: annotation(d, REPLICAS_MEMORY_ANNOTATION).map(str::to_string),
            })
        })
        .collect();

    rows.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    rows
}

/// List Deployments and print their schedule status
pub async fn show_status(
    kubeconfig: Option<&Path>,
    namespace: Option<&str>,
    include_all: bool,
    utc: bool,
    format: OutputFormat,
) -> Result<()> {
    let client = scheduler_lib::client::connect(kubeconfig).await?;
    let api: Api<Deployment> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let deployments = api
        .list(&ListParams::default())
        .await
        .context("Failed to list deployments")?
        .items;

    let now = if utc { Utc::now().time() } else { Local::now().time() };
    let statuses = collect_status(&deployments, now, include_all);

    match format {
        OutputFormat::Json => print_json(&statuses),
        OutputFormat::Table => {
            println!(
                "{} {} ({})",
                "Now:".bold(),
                now.format("%H:%M"),
                if utc { "UTC" } else { "local" }
            );
            let rows: Vec<StatusRow> = statuses.iter().map(StatusRow::from).collect();
            print_table(&rows, format);
        }
    }

    Ok(())
}
