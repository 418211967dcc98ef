//! Manual scale-down / scale-up through the scheduler API

use anyhow::{bail, Result};
use scheduler_lib::toggle::ToggleOutcome;
use scheduler_lib::workload::{ScaleState, WorkloadKey};

use crate::client::ApiClient;
use crate::output::{
    describe_outcome, print_info, print_json, print_success, print_warning, OutputFormat,
};

/// Parse a `<namespace>/<name>` argument; the namespace is mandatory
pub fn parse_workload(workload: &str) -> Result<WorkloadKey> {
    let key: WorkloadKey = workload.parse()?;
    if key.namespace.is_none() {
        bail!("expected <namespace>/<name>, got '{}'", workload);
    }
    Ok(key)
}

/// Ask the scheduler to move a workload into `target` once
pub async fn scale(
    client: &ApiClient,
    workload: &str,
    target: ScaleState,
    format: OutputFormat,
) -> Result<()> {
    let key = parse_workload(workload)?;
    let response = match target {
        ScaleState::Suspended => client.scale_down(key.namespace(), &key.name).await?,
        ScaleState::Running => client.scale_up(key.namespace(), &key.name).await?,
    };

    match format {
        OutputFormat::Json => print_json(&response),
        OutputFormat::Table => {
            let message = format!("{}: {}", key, describe_outcome(&response.outcome));
            match response.outcome {
                ToggleOutcome::Suspended { .. } | ToggleOutcome::Resumed { .. } => {
                    print_success(&message)
                }
                ToggleOutcome::Unchanged => print_info(&message),
                ToggleOutcome::NothingToRestore | ToggleOutcome::NotFound => {
                    print_warning(&message)
                }
            }
        }
    }

    Ok(())
}
