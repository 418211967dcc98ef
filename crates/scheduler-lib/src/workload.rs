//! Workload model: identity, scheduler annotations and scale state
//!
//! A workload is an `apps/v1` Deployment. The scheduler only ever reads and
//! rewrites `spec.replicas` and the `scheduler.replicas-memory` annotation.

use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Annotation holding the replica count to restore when resuming
pub const REPLICAS_MEMORY_ANNOTATION: &str = "scheduler.replicas-memory";
/// Annotation holding the `HH:MM-HH:MM` suspend window
pub const SCHEDULE_ANNOTATION: &str = "scheduler.off-schedule";
/// Annotation that puts a workload under scheduler control
pub const ENABLED_ANNOTATION: &str = "scheduler.enabled";

/// Replica count Kubernetes assumes when `spec.replicas` is unset
pub const DEFAULT_REPLICAS: i32 = 1;

/// Namespace + name of a workload, rendered as `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Build the key of a Deployment object, if it carries a name
    pub fn from_deployment(deployment: &Deployment) -> Option<Self> {
        let name = deployment.metadata.name.clone()?;
        Some(Self {
            namespace: deployment.metadata.namespace.clone(),
            name,
        })
    }

    /// Namespace, or the empty string for namespace-less keys
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Error returned when a `namespace/name` key cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid workload key '{0}', expected namespace/name")]
pub struct InvalidKey(pub String);

impl FromStr for WorkloadKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self {
                namespace: None,
                name: name.to_string(),
            }),
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
                Ok(Self::new(ns, name))
            }
            _ => Err(InvalidKey(s.to_string())),
        }
    }
}

/// Whether a workload is, or must be, scaled down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleState {
    Running,
    Suspended,
}

impl fmt::Display for ScaleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleState::Running => f.write_str("running"),
            ScaleState::Suspended => f.write_str("suspended"),
        }
    }
}

/// What a toggle must do to reach its target state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalePlan {
    /// Already in the target state; no write
    Unchanged,
    /// Scale to zero and memorize the current replica count
    Suspend { remember: i32 },
    /// Restore the memorized replica count and drop the memory annotation
    Resume { replicas: i32 },
    /// Suspended, but there is no memorized count to restore; no write
    NothingToRestore,
}

/// Memory annotation present but not a decimal integer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("annotation scheduler.replicas-memory has non-integer value '{0}'")]
pub struct InvalidMemory(pub String);

/// Scale-relevant view of a Deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleSnapshot {
    pub replicas: i32,
    /// Raw `replicas-memory` annotation value
    pub remembered: Option<String>,
}

impl ScaleSnapshot {
    pub fn of(deployment: &Deployment) -> Self {
        Self {
            replicas: replicas(deployment),
            remembered: annotation(deployment, REPLICAS_MEMORY_ANNOTATION).map(str::to_string),
        }
    }

    pub fn state(&self) -> ScaleState {
        if self.replicas == 0 {
            ScaleState::Suspended
        } else {
            ScaleState::Running
        }
    }

    /// Decide the mutation needed to move this workload into `target`
    pub fn plan(&self, target: ScaleState) -> Result<ScalePlan, InvalidMemory> {
        match (self.state(), target) {
            (ScaleState::Suspended, ScaleState::Suspended)
            | (ScaleState::Running, ScaleState::Running) => Ok(ScalePlan::Unchanged),
            (ScaleState::Running, ScaleState::Suspended) => Ok(ScalePlan::Suspend {
                remember: self.replicas,
            }),
            (ScaleState::Suspended, ScaleState::Running) => match &self.remembered {
                None => Ok(ScalePlan::NothingToRestore),
                Some(raw) => raw
                    .trim()
                    .parse::<i32>()
                    .ok()
                    .filter(|n| *n >= 0)
                    .map(|replicas| ScalePlan::Resume { replicas })
                    .ok_or_else(|| InvalidMemory(raw.clone())),
            },
        }
    }
}

/// Desired replica count of a Deployment
pub fn replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(DEFAULT_REPLICAS)
}

/// Look up a single annotation value
pub fn annotation<'a>(deployment: &'a Deployment, key: &str) -> Option<&'a str> {
    deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Annotations of a Deployment, empty if none are set
pub fn annotations(deployment: &Deployment) -> &BTreeMap<String, String> {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    deployment.metadata.annotations.as_ref().unwrap_or(&EMPTY)
}

/// True iff `scheduler.enabled` is set to "true" (case-insensitive)
pub fn is_schedule_enabled(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(ENABLED_ANNOTATION)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Apply a plan to a Deployment in place; returns true if it was mutated
pub fn apply_plan(deployment: &mut Deployment, plan: &ScalePlan) -> bool {
    match plan {
        ScalePlan::Unchanged | ScalePlan::NothingToRestore => false,
        ScalePlan::Suspend { remember } => {
            deployment
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(REPLICAS_MEMORY_ANNOTATION.to_string(), remember.to_string());
            deployment.spec.get_or_insert_with(Default::default).replicas = Some(0);
            true
        }
        ScalePlan::Resume { replicas } => {
            if let Some(annotations) = deployment.metadata.annotations.as_mut() {
                annotations.remove(REPLICAS_MEMORY_ANNOTATION);
            }
            deployment.spec.get_or_insert_with(Default::default).replicas = Some(*replicas);
            true
        }
    }
}

/// Builders for tests here and in downstream crates
#[cfg(any(test, feature = "test-util"))]
pub mod fixtures {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    /// Deployment with the given replicas and annotations
    pub fn deployment(ns: &str, name: &str, replicas: i32, annotations: &[(&str, &str)]) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::deployment;
    use super::*;

    #[test]
    fn test_key_display_and_parse() {
        let key = WorkloadKey::new("apps", "web");
        assert_eq!(key.to_string(), "apps/web");
        assert_eq!("apps/web".parse::<WorkloadKey>().unwrap(), key);

        let bare: WorkloadKey = "web".parse().unwrap();
        assert_eq!(bare.namespace, None);
        assert_eq!(bare.to_string(), "web");

        assert!("a/b/c".parse::<WorkloadKey>().is_err());
        assert!("/web".parse::<WorkloadKey>().is_err());
        assert!("".parse::<WorkloadKey>().is_err());
    }

    #[test]
    fn test_enabled_annotation_is_case_insensitive() {
        let d = deployment("ns", "a", 1, &[(ENABLED_ANNOTATION, "TRUE")]);
        assert!(is_schedule_enabled(annotations(&d)));

        let d = deployment("ns", "a", 1, &[(ENABLED_ANNOTATION, "yes")]);
        assert!(!is_schedule_enabled(annotations(&d)));

        let d = deployment("ns", "a", 1, &[]);
        assert!(!is_schedule_enabled(annotations(&d)));
    }

    #[test]
    fn test_missing_replicas_defaults_to_one() {
        let mut d = deployment("ns", "a", 3, &[]);
        d.spec = None;
        assert_eq!(replicas(&d), DEFAULT_REPLICAS);
        assert_eq!(ScaleSnapshot::of(&d).state(), ScaleState::Running);
    }

    #[test]
    fn test_plan_suspend_running_workload() {
        let snap = ScaleSnapshot {
            replicas: 4,
            remembered: None,
        };
        assert_eq!(
            snap.plan(ScaleState::Suspended).unwrap(),
            ScalePlan::Suspend { remember: 4 }
        );
        assert_eq!(snap.plan(ScaleState::Running).unwrap(), ScalePlan::Unchanged);
    }

    #[test]
    fn test_plan_resume_uses_memory() {
        let snap = ScaleSnapshot {
            replicas: 0,
            remembered: Some("7".to_string()),
        };
        assert_eq!(
            snap.plan(ScaleState::Running).unwrap(),
            ScalePlan::Resume { replicas: 7 }
        );
        assert_eq!(snap.plan(ScaleState::Suspended).unwrap(), ScalePlan::Unchanged);
    }

    #[test]
    fn test_plan_resume_without_memory() {
        let snap = ScaleSnapshot {
            replicas: 0,
            remembered: None,
        };
        assert_eq!(
            snap.plan(ScaleState::Running).unwrap(),
            ScalePlan::NothingToRestore
        );
    }

    #[test]
    fn test_plan_resume_with_garbage_memory() {
        let snap = ScaleSnapshot {
            replicas: 0,
            remembered: Some("lots".to_string()),
        };
        assert_eq!(
            snap.plan(ScaleState::Running),
            Err(InvalidMemory("lots".to_string()))
        );
    }

    #[test]
    fn test_apply_suspend_then_resume() {
        let mut d = deployment("ns", "a", 5, &[]);

        assert!(apply_plan(&mut d, &ScalePlan::Suspend { remember: 5 }));
        assert_eq!(replicas(&d), 0);
        assert_eq!(annotation(&d, REPLICAS_MEMORY_ANNOTATION), Some("5"));

        assert!(apply_plan(&mut d, &ScalePlan::Resume { replicas: 5 }));
        assert_eq!(replicas(&d), 5);
        assert_eq!(annotation(&d, REPLICAS_MEMORY_ANNOTATION), None);
    }

    #[test]
    fn test_apply_suspend_creates_annotation_map() {
        let mut d = deployment("ns", "a", 2, &[]);
        d.metadata.annotations = None;

        apply_plan(&mut d, &ScalePlan::Suspend { remember: 2 });
        assert_eq!(annotation(&d, REPLICAS_MEMORY_ANNOTATION), Some("2"));
    }
}
