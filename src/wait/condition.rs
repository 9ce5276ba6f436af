//! Pure readiness predicates over fetched cluster state.

use serde::Deserialize;
use serde_json::Value;

use super::WaitSpec;
use crate::cluster::DeploymentReplicas;

/// One fetched piece of cluster state.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Deployment(Option<DeploymentReplicas>),
    Kinds(Vec<String>),
    Resource(Option<Value>),
    Collection(Vec<Value>),
}

/// Outcome of evaluating one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady(reason.into())
    }
}

/// One entry of a resource's `status.conditions` list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Decode `status.conditions` of a resource.
///
/// Returns `None` when the list is missing or any entry lacks `type`/`status`.
pub fn decode_conditions(obj: &Value) -> Option<Vec<StatusCondition>> {
    let list = obj.get("status")?.get("conditions")?.as_array()?;
    list.iter()
        .map(|c| serde_json::from_value(c.clone()).ok())
        .collect()
}

/// Evaluate a condition against a matching snapshot.
///
/// A snapshot of the wrong shape is never ready.
pub fn evaluate(spec: &WaitSpec, snapshot: &Snapshot) -> Readiness {
    match (spec, snapshot) {
        (WaitSpec::DeploymentAvailable { .. }, Snapshot::Deployment(replicas)) => {
            deployment_available(replicas.as_ref())
        }
        (WaitSpec::ApiKindPresent { kind }, Snapshot::Kinds(kinds)) => {
            if kinds.iter().any(|k| k == kind) {
                Readiness::Ready
            } else {
                Readiness::not_ready(format!("kind {kind} not served yet"))
            }
        }
        (
            WaitSpec::ResourceCondition {
                condition_type,
                want_status,
                ..
            },
            Snapshot::Resource(obj),
        ) => match obj {
            Some(obj) => has_condition(obj, condition_type, want_status),
            None => Readiness::not_ready("resource not found"),
        },
        (
            WaitSpec::AllOfKind {
                condition_type,
                want_status,
                ..
            },
            Snapshot::Collection(items),
        ) => all_have_condition(items, condition_type, want_status),
        _ => Readiness::not_ready("snapshot does not match condition"),
    }
}

fn deployment_available(replicas: Option<&DeploymentReplicas>) -> Readiness {
    match replicas {
        None => Readiness::not_ready("deployment not found"),
        Some(r) if r.available == r.desired => Readiness::Ready,
        Some(r) => Readiness::not_ready(format!("{}/{} replicas available", r.available, r.desired)),
    }
}

fn has_condition(obj: &Value, condition_type: &str, want_status: &str) -> Readiness {
    let Some(conditions) = decode_conditions(obj) else {
        return Readiness::not_ready("no readable status conditions");
    };

    match conditions.iter().find(|c| c.condition_type == condition_type) {
        Some(c) if c.status == want_status => Readiness::Ready,
        Some(c) => Readiness::not_ready(format!(
            "{condition_type}={} ({})",
            c.status,
            c.reason.as_deref().unwrap_or("no reason")
        )),
        None => Readiness::not_ready(format!("condition {condition_type} not reported")),
    }
}

fn all_have_condition(items: &[Value], condition_type: &str, want_status: &str) -> Readiness {
    if items.is_empty() {
        return Readiness::not_ready("no resources listed yet");
    }

    let pending = items
        .iter()
        .filter(|item| !has_condition(item, condition_type, want_status).is_ready())
        .count();

    if pending == 0 {
        Readiness::Ready
    } else {
        Readiness::not_ready(format!("{pending}/{} not {condition_type}", items.len()))
    }
}
