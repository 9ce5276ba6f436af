//! Readiness conditions and the machinery that waits for them.
//!
//! A [`WaitSpec`] says *what* must be true; [`condition::evaluate`] decides
//! whether one snapshot satisfies it; [`poller::poll`] keeps fetching until it
//! does or the attempt budget runs out.

pub mod condition;
pub mod poller;

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::cluster::{ClusterApi, ClusterConnector, ResourceRef};
use crate::error::{ClusterError, WaitError};
use condition::Snapshot;
use poller::PollSuccess;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_ATTEMPTS: u32 = 60;

/// How often and how many times a condition is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            attempts: DEFAULT_POLL_ATTEMPTS,
        }
    }
}

impl PollSettings {
    pub const fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }

    /// Settings that spend roughly `timeout` polling at `interval`.
    ///
    /// Attempts are rounded up so the budget never undershoots the timeout.
    pub fn from_timeout(interval: Duration, timeout: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let attempts = timeout.as_millis().div_ceil(interval_ms).max(1);
        Self {
            interval,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }
    }

    /// Total polling budget (interval x attempts).
    pub fn timeout(&self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }
}

/// A readiness condition a phase must satisfy before the next phase starts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "wait", rename_all = "snake_case")]
pub enum WaitSpec {
    /// Available replicas equal desired replicas.
    DeploymentAvailable { namespace: String, name: String },

    /// The kind is served by the API server.
    ApiKindPresent { kind: String },

    /// A named (or the first listed) resource carries the given status condition.
    ResourceCondition {
        resource: ResourceRef,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        name: Option<String>,
        condition_type: String,
        want_status: String,
    },

    /// Every listed resource carries the given status condition, and there is at least one.
    AllOfKind {
        resource: ResourceRef,
        #[serde(default)]
        namespace: Option<String>,
        condition_type: String,
        want_status: String,
    },
}

impl fmt::Display for WaitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeploymentAvailable { namespace, name } => {
                write!(f, "deployment {namespace}/{name} available")
            }
            Self::ApiKindPresent { kind } => write!(f, "API kind {kind} present"),
            Self::ResourceCondition {
                resource,
                namespace,
                name,
                condition_type,
                want_status,
            } => {
                let target = match name {
                    Some(name) => format!("{resource} {}", qualified(namespace.as_deref(), name)),
                    None => format!("first {resource}"),
                };
                write!(f, "condition {condition_type}={want_status} on {target}")
            }
            Self::AllOfKind {
                resource,
                namespace,
                condition_type,
                want_status,
            } => {
                write!(f, "condition {condition_type}={want_status} on all {resource}")?;
                if let Some(ns) = namespace {
                    write!(f, " in {ns}")?;
                }
                Ok(())
            }
        }
    }
}

fn qualified(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

/// A condition bound to its resolved poll budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wait {
    pub spec: WaitSpec,
    pub poll: PollSettings,
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (every {}s, up to {} attempts)",
            self.spec,
            self.poll.interval.as_secs(),
            self.poll.attempts
        )
    }
}

/// Fetch the piece of cluster state a condition is evaluated against.
pub async fn fetch_snapshot(
    cluster: &dyn ClusterApi,
    spec: &WaitSpec,
) -> Result<Snapshot, ClusterError> {
    match spec {
        WaitSpec::DeploymentAvailable { namespace, name } => cluster
            .deployment_replicas(namespace, name)
            .await
            .map(Snapshot::Deployment),
        WaitSpec::ApiKindPresent { .. } => cluster.api_kinds().await.map(Snapshot::Kinds),
        WaitSpec::ResourceCondition {
            resource,
            namespace,
            name,
            ..
        } => cluster
            .get_resource(resource, namespace.as_deref(), name.as_deref())
            .await
            .map(Snapshot::Resource),
        WaitSpec::AllOfKind {
            resource,
            namespace,
            ..
        } => cluster
            .list_resources(resource, namespace.as_deref())
            .await
            .map(Snapshot::Collection),
    }
}

/// Poll the cluster until `wait` is satisfied or its budget is spent.
///
/// A failed fetch counts as not ready; the connector is asked to reconnect so
/// the next attempt starts from a fresh client.
pub async fn wait_for(
    wait: &Wait,
    cluster: &dyn ClusterApi,
    connector: &dyn ClusterConnector,
) -> Result<PollSuccess, WaitError> {
    let spec = &wait.spec;
    let fetch = move || async move {
        match fetch_snapshot(cluster, spec).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                if let Err(reconnect) = connector.connect().await {
                    debug!("Reconnect after failed fetch did not succeed: {}", reconnect);
                }
                Err(e)
            }
        }
    };

    poller::poll(&spec.to_string(), wait.poll, fetch, |snapshot| {
        condition::evaluate(spec, snapshot)
    })
    .await
}
