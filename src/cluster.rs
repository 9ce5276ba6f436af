//! Cluster state queries consumed by readiness waits.

pub mod kubernetes;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClusterError;

/// Replica counts of a single Deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentReplicas {
    pub desired: i32,
    pub available: i32,
}

/// Group, version and plural name of a (custom) resource collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_resource_version")]
    pub version: String,
    pub resource: String,
}

fn default_resource_version() -> String {
    "v1".to_string()
}

impl ResourceRef {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    /// `apiVersion` string, e.g. `cert-manager.io/v1` or `v1` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// Read-only view of the cluster used to evaluate readiness.
///
/// Absent objects are `Ok(None)`; errors are reserved for failed calls.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Desired and available replicas of a Deployment.
    async fn deployment_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentReplicas>, ClusterError>;

    /// Kinds advertised by the discovery catalog.
    async fn api_kinds(&self) -> Result<Vec<String>, ClusterError>;

    /// A named resource, or the first listed item when `name` is `None`.
    async fn get_resource(
        &self,
        resource: &ResourceRef,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<Value>, ClusterError>;

    /// Every item of a resource collection.
    async fn list_resources(
        &self,
        resource: &ResourceRef,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>, ClusterError>;
}

/// Re-establishes the connection used by a [`ClusterApi`].
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self) -> Result<(), ClusterError>;
}
