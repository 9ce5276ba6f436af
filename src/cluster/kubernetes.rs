//! `ClusterApi` backed by a live Kubernetes API server.
//!
//! Typed `Deployment` reads, discovery for the kind catalog, and the dynamic
//! API for arbitrary custom resources.

use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::Discovery;
use kube::{Api, Client, Config};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ClusterApi, ClusterConnector, DeploymentReplicas, ResourceRef};
use crate::error::ClusterError;

/// Where to load cluster credentials from.
#[derive(Debug, Clone, Default)]
pub struct KubeOptions {
    /// Explicit kubeconfig file. Falls back to in-cluster / `KUBECONFIG` inference.
    pub kubeconfig: Option<PathBuf>,
    /// Context name inside the kubeconfig.
    pub context: Option<String>,
}

/// Kubernetes cluster handle that can rebuild its client on demand.
pub struct KubeCluster {
    options: KubeOptions,
    client: RwLock<Client>,
}

impl KubeCluster {
    /// Build a client from the given options and verify the API server answers.
    pub async fn open(options: KubeOptions) -> Result<Self, ClusterError> {
        let client = build_client(&options).await?;
        let version = client
            .apiserver_version()
            .await
            .map_err(|e| ClusterError::Connect(e.to_string()))?;
        info!(
            "Connected to Kubernetes API server (version {}.{})",
            version.major, version.minor
        );

        Ok(Self {
            options,
            client: RwLock::new(client),
        })
    }

    async fn client(&self) -> Client {
        self.client.read().await.clone()
    }

    fn dynamic_api(
        client: Client,
        resource: &ResourceRef,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: resource.group.clone(),
            version: resource.version.clone(),
            api_version: resource.api_version(),
            kind: resource.resource.clone(),
            plural: resource.resource.clone(),
        };
        match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        }
    }
}

/// Load a kube `Config` honouring an explicit kubeconfig path and context.
async fn build_client(options: &KubeOptions) -> Result<Client, ClusterError> {
    let kube_options = KubeConfigOptions {
        context: options.context.clone(),
        ..Default::default()
    };

    let config = match (&options.kubeconfig, &options.context) {
        (Some(path), _) => {
            debug!("Loading kubeconfig from {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                ClusterError::Connect(format!(
                    "Failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &kube_options)
                .await
                .map_err(|e| ClusterError::Connect(e.to_string()))?
        }
        (None, Some(_)) => Config::from_kubeconfig(&kube_options)
            .await
            .map_err(|e| ClusterError::Connect(e.to_string()))?,
        (None, None) => Config::infer()
            .await
            .map_err(|e| ClusterError::Connect(e.to_string()))?,
    };

    Client::try_from(config).map_err(|e| ClusterError::Connect(e.to_string()))
}

fn to_value(obj: &DynamicObject) -> Result<Value, ClusterError> {
    serde_json::to_value(obj).map_err(|e| ClusterError::api("decode resource", e))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn deployment_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentReplicas>, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client().await, namespace);
        let deployment = api
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::api(&format!("get deployment {namespace}/{name}"), e))?;

        Ok(deployment.map(|d| DeploymentReplicas {
            desired: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            available: d
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0),
        }))
    }

    async fn api_kinds(&self) -> Result<Vec<String>, ClusterError> {
        let discovery = Discovery::new(self.client().await)
            .run()
            .await
            .map_err(|e| ClusterError::api("discovery", e))?;

        let kinds: Vec<String> = discovery
            .groups()
            .flat_map(|group| group.recommended_resources())
            .map(|(ar, _caps)| ar.kind)
            .collect();

        debug!("Discovery returned {} kinds", kinds.len());
        Ok(kinds)
    }

    async fn get_resource(
        &self,
        resource: &ResourceRef,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<Value>, ClusterError> {
        let api = Self::dynamic_api(self.client().await, resource, namespace);

        let obj = match name {
            Some(name) => api
                .get_opt(name)
                .await
                .map_err(|e| ClusterError::api(&format!("get {resource}/{name}"), e))?,
            None => api
                .list(&ListParams::default().limit(1))
                .await
                .map_err(|e| ClusterError::api(&format!("list {resource}"), e))?
                .items
                .into_iter()
                .next(),
        };

        obj.as_ref().map(to_value).transpose()
    }

    async fn list_resources(
        &self,
        resource: &ResourceRef,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>, ClusterError> {
        let api = Self::dynamic_api(self.client().await, resource, namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::api(&format!("list {resource}"), e))?;

        list.items.iter().map(to_value).collect()
    }
}

#[async_trait]
impl ClusterConnector for KubeCluster {
    async fn connect(&self) -> Result<(), ClusterError> {
        let client = build_client(&self.options).await?;
        *self.client.write().await = client;
        debug!("Rebuilt Kubernetes client");
        Ok(())
    }
}
