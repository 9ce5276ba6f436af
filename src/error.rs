//! Custom error types for kstack.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by cluster state queries.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Failed to connect to cluster: {0}")]
    Connect(String),
}

impl ClusterError {
    /// Wrap a kube client error with a short description of the failed call.
    pub fn api<E: std::fmt::Display>(operation: &str, err: E) -> Self {
        Self::KubernetesApi(format!("{operation}: {err}"))
    }
}

/// Errors returned by the package deploy backend.
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("[{command}] {message}")]
    Command { command: String, message: String },

    #[error("[{command}] timed out after {}s", .timeout.as_secs())]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Unexpected output from {command}: {message}")]
    Output { command: String, message: String },
}

impl PackageError {
    /// Returns true if the backend refused an install because the release already exists.
    ///
    /// The deployer answers this by switching to the upgrade path.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Command { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("already exists") || lower.contains("cannot re-use a name")
            }
            _ => false,
        }
    }
}

/// A package could not be deployed within its attempt budget.
#[derive(Error, Debug)]
#[error("Failed to deploy {package} into {namespace} after {attempts} attempt(s): {source}")]
pub struct DeployError {
    pub package: String,
    pub namespace: String,
    pub attempts: u32,
    #[source]
    pub source: PackageError,
}

/// A readiness condition was not satisfied within its poll budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error(
        "Timeout waiting for {description}: not ready after {attempts} attempt(s) at {}s interval",
        .interval.as_secs()
    )]
    Timeout {
        description: String,
        attempts: u32,
        interval: Duration,
    },
}

/// Errors that abort an installation run.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid stack definition: {0}")]
    InvalidStack(String),

    #[error("Phase {phase} failed: {source}")]
    Deploy {
        phase: String,
        #[source]
        source: DeployError,
    },

    #[error("Phase {phase} failed: {source}")]
    Wait {
        phase: String,
        #[source]
        source: WaitError,
    },
}

impl InstallError {
    /// Name of the phase that aborted the run, if the failure happened inside one.
    pub fn phase(&self) -> Option<&str> {
        match self {
            Self::Deploy { phase, .. } | Self::Wait { phase, .. } => Some(phase),
            Self::InvalidConfig(_) | Self::InvalidStack(_) => None,
        }
    }
}
