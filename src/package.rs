//! Idempotent install-or-upgrade of a single package, with bounded retry.

pub mod helm;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{DeployError, PackageError};

/// Attempts made by [`deploy_with_retry`] unless configured otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A package to deploy: release name, chart source, target namespace, version and overlays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    pub chart: String,
    pub namespace: String,
    pub version: String,
    pub overlays: Vec<PathBuf>,
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.version, self.namespace)
    }
}

/// Which path a deploy took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPath {
    Install,
    Upgrade,
}

impl fmt::Display for DeployPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "installed"),
            Self::Upgrade => write!(f, "upgraded"),
        }
    }
}

/// Inputs and outcome of deploying one package.
#[derive(Debug, Clone)]
pub struct DeploymentTicket {
    package: PackageRef,
    max_attempts: u32,
    attempts: u32,
    path: Option<DeployPath>,
    last_error: Option<String>,
}

impl DeploymentTicket {
    pub fn new(package: PackageRef, max_attempts: u32) -> Self {
        Self {
            package,
            max_attempts: max_attempts.max(1),
            attempts: 0,
            path: None,
            last_error: None,
        }
    }

    pub fn package(&self) -> &PackageRef {
        &self.package
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempts made so far. Never exceeds `max_attempts`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Path taken by the successful attempt.
    pub fn path(&self) -> Option<DeployPath> {
        self.path
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Backend able to install, upgrade and pre-fetch packages.
#[async_trait]
pub trait PackageApi: Send + Sync {
    /// Whether a release with this name has deployment history in the namespace.
    async fn has_history(&self, name: &str, namespace: &str) -> Result<bool, PackageError>;

    async fn install(&self, package: &PackageRef) -> Result<(), PackageError>;

    async fn upgrade(&self, package: &PackageRef) -> Result<(), PackageError>;

    /// Download the package ahead of its deploy.
    async fn prefetch(&self, package: &PackageRef) -> Result<(), PackageError>;
}

/// Install the package if it has no history, upgrade it otherwise.
///
/// An install rejected because the release already exists falls through to upgrade.
pub async fn deploy_or_upgrade(
    api: &dyn PackageApi,
    package: &PackageRef,
) -> Result<DeployPath, PackageError> {
    if api.has_history(&package.name, &package.namespace).await? {
        info!("Upgrading {}", package);
        api.upgrade(package).await?;
        return Ok(DeployPath::Upgrade);
    }

    info!("Installing {}", package);
    match api.install(package).await {
        Ok(()) => Ok(DeployPath::Install),
        Err(e) if e.is_already_exists() => {
            warn!("{} already exists, upgrading instead", package.name);
            api.upgrade(package).await?;
            Ok(DeployPath::Upgrade)
        }
        Err(e) => Err(e),
    }
}

/// Run [`deploy_or_upgrade`] up to the ticket's attempt budget.
///
/// Retries are immediate. The returned error wraps the last failure.
pub async fn deploy_with_retry(
    api: &dyn PackageApi,
    ticket: &mut DeploymentTicket,
) -> Result<DeployPath, DeployError> {
    loop {
        ticket.attempts += 1;
        match deploy_or_upgrade(api, &ticket.package).await {
            Ok(path) => {
                ticket.path = Some(path);
                return Ok(path);
            }
            Err(e) if ticket.attempts < ticket.max_attempts => {
                warn!(
                    "Deploy of {} failed (attempt {}/{}), retrying: {}",
                    ticket.package.name, ticket.attempts, ticket.max_attempts, e
                );
                ticket.last_error = Some(e.to_string());
            }
            Err(e) => {
                ticket.last_error = Some(e.to_string());
                return Err(DeployError {
                    package: ticket.package.name.clone(),
                    namespace: ticket.package.namespace.clone(),
                    attempts: ticket.attempts,
                    source: e,
                });
            }
        }
    }
}
