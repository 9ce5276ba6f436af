//! Installation orchestrator: the resolved plan, its collaborators, and the entry point.

pub mod progress;
pub mod sequencer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Local};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, ClusterConnector};
use crate::config::InstallConfig;
use crate::error::InstallError;
use crate::package::{DeployPath, DeploymentTicket, PackageApi, PackageRef, deploy_with_retry};
use crate::tasks::{JoinPoint, TaskOutcome, TaskSet};
use crate::wait::{Wait, wait_for};
use progress::{Progress, ProgressEvent};
use sequencer::PhaseSequencer;

/// Collaborators shared by the sequencer and background tasks.
#[derive(Clone)]
pub struct InstallDeps {
    pub cluster: Arc<dyn ClusterApi>,
    pub connector: Arc<dyn ClusterConnector>,
    pub packages: Arc<dyn PackageApi>,
    pub progress: Progress,
}

/// One ordered step: deploy a package, then wait for every condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    pub package: PackageRef,
    pub waits: Vec<Wait>,
}

/// Work done by a background side installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideWork {
    /// Deploy an extra package and wait for it, off the critical path.
    Package { package: PackageRef, waits: Vec<Wait> },
    /// Fetch packages ahead of their phase.
    Preload { packages: Vec<PackageRef> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideInstall {
    pub name: String,
    pub join_point: JoinPoint,
    pub work: SideWork,
}

/// Everything one run will do, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub phases: Vec<Phase>,
    pub side_installs: Vec<SideInstall>,
}

/// A completed phase.
#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub name: String,
    pub package: String,
    pub path: DeployPath,
    pub attempts: u32,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub phases: Vec<PhaseRecord>,
    pub tasks: Vec<TaskOutcome>,
    pub elapsed: Duration,
}

impl InstallReport {
    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.tasks.iter().filter(|t| !t.is_success())
    }
}

/// Run every phase of the configured stack.
///
/// The progress sink always receives a terminal event, whatever the outcome.
pub async fn run_install(
    config: &InstallConfig,
    deps: &InstallDeps,
) -> Result<InstallReport, InstallError> {
    let start = Instant::now();
    let result = install(config, deps).await;

    match &result {
        Ok(report) => {
            info!(
                "Installation of {} phase(s) completed in {:.1}s",
                report.phases.len(),
                report.elapsed.as_secs_f64()
            );
            deps.progress.send(ProgressEvent::Finished {
                elapsed: start.elapsed(),
            });
        }
        Err(e) => {
            error!("Installation aborted: {}", e);
            deps.progress.send(ProgressEvent::Aborted {
                phase: e.phase().map(str::to_string),
                error: e.to_string(),
            });
        }
    }

    result
}

async fn install(config: &InstallConfig, deps: &InstallDeps) -> Result<InstallReport, InstallError> {
    let plan = config.plan()?;

    let mut tasks = TaskSet::new();
    if config.side_installs_enabled {
        launch_side_installs(&plan, deps, config.max_retries, &mut tasks);
    } else if !plan.side_installs.is_empty() {
        info!(
            "Skipping {} side installation(s)",
            plan.side_installs.len()
        );
    }

    let mut sequencer = PhaseSequencer::new(&plan.phases, deps, config.max_retries);
    let result = sequencer.run(&mut tasks).await;
    if result.is_err() {
        debug!("Sequencer stopped in state {:?}", sequencer.state());
        tasks.abandon().await;
    }
    result
}

fn launch_side_installs(
    plan: &InstallPlan,
    deps: &InstallDeps,
    max_retries: u32,
    tasks: &mut TaskSet,
) {
    for side in &plan.side_installs {
        info!("Launching background task {} (joined {})", side.name, side.join_point);
        deps.progress.send(ProgressEvent::TaskLaunched {
            name: side.name.clone(),
            join_point: side.join_point.to_string(),
        });
        tasks.launch(
            side.name.clone(),
            side.join_point.clone(),
            run_side_work(side.work.clone(), deps.clone(), max_retries),
        );
    }
}

async fn run_side_work(work: SideWork, deps: InstallDeps, max_retries: u32) -> anyhow::Result<()> {
    match work {
        SideWork::Package { package, waits } => {
            let mut ticket = DeploymentTicket::new(package, max_retries);
            deploy_with_retry(deps.packages.as_ref(), &mut ticket).await?;
            for wait in &waits {
                wait_for(wait, deps.cluster.as_ref(), deps.connector.as_ref()).await?;
            }
            Ok(())
        }
        SideWork::Preload { packages } => {
            let mut failed = Vec::new();
            for package in &packages {
                if let Err(e) = deps.packages.prefetch(package).await {
                    warn!("Preload of {} failed: {}", package, e);
                    failed.push(package.name.as_str());
                }
            }
            if failed.is_empty() {
                Ok(())
            } else {
                Err(anyhow!("failed to preload {}", failed.join(", ")))
            }
        }
    }
}
