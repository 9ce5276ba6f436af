//! kstack - phased Kubernetes stack installer.
//!
//! Installs a stack of helm packages onto an existing cluster with:
//! - Strictly ordered phases gated on readiness conditions
//! - Idempotent install-or-upgrade with bounded retries
//! - Background side installations joined at fixed points

mod cluster;
mod config;
mod error;
mod install;
mod logging;
mod output;
mod package;
mod stack;
mod tasks;
mod wait;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing::{debug, error};

use cluster::kubernetes::KubeCluster;
use config::{Args, Config, VERSION};
use error::InstallError;
use install::progress::Progress;
use install::{InstallDeps, run_install};
use output::{print_plan, print_summary, spawn_renderer};
use package::helm::HelmCli;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red(), e);
            std::process::exit(1);
        }
    };

    if config.dry_run {
        if let Err(e) = dry_run(&config) {
            eprintln!("{} {}", "✗".red(), e);
            std::process::exit(1);
        }
        return;
    }

    let log_path = match logging::init(&config.log) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            std::process::exit(1);
        }
    };

    debug!("Starting kstack {}", VERSION);

    if let Err(e) = run(&config).await {
        error!("{:#}", e);
        report_failure(&e, &log_path);
        std::process::exit(1);
    }
}

/// Resolve and print the plan without touching the cluster.
fn dry_run(config: &Config) -> Result<(), InstallError> {
    print_plan(&config.install.plan()?);
    Ok(())
}

/// Main application logic.
async fn run(config: &Config) -> Result<()> {
    let cluster = Arc::new(KubeCluster::open(config.kube.clone()).await?);
    let packages = Arc::new(HelmCli::new(config.helm.clone()));

    let (progress, rx) = Progress::channel();
    let renderer = spawn_renderer(rx);

    let deps = InstallDeps {
        cluster: cluster.clone(),
        connector: cluster,
        packages,
        progress,
    };
    let result = run_install(&config.install, &deps).await;
    drop(deps);

    if let Err(e) = renderer.await {
        debug!("Progress renderer stopped: {}", e);
    }

    let report = result?;
    print_summary(&report);
    Ok(())
}

/// Installation errors were already rendered by the progress renderer.
fn report_failure(err: &anyhow::Error, log_path: &Path) {
    if !is_rendered(err) {
        eprintln!("{} {:#}", "✗".red().bold(), err);
    }
    eprintln!("See log file for details: {}", log_path.display());
}

/// Every `InstallError` reaches the console as the renderer's abort line.
fn is_rendered(err: &anyhow::Error) -> bool {
    err.downcast_ref::<InstallError>().is_some()
}
