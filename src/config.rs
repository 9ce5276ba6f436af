//! CLI configuration and argument parsing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, ValueEnum};

use crate::cluster::kubernetes::KubeOptions;
use crate::error::InstallError;
use crate::install::InstallPlan;
use crate::package::DEFAULT_MAX_RETRIES;
use crate::package::helm::HelmOptions;
use crate::stack::{DEFAULT_STACK, ResolveOptions, StackDefinition};
use crate::wait::PollSettings;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Phased Kubernetes stack installer.
///
/// Deploys each phase's package with helm, then waits for the phase's
/// readiness conditions before moving on to the next phase.
#[derive(Parser, Debug, Clone)]
#[command(name = "kstack")]
#[command(about = "Phased Kubernetes stack installer with readiness gating")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Version of the stack packages to install (e.g., 1.4.0)
    #[arg(long, env = "KSTACK_VERSION")]
    pub version_tag: String,

    /// Namespace the stack is installed into
    #[arg(short, long, default_value = "kstack", env = "KSTACK_NAMESPACE")]
    pub namespace: String,

    /// Stack definition file (defaults to the built-in stack)
    #[arg(long, value_name = "FILE")]
    pub stack: Option<PathBuf>,

    /// Directory that relative values overlays are resolved against
    #[arg(long = "values", value_name = "DIR")]
    pub values_dir: Option<PathBuf>,

    /// Wait timeout for one phase (format: PHASE=SECONDS, e.g., config=900)
    #[arg(long = "wait-timeout", value_name = "PHASE=SECONDS")]
    pub wait_timeouts: Vec<String>,

    /// Seconds between readiness checks
    #[arg(long, default_value = "5")]
    pub poll_interval: u64,

    /// Readiness checks before a wait times out
    #[arg(long, default_value = "60")]
    pub poll_attempts: u32,

    /// Deploy attempts per package
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Skip background side installations
    #[arg(long, default_value = "false")]
    pub skip_side_installs: bool,

    /// Path to kubeconfig
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// helm binary
    #[arg(long, default_value = "helm", env = "KSTACK_HELM_BIN")]
    pub helm_bin: PathBuf,

    /// Seconds a single helm command may run
    #[arg(long, default_value = "600")]
    pub helm_timeout: u64,

    /// Directory charts are pulled into by the preload task
    #[arg(long, value_name = "DIR")]
    pub chart_cache: Option<PathBuf>,

    /// Print the resolved plan without installing
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "KSTACK_LOG_LEVEL")]
    pub log_level: String,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Log file (default: kstack-<timestamp>.log in the current directory)
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub file: PathBuf,
}

/// Immutable installation settings, built once and passed down.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    pub version: String,
    pub namespace: String,
    /// Stack template, before placeholder substitution.
    pub stack: String,
    pub wait_timeouts: HashMap<String, Duration>,
    pub side_installs_enabled: bool,
    pub default_poll: PollSettings,
    pub max_retries: u32,
    pub values_dir: Option<PathBuf>,
}

impl InstallConfig {
    /// Config for the built-in stack with default settings.
    pub fn new(version: &str, namespace: &str) -> Self {
        Self {
            version: version.to_string(),
            namespace: namespace.to_string(),
            stack: DEFAULT_STACK.to_string(),
            wait_timeouts: HashMap::new(),
            side_installs_enabled: true,
            default_poll: PollSettings::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            values_dir: None,
        }
    }

    /// Check the settings and parse the stack, returning the checked definition.
    ///
    /// Wait-timeout overrides must name phases of the stack.
    pub fn validate(&self) -> Result<StackDefinition, InstallError> {
        let invalid = |msg: &str| -> Result<StackDefinition, InstallError> {
            Err(InstallError::InvalidConfig(msg.to_string()))
        };

        if self.version.trim().is_empty() {
            return invalid("package version must not be empty");
        }
        if self.namespace.trim().is_empty() {
            return invalid("namespace must not be empty");
        }
        if self.max_retries == 0 {
            return invalid("max retries must be at least 1");
        }
        if self.default_poll.interval.is_zero() {
            return invalid("poll interval must be greater than zero");
        }
        if self.default_poll.attempts == 0 {
            return invalid("poll attempts must be at least 1");
        }
        if self.wait_timeouts.values().any(Duration::is_zero) {
            return invalid("wait timeouts must be greater than zero");
        }

        let stack = StackDefinition::load(&self.stack, &self.version, &self.namespace)?;

        let mut unknown: Vec<&str> = self
            .wait_timeouts
            .keys()
            .map(String::as_str)
            .filter(|name| !stack.phase_names().any(|p| p == *name))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(InstallError::InvalidConfig(format!(
                "wait timeout given for unknown phase(s): {} (phases: {})",
                unknown.join(", "),
                stack.phase_names().collect::<Vec<_>>().join(", ")
            )));
        }

        Ok(stack)
    }

    /// Validate, then resolve the stack into a runnable plan.
    pub fn plan(&self) -> Result<InstallPlan, InstallError> {
        self.validate()?.resolve(&ResolveOptions {
            default_poll: self.default_poll,
            wait_timeouts: &self.wait_timeouts,
            values_dir: self.values_dir.as_deref(),
        })
    }
}

/// Application configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub install: InstallConfig,
    pub kube: KubeOptions,
    pub helm: HelmOptions,
    pub log: LogSettings,
    pub dry_run: bool,
}

impl Config {
    /// Create config from CLI arguments.
    pub fn from_args(args: Args) -> Result<Self> {
        let stack = match &args.stack {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read stack file {}", path.display()))?,
            None => DEFAULT_STACK.to_string(),
        };

        let install = InstallConfig {
            version: args.version_tag,
            namespace: args.namespace,
            stack,
            wait_timeouts: parse_wait_timeouts(&args.wait_timeouts)?,
            side_installs_enabled: !args.skip_side_installs,
            default_poll: PollSettings::new(
                Duration::from_secs(args.poll_interval),
                args.poll_attempts,
            ),
            max_retries: args.max_retries,
            values_dir: args.values_dir,
        };

        let mut helm = HelmOptions {
            bin: args.helm_bin,
            kubeconfig: args.kubeconfig.clone(),
            context: args.context.clone(),
            timeout: Duration::from_secs(args.helm_timeout),
            ..HelmOptions::default()
        };
        if let Some(cache) = args.chart_cache {
            helm.cache_dir = cache;
        }

        let log_file = args.log_file.unwrap_or_else(|| {
            PathBuf::from(format!(
                "kstack-{}.log",
                Local::now().format("%Y%m%d-%H%M%S")
            ))
        });

        Ok(Self {
            install,
            kube: KubeOptions {
                kubeconfig: args.kubeconfig,
                context: args.context,
            },
            helm,
            log: LogSettings {
                level: args.log_level,
                format: args.log_format,
                file: log_file,
            },
            dry_run: args.dry_run,
        })
    }
}

/// Parse `PHASE=SECONDS` overrides.
pub fn parse_wait_timeouts(values: &[String]) -> Result<HashMap<String, Duration>> {
    values
        .iter()
        .map(|value| -> Result<(String, Duration)> {
            let Some((phase, secs)) = value.split_once('=') else {
                bail!("Invalid --wait-timeout '{}': expected PHASE=SECONDS", value);
            };
            let secs: u64 = secs.trim().parse().with_context(|| {
                format!("Invalid --wait-timeout '{}': {} is not a number of seconds", value, secs)
            })?;
            Ok((phase.trim().to_string(), Duration::from_secs(secs)))
        })
        .collect()
}
