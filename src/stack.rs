//! Stack definitions: the YAML description of phases, packages, waits and side installs.
//!
//! A definition is rendered (placeholder substitution), parsed, checked and then
//! resolved into an [`InstallPlan`] with every poll budget filled in.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::InstallError;
use crate::install::{InstallPlan, Phase, SideInstall, SideWork};
use crate::package::PackageRef;
use crate::tasks::JoinPoint;
use crate::wait::{PollSettings, Wait, WaitSpec};

/// Stack installed when `--stack` is not given.
pub const DEFAULT_STACK: &str = include_str!("../stacks/default.yaml");

const VERSION_PLACEHOLDER: &str = "{{version}}";
const NAMESPACE_PLACEHOLDER: &str = "{{namespace}}";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PollDef {
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PackageDef {
    pub name: String,
    pub chart: String,
    pub namespace: String,
    pub version: String,
    /// Value overlays, relative to the values directory unless absolute.
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WaitDef {
    #[serde(flatten)]
    pub spec: WaitSpec,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PhaseDef {
    pub name: String,
    pub package: PackageDef,
    #[serde(default)]
    pub poll: Option<PollDef>,
    #[serde(default)]
    pub waits: Vec<WaitDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideKindDef {
    Package {
        package: PackageDef,
        #[serde(default)]
        waits: Vec<WaitDef>,
    },
    /// Prefetch the packages of the listed phases, or of every phase when empty.
    Preload {
        #[serde(default)]
        phases: Vec<String>,
    },
}

impl SideKindDef {
    fn waits(&self) -> &[WaitDef] {
        match self {
            Self::Package { waits, .. } => waits,
            Self::Preload { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SideInstallDef {
    pub name: String,
    /// Phase before which the task is joined. Joined after the last phase when absent.
    #[serde(default)]
    pub join_before: Option<String>,
    #[serde(flatten)]
    pub kind: SideKindDef,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StackDefinition {
    #[serde(default)]
    pub defaults: Option<PollDef>,
    pub phases: Vec<PhaseDef>,
    #[serde(default)]
    pub side_installs: Vec<SideInstallDef>,
}

/// Inputs that shape how a definition becomes a plan.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions<'a> {
    pub default_poll: PollSettings,
    pub wait_timeouts: &'a HashMap<String, Duration>,
    pub values_dir: Option<&'a Path>,
}

/// Substitute `{{version}}` and `{{namespace}}` in a stack template.
pub fn render(template: &str, version: &str, namespace: &str) -> String {
    template
        .replace(VERSION_PLACEHOLDER, version)
        .replace(NAMESPACE_PLACEHOLDER, namespace)
}

impl StackDefinition {
    /// Render and parse a stack template, then check its structure.
    pub fn load(template: &str, version: &str, namespace: &str) -> Result<Self, InstallError> {
        let rendered = render(template, version, namespace);
        let stack: Self = serde_yaml::from_str(&rendered)
            .map_err(|e| InstallError::InvalidStack(e.to_string()))?;
        stack.check()?;
        Ok(stack)
    }

    pub fn phase_names(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.name.as_str())
    }

    fn check(&self) -> Result<(), InstallError> {
        if self.phases.is_empty() {
            return Err(InstallError::InvalidStack("no phases defined".to_string()));
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.name.as_str()) {
                return Err(InstallError::InvalidStack(format!(
                    "duplicate phase name: {}",
                    phase.name
                )));
            }
        }

        let polls = self
            .defaults
            .iter()
            .chain(self.phases.iter().filter_map(|p| p.poll.as_ref()))
            .map(|p| p.interval_secs);
        let waits = self
            .phases
            .iter()
            .flat_map(|p| p.waits.iter())
            .chain(self.side_installs.iter().flat_map(|s| s.kind.waits()))
            .map(|w| w.interval_secs);
        if polls.chain(waits).any(|interval| interval == Some(0)) {
            return Err(InstallError::InvalidStack(
                "poll interval must be greater than zero".to_string(),
            ));
        }

        for side in &self.side_installs {
            let preload_phases: &[String] = match &side.kind {
                SideKindDef::Preload { phases } => phases,
                SideKindDef::Package { .. } => &[],
            };
            for phase in side.join_before.iter().chain(preload_phases) {
                if !seen.contains(phase.as_str()) {
                    return Err(InstallError::InvalidStack(format!(
                        "side install {} references unknown phase {}",
                        side.name, phase
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve poll budgets and overlay paths into a runnable plan.
    pub fn resolve(&self, options: &ResolveOptions<'_>) -> Result<InstallPlan, InstallError> {
        let stack_poll = apply(options.default_poll, self.defaults.as_ref());

        let phases = self
            .phases
            .iter()
            .map(|def| -> Result<Phase, InstallError> {
                let phase_poll = apply(stack_poll, def.poll.as_ref());
                let timeout = options.wait_timeouts.get(&def.name).copied();
                Ok(Phase {
                    name: def.name.clone(),
                    package: package_ref(&def.package, options.values_dir)?,
                    waits: def
                        .waits
                        .iter()
                        .map(|w| resolve_wait(w, phase_poll, timeout))
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let side_installs = self
            .side_installs
            .iter()
            .map(|def| -> Result<SideInstall, InstallError> {
                let work = match &def.kind {
                    SideKindDef::Package { package, waits } => SideWork::Package {
                        package: package_ref(package, options.values_dir)?,
                        waits: waits
                            .iter()
                            .map(|w| resolve_wait(w, stack_poll, None))
                            .collect(),
                    },
                    SideKindDef::Preload { phases: names } => SideWork::Preload {
                        packages: phases
                            .iter()
                            .filter(|p| names.is_empty() || names.contains(&p.name))
                            .map(|p| p.package.clone())
                            .collect(),
                    },
                };
                Ok(SideInstall {
                    name: def.name.clone(),
                    join_point: def
                        .join_before
                        .clone()
                        .map_or(JoinPoint::End, JoinPoint::BeforePhase),
                    work,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(InstallPlan {
            phases,
            side_installs,
        })
    }
}

/// Overlay a partial poll definition on inherited settings.
fn apply(base: PollSettings, def: Option<&PollDef>) -> PollSettings {
    let Some(def) = def else {
        return base;
    };
    PollSettings {
        interval: def
            .interval_secs
            .map_or(base.interval, Duration::from_secs),
        attempts: def.attempts.unwrap_or(base.attempts),
    }
}

/// Explicit attempts on the wait win over a phase timeout, which wins over inherited attempts.
fn resolve_wait(def: &WaitDef, inherited: PollSettings, timeout: Option<Duration>) -> Wait {
    let interval = def
        .interval_secs
        .map_or(inherited.interval, Duration::from_secs);
    let attempts = match (def.attempts, timeout) {
        (Some(attempts), _) => attempts,
        (None, Some(timeout)) => PollSettings::from_timeout(interval, timeout).attempts,
        (None, None) => inherited.attempts,
    };
    Wait {
        spec: def.spec.clone(),
        poll: PollSettings::new(interval, attempts),
    }
}

fn package_ref(def: &PackageDef, values_dir: Option<&Path>) -> Result<PackageRef, InstallError> {
    let overlays = def
        .values
        .iter()
        .map(|value| {
            let path = overlay_path(value, values_dir);
            if path.is_file() {
                Ok(path)
            } else {
                Err(InstallError::InvalidConfig(format!(
                    "values overlay {} for package {} not found",
                    path.display(),
                    def.name
                )))
            }
        })
        .collect::<Result<Vec<_>, InstallError>>()?;

    Ok(PackageRef {
        name: def.name.clone(),
        chart: def.chart.clone(),
        namespace: def.namespace.clone(),
        version: def.version.clone(),
        overlays,
    })
}

fn overlay_path(value: &str, values_dir: Option<&Path>) -> PathBuf {
    let path = Path::new(value);
    match values_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}
