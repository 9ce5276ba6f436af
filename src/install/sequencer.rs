//! Runs phases strictly in order, gating each on the previous phase's readiness.

use chrono::Local;
use tokio::time::Instant;
use tracing::{info, warn};

use super::progress::ProgressEvent;
use super::{InstallDeps, InstallReport, Phase, PhaseRecord};
use crate::error::InstallError;
use crate::package::{DeploymentTicket, deploy_with_retry};
use crate::tasks::{JoinPoint, TaskOutcome, TaskSet, TaskStatus};
use crate::wait::wait_for;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    NotStarted,
    /// Index of the phase being deployed or waited on.
    Running(usize),
    AllDone,
    Aborted {
        phase: usize,
    },
}

pub struct PhaseSequencer<'a> {
    phases: &'a [Phase],
    deps: &'a InstallDeps,
    max_retries: u32,
    state: SequencerState,
}

impl<'a> PhaseSequencer<'a> {
    pub fn new(phases: &'a [Phase], deps: &'a InstallDeps, max_retries: u32) -> Self {
        Self {
            phases,
            deps,
            max_retries,
            state: SequencerState::NotStarted,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Run every phase, joining background tasks at their join points.
    ///
    /// The first failed deploy or wait aborts the sequence. Background task
    /// failures are reported as warnings and never fail the run.
    pub async fn run(&mut self, tasks: &mut TaskSet) -> Result<InstallReport, InstallError> {
        let start = Instant::now();
        let mut records = Vec::with_capacity(self.phases.len());
        let mut joined = Vec::new();

        for (index, phase) in self.phases.iter().enumerate() {
            self.state = SequencerState::Running(index);

            let due = tasks
                .join_at(&JoinPoint::BeforePhase(phase.name.clone()))
                .await;
            self.report_joined(due, &mut joined);

            match self.run_phase(index, phase).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.state = SequencerState::Aborted { phase: index };
                    return Err(e);
                }
            }
        }

        self.state = SequencerState::AllDone;

        if !tasks.is_empty() {
            info!("All phases complete, joining background tasks");
        }
        let remaining = tasks.join_remaining().await;
        self.report_joined(remaining, &mut joined);

        Ok(InstallReport {
            phases: records,
            tasks: joined,
            elapsed: start.elapsed(),
        })
    }

    async fn run_phase(&self, index: usize, phase: &Phase) -> Result<PhaseRecord, InstallError> {
        let progress = &self.deps.progress;
        let started_at = Local::now();
        let start = Instant::now();

        info!(
            "Phase [{}/{}]: {}",
            index + 1,
            self.phases.len(),
            phase.name
        );
        progress.send(ProgressEvent::PhaseStarted {
            index,
            total: self.phases.len(),
            name: phase.name.clone(),
        });

        progress.send(ProgressEvent::Deploying {
            phase: phase.name.clone(),
            package: phase.package.to_string(),
        });
        let mut ticket = DeploymentTicket::new(phase.package.clone(), self.max_retries);
        let path = deploy_with_retry(self.deps.packages.as_ref(), &mut ticket)
            .await
            .map_err(|source| InstallError::Deploy {
                phase: phase.name.clone(),
                source,
            })?;
        if ticket.attempts() > 1 {
            warn!(
                "{} {} on attempt {}/{} (previous error: {})",
                ticket.package().name,
                path,
                ticket.attempts(),
                ticket.max_attempts(),
                ticket.last_error().unwrap_or("unknown")
            );
        } else {
            info!("{} {}", ticket.package().name, path);
        }
        progress.send(ProgressEvent::Deployed {
            phase: phase.name.clone(),
            package: phase.package.name.clone(),
            path,
            attempts: ticket.attempts(),
        });

        for wait in &phase.waits {
            let description = wait.spec.to_string();
            info!(
                "Waiting for {} (timeout {}s)",
                wait,
                wait.poll.timeout().as_secs()
            );
            progress.send(ProgressEvent::Waiting {
                phase: phase.name.clone(),
                description: description.clone(),
            });

            let success = wait_for(wait, self.deps.cluster.as_ref(), self.deps.connector.as_ref())
                .await
                .map_err(|source| InstallError::Wait {
                    phase: phase.name.clone(),
                    source,
                })?;

            info!(
                "{} satisfied after {} check(s) in {:.1}s",
                description,
                success.attempts,
                success.elapsed.as_secs_f64()
            );
            progress.send(ProgressEvent::WaitSatisfied {
                phase: phase.name.clone(),
                description,
                attempts: success.attempts,
            });
        }

        let elapsed = start.elapsed();
        progress.send(ProgressEvent::PhaseCompleted {
            name: phase.name.clone(),
            elapsed,
        });

        Ok(PhaseRecord {
            name: phase.name.clone(),
            package: phase.package.name.clone(),
            path,
            attempts: ticket.attempts(),
            started_at,
            elapsed,
        })
    }

    fn report_joined(&self, outcomes: Vec<TaskOutcome>, joined: &mut Vec<TaskOutcome>) {
        for outcome in outcomes {
            if let TaskStatus::Failed(reason) = &outcome.status {
                warn!("Background task {} failed: {}", outcome.name, reason);
            } else {
                info!(
                    "Background task {} completed in {:.1}s",
                    outcome.name,
                    outcome.elapsed.as_secs_f64()
                );
            }
            self.deps
                .progress
                .send(ProgressEvent::TaskJoined(outcome.clone()));
            joined.push(outcome);
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::anyhow;

    use super::testing::{FakeCluster, FakeConnector};
    use super::*;
    use crate::cluster::ResourceRef;
    use crate::error::WaitError;
    use crate::install::progress::Progress;
    use crate::package::DeployPath;
    use crate::package::testing::{FakePackages, package};
    use crate::wait::{PollSettings, Wait, WaitSpec};

    const POLL: PollSettings = PollSettings::new(Duration::from_secs(10), 3);

    fn wait(spec: WaitSpec) -> Wait {
        Wait { spec, poll: POLL }
    }

    fn deployment(name: &str) -> Wait {
        wait(WaitSpec::DeploymentAvailable {
            namespace: "kstack".to_string(),
            name: name.to_string(),
        })
    }

    fn phase(name: &str, waits: Vec<Wait>) -> Phase {
        Phase {
            name: name.to_string(),
            package: package(&format!("kstack-{name}")),
            waits,
        }
    }

    fn components() -> ResourceRef {
        ResourceRef::new("kstack.io", "v1alpha1", "components")
    }

    fn scenario_phases() -> Vec<Phase> {
        vec![
            phase("init", vec![deployment("kstack-init")]),
            phase(
                "core",
                vec![wait(WaitSpec::ApiKindPresent {
                    kind: "Platform".to_string(),
                })],
            ),
            phase(
                "config",
                vec![wait(WaitSpec::AllOfKind {
                    resource: components(),
                    namespace: None,
                    condition_type: "Ready".to_string(),
                    want_status: "True".to_string(),
                })],
            ),
            phase("integration", vec![deployment("kstack-integration")]),
        ]
    }

    struct Harness {
        journal: Arc<Mutex<Vec<String>>>,
        cluster: Arc<FakeCluster>,
        connector: Arc<FakeConnector>,
        packages: Arc<FakePackages>,
        deps: InstallDeps,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_connector(FakeConnector::default())
        }

        fn with_connector(connector: FakeConnector) -> Self {
            let journal = Arc::new(Mutex::new(Vec::new()));
            let cluster = Arc::new(FakeCluster::new(journal.clone()));
            let connector = Arc::new(connector);
            let packages = Arc::new(FakePackages::with_journal(journal.clone()));
            let deps = InstallDeps {
                cluster: cluster.clone(),
                connector: connector.clone(),
                packages: packages.clone(),
                progress: Progress::default(),
            };
            Self {
                journal,
                cluster,
                connector,
                packages,
                deps,
            }
        }

        fn journal(&self) -> Vec<String> {
            self.journal.lock().unwrap().clone()
        }

        fn position(&self, entry: &str) -> usize {
            self.journal()
                .iter()
                .position(|e| e == entry)
                .unwrap_or_else(|| panic!("{entry} not in journal: {:?}", self.journal()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_phases_complete_in_order() {
        let h = Harness::new();
        h.cluster.not_ready_for("deployment/kstack/kstack-init", 2);
        let phases = vec![
            phase("init", vec![deployment("kstack-init")]),
            phase("core", vec![deployment("kstack-core")]),
            phase("integration", vec![deployment("kstack-integration")]),
        ];
        let mut sequencer = PhaseSequencer::new(&phases, &h.deps, 3);
        assert_eq!(sequencer.state(), SequencerState::NotStarted);

        let report = sequencer.run(&mut TaskSet::new()).await.unwrap();

        assert_eq!(sequencer.state(), SequencerState::AllDone);
        let names: Vec<&str> = report.phases.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["init", "core", "integration"]);
        assert!(
            h.position("ready:deployment/kstack/kstack-init") < h.position("install:kstack-core")
        );
        assert!(
            h.position("ready:deployment/kstack/kstack-core")
                < h.position("install:kstack-integration")
        );
        assert_eq!(report.phases[0].elapsed, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_config_timeout_aborts_before_integration() {
        let h = Harness::new();
        h.cluster.not_ready_for("deployment/kstack/kstack-init", 1);
        h.packages.fail_times("kstack-core", 2);
        h.cluster.never_ready("components.kstack.io");
        let phases = scenario_phases();
        let mut sequencer = PhaseSequencer::new(&phases, &h.deps, 3);

        let err = sequencer.run(&mut TaskSet::new()).await.unwrap_err();

        assert_eq!(sequencer.state(), SequencerState::Aborted { phase: 2 });
        assert_eq!(err.phase(), Some("config"));
        match &err {
            InstallError::Wait {
                source: WaitError::Timeout {
                    description,
                    attempts,
                    ..
                },
                ..
            } => {
                assert_eq!(
                    description,
                    "condition Ready=True on all components.kstack.io"
                );
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().starts_with("Phase config failed: Timeout waiting for"));

        let calls = h.packages.calls();
        assert_eq!(
            calls,
            vec![
                "install:kstack-init",
                "install:kstack-core",
                "install:kstack-core",
                "install:kstack-core",
                "install:kstack-config",
            ]
        );
        assert!(!h.journal().contains(&"install:kstack-integration".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_failure_names_phase_and_package() {
        let h = Harness::new();
        h.packages.fail_times("kstack-core", u32::MAX);
        let phases = scenario_phases();
        let mut sequencer = PhaseSequencer::new(&phases, &h.deps, 3);

        let err = sequencer.run(&mut TaskSet::new()).await.unwrap_err();

        assert_eq!(sequencer.state(), SequencerState::Aborted { phase: 1 });
        match err {
            InstallError::Deploy { phase, source } => {
                assert_eq!(phase, "core");
                assert_eq!(source.package, "kstack-core");
                assert_eq!(source.attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!h.journal().iter().any(|e| e.starts_with("ready:kinds")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redeploy_takes_upgrade_path() {
        let h = Harness::new();
        let phases = vec![phase("init", vec![])];

        PhaseSequencer::new(&phases, &h.deps, 3)
            .run(&mut TaskSet::new())
            .await
            .unwrap();
        let report = PhaseSequencer::new(&phases, &h.deps, 3)
            .run(&mut TaskSet::new())
            .await
            .unwrap();

        assert_eq!(report.phases[0].path, DeployPath::Upgrade);
        assert_eq!(report.phases[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_trigger_reconnect() {
        let h = Harness::new();
        h.cluster.fail_fetches("deployment/kstack/kstack-init", 2);
        let phases = vec![phase("init", vec![deployment("kstack-init")])];

        PhaseSequencer::new(&phases, &h.deps, 3)
            .run(&mut TaskSet::new())
            .await
            .unwrap();

        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_joined_before_named_phase() {
        let h = Harness::new();
        let phases = vec![
            phase("init", vec![]),
            phase("core", vec![]),
            phase("integration", vec![]),
        ];
        let mut tasks = TaskSet::new();
        let journal = h.journal.clone();
        tasks.launch(
            "chart-preload",
            JoinPoint::BeforePhase("integration".to_string()),
            async move {
                tokio::time::sleep(Duration::from_secs(120)).await;
                journal.lock().unwrap().push("task:chart-preload".to_string());
                Ok(())
            },
        );
        tasks.launch("observability", JoinPoint::End, async {
            Err(anyhow!("grafana never became available"))
        });

        let report = PhaseSequencer::new(&phases, &h.deps, 3)
            .run(&mut tasks)
            .await
            .unwrap();

        assert!(h.position("install:kstack-core") < h.position("task:chart-preload"));
        assert!(h.position("task:chart-preload") < h.position("install:kstack-integration"));
        assert_eq!(report.phases.len(), 3);
        assert_eq!(report.tasks.len(), 2);
        assert_eq!(report.tasks[0].name, "chart-preload");
        assert_eq!(
            report.tasks[1].status,
            TaskStatus::Failed("grafana never became available".to_string())
        );
        assert_eq!(report.failed_tasks().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_keeps_polling() {
        let h = Harness::with_connector(FakeConnector::refusing());
        h.cluster.fail_fetches("deployment/kstack/kstack-init", 2);
        let phases = vec![
            phase("init", vec![deployment("kstack-init")]),
            phase("core", vec![]),
        ];
        let mut sequencer = PhaseSequencer::new(&phases, &h.deps, 3);

        let report = sequencer.run(&mut TaskSet::new()).await.unwrap();

        assert_eq!(h.connector.connects(), 2);
        assert_eq!(report.phases.len(), 2);
        assert!(
            h.position("ready:deployment/kstack/kstack-init") < h.position("install:kstack-core")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_before_phase_does_not_stop_it() {
        let h = Harness::new();
        let phases = vec![
            phase("init", vec![]),
            phase("core", vec![deployment("kstack-core")]),
        ];
        let mut tasks = TaskSet::new();
        tasks.launch("chart-preload", JoinPoint::BeforePhase("core".to_string()), async {
            Err(anyhow!("failed to preload kstack-core"))
        });
        let mut sequencer = PhaseSequencer::new(&phases, &h.deps, 3);

        let report = sequencer.run(&mut tasks).await.unwrap();

        assert_eq!(sequencer.state(), SequencerState::AllDone);
        assert_eq!(report.phases.len(), 2);
        assert!(h.journal().contains(&"install:kstack-core".to_string()));
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(
            report.tasks[0].status,
            TaskStatus::Failed("failed to preload kstack-core".to_string())
        );
    }
}
