//! Console rendering: live progress, the final summary table and the dry-run plan.

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::install::progress::ProgressEvent;
use crate::install::{InstallPlan, InstallReport, SideWork};
use crate::tasks::TaskStatus;

/// Render progress events until a terminal event arrives or every sender is gone.
pub fn spawn_renderer(mut rx: UnboundedReceiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut console = Console::default();
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            console.render(&event);
            if terminal {
                break;
            }
        }
        console.stop_spinner();
    })
}

#[derive(Default)]
struct Console {
    spinner: Option<ProgressBar>,
}

impl Console {
    fn render(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Deploying { package, .. } => {
                self.start_spinner(format!("Deploying {}", package));
            }
            ProgressEvent::Waiting { description, .. } => {
                self.start_spinner(format!("Waiting for {}", description));
            }
            _ => {
                self.stop_spinner();
                if let Some(line) = format_event(event) {
                    println!("{}", line);
                }
            }
        }
    }

    fn start_spinner(&mut self, message: String) {
        self.stop_spinner();
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner:.cyan} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message(message);
        self.spinner = Some(pb);
    }

    fn stop_spinner(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }
}

/// Console line for an event. Spinner-only events have none.
fn format_event(event: &ProgressEvent) -> Option<String> {
    let line = match event {
        ProgressEvent::PhaseStarted { index, total, name } => format!(
            "\n{}",
            format!("Phase [{}/{}]: {}", index + 1, total, name)
                .cyan()
                .bold()
        ),
        ProgressEvent::Deployed {
            package,
            path,
            attempts,
            ..
        } => {
            let retries = if *attempts > 1 {
                format!(" (after {} attempts)", attempts).yellow().to_string()
            } else {
                String::new()
            };
            format!("  {} {} {}{}", "✓".green(), package.bold(), path, retries)
        }
        ProgressEvent::WaitSatisfied {
            description,
            attempts,
            ..
        } => format!(
            "  {} {} {}",
            "✓".green(),
            description,
            format!("({} check(s))", attempts).dimmed()
        ),
        ProgressEvent::PhaseCompleted { name, elapsed } => format!(
            "  {} Phase {} done in {}",
            "✓".green(),
            name.bold(),
            format_duration(*elapsed)
        ),
        ProgressEvent::TaskLaunched { name, join_point } => format!(
            "{} Background task {} started (joined {})",
            "ℹ".blue(),
            name.bold(),
            join_point
        ),
        ProgressEvent::TaskJoined(outcome) => match &outcome.status {
            TaskStatus::Completed => format!(
                "  {} Background task {} finished in {}",
                "✓".green(),
                outcome.name.bold(),
                format_duration(outcome.elapsed)
            ),
            TaskStatus::Failed(reason) => format!(
                "  {} Background task {} failed: {}",
                "⚠".yellow(),
                outcome.name.bold(),
                reason
            ),
        },
        ProgressEvent::Aborted { phase, error } => {
            let heading = match phase {
                Some(phase) => format!("Installation aborted in phase {}", phase),
                None => "Installation aborted".to_string(),
            };
            format!("\n{} {}\n  {}", "✗".red(), heading.red().bold(), error)
        }
        ProgressEvent::Finished { elapsed } => format!(
            "\n{} {}",
            "✓".green(),
            format!("Installation completed in {}", format_duration(*elapsed))
                .green()
                .bold()
        ),
        ProgressEvent::Deploying { .. } | ProgressEvent::Waiting { .. } => return None,
    };
    Some(line)
}

/// `4.2s`, or `3m 07s` from one minute up.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

/// Row for the phase summary table.
#[derive(Tabled)]
struct PhaseRow {
    #[tabled(rename = "PHASE")]
    phase: String,
    #[tabled(rename = "PACKAGE")]
    package: String,
    #[tabled(rename = "RESULT")]
    result: String,
    #[tabled(rename = "ATTEMPTS")]
    attempts: u32,
    #[tabled(rename = "STARTED")]
    started: String,
    #[tabled(rename = "DURATION")]
    duration: String,
}

/// Row for the background task table.
#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "TASK")]
    task: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "DURATION")]
    duration: String,
}

fn phase_rows(report: &InstallReport) -> Vec<PhaseRow> {
    report
        .phases
        .iter()
        .map(|p| PhaseRow {
            phase: p.name.clone(),
            package: p.package.clone(),
            result: p.path.to_string(),
            attempts: p.attempts,
            started: p.started_at.format("%H:%M:%S").to_string(),
            duration: format_duration(p.elapsed),
        })
        .collect()
}

fn task_rows(report: &InstallReport) -> Vec<TaskRow> {
    report
        .tasks
        .iter()
        .map(|t| TaskRow {
            task: t.name.clone(),
            status: match &t.status {
                TaskStatus::Completed => "Completed".green().to_string(),
                TaskStatus::Failed(reason) => format!("Failed: {}", reason).yellow().to_string(),
            },
            duration: format_duration(t.elapsed),
        })
        .collect()
}

/// Print the per-phase and background task summary of a finished run.
pub fn print_summary(report: &InstallReport) {
    println!();
    println!("{}", "Summary:".bold());

    let mut table = Table::new(phase_rows(report));
    apply_table_style(&mut table);
    println!("{}", table);

    let tasks = task_rows(report);
    if !tasks.is_empty() {
        println!();
        println!("{}", "Background tasks:".bold());
        let mut table = Table::new(tasks);
        apply_table_style(&mut table);
        println!("{}", table);
    }

    let failed = report.failed_tasks().count();
    if failed > 0 {
        println!();
        println!(
            "  {} {} background task(s) failed; installed phases are unaffected",
            "⚠".yellow(),
            failed.to_string().yellow()
        );
    }
}

/// Human-readable description of a plan, as printed by `--dry-run`.
pub fn format_plan(plan: &InstallPlan) -> String {
    let mut out = format!("Install plan ({} phases):\n", plan.phases.len());

    for (i, phase) in plan.phases.iter().enumerate() {
        out.push_str(&format!("  {}. {}: {}\n", i + 1, phase.name, phase.package));
        out.push_str(&format!("       chart: {}\n", phase.package.chart));
        for overlay in &phase.package.overlays {
            out.push_str(&format!("       values: {}\n", overlay.display()));
        }
        for wait in &phase.waits {
            out.push_str(&format!("       wait: {}\n", wait));
        }
    }

    if !plan.side_installs.is_empty() {
        out.push_str("Background tasks:\n");
        for side in &plan.side_installs {
            let work = match &side.work {
                SideWork::Package { package, waits } => {
                    format!("deploy {} then {} wait(s)", package, waits.len())
                }
                SideWork::Preload { packages } => format!("preload {} package(s)", packages.len()),
            };
            out.push_str(&format!(
                "  - {}: {}, joined {}\n",
                side.name, work, side.join_point
            ));
        }
    }

    out
}

pub fn print_plan(plan: &InstallPlan) {
    print!("{}", format_plan(plan));
    println!("{}", "[DRY RUN] No changes were made.".yellow());
}

fn apply_table_style(table: &mut Table) {
    use tabled::settings::object::Columns;
    use tabled::settings::themes::Theme;
    use tabled::settings::{Modify, Padding};

    let mut theme = Theme::from_style(Style::empty());
    theme.remove_horizontal_lines();
    table.with(theme);
    table.with(Modify::new(Columns::new(..)).with(Padding::new(0, 2, 0, 0)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::{Phase, PhaseRecord, SideInstall};
    use crate::package::DeployPath;
    use crate::package::testing::package;
    use crate::tasks::{JoinPoint, TaskOutcome};
    use crate::wait::{PollSettings, Wait, WaitSpec};
    use chrono::Local;

    fn plain() {
        colored::control::set_override(false);
    }

    fn report() -> InstallReport {
        InstallReport {
            phases: vec![PhaseRecord {
                name: "core".to_string(),
                package: "kstack-operator".to_string(),
                path: DeployPath::Upgrade,
                attempts: 2,
                started_at: Local::now(),
                elapsed: Duration::from_secs(95),
            }],
            tasks: vec![TaskOutcome {
                name: "observability".to_string(),
                status: TaskStatus::Failed("grafana timed out".to_string()),
                elapsed: Duration::from_millis(1500),
            }],
            elapsed: Duration::from_secs(120),
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(4200)), "4.2s");
        assert_eq!(format_duration(Duration::from_secs(187)), "3m 07s");
        assert_eq!(format_duration(Duration::ZERO), "0.0s");
    }

    #[test]
    fn test_format_event_lines() {
        plain();
        let deployed = format_event(&ProgressEvent::Deployed {
            phase: "core".to_string(),
            package: "kstack-operator".to_string(),
            path: DeployPath::Install,
            attempts: 3,
        })
        .unwrap();
        assert_eq!(deployed, "  ✓ kstack-operator installed (after 3 attempts)");

        let aborted = format_event(&ProgressEvent::Aborted {
            phase: Some("config".to_string()),
            error: "Phase config failed: Timeout".to_string(),
        })
        .unwrap();
        assert!(aborted.contains("Installation aborted in phase config"));
        assert!(aborted.ends_with("Phase config failed: Timeout"));

        assert!(
            format_event(&ProgressEvent::Waiting {
                phase: "core".to_string(),
                description: "API kind Platform present".to_string(),
            })
            .is_none()
        );
    }

    #[test]
    fn test_summary_rows() {
        plain();
        let report = report();
        let phases = phase_rows(&report);
        assert_eq!(phases[0].result, "upgraded");
        assert_eq!(phases[0].attempts, 2);
        assert_eq!(phases[0].duration, "1m 35s");

        let tasks = task_rows(&report);
        assert_eq!(tasks[0].status, "Failed: grafana timed out");
        assert_eq!(tasks[0].duration, "1.5s");
    }

    #[test]
    fn test_format_plan() {
        let plan = InstallPlan {
            phases: vec![Phase {
                name: "init".to_string(),
                package: package("kstack-crds"),
                waits: vec![Wait {
                    spec: WaitSpec::ApiKindPresent {
                        kind: "Platform".to_string(),
                    },
                    poll: PollSettings::new(Duration::from_secs(5), 60),
                }],
            }],
            side_installs: vec![SideInstall {
                name: "chart-preload".to_string(),
                join_point: JoinPoint::BeforePhase("integration".to_string()),
                work: SideWork::Preload {
                    packages: vec![package("kstack-crds")],
                },
            }],
        };

        let text = format_plan(&plan);
        assert!(text.starts_with("Install plan (1 phases):\n"));
        assert!(text.contains("  1. init: kstack-crds@1.4.0 (kstack)\n"));
        assert!(text.contains("wait: API kind Platform present (every 5s, up to 60 attempts)"));
        assert!(text.contains("  - chart-preload: preload 1 package(s), joined before integration"));
    }

    #[tokio::test]
    async fn test_renderer_stops_on_terminal_event() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_renderer(rx);
        tx.send(ProgressEvent::Finished {
            elapsed: Duration::from_secs(1),
        })
        .unwrap();
        // The sender is still alive; only the terminal event ends the renderer.
        handle.await.unwrap();
        drop(tx);
    }
}
