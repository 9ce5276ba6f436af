//! One-way channel of installation milestones for the console renderer.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::package::DeployPath;
use crate::tasks::TaskOutcome;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    PhaseStarted {
        index: usize,
        total: usize,
        name: String,
    },
    Deploying {
        phase: String,
        package: String,
    },
    Deployed {
        phase: String,
        package: String,
        path: DeployPath,
        attempts: u32,
    },
    Waiting {
        phase: String,
        description: String,
    },
    WaitSatisfied {
        phase: String,
        description: String,
        attempts: u32,
    },
    PhaseCompleted {
        name: String,
        elapsed: Duration,
    },
    TaskLaunched {
        name: String,
        join_point: String,
    },
    TaskJoined(TaskOutcome),
    Aborted {
        phase: Option<String>,
        error: String,
    },
    Finished {
        elapsed: Duration,
    },
}

impl ProgressEvent {
    /// No event follows a terminal one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted { .. } | Self::Finished { .. })
    }
}

/// Sending half of the progress channel. Cloned freely; sends never block or fail.
///
/// The default sink drops every event.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Progress {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // Renderer gone; progress is best-effort.
            let _ = tx.send(event);
        }
    }
}
