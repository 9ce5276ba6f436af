//! Background work that runs alongside the phase sequence.
//!
//! Every task owns a one-shot result slot. The slot is written once by the
//! task and read once by [`TaskHandle::join`]; nothing else is shared.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Where in the sequence a task's outcome is collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinPoint {
    /// Before the named phase starts its deploy.
    BeforePhase(String),
    /// After the last phase.
    End,
}

impl fmt::Display for JoinPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforePhase(phase) => write!(f, "before {phase}"),
            Self::End => write!(f, "end"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Completed,
    Failed(String),
}

/// Result of one background task, available after join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub name: String,
    pub status: TaskStatus,
    pub elapsed: Duration,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Handle to a launched task.
pub struct TaskHandle {
    name: String,
    join_point: JoinPoint,
    slot: Option<oneshot::Receiver<TaskOutcome>>,
    handle: JoinHandle<()>,
    outcome: Option<TaskOutcome>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join_point(&self) -> &JoinPoint {
        &self.join_point
    }

    /// The task's outcome. `None` until [`TaskHandle::join`] has returned.
    pub fn outcome(&self) -> Option<&TaskOutcome> {
        self.outcome.as_ref()
    }

    /// Wait for the task and read its slot. Joining twice returns the same outcome.
    pub async fn join(&mut self) -> TaskOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        let outcome = match self.slot.take() {
            Some(slot) => match slot.await {
                Ok(outcome) => outcome,
                Err(_) => self.lost_outcome().await,
            },
            None => self.lost_outcome().await,
        };

        self.outcome = Some(outcome.clone());
        outcome
    }

    /// The task ended without writing its slot, which only happens on panic or abort.
    async fn lost_outcome(&mut self) -> TaskOutcome {
        let reason = match (&mut self.handle).await {
            Err(e) if e.is_panic() => "task panicked".to_string(),
            Err(e) => format!("task did not finish: {e}"),
            Ok(()) => "task ended without reporting an outcome".to_string(),
        };
        TaskOutcome {
            name: self.name.clone(),
            status: TaskStatus::Failed(reason),
            elapsed: Duration::ZERO,
        }
    }
}

/// Spawn `work` on the runtime and return its handle.
pub fn launch<F>(name: impl Into<String>, join_point: JoinPoint, work: F) -> TaskHandle
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let name = name.into();
    let (tx, rx) = oneshot::channel();
    let task_name = name.clone();

    let handle = tokio::spawn(async move {
        let start = Instant::now();
        let status = match work.await {
            Ok(()) => TaskStatus::Completed,
            Err(e) => TaskStatus::Failed(format!("{e:#}")),
        };
        let outcome = TaskOutcome {
            name: task_name,
            status,
            elapsed: start.elapsed(),
        };
        if tx.send(outcome).is_err() {
            debug!("Background task result dropped: handle no longer exists");
        }
    });

    TaskHandle {
        name,
        join_point,
        slot: Some(rx),
        handle,
        outcome: None,
    }
}

/// Join every handle concurrently, returning outcomes in handle order.
pub async fn join_all_tasks<'a>(
    handles: impl IntoIterator<Item = &'a mut TaskHandle>,
) -> Vec<TaskOutcome> {
    join_all(handles.into_iter().map(TaskHandle::join)).await
}

/// The set of background tasks of one installation run.
#[derive(Default)]
pub struct TaskSet {
    handles: Vec<TaskHandle>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launch<F>(&mut self, name: impl Into<String>, join_point: JoinPoint, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handles.push(launch(name, join_point, work));
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Join the not-yet-joined tasks scheduled for `point`.
    pub async fn join_at(&mut self, point: &JoinPoint) -> Vec<TaskOutcome> {
        join_all_tasks(
            self.handles
                .iter_mut()
                .filter(|h| h.outcome().is_none() && h.join_point() == point),
        )
        .await
    }

    /// Join everything not joined yet, whatever its join point.
    pub async fn join_remaining(&mut self) -> Vec<TaskOutcome> {
        join_all_tasks(self.handles.iter_mut().filter(|h| h.outcome().is_none())).await
    }

    /// Cancel tasks that will not be joined because the run is ending early.
    ///
    /// Each task is aborted and awaited, so its future (and any child process
    /// it owns) is dropped before this returns.
    pub async fn abandon(&mut self) {
        for handle in self.handles.iter_mut().filter(|h| h.outcome().is_none()) {
            warn!(
                "Background task {} abandoned before its join point ({})",
                handle.name(),
                handle.join_point()
            );
            handle.handle.abort();
            if let Err(e) = (&mut handle.handle).await {
                debug!("Background task {} stopped: {}", handle.name(), e);
            }
            handle.outcome = Some(TaskOutcome {
                name: handle.name.clone(),
                status: TaskStatus::Failed("abandoned".to_string()),
                elapsed: Duration::ZERO,
            });
        }
    }
}
