//! Per-message task pipelines.
//!
//! A pipeline runs a subscription's tasks against one delivered message:
//! - tasks run strictly in configured order, one subprocess at a time
//! - each task gets its own timeout; a timeout only aborts that task
//! - the message payload (when non-empty) is the stdin of every task
//! - the message is settled after every task with that task's outcome
//! - a failed task never stops the tasks after it
//!
//! Pipelines are started through a [`PipelineLauncher`], which decides how
//! many may be in flight at once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::adapters::{RunError, ShellRunner, ShellTask};
use crate::config::Subscription;
use crate::domain::Message;

use super::lifetime::Lifetime;

/// Outcome of one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed { exit_code: i32, error: String },
}

/// Record of one executed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// Position of the task in the subscription
    pub index: usize,
    pub cmd: String,
    pub duration_ms: u64,
    pub status: TaskStatus,
}

impl TaskReport {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Record of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub subscription: String,
    pub message_id: String,

    /// Executed tasks, in execution order
    pub tasks: Vec<TaskReport>,

    /// Shutdown stopped the pipeline before all tasks ran
    pub interrupted: bool,
}

impl PipelineReport {
    fn new(subscription: &str, message_id: &str) -> Self {
        Self {
            subscription: subscription.to_string(),
            message_id: message_id.to_string(),
            tasks: Vec::new(),
            interrupted: false,
        }
    }

    /// Whether every task ran and succeeded
    pub fn succeeded(&self) -> bool {
        !self.interrupted && self.tasks.iter().all(TaskReport::succeeded)
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| !t.succeeded())
    }
}

/// Run every task of `subscription` against `message`.
///
/// Cancelling `shutdown` kills the running task and stops the pipeline
/// without settling that task, so the queue redelivers the message.
#[instrument(
    skip_all,
    fields(subscription = %subscription.id, message_id = %message.message_id)
)]
pub async fn run_pipeline(
    subscription: &Subscription,
    message: &Message,
    runner: &ShellRunner,
    shutdown: &Lifetime,
) -> PipelineReport {
    let mut report = PipelineReport::new(&subscription.id, &message.message_id);

    for (index, task) in subscription.tasks.iter().enumerate() {
        if shutdown.is_cancelled() {
            report.interrupted = true;
            break;
        }

        let lifetime = match task.effective_timeout() {
            Some(timeout) => shutdown.with_timeout(timeout),
            None => shutdown.child(),
        };

        let mut shell_task = ShellTask::new(&task.cmd);
        if let Some(dir) = &subscription.dir {
            shell_task = shell_task.dir(dir.clone());
        }
        if !message.payload.is_empty() {
            shell_task = shell_task.stdin(message.payload.clone());
        }

        let started = Instant::now();
        let result = runner.run(&lifetime, shell_task).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if matches!(result, Err(RunError::Cancelled)) && shutdown.is_cancelled() {
            warn!(task = index, cmd = %task.cmd, "task killed by shutdown");
            report.interrupted = true;
            break;
        }

        let status = match &result {
            Ok(()) => {
                info!(task = index, cmd = %task.cmd, duration_ms, "task succeeded");
                TaskStatus::Succeeded
            }
            Err(e) => {
                error!(
                    task = index,
                    cmd = %task.cmd,
                    exit_code = e.exit_code(),
                    error = %e,
                    "task failed"
                );
                TaskStatus::Failed {
                    exit_code: e.exit_code(),
                    error: e.to_string(),
                }
            }
        };

        message.settle(result.is_ok());

        report.tasks.push(TaskReport {
            index,
            cmd: task.cmd.clone(),
            duration_ms,
            status,
        });
    }

    report
}

/// A pipeline ready to be started
pub type PipelineFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Decides when a pipeline starts
pub trait PipelineLauncher: Send + Sync {
    fn launch(&self, pipeline: PipelineFuture) -> JoinHandle<()>;
}

/// Starts every pipeline immediately on its own task
#[derive(Debug, Default, Clone, Copy)]
pub struct UnboundedLauncher;

impl PipelineLauncher for UnboundedLauncher {
    fn launch(&self, pipeline: PipelineFuture) -> JoinHandle<()> {
        tokio::spawn(pipeline)
    }
}

/// Runs at most `limit` pipelines at once; the rest wait for a slot
#[derive(Debug, Clone)]
pub struct BoundedLauncher {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl BoundedLauncher {
    /// A zero limit is raised to one; configuration rejects zero before it
    /// gets here.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl PipelineLauncher for BoundedLauncher {
    fn launch(&self, pipeline: PipelineFuture) -> JoinHandle<()> {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            pipeline.await;
        })
    }
}

/// Launcher for an optional concurrency limit
pub fn launcher_for(max_concurrent: Option<usize>) -> Arc<dyn PipelineLauncher> {
    match max_concurrent {
        Some(limit) => Arc::new(BoundedLauncher::new(limit)),
        None => Arc::new(UnboundedLauncher),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PubSubTriggerConfig, TaskConfig};
    use crate::domain::{Acker, Disposition, Settlement};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn subscription(dir: &TempDir, tasks: Vec<TaskConfig>) -> Subscription {
        Subscription {
            id: "build".to_string(),
            dir: Some(dir.path().to_path_buf()),
            trigger: PubSubTriggerConfig {
                topic: "git-trigger".to_string(),
                ..Default::default()
            },
            tasks,
        }
    }

    fn task(cmd: &str) -> TaskConfig {
        TaskConfig {
            cmd: cmd.to_string(),
            timeout: None,
        }
    }

    fn message(payload: &[u8]) -> (Message, mpsc::UnboundedReceiver<Settlement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let msg = Message::new("build", "m-1", payload.to_vec(), Acker::new("ack-1", tx));
        (msg, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Settlement>) -> Vec<Disposition> {
        let mut out = Vec::new();
        while let Ok(s) = rx.try_recv() {
            out.push(s.disposition);
        }
        out
    }

    #[tokio::test]
    async fn test_tasks_run_in_order_in_dir() {
        let dir = TempDir::new().unwrap();
        let sub = subscription(
            &dir,
            vec![task("printf X >> out.txt"), task("printf Y >> out.txt")],
        );
        let (msg, _rx) = message(b"");

        let report = run_pipeline(&sub, &msg, &ShellRunner::with_shells(["sh"]), &Lifetime::new()).await;

        assert!(report.succeeded());
        let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(written, "XY");
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_pipeline() {
        let dir = TempDir::new().unwrap();
        let sub = subscription(&dir, vec![task("exit 3"), task("printf ok > after.txt")]);
        let (msg, mut rx) = message(b"");

        let report = run_pipeline(&sub, &msg, &ShellRunner::with_shells(["sh"]), &Lifetime::new()).await;

        assert_eq!(report.tasks.len(), 2);
        assert!(matches!(
            report.tasks[0].status,
            TaskStatus::Failed { exit_code: 3, .. }
        ));
        assert!(report.tasks[1].succeeded());
        assert!(dir.path().join("after.txt").exists());
        assert_eq!(drain(&mut rx), vec![Disposition::Nack, Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_payload_is_stdin_of_every_task() {
        let dir = TempDir::new().unwrap();
        let sub = subscription(&dir, vec![task("cat > a.txt"), task("cat > b.txt")]);
        let (msg, _rx) = message(b"refs/heads/main");

        run_pipeline(&sub, &msg, &ShellRunner::with_shells(["sh"]), &Lifetime::new()).await;

        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "refs/heads/main");
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "refs/heads/main");
    }

    #[tokio::test]
    async fn test_timeout_only_aborts_its_task() {
        let dir = TempDir::new().unwrap();
        let sub = subscription(
            &dir,
            vec![
                TaskConfig {
                    cmd: "sleep 5".to_string(),
                    timeout: Some(Duration::from_millis(100)),
                },
                task("printf done > after.txt"),
            ],
        );
        let (msg, _rx) = message(b"");

        let started = Instant::now();
        let report = run_pipeline(&sub, &msg, &ShellRunner::with_shells(["sh"]), &Lifetime::new()).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(
            report.tasks[0].status,
            TaskStatus::Failed { exit_code: -1, .. }
        ));
        assert!(report.tasks[1].succeeded());
        assert!(dir.path().join("after.txt").exists());
    }

    #[tokio::test]
    async fn test_shutdown_stops_without_settling() {
        let dir = TempDir::new().unwrap();
        let sub = subscription(&dir, vec![task("sleep 5"), task("printf x > never.txt")]);
        let (msg, mut rx) = message(b"");
        let shutdown = Lifetime::new();

        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let report = run_pipeline(&sub, &msg, &ShellRunner::with_shells(["sh"]), &shutdown).await;

        assert!(report.interrupted);
        assert!(report.tasks.is_empty());
        assert!(drain(&mut rx).is_empty());
        assert!(!dir.path().join("never.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_shell_nacks_each_task() {
        let dir = TempDir::new().unwrap();
        let sub = subscription(&dir, vec![task("true"), task("true")]);
        let (msg, mut rx) = message(b"payload");

        let runner = ShellRunner::with_shells(["no-such-shell"]);
        let report = run_pipeline(&sub, &msg, &runner, &Lifetime::new()).await;

        assert!(!report.interrupted);
        assert_eq!(report.tasks.len(), 2);
        for task in &report.tasks {
            match &task.status {
                TaskStatus::Failed { exit_code, error } => {
                    assert_eq!(*exit_code, 0);
                    assert!(error.contains("no-such-shell"));
                }
                other => panic!("expected failure, got {:?}", other),
            }
        }
        assert_eq!(drain(&mut rx), vec![Disposition::Nack, Disposition::Nack]);
    }

    /// Highest number of pipelines running at once when `jobs` are launched
    async fn peak_concurrency(launcher: &dyn PipelineLauncher, jobs: usize) -> usize {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..jobs)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                launcher.launch(Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }))
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_bounded_launcher_limits_concurrency() {
        let launcher = BoundedLauncher::new(2);

        assert_eq!(peak_concurrency(&launcher, 6).await, 2);
        assert_eq!(launcher.available(), 2);
    }

    #[tokio::test]
    async fn test_launcher_for_limit() {
        assert_eq!(peak_concurrency(launcher_for(None).as_ref(), 6).await, 6);
        assert_eq!(peak_concurrency(launcher_for(Some(3)).as_ref(), 6).await, 3);
    }
}
