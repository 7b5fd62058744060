use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use tx_protocol::OrchestratorError;
use tx_protocol::RunId;
use tx_protocol::RunStatus;
use tx_protocol::Task;
use tx_protocol::TaskId;
use tx_protocol::Worker;
use tx_protocol::WorkerStatus;
use tx_state::RunCreateParams;
use tx_state::StateRuntime;
use tx_state::WorkerRegisterParams;

use crate::kernel::TaskKernel;
use crate::orchestrator::Orchestrator;

/// How long the loop idles when no task is ready.
const IDLE_POLL: std::time::Duration = std::time::Duration::from_secs(5);

/// User hook executed for each claimed task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &ExecContext) -> anyhow::Result<ExecOutcome>;

    /// Where the executor will write IO streams, when it captures them.
    fn capture_io(&self, task: &Task) -> Option<IoCapture> {
        let _ = task;
        None
    }
}

pub struct ExecContext {
    pub run_id: RunId,
    pub worker_id: tx_protocol::WorkerId,
}

pub struct ExecOutcome {
    pub exit_code: i64,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IoCapture {
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub transcript_path: Option<String>,
}

/// Headless worker: claim, run the hook, record the run, release. A
/// lease-renewal fiber guards each claimed task; a heartbeat fiber keeps the
/// worker row alive. Losing a renewal means another worker may already own
/// the task, so the loop shuts down gracefully.
pub struct WorkerLoop {
    state: Arc<StateRuntime>,
    orchestrator: Orchestrator,
    kernel: TaskKernel,
    executor: Arc<dyn TaskExecutor>,
    agent_name: String,
    clock: crate::clock::Clock,
    tasks_completed: Arc<AtomicU64>,
}

impl WorkerLoop {
    pub fn new(
        state: Arc<StateRuntime>,
        orchestrator: Orchestrator,
        kernel: TaskKernel,
        executor: Arc<dyn TaskExecutor>,
        agent_name: impl Into<String>,
        clock: crate::clock::Clock,
    ) -> Self {
        Self {
            state,
            orchestrator,
            kernel,
            executor,
            agent_name: agent_name.into(),
            clock,
            tasks_completed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> Result<(), OrchestratorError> {
        let worker = self
            .orchestrator
            .register(WorkerRegisterParams {
                name: Some(self.agent_name.clone()),
                hostname: hostname(),
                pid: std::process::id() as i64,
                ..WorkerRegisterParams::default()
            })
            .await?;
        info!(worker_id = %worker.id, "worker registered");

        let (task_tx, task_rx) = tokio::sync::watch::channel::<Option<TaskId>>(None);
        let heartbeat = self.spawn_heartbeat_fiber(worker.clone(), task_rx, token.clone());

        let result = self.claim_loop(&worker, &task_tx, &token).await;

        self.state
            .set_worker_status(&worker.id, WorkerStatus::Stopping)
            .await?;
        token.cancel();
        let _ = heartbeat.await;
        info!(worker_id = %worker.id, "worker stopped");
        result
    }

    async fn claim_loop(
        &self,
        worker: &Worker,
        task_tx: &tokio::sync::watch::Sender<Option<TaskId>>,
        token: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        while !token.is_cancelled() {
            let ready = self.kernel.get_ready(1).await?;
            let Some(next) = ready.into_iter().next() else {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                }
            };
            let task = next.task;
            match self.orchestrator.claim(&task.id, &worker.id).await {
                Ok(_claim) => {}
                Err(
                    OrchestratorError::AlreadyClaimed { .. }
                    | OrchestratorError::TaskNotReady { .. },
                ) => continue,
                Err(err) => return Err(err),
            }
            let _ = task_tx.send(Some(task.id.clone()));
            let keep_going = self.execute_claimed(worker, &task, token).await?;
            let _ = task_tx.send(None);
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    /// Runs one claimed task; returns `false` when the loop must shut down
    /// because the lease could not be held.
    async fn execute_claimed(
        &self,
        worker: &Worker,
        task: &Task,
        token: &CancellationToken,
    ) -> Result<bool, OrchestratorError> {
        let run = self
            .state
            .create_run(
                &RunCreateParams {
                    task_id: Some(task.id.clone()),
                    agent: self.agent_name.clone(),
                    pid: Some(std::process::id() as i64),
                    ..RunCreateParams::default()
                },
                self.now(),
            )
            .await?;
        if let Some(io) = self.executor.capture_io(task) {
            self.state
                .set_run_io_paths(
                    &run.id,
                    io.stdout_path.as_deref(),
                    io.stderr_path.as_deref(),
                    io.transcript_path.as_deref(),
                )
                .await?;
        }

        let lease_lost = CancellationToken::new();
        let renewal = self.spawn_renewal_fiber(
            worker.id.clone(),
            task.id.clone(),
            lease_lost.clone(),
            token.clone(),
        );

        let ctx = ExecContext {
            run_id: run.id.clone(),
            worker_id: worker.id.clone(),
        };
        let outcome = tokio::select! {
            outcome = self.executor.execute(task, &ctx) => Some(outcome),
            _ = lease_lost.cancelled() => None,
        };
        renewal.abort();

        match outcome {
            Some(Ok(outcome)) => {
                let status = if outcome.exit_code == 0 {
                    RunStatus::Completed
                } else {
                    RunStatus::Failed
                };
                self.state
                    .finish_run(
                        &run.id,
                        status,
                        Some(outcome.exit_code),
                        outcome.summary.as_deref(),
                        None,
                        self.now(),
                    )
                    .await?;
                if outcome.exit_code == 0 {
                    // Completion finishes the claim and frees the worker in
                    // the same transaction.
                    self.kernel.done(&task.id).await?;
                    self.tasks_completed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.orchestrator
                        .release(&task.id, &worker.id, false)
                        .await?;
                }
                Ok(true)
            }
            Some(Err(err)) => {
                self.state
                    .finish_run(
                        &run.id,
                        RunStatus::Failed,
                        None,
                        None,
                        Some(err.to_string().as_str()),
                        self.now(),
                    )
                    .await?;
                self.orchestrator
                    .release(&task.id, &worker.id, false)
                    .await?;
                Ok(true)
            }
            None => {
                // The lease is gone; another worker may already hold the
                // task, so do not touch its status.
                warn!(task_id = %task.id, "lease renewal failed; shutting down gracefully");
                self.state
                    .finish_run(
                        &run.id,
                        RunStatus::Cancelled,
                        None,
                        None,
                        Some("lease renewal failed"),
                        self.now(),
                    )
                    .await?;
                Ok(false)
            }
        }
    }

    fn spawn_renewal_fiber(
        &self,
        worker_id: tx_protocol::WorkerId,
        task_id: TaskId,
        lease_lost: CancellationToken,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        // Renew well inside the lease window.
        let interval = std::time::Duration::from_secs(
            (self.orchestrator.config().heartbeat_interval_seconds.max(1) * 10) as u64,
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = orchestrator.renew(&task_id, &worker_id).await {
                            warn!(task_id = %task_id, "lease renewal failed: {err}");
                            lease_lost.cancel();
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_heartbeat_fiber(
        &self,
        worker: Worker,
        task_rx: tokio::sync::watch::Receiver<Option<TaskId>>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let interval = std::time::Duration::from_secs(
            self.orchestrator.config().heartbeat_interval_seconds.max(1) as u64,
        );
        let completed = self.tasks_completed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let current = task_rx.borrow().clone();
                        let status = if current.is_some() {
                            WorkerStatus::Busy
                        } else {
                            WorkerStatus::Idle
                        };
                        let metrics = json!({
                            "tasks_completed": completed.load(Ordering::Relaxed),
                        });
                        if let Err(err) = orchestrator
                            .heartbeat(&worker.id, status, current.as_ref(), Some(&metrics))
                            .await
                        {
                            warn!(worker_id = %worker.id, "heartbeat failed: {err}");
                        }
                    }
                }
            }
        })
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::orchestrator::OrchestratorConfig;
    use crate::test_support::test_epoch;
    use crate::test_support::test_state;
    use pretty_assertions::assert_eq;
    use tx_protocol::TaskStatus;
    use tx_state::TaskCreateParams;

    struct ScriptedExecutor {
        flaky_attempts: AtomicU64,
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, task: &Task, _ctx: &ExecContext) -> anyhow::Result<ExecOutcome> {
            if task.title.contains("flaky") && self.flaky_attempts.fetch_add(1, Ordering::Relaxed) == 0 {
                Ok(ExecOutcome {
                    exit_code: 1,
                    summary: Some("did not work".to_string()),
                })
            } else {
                Ok(ExecOutcome {
                    exit_code: 0,
                    summary: Some("done".to_string()),
                })
            }
        }

        fn capture_io(&self, _task: &Task) -> Option<IoCapture> {
            Some(IoCapture {
                stdout_path: Some("/tmp/run-stdout.log".to_string()),
                ..IoCapture::default()
            })
        }
    }

    async fn worker_fixture() -> (Arc<StateRuntime>, WorkerLoop, Clock, tempfile::TempDir) {
        let (state, dir) = test_state().await;
        let clock = Clock::fixed(test_epoch());
        let orchestrator = Orchestrator::new(
            state.clone(),
            OrchestratorConfig {
                pool_size: 4,
                lease_duration_seconds: 1800,
                heartbeat_interval_seconds: 30,
                reconcile_interval_seconds: 60,
                max_renewals: 10,
                missed_heartbeats: 1,
            },
            clock.clone(),
        );
        let kernel = TaskKernel::new(state.clone(), clock.clone());
        let worker = WorkerLoop::new(
            state.clone(),
            orchestrator,
            kernel,
            Arc::new(ScriptedExecutor {
                flaky_attempts: AtomicU64::new(0),
            }),
            "test-agent",
            clock.clone(),
        );
        (state, worker, clock, dir)
    }

    #[tokio::test]
    async fn executes_ready_tasks_and_records_runs() {
        let (state, worker, clock, _dir) = worker_fixture().await;
        let ok_task = state
            .create_task(
                &TaskCreateParams {
                    title: "build it".to_string(),
                    status: TaskStatus::Ready,
                    ..TaskCreateParams::default()
                },
                clock.now(),
            )
            .await
            .expect("task");
        let fail_task = state
            .create_task(
                &TaskCreateParams {
                    title: "flaky build".to_string(),
                    status: TaskStatus::Ready,
                    ..TaskCreateParams::default()
                },
                clock.now(),
            )
            .await
            .expect("task");

        // Run until every task is done, then cancel; the flaky task fails
        // once and is re-claimed.
        let token = CancellationToken::new();
        let stopper = token.clone();
        let state_watch = state.clone();
        let watch_ids = vec![ok_task.id.clone(), fail_task.id.clone()];
        let watcher = tokio::spawn(async move {
            loop {
                let mut all_done = true;
                for id in &watch_ids {
                    let task = state_watch.get_task(id).await.expect("get").expect("exists");
                    if task.status != TaskStatus::Done {
                        all_done = false;
                        break;
                    }
                }
                if all_done {
                    stopper.cancel();
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        });
        worker.run(token).await.expect("worker loop");
        watcher.await.expect("watcher");

        let ok_task = state
            .get_task(&ok_task.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(ok_task.status, TaskStatus::Done);
        let flaky = state
            .get_task(&fail_task.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(flaky.status, TaskStatus::Done);

        let runs = state.list_runs(None).await.expect("runs");
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|run| run.stdout_path.is_some()));
        let statuses: Vec<RunStatus> = runs.iter().map(|run| run.status).collect();
        assert!(statuses.contains(&RunStatus::Completed));
        assert!(statuses.contains(&RunStatus::Failed));
    }
}
