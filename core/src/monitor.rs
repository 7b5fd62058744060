use std::sync::Arc;

use chrono::Duration;
use tracing::info;

use tx_protocol::Run;
use tx_protocol::RunHeartbeat;
use tx_protocol::RunStatus;
use tx_protocol::TaskStatus;
use tx_state::StateRuntime;

use crate::clock::Clock;

/// Watches run heartbeats and reaps stalled runs. Stalled means the
/// transcript has been idle past the threshold, or no heartbeat has arrived
/// in as long.
pub struct RunMonitor {
    state: Arc<StateRuntime>,
    clock: Clock,
    stall_threshold: Duration,
}

impl RunMonitor {
    pub fn new(state: Arc<StateRuntime>, clock: Clock, stall_threshold: Duration) -> Self {
        Self {
            state,
            clock,
            stall_threshold,
        }
    }

    pub async fn record_heartbeat(&self, heartbeat: &RunHeartbeat) -> anyhow::Result<bool> {
        self.state
            .record_run_heartbeat(heartbeat, self.clock.now())
            .await
    }

    pub async fn stalled_runs(&self) -> anyhow::Result<Vec<Run>> {
        self.state
            .find_stalled_runs(self.stall_threshold, self.clock.now())
            .await
    }

    /// Cancels a stalled run; optionally returns its task to the ready
    /// queue so another worker can pick it up.
    pub async fn reap(&self, run: &Run, reset_task: bool) -> anyhow::Result<bool> {
        let now = self.clock.now();
        let reaped = self
            .state
            .finish_run(
                &run.id,
                RunStatus::Cancelled,
                None,
                None,
                Some("stalled: no transcript activity within the threshold"),
                now,
            )
            .await?;
        if !reaped {
            return Ok(false);
        }
        info!(run_id = %run.id, "reaped stalled run");
        if reset_task
            && let Some(task_id) = run.task_id.as_ref()
            && let Some(task) = self.state.get_task(task_id).await?
            && task.status == TaskStatus::Active
        {
            if let Some(claim) = self.state.find_active_claim_by_task(task_id).await? {
                self.state
                    .release_claim(task_id, &claim.worker_id, false, now)
                    .await?;
            } else {
                self.state
                    .set_task_status(task_id, TaskStatus::Ready, now)
                    .await?;
            }
        }
        Ok(true)
    }

    /// One sweep: reap everything stalled. Returns how many were reaped.
    pub async fn sweep(&self, reset_tasks: bool) -> anyhow::Result<u64> {
        let mut reaped = 0;
        for run in self.stalled_runs().await? {
            if self.reap(&run, reset_tasks).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_epoch;
    use crate::test_support::test_state;
    use pretty_assertions::assert_eq;
    use tx_state::RunCreateParams;
    use tx_state::TaskCreateParams;

    #[tokio::test]
    async fn sweep_reaps_stalled_runs_and_resets_tasks() {
        let (state, _dir) = test_state().await;
        let clock = Clock::fixed(test_epoch());
        let task = state
            .create_task(
                &TaskCreateParams {
                    title: "t".to_string(),
                    status: TaskStatus::Ready,
                    ..TaskCreateParams::default()
                },
                clock.now(),
            )
            .await
            .expect("task");
        state
            .set_task_status(&task.id, TaskStatus::Active, clock.now())
            .await
            .expect("force active");
        let run = state
            .create_run(
                &RunCreateParams {
                    task_id: Some(task.id.clone()),
                    agent: "agent".to_string(),
                    ..RunCreateParams::default()
                },
                clock.now(),
            )
            .await
            .expect("run");

        let monitor = RunMonitor::new(state.clone(), clock.clone(), Duration::seconds(300));
        // Fresh run: nothing stalled yet.
        assert_eq!(monitor.sweep(true).await.expect("sweep"), 0);

        clock.advance(Duration::seconds(301));
        assert_eq!(monitor.sweep(true).await.expect("sweep"), 1);

        let run = state.get_run(&run.id).await.expect("get").expect("exists");
        assert_eq!(run.status, RunStatus::Cancelled);
        let task = state
            .get_task(&task.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(task.status, TaskStatus::Ready);

        // Heartbeats keep a run alive.
        let live = state
            .create_run(
                &RunCreateParams {
                    agent: "agent".to_string(),
                    ..RunCreateParams::default()
                },
                clock.now(),
            )
            .await
            .expect("run");
        clock.advance(Duration::seconds(200));
        monitor
            .record_heartbeat(&RunHeartbeat {
                run_id: live.id.clone(),
                check_at: None,
                activity_at: Some(clock.now()),
                stdout_bytes: 10,
                stderr_bytes: 0,
                transcript_bytes: 100,
                delta_bytes: None,
            })
            .await
            .expect("heartbeat");
        clock.advance(Duration::seconds(200));
        assert_eq!(monitor.sweep(true).await.expect("sweep"), 0);
    }
}
