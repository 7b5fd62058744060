use std::time::Instant;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use sqlx::Row;
use sqlx::Sqlite;
use sqlx::Transaction;

use tx_protocol::OrchestratorState;
use tx_protocol::OrchestratorStatus;
use tx_protocol::ReconcileReport;

use crate::model::OrchestratorRow;
use crate::model::format_ts;

use super::StateRuntime;

impl StateRuntime {
    pub async fn orchestrator_state(&self) -> anyhow::Result<OrchestratorState> {
        let row: OrchestratorRow = sqlx::query_as(
            r#"
SELECT
    status,
    pid,
    started_at,
    last_reconcile_at,
    pool_size,
    reconcile_interval_seconds,
    heartbeat_interval_seconds,
    lease_duration_seconds,
    metadata
FROM orchestrator_state
WHERE id = 1
            "#,
        )
        .fetch_one(self.pool())
        .await?;
        OrchestratorState::try_from(row)
    }

    /// Moves the singleton row along its lifecycle. Returns `false` when the
    /// current status does not permit the transition.
    pub async fn transition_orchestrator(
        &self,
        to: OrchestratorStatus,
        pid: Option<i64>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;
        let current: String = sqlx::query("SELECT status FROM orchestrator_state WHERE id = 1")
            .fetch_one(&mut *tx)
            .await?
            .try_get("status")?;
        let current =
            OrchestratorStatus::parse(current.as_str()).map_err(|err| anyhow::anyhow!(err))?;
        if !current.can_transition_to(to) {
            tx.commit().await?;
            return Ok(false);
        }
        let started_at = if to == OrchestratorStatus::Starting {
            Some(format_ts(now))
        } else {
            None
        };
        sqlx::query(
            r#"
UPDATE orchestrator_state
SET status = ?,
    pid = CASE WHEN ? IS NOT NULL THEN ? ELSE pid END,
    started_at = COALESCE(?, started_at)
WHERE id = 1
            "#,
        )
        .bind(to.as_str())
        .bind(pid)
        .bind(pid)
        .bind(started_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn configure_orchestrator(
        &self,
        pool_size: i64,
        reconcile_interval_seconds: i64,
        heartbeat_interval_seconds: i64,
        lease_duration_seconds: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
UPDATE orchestrator_state
SET pool_size = ?,
    reconcile_interval_seconds = ?,
    heartbeat_interval_seconds = ?,
    lease_duration_seconds = ?
WHERE id = 1
            "#,
        )
        .bind(pool_size)
        .bind(reconcile_interval_seconds)
        .bind(heartbeat_interval_seconds)
        .bind(lease_duration_seconds)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// The reconciliation pass: restores every invariant a crash, timeout, or
    /// missed heartbeat can break. The entire pass is one immediate
    /// transaction; rerunning it with nothing wrong yields all-zero counts.
    pub async fn reconcile(
        &self,
        heartbeat_threshold: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ReconcileReport> {
        let started = Instant::now();
        let ts = format_ts(now);
        let mut report = ReconcileReport::default();

        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;

        // 1. Workers that stopped heartbeating are dead; their claims come
        //    back to the pool.
        let dead_workers: Vec<String> = sqlx::query(
            r#"
SELECT id FROM workers
WHERE last_heartbeat_at < ? AND status != 'dead'
            "#,
        )
        .bind(format_ts(now - heartbeat_threshold))
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.try_get("id"))
        .collect::<Result<_, _>>()?;
        for worker_id in &dead_workers {
            let claimed_tasks: Vec<String> = sqlx::query(
                r#"
SELECT task_id FROM task_claims
WHERE worker_id = ? AND status = 'active'
                "#,
            )
            .bind(worker_id.as_str())
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|row| row.try_get("task_id"))
            .collect::<Result<_, _>>()?;
            let released = sqlx::query(
                r#"
UPDATE task_claims SET status = 'released'
WHERE worker_id = ? AND status = 'active'
                "#,
            )
            .bind(worker_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            report.expired_claims_released += released;
            for task_id in &claimed_tasks {
                restore_task_status(&mut tx, task_id.as_str(), ts.as_str()).await?;
            }
            sqlx::query(
                r#"
UPDATE workers SET status = 'dead', current_task_id = NULL
WHERE id = ?
                "#,
            )
            .bind(worker_id.as_str())
            .execute(&mut *tx)
            .await?;
            report.dead_workers_found += 1;
        }

        // 2. Claims whose lease ran out expire and free their tasks.
        let expired: Vec<(String, String)> = sqlx::query(
            r#"
SELECT task_id, worker_id FROM task_claims
WHERE status = 'active' AND lease_expires_at < ?
            "#,
        )
        .bind(ts.as_str())
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| -> anyhow::Result<(String, String)> {
            Ok((row.try_get("task_id")?, row.try_get("worker_id")?))
        })
        .collect::<Result<_, _>>()?;
        for (task_id, worker_id) in &expired {
            sqlx::query(
                r#"
UPDATE task_claims SET status = 'expired'
WHERE task_id = ? AND status = 'active'
                "#,
            )
            .bind(task_id.as_str())
            .execute(&mut *tx)
            .await?;
            restore_task_status(&mut tx, task_id.as_str(), ts.as_str()).await?;
            sqlx::query(
                r#"
UPDATE workers SET status = 'idle', current_task_id = NULL
WHERE id = ? AND current_task_id = ? AND status = 'busy'
                "#,
            )
            .bind(worker_id.as_str())
            .bind(task_id.as_str())
            .execute(&mut *tx)
            .await?;
            report.expired_claims_released += 1;
        }

        // 3. Active tasks with no live claim were orphaned by a crash between
        //    claim cleanup and task cleanup.
        let orphaned = sqlx::query(
            r#"
UPDATE tasks
SET status = CASE WHEN EXISTS (
        SELECT 1
        FROM task_dependencies d
        JOIN tasks b ON b.id = d.blocker_id
        WHERE d.blocked_id = tasks.id AND b.status != 'done'
    ) THEN 'blocked' ELSE 'ready' END,
    updated_at = ?
WHERE status = 'active'
  AND id NOT IN (SELECT task_id FROM task_claims WHERE status = 'active')
            "#,
        )
        .bind(ts.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        report.orphaned_tasks_recovered += orphaned;

        // 4. Busy workers with no task are stale.
        let stale_null = sqlx::query(
            r#"
UPDATE workers SET status = 'idle'
WHERE status = 'busy' AND current_task_id IS NULL
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        report.stale_states_fixed += stale_null;

        // 5. Busy workers pointing at a task that is no longer active.
        let stale_mismatch = sqlx::query(
            r#"
UPDATE workers SET status = 'idle', current_task_id = NULL
WHERE status = 'busy'
  AND current_task_id IS NOT NULL
  AND current_task_id NOT IN (SELECT id FROM tasks WHERE status = 'active')
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        report.stale_states_fixed += stale_mismatch;

        // 6. Stamp the pass.
        sqlx::query(
            r#"
UPDATE orchestrator_state SET last_reconcile_at = ? WHERE id = 1
            "#,
        )
        .bind(ts.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        report.reconcile_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }
}

async fn restore_task_status(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: &str,
    ts: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
UPDATE tasks
SET status = CASE WHEN EXISTS (
        SELECT 1
        FROM task_dependencies d
        JOIN tasks b ON b.id = d.blocker_id
        WHERE d.blocked_id = tasks.id AND b.status != 'done'
    ) THEN 'blocked' ELSE 'ready' END,
    updated_at = ?
WHERE id = ? AND status = 'active'
        "#,
    )
    .bind(ts)
    .bind(task_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::seed_task;
    use super::super::test_support::test_now;
    use super::super::test_support::test_runtime;
    use crate::model::WorkerRegisterParams;
    use crate::runtime::ClaimOutcome;
    use crate::runtime::RegistrationOutcome;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tx_protocol::ClaimStatus;
    use tx_protocol::OrchestratorStatus;
    use tx_protocol::TaskStatus;
    use tx_protocol::WorkerStatus;

    #[tokio::test]
    async fn lifecycle_transitions_are_ordered() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        assert!(runtime
            .transition_orchestrator(OrchestratorStatus::Starting, Some(99), now)
            .await
            .expect("transition"));
        // Skipping straight to stopping is rejected.
        assert!(!runtime
            .transition_orchestrator(OrchestratorStatus::Stopping, None, now)
            .await
            .expect("transition"));
        assert!(runtime
            .transition_orchestrator(OrchestratorStatus::Running, None, now)
            .await
            .expect("transition"));
        let state = runtime.orchestrator_state().await.expect("state");
        assert_eq!(state.status, OrchestratorStatus::Running);
        assert_eq!(state.pid, Some(99));
    }

    #[tokio::test]
    async fn dead_worker_recovery() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let task = seed_task(&runtime, "t1", TaskStatus::Ready, now).await;
        let RegistrationOutcome::Registered(worker) = runtime
            .register_worker(
                &WorkerRegisterParams {
                    name: Some("w".to_string()),
                    hostname: "devbox".to_string(),
                    pid: 1,
                    ..WorkerRegisterParams::default()
                },
                4,
                now,
            )
            .await
            .expect("register")
        else {
            panic!("register must succeed");
        };
        let ClaimOutcome::Claimed(_) = runtime
            .claim_task(&task.id, &worker.id, Duration::minutes(30), now)
            .await
            .expect("claim")
        else {
            panic!("claim must succeed");
        };

        // No heartbeat for longer than the threshold.
        let later = now + Duration::seconds(90);
        let report = runtime
            .reconcile(Duration::seconds(30), later)
            .await
            .expect("reconcile");
        assert_eq!(report.dead_workers_found, 1);
        assert!(report.expired_claims_released >= 1);
        assert_eq!(report.orphaned_tasks_recovered, 0);
        assert_eq!(report.stale_states_fixed, 0);

        let worker = runtime
            .get_worker(&worker.id)
            .await
            .expect("get worker")
            .expect("exists");
        assert_eq!(worker.status, WorkerStatus::Dead);
        let task = runtime
            .get_task(&task.id)
            .await
            .expect("get task")
            .expect("exists");
        assert_eq!(task.status, TaskStatus::Ready);
        assert!(runtime
            .find_active_claim_by_task(&task.id)
            .await
            .expect("claim query")
            .is_none());
    }

    #[tokio::test]
    async fn expired_lease_recovery_and_idempotence() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let task = seed_task(&runtime, "t1", TaskStatus::Ready, now).await;
        let RegistrationOutcome::Registered(worker) = runtime
            .register_worker(
                &WorkerRegisterParams {
                    name: Some("w".to_string()),
                    hostname: "devbox".to_string(),
                    pid: 1,
                    ..WorkerRegisterParams::default()
                },
                4,
                now,
            )
            .await
            .expect("register")
        else {
            panic!("register must succeed");
        };
        runtime
            .claim_task(&task.id, &worker.id, Duration::minutes(30), now)
            .await
            .expect("claim");

        // The worker keeps heartbeating but the lease lapses.
        let later = now + Duration::minutes(31);
        runtime
            .heartbeat_worker(
                &worker.id,
                WorkerStatus::Busy,
                Some(&task.id),
                None,
                later,
            )
            .await
            .expect("heartbeat");
        let report = runtime
            .reconcile(Duration::seconds(120), later)
            .await
            .expect("reconcile");
        assert_eq!(report.dead_workers_found, 0);
        assert_eq!(report.expired_claims_released, 1);

        let claim = runtime
            .find_active_claim_by_task(&task.id)
            .await
            .expect("claim query");
        assert!(claim.is_none());
        let task_row = runtime
            .get_task(&task.id)
            .await
            .expect("get task")
            .expect("exists");
        assert_eq!(task_row.status, TaskStatus::Ready);
        let worker_row = runtime
            .get_worker(&worker.id)
            .await
            .expect("get worker")
            .expect("exists");
        assert_eq!(worker_row.status, WorkerStatus::Idle);

        // A second pass over a healthy store changes nothing.
        let again = runtime
            .reconcile(Duration::seconds(120), later)
            .await
            .expect("reconcile");
        assert!(again.is_noop());
    }

    #[tokio::test]
    async fn orphaned_active_task_is_restored() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let task = seed_task(&runtime, "t1", TaskStatus::Ready, now).await;
        // Force the task active without any claim.
        runtime
            .set_task_status(&task.id, TaskStatus::Active, now)
            .await
            .expect("force status");

        let report = runtime
            .reconcile(Duration::seconds(3600), now)
            .await
            .expect("reconcile");
        assert_eq!(report.orphaned_tasks_recovered, 1);
        let task = runtime
            .get_task(&task.id)
            .await
            .expect("get task")
            .expect("exists");
        assert_eq!(task.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn claim_status_history_is_preserved() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let task = seed_task(&runtime, "t1", TaskStatus::Ready, now).await;
        let RegistrationOutcome::Registered(worker) = runtime
            .register_worker(
                &WorkerRegisterParams {
                    name: Some("w".to_string()),
                    hostname: "devbox".to_string(),
                    pid: 1,
                    ..WorkerRegisterParams::default()
                },
                4,
                now,
            )
            .await
            .expect("register")
        else {
            panic!("register must succeed");
        };
        runtime
            .claim_task(&task.id, &worker.id, Duration::minutes(30), now)
            .await
            .expect("claim");
        runtime
            .release_claim(&task.id, &worker.id, false, now)
            .await
            .expect("release");

        // A released claim frees the unique slot for the next claim.
        let outcome = runtime
            .claim_task(&task.id, &worker.id, Duration::minutes(30), now)
            .await
            .expect("claim");
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
        let active = runtime
            .find_active_claim_by_task(&task.id)
            .await
            .expect("claim query")
            .expect("active claim");
        assert_eq!(active.status, ClaimStatus::Active);
    }
}
