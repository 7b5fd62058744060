use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;

use tx_protocol::TaskId;
use tx_protocol::Worker;
use tx_protocol::WorkerId;
use tx_protocol::WorkerStatus;

use crate::model::WorkerRegisterParams;
use crate::model::WorkerRow;
use crate::model::format_ts;

use super::StateRuntime;

const WORKER_COLUMNS: &str = r#"
    id,
    name,
    hostname,
    pid,
    status,
    current_task_id,
    capabilities,
    metadata,
    registered_at,
    last_heartbeat_at
"#;

/// Result of a registration attempt. Capacity is enforced atomically with a
/// count-and-insert under the immediate lock.
#[derive(Debug, Clone)]
pub enum RegistrationOutcome {
    Registered(Worker),
    CapacityExhausted { live_workers: i64, pool_size: i64 },
}

impl StateRuntime {
    pub async fn register_worker(
        &self,
        params: &WorkerRegisterParams,
        pool_size: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RegistrationOutcome> {
        let id = WorkerId::generate();
        let name = params
            .name
            .clone()
            .unwrap_or_else(|| format!("worker-{}", &id.as_str()[..8]));
        let ts = format_ts(now);

        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;
        let live_workers: i64 = sqlx::query(
            r#"
SELECT COUNT(*) AS live
FROM workers
WHERE status IN ('starting', 'idle', 'busy')
            "#,
        )
        .fetch_one(&mut *tx)
        .await?
        .try_get("live")?;
        if live_workers >= pool_size {
            tx.rollback().await?;
            return Ok(RegistrationOutcome::CapacityExhausted {
                live_workers,
                pool_size,
            });
        }

        sqlx::query(
            r#"
INSERT INTO workers (
    id,
    name,
    hostname,
    pid,
    status,
    current_task_id,
    capabilities,
    metadata,
    registered_at,
    last_heartbeat_at
) VALUES (?, ?, ?, ?, 'starting', NULL, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(name.as_str())
        .bind(params.hostname.as_str())
        .bind(params.pid)
        .bind(serde_json::to_string(&params.capabilities)?)
        .bind(serde_json::to_string(&params.metadata)?)
        .bind(ts.as_str())
        .bind(ts.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let worker = self
            .get_worker(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load registered worker {id}"))?;
        Ok(RegistrationOutcome::Registered(worker))
    }

    pub async fn get_worker(&self, id: &WorkerId) -> anyhow::Result<Option<Worker>> {
        let row = sqlx::query_as::<_, WorkerRow>(&format!(
            r#"
SELECT {WORKER_COLUMNS}
FROM workers
WHERE id = ?
            "#
        ))
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.map(Worker::try_from).transpose()
    }

    pub async fn list_workers(&self) -> anyhow::Result<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(&format!(
            r#"
SELECT {WORKER_COLUMNS}
FROM workers
ORDER BY registered_at ASC, id ASC
            "#
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Worker::try_from).collect()
    }

    /// Periodic liveness update. Metrics land in the worker metadata map so
    /// readers never need a second table.
    pub async fn heartbeat_worker(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
        current_task_id: Option<&TaskId>,
        metrics: Option<&Value>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = match metrics {
            Some(metrics) => {
                sqlx::query(
                    r#"
UPDATE workers
SET last_heartbeat_at = ?, status = ?, current_task_id = ?,
    metadata = json_patch(metadata, ?)
WHERE id = ?
                    "#,
                )
                .bind(format_ts(now))
                .bind(status.as_str())
                .bind(current_task_id.map(TaskId::as_str))
                .bind(serde_json::to_string(metrics)?)
                .bind(id.as_str())
                .execute(self.pool())
                .await?
            }
            None => {
                sqlx::query(
                    r#"
UPDATE workers
SET last_heartbeat_at = ?, status = ?, current_task_id = ?
WHERE id = ?
                    "#,
                )
                .bind(format_ts(now))
                .bind(status.as_str())
                .bind(current_task_id.map(TaskId::as_str))
                .bind(id.as_str())
                .execute(self.pool())
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_worker_status(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
UPDATE workers
SET status = ?
WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(id.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_workers_by_last_heartbeat_before(
        &self,
        threshold: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(&format!(
            r#"
SELECT {WORKER_COLUMNS}
FROM workers
WHERE last_heartbeat_at < ? AND status != 'dead'
            "#
        ))
        .bind(format_ts(threshold))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Worker::try_from).collect()
    }
}
