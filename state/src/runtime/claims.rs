use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use sqlx::Row;

use tx_protocol::TaskClaim;
use tx_protocol::TaskId;
use tx_protocol::TaskStatus;
use tx_protocol::WorkerId;

use crate::model::ClaimRow;
use crate::model::format_ts;

use super::StateRuntime;

const CLAIM_COLUMNS: &str = r#"
    id,
    task_id,
    worker_id,
    status,
    claimed_at,
    lease_expires_at,
    renewal_count
"#;

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(TaskClaim),
    AlreadyClaimed,
    TaskNotFound,
    TaskNotReady,
    WorkerNotFound,
    WorkerDead,
}

#[derive(Debug, Clone)]
pub enum RenewOutcome {
    Renewed(TaskClaim),
    NotFound,
    Expired,
    MaxRenewalsExceeded { max: i64 },
}

#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Released { task_status: TaskStatus },
    NotFound,
}

impl StateRuntime {
    /// The atomic claim step: readiness is re-checked inside the immediate
    /// transaction, then the claim insert, the task transition, and the
    /// worker transition commit together. A unique-constraint hit on the
    /// partial active-claim index maps to `AlreadyClaimed`.
    pub async fn claim_task(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ClaimOutcome> {
        let ts = format_ts(now);
        let lease_expires_at = format_ts(now + lease_duration);

        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;

        let worker_status: Option<String> = sqlx::query(
            r#"
SELECT status FROM workers WHERE id = ?
            "#,
        )
        .bind(worker_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("status"))
        .transpose()?;
        match worker_status.as_deref() {
            None => {
                tx.commit().await?;
                return Ok(ClaimOutcome::WorkerNotFound);
            }
            Some("dead") => {
                tx.commit().await?;
                return Ok(ClaimOutcome::WorkerDead);
            }
            Some(_) => {}
        }

        let task_status: Option<String> = sqlx::query(
            r#"
SELECT status FROM tasks WHERE id = ?
            "#,
        )
        .bind(task_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("status"))
        .transpose()?;
        let Some(task_status) = task_status else {
            tx.commit().await?;
            return Ok(ClaimOutcome::TaskNotFound);
        };
        let parsed = TaskStatus::parse(task_status.as_str()).map_err(|err| anyhow::anyhow!(err))?;
        if !parsed.is_claimable() {
            tx.commit().await?;
            return Ok(ClaimOutcome::TaskNotReady);
        }

        let open_blockers: i64 = sqlx::query(
            r#"
SELECT COUNT(*) AS open
FROM task_dependencies d
JOIN tasks b ON b.id = d.blocker_id
WHERE d.blocked_id = ? AND b.status != 'done'
            "#,
        )
        .bind(task_id.as_str())
        .fetch_one(&mut *tx)
        .await?
        .try_get("open")?;
        if open_blockers > 0 {
            tx.commit().await?;
            return Ok(ClaimOutcome::TaskNotReady);
        }

        let inserted = sqlx::query(
            r#"
INSERT INTO task_claims (task_id, worker_id, status, claimed_at, lease_expires_at, renewal_count)
VALUES (?, ?, 'active', ?, ?, 0)
            "#,
        )
        .bind(task_id.as_str())
        .bind(worker_id.as_str())
        .bind(ts.as_str())
        .bind(lease_expires_at.as_str())
        .execute(&mut *tx)
        .await;
        if let Err(err) = inserted {
            let unique = err
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation());
            tx.rollback().await?;
            if unique {
                return Ok(ClaimOutcome::AlreadyClaimed);
            }
            return Err(err.into());
        }

        sqlx::query(
            r#"
UPDATE tasks SET status = 'active', updated_at = ? WHERE id = ?
            "#,
        )
        .bind(ts.as_str())
        .bind(task_id.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
UPDATE workers SET status = 'busy', current_task_id = ? WHERE id = ?
            "#,
        )
        .bind(task_id.as_str())
        .bind(worker_id.as_str())
        .execute(&mut *tx)
        .await?;

        let row: ClaimRow = sqlx::query_as(&format!(
            r#"
SELECT {CLAIM_COLUMNS}
FROM task_claims
WHERE task_id = ? AND status = 'active'
            "#
        ))
        .bind(task_id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(ClaimOutcome::Claimed(TaskClaim::try_from(row)?))
    }

    pub async fn renew_claim(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        lease_duration: Duration,
        max_renewals: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RenewOutcome> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;

        let row: Option<ClaimRow> = sqlx::query_as(&format!(
            r#"
SELECT {CLAIM_COLUMNS}
FROM task_claims
WHERE task_id = ? AND worker_id = ? AND status = 'active'
            "#
        ))
        .bind(task_id.as_str())
        .bind(worker_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(RenewOutcome::NotFound);
        };
        let claim = TaskClaim::try_from(row)?;
        if claim.lease_expires_at < now {
            tx.commit().await?;
            return Ok(RenewOutcome::Expired);
        }
        if claim.renewal_count >= max_renewals {
            tx.commit().await?;
            return Ok(RenewOutcome::MaxRenewalsExceeded { max: max_renewals });
        }

        sqlx::query(
            r#"
UPDATE task_claims
SET renewal_count = renewal_count + 1, lease_expires_at = ?
WHERE id = ?
            "#,
        )
        .bind(format_ts(now + lease_duration))
        .bind(claim.id)
        .execute(&mut *tx)
        .await?;

        let row: ClaimRow = sqlx::query_as(&format!(
            r#"
SELECT {CLAIM_COLUMNS}
FROM task_claims
WHERE id = ?
            "#
        ))
        .bind(claim.id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(RenewOutcome::Renewed(TaskClaim::try_from(row)?))
    }

    /// Ends a claim. When the task was not completed it returns to `ready`,
    /// or `blocked` when open blockers remain, decided inside the same
    /// transaction.
    pub async fn release_claim(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        completed: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ReleaseOutcome> {
        let ts = format_ts(now);
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;

        let claim_status = if completed { "completed" } else { "released" };
        let updated = sqlx::query(
            r#"
UPDATE task_claims
SET status = ?
WHERE task_id = ? AND worker_id = ? AND status = 'active'
            "#,
        )
        .bind(claim_status)
        .bind(task_id.as_str())
        .bind(worker_id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            tx.commit().await?;
            return Ok(ReleaseOutcome::NotFound);
        }

        sqlx::query(
            r#"
UPDATE workers
SET status = 'idle', current_task_id = NULL
WHERE id = ?
            "#,
        )
        .bind(worker_id.as_str())
        .execute(&mut *tx)
        .await?;

        if !completed {
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
            .bind(ts.as_str())
            .bind(task_id.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let task_status: String = sqlx::query(
            r#"
SELECT status FROM tasks WHERE id = ?
            "#,
        )
        .bind(task_id.as_str())
        .fetch_one(&mut *tx)
        .await?
        .try_get("status")?;
        tx.commit().await?;

        Ok(ReleaseOutcome::Released {
            task_status: TaskStatus::parse(task_status.as_str())
                .map_err(|err| anyhow::anyhow!(err))?,
        })
    }

    pub async fn find_active_claim_by_task(
        &self,
        task_id: &TaskId,
    ) -> anyhow::Result<Option<TaskClaim>> {
        let row: Option<ClaimRow> = sqlx::query_as(&format!(
            r#"
SELECT {CLAIM_COLUMNS}
FROM task_claims
WHERE task_id = ? AND status = 'active'
            "#
        ))
        .bind(task_id.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.map(TaskClaim::try_from).transpose()
    }

    pub async fn find_expired_claims(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<TaskClaim>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            r#"
SELECT {CLAIM_COLUMNS}
FROM task_claims
WHERE status = 'active' AND lease_expires_at < ?
            "#
        ))
        .bind(format_ts(now))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TaskClaim::try_from).collect()
    }
}
