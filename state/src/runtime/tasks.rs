use chrono::DateTime;
use chrono::Utc;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;

use tx_protocol::Task;
use tx_protocol::TaskId;
use tx_protocol::TaskStatus;

use crate::model::TaskCreateParams;
use crate::model::TaskPatch;
use crate::model::TaskRow;
use crate::model::format_ts;
use crate::model::format_ts_opt;

use super::StateRuntime;

const TASK_COLUMNS: &str = r#"
    id,
    title,
    description,
    status,
    score,
    parent_id,
    assignee_kind,
    assignee_id,
    assigned_at,
    assigned_by,
    metadata,
    created_at,
    updated_at,
    completed_at
"#;

/// Result of completing a task: the updated row plus every task unblocked by
/// this completion, computed in the same transaction with one batched query.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub task: Task,
    pub newly_ready: Vec<Task>,
}

#[derive(Debug)]
pub enum DeleteOutcome {
    Deleted { rows: u64 },
    NotFound,
    HasChildren,
}

impl StateRuntime {
    pub async fn create_task(
        &self,
        params: &TaskCreateParams,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Task> {
        let ts = format_ts(now);
        // Random ids are sparse enough that a collision is a retry, not an
        // error.
        for attempt in 0..3 {
            let id = params.id.clone().unwrap_or_else(TaskId::generate);
            let result = sqlx::query(
                r#"
INSERT INTO tasks (
    id,
    title,
    description,
    status,
    score,
    parent_id,
    metadata,
    created_at,
    updated_at,
    completed_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
                "#,
            )
            .bind(id.as_str())
            .bind(params.title.as_str())
            .bind(params.description.as_str())
            .bind(params.status.as_str())
            .bind(params.score)
            .bind(params.parent_id.as_ref().map(TaskId::as_str))
            .bind(serde_json::to_string(&params.metadata)?)
            .bind(ts.as_str())
            .bind(ts.as_str())
            .execute(self.pool())
            .await;
            match result {
                Ok(_) => {
                    return self
                        .get_task(&id)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("failed to load created task {id}"));
                }
                Err(err) => {
                    let unique = err
                        .as_database_error()
                        .is_some_and(|db| db.is_unique_violation());
                    if unique && params.id.is_none() && attempt < 2 {
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
        unreachable!("task id generation retries exhausted")
    }

    /// Full-row upsert preserving the id; used by the sync importer.
    pub async fn upsert_task_snapshot(&self, task: &Task) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO tasks (
    id,
    title,
    description,
    status,
    score,
    parent_id,
    assignee_kind,
    assignee_id,
    assigned_at,
    assigned_by,
    metadata,
    created_at,
    updated_at,
    completed_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    title = excluded.title,
    description = excluded.description,
    status = excluded.status,
    score = excluded.score,
    parent_id = excluded.parent_id,
    assignee_kind = excluded.assignee_kind,
    assignee_id = excluded.assignee_id,
    assigned_at = excluded.assigned_at,
    assigned_by = excluded.assigned_by,
    metadata = excluded.metadata,
    updated_at = excluded.updated_at,
    completed_at = excluded.completed_at
            "#,
        )
        .bind(task.id.as_str())
        .bind(task.title.as_str())
        .bind(task.description.as_str())
        .bind(task.status.as_str())
        .bind(task.score)
        .bind(task.parent_id.as_ref().map(TaskId::as_str))
        .bind(task.assignee.as_ref().map(|a| a.kind.as_str()))
        .bind(task.assignee.as_ref().map(|a| a.id.as_str()))
        .bind(task.assignee.as_ref().map(|a| format_ts(a.assigned_at)))
        .bind(
            task.assignee
                .as_ref()
                .and_then(|a| a.assigned_by.as_deref()),
        )
        .bind(serde_json::to_string(&task.metadata)?)
        .bind(format_ts(task.created_at))
        .bind(format_ts(task.updated_at))
        .bind(format_ts_opt(task.completed_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &TaskId) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
SELECT {TASK_COLUMNS}
FROM tasks
WHERE id = ?
            "#
        ))
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.map(Task::try_from).transpose()
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<Task>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            r#"
SELECT {TASK_COLUMNS}
FROM tasks
WHERE 1 = 1
            "#
        ));
        if let Some(status) = status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder.push(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows: Vec<TaskRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    pub async fn all_tasks(&self) -> anyhow::Result<Vec<Task>> {
        self.list_tasks(None, None).await
    }

    /// Applies a field patch. Returns `false` when the row does not exist or
    /// when `expected_updated_at` no longer matches (stale write).
    pub async fn update_task(
        &self,
        id: &TaskId,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE tasks SET updated_at = ");
        builder.push_bind(format_ts(now));
        if let Some(title) = &patch.title {
            builder.push(", title = ").push_bind(title.as_str());
        }
        if let Some(description) = &patch.description {
            builder
                .push(", description = ")
                .push_bind(description.as_str());
        }
        if let Some(score) = patch.score {
            builder.push(", score = ").push_bind(score);
        }
        if let Some(parent_id) = &patch.parent_id {
            builder
                .push(", parent_id = ")
                .push_bind(parent_id.as_ref().map(TaskId::as_str));
        }
        if let Some(assignee) = &patch.assignee {
            match assignee {
                Some(assignee) => {
                    builder
                        .push(", assignee_kind = ")
                        .push_bind(assignee.kind.as_str());
                    builder
                        .push(", assignee_id = ")
                        .push_bind(assignee.id.as_str());
                    builder
                        .push(", assigned_at = ")
                        .push_bind(format_ts(assignee.assigned_at));
                    builder
                        .push(", assigned_by = ")
                        .push_bind(assignee.assigned_by.as_deref());
                }
                None => {
                    builder.push(
                        ", assignee_kind = NULL, assignee_id = NULL, assigned_at = NULL, assigned_by = NULL",
                    );
                }
            }
        }
        if let Some(metadata) = &patch.metadata {
            builder
                .push(", metadata = ")
                .push_bind(serde_json::to_string(metadata)?);
        }
        builder.push(" WHERE id = ").push_bind(id.as_str());
        if let Some(expected) = patch.expected_updated_at {
            builder
                .push(" AND updated_at = ")
                .push_bind(format_ts(expected));
        }
        let result = builder.build().execute(self.pool()).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unconditional status write used by forced transitions and recovery
    /// paths; the transition oracle lives in the kernel.
    pub async fn set_task_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let completed_at = if status == TaskStatus::Done {
            Some(now)
        } else {
            None
        };
        let result = sqlx::query(
            r#"
UPDATE tasks
SET status = ?, updated_at = ?, completed_at = COALESCE(?, completed_at)
WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(format_ts(now))
        .bind(format_ts_opt(completed_at))
        .bind(id.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks a task done, finishes any active claim on it, frees the claiming
    /// worker, and returns the tasks unblocked by this completion. One
    /// transaction, one batched newly-ready query.
    pub async fn complete_task(
        &self,
        id: &TaskId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<CompletionOutcome>> {
        let ts = format_ts(now);
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;

        let updated = sqlx::query(
            r#"
UPDATE tasks
SET status = 'done', updated_at = ?, completed_at = ?
WHERE id = ?
            "#,
        )
        .bind(ts.as_str())
        .bind(ts.as_str())
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let claim_worker: Option<String> = sqlx::query(
            r#"
SELECT worker_id
FROM task_claims
WHERE task_id = ? AND status = 'active'
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("worker_id"))
        .transpose()?;
        if let Some(worker_id) = claim_worker.as_deref() {
            sqlx::query(
                r#"
UPDATE task_claims
SET status = 'completed'
WHERE task_id = ? AND status = 'active'
                "#,
            )
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"
UPDATE workers
SET status = 'idle', current_task_id = NULL
WHERE id = ? AND current_task_id = ?
                "#,
            )
            .bind(worker_id)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let newly_ready_rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
SELECT {}
FROM tasks t
JOIN task_dependencies d ON d.blocked_id = t.id AND d.blocker_id = ?
WHERE t.status IN ('backlog', 'ready', 'planning')
  AND NOT EXISTS (
      SELECT 1 FROM task_claims c
      WHERE c.task_id = t.id AND c.status = 'active'
  )
  AND NOT EXISTS (
      SELECT 1
      FROM task_dependencies d2
      JOIN tasks b ON b.id = d2.blocker_id
      WHERE d2.blocked_id = t.id AND b.status != 'done'
  )
ORDER BY t.score DESC, t.id ASC
            "#,
            task_columns_qualified("t")
        ))
        .bind(id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let task_row: TaskRow = sqlx::query_as(&format!(
            r#"
SELECT {TASK_COLUMNS}
FROM tasks
WHERE id = ?
            "#
        ))
        .bind(id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(CompletionOutcome {
            task: Task::try_from(task_row)?,
            newly_ready: newly_ready_rows
                .into_iter()
                .map(Task::try_from)
                .collect::<Result<_, _>>()?,
        }))
    }

    pub async fn delete_task(
        &self,
        id: &TaskId,
        cascade: bool,
    ) -> anyhow::Result<DeleteOutcome> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;

        let exists: Option<i64> = sqlx::query("SELECT 1 AS present FROM tasks WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get("present"))
            .transpose()?;
        if exists.is_none() {
            tx.commit().await?;
            return Ok(DeleteOutcome::NotFound);
        }

        // Subtree collected in memory from parent links; stays small relative
        // to the store.
        let pairs: Vec<(String, Option<String>)> =
            sqlx::query("SELECT id, parent_id FROM tasks")
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .map(|row| -> anyhow::Result<(String, Option<String>)> {
                    Ok((row.try_get("id")?, row.try_get("parent_id")?))
                })
                .collect::<Result<_, _>>()?;
        let mut doomed = vec![id.as_str().to_string()];
        let mut frontier = vec![id.as_str().to_string()];
        while let Some(current) = frontier.pop() {
            for (child, parent) in &pairs {
                if parent.as_deref() == Some(current.as_str()) && !doomed.contains(child) {
                    doomed.push(child.clone());
                    frontier.push(child.clone());
                }
            }
        }
        if doomed.len() > 1 && !cascade {
            tx.commit().await?;
            return Ok(DeleteOutcome::HasChildren);
        }

        let mut dep_delete = QueryBuilder::<Sqlite>::new(
            "DELETE FROM task_dependencies WHERE blocker_id IN ",
        );
        push_id_tuple(&mut dep_delete, &doomed);
        dep_delete.push(" OR blocked_id IN ");
        push_id_tuple(&mut dep_delete, &doomed);
        dep_delete.build().execute(&mut *tx).await?;

        let mut task_delete = QueryBuilder::<Sqlite>::new("DELETE FROM tasks WHERE id IN ");
        push_id_tuple(&mut task_delete, &doomed);
        let rows = task_delete.build().execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;
        Ok(DeleteOutcome::Deleted { rows })
    }

    /// Readiness bulk query (a): claimable-status tasks with no active claim.
    pub async fn claimable_unclaimed_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
SELECT {TASK_COLUMNS}
FROM tasks
WHERE status IN ('backlog', 'ready', 'planning')
  AND id NOT IN (
      SELECT task_id FROM task_claims WHERE status = 'active'
  )
            "#
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Readiness bulk query (d): parent link of every task, for depth
    /// computation.
    pub async fn parent_pairs(&self) -> anyhow::Result<Vec<(TaskId, Option<TaskId>)>> {
        let rows = sqlx::query("SELECT id, parent_id FROM tasks")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let parent: Option<String> = row.try_get("parent_id")?;
                Ok((
                    id.parse().map_err(|err: String| anyhow::anyhow!(err))?,
                    parent
                        .map(|value| value.parse())
                        .transpose()
                        .map_err(|err: String| anyhow::anyhow!(err))?,
                ))
            })
            .collect()
    }

    /// Readiness bulk query (e): statuses for an id set.
    pub async fn statuses_for(
        &self,
        ids: &[TaskId],
    ) -> anyhow::Result<Vec<(TaskId, TaskStatus)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT id, status FROM tasks WHERE id IN ");
        let owned: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        push_id_tuple(&mut builder, &owned);
        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let status: String = row.try_get("status")?;
                Ok((
                    id.parse().map_err(|err: String| anyhow::anyhow!(err))?,
                    TaskStatus::parse(status.as_str()).map_err(|err| anyhow::anyhow!(err))?,
                ))
            })
            .collect()
    }

    pub async fn children_of(&self, id: &TaskId) -> anyhow::Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
SELECT {TASK_COLUMNS}
FROM tasks
WHERE parent_id = ?
ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(id.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Optimistic batch status update; a row is skipped when its
    /// `updated_at` moved since the caller read it.
    pub async fn bulk_set_status(
        &self,
        expected: &[(TaskId, DateTime<Utc>)],
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let ts = format_ts(now);
        let completed = if status == TaskStatus::Done {
            Some(ts.clone())
        } else {
            None
        };
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;
        let mut updated = 0;
        for (id, seen_at) in expected {
            let result = sqlx::query(
                r#"
UPDATE tasks
SET status = ?, updated_at = ?, completed_at = COALESCE(?, completed_at)
WHERE id = ? AND updated_at = ?
                "#,
            )
            .bind(status.as_str())
            .bind(ts.as_str())
            .bind(completed.as_deref())
            .bind(id.as_str())
            .bind(format_ts(*seen_at))
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn bulk_set_score(
        &self,
        expected: &[(TaskId, DateTime<Utc>)],
        score: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let ts = format_ts(now);
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;
        let mut updated = 0;
        for (id, seen_at) in expected {
            let result = sqlx::query(
                r#"
UPDATE tasks
SET score = ?, updated_at = ?
WHERE id = ? AND updated_at = ?
                "#,
            )
            .bind(score)
            .bind(ts.as_str())
            .bind(id.as_str())
            .bind(format_ts(*seen_at))
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }
}

fn task_columns_qualified(alias: &str) -> String {
    TASK_COLUMNS
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn push_id_tuple(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[String]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.clone());
    }
    builder.push(")");
}

#[cfg(test)]
mod tests {
    use super::super::test_support::seed_task;
    use super::super::test_support::test_now;
    use super::super::test_support::test_runtime;
    use crate::model::TaskCreateParams;
    use crate::model::TaskPatch;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tx_protocol::TaskStatus;

    #[tokio::test]
    async fn create_and_fetch_round_trips() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let task = seed_task(&runtime, "write parser", TaskStatus::Ready, now).await;
        let fetched = runtime
            .get_task(&task.id)
            .await
            .expect("get")
            .expect("task exists");
        assert_eq!(fetched, task);
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let task = seed_task(&runtime, "stale", TaskStatus::Backlog, now).await;

        let later = now + Duration::seconds(10);
        let first = runtime
            .update_task(
                &task.id,
                &TaskPatch {
                    title: Some("renamed".to_string()),
                    expected_updated_at: Some(task.updated_at),
                    ..TaskPatch::default()
                },
                later,
            )
            .await
            .expect("update");
        assert!(first);

        // Second writer still holds the original updated_at.
        let second = runtime
            .update_task(
                &task.id,
                &TaskPatch {
                    title: Some("conflicting".to_string()),
                    expected_updated_at: Some(task.updated_at),
                    ..TaskPatch::default()
                },
                later + Duration::seconds(1),
            )
            .await
            .expect("update");
        assert!(!second);

        let fetched = runtime
            .get_task(&task.id)
            .await
            .expect("get")
            .expect("task exists");
        assert_eq!(fetched.title, "renamed");
    }

    #[tokio::test]
    async fn completion_reports_newly_ready_tasks() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let blocker = seed_task(&runtime, "blocker", TaskStatus::Ready, now).await;
        let blocked = seed_task(&runtime, "blocked", TaskStatus::Ready, now).await;
        let other = seed_task(&runtime, "independent", TaskStatus::Ready, now).await;
        runtime
            .add_dependency(&blocker.id, &blocked.id, now)
            .await
            .expect("add dependency");

        let outcome = runtime
            .complete_task(&blocker.id, now + Duration::seconds(5))
            .await
            .expect("complete")
            .expect("task exists");
        assert_eq!(outcome.task.status, TaskStatus::Done);
        assert!(outcome.task.completed_at.is_some());
        let ready_ids: Vec<_> = outcome.newly_ready.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready_ids, vec![blocked.id.clone()]);
        assert!(!ready_ids.contains(&other.id));
    }

    #[tokio::test]
    async fn create_with_parent_and_children_query() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let parent = seed_task(&runtime, "parent", TaskStatus::Backlog, now).await;
        let child = runtime
            .create_task(
                &TaskCreateParams {
                    title: "child".to_string(),
                    parent_id: Some(parent.id.clone()),
                    ..TaskCreateParams::default()
                },
                now,
            )
            .await
            .expect("create child");
        let children = runtime.children_of(&parent.id).await.expect("children");
        assert_eq!(children, vec![child]);
    }
}
