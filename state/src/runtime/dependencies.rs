use std::collections::HashMap;
use std::collections::HashSet;

use chrono::DateTime;
use chrono::Utc;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;

use tx_protocol::TaskId;

use crate::model::format_ts;

use super::StateRuntime;
use super::tasks::push_id_tuple;

/// Result of attempting to insert a dependency edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddDependencyOutcome {
    Added,
    AlreadyExists,
    SelfLoop,
    WouldCycle,
    MissingTask { id: TaskId },
}

impl StateRuntime {
    /// Inserts `blocker -> blocked` after running the cycle check inside the
    /// same immediate transaction, so no concurrent insert can slip a cycle
    /// past the DFS.
    pub async fn add_dependency_checked(
        &self,
        blocker: &TaskId,
        blocked: &TaskId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<AddDependencyOutcome> {
        if blocker == blocked {
            return Ok(AddDependencyOutcome::SelfLoop);
        }
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;

        for id in [blocker, blocked] {
            let present: Option<i64> = sqlx::query("SELECT 1 AS present FROM tasks WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get("present"))
                .transpose()?;
            if present.is_none() {
                tx.commit().await?;
                return Ok(AddDependencyOutcome::MissingTask { id: id.clone() });
            }
        }

        let edges = sqlx::query("SELECT blocker_id, blocked_id FROM task_dependencies")
            .fetch_all(&mut *tx)
            .await?;
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for row in edges {
            let from: String = row.try_get("blocker_id")?;
            let to: String = row.try_get("blocked_id")?;
            adjacency.entry(from).or_default().push(to);
        }
        // DFS from the blocked task; reaching the new blocker means the edge
        // would close a cycle in the transitive closure.
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack = vec![blocked.as_str().to_string()];
        let mut cycles = false;
        while let Some(current) = stack.pop() {
            if current == blocker.as_str() {
                cycles = true;
                break;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(next) = adjacency.get(&current) {
                stack.extend(next.iter().cloned());
            }
        }
        if cycles {
            tx.commit().await?;
            return Ok(AddDependencyOutcome::WouldCycle);
        }

        let result = sqlx::query(
            r#"
INSERT INTO task_dependencies (blocker_id, blocked_id, created_at)
VALUES (?, ?, ?)
ON CONFLICT(blocker_id, blocked_id) DO NOTHING
            "#,
        )
        .bind(blocker.as_str())
        .bind(blocked.as_str())
        .bind(format_ts(now))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            Ok(AddDependencyOutcome::AlreadyExists)
        } else {
            Ok(AddDependencyOutcome::Added)
        }
    }

    /// Test-friendly wrapper asserting the common success path.
    pub async fn add_dependency(
        &self,
        blocker: &TaskId,
        blocked: &TaskId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        match self.add_dependency_checked(blocker, blocked, now).await? {
            AddDependencyOutcome::Added => Ok(true),
            AddDependencyOutcome::AlreadyExists => Ok(false),
            outcome => anyhow::bail!("dependency insert rejected: {outcome:?}"),
        }
    }

    pub async fn remove_dependency(
        &self,
        blocker: &TaskId,
        blocked: &TaskId,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
DELETE FROM task_dependencies
WHERE blocker_id = ? AND blocked_id = ?
            "#,
        )
        .bind(blocker.as_str())
        .bind(blocked.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn all_dependency_edges(&self) -> anyhow::Result<Vec<(TaskId, TaskId, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT blocker_id, blocked_id, created_at FROM task_dependencies ORDER BY created_at ASC",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|row| {
                let blocker: String = row.try_get("blocker_id")?;
                let blocked: String = row.try_get("blocked_id")?;
                let created_at: String = row.try_get("created_at")?;
                Ok((
                    blocker.parse().map_err(|err: String| anyhow::anyhow!(err))?,
                    blocked.parse().map_err(|err: String| anyhow::anyhow!(err))?,
                    crate::model::parse_ts(created_at.as_str())?,
                ))
            })
            .collect()
    }

    /// Readiness bulk query (b): blockers of each candidate.
    pub async fn blockers_of_many(
        &self,
        blocked_ids: &[TaskId],
    ) -> anyhow::Result<Vec<(TaskId, TaskId)>> {
        self.edges_matching("blocked_id", blocked_ids).await
    }

    /// Readiness bulk query (c): tasks blocked by each candidate.
    pub async fn blocking_of_many(
        &self,
        blocker_ids: &[TaskId],
    ) -> anyhow::Result<Vec<(TaskId, TaskId)>> {
        self.edges_matching("blocker_id", blocker_ids).await
    }

    async fn edges_matching(
        &self,
        column: &str,
        ids: &[TaskId],
    ) -> anyhow::Result<Vec<(TaskId, TaskId)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT blocker_id, blocked_id FROM task_dependencies WHERE {column} IN "
        ));
        let owned: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        push_id_tuple(&mut builder, &owned);
        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.into_iter()
            .map(|row| {
                let blocker: String = row.try_get("blocker_id")?;
                let blocked: String = row.try_get("blocked_id")?;
                Ok((
                    blocker.parse().map_err(|err: String| anyhow::anyhow!(err))?,
                    blocked.parse().map_err(|err: String| anyhow::anyhow!(err))?,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::AddDependencyOutcome;
    use super::super::test_support::seed_task;
    use super::super::test_support::test_now;
    use super::super::test_support::test_runtime;
    use pretty_assertions::assert_eq;
    use tx_protocol::TaskStatus;

    #[tokio::test]
    async fn rejects_self_loops_and_cycles() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let a = seed_task(&runtime, "a", TaskStatus::Ready, now).await;
        let b = seed_task(&runtime, "b", TaskStatus::Ready, now).await;
        let c = seed_task(&runtime, "c", TaskStatus::Ready, now).await;

        assert_eq!(
            runtime
                .add_dependency_checked(&a.id, &a.id, now)
                .await
                .expect("self loop check"),
            AddDependencyOutcome::SelfLoop
        );

        // b blocks a, c blocks b; then a blocking c closes the loop.
        assert_eq!(
            runtime
                .add_dependency_checked(&b.id, &a.id, now)
                .await
                .expect("add"),
            AddDependencyOutcome::Added
        );
        assert_eq!(
            runtime
                .add_dependency_checked(&c.id, &b.id, now)
                .await
                .expect("add"),
            AddDependencyOutcome::Added
        );
        assert_eq!(
            runtime
                .add_dependency_checked(&a.id, &c.id, now)
                .await
                .expect("cycle check"),
            AddDependencyOutcome::WouldCycle
        );

        // Graph unchanged by the rejected insert.
        let edges = runtime.all_dependency_edges().await.expect("edges");
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn block_then_unblock_restores_edge_set() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let a = seed_task(&runtime, "a", TaskStatus::Ready, now).await;
        let b = seed_task(&runtime, "b", TaskStatus::Ready, now).await;

        let before = runtime.all_dependency_edges().await.expect("edges");
        runtime
            .add_dependency(&a.id, &b.id, now)
            .await
            .expect("add");
        assert!(runtime
            .remove_dependency(&a.id, &b.id)
            .await
            .expect("remove"));
        let after = runtime.all_dependency_edges().await.expect("edges");
        assert_eq!(before, after);
    }
}
