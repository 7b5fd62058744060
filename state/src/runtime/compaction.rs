use std::collections::HashMap;
use std::collections::HashSet;

use chrono::DateTime;
use chrono::Utc;
use sqlx::QueryBuilder;
use sqlx::Sqlite;

use tx_protocol::LearningSource;
use tx_protocol::Task;
use tx_protocol::TaskId;
use tx_protocol::TaskStatus;

use crate::model::CompactionLogRow;
use crate::model::CompactionRecord;
use crate::model::format_ts;

use super::StateRuntime;
use super::tasks::push_id_tuple;

impl StateRuntime {
    /// Tasks eligible for compaction: `done`, completed before the cutoff,
    /// and with every descendant also `done`. The subtree walk happens in
    /// memory over one snapshot of the task table.
    pub async fn compactable_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Task>> {
        let tasks = self.all_tasks().await?;
        let mut children: HashMap<&TaskId, Vec<&Task>> = HashMap::new();
        for task in &tasks {
            if let Some(parent) = task.parent_id.as_ref() {
                children.entry(parent).or_default().push(task);
            }
        }

        let mut eligible = Vec::new();
        for task in &tasks {
            if task.status != TaskStatus::Done {
                continue;
            }
            let Some(completed_at) = task.completed_at else {
                continue;
            };
            if completed_at >= cutoff {
                continue;
            }
            if subtree_all_done(task, &children) {
                eligible.push(task.clone());
            }
        }
        Ok(eligible)
    }

    /// The commit half of compaction: inserts extracted learnings and the
    /// log row, then removes the tasks and their dependency edges. One
    /// transaction; the caller has already written any markdown export, so a
    /// failed file never leaves a log row behind.
    pub async fn compact_tasks(
        &self,
        task_ids: &[TaskId],
        summary: Option<&str>,
        learnings: &[String],
        exported_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CompactionRecord> {
        let ts = format_ts(now);
        let ids: Vec<String> = task_ids.iter().map(|id| id.as_str().to_string()).collect();
        let task_ids_json = serde_json::to_string(&ids)?;
        let learnings_json = serde_json::to_string(learnings)?;

        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;

        for content in learnings {
            sqlx::query(
                r#"
INSERT INTO learnings (content, source, source_ref, keywords, created_at)
VALUES (?, ?, ?, '[]', ?)
                "#,
            )
            .bind(content.as_str())
            .bind(LearningSource::Compaction.as_str())
            .bind(exported_to)
            .bind(ts.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let log_id = sqlx::query(
            r#"
INSERT INTO compaction_log (
    compacted_at,
    task_count,
    summary,
    task_ids,
    learnings_exported_to,
    learnings
) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts.as_str())
        .bind(ids.len() as i64)
        .bind(summary)
        .bind(task_ids_json.as_str())
        .bind(exported_to)
        .bind(learnings_json.as_str())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        if !ids.is_empty() {
            let mut dep_delete = QueryBuilder::<Sqlite>::new(
                "DELETE FROM task_dependencies WHERE blocker_id IN ",
            );
            push_id_tuple(&mut dep_delete, &ids);
            dep_delete.push(" OR blocked_id IN ");
            push_id_tuple(&mut dep_delete, &ids);
            dep_delete.build().execute(&mut *tx).await?;

            let mut task_delete = QueryBuilder::<Sqlite>::new("DELETE FROM tasks WHERE id IN ");
            push_id_tuple(&mut task_delete, &ids);
            task_delete.build().execute(&mut *tx).await?;
        }

        let row: CompactionLogRow = sqlx::query_as(
            r#"
SELECT
    id,
    compacted_at,
    task_count,
    summary,
    task_ids,
    learnings_exported_to,
    learnings
FROM compaction_log
WHERE id = ?
            "#,
        )
        .bind(log_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        CompactionRecord::try_from(row)
    }

    pub async fn list_compactions(&self, limit: usize) -> anyhow::Result<Vec<CompactionRecord>> {
        let rows: Vec<CompactionLogRow> = sqlx::query_as(
            r#"
SELECT
    id,
    compacted_at,
    task_count,
    summary,
    task_ids,
    learnings_exported_to,
    learnings
FROM compaction_log
ORDER BY compacted_at DESC, id DESC
LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(CompactionRecord::try_from).collect()
    }
}

fn subtree_all_done(root: &Task, children: &HashMap<&TaskId, Vec<&Task>>) -> bool {
    let mut seen: HashSet<&TaskId> = HashSet::new();
    let mut stack = vec![root];
    while let Some(task) = stack.pop() {
        if !seen.insert(&task.id) {
            continue;
        }
        if task.status != TaskStatus::Done {
            return false;
        }
        if let Some(kids) = children.get(&task.id) {
            stack.extend(kids.iter().copied());
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::super::test_support::seed_task;
    use super::super::test_support::test_now;
    use super::super::test_support::test_runtime;
    use crate::model::TaskCreateParams;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tx_protocol::TaskStatus;

    #[tokio::test]
    async fn only_fully_done_subtrees_are_eligible() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let done_leaf = seed_task(&runtime, "leaf", TaskStatus::Ready, now).await;
        runtime
            .complete_task(&done_leaf.id, now)
            .await
            .expect("complete");

        let parent = seed_task(&runtime, "parent", TaskStatus::Ready, now).await;
        runtime
            .create_task(
                &TaskCreateParams {
                    title: "open child".to_string(),
                    parent_id: Some(parent.id.clone()),
                    ..TaskCreateParams::default()
                },
                now,
            )
            .await
            .expect("create child");
        runtime
            .complete_task(&parent.id, now)
            .await
            .expect("complete parent");

        let cutoff = now + Duration::days(1);
        let eligible = runtime.compactable_tasks(cutoff).await.expect("eligible");
        let ids: Vec<_> = eligible.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![done_leaf.id.clone()]);
    }

    #[tokio::test]
    async fn compaction_removes_tasks_edges_and_logs_exactly_the_set() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let a = seed_task(&runtime, "a", TaskStatus::Ready, now).await;
        let b = seed_task(&runtime, "b", TaskStatus::Ready, now).await;
        runtime
            .add_dependency(&a.id, &b.id, now)
            .await
            .expect("dependency");
        runtime.complete_task(&a.id, now).await.expect("complete");
        runtime.complete_task(&b.id, now).await.expect("complete");

        let record = runtime
            .compact_tasks(
                &[a.id.clone(), b.id.clone()],
                Some("shipped the parser"),
                &["prefer streaming reads".to_string()],
                None,
                now + Duration::days(8),
            )
            .await
            .expect("compact");
        assert_eq!(record.task_count, 2);
        assert_eq!(
            record.task_ids,
            vec![a.id.to_string(), b.id.to_string()]
        );

        assert!(runtime.get_task(&a.id).await.expect("get").is_none());
        assert!(runtime.get_task(&b.id).await.expect("get").is_none());
        assert!(runtime
            .all_dependency_edges()
            .await
            .expect("edges")
            .is_empty());
        // The extracted learning is durable.
        let learnings = runtime.list_learnings(None).await.expect("learnings");
        assert_eq!(learnings.len(), 1);
        assert_eq!(learnings[0].content, "prefer streaming reads");
    }
}
