use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use sqlx::QueryBuilder;
use sqlx::Sqlite;

use tx_protocol::Run;
use tx_protocol::RunHeartbeat;
use tx_protocol::RunId;
use tx_protocol::RunStatus;
use tx_protocol::TaskId;

use crate::model::RunCreateParams;
use crate::model::RunRow;
use crate::model::format_ts;

use super::StateRuntime;

const RUN_COLUMNS: &str = r#"
    id,
    task_id,
    agent,
    status,
    exit_code,
    pid,
    transcript_path,
    stdout_path,
    stderr_path,
    injected_context,
    summary,
    error_message,
    metadata,
    stdout_bytes,
    stderr_bytes,
    transcript_bytes,
    last_activity_at,
    started_at,
    ended_at
"#;

impl StateRuntime {
    pub async fn create_run(
        &self,
        params: &RunCreateParams,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Run> {
        let id = params.id.clone().unwrap_or_else(RunId::generate);
        let ts = format_ts(now);
        sqlx::query(
            r#"
INSERT INTO runs (
    id,
    task_id,
    agent,
    status,
    pid,
    injected_context,
    metadata,
    last_activity_at,
    started_at
) VALUES (?, ?, ?, 'running', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(params.task_id.as_ref().map(TaskId::as_str))
        .bind(params.agent.as_str())
        .bind(params.pid)
        .bind(params.injected_context.as_deref())
        .bind(serde_json::to_string(&params.metadata)?)
        .bind(ts.as_str())
        .bind(ts.as_str())
        .execute(self.pool())
        .await?;
        self.get_run(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created run {id}"))
    }

    /// Insert preserving the full row; used by the sync importer. Existing
    /// rows win because attempts are immutable.
    pub async fn insert_run_snapshot(&self, run: &Run) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
INSERT INTO runs (
    id,
    task_id,
    agent,
    status,
    exit_code,
    pid,
    transcript_path,
    stdout_path,
    stderr_path,
    injected_context,
    summary,
    error_message,
    metadata,
    stdout_bytes,
    stderr_bytes,
    transcript_bytes,
    last_activity_at,
    started_at,
    ended_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(run.id.as_str())
        .bind(run.task_id.as_ref().map(TaskId::as_str))
        .bind(run.agent.as_str())
        .bind(run.status.as_str())
        .bind(run.exit_code)
        .bind(run.pid)
        .bind(run.transcript_path.as_deref())
        .bind(run.stdout_path.as_deref())
        .bind(run.stderr_path.as_deref())
        .bind(run.injected_context.as_deref())
        .bind(run.summary.as_deref())
        .bind(run.error_message.as_deref())
        .bind(serde_json::to_string(&run.metadata)?)
        .bind(run.stdout_bytes)
        .bind(run.stderr_bytes)
        .bind(run.transcript_bytes)
        .bind(run.last_activity_at.map(format_ts))
        .bind(format_ts(run.started_at))
        .bind(run.ended_at.map(format_ts))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_run(&self, id: &RunId) -> anyhow::Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            r#"
SELECT {RUN_COLUMNS}
FROM runs
WHERE id = ?
            "#
        ))
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.map(Run::try_from).transpose()
    }

    pub async fn list_runs(&self, task_id: Option<&TaskId>) -> anyhow::Result<Vec<Run>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            r#"
SELECT {RUN_COLUMNS}
FROM runs
WHERE 1 = 1
            "#
        ));
        if let Some(task_id) = task_id {
            builder.push(" AND task_id = ").push_bind(task_id.as_str());
        }
        builder.push(" ORDER BY started_at ASC, id ASC");
        let rows: Vec<RunRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter().map(Run::try_from).collect()
    }

    pub async fn set_run_io_paths(
        &self,
        id: &RunId,
        stdout_path: Option<&str>,
        stderr_path: Option<&str>,
        transcript_path: Option<&str>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
UPDATE runs
SET stdout_path = COALESCE(?, stdout_path),
    stderr_path = COALESCE(?, stderr_path),
    transcript_path = COALESCE(?, transcript_path)
WHERE id = ?
            "#,
        )
        .bind(stdout_path)
        .bind(stderr_path)
        .bind(transcript_path)
        .bind(id.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn finish_run(
        &self,
        id: &RunId,
        status: RunStatus,
        exit_code: Option<i64>,
        summary: Option<&str>,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
UPDATE runs
SET status = ?,
    exit_code = ?,
    summary = ?,
    error_message = ?,
    ended_at = ?
WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(exit_code)
        .bind(summary)
        .bind(error_message)
        .bind(format_ts(now))
        .bind(id.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Applies a monitor heartbeat: byte counters only move forward.
    pub async fn record_run_heartbeat(
        &self,
        heartbeat: &RunHeartbeat,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let activity_at = heartbeat.activity_at.unwrap_or(now);
        let result = sqlx::query(
            r#"
UPDATE runs
SET stdout_bytes = MAX(stdout_bytes, ?),
    stderr_bytes = MAX(stderr_bytes, ?),
    transcript_bytes = MAX(transcript_bytes, ?),
    last_activity_at = ?
WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(heartbeat.stdout_bytes)
        .bind(heartbeat.stderr_bytes)
        .bind(heartbeat.transcript_bytes)
        .bind(format_ts(activity_at))
        .bind(heartbeat.run_id.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Running runs whose transcript went idle past the threshold.
    pub async fn find_stalled_runs(
        &self,
        stall_threshold: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Run>> {
        let cutoff = format_ts(now - stall_threshold);
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            r#"
SELECT {RUN_COLUMNS}
FROM runs
WHERE status = 'running'
  AND COALESCE(last_activity_at, started_at) < ?
            "#
        ))
        .bind(cutoff.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Run::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_now;
    use super::super::test_support::test_runtime;
    use crate::model::RunCreateParams;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tx_protocol::RunHeartbeat;
    use tx_protocol::RunStatus;

    #[tokio::test]
    async fn heartbeat_moves_counters_forward_only() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let run = runtime
            .create_run(
                &RunCreateParams {
                    agent: "headless".to_string(),
                    ..RunCreateParams::default()
                },
                now,
            )
            .await
            .expect("create run");

        let hb = RunHeartbeat {
            run_id: run.id.clone(),
            check_at: None,
            activity_at: Some(now + Duration::seconds(10)),
            stdout_bytes: 100,
            stderr_bytes: 5,
            transcript_bytes: 2048,
            delta_bytes: Some(2048),
        };
        assert!(runtime
            .record_run_heartbeat(&hb, now + Duration::seconds(10))
            .await
            .expect("heartbeat"));

        // A lagging monitor cannot shrink the counters.
        let stale = RunHeartbeat {
            stdout_bytes: 50,
            ..hb.clone()
        };
        runtime
            .record_run_heartbeat(&stale, now + Duration::seconds(11))
            .await
            .expect("heartbeat");
        let fetched = runtime
            .get_run(&run.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(fetched.stdout_bytes, 100);
        assert_eq!(fetched.transcript_bytes, 2048);
    }

    #[tokio::test]
    async fn stalled_runs_are_detected_by_idle_transcript() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let run = runtime
            .create_run(
                &RunCreateParams {
                    agent: "headless".to_string(),
                    ..RunCreateParams::default()
                },
                now,
            )
            .await
            .expect("create run");

        let stalled = runtime
            .find_stalled_runs(Duration::seconds(300), now + Duration::seconds(301))
            .await
            .expect("stalled query");
        assert_eq!(stalled.len(), 1);

        runtime
            .finish_run(
                &run.id,
                RunStatus::Cancelled,
                None,
                None,
                Some("stalled"),
                now + Duration::seconds(302),
            )
            .await
            .expect("finish");
        let stalled = runtime
            .find_stalled_runs(Duration::seconds(300), now + Duration::seconds(600))
            .await
            .expect("stalled query");
        assert!(stalled.is_empty());
    }
}
