use chrono::DateTime;
use chrono::Utc;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;

use tx_protocol::CandidateStatus;
use tx_protocol::Learning;
use tx_protocol::LearningCandidate;
use tx_protocol::LearningSource;
use tx_protocol::RunId;
use tx_protocol::TaskId;

use crate::model::CandidateCreateParams;
use crate::model::CandidateRow;
use crate::model::format_ts;

use super::StateRuntime;

const CANDIDATE_COLUMNS: &str = r#"
    id,
    content,
    confidence,
    category,
    source_file,
    source_run_id,
    source_task_id,
    status,
    reviewed_by,
    reviewed_at,
    promoted_learning_id,
    rejection_reason,
    extracted_at
"#;

/// Result of a promotion attempt.
#[derive(Debug, Clone)]
pub enum PromoteOutcome {
    Promoted {
        candidate: LearningCandidate,
        learning: Learning,
    },
    NotFound,
    NotPending {
        status: CandidateStatus,
    },
}

impl StateRuntime {
    pub async fn insert_candidate(
        &self,
        params: &CandidateCreateParams,
        now: DateTime<Utc>,
    ) -> anyhow::Result<LearningCandidate> {
        let result = sqlx::query(
            r#"
INSERT INTO learning_candidates (
    content,
    confidence,
    category,
    source_file,
    source_run_id,
    source_task_id,
    status,
    extracted_at
) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(params.content.as_str())
        .bind(params.confidence.as_str())
        .bind(params.category.as_deref())
        .bind(params.source_file.as_deref())
        .bind(params.source_run_id.as_ref().map(RunId::as_str))
        .bind(params.source_task_id.as_ref().map(TaskId::as_str))
        .bind(format_ts(now))
        .execute(self.pool())
        .await?;
        let id = result.last_insert_rowid();
        self.get_candidate(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created candidate {id}"))
    }

    pub async fn get_candidate(&self, id: i64) -> anyhow::Result<Option<LearningCandidate>> {
        let row = sqlx::query_as::<_, CandidateRow>(&format!(
            r#"
SELECT {CANDIDATE_COLUMNS}
FROM learning_candidates
WHERE id = ?
            "#
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(LearningCandidate::try_from).transpose()
    }

    pub async fn list_candidates(
        &self,
        status: Option<CandidateStatus>,
    ) -> anyhow::Result<Vec<LearningCandidate>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            r#"
SELECT {CANDIDATE_COLUMNS}
FROM learning_candidates
WHERE 1 = 1
            "#
        ));
        if let Some(status) = status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder.push(" ORDER BY extracted_at ASC, id ASC");
        let rows: Vec<CandidateRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter().map(LearningCandidate::try_from).collect()
    }

    /// Promotes a pending candidate: creates the learning, links it back, and
    /// flips the candidate status, all in one transaction.
    pub async fn promote_candidate(
        &self,
        id: i64,
        reviewed_by: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PromoteOutcome> {
        let ts = format_ts(now);
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;

        let row: Option<CandidateRow> = sqlx::query_as(&format!(
            r#"
SELECT {CANDIDATE_COLUMNS}
FROM learning_candidates
WHERE id = ?
            "#
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(PromoteOutcome::NotFound);
        };
        let candidate = LearningCandidate::try_from(row)?;
        if candidate.status != CandidateStatus::Pending {
            tx.commit().await?;
            return Ok(PromoteOutcome::NotPending {
                status: candidate.status,
            });
        }

        let source_ref = candidate
            .source_run_id
            .as_ref()
            .map(|run| run.as_str().to_string())
            .or_else(|| candidate.source_file.clone());
        let learning_id = sqlx::query(
            r#"
INSERT INTO learnings (
    content,
    source,
    source_ref,
    category,
    keywords,
    usage_count,
    last_used_at,
    outcome_score,
    embedding,
    created_at
) VALUES (?, ?, ?, ?, '[]', 0, NULL, NULL, NULL, ?)
            "#,
        )
        .bind(candidate.content.as_str())
        .bind(LearningSource::Run.as_str())
        .bind(source_ref.as_deref())
        .bind(candidate.category.as_deref())
        .bind(ts.as_str())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query(
            r#"
UPDATE learning_candidates
SET status = 'promoted',
    reviewed_by = ?,
    reviewed_at = ?,
    promoted_learning_id = ?
WHERE id = ?
            "#,
        )
        .bind(reviewed_by)
        .bind(ts.as_str())
        .bind(learning_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let candidate = self
            .get_candidate(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("candidate {id} vanished during promotion"))?;
        let learning = self
            .get_learning(learning_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("learning {learning_id} vanished during promotion"))?;
        Ok(PromoteOutcome::Promoted {
            candidate,
            learning,
        })
    }

    pub async fn reject_candidate(
        &self,
        id: i64,
        reviewed_by: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<LearningCandidate>> {
        let result = sqlx::query(
            r#"
UPDATE learning_candidates
SET status = 'rejected',
    reviewed_by = ?,
    reviewed_at = ?,
    rejection_reason = ?
WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(reviewed_by)
        .bind(format_ts(now))
        .bind(reason)
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_candidate(id).await
    }

    pub async fn pending_candidate_count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r#"
SELECT COUNT(*) AS pending
FROM learning_candidates
WHERE status = 'pending'
            "#,
        )
        .fetch_one(self.pool())
        .await?;
        Ok(row.try_get("pending")?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_now;
    use super::super::test_support::test_runtime;
    use super::PromoteOutcome;
    use crate::model::CandidateCreateParams;
    use pretty_assertions::assert_eq;
    use tx_protocol::CandidateStatus;
    use tx_protocol::Confidence;
    use tx_protocol::LearningSource;

    fn params(content: &str, confidence: Confidence) -> CandidateCreateParams {
        CandidateCreateParams {
            content: content.to_string(),
            confidence,
            category: Some("testing".to_string()),
            source_file: Some("transcript.jsonl".to_string()),
            source_run_id: None,
            source_task_id: None,
        }
    }

    #[tokio::test]
    async fn promotion_links_candidate_and_learning() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let candidate = runtime
            .insert_candidate(&params("flush before reopening the WAL", Confidence::High), now)
            .await
            .expect("insert");

        let PromoteOutcome::Promoted {
            candidate,
            learning,
        } = runtime
            .promote_candidate(candidate.id, "auto", now)
            .await
            .expect("promote")
        else {
            panic!("promotion must succeed");
        };
        assert_eq!(candidate.status, CandidateStatus::Promoted);
        assert_eq!(candidate.promoted_learning_id, Some(learning.id));
        assert_eq!(candidate.reviewed_by.as_deref(), Some("auto"));
        assert_eq!(learning.source, LearningSource::Run);
        assert_eq!(learning.content, "flush before reopening the WAL");

        // Promoting twice is rejected.
        let again = runtime
            .promote_candidate(candidate.id, "auto", now)
            .await
            .expect("promote");
        assert!(matches!(
            again,
            PromoteOutcome::NotPending {
                status: CandidateStatus::Promoted
            }
        ));
    }

    #[tokio::test]
    async fn rejection_records_reason() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let candidate = runtime
            .insert_candidate(&params("duplicate of an existing note", Confidence::Low), now)
            .await
            .expect("insert");
        let rejected = runtime
            .reject_candidate(candidate.id, "reviewer", "already covered", now)
            .await
            .expect("reject")
            .expect("candidate exists");
        assert_eq!(rejected.status, CandidateStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("already covered"));
        assert_eq!(runtime.pending_candidate_count().await.expect("count"), 0);
    }
}
