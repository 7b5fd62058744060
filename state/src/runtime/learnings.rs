use chrono::DateTime;
use chrono::Utc;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;

use tx_protocol::Learning;
use tx_protocol::LearningEdgeType;
use tx_protocol::LearningSource;

use crate::model::LearningCreateParams;
use crate::model::LearningRow;
use crate::model::encode_embedding;
use crate::model::format_ts;

use super::StateRuntime;

const LEARNING_COLUMNS: &str = r#"
    id,
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
"#;

impl StateRuntime {
    pub async fn insert_learning(
        &self,
        params: &LearningCreateParams,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Learning> {
        if let Some(embedding) = params.embedding.as_deref() {
            self.check_embedding_dimension(embedding.len()).await?;
        }
        let result = sqlx::query(
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
) VALUES (?, ?, ?, ?, ?, 0, NULL, ?, ?, ?)
            "#,
        )
        .bind(params.content.as_str())
        .bind(params.source.as_str())
        .bind(params.source_ref.as_deref())
        .bind(params.category.as_deref())
        .bind(serde_json::to_string(&params.keywords)?)
        .bind(params.outcome_score)
        .bind(params.embedding.as_deref().map(encode_embedding))
        .bind(format_ts(now))
        .execute(self.pool())
        .await?;
        let id = result.last_insert_rowid();
        self.get_learning(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created learning {id}"))
    }

    /// Insert preserving an explicit id; used by the sync importer so ids
    /// survive the export/import round trip.
    pub async fn insert_learning_with_id(
        &self,
        learning: &Learning,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO learnings (
    id,
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
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    content = excluded.content,
    source = excluded.source,
    source_ref = excluded.source_ref,
    category = excluded.category,
    keywords = excluded.keywords,
    usage_count = excluded.usage_count,
    last_used_at = excluded.last_used_at,
    outcome_score = excluded.outcome_score,
    embedding = excluded.embedding
            "#,
        )
        .bind(learning.id)
        .bind(learning.content.as_str())
        .bind(learning.source.as_str())
        .bind(learning.source_ref.as_deref())
        .bind(learning.category.as_deref())
        .bind(serde_json::to_string(&learning.keywords)?)
        .bind(learning.usage_count)
        .bind(learning.last_used_at.map(format_ts))
        .bind(learning.outcome_score)
        .bind(learning.embedding.as_deref().map(encode_embedding))
        .bind(format_ts(learning.created_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_learning(&self, id: i64) -> anyhow::Result<Option<Learning>> {
        let row = sqlx::query_as::<_, LearningRow>(&format!(
            r#"
SELECT {LEARNING_COLUMNS}
FROM learnings
WHERE id = ?
            "#
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(Learning::try_from).transpose()
    }

    pub async fn learnings_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<Learning>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            r#"
SELECT {LEARNING_COLUMNS}
FROM learnings
WHERE id IN (
            "#
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        builder.push(")");
        let rows: Vec<LearningRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter().map(Learning::try_from).collect()
    }

    pub async fn list_learnings(&self, limit: Option<usize>) -> anyhow::Result<Vec<Learning>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            r#"
SELECT {LEARNING_COLUMNS}
FROM learnings
ORDER BY created_at DESC, id DESC
            "#
        ));
        if let Some(limit) = limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows: Vec<LearningRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter().map(Learning::try_from).collect()
    }

    pub async fn delete_learning(&self, id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM learnings WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Keyword index lookup: BM25-ranked FTS match over content + keywords.
    /// Returns `(learning_id, bm25_score)` best-first; the caller derives
    /// rank positions from the ordering.
    pub async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<(i64, f64)>> {
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
SELECT rowid, bm25(learnings_fts) AS score
FROM learnings_fts
WHERE learnings_fts MATCH ?
ORDER BY score ASC
LIMIT ?
            "#,
        )
        .bind(match_expr)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|row| -> anyhow::Result<(i64, f64)> {
                Ok((row.try_get("rowid")?, row.try_get("score")?))
            })
            .collect()
    }

    /// All stored embeddings for in-memory cosine scoring.
    pub async fn embedded_learnings(&self) -> anyhow::Result<Vec<(i64, Vec<f32>)>> {
        let rows = sqlx::query(
            r#"
SELECT id, embedding
FROM learnings
WHERE embedding IS NOT NULL
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|row| -> anyhow::Result<(i64, Vec<f32>)> {
                let id: i64 = row.try_get("id")?;
                let blob: Vec<u8> = row.try_get("embedding")?;
                Ok((id, crate::model::decode_embedding(&blob)?))
            })
            .collect()
    }

    /// Dimension of embeddings already in the store, when any exist.
    pub async fn embedding_dimension(&self) -> anyhow::Result<Option<usize>> {
        let row = sqlx::query(
            r#"
SELECT length(embedding) AS bytes
FROM learnings
WHERE embedding IS NOT NULL
LIMIT 1
            "#,
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(row
            .map(|row| row.try_get::<i64, _>("bytes"))
            .transpose()?
            .map(|bytes| bytes as usize / 4))
    }

    async fn check_embedding_dimension(&self, dimension: usize) -> anyhow::Result<()> {
        if let Some(existing) = self.embedding_dimension().await?
            && existing != dimension
        {
            anyhow::bail!(
                "embedding dimension mismatch: store has {existing}, got {dimension}"
            );
        }
        Ok(())
    }

    pub async fn set_learning_embedding(
        &self,
        id: i64,
        embedding: &[f32],
    ) -> anyhow::Result<bool> {
        self.check_embedding_dimension(embedding.len()).await?;
        let result = sqlx::query("UPDATE learnings SET embedding = ? WHERE id = ?")
            .bind(encode_embedding(embedding))
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Batched usage bump feeding the popularity/recency signals.
    pub async fn increment_usage_many(
        &self,
        ids: &[i64],
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Sqlite>::new(
            "UPDATE learnings SET usage_count = usage_count + 1, last_used_at = ",
        );
        builder.push_bind(format_ts(now));
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        builder.push(")");
        let result = builder.build().execute(self.pool()).await?;
        Ok(result.rows_affected())
    }

    pub async fn record_learning_outcome(&self, id: i64, score: f64) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE learnings SET outcome_score = ? WHERE id = ?")
            .bind(score.clamp(0.0, 1.0))
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn add_learning_edge(
        &self,
        from_id: i64,
        to_id: i64,
        edge_type: LearningEdgeType,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
INSERT INTO learning_edges (from_id, to_id, edge_type, created_at)
VALUES (?, ?, ?, ?)
ON CONFLICT(from_id, to_id, edge_type) DO NOTHING
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .bind(edge_type.as_str())
        .bind(format_ts(now))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Outgoing edges from any of the given learnings.
    pub async fn learning_edges_from(
        &self,
        ids: &[i64],
    ) -> anyhow::Result<Vec<(i64, i64, LearningEdgeType)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT from_id, to_id, edge_type FROM learning_edges WHERE from_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        builder.push(")");
        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.into_iter()
            .map(|row| -> anyhow::Result<(i64, i64, LearningEdgeType)> {
                let edge_type: String = row.try_get("edge_type")?;
                Ok((
                    row.try_get("from_id")?,
                    row.try_get("to_id")?,
                    LearningEdgeType::parse(edge_type.as_str())
                        .map_err(|err| anyhow::anyhow!(err))?,
                ))
            })
            .collect()
    }

    /// File-scoped learnings are keyed by path; re-upserts replace content.
    pub async fn upsert_file_learning(
        &self,
        path: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Learning> {
        let existing: Option<i64> = sqlx::query(
            r#"
SELECT id FROM learnings
WHERE source = ? AND source_ref = ?
            "#,
        )
        .bind(LearningSource::ClaudeMd.as_str())
        .bind(path)
        .fetch_optional(self.pool())
        .await?
        .map(|row| row.try_get("id"))
        .transpose()?;
        match existing {
            Some(id) => {
                sqlx::query("UPDATE learnings SET content = ? WHERE id = ?")
                    .bind(content)
                    .bind(id)
                    .execute(self.pool())
                    .await?;
                self.get_learning(id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("file learning {id} vanished"))
            }
            None => {
                self.insert_learning(
                    &LearningCreateParams {
                        content: content.to_string(),
                        source: LearningSource::ClaudeMd,
                        source_ref: Some(path.to_string()),
                        category: None,
                        keywords: Vec::new(),
                        embedding: None,
                        outcome_score: None,
                    },
                    now,
                )
                .await
            }
        }
    }

    pub async fn delete_file_learning(&self, path: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
DELETE FROM learnings
WHERE source = ? AND source_ref = ?
            "#,
        )
        .bind(LearningSource::ClaudeMd.as_str())
        .bind(path)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// FTS5 treats most punctuation as syntax; tokens are stripped to
/// alphanumerics and quoted, then OR-joined so any hit matches.
fn fts_match_expression(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_now;
    use super::super::test_support::test_runtime;
    use super::fts_match_expression;
    use crate::model::LearningCreateParams;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn keyword_search_ranks_better_matches_first() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let sqlite = runtime
            .insert_learning(
                &LearningCreateParams {
                    keywords: vec!["sqlite".to_string(), "wal".to_string()],
                    ..LearningCreateParams::manual(
                        "sqlite writers must use immediate transactions to avoid deadlocks",
                    )
                },
                now,
            )
            .await
            .expect("insert");
        let unrelated = runtime
            .insert_learning(
                &LearningCreateParams::manual("prefer small focused pull requests"),
                now,
            )
            .await
            .expect("insert");

        let hits = runtime
            .keyword_search("sqlite transactions", 10)
            .await
            .expect("search");
        assert_eq!(hits.first().map(|(id, _)| *id), Some(sqlite.id));
        assert!(!hits.iter().any(|(id, _)| *id == unrelated.id));

        // Deleting removes the learning from the index too.
        assert!(runtime.delete_learning(sqlite.id).await.expect("delete"));
        let hits = runtime
            .keyword_search("sqlite transactions", 10)
            .await
            .expect("search");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn embedding_dimension_is_enforced() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        runtime
            .insert_learning(
                &LearningCreateParams {
                    embedding: Some(vec![0.1, 0.2, 0.3]),
                    ..LearningCreateParams::manual("three dimensional")
                },
                now,
            )
            .await
            .expect("insert");
        assert_eq!(
            runtime.embedding_dimension().await.expect("dimension"),
            Some(3)
        );

        let err = runtime
            .insert_learning(
                &LearningCreateParams {
                    embedding: Some(vec![0.1, 0.2]),
                    ..LearningCreateParams::manual("two dimensional")
                },
                now,
            )
            .await
            .expect_err("mismatched dimension must fail");
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[tokio::test]
    async fn usage_increment_is_batched() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let a = runtime
            .insert_learning(&LearningCreateParams::manual("a"), now)
            .await
            .expect("insert");
        let b = runtime
            .insert_learning(&LearningCreateParams::manual("b"), now)
            .await
            .expect("insert");

        let used_at = now + Duration::hours(1);
        let updated = runtime
            .increment_usage_many(&[a.id, b.id], used_at)
            .await
            .expect("increment");
        assert_eq!(updated, 2);
        let a = runtime
            .get_learning(a.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(a.usage_count, 1);
        assert_eq!(a.last_used_at, Some(used_at));
    }

    #[tokio::test]
    async fn file_learnings_are_keyed_by_path() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let first = runtime
            .upsert_file_learning("docs/CLAUDE.md", "always run the linter", now)
            .await
            .expect("upsert");
        let second = runtime
            .upsert_file_learning("docs/CLAUDE.md", "always run the linter and tests", now)
            .await
            .expect("upsert");
        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "always run the linter and tests");
        assert!(runtime
            .delete_file_learning("docs/CLAUDE.md")
            .await
            .expect("delete"));
        assert!(!runtime
            .delete_file_learning("docs/CLAUDE.md")
            .await
            .expect("delete"));
    }

    #[test]
    fn fts_expression_strips_punctuation() {
        assert_eq!(
            fts_match_expression("fix: worker's claim (lease)"),
            Some("\"fix\" OR \"worker\" OR \"s\" OR \"claim\" OR \"lease\"".to_string())
        );
        assert_eq!(fts_match_expression("!!!"), None);
    }
}
