use chrono::DateTime;
use chrono::Utc;

use tx_protocol::Anchor;
use tx_protocol::AnchorStatus;

use crate::model::AnchorCreateParams;
use crate::model::AnchorRow;
use crate::model::format_ts;

use super::StateRuntime;

const ANCHOR_COLUMNS: &str = r#"
    id,
    learning_id,
    anchor_type,
    value,
    file_path,
    symbol_fqn,
    line_start,
    line_end,
    content_hash,
    status,
    pinned,
    verified_at
"#;

impl StateRuntime {
    pub async fn insert_anchor(&self, params: &AnchorCreateParams) -> anyhow::Result<Anchor> {
        let result = sqlx::query(
            r#"
INSERT INTO anchors (
    learning_id,
    anchor_type,
    value,
    file_path,
    symbol_fqn,
    line_start,
    line_end,
    content_hash,
    status,
    pinned
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'valid', ?)
            "#,
        )
        .bind(params.learning_id)
        .bind(params.anchor_type.as_str())
        .bind(params.value.as_str())
        .bind(params.file_path.as_str())
        .bind(params.symbol_fqn.as_deref())
        .bind(params.line_start)
        .bind(params.line_end)
        .bind(params.content_hash.as_deref())
        .bind(i64::from(params.pinned))
        .execute(self.pool())
        .await?;
        let id = result.last_insert_rowid();
        self.get_anchor(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created anchor {id}"))
    }

    pub async fn get_anchor(&self, id: i64) -> anyhow::Result<Option<Anchor>> {
        let row = sqlx::query_as::<_, AnchorRow>(&format!(
            r#"
SELECT {ANCHOR_COLUMNS}
FROM anchors
WHERE id = ?
            "#
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(Anchor::try_from).transpose()
    }

    pub async fn list_anchors_for_learning(
        &self,
        learning_id: i64,
    ) -> anyhow::Result<Vec<Anchor>> {
        let rows: Vec<AnchorRow> = sqlx::query_as(&format!(
            r#"
SELECT {ANCHOR_COLUMNS}
FROM anchors
WHERE learning_id = ?
ORDER BY id ASC
            "#
        ))
        .bind(learning_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Anchor::try_from).collect()
    }

    pub async fn list_all_anchors(&self) -> anyhow::Result<Vec<Anchor>> {
        let rows: Vec<AnchorRow> = sqlx::query_as(&format!(
            r#"
SELECT {ANCHOR_COLUMNS}
FROM anchors
ORDER BY id ASC
            "#
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Anchor::try_from).collect()
    }

    pub async fn set_anchor_status(
        &self,
        id: i64,
        status: AnchorStatus,
        content_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
UPDATE anchors
SET status = ?,
    content_hash = COALESCE(?, content_hash),
    verified_at = ?
WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(content_hash)
        .bind(format_ts(now))
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_anchor(&self, id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM anchors WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
