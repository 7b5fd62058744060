use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

use tx_protocol::Message;
use tx_protocol::TaskId;

use crate::model::MessageCreateParams;
use crate::model::MessageRow;
use crate::model::format_ts;

use super::StateRuntime;

const MESSAGE_COLUMNS: &str = r#"
    id,
    channel,
    sender,
    content,
    status,
    correlation_id,
    task_id,
    metadata,
    created_at,
    acked_at,
    expires_at
"#;

impl StateRuntime {
    pub async fn post_message(
        &self,
        params: &MessageCreateParams,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Message> {
        let expires_at = params
            .ttl_seconds
            .map(|ttl| format_ts(now + Duration::seconds(ttl.max(0))));
        let result = sqlx::query(
            r#"
INSERT INTO messages (
    channel,
    sender,
    content,
    status,
    correlation_id,
    task_id,
    metadata,
    created_at,
    expires_at
) VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(params.channel.as_str())
        .bind(params.sender.as_str())
        .bind(params.content.as_str())
        .bind(params.correlation_id.as_deref())
        .bind(params.task_id.as_ref().map(TaskId::as_str))
        .bind(serde_json::to_string(&params.metadata)?)
        .bind(format_ts(now))
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        let id = result.last_insert_rowid();
        let row: MessageRow = sqlx::query_as(&format!(
            r#"
SELECT {MESSAGE_COLUMNS}
FROM messages
WHERE id = ?
            "#
        ))
        .bind(id)
        .fetch_one(self.pool())
        .await?;
        Message::try_from(row)
    }

    pub async fn ack_message(&self, id: i64, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
UPDATE messages
SET status = 'acked', acked_at = ?
WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(format_ts(now))
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_pending_messages(&self, channel: &str) -> anyhow::Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
SELECT {MESSAGE_COLUMNS}
FROM messages
WHERE channel = ? AND status = 'pending'
ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(channel)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Message::try_from).collect()
    }

    /// TTL GC for expired pending messages plus age GC for acked ones.
    pub async fn gc_messages(
        &self,
        acked_max_age: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(u64, u64)> {
        let ts = format_ts(now);
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await?;
        let expired = sqlx::query(
            r#"
DELETE FROM messages
WHERE expires_at IS NOT NULL AND expires_at < ?
            "#,
        )
        .bind(ts.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let acked = sqlx::query(
            r#"
DELETE FROM messages
WHERE status = 'acked' AND acked_at < ?
            "#,
        )
        .bind(format_ts(now - acked_max_age))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok((expired, acked))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_now;
    use super::super::test_support::test_runtime;
    use crate::model::MessageCreateParams;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn outbox_post_ack_and_gc() {
        let (runtime, _dir) = test_runtime().await;
        let now = test_now();
        let short_lived = runtime
            .post_message(
                &MessageCreateParams {
                    channel: "workers".to_string(),
                    sender: "orchestrator".to_string(),
                    content: "drain".to_string(),
                    ttl_seconds: Some(60),
                    ..MessageCreateParams::default()
                },
                now,
            )
            .await
            .expect("post");
        let durable = runtime
            .post_message(
                &MessageCreateParams {
                    channel: "workers".to_string(),
                    sender: "orchestrator".to_string(),
                    content: "resume".to_string(),
                    ..MessageCreateParams::default()
                },
                now,
            )
            .await
            .expect("post");

        let pending = runtime
            .list_pending_messages("workers")
            .await
            .expect("pending");
        assert_eq!(pending.len(), 2);

        assert!(runtime
            .ack_message(durable.id, now + Duration::seconds(5))
            .await
            .expect("ack"));
        assert!(!runtime
            .ack_message(durable.id, now + Duration::seconds(6))
            .await
            .expect("double ack is a no-op"));

        // TTL expiry removes the pending message; the fresh ack survives.
        let (expired, acked) = runtime
            .gc_messages(Duration::hours(24), now + Duration::seconds(120))
            .await
            .expect("gc");
        assert_eq!(expired, 1);
        assert_eq!(acked, 0);
        let pending = runtime
            .list_pending_messages("workers")
            .await
            .expect("pending");
        assert!(pending.is_empty());
        drop(short_lived);

        // Old acked messages age out.
        let (_, acked) = runtime
            .gc_messages(Duration::hours(24), now + Duration::hours(25))
            .await
            .expect("gc");
        assert_eq!(acked, 1);
    }
}
