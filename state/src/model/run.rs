use serde_json::Value;

use tx_protocol::Message;
use tx_protocol::MessageStatus;
use tx_protocol::Run;
use tx_protocol::RunId;
use tx_protocol::RunStatus;
use tx_protocol::TaskId;

use super::parse_json_object;
use super::parse_ts;
use super::parse_ts_opt;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunRow {
    pub(crate) id: String,
    pub(crate) task_id: Option<String>,
    pub(crate) agent: String,
    pub(crate) status: String,
    pub(crate) exit_code: Option<i64>,
    pub(crate) pid: Option<i64>,
    pub(crate) transcript_path: Option<String>,
    pub(crate) stdout_path: Option<String>,
    pub(crate) stderr_path: Option<String>,
    pub(crate) injected_context: Option<String>,
    pub(crate) summary: Option<String>,
    pub(crate) error_message: Option<String>,
    pub(crate) metadata: String,
    pub(crate) stdout_bytes: i64,
    pub(crate) stderr_bytes: i64,
    pub(crate) transcript_bytes: i64,
    pub(crate) last_activity_at: Option<String>,
    pub(crate) started_at: String,
    pub(crate) ended_at: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = anyhow::Error;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let task_id = row
            .task_id
            .map(|value| value.parse::<TaskId>())
            .transpose()
            .map_err(|err: String| anyhow::anyhow!(err))?;
        Ok(Self {
            id: RunId::from(row.id),
            task_id,
            agent: row.agent,
            status: RunStatus::parse(row.status.as_str()).map_err(|err| anyhow::anyhow!(err))?,
            exit_code: row.exit_code,
            pid: row.pid,
            transcript_path: row.transcript_path,
            stdout_path: row.stdout_path,
            stderr_path: row.stderr_path,
            injected_context: row.injected_context,
            summary: row.summary,
            error_message: row.error_message,
            metadata: parse_json_object(row.metadata.as_str())?,
            stdout_bytes: row.stdout_bytes,
            stderr_bytes: row.stderr_bytes,
            transcript_bytes: row.transcript_bytes,
            last_activity_at: parse_ts_opt(row.last_activity_at.as_deref())?,
            started_at: parse_ts(row.started_at.as_str())?,
            ended_at: parse_ts_opt(row.ended_at.as_deref())?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MessageRow {
    pub(crate) id: i64,
    pub(crate) channel: String,
    pub(crate) sender: String,
    pub(crate) content: String,
    pub(crate) status: String,
    pub(crate) correlation_id: Option<String>,
    pub(crate) task_id: Option<String>,
    pub(crate) metadata: String,
    pub(crate) created_at: String,
    pub(crate) acked_at: Option<String>,
    pub(crate) expires_at: Option<String>,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let task_id = row
            .task_id
            .map(|value| value.parse::<TaskId>())
            .transpose()
            .map_err(|err: String| anyhow::anyhow!(err))?;
        Ok(Self {
            id: row.id,
            channel: row.channel,
            sender: row.sender,
            content: row.content,
            status: MessageStatus::parse(row.status.as_str())
                .map_err(|err| anyhow::anyhow!(err))?,
            correlation_id: row.correlation_id,
            task_id,
            metadata: parse_json_object(row.metadata.as_str())?,
            created_at: parse_ts(row.created_at.as_str())?,
            acked_at: parse_ts_opt(row.acked_at.as_deref())?,
            expires_at: parse_ts_opt(row.expires_at.as_deref())?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunCreateParams {
    pub id: Option<RunId>,
    pub task_id: Option<TaskId>,
    pub agent: String,
    pub pid: Option<i64>,
    pub injected_context: Option<String>,
    pub metadata: Value,
}

impl Default for RunCreateParams {
    fn default() -> Self {
        Self {
            id: None,
            task_id: None,
            agent: String::new(),
            pid: None,
            injected_context: None,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageCreateParams {
    pub channel: String,
    pub sender: String,
    pub content: String,
    pub correlation_id: Option<String>,
    pub task_id: Option<TaskId>,
    pub metadata: Value,
    pub ttl_seconds: Option<i64>,
}

impl Default for MessageCreateParams {
    fn default() -> Self {
        Self {
            channel: String::new(),
            sender: String::new(),
            content: String::new(),
            correlation_id: None,
            task_id: None,
            metadata: Value::Object(serde_json::Map::new()),
            ttl_seconds: None,
        }
    }
}
