use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use tx_protocol::Assignee;
use tx_protocol::AssigneeKind;
use tx_protocol::Task;
use tx_protocol::TaskId;
use tx_protocol::TaskStatus;

use super::parse_json_object;
use super::parse_ts;
use super::parse_ts_opt;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) status: String,
    pub(crate) score: i64,
    pub(crate) parent_id: Option<String>,
    pub(crate) assignee_kind: Option<String>,
    pub(crate) assignee_id: Option<String>,
    pub(crate) assigned_at: Option<String>,
    pub(crate) assigned_by: Option<String>,
    pub(crate) metadata: String,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
    pub(crate) completed_at: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id: TaskId = row
            .id
            .parse()
            .map_err(|err: String| anyhow::anyhow!(err))?;
        let status =
            TaskStatus::parse(row.status.as_str()).map_err(|err| anyhow::anyhow!(err))?;
        let parent_id = row
            .parent_id
            .map(|value| value.parse::<TaskId>())
            .transpose()
            .map_err(|err: String| anyhow::anyhow!(err))?;
        let assignee = assignee_from_columns(
            id.as_str(),
            row.assignee_kind.as_deref(),
            row.assignee_id,
            row.assigned_at.as_deref(),
            row.assigned_by,
        )?;
        Ok(Self {
            id,
            title: row.title,
            description: row.description,
            status,
            score: row.score,
            parent_id,
            assignee,
            metadata: parse_json_object(row.metadata.as_str())?,
            created_at: parse_ts(row.created_at.as_str())?,
            updated_at: parse_ts(row.updated_at.as_str())?,
            completed_at: parse_ts_opt(row.completed_at.as_deref())?,
        })
    }
}

/// Unknown assignee kinds predate the `{human, agent}` enum; rows carrying
/// them degrade to an unassigned task rather than failing the whole read.
fn assignee_from_columns(
    task_id: &str,
    kind: Option<&str>,
    assignee_id: Option<String>,
    assigned_at: Option<&str>,
    assigned_by: Option<String>,
) -> anyhow::Result<Option<Assignee>> {
    let (Some(kind), Some(assignee_id)) = (kind, assignee_id) else {
        return Ok(None);
    };
    let kind = match AssigneeKind::parse(kind) {
        Ok(kind) => kind,
        Err(_) => {
            warn!(task_id, kind, "legacy assignee kind; treating task as unassigned");
            return Ok(None);
        }
    };
    let assigned_at = match assigned_at {
        Some(value) => parse_ts(value)?,
        None => anyhow::bail!("assignee on task {task_id} is missing assigned_at"),
    };
    Ok(Some(Assignee {
        kind,
        id: assignee_id,
        assigned_at,
        assigned_by,
    }))
}

#[derive(Debug, Clone)]
pub struct TaskCreateParams {
    pub id: Option<TaskId>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub score: i64,
    pub parent_id: Option<TaskId>,
    pub metadata: Value,
}

impl Default for TaskCreateParams {
    fn default() -> Self {
        Self {
            id: None,
            title: String::new(),
            description: String::new(),
            status: TaskStatus::Backlog,
            score: 0,
            parent_id: None,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Field-level update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub score: Option<i64>,
    pub parent_id: Option<Option<TaskId>>,
    pub assignee: Option<Option<Assignee>>,
    pub metadata: Option<Value>,
    /// When set, the update is rejected unless the row still carries this
    /// `updated_at`, protecting batch callers from stale overwrites.
    pub expected_updated_at: Option<DateTime<Utc>>,
}
