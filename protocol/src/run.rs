use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::RunId;
use crate::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid run status: {value}")),
        }
    }

    pub const fn is_final(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One execution instance of an agent against a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task_id: Option<TaskId>,
    pub agent: String,
    pub status: RunStatus,
    pub exit_code: Option<i64>,
    pub pid: Option<i64>,
    pub transcript_path: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub injected_context: Option<String>,
    pub summary: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Value,
    pub stdout_bytes: i64,
    pub stderr_bytes: i64,
    pub transcript_bytes: i64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Wire form of a run heartbeat as posted by transcript monitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHeartbeat {
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_at: Option<DateTime<Utc>>,
    pub stdout_bytes: i64,
    pub stderr_bytes: i64,
    pub transcript_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_bytes: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Acked,
}

impl MessageStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Acked => "acked",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "pending" => Ok(Self::Pending),
            "acked" => Ok(Self::Acked),
            _ => Err(format!("invalid message status: {value}")),
        }
    }
}

/// Append-only outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub channel: String,
    pub sender: String,
    pub content: String,
    pub status: MessageStatus,
    pub correlation_id: Option<String>,
    pub task_id: Option<TaskId>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub acked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}
