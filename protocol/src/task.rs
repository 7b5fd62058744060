use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    Planning,
    Active,
    Blocked,
    Review,
    HumanNeedsToReview,
    Done,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Ready => "ready",
            TaskStatus::Planning => "planning",
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::HumanNeedsToReview => "human_needs_to_review",
            TaskStatus::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "backlog" => Ok(Self::Backlog),
            "ready" => Ok(Self::Ready),
            "planning" => Ok(Self::Planning),
            "active" => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            "review" => Ok(Self::Review),
            "human_needs_to_review" => Ok(Self::HumanNeedsToReview),
            "done" => Ok(Self::Done),
            _ => Err(format!("invalid task status: {value}")),
        }
    }

    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Backlog,
        TaskStatus::Ready,
        TaskStatus::Planning,
        TaskStatus::Active,
        TaskStatus::Blocked,
        TaskStatus::Review,
        TaskStatus::HumanNeedsToReview,
        TaskStatus::Done,
    ];

    /// Statuses from which a task may be claimed.
    pub const fn is_claimable(self) -> bool {
        matches!(
            self,
            TaskStatus::Backlog | TaskStatus::Ready | TaskStatus::Planning
        )
    }

    /// The fixed permitted-transition graph. Forced transitions used by
    /// operator tooling and crash recovery bypass this check.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if self == to {
            return false;
        }
        match self {
            Backlog => matches!(to, Ready | Planning | Active | Blocked | Done),
            Ready => matches!(to, Backlog | Planning | Active | Blocked | Done),
            Planning => matches!(to, Backlog | Ready | Active | Blocked | Done),
            Active => matches!(to, Blocked | Review | Done),
            Blocked => matches!(to, Backlog | Ready | Active | Done),
            Review => matches!(to, Active | HumanNeedsToReview | Blocked | Done),
            HumanNeedsToReview => matches!(to, Active | Review | Blocked | Done),
            // Reopen is the only way out of done.
            Done => matches!(to, Backlog),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeKind {
    Human,
    Agent,
}

impl AssigneeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            AssigneeKind::Human => "human",
            AssigneeKind::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "human" => Ok(Self::Human),
            "agent" => Ok(Self::Agent),
            _ => Err(format!("invalid assignee kind: {value}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignee {
    pub kind: AssigneeKind,
    pub id: String,
    pub assigned_at: DateTime<Utc>,
    pub assigned_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Base score set by the user; the kernel layers bonuses on top.
    pub score: i64,
    pub parent_id: Option<TaskId>,
    pub assignee: Option<Assignee>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-component score breakdown, exposed verbatim for UI display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: i64,
    pub blocks_bonus: i64,
    pub age_bonus: i64,
    pub depth_penalty: i64,
    pub blocked_penalty: i64,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTask {
    pub task: Task,
    pub breakdown: ScoreBreakdown,
}
