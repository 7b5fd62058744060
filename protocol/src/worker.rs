use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::TaskId;
use crate::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Stopping,
    Dead,
}

impl WorkerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "starting" => Ok(Self::Starting),
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "stopping" => Ok(Self::Stopping),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("invalid worker status: {value}")),
        }
    }

    /// Statuses that count against the orchestrator pool capacity.
    pub const fn occupies_slot(self) -> bool {
        matches!(
            self,
            WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub hostname: String,
    pub pid: i64,
    pub status: WorkerStatus,
    pub current_task_id: Option<TaskId>,
    pub capabilities: Vec<String>,
    pub metadata: Value,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Active,
    Released,
    Expired,
    Completed,
}

impl ClaimStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Active => "active",
            ClaimStatus::Released => "released",
            ClaimStatus::Expired => "expired",
            ClaimStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "active" => Ok(Self::Active),
            "released" => Ok(Self::Released),
            "expired" => Ok(Self::Expired),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("invalid claim status: {value}")),
        }
    }
}

/// A time-bounded reservation of a task by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskClaim {
    pub id: i64,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub status: ClaimStatus,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub renewal_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl OrchestratorStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            OrchestratorStatus::Stopped => "stopped",
            OrchestratorStatus::Starting => "starting",
            OrchestratorStatus::Running => "running",
            OrchestratorStatus::Stopping => "stopping",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            _ => Err(format!("invalid orchestrator status: {value}")),
        }
    }

    /// Lifecycle is a strict cycle: stopped -> starting -> running ->
    /// stopping -> stopped.
    pub fn can_transition_to(self, to: OrchestratorStatus) -> bool {
        use OrchestratorStatus::*;
        matches!(
            (self, to),
            (Stopped, Starting) | (Starting, Running) | (Running, Stopping) | (Stopping, Stopped)
        )
    }
}

/// Singleton orchestrator row; every replica reads it on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub status: OrchestratorStatus,
    pub pid: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub pool_size: i64,
    pub reconcile_interval_seconds: i64,
    pub heartbeat_interval_seconds: i64,
    pub lease_duration_seconds: i64,
    pub metadata: Value,
}

/// Counters returned by a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub dead_workers_found: u64,
    pub expired_claims_released: u64,
    pub orphaned_tasks_recovered: u64,
    pub stale_states_fixed: u64,
    pub reconcile_ms: u64,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.dead_workers_found == 0
            && self.expired_claims_released == 0
            && self.orphaned_tasks_recovered == 0
            && self.stale_states_fixed == 0
    }
}
