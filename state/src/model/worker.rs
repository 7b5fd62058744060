use serde_json::Value;

use tx_protocol::ClaimStatus;
use tx_protocol::OrchestratorState;
use tx_protocol::OrchestratorStatus;
use tx_protocol::TaskClaim;
use tx_protocol::TaskId;
use tx_protocol::Worker;
use tx_protocol::WorkerId;
use tx_protocol::WorkerStatus;

use super::parse_json_object;
use super::parse_string_vec;
use super::parse_ts;
use super::parse_ts_opt;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WorkerRow {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) hostname: String,
    pub(crate) pid: i64,
    pub(crate) status: String,
    pub(crate) current_task_id: Option<String>,
    pub(crate) capabilities: String,
    pub(crate) metadata: String,
    pub(crate) registered_at: String,
    pub(crate) last_heartbeat_at: String,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = anyhow::Error;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        let current_task_id = row
            .current_task_id
            .map(|value| value.parse::<TaskId>())
            .transpose()
            .map_err(|err: String| anyhow::anyhow!(err))?;
        Ok(Self {
            id: WorkerId::from(row.id),
            name: row.name,
            hostname: row.hostname,
            pid: row.pid,
            status: WorkerStatus::parse(row.status.as_str())
                .map_err(|err| anyhow::anyhow!(err))?,
            current_task_id,
            capabilities: parse_string_vec(row.capabilities.as_str())?,
            metadata: parse_json_object(row.metadata.as_str())?,
            registered_at: parse_ts(row.registered_at.as_str())?,
            last_heartbeat_at: parse_ts(row.last_heartbeat_at.as_str())?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ClaimRow {
    pub(crate) id: i64,
    pub(crate) task_id: String,
    pub(crate) worker_id: String,
    pub(crate) status: String,
    pub(crate) claimed_at: String,
    pub(crate) lease_expires_at: String,
    pub(crate) renewal_count: i64,
}

impl TryFrom<ClaimRow> for TaskClaim {
    type Error = anyhow::Error;

    fn try_from(row: ClaimRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            task_id: row
                .task_id
                .parse()
                .map_err(|err: String| anyhow::anyhow!(err))?,
            worker_id: WorkerId::from(row.worker_id),
            status: ClaimStatus::parse(row.status.as_str())
                .map_err(|err| anyhow::anyhow!(err))?,
            claimed_at: parse_ts(row.claimed_at.as_str())?,
            lease_expires_at: parse_ts(row.lease_expires_at.as_str())?,
            renewal_count: row.renewal_count,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OrchestratorRow {
    pub(crate) status: String,
    pub(crate) pid: Option<i64>,
    pub(crate) started_at: Option<String>,
    pub(crate) last_reconcile_at: Option<String>,
    pub(crate) pool_size: i64,
    pub(crate) reconcile_interval_seconds: i64,
    pub(crate) heartbeat_interval_seconds: i64,
    pub(crate) lease_duration_seconds: i64,
    pub(crate) metadata: String,
}

impl TryFrom<OrchestratorRow> for OrchestratorState {
    type Error = anyhow::Error;

    fn try_from(row: OrchestratorRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: OrchestratorStatus::parse(row.status.as_str())
                .map_err(|err| anyhow::anyhow!(err))?,
            pid: row.pid,
            started_at: parse_ts_opt(row.started_at.as_deref())?,
            last_reconcile_at: parse_ts_opt(row.last_reconcile_at.as_deref())?,
            pool_size: row.pool_size,
            reconcile_interval_seconds: row.reconcile_interval_seconds,
            heartbeat_interval_seconds: row.heartbeat_interval_seconds,
            lease_duration_seconds: row.lease_duration_seconds,
            metadata: parse_json_object(row.metadata.as_str())?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRegisterParams {
    pub name: Option<String>,
    pub hostname: String,
    pub pid: i64,
    pub capabilities: Vec<String>,
    pub metadata: Value,
}

impl Default for WorkerRegisterParams {
    fn default() -> Self {
        Self {
            name: None,
            hostname: String::new(),
            pid: 0,
            capabilities: Vec::new(),
            metadata: Value::Object(serde_json::Map::new()),
        }
    }
}
