use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use tx_protocol::OrchestratorError;
use tx_protocol::OrchestratorStatus;
use tx_protocol::ReconcileReport;
use tx_protocol::TaskClaim;
use tx_protocol::TaskId;
use tx_protocol::TaskStatus;
use tx_protocol::Worker;
use tx_protocol::WorkerId;
use tx_protocol::WorkerStatus;
use tx_state::ClaimOutcome;
use tx_state::RegistrationOutcome;
use tx_state::ReleaseOutcome;
use tx_state::RenewOutcome;
use tx_state::StateRuntime;
use tx_state::WorkerRegisterParams;

use crate::clock::Clock;
use crate::config::TxConfig;

/// Tunables for the claim/lease protocol and the reconcile loop.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub pool_size: i64,
    pub lease_duration_seconds: i64,
    pub heartbeat_interval_seconds: i64,
    pub reconcile_interval_seconds: i64,
    pub max_renewals: i64,
    pub missed_heartbeats: i64,
}

impl OrchestratorConfig {
    pub fn from_config(config: &TxConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            lease_duration_seconds: config.lease_duration_seconds,
            heartbeat_interval_seconds: config.heartbeat_interval_seconds,
            reconcile_interval_seconds: config.reconcile_interval_seconds,
            max_renewals: config.max_renewals,
            missed_heartbeats: config.missed_heartbeats,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::seconds(self.lease_duration_seconds)
    }

    /// Liveness threshold: `missed_heartbeats x heartbeat interval`.
    pub fn heartbeat_threshold(&self) -> Duration {
        Duration::seconds(self.missed_heartbeats.max(1) * self.heartbeat_interval_seconds)
    }
}

/// The singleton coordinator: worker registration, the claim protocol, and
/// the periodic reconciliation sweep. Holds no state of its own; everything
/// lives in the store.
#[derive(Clone)]
pub struct Orchestrator {
    state: Arc<StateRuntime>,
    config: OrchestratorConfig,
    clock: Clock,
}

impl Orchestrator {
    pub fn new(state: Arc<StateRuntime>, config: OrchestratorConfig, clock: Clock) -> Self {
        Self {
            state,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn register(
        &self,
        params: WorkerRegisterParams,
    ) -> Result<Worker, OrchestratorError> {
        match self
            .state
            .register_worker(&params, self.config.pool_size, self.clock.now())
            .await?
        {
            RegistrationOutcome::Registered(worker) => Ok(worker),
            RegistrationOutcome::CapacityExhausted {
                live_workers,
                pool_size,
            } => Err(OrchestratorError::Registration {
                reason: format!("pool capacity exhausted: {live_workers}/{pool_size} workers live"),
            }),
        }
    }

    pub async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
        current_task_id: Option<&TaskId>,
        metrics: Option<&Value>,
    ) -> Result<(), OrchestratorError> {
        let updated = self
            .state
            .heartbeat_worker(worker_id, status, current_task_id, metrics, self.clock.now())
            .await?;
        if !updated {
            return Err(OrchestratorError::WorkerNotFound {
                worker_id: worker_id.clone(),
            });
        }
        Ok(())
    }

    pub async fn claim(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
    ) -> Result<TaskClaim, OrchestratorError> {
        match self
            .state
            .claim_task(
                task_id,
                worker_id,
                self.config.lease_duration(),
                self.clock.now(),
            )
            .await?
        {
            ClaimOutcome::Claimed(claim) => Ok(claim),
            ClaimOutcome::AlreadyClaimed => Err(OrchestratorError::AlreadyClaimed {
                task_id: task_id.clone(),
            }),
            ClaimOutcome::TaskNotFound => Err(OrchestratorError::Task(
                tx_protocol::TaskError::NotFound {
                    id: task_id.to_string(),
                },
            )),
            ClaimOutcome::TaskNotReady => Err(OrchestratorError::TaskNotReady {
                task_id: task_id.clone(),
            }),
            ClaimOutcome::WorkerNotFound => Err(OrchestratorError::WorkerNotFound {
                worker_id: worker_id.clone(),
            }),
            ClaimOutcome::WorkerDead => Err(OrchestratorError::WorkerDead {
                worker_id: worker_id.clone(),
            }),
        }
    }

    pub async fn renew(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
    ) -> Result<TaskClaim, OrchestratorError> {
        match self
            .state
            .renew_claim(
                task_id,
                worker_id,
                self.config.lease_duration(),
                self.config.max_renewals,
                self.clock.now(),
            )
            .await?
        {
            RenewOutcome::Renewed(claim) => Ok(claim),
            RenewOutcome::NotFound => Err(OrchestratorError::ClaimNotFound {
                task_id: task_id.clone(),
                worker_id: worker_id.clone(),
            }),
            RenewOutcome::Expired => Err(OrchestratorError::LeaseExpired {
                task_id: task_id.clone(),
            }),
            RenewOutcome::MaxRenewalsExceeded { max } => {
                Err(OrchestratorError::MaxRenewalsExceeded {
                    task_id: task_id.clone(),
                    max,
                })
            }
        }
    }

    pub async fn release(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        completed: bool,
    ) -> Result<TaskStatus, OrchestratorError> {
        match self
            .state
            .release_claim(task_id, worker_id, completed, self.clock.now())
            .await?
        {
            ReleaseOutcome::Released { task_status } => Ok(task_status),
            ReleaseOutcome::NotFound => Err(OrchestratorError::ClaimNotFound {
                task_id: task_id.clone(),
                worker_id: worker_id.clone(),
            }),
        }
    }

    pub async fn reconcile_once(&self) -> Result<ReconcileReport, OrchestratorError> {
        let report = self
            .state
            .reconcile(self.config.heartbeat_threshold(), self.clock.now())
            .await
            .map_err(|err| OrchestratorError::Internal {
                code: "store_busy".to_string(),
                reason: err.to_string(),
            })?;
        if !report.is_noop() {
            info!(
                dead_workers = report.dead_workers_found,
                expired_claims = report.expired_claims_released,
                orphaned_tasks = report.orphaned_tasks_recovered,
                stale_states = report.stale_states_fixed,
                "reconciliation repaired state"
            );
        }
        Ok(report)
    }

    /// Marks the singleton as starting and then running.
    pub async fn start(&self, pid: i64) -> Result<(), OrchestratorError> {
        for status in [OrchestratorStatus::Starting, OrchestratorStatus::Running] {
            let moved = self
                .state
                .transition_orchestrator(status, Some(pid), self.clock.now())
                .await?;
            if !moved {
                let current = self.state.orchestrator_state().await?;
                return Err(OrchestratorError::Internal {
                    code: "lifecycle".to_string(),
                    reason: format!(
                        "cannot move orchestrator from {:?} to {status:?}",
                        current.status
                    ),
                });
            }
        }
        Ok(())
    }

    /// Marks the singleton as stopping and then stopped.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        for status in [OrchestratorStatus::Stopping, OrchestratorStatus::Stopped] {
            self.state
                .transition_orchestrator(status, None, self.clock.now())
                .await?;
        }
        Ok(())
    }

    /// The reconcile fiber: one pass per interval until cancelled. A failed
    /// pass (for instance a peer holding the immediate lock past the busy
    /// timeout) is logged and retried at the next tick; the pass is
    /// idempotent so a skipped tick only delays recovery.
    pub async fn run_reconcile_loop(&self, token: CancellationToken) {
        let interval =
            std::time::Duration::from_secs(self.config.reconcile_interval_seconds.max(1) as u64);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.reconcile_once().await {
                        error!("reconciliation pass failed: {err}");
                    }
                }
            }
        }
    }
}
