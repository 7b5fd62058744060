use thiserror::Error;

use crate::TaskId;
use crate::TaskStatus;
use crate::WorkerId;

/// Errors surfaced by the task kernel.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {id}")]
    NotFound { id: String },

    #[error("{message}")]
    Validation { message: String },

    #[error("adding blocker {blocker} to {blocked} would create a dependency cycle")]
    CircularDependency { blocker: TaskId, blocked: TaskId },

    #[error("task {id} has children; pass cascade to delete the subtree")]
    HasChildren { id: TaskId },

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidStatusTransition { from: TaskStatus, to: TaskStatus },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl TaskError {
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::NotFound { .. } => "task_not_found",
            TaskError::Validation { .. } => "validation_error",
            TaskError::CircularDependency { .. } => "circular_dependency",
            TaskError::HasChildren { .. } => "has_children",
            TaskError::InvalidStatusTransition { .. } => "invalid_status_transition",
            TaskError::Store(_) => "store_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TaskError::NotFound { .. })
    }
}

/// Errors surfaced by worker registration and the claim/lease protocol.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("task {task_id} already has an active claim")]
    AlreadyClaimed { task_id: TaskId },

    #[error("no active claim for task {task_id} held by worker {worker_id}")]
    ClaimNotFound { task_id: TaskId, worker_id: WorkerId },

    #[error("lease on task {task_id} has expired")]
    LeaseExpired { task_id: TaskId },

    #[error("claim on task {task_id} reached the renewal limit of {max}")]
    MaxRenewalsExceeded { task_id: TaskId, max: i64 },

    #[error("worker not found: {worker_id}")]
    WorkerNotFound { worker_id: WorkerId },

    #[error("worker {worker_id} is dead")]
    WorkerDead { worker_id: WorkerId },

    #[error("task {task_id} is not ready to claim")]
    TaskNotReady { task_id: TaskId },

    #[error("registration failed: {reason}")]
    Registration { reason: String },

    #[error("orchestrator error ({code}): {reason}")]
    Internal { code: String, reason: String },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Store(err)
    }
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::AlreadyClaimed { .. } => "already_claimed",
            OrchestratorError::ClaimNotFound { .. } => "claim_not_found",
            OrchestratorError::LeaseExpired { .. } => "lease_expired",
            OrchestratorError::MaxRenewalsExceeded { .. } => "max_renewals_exceeded",
            OrchestratorError::WorkerNotFound { .. } => "worker_not_found",
            OrchestratorError::WorkerDead { .. } => "worker_dead",
            OrchestratorError::TaskNotReady { .. } => "task_not_ready",
            OrchestratorError::Registration { .. } => "registration_error",
            OrchestratorError::Internal { .. } => "orchestrator_error",
            OrchestratorError::Task(err) => err.code(),
            OrchestratorError::Store(_) => "store_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            OrchestratorError::ClaimNotFound { .. } | OrchestratorError::WorkerNotFound { .. } => {
                true
            }
            OrchestratorError::Task(err) => err.is_not_found(),
            _ => false,
        }
    }
}

/// Errors surfaced by the hybrid retrieval engine.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("no embedding backend is available")]
    EmbeddingUnavailable,

    #[error("embedding dimension mismatch: store has {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    #[error("no reranker backend is available")]
    RerankerUnavailable,

    #[error("retrieval failed: {message}")]
    Retrieval { message: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl RetrievalError {
    pub fn code(&self) -> &'static str {
        match self {
            RetrievalError::EmbeddingUnavailable => "embedding_unavailable",
            RetrievalError::EmbeddingDimensionMismatch { .. } => "embedding_dimension_mismatch",
            RetrievalError::RerankerUnavailable => "reranker_unavailable",
            RetrievalError::Retrieval { .. } => "retrieval_error",
            RetrievalError::Store(_) => "store_error",
        }
    }
}

/// Errors surfaced by compaction and candidate promotion.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("no LLM backend is available; use preview for a dry run")]
    LlmUnavailable,

    #[error("path escapes the project root: {path}")]
    PathOutsideRoot { path: String },

    #[error("candidate not found: {id}")]
    CandidateNotFound { id: i64 },

    #[error("candidate {id} is not pending (status: {status})")]
    CandidateNotPending { id: i64, status: String },

    #[error("failed to write learnings export: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl CompactionError {
    pub fn code(&self) -> &'static str {
        match self {
            CompactionError::LlmUnavailable => "llm_unavailable",
            CompactionError::PathOutsideRoot { .. } => "path_outside_root",
            CompactionError::CandidateNotFound { .. } => "candidate_not_found",
            CompactionError::CandidateNotPending { .. } => "candidate_not_pending",
            CompactionError::Io(_) => "io_error",
            CompactionError::Store(_) => "store_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CompactionError::CandidateNotFound { .. })
    }
}

/// Errors surfaced by the JSONL sync reader/writer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync stream line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("sync I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Parse { .. } => "sync_parse_error",
            SyncError::Io(_) => "io_error",
            SyncError::Store(_) => "store_error",
        }
    }
}
