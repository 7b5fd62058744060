//! Shared wire and entity types for the tx task substrate.
//!
//! Everything that crosses a crate boundary lives here: task/worker/claim
//! entities, their status enums with the permitted-transition graph, the
//! typed error families surfaced to callers, and the JSONL sync operations.

mod error;
mod ids;
mod learning;
mod run;
mod sync;
mod task;
mod worker;

pub use error::CompactionError;
pub use error::OrchestratorError;
pub use error::RetrievalError;
pub use error::SyncError;
pub use error::TaskError;
pub use ids::RunId;
pub use ids::TaskId;
pub use ids::WorkerId;
pub use learning::Anchor;
pub use learning::AnchorStatus;
pub use learning::AnchorType;
pub use learning::CandidateStatus;
pub use learning::Confidence;
pub use learning::Learning;
pub use learning::LearningCandidate;
pub use learning::LearningEdgeType;
pub use learning::LearningSource;
pub use run::Message;
pub use run::MessageStatus;
pub use run::Run;
pub use run::RunHeartbeat;
pub use run::RunStatus;
pub use sync::SyncOp;
pub use sync::SyncRecord;
pub use sync::TaskSnapshot;
pub use sync::SYNC_VERSION;
pub use task::Assignee;
pub use task::AssigneeKind;
pub use task::ScoreBreakdown;
pub use task::ScoredTask;
pub use task::Task;
pub use task::TaskStatus;
pub use worker::ClaimStatus;
pub use worker::OrchestratorState;
pub use worker::OrchestratorStatus;
pub use worker::ReconcileReport;
pub use worker::TaskClaim;
pub use worker::Worker;
pub use worker::WorkerStatus;
