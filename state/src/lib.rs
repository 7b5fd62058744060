//! SQLite-backed store for the tx task substrate.
//!
//! This crate owns every row: tasks and their dependency graph, workers and
//! claims, learnings with their keyword/vector indexes, candidates, anchors,
//! runs, and the outbox. Services in `tx-core` drive it by id through
//! per-operation transactional reads; multi-row state changes are expressed
//! here as single `BEGIN IMMEDIATE` transactions.

mod migrations;
mod model;
mod runtime;

pub use migrations::latest_schema_version;
pub use model::AnchorCreateParams;
pub use model::CandidateCreateParams;
pub use model::CompactionRecord;
pub use model::LearningCreateParams;
pub use model::MessageCreateParams;
pub use model::RunCreateParams;
pub use model::TaskCreateParams;
pub use model::TaskPatch;
pub use model::WorkerRegisterParams;
pub use runtime::AddDependencyOutcome;
pub use runtime::ClaimOutcome;
pub use runtime::CompletionOutcome;
pub use runtime::DB_FILENAME;
pub use runtime::DeleteOutcome;
pub use runtime::PromoteOutcome;
pub use runtime::RegistrationOutcome;
pub use runtime::ReleaseOutcome;
pub use runtime::RenewOutcome;
pub use runtime::StateRuntime;
pub use runtime::ValidationIssue;
pub use runtime::ValidationSeverity;
