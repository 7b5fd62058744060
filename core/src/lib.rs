//! Services of the tx task substrate: the task kernel, the worker
//! orchestrator, hybrid learning retrieval, compaction, and the JSONL sync
//! stream. Everything here drives `tx-state` by id under per-operation
//! transactions; long-lived state never leaves the store.

pub mod anchor;
pub mod clock;
pub mod compaction;
pub mod config;
pub mod embedding;
mod http;
pub mod kernel;
pub mod llm;
pub mod monitor;
pub mod orchestrator;
pub mod paths;
pub mod reranker;
pub mod retrieval;
pub mod sync;
#[cfg(test)]
mod test_support;
pub mod worker;

pub use anchor::AnchorService;
pub use anchor::VerifyReport;
pub use clock::Clock;
pub use compaction::CompactionOutcome;
pub use compaction::CompactionPreview;
pub use compaction::Compactor;
pub use config::TxConfig;
pub use config::default_home;
pub use embedding::EmbeddingClient;
pub use kernel::StatusChange;
pub use kernel::TaskKernel;
pub use llm::LlmClient;
pub use monitor::RunMonitor;
pub use orchestrator::Orchestrator;
pub use orchestrator::OrchestratorConfig;
pub use reranker::RerankerClient;
pub use retrieval::RetrievalEngine;
pub use retrieval::RetrievalHit;
pub use retrieval::SearchOptions;
pub use sync::ImportReport;
pub use sync::SyncStream;
pub use worker::ExecContext;
pub use worker::ExecOutcome;
pub use worker::IoCapture;
pub use worker::TaskExecutor;
pub use worker::WorkerLoop;
