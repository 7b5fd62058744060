use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use tx_protocol::CompactionError;
use tx_protocol::Confidence;
use tx_protocol::LearningCandidate;
use tx_protocol::RunId;
use tx_protocol::Task;
use tx_protocol::TaskId;
use tx_state::CandidateCreateParams;
use tx_state::CompactionRecord;
use tx_state::PromoteOutcome;
use tx_state::StateRuntime;

use crate::clock::Clock;
use crate::llm::LlmClient;
use crate::paths::resolve_in_root;

/// Extraction keeps at most this many candidates per transcript chunk.
const MAX_CANDIDATES_PER_CHUNK: usize = 5;
/// Extracted content shorter than this is noise.
const MIN_CANDIDATE_CONTENT: usize = 10;

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize completed engineering tasks. Reply with a \
JSON object {\"summary\": string, \"learnings\": [string]} where summary is 2-4 paragraphs and \
learnings is a bullet list of actionable, durable notes.";

const EXTRACT_SYSTEM_PROMPT: &str = "You extract durable engineering learnings from an agent \
transcript chunk. Reply with a JSON object {\"candidates\": [{\"content\": string, \
\"confidence\": \"high\"|\"medium\"|\"low\", \"category\": string}]} with at most five entries.";

#[derive(Debug, Deserialize)]
struct SummaryReply {
    summary: String,
    #[serde(default)]
    learnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractReply {
    #[serde(default)]
    candidates: Vec<CandidateReply>,
}

#[derive(Debug, Deserialize)]
struct CandidateReply {
    #[serde(default)]
    content: String,
    #[serde(default)]
    confidence: String,
    #[serde(default)]
    category: String,
}

#[derive(Debug, Clone)]
pub struct CompactionPreview {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone)]
pub enum CompactionOutcome {
    /// Nothing was eligible before the cutoff.
    Empty,
    Compacted(CompactionRecord),
}

/// Compaction and candidate promotion: distills finished work into durable
/// learnings, then deletes it atomically.
pub struct Compactor {
    state: Arc<StateRuntime>,
    llm: Arc<LlmClient>,
    clock: Clock,
    project_root: PathBuf,
}

impl Compactor {
    pub fn new(
        state: Arc<StateRuntime>,
        llm: Arc<LlmClient>,
        clock: Clock,
        project_root: PathBuf,
    ) -> Self {
        Self {
            state,
            llm,
            clock,
            project_root,
        }
    }

    /// Dry run: what would be compacted. Works without any LLM backend.
    pub async fn preview(
        &self,
        before: DateTime<Utc>,
    ) -> Result<CompactionPreview, CompactionError> {
        let tasks = self.state.compactable_tasks(before).await?;
        Ok(CompactionPreview { tasks })
    }

    /// Full compaction. Ordering is deliberate: the markdown export is
    /// written before the transaction begins, so the log never references a
    /// file that failed to write.
    pub async fn compact(
        &self,
        before: DateTime<Utc>,
        export_path: Option<&Path>,
    ) -> Result<CompactionOutcome, CompactionError> {
        let tasks = self.state.compactable_tasks(before).await?;
        if tasks.is_empty() {
            return Ok(CompactionOutcome::Empty);
        }
        if !self.llm.is_available() {
            return Err(CompactionError::LlmUnavailable);
        }

        let digest = tasks
            .iter()
            .map(|task| format!("- {} ({}): {}", task.title, task.id, task.description))
            .collect::<Vec<_>>()
            .join("\n");
        let reply: SummaryReply = self
            .llm
            .complete_json(
                SUMMARY_SYSTEM_PROMPT,
                &format!("Completed tasks:\n{digest}"),
            )
            .await
            .map_err(CompactionError::Store)?;

        let now = self.clock.now();
        let exported_to = match export_path {
            Some(path) => {
                let resolved = resolve_in_root(&self.project_root, path)
                    .map_err(|_| CompactionError::PathOutsideRoot {
                        path: path.display().to_string(),
                    })?;
                self.append_markdown(&resolved, &reply, now).await?;
                Some(resolved.display().to_string())
            }
            None => None,
        };

        let task_ids: Vec<TaskId> = tasks.iter().map(|task| task.id.clone()).collect();
        let record = self
            .state
            .compact_tasks(
                &task_ids,
                Some(reply.summary.as_str()),
                &reply.learnings,
                exported_to.as_deref(),
                now,
            )
            .await?;
        Ok(CompactionOutcome::Compacted(record))
    }

    async fn append_markdown(
        &self,
        path: &Path,
        reply: &SummaryReply,
        now: DateTime<Utc>,
    ) -> Result<(), CompactionError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut section = format!(
            "\n## Compacted {}\n\n{}\n",
            now.format("%Y-%m-%d"),
            reply.summary
        );
        if !reply.learnings.is_empty() {
            section.push('\n');
            for learning in &reply.learnings {
                section.push_str(&format!("- {learning}\n"));
            }
        }
        let existing = match tokio::fs::read_to_string(path).await {
            Ok(existing) => existing,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        tokio::fs::write(path, existing + &section).await?;
        Ok(())
    }

    /// Candidate extraction over transcript chunks; gated on the LLM
    /// backend. High-confidence candidates are promoted automatically.
    pub async fn extract_candidates(
        &self,
        chunks: &[String],
        source_file: Option<&str>,
        source_run_id: Option<&RunId>,
        source_task_id: Option<&TaskId>,
    ) -> Result<Vec<LearningCandidate>, CompactionError> {
        if !self.llm.is_available() {
            return Err(CompactionError::LlmUnavailable);
        }
        let now = self.clock.now();
        let mut stored = Vec::new();
        for chunk in chunks {
            let reply: ExtractReply = self
                .llm
                .complete_json(EXTRACT_SYSTEM_PROMPT, chunk)
                .await
                .map_err(CompactionError::Store)?;
            for candidate in reply.candidates.into_iter().take(MAX_CANDIDATES_PER_CHUNK) {
                let content = candidate.content.trim();
                if content.len() < MIN_CANDIDATE_CONTENT {
                    continue;
                }
                let confidence = match Confidence::parse(candidate.confidence.as_str()) {
                    Ok(confidence) => confidence,
                    Err(_) => {
                        warn!(
                            confidence = candidate.confidence,
                            "invalid candidate confidence; coercing to medium"
                        );
                        Confidence::Medium
                    }
                };
                let category = if candidate.category.trim().is_empty() {
                    warn!("candidate is missing a category; coercing to other");
                    "other".to_string()
                } else {
                    candidate.category.trim().to_string()
                };
                let inserted = self
                    .state
                    .insert_candidate(
                        &CandidateCreateParams {
                            content: content.to_string(),
                            confidence,
                            category: Some(category),
                            source_file: source_file.map(str::to_string),
                            source_run_id: source_run_id.cloned(),
                            source_task_id: source_task_id.cloned(),
                        },
                        now,
                    )
                    .await?;
                stored.push(inserted);
            }
        }

        // Auto-promote high-confidence candidates.
        let mut result = Vec::with_capacity(stored.len());
        for candidate in stored {
            if candidate.confidence == Confidence::High {
                match self
                    .state
                    .promote_candidate(candidate.id, "auto", now)
                    .await?
                {
                    PromoteOutcome::Promoted { candidate, .. } => result.push(candidate),
                    _ => result.push(candidate),
                }
            } else {
                result.push(candidate);
            }
        }
        Ok(result)
    }

    pub async fn promote(
        &self,
        id: i64,
        reviewed_by: &str,
    ) -> Result<LearningCandidate, CompactionError> {
        match self
            .state
            .promote_candidate(id, reviewed_by, self.clock.now())
            .await?
        {
            PromoteOutcome::Promoted { candidate, .. } => Ok(candidate),
            PromoteOutcome::NotFound => Err(CompactionError::CandidateNotFound { id }),
            PromoteOutcome::NotPending { status } => Err(CompactionError::CandidateNotPending {
                id,
                status: status.as_str().to_string(),
            }),
        }
    }

    pub async fn reject(
        &self,
        id: i64,
        reviewed_by: &str,
        reason: &str,
    ) -> Result<LearningCandidate, CompactionError> {
        match self
            .state
            .reject_candidate(id, reviewed_by, reason, self.clock.now())
            .await?
        {
            Some(candidate) => Ok(candidate),
            None => match self.state.get_candidate(id).await? {
                Some(candidate) => Err(CompactionError::CandidateNotPending {
                    id,
                    status: candidate.status.as_str().to_string(),
                }),
                None => Err(CompactionError::CandidateNotFound { id }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::test_support::test_epoch;
    use crate::test_support::test_state;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tx_protocol::CandidateStatus;
    use tx_state::TaskCreateParams;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn chat_reply(payload: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"content": payload.to_string()}}]
        })
    }

    async fn fixture(
        llm: LlmClient,
        root: &Path,
    ) -> (Arc<StateRuntime>, Compactor, Clock, tempfile::TempDir) {
        let (state, dir) = test_state().await;
        let clock = Clock::fixed(test_epoch());
        let compactor = Compactor::new(
            state.clone(),
            Arc::new(llm),
            clock.clone(),
            root.to_path_buf(),
        );
        (state, compactor, clock, dir)
    }

    #[tokio::test]
    async fn compact_without_llm_returns_unavailable_but_preview_works() {
        let root = tempfile::TempDir::new().expect("root");
        let (state, compactor, clock, _dir) = fixture(LlmClient::Noop, root.path()).await;
        let task = state
            .create_task(
                &TaskCreateParams {
                    title: "done work".to_string(),
                    status: tx_protocol::TaskStatus::Ready,
                    ..TaskCreateParams::default()
                },
                clock.now(),
            )
            .await
            .expect("task");
        state.complete_task(&task.id, clock.now()).await.expect("complete");

        let cutoff = clock.now() + Duration::days(1);
        let preview = compactor.preview(cutoff).await.expect("preview");
        assert_eq!(preview.tasks.len(), 1);

        let err = compactor
            .compact(cutoff, None)
            .await
            .expect_err("no LLM backend");
        assert!(matches!(err, CompactionError::LlmUnavailable));
        // The task survives.
        assert!(state.get_task(&task.id).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn failed_export_write_leaves_the_store_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply(
                serde_json::json!({"summary": "a summary", "learnings": ["note"]}),
            )))
            .mount(&server)
            .await;
        let llm = LlmClient::from_config(&BackendConfig {
            base_url: Some(format!("{}/v1", server.uri())),
            model: "m".to_string(),
            api_key_env: String::new(),
            timeout_seconds: 5,
        });
        let root = tempfile::TempDir::new().expect("root");
        let (state, compactor, clock, _dir) = fixture(llm, root.path()).await;
        let task = state
            .create_task(
                &TaskCreateParams {
                    title: "done work".to_string(),
                    status: tx_protocol::TaskStatus::Ready,
                    ..TaskCreateParams::default()
                },
                clock.now(),
            )
            .await
            .expect("task");
        state.complete_task(&task.id, clock.now()).await.expect("complete");

        // A path outside the project root is rejected before any I/O or
        // transaction.
        let err = compactor
            .compact(
                clock.now() + Duration::days(1),
                Some(Path::new("../outside.md")),
            )
            .await
            .expect_err("outside path");
        assert!(matches!(err, CompactionError::PathOutsideRoot { .. }));
        assert!(state.get_task(&task.id).await.expect("get").is_some());
        assert!(state.list_compactions(10).await.expect("log").is_empty());
    }

    #[tokio::test]
    async fn compaction_writes_markdown_then_commits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply(serde_json::json!({
                "summary": "Shipped the importer.",
                "learnings": ["batch the reads", "validate at the boundary"],
            }))))
            .mount(&server)
            .await;
        let llm = LlmClient::from_config(&BackendConfig {
            base_url: Some(format!("{}/v1", server.uri())),
            model: "m".to_string(),
            api_key_env: String::new(),
            timeout_seconds: 5,
        });
        let root = tempfile::TempDir::new().expect("root");
        let (state, compactor, clock, _dir) = fixture(llm, root.path()).await;
        let task = state
            .create_task(
                &TaskCreateParams {
                    title: "importer".to_string(),
                    status: tx_protocol::TaskStatus::Ready,
                    ..TaskCreateParams::default()
                },
                clock.now(),
            )
            .await
            .expect("task");
        state.complete_task(&task.id, clock.now()).await.expect("complete");

        let outcome = compactor
            .compact(
                clock.now() + Duration::days(1),
                Some(Path::new("learnings.md")),
            )
            .await
            .expect("compact");
        let CompactionOutcome::Compacted(record) = outcome else {
            panic!("compaction must commit");
        };
        assert_eq!(record.task_ids, vec![task.id.to_string()]);
        assert!(state.get_task(&task.id).await.expect("get").is_none());

        let markdown = std::fs::read_to_string(root.path().join("learnings.md")).expect("file");
        assert!(markdown.contains("## Compacted 2023-11-14"));
        assert!(markdown.contains("Shipped the importer."));
        assert!(markdown.contains("- batch the reads"));
    }

    #[tokio::test]
    async fn extraction_coerces_and_auto_promotes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply(serde_json::json!({
                "candidates": [
                    {"content": "always pin the schema version in migrations", "confidence": "high", "category": "storage"},
                    {"content": "prefer typed errors at service boundaries", "confidence": "definitely", "category": ""},
                    {"content": "too short", "confidence": "low", "category": "misc"},
                ]
            }))))
            .mount(&server)
            .await;
        let llm = LlmClient::from_config(&BackendConfig {
            base_url: Some(format!("{}/v1", server.uri())),
            model: "m".to_string(),
            api_key_env: String::new(),
            timeout_seconds: 5,
        });
        let root = tempfile::TempDir::new().expect("root");
        let (state, compactor, _clock, _dir) = fixture(llm, root.path()).await;

        let candidates = compactor
            .extract_candidates(&["chunk one".to_string()], Some("t.jsonl"), None, None)
            .await
            .expect("extract");
        // The short one is dropped; the invalid confidence coerces to
        // medium with category "other".
        assert_eq!(candidates.len(), 2);
        let high = &candidates[0];
        assert_eq!(high.status, CandidateStatus::Promoted);
        assert_eq!(high.reviewed_by.as_deref(), Some("auto"));
        let coerced = &candidates[1];
        assert_eq!(coerced.confidence, Confidence::Medium);
        assert_eq!(coerced.category.as_deref(), Some("other"));
        assert_eq!(coerced.status, CandidateStatus::Pending);

        let learnings = state.list_learnings(None).await.expect("learnings");
        assert_eq!(learnings.len(), 1);
    }
}
