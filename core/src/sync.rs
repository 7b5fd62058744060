use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use tx_protocol::LearningSource;
use tx_protocol::SYNC_VERSION;
use tx_protocol::SyncError;
use tx_protocol::SyncOp;
use tx_protocol::SyncRecord;
use tx_state::AddDependencyOutcome;
use tx_state::StateRuntime;

/// Counters from applying a sync stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub applied: u64,
    pub skipped_unknown_version: u64,
    pub skipped_conflicts: u64,
}

/// Reader/writer for the git-synced JSONL operation stream.
pub struct SyncStream {
    state: Arc<StateRuntime>,
}

impl SyncStream {
    pub fn new(state: Arc<StateRuntime>) -> Self {
        Self { state }
    }

    /// Serializes the full store as timestamp-ordered operations, one JSON
    /// object per line.
    pub async fn export(&self) -> Result<String, SyncError> {
        let mut records: Vec<SyncRecord> = Vec::new();

        for task in self.state.all_tasks().await.map_err(SyncError::Store)? {
            records.push(SyncRecord {
                v: SYNC_VERSION,
                ts: task.updated_at,
                op: SyncOp::Upsert { task },
            });
        }
        for (blocker_id, blocked_id, created_at) in self
            .state
            .all_dependency_edges()
            .await
            .map_err(SyncError::Store)?
        {
            records.push(SyncRecord {
                v: SYNC_VERSION,
                ts: created_at,
                op: SyncOp::DepAdd {
                    blocker_id,
                    blocked_id,
                },
            });
        }
        let mut learnings = self
            .state
            .list_learnings(None)
            .await
            .map_err(SyncError::Store)?;
        // Ascending id order keeps autoincrement assignment stable when the
        // stream is replayed into an empty store.
        learnings.sort_by_key(|learning| learning.id);
        for learning in learnings {
            let record = match (&learning.source, &learning.source_ref) {
                (LearningSource::ClaudeMd, Some(path)) => SyncRecord {
                    v: SYNC_VERSION,
                    ts: learning.created_at,
                    op: SyncOp::FileLearningUpsert {
                        path: path.clone(),
                        content: learning.content.clone(),
                    },
                },
                _ => SyncRecord {
                    v: SYNC_VERSION,
                    ts: learning.created_at,
                    op: SyncOp::LearningUpsert { learning },
                },
            };
            records.push(record);
        }
        for run in self.state.list_runs(None).await.map_err(SyncError::Store)? {
            records.push(SyncRecord {
                v: SYNC_VERSION,
                ts: run.started_at,
                op: SyncOp::AttemptUpsert { attempt: run },
            });
        }

        records.sort_by(|a, b| a.ts.cmp(&b.ts));
        let mut out = String::new();
        for record in &records {
            out.push_str(
                &serde_json::to_string(record).map_err(|err| SyncError::Parse {
                    line: 0,
                    message: err.to_string(),
                })?,
            );
            out.push('\n');
        }
        Ok(out)
    }

    pub async fn export_to(&self, path: &Path) -> Result<(), SyncError> {
        let content = self.export().await?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Applies a stream in timestamp order. Lines with an unknown `v` are
    /// skipped with a warning; malformed JSON fails the import.
    pub async fn import(&self, content: &str) -> Result<ImportReport, SyncError> {
        let mut report = ImportReport::default();
        let mut records: Vec<SyncRecord> = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line).map_err(|err| SyncError::Parse {
                line: index + 1,
                message: err.to_string(),
            })?;
            let version = value.get("v").and_then(Value::as_u64).unwrap_or(0);
            if version != u64::from(SYNC_VERSION) {
                warn!(line = index + 1, version, "skipping sync op with unknown version");
                report.skipped_unknown_version += 1;
                continue;
            }
            let record: SyncRecord =
                serde_json::from_value(value).map_err(|err| SyncError::Parse {
                    line: index + 1,
                    message: err.to_string(),
                })?;
            records.push(record);
        }
        records.sort_by(|a, b| a.ts.cmp(&b.ts));

        for record in records {
            match record.op {
                SyncOp::Upsert { task } => {
                    self.state
                        .upsert_task_snapshot(&task)
                        .await
                        .map_err(SyncError::Store)?;
                }
                SyncOp::Delete { id } => {
                    self.state
                        .delete_task(&id, true)
                        .await
                        .map_err(SyncError::Store)?;
                }
                SyncOp::DepAdd {
                    blocker_id,
                    blocked_id,
                } => {
                    match self
                        .state
                        .add_dependency_checked(&blocker_id, &blocked_id, record.ts)
                        .await
                        .map_err(SyncError::Store)?
                    {
                        AddDependencyOutcome::Added | AddDependencyOutcome::AlreadyExists => {}
                        outcome => {
                            warn!("skipping dep_add {blocker_id} -> {blocked_id}: {outcome:?}");
                            report.skipped_conflicts += 1;
                            continue;
                        }
                    }
                }
                SyncOp::DepRemove {
                    blocker_id,
                    blocked_id,
                } => {
                    self.state
                        .remove_dependency(&blocker_id, &blocked_id)
                        .await
                        .map_err(SyncError::Store)?;
                }
                SyncOp::LearningUpsert { learning } => {
                    self.state
                        .insert_learning_with_id(&learning)
                        .await
                        .map_err(SyncError::Store)?;
                }
                SyncOp::LearningDelete { id } => {
                    self.state
                        .delete_learning(id)
                        .await
                        .map_err(SyncError::Store)?;
                }
                SyncOp::FileLearningUpsert { path, content } => {
                    self.state
                        .upsert_file_learning(&path, &content, record.ts)
                        .await
                        .map_err(SyncError::Store)?;
                }
                SyncOp::FileLearningDelete { path } => {
                    self.state
                        .delete_file_learning(&path)
                        .await
                        .map_err(SyncError::Store)?;
                }
                SyncOp::AttemptUpsert { attempt } => {
                    self.state
                        .insert_run_snapshot(&attempt)
                        .await
                        .map_err(SyncError::Store)?;
                }
            }
            report.applied += 1;
        }
        Ok(report)
    }
}
