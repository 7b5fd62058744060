use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::parse_ts;

/// One committed compaction: which tasks were deleted and what they left
/// behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub id: i64,
    pub compacted_at: DateTime<Utc>,
    pub task_count: i64,
    pub summary: Option<String>,
    pub task_ids: Vec<String>,
    pub learnings_exported_to: Option<String>,
    pub learnings: Vec<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CompactionLogRow {
    pub(crate) id: i64,
    pub(crate) compacted_at: String,
    pub(crate) task_count: i64,
    pub(crate) summary: Option<String>,
    pub(crate) task_ids: String,
    pub(crate) learnings_exported_to: Option<String>,
    pub(crate) learnings: Option<String>,
}

impl TryFrom<CompactionLogRow> for CompactionRecord {
    type Error = anyhow::Error;

    fn try_from(row: CompactionLogRow) -> Result<Self, Self::Error> {
        let learnings = match row.learnings.as_deref() {
            Some(value) => serde_json::from_str(value)?,
            None => Vec::new(),
        };
        Ok(Self {
            id: row.id,
            compacted_at: parse_ts(row.compacted_at.as_str())?,
            task_count: row.task_count,
            summary: row.summary,
            task_ids: serde_json::from_str(row.task_ids.as_str())?,
            learnings_exported_to: row.learnings_exported_to,
            learnings,
        })
    }
}
