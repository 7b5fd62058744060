use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::Learning;
use crate::Run;
use crate::Task;
use crate::TaskId;

/// Current JSONL sync stream version. Lines with any other `v` are skipped
/// with a warning so newer writers do not break older readers.
pub const SYNC_VERSION: u32 = 1;

/// Full task payload carried by an `upsert` operation.
pub type TaskSnapshot = Task;

/// One line of the git-synced JSONL stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub v: u32,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub op: SyncOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncOp {
    Upsert {
        task: TaskSnapshot,
    },
    /// Tombstone; the task and its dependency edges are removed.
    Delete {
        id: TaskId,
    },
    DepAdd {
        blocker_id: TaskId,
        blocked_id: TaskId,
    },
    DepRemove {
        blocker_id: TaskId,
        blocked_id: TaskId,
    },
    LearningUpsert {
        learning: Learning,
    },
    LearningDelete {
        id: i64,
    },
    FileLearningUpsert {
        path: String,
        content: String,
    },
    FileLearningDelete {
        path: String,
    },
    /// Attempts are immutable; there is no delete operation.
    AttemptUpsert {
        attempt: Run,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dep_ops_round_trip_as_jsonl() {
        let record = SyncRecord {
            v: SYNC_VERSION,
            ts: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("timestamp"),
            op: SyncOp::DepAdd {
                blocker_id: "tx-aaa111".parse().expect("id"),
                blocked_id: "tx-bbb222".parse().expect("id"),
            },
        };
        let line = serde_json::to_string(&record).expect("serialize");
        assert!(line.contains(r#""op":"dep_add""#));
        assert!(line.contains(r#""v":1"#));
        let back: SyncRecord = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(record, back);
    }
}
