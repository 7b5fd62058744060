use anyhow::Result;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use serde_json::Value;

mod compaction;
mod learning;
mod run;
mod task;
mod worker;

pub use compaction::CompactionRecord;
pub(crate) use compaction::CompactionLogRow;
pub use learning::AnchorCreateParams;
pub use learning::CandidateCreateParams;
pub use learning::LearningCreateParams;
pub(crate) use learning::AnchorRow;
pub(crate) use learning::CandidateRow;
pub(crate) use learning::LearningRow;
pub use run::MessageCreateParams;
pub use run::RunCreateParams;
pub(crate) use run::MessageRow;
pub(crate) use run::RunRow;
pub use task::TaskCreateParams;
pub use task::TaskPatch;
pub(crate) use task::TaskRow;
pub use worker::WorkerRegisterParams;
pub(crate) use worker::ClaimRow;
pub(crate) use worker::OrchestratorRow;
pub(crate) use worker::WorkerRow;

/// All timestamps are stored as fixed-width RFC 3339 UTC strings so that
/// lexicographic comparison in SQL matches chronological order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn format_ts_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(format_ts)
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| anyhow::anyhow!("invalid timestamp {value}: {err}"))
}

pub(crate) fn parse_ts_opt(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_ts).transpose()
}

pub(crate) fn parse_json_object(value: &str) -> Result<Value> {
    let parsed: Value = serde_json::from_str(value)?;
    Ok(parsed)
}

pub(crate) fn parse_string_vec(value: &str) -> Result<Vec<String>> {
    let parsed: Vec<String> = serde_json::from_str(value)?;
    Ok(parsed)
}

/// Embeddings are stored as little-endian f32 blobs.
pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        anyhow::bail!("embedding blob length {} is not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
