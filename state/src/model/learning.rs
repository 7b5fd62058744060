use tx_protocol::Anchor;
use tx_protocol::AnchorStatus;
use tx_protocol::AnchorType;
use tx_protocol::CandidateStatus;
use tx_protocol::Confidence;
use tx_protocol::Learning;
use tx_protocol::LearningCandidate;
use tx_protocol::LearningSource;
use tx_protocol::RunId;
use tx_protocol::TaskId;

use super::decode_embedding;
use super::parse_string_vec;
use super::parse_ts;
use super::parse_ts_opt;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LearningRow {
    pub(crate) id: i64,
    pub(crate) content: String,
    pub(crate) source: String,
    pub(crate) source_ref: Option<String>,
    pub(crate) category: Option<String>,
    pub(crate) keywords: String,
    pub(crate) usage_count: i64,
    pub(crate) last_used_at: Option<String>,
    pub(crate) outcome_score: Option<f64>,
    pub(crate) embedding: Option<Vec<u8>>,
    pub(crate) created_at: String,
}

impl TryFrom<LearningRow> for Learning {
    type Error = anyhow::Error;

    fn try_from(row: LearningRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            content: row.content,
            source: LearningSource::parse(row.source.as_str())
                .map_err(|err| anyhow::anyhow!(err))?,
            source_ref: row.source_ref,
            category: row.category,
            keywords: parse_string_vec(row.keywords.as_str())?,
            usage_count: row.usage_count,
            last_used_at: parse_ts_opt(row.last_used_at.as_deref())?,
            outcome_score: row.outcome_score,
            embedding: row
                .embedding
                .as_deref()
                .map(decode_embedding)
                .transpose()?,
            created_at: parse_ts(row.created_at.as_str())?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CandidateRow {
    pub(crate) id: i64,
    pub(crate) content: String,
    pub(crate) confidence: String,
    pub(crate) category: Option<String>,
    pub(crate) source_file: Option<String>,
    pub(crate) source_run_id: Option<String>,
    pub(crate) source_task_id: Option<String>,
    pub(crate) status: String,
    pub(crate) reviewed_by: Option<String>,
    pub(crate) reviewed_at: Option<String>,
    pub(crate) promoted_learning_id: Option<i64>,
    pub(crate) rejection_reason: Option<String>,
    pub(crate) extracted_at: String,
}

impl TryFrom<CandidateRow> for LearningCandidate {
    type Error = anyhow::Error;

    fn try_from(row: CandidateRow) -> Result<Self, Self::Error> {
        let source_task_id = row
            .source_task_id
            .map(|value| value.parse::<TaskId>())
            .transpose()
            .map_err(|err: String| anyhow::anyhow!(err))?;
        Ok(Self {
            id: row.id,
            content: row.content,
            confidence: Confidence::parse(row.confidence.as_str())
                .map_err(|err| anyhow::anyhow!(err))?,
            category: row.category,
            source_file: row.source_file,
            source_run_id: row.source_run_id.map(RunId::from),
            source_task_id,
            status: CandidateStatus::parse(row.status.as_str())
                .map_err(|err| anyhow::anyhow!(err))?,
            reviewed_by: row.reviewed_by,
            reviewed_at: parse_ts_opt(row.reviewed_at.as_deref())?,
            promoted_learning_id: row.promoted_learning_id,
            rejection_reason: row.rejection_reason,
            extracted_at: parse_ts(row.extracted_at.as_str())?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AnchorRow {
    pub(crate) id: i64,
    pub(crate) learning_id: i64,
    pub(crate) anchor_type: String,
    pub(crate) value: String,
    pub(crate) file_path: String,
    pub(crate) symbol_fqn: Option<String>,
    pub(crate) line_start: Option<i64>,
    pub(crate) line_end: Option<i64>,
    pub(crate) content_hash: Option<String>,
    pub(crate) status: String,
    pub(crate) pinned: i64,
    pub(crate) verified_at: Option<String>,
}

impl TryFrom<AnchorRow> for Anchor {
    type Error = anyhow::Error;

    fn try_from(row: AnchorRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            learning_id: row.learning_id,
            anchor_type: AnchorType::parse(row.anchor_type.as_str())
                .map_err(|err| anyhow::anyhow!(err))?,
            value: row.value,
            file_path: row.file_path,
            symbol_fqn: row.symbol_fqn,
            line_start: row.line_start,
            line_end: row.line_end,
            content_hash: row.content_hash,
            status: AnchorStatus::parse(row.status.as_str())
                .map_err(|err| anyhow::anyhow!(err))?,
            pinned: row.pinned != 0,
            verified_at: parse_ts_opt(row.verified_at.as_deref())?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LearningCreateParams {
    pub content: String,
    pub source: LearningSource,
    pub source_ref: Option<String>,
    pub category: Option<String>,
    pub keywords: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub outcome_score: Option<f64>,
}

impl LearningCreateParams {
    pub fn manual(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: LearningSource::Manual,
            source_ref: None,
            category: None,
            keywords: Vec::new(),
            embedding: None,
            outcome_score: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CandidateCreateParams {
    pub content: String,
    pub confidence: Confidence,
    pub category: Option<String>,
    pub source_file: Option<String>,
    pub source_run_id: Option<RunId>,
    pub source_task_id: Option<TaskId>,
}

#[derive(Debug, Clone)]
pub struct AnchorCreateParams {
    pub learning_id: i64,
    pub anchor_type: AnchorType,
    pub value: String,
    pub file_path: String,
    pub symbol_fqn: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub content_hash: Option<String>,
    pub pinned: bool,
}
