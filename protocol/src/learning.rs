use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::RunId;
use crate::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningSource {
    Compaction,
    Run,
    Manual,
    ClaudeMd,
}

impl LearningSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            LearningSource::Compaction => "compaction",
            LearningSource::Run => "run",
            LearningSource::Manual => "manual",
            LearningSource::ClaudeMd => "claude_md",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "compaction" => Ok(Self::Compaction),
            "run" => Ok(Self::Run),
            "manual" => Ok(Self::Manual),
            "claude_md" => Ok(Self::ClaudeMd),
            _ => Err(format!("invalid learning source: {value}")),
        }
    }
}

/// A durable note extracted from completed work, retrievable by hybrid
/// search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learning {
    pub id: i64,
    pub content: String,
    pub source: LearningSource,
    pub source_ref: Option<String>,
    pub category: Option<String>,
    pub keywords: Vec<String>,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Outcome feedback in `[0, 1]` when known.
    pub outcome_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub const fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("invalid confidence: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Promoted,
    Rejected,
    Merged,
}

impl CandidateStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Promoted => "promoted",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::Merged => "merged",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "pending" => Ok(Self::Pending),
            "promoted" => Ok(Self::Promoted),
            "rejected" => Ok(Self::Rejected),
            "merged" => Ok(Self::Merged),
            _ => Err(format!("invalid candidate status: {value}")),
        }
    }
}

/// An extracted but not-yet-promoted learning awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningCandidate {
    pub id: i64,
    pub content: String,
    pub confidence: Confidence,
    pub category: Option<String>,
    pub source_file: Option<String>,
    pub source_run_id: Option<RunId>,
    pub source_task_id: Option<TaskId>,
    pub status: CandidateStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub promoted_learning_id: Option<i64>,
    pub rejection_reason: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorType {
    Glob,
    Hash,
    Symbol,
    LineRange,
}

impl AnchorType {
    pub const fn as_str(self) -> &'static str {
        match self {
            AnchorType::Glob => "glob",
            AnchorType::Hash => "hash",
            AnchorType::Symbol => "symbol",
            AnchorType::LineRange => "line_range",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "glob" => Ok(Self::Glob),
            "hash" => Ok(Self::Hash),
            "symbol" => Ok(Self::Symbol),
            "line_range" => Ok(Self::LineRange),
            _ => Err(format!("invalid anchor type: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    Valid,
    Drifted,
    Invalid,
}

impl AnchorStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            AnchorStatus::Valid => "valid",
            AnchorStatus::Drifted => "drifted",
            AnchorStatus::Invalid => "invalid",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "valid" => Ok(Self::Valid),
            "drifted" => Ok(Self::Drifted),
            "invalid" => Ok(Self::Invalid),
            _ => Err(format!("invalid anchor status: {value}")),
        }
    }
}

/// A pointer from a learning to a location in a source file, tracked for
/// drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: i64,
    pub learning_id: i64,
    pub anchor_type: AnchorType,
    pub value: String,
    pub file_path: String,
    pub symbol_fqn: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub content_hash: Option<String>,
    pub status: AnchorStatus,
    /// Pinned anchors are never auto-invalidated by the verify pass.
    pub pinned: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Anchor {
    /// Type-specific structural validation.
    pub fn validate(&self) -> Result<(), String> {
        match self.anchor_type {
            AnchorType::Glob => {
                if self.value.is_empty() {
                    return Err("glob anchor requires a non-empty pattern".to_string());
                }
            }
            AnchorType::Hash => {
                if self.value.len() != 64 || !self.value.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(format!(
                        "hash anchor value must be 64 hex characters: {}",
                        self.value
                    ));
                }
            }
            AnchorType::Symbol => {
                let fqn = self.symbol_fqn.as_deref().unwrap_or("");
                if !fqn.contains("::") {
                    return Err(format!(
                        "symbol anchor requires a fully-qualified name with `::` segments: {fqn}"
                    ));
                }
            }
            AnchorType::LineRange => {
                let start = self.line_start.unwrap_or(0);
                let end = self.line_end.unwrap_or(0);
                if start < 1 || end < start {
                    return Err(format!(
                        "line_range anchor requires 1 <= line_start <= line_end: {start}..{end}"
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningEdgeType {
    Supports,
    Contradicts,
    Refines,
}

impl LearningEdgeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            LearningEdgeType::Supports => "supports",
            LearningEdgeType::Contradicts => "contradicts",
            LearningEdgeType::Refines => "refines",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "supports" => Ok(Self::Supports),
            "contradicts" => Ok(Self::Contradicts),
            "refines" => Ok(Self::Refines),
            _ => Err(format!("invalid learning edge type: {value}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(anchor_type: AnchorType) -> Anchor {
        Anchor {
            id: 1,
            learning_id: 1,
            anchor_type,
            value: String::new(),
            file_path: "src/lib.rs".to_string(),
            symbol_fqn: None,
            line_start: None,
            line_end: None,
            content_hash: None,
            status: AnchorStatus::Valid,
            pinned: false,
            verified_at: None,
        }
    }

    #[test]
    fn hash_anchor_requires_64_hex_chars() {
        let mut a = anchor(AnchorType::Hash);
        a.value = "ab".repeat(32);
        assert!(a.validate().is_ok());
        a.value = "xy".repeat(32);
        assert!(a.validate().is_err());
        a.value = "ab".repeat(16);
        assert!(a.validate().is_err());
    }

    #[test]
    fn symbol_anchor_requires_fqn() {
        let mut a = anchor(AnchorType::Symbol);
        a.value = "readiness".to_string();
        assert!(a.validate().is_err());
        a.symbol_fqn = Some("kernel::readiness::compute".to_string());
        assert!(a.validate().is_ok());
    }

    #[test]
    fn line_range_anchor_requires_ordered_bounds() {
        let mut a = anchor(AnchorType::LineRange);
        a.value = "10-20".to_string();
        a.line_start = Some(10);
        a.line_end = Some(20);
        assert!(a.validate().is_ok());
        a.line_end = Some(9);
        assert!(a.validate().is_err());
        a.line_start = Some(0);
        assert!(a.validate().is_err());
    }
}
