use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::Digest;
use sha2::Sha256;
use tracing::debug;

use tx_protocol::Anchor;
use tx_protocol::AnchorStatus;
use tx_protocol::TaskError;
use tx_state::AnchorCreateParams;
use tx_state::StateRuntime;

use crate::clock::Clock;
use crate::paths::resolve_in_root;

/// Counters from one anchor verification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: u64,
    pub valid: u64,
    pub drifted: u64,
    pub invalid: u64,
    pub pinned_skipped: u64,
}

/// Code-location bindings for learnings, tracked for drift against the
/// files they point into.
pub struct AnchorService {
    state: Arc<StateRuntime>,
    clock: Clock,
    project_root: PathBuf,
}

impl AnchorService {
    pub fn new(state: Arc<StateRuntime>, clock: Clock, project_root: PathBuf) -> Self {
        Self {
            state,
            clock,
            project_root,
        }
    }

    /// Validates the type-specific constraints before inserting.
    pub async fn add(&self, params: AnchorCreateParams) -> Result<Anchor, TaskError> {
        let draft = Anchor {
            id: 0,
            learning_id: params.learning_id,
            anchor_type: params.anchor_type,
            value: params.value.clone(),
            file_path: params.file_path.clone(),
            symbol_fqn: params.symbol_fqn.clone(),
            line_start: params.line_start,
            line_end: params.line_end,
            content_hash: params.content_hash.clone(),
            status: AnchorStatus::Valid,
            pinned: params.pinned,
            verified_at: None,
        };
        draft
            .validate()
            .map_err(|message| TaskError::Validation { message })?;
        Ok(self.state.insert_anchor(&params).await?)
    }

    pub async fn list(&self, learning_id: i64) -> Result<Vec<Anchor>, TaskError> {
        Ok(self.state.list_anchors_for_learning(learning_id).await?)
    }

    /// Re-checks every anchor against the working tree. A missing file
    /// invalidates; changed content drifts. Pinned anchors are never
    /// auto-invalidated.
    pub async fn verify_all(&self) -> Result<VerifyReport, TaskError> {
        let now = self.clock.now();
        let mut report = VerifyReport::default();
        for anchor in self.state.list_all_anchors().await? {
            if anchor.pinned {
                report.pinned_skipped += 1;
                continue;
            }
            report.checked += 1;
            let (status, hash) = self.check_anchor(&anchor).await;
            match status {
                AnchorStatus::Valid => report.valid += 1,
                AnchorStatus::Drifted => report.drifted += 1,
                AnchorStatus::Invalid => report.invalid += 1,
            }
            if status != anchor.status || hash.is_some() {
                self.state
                    .set_anchor_status(anchor.id, status, hash.as_deref(), now)
                    .await?;
            }
            debug!(anchor = anchor.id, status = status.as_str(), "verified anchor");
        }
        Ok(report)
    }

    async fn check_anchor(&self, anchor: &Anchor) -> (AnchorStatus, Option<String>) {
        let Ok(path) = resolve_in_root(&self.project_root, Path::new(&anchor.file_path)) else {
            return (AnchorStatus::Invalid, None);
        };
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(_) => return (AnchorStatus::Invalid, None),
        };
        let current = sha256_hex(&content);

        match anchor.anchor_type {
            tx_protocol::AnchorType::Hash => {
                if current == anchor.value {
                    (AnchorStatus::Valid, Some(current))
                } else {
                    (AnchorStatus::Drifted, Some(current))
                }
            }
            _ => match anchor.content_hash.as_deref() {
                Some(seen) if seen == current => (AnchorStatus::Valid, Some(current)),
                Some(_) => (AnchorStatus::Drifted, Some(current)),
                // First verification records the baseline hash.
                None => (AnchorStatus::Valid, Some(current)),
            },
        }
    }
}

fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_epoch;
    use crate::test_support::test_state;
    use pretty_assertions::assert_eq;
    use tx_protocol::AnchorType;
    use tx_state::LearningCreateParams;

    async fn fixture() -> (Arc<StateRuntime>, AnchorService, tempfile::TempDir, tempfile::TempDir)
    {
        let (state, dir) = test_state().await;
        let root = tempfile::TempDir::new().expect("root");
        let service = AnchorService::new(
            state.clone(),
            Clock::fixed(test_epoch()),
            root.path().to_path_buf(),
        );
        (state, service, root, dir)
    }

    #[tokio::test]
    async fn add_rejects_structurally_invalid_anchors() {
        let (state, service, _root, _dir) = fixture().await;
        let learning = state
            .insert_learning(&LearningCreateParams::manual("note"), test_epoch())
            .await
            .expect("learning");

        let err = service
            .add(AnchorCreateParams {
                learning_id: learning.id,
                anchor_type: AnchorType::Hash,
                value: "nothex".to_string(),
                file_path: "src/lib.rs".to_string(),
                symbol_fqn: None,
                line_start: None,
                line_end: None,
                content_hash: None,
                pinned: false,
            })
            .await
            .expect_err("bad hash");
        assert!(matches!(err, TaskError::Validation { .. }));
    }

    #[tokio::test]
    async fn verify_tracks_drift_and_missing_files() {
        let (state, service, root, _dir) = fixture().await;
        let learning = state
            .insert_learning(&LearningCreateParams::manual("note"), test_epoch())
            .await
            .expect("learning");

        let file = root.path().join("module.rs");
        std::fs::write(&file, b"fn answer() -> u32 { 42 }").expect("write");
        let baseline = sha256_hex(b"fn answer() -> u32 { 42 }");

        let tracked = service
            .add(AnchorCreateParams {
                learning_id: learning.id,
                anchor_type: AnchorType::Hash,
                value: baseline.clone(),
                file_path: "module.rs".to_string(),
                symbol_fqn: None,
                line_start: None,
                line_end: None,
                content_hash: Some(baseline),
                pinned: false,
            })
            .await
            .expect("add");
        service
            .add(AnchorCreateParams {
                learning_id: learning.id,
                anchor_type: AnchorType::LineRange,
                value: "1-1".to_string(),
                file_path: "missing.rs".to_string(),
                symbol_fqn: None,
                line_start: Some(1),
                line_end: Some(1),
                content_hash: None,
                pinned: false,
            })
            .await
            .expect("add");

        let report = service.verify_all().await.expect("verify");
        assert_eq!(report.checked, 2);
        assert_eq!(report.valid, 1);
        assert_eq!(report.invalid, 1);

        // Edit the file: the hash anchor drifts.
        std::fs::write(&file, b"fn answer() -> u32 { 41 }").expect("write");
        let report = service.verify_all().await.expect("verify");
        assert_eq!(report.drifted, 1);
        let refreshed = state
            .get_anchor(tracked.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(refreshed.status, AnchorStatus::Drifted);
        assert!(refreshed.verified_at.is_some());
    }
}
