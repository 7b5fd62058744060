use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tempfile::TempDir;

use tx_protocol::Task;
use tx_protocol::TaskStatus;

use crate::model::TaskCreateParams;

use super::StateRuntime;

pub(super) async fn test_runtime() -> (Arc<StateRuntime>, TempDir) {
    let dir = TempDir::new().expect("create temp dir");
    let runtime = StateRuntime::init_at(dir.path().join("tx.sqlite"), Duration::from_secs(5))
        .await
        .expect("initialize runtime");
    (runtime, dir)
}

pub(super) fn test_now() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("timestamp")
}

pub(super) async fn seed_task(
    runtime: &StateRuntime,
    title: &str,
    status: TaskStatus,
    now: DateTime<Utc>,
) -> Task {
    runtime
        .create_task(
            &TaskCreateParams {
                title: title.to_string(),
                status,
                ..TaskCreateParams::default()
            },
            now,
        )
        .await
        .expect("create task")
}
