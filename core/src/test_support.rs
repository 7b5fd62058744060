use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use tempfile::TempDir;

use tx_state::StateRuntime;

use crate::clock::Clock;
use crate::kernel::TaskKernel;

pub(crate) async fn test_state() -> (Arc<StateRuntime>, TempDir) {
    let dir = TempDir::new().expect("create temp dir");
    let runtime = StateRuntime::init(dir.path().to_path_buf())
        .await
        .expect("initialize runtime");
    (runtime, dir)
}

pub(crate) fn test_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("timestamp")
}

pub(crate) async fn test_kernel() -> (TaskKernel, Clock, TempDir) {
    let (state, dir) = test_state().await;
    let clock = Clock::fixed(test_epoch());
    (TaskKernel::new(state, clock.clone()), clock, dir)
}
