use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::ConnectOptions;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use log::LevelFilter;
use tracing::warn;

use crate::migrations::run_migrations;

mod anchors;
mod candidates;
mod claims;
mod compaction;
mod dependencies;
mod learnings;
mod messages;
mod orchestrator;
mod runs;
mod tasks;
#[cfg(test)]
mod test_support;
mod validate;
mod workers;

pub use candidates::PromoteOutcome;
pub use claims::ClaimOutcome;
pub use claims::ReleaseOutcome;
pub use claims::RenewOutcome;
pub use dependencies::AddDependencyOutcome;
pub use tasks::CompletionOutcome;
pub use tasks::DeleteOutcome;
pub use validate::ValidationIssue;
pub use validate::ValidationSeverity;
pub use workers::RegistrationOutcome;

pub const DB_FILENAME: &str = "tx.sqlite";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the tx store. Cheap to clone; all state lives in SQLite.
#[derive(Clone, Debug)]
pub struct StateRuntime {
    db_path: PathBuf,
    pool: Arc<SqlitePool>,
}

impl StateRuntime {
    /// Opens (and migrates) the store at `home/tx.sqlite`, creating the
    /// directory when missing.
    pub async fn init(home: PathBuf) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&home).await?;
        Self::init_at(home.join(DB_FILENAME), DEFAULT_BUSY_TIMEOUT).await
    }

    /// Opens (and migrates) the store at an explicit database path.
    pub async fn init_at(db_path: PathBuf, busy_timeout: Duration) -> anyhow::Result<Arc<Self>> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = match open_sqlite(&db_path, busy_timeout).await {
            Ok(pool) => Arc::new(pool),
            Err(err) => {
                warn!("failed to open store at {}: {err}", db_path.display());
                return Err(err);
            }
        };
        Ok(Arc::new(Self { db_path, pool }))
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        self.pool.as_ref()
    }
}

async fn open_sqlite(path: &Path, busy_timeout: Duration) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(busy_timeout)
        .log_statements(LevelFilter::Off);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}
