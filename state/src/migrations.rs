use anyhow::Context;
use anyhow::bail;
use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use sqlx::SqlitePool;

/// Forward-only migration ledger. Scripts are applied in order under an
/// immediate transaction and recorded in `schema_version`; a store whose
/// recorded version exceeds the highest script here refuses to open.
struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: r#"
CREATE TABLE tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'backlog',
    score INTEGER NOT NULL DEFAULT 0,
    parent_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
    assignee_kind TEXT,
    assignee_id TEXT,
    assigned_at TEXT,
    assigned_by TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX idx_tasks_status ON tasks(status);
CREATE INDEX idx_tasks_parent ON tasks(parent_id);

CREATE TABLE task_dependencies (
    blocker_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    blocked_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    PRIMARY KEY (blocker_id, blocked_id)
);
CREATE INDEX idx_task_dependencies_blocked ON task_dependencies(blocked_id);

CREATE TABLE workers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    hostname TEXT NOT NULL,
    pid INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'starting',
    current_task_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
    capabilities TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    registered_at TEXT NOT NULL,
    last_heartbeat_at TEXT NOT NULL
);
CREATE INDEX idx_workers_heartbeat ON workers(last_heartbeat_at);

CREATE TABLE task_claims (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    worker_id TEXT NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'active',
    claimed_at TEXT NOT NULL,
    lease_expires_at TEXT NOT NULL,
    renewal_count INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX idx_task_claims_active ON task_claims(task_id) WHERE status = 'active';
CREATE INDEX idx_task_claims_worker ON task_claims(worker_id);

CREATE TABLE orchestrator_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    status TEXT NOT NULL DEFAULT 'stopped',
    pid INTEGER,
    started_at TEXT,
    last_reconcile_at TEXT,
    pool_size INTEGER NOT NULL DEFAULT 4,
    reconcile_interval_seconds INTEGER NOT NULL DEFAULT 60,
    heartbeat_interval_seconds INTEGER NOT NULL DEFAULT 30,
    lease_duration_seconds INTEGER NOT NULL DEFAULT 1800,
    metadata TEXT NOT NULL DEFAULT '{}'
);
INSERT INTO orchestrator_state (id, status) VALUES (1, 'stopped');
        "#,
    },
    Migration {
        version: 2,
        sql: r#"
CREATE TABLE learnings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    source TEXT NOT NULL,
    source_ref TEXT,
    category TEXT,
    keywords TEXT NOT NULL DEFAULT '[]',
    usage_count INTEGER NOT NULL DEFAULT 0,
    last_used_at TEXT,
    outcome_score REAL,
    embedding BLOB,
    created_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE learnings_fts USING fts5(
    content,
    keywords,
    content='learnings',
    content_rowid='id'
);
CREATE TRIGGER learnings_fts_insert AFTER INSERT ON learnings BEGIN
    INSERT INTO learnings_fts(rowid, content, keywords)
    VALUES (new.id, new.content, new.keywords);
END;
CREATE TRIGGER learnings_fts_delete AFTER DELETE ON learnings BEGIN
    INSERT INTO learnings_fts(learnings_fts, rowid, content, keywords)
    VALUES ('delete', old.id, old.content, old.keywords);
END;
CREATE TRIGGER learnings_fts_update AFTER UPDATE ON learnings BEGIN
    INSERT INTO learnings_fts(learnings_fts, rowid, content, keywords)
    VALUES ('delete', old.id, old.content, old.keywords);
    INSERT INTO learnings_fts(rowid, content, keywords)
    VALUES (new.id, new.content, new.keywords);
END;

CREATE TABLE learning_candidates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    confidence TEXT NOT NULL DEFAULT 'medium',
    category TEXT,
    source_file TEXT,
    source_run_id TEXT,
    source_task_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    reviewed_by TEXT,
    reviewed_at TEXT,
    promoted_learning_id INTEGER REFERENCES learnings(id) ON DELETE SET NULL,
    rejection_reason TEXT,
    extracted_at TEXT NOT NULL
);
CREATE INDEX idx_learning_candidates_status ON learning_candidates(status);

CREATE TABLE anchors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    learning_id INTEGER NOT NULL REFERENCES learnings(id) ON DELETE CASCADE,
    anchor_type TEXT NOT NULL,
    value TEXT NOT NULL,
    file_path TEXT NOT NULL,
    symbol_fqn TEXT,
    line_start INTEGER,
    line_end INTEGER,
    content_hash TEXT,
    status TEXT NOT NULL DEFAULT 'valid',
    pinned INTEGER NOT NULL DEFAULT 0,
    verified_at TEXT
);
CREATE INDEX idx_anchors_learning ON anchors(learning_id);

CREATE TABLE learning_edges (
    from_id INTEGER NOT NULL REFERENCES learnings(id) ON DELETE CASCADE,
    to_id INTEGER NOT NULL REFERENCES learnings(id) ON DELETE CASCADE,
    edge_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (from_id, to_id, edge_type)
);
        "#,
    },
    Migration {
        version: 3,
        sql: r#"
CREATE TABLE runs (
    id TEXT PRIMARY KEY,
    task_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
    agent TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    exit_code INTEGER,
    pid INTEGER,
    transcript_path TEXT,
    stdout_path TEXT,
    stderr_path TEXT,
    injected_context TEXT,
    summary TEXT,
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    stdout_bytes INTEGER NOT NULL DEFAULT 0,
    stderr_bytes INTEGER NOT NULL DEFAULT 0,
    transcript_bytes INTEGER NOT NULL DEFAULT 0,
    last_activity_at TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT
);
CREATE INDEX idx_runs_task ON runs(task_id);
CREATE INDEX idx_runs_status ON runs(status);

CREATE TABLE messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    correlation_id TEXT,
    task_id TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    acked_at TEXT,
    expires_at TEXT
);
CREATE INDEX idx_messages_channel_status ON messages(channel, status);

CREATE TABLE compaction_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    compacted_at TEXT NOT NULL,
    task_count INTEGER NOT NULL,
    summary TEXT,
    task_ids TEXT NOT NULL,
    learnings_exported_to TEXT,
    learnings TEXT
);
        "#,
    },
];

/// Highest migration version this build knows about.
pub fn latest_schema_version() -> i64 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Applies pending migrations; refuses stores written by a newer build.
pub(crate) async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
)
        "#,
    )
    .execute(pool)
    .await?;

    let current: Option<i64> = sqlx::query(
        r#"
SELECT MAX(version) AS version FROM schema_version
        "#,
    )
    .fetch_one(pool)
    .await?
    .try_get("version")?;
    let current = current.unwrap_or(0);
    let latest = latest_schema_version();
    if current > latest {
        bail!(
            "store schema version {current} is newer than this build supports ({latest}); refusing to downgrade"
        );
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;
        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("applying migration {}", migration.version))?;
        sqlx::query(
            r#"
INSERT INTO schema_version (version, applied_at) VALUES (?, ?)
            "#,
        )
        .bind(migration.version)
        .bind(format_applied_at(Utc::now()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::debug!(version = migration.version, "applied migration");
    }
    Ok(())
}

fn format_applied_at(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
