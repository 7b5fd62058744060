use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use clap::Parser;
use clap::Subcommand;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tx_core::AnchorService;
use tx_core::Clock;
use tx_core::CompactionOutcome;
use tx_core::Compactor;
use tx_core::EmbeddingClient;
use tx_core::ExecContext;
use tx_core::ExecOutcome;
use tx_core::LlmClient;
use tx_core::Orchestrator;
use tx_core::OrchestratorConfig;
use tx_core::RerankerClient;
use tx_core::RetrievalEngine;
use tx_core::RetrievalHit;
use tx_core::RunMonitor;
use tx_core::SearchOptions;
use tx_core::SyncStream;
use tx_core::TaskExecutor;
use tx_core::TaskKernel;
use tx_core::TxConfig;
use tx_core::WorkerLoop;
use tx_core::config::CONFIG_FILENAME;
use tx_core::default_home;
use tx_protocol::AnchorType;
use tx_protocol::CandidateStatus;
use tx_protocol::CompactionError;
use tx_protocol::OrchestratorError;
use tx_protocol::RetrievalError;
use tx_protocol::RunHeartbeat;
use tx_protocol::RunId;
use tx_protocol::SyncError;
use tx_protocol::Task;
use tx_protocol::TaskError;
use tx_protocol::TaskId;
use tx_protocol::TaskStatus;
use tx_protocol::WorkerId;
use tx_state::AnchorCreateParams;
use tx_state::LearningCreateParams;
use tx_state::MessageCreateParams;
use tx_state::StateRuntime;
use tx_state::TaskCreateParams;
use tx_state::TaskPatch;

/// tx: a local task-and-knowledge substrate for coding agents.
#[derive(Debug, Parser)]
#[clap(name = "tx", version, about)]
struct Cli {
    /// Emit machine-readable JSON instead of text.
    #[clap(long, global = true)]
    json: bool,

    /// Override the tx home directory (default: ~/.tx).
    #[clap(long, global = true, env = "TX_HOME")]
    home: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the tx home, store, and default config.
    Init,
    /// Add a task.
    Add {
        title: String,
        #[clap(long, default_value = "")]
        description: String,
        #[clap(long)]
        status: Option<String>,
        #[clap(long, default_value_t = 0)]
        score: i64,
        #[clap(long)]
        parent: Option<TaskId>,
    },
    /// List tasks, optionally by status.
    List {
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Tasks ready to claim, best first.
    Ready {
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show one task with its score breakdown.
    Show { id: TaskId },
    /// Update task fields.
    Update {
        id: TaskId,
        #[clap(long)]
        title: Option<String>,
        #[clap(long)]
        description: Option<String>,
        #[clap(long)]
        score: Option<i64>,
        #[clap(long)]
        status: Option<String>,
        /// Bypass the status transition graph.
        #[clap(long)]
        force: bool,
    },
    /// Mark a task done; prints any tasks it unblocked.
    Done { id: TaskId },
    /// Delete a task.
    Delete {
        id: TaskId,
        #[clap(long)]
        cascade: bool,
    },
    /// Block a task on another task.
    Block { id: TaskId, blocker: TaskId },
    /// Remove a blocker.
    Unblock { id: TaskId, blocker: TaskId },
    /// Print the task hierarchy.
    Tree,
    /// Claim a ready task for a worker.
    Claim {
        id: TaskId,
        #[clap(long)]
        worker: String,
    },
    /// Extend the lease on a claim.
    ClaimRenew {
        id: TaskId,
        #[clap(long)]
        worker: String,
    },
    /// Release a claim.
    ClaimRelease {
        id: TaskId,
        #[clap(long)]
        worker: String,
        #[clap(long)]
        completed: bool,
    },
    /// Register a worker slot.
    Register {
        #[clap(long)]
        name: Option<String>,
    },
    /// Relevant learnings for a task.
    Context { id: TaskId },
    /// Store a learning.
    Learn {
        content: String,
        #[clap(long, value_delimiter = ',')]
        keywords: Vec<String>,
        #[clap(long)]
        category: Option<String>,
    },
    /// Hybrid search over learnings.
    Recall {
        query: String,
        #[clap(long, default_value_t = 10)]
        limit: usize,
        #[clap(long)]
        rerank: bool,
        #[clap(long)]
        expand: bool,
    },
    /// Run store diagnostics.
    Validate {
        #[clap(long)]
        fix: bool,
    },
    /// Compact done tasks completed before a cutoff.
    Compact {
        #[clap(long)]
        before: String,
        #[clap(long)]
        dry_run: bool,
        #[clap(long)]
        export: Option<PathBuf>,
    },
    /// One reconciliation pass.
    Reconcile,
    /// Batch operations over task ids.
    #[clap(subcommand)]
    Bulk(BulkCommand),
    /// Review extracted learning candidates.
    #[clap(subcommand)]
    Candidate(CandidateCommand),
    /// JSONL sync stream.
    #[clap(subcommand)]
    Sync(SyncCommand),
    /// Anchors binding learnings to code locations.
    #[clap(subcommand)]
    Anchor(AnchorCommand),
    /// Worker outbox messages.
    #[clap(subcommand)]
    Message(MessageCommand),
    /// Execution runs and their heartbeats.
    #[clap(subcommand)]
    Run(RunCommand),
    /// Orchestrator lifecycle.
    #[clap(subcommand)]
    Orchestrator(OrchestratorCommand),
    /// Headless worker loop.
    #[clap(subcommand)]
    Worker(WorkerCommand),
}

#[derive(Debug, Subcommand)]
enum AnchorCommand {
    /// Attach an anchor to a learning.
    Add {
        learning: i64,
        #[clap(long = "type")]
        anchor_type: String,
        #[clap(long)]
        value: String,
        #[clap(long)]
        file: String,
        #[clap(long)]
        symbol: Option<String>,
        /// Line range as start-end.
        #[clap(long)]
        lines: Option<String>,
        #[clap(long)]
        pinned: bool,
    },
    List { learning: i64 },
    /// Re-check every anchor against the working tree.
    Verify,
}

#[derive(Debug, Subcommand)]
enum MessageCommand {
    Post {
        channel: String,
        content: String,
        #[clap(long, default_value = "cli")]
        sender: String,
        #[clap(long)]
        ttl: Option<i64>,
        #[clap(long)]
        task: Option<TaskId>,
    },
    Ack { id: i64 },
    List { channel: String },
}

#[derive(Debug, Subcommand)]
enum RunCommand {
    List {
        #[clap(long)]
        task: Option<TaskId>,
    },
    /// Record a monitor heartbeat (JSON payload).
    Heartbeat { payload: String },
    /// Cancel a stalled run.
    Reap {
        id: String,
        #[clap(long)]
        reset_task: bool,
    },
}

#[derive(Debug, Subcommand)]
enum OrchestratorCommand {
    /// Run the reconcile loop until interrupted.
    Run,
    Status,
}

#[derive(Debug, Subcommand)]
enum WorkerCommand {
    /// Run the headless worker loop until interrupted. Tasks carrying a
    /// `command` metadata entry are executed through the shell.
    Run {
        #[clap(long, default_value = "tx-worker")]
        agent: String,
    },
}

#[derive(Debug, Subcommand)]
enum BulkCommand {
    Done { ids: Vec<TaskId> },
    Score {
        score: i64,
        ids: Vec<TaskId>,
    },
    Reset { ids: Vec<TaskId> },
    Delete {
        ids: Vec<TaskId>,
        #[clap(long)]
        cascade: bool,
    },
}

#[derive(Debug, Subcommand)]
enum CandidateCommand {
    List,
    Promote { id: i64 },
    Reject {
        id: i64,
        #[clap(long)]
        reason: String,
    },
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    Export { path: PathBuf },
    Import { path: PathBuf },
}

struct CliError {
    code: String,
    message: String,
    not_found: bool,
}

impl CliError {
    fn general(message: impl Into<String>) -> Self {
        Self {
            code: "error".to_string(),
            message: message.into(),
            not_found: false,
        }
    }
}

impl From<TaskError> for CliError {
    fn from(err: TaskError) -> Self {
        Self {
            code: err.code().to_string(),
            not_found: err.is_not_found(),
            message: err.to_string(),
        }
    }
}

impl From<OrchestratorError> for CliError {
    fn from(err: OrchestratorError) -> Self {
        Self {
            code: err.code().to_string(),
            not_found: err.is_not_found(),
            message: err.to_string(),
        }
    }
}

impl From<RetrievalError> for CliError {
    fn from(err: RetrievalError) -> Self {
        Self {
            code: err.code().to_string(),
            not_found: false,
            message: err.to_string(),
        }
    }
}

impl From<CompactionError> for CliError {
    fn from(err: CompactionError) -> Self {
        Self {
            code: err.code().to_string(),
            not_found: err.is_not_found(),
            message: err.to_string(),
        }
    }
}

impl From<SyncError> for CliError {
    fn from(err: SyncError) -> Self {
        Self {
            code: err.code().to_string(),
            not_found: false,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::general(err.to_string())
    }
}

/// Wires the constructor graph: store, clock, services.
struct App {
    state: Arc<StateRuntime>,
    config: TxConfig,
    kernel: TaskKernel,
    orchestrator: Orchestrator,
    retrieval: RetrievalEngine,
    compactor: Compactor,
    monitor: RunMonitor,
    anchors: AnchorService,
    embedding: Arc<EmbeddingClient>,
    clock: Clock,
    json: bool,
}

impl App {
    async fn open(home: PathBuf, json: bool) -> Result<Self, CliError> {
        let config = TxConfig::load(&home).await?;
        let db_path = config.resolve_db_path(&home);
        let state = StateRuntime::init_at(
            db_path,
            StdDuration::from_millis(config.busy_timeout_ms),
        )
        .await
        .map_err(|err| CliError {
            code: "store_open_failed".to_string(),
            message: err.to_string(),
            not_found: false,
        })?;

        let clock = Clock::system();
        let embedding = Arc::new(EmbeddingClient::from_config(&config.embedding));
        let reranker = Arc::new(RerankerClient::from_config(&config.reranker));
        let llm = Arc::new(LlmClient::from_config(&config.llm));
        let kernel = TaskKernel::new(state.clone(), clock.clone());
        let orchestrator = Orchestrator::new(
            state.clone(),
            OrchestratorConfig::from_config(&config),
            clock.clone(),
        );
        let retrieval = RetrievalEngine::new(
            state.clone(),
            embedding.clone(),
            reranker,
            config.retrieval,
            clock.clone(),
        );
        let project_root = std::env::current_dir().unwrap_or_else(|_| home.clone());
        let compactor = Compactor::new(state.clone(), llm, clock.clone(), project_root.clone());
        let monitor = RunMonitor::new(
            state.clone(),
            clock.clone(),
            chrono::Duration::seconds(config.stall_threshold_seconds),
        );
        let anchors = AnchorService::new(state.clone(), clock.clone(), project_root);
        Ok(Self {
            state,
            config,
            kernel,
            orchestrator,
            retrieval,
            compactor,
            monitor,
            anchors,
            embedding,
            clock,
            json,
        })
    }

    fn emit(&self, value: serde_json::Value, text: String) {
        if self.json {
            println!("{value}");
        } else {
            println!("{text}");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if json {
                println!(
                    "{}",
                    json!({"error": {"code": err.code, "message": err.message}})
                );
            } else {
                eprintln!("error: {}", err.message);
            }
            if err.not_found {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let home = cli.home.clone().unwrap_or_else(default_home);

    if let Command::Init = cli.command {
        tokio::fs::create_dir_all(&home)
            .await
            .map_err(|err| CliError::general(err.to_string()))?;
        let config_path = home.join(CONFIG_FILENAME);
        if !config_path.exists() {
            let default = serde_json::to_string_pretty(&TxConfig::default())
                .map_err(|err| CliError::general(err.to_string()))?;
            tokio::fs::write(&config_path, default)
                .await
                .map_err(|err| CliError::general(err.to_string()))?;
        }
        let app = App::open(home.clone(), cli.json).await?;
        app.emit(
            json!({"home": home, "db": app.state.db_path()}),
            format!("initialized tx home at {}", home.display()),
        );
        return Ok(());
    }

    let app = App::open(home, cli.json).await?;
    dispatch(&app, cli.command).await
}

async fn dispatch(app: &App, command: Command) -> Result<(), CliError> {
    match command {
        Command::Init => unreachable!("handled before the store opens"),
        Command::Add {
            title,
            description,
            status,
            score,
            parent,
        } => {
            let status = parse_status(status.as_deref())?.unwrap_or(TaskStatus::Backlog);
            let task = app
                .kernel
                .add(TaskCreateParams {
                    title,
                    description,
                    status,
                    score,
                    parent_id: parent,
                    ..TaskCreateParams::default()
                })
                .await?;
            app.emit(
                serde_json::to_value(&task).unwrap_or_default(),
                format!("{}  {}", task.id, task.title),
            );
        }
        Command::List { status, limit } => {
            let status = parse_status(status.as_deref())?;
            let tasks = app.kernel.list(status, limit).await?;
            let text = tasks
                .iter()
                .map(|task| format!("{}  [{}]  {}", task.id, task.status.as_str(), task.title))
                .collect::<Vec<_>>()
                .join("\n");
            app.emit(serde_json::to_value(&tasks).unwrap_or_default(), text);
        }
        Command::Ready { limit } => {
            let ready = app.kernel.get_ready(limit).await?;
            let text = ready
                .iter()
                .map(|scored| {
                    format!(
                        "{}  score={}  {}",
                        scored.task.id, scored.breakdown.total, scored.task.title
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            app.emit(serde_json::to_value(&ready).unwrap_or_default(), text);
        }
        Command::Show { id } => {
            let task = app.kernel.get(&id).await?;
            let breakdown = app.kernel.score(&id).await?;
            let claim = app.state.find_active_claim_by_task(&id).await?;
            let text = format!(
                "{}  [{}]  {}\n  score: {} (base {} + blocks {} + age {} - depth {} - blocked {})\n  claimed: {}",
                task.id,
                task.status.as_str(),
                task.title,
                breakdown.total,
                breakdown.base,
                breakdown.blocks_bonus,
                breakdown.age_bonus,
                breakdown.depth_penalty,
                breakdown.blocked_penalty,
                claim
                    .as_ref()
                    .map(|c| c.worker_id.to_string())
                    .unwrap_or_else(|| "no".to_string()),
            );
            app.emit(
                json!({"task": task, "score": breakdown, "claim": claim}),
                text,
            );
        }
        Command::Update {
            id,
            title,
            description,
            score,
            status,
            force,
        } => {
            let task = app
                .kernel
                .update(
                    &id,
                    TaskPatch {
                        title,
                        description,
                        score,
                        ..TaskPatch::default()
                    },
                )
                .await?;
            let task = match parse_status(status.as_deref())? {
                Some(status) => app.kernel.set_status(&id, status, force).await?.task,
                None => task,
            };
            app.emit(
                serde_json::to_value(&task).unwrap_or_default(),
                format!("{}  [{}]  {}", task.id, task.status.as_str(), task.title),
            );
        }
        Command::Done { id } => {
            let change = app.kernel.done(&id).await?;
            let mut text = format!("{} done", change.task.id);
            if !change.newly_ready.is_empty() {
                let unblocked = change
                    .newly_ready
                    .iter()
                    .map(|task| task.id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                text.push_str(&format!("; now ready: {unblocked}"));
            }
            app.emit(
                json!({"task": change.task, "newly_ready": change.newly_ready}),
                text,
            );
        }
        Command::Delete { id, cascade } => {
            let rows = app.kernel.delete(&id, cascade).await?;
            app.emit(json!({"deleted": rows}), format!("deleted {rows} task(s)"));
        }
        Command::Block { id, blocker } => {
            app.kernel.add_blocker(&id, &blocker).await?;
            app.emit(
                json!({"blocked": id, "blocker": blocker}),
                format!("{id} is now blocked by {blocker}"),
            );
        }
        Command::Unblock { id, blocker } => {
            let removed = app.kernel.remove_blocker(&id, &blocker).await?;
            app.emit(
                json!({"removed": removed}),
                if removed {
                    format!("{id} is no longer blocked by {blocker}")
                } else {
                    format!("{id} was not blocked by {blocker}")
                },
            );
        }
        Command::Tree => {
            let rows = app.kernel.tree().await?;
            let text = rows
                .iter()
                .map(|(task, depth)| {
                    format!(
                        "{}{}  [{}]  {}",
                        "  ".repeat(*depth),
                        task.id,
                        task.status.as_str(),
                        task.title
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            let tasks: Vec<_> = rows
                .iter()
                .map(|(task, depth)| json!({"task": task, "depth": depth}))
                .collect();
            app.emit(json!(tasks), text);
        }
        Command::Claim { id, worker } => {
            let worker_id = WorkerId::from(worker);
            let claim = app.orchestrator.claim(&id, &worker_id).await?;
            app.emit(
                serde_json::to_value(&claim).unwrap_or_default(),
                format!(
                    "claimed {} for {}; lease expires {}",
                    claim.task_id, claim.worker_id, claim.lease_expires_at
                ),
            );
        }
        Command::ClaimRenew { id, worker } => {
            let worker_id = WorkerId::from(worker);
            let claim = app.orchestrator.renew(&id, &worker_id).await?;
            app.emit(
                serde_json::to_value(&claim).unwrap_or_default(),
                format!(
                    "renewed {} (renewal {}); lease expires {}",
                    claim.task_id, claim.renewal_count, claim.lease_expires_at
                ),
            );
        }
        Command::ClaimRelease {
            id,
            worker,
            completed,
        } => {
            let worker_id = WorkerId::from(worker);
            let status = app.orchestrator.release(&id, &worker_id, completed).await?;
            app.emit(
                json!({"task": id, "status": status.as_str()}),
                format!("released {id}; task is now {}", status.as_str()),
            );
        }
        Command::Register { name } => {
            let worker = app
                .orchestrator
                .register(tx_state::WorkerRegisterParams {
                    name,
                    hostname: std::env::var("HOSTNAME")
                        .unwrap_or_else(|_| "localhost".to_string()),
                    pid: std::process::id() as i64,
                    ..tx_state::WorkerRegisterParams::default()
                })
                .await?;
            app.emit(
                serde_json::to_value(&worker).unwrap_or_default(),
                format!("registered worker {} ({})", worker.id, worker.name),
            );
        }
        Command::Context { id } => {
            let task = app.kernel.get(&id).await?;
            let hits = app
                .retrieval
                .context_for_task(&task, &SearchOptions::default())
                .await?;
            emit_hits(app, &hits);
        }
        Command::Learn {
            content,
            keywords,
            category,
        } => {
            let embedding = if app.embedding.is_available() {
                match app.embedding.embed(&content).await {
                    Ok(vector) => Some(vector),
                    Err(err) => {
                        tracing::warn!("storing learning without an embedding: {err}");
                        None
                    }
                }
            } else {
                None
            };
            let learning = app
                .state
                .insert_learning(
                    &LearningCreateParams {
                        keywords,
                        category,
                        embedding,
                        ..LearningCreateParams::manual(content)
                    },
                    app.clock.now(),
                )
                .await?;
            app.emit(
                serde_json::to_value(&learning).unwrap_or_default(),
                format!("learned #{}", learning.id),
            );
        }
        Command::Recall {
            query,
            limit,
            rerank,
            expand,
        } => {
            let hits = app
                .retrieval
                .search(
                    &query,
                    &SearchOptions {
                        limit,
                        min_score: None,
                        rerank,
                        expand_graph: expand,
                    },
                )
                .await?;
            emit_hits(app, &hits);
        }
        Command::Validate { fix } => {
            let issues = app.state.validate_store(fix).await?;
            if issues.is_empty() {
                app.emit(json!({"issues": []}), "store is healthy".to_string());
            } else {
                let text = issues
                    .iter()
                    .map(|issue| {
                        format!(
                            "[{}] {}: {}{}",
                            issue.severity.as_str(),
                            issue.check,
                            issue.detail,
                            if issue.rows_fixed > 0 {
                                format!(" (fixed {} rows)", issue.rows_fixed)
                            } else {
                                String::new()
                            }
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                let issues_json: Vec<_> = issues
                    .iter()
                    .map(|issue| {
                        json!({
                            "check": issue.check,
                            "severity": issue.severity.as_str(),
                            "detail": issue.detail,
                            "fixable": issue.fixable,
                            "rows_fixed": issue.rows_fixed,
                        })
                    })
                    .collect();
                app.emit(json!({"issues": issues_json}), text);
            }
        }
        Command::Compact {
            before,
            dry_run,
            export,
        } => {
            let cutoff = parse_cutoff(&before)?;
            if dry_run {
                let preview = app.compactor.preview(cutoff).await?;
                let text = format!(
                    "would compact {} task(s): {}",
                    preview.tasks.len(),
                    preview
                        .tasks
                        .iter()
                        .map(|task| task.id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                app.emit(json!({"tasks": preview.tasks}), text);
            } else {
                let export = export.or(app.config.compaction_export_path.clone());
                match app.compactor.compact(cutoff, export.as_deref()).await? {
                    CompactionOutcome::Empty => app.emit(
                        json!({"compacted": 0}),
                        "nothing to compact before the cutoff".to_string(),
                    ),
                    CompactionOutcome::Compacted(record) => app.emit(
                        serde_json::to_value(&record).unwrap_or_default(),
                        format!(
                            "compacted {} task(s) into {} learning(s)",
                            record.task_count,
                            record.learnings.len()
                        ),
                    ),
                }
            }
        }
        Command::Reconcile => {
            let report = app.orchestrator.reconcile_once().await?;
            app.emit(
                serde_json::to_value(report).unwrap_or_default(),
                format!(
                    "reconciled in {}ms: {} dead workers, {} expired claims, {} orphaned tasks, {} stale states",
                    report.reconcile_ms,
                    report.dead_workers_found,
                    report.expired_claims_released,
                    report.orphaned_tasks_recovered,
                    report.stale_states_fixed,
                ),
            );
        }
        Command::Bulk(bulk) => match bulk {
            BulkCommand::Done { ids } => {
                let updated = app.kernel.bulk_done(&ids).await?;
                app.emit(json!({"updated": updated}), format!("completed {updated} task(s)"));
            }
            BulkCommand::Score { score, ids } => {
                let updated = app.kernel.bulk_score(&ids, score).await?;
                app.emit(json!({"updated": updated}), format!("rescored {updated} task(s)"));
            }
            BulkCommand::Reset { ids } => {
                let updated = app.kernel.bulk_reset(&ids).await?;
                app.emit(json!({"updated": updated}), format!("reset {updated} task(s)"));
            }
            BulkCommand::Delete { ids, cascade } => {
                let deleted = app.kernel.bulk_delete(&ids, cascade).await?;
                app.emit(json!({"deleted": deleted}), format!("deleted {deleted} task(s)"));
            }
        },
        Command::Candidate(candidate) => match candidate {
            CandidateCommand::List => {
                let candidates = app
                    .state
                    .list_candidates(Some(CandidateStatus::Pending))
                    .await?;
                let text = candidates
                    .iter()
                    .map(|c| {
                        format!(
                            "#{}  [{}]  {}",
                            c.id,
                            c.confidence.as_str(),
                            c.content
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                app.emit(serde_json::to_value(&candidates).unwrap_or_default(), text);
            }
            CandidateCommand::Promote { id } => {
                let candidate = app.compactor.promote(id, "cli").await?;
                app.emit(
                    serde_json::to_value(&candidate).unwrap_or_default(),
                    format!(
                        "promoted #{} to learning #{}",
                        candidate.id,
                        candidate.promoted_learning_id.unwrap_or_default()
                    ),
                );
            }
            CandidateCommand::Reject { id, reason } => {
                let candidate = app.compactor.reject(id, "cli", &reason).await?;
                app.emit(
                    serde_json::to_value(&candidate).unwrap_or_default(),
                    format!("rejected #{}", candidate.id),
                );
            }
        },
        Command::Anchor(anchor) => match anchor {
            AnchorCommand::Add {
                learning,
                anchor_type,
                value,
                file,
                symbol,
                lines,
                pinned,
            } => {
                let anchor_type = AnchorType::parse(&anchor_type).map_err(|message| CliError {
                    code: "validation_error".to_string(),
                    message,
                    not_found: false,
                })?;
                let (line_start, line_end) = parse_line_range(lines.as_deref())?;
                let anchor = app
                    .anchors
                    .add(AnchorCreateParams {
                        learning_id: learning,
                        anchor_type,
                        value,
                        file_path: file,
                        symbol_fqn: symbol,
                        line_start,
                        line_end,
                        content_hash: None,
                        pinned,
                    })
                    .await?;
                app.emit(
                    serde_json::to_value(&anchor).unwrap_or_default(),
                    format!("anchored learning #{} at {}", anchor.learning_id, anchor.file_path),
                );
            }
            AnchorCommand::List { learning } => {
                let anchors = app.anchors.list(learning).await?;
                let text = anchors
                    .iter()
                    .map(|anchor| {
                        format!(
                            "#{}  [{}]  {}  {}",
                            anchor.id,
                            anchor.status.as_str(),
                            anchor.anchor_type.as_str(),
                            anchor.file_path
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                app.emit(serde_json::to_value(&anchors).unwrap_or_default(), text);
            }
            AnchorCommand::Verify => {
                let report = app.anchors.verify_all().await?;
                app.emit(
                    json!({
                        "checked": report.checked,
                        "valid": report.valid,
                        "drifted": report.drifted,
                        "invalid": report.invalid,
                        "pinned_skipped": report.pinned_skipped,
                    }),
                    format!(
                        "checked {}: {} valid, {} drifted, {} invalid ({} pinned skipped)",
                        report.checked,
                        report.valid,
                        report.drifted,
                        report.invalid,
                        report.pinned_skipped
                    ),
                );
            }
        },
        Command::Message(message) => match message {
            MessageCommand::Post {
                channel,
                content,
                sender,
                ttl,
                task,
            } => {
                let message = app
                    .state
                    .post_message(
                        &MessageCreateParams {
                            channel,
                            sender,
                            content,
                            task_id: task,
                            ttl_seconds: ttl,
                            ..MessageCreateParams::default()
                        },
                        app.clock.now(),
                    )
                    .await?;
                app.emit(
                    serde_json::to_value(&message).unwrap_or_default(),
                    format!("posted #{} to {}", message.id, message.channel),
                );
            }
            MessageCommand::Ack { id } => {
                let acked = app.state.ack_message(id, app.clock.now()).await?;
                if !acked {
                    return Err(CliError {
                        code: "message_not_found".to_string(),
                        message: format!("no pending message #{id}"),
                        not_found: true,
                    });
                }
                app.emit(json!({"acked": id}), format!("acked #{id}"));
            }
            MessageCommand::List { channel } => {
                let messages = app.state.list_pending_messages(&channel).await?;
                let text = messages
                    .iter()
                    .map(|message| format!("#{}  {}  {}", message.id, message.sender, message.content))
                    .collect::<Vec<_>>()
                    .join("\n");
                app.emit(serde_json::to_value(&messages).unwrap_or_default(), text);
            }
        },
        Command::Run(run) => match run {
            RunCommand::List { task } => {
                let runs = app.state.list_runs(task.as_ref()).await?;
                let text = runs
                    .iter()
                    .map(|run| {
                        format!(
                            "{}  [{}]  {}  {}",
                            run.id,
                            run.status.as_str(),
                            run.agent,
                            run.task_id
                                .as_ref()
                                .map(|id| id.to_string())
                                .unwrap_or_else(|| "-".to_string())
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                app.emit(serde_json::to_value(&runs).unwrap_or_default(), text);
            }
            RunCommand::Heartbeat { payload } => {
                let heartbeat: RunHeartbeat =
                    serde_json::from_str(&payload).map_err(|err| CliError {
                        code: "validation_error".to_string(),
                        message: format!("invalid heartbeat payload: {err}"),
                        not_found: false,
                    })?;
                let recorded = app.monitor.record_heartbeat(&heartbeat).await?;
                app.emit(
                    json!({"recorded": recorded}),
                    if recorded {
                        "heartbeat recorded".to_string()
                    } else {
                        "run is not running; heartbeat ignored".to_string()
                    },
                );
            }
            RunCommand::Reap { id, reset_task } => {
                let run_id = RunId::from(id);
                let Some(run) = app.state.get_run(&run_id).await? else {
                    return Err(CliError {
                        code: "run_not_found".to_string(),
                        message: format!("run not found: {run_id}"),
                        not_found: true,
                    });
                };
                let reaped = app.monitor.reap(&run, reset_task).await?;
                app.emit(
                    json!({"reaped": reaped}),
                    if reaped {
                        format!("reaped {run_id}")
                    } else {
                        format!("{run_id} already finished")
                    },
                );
            }
        },
        Command::Orchestrator(orchestrator) => match orchestrator {
            OrchestratorCommand::Run => {
                app.orchestrator.start(std::process::id() as i64).await?;
                let token = CancellationToken::new();
                let loop_token = token.clone();
                let orchestrator = app.orchestrator.clone();
                let reconciler =
                    tokio::spawn(async move { orchestrator.run_reconcile_loop(loop_token).await });
                wait_for_shutdown().await;
                token.cancel();
                let timeout = StdDuration::from_secs(app.config.shutdown_timeout_seconds);
                if tokio::time::timeout(timeout, reconciler).await.is_err() {
                    tracing::warn!("reconcile loop did not stop within the shutdown timeout");
                }
                app.orchestrator.stop().await?;
                app.emit(json!({"stopped": true}), "orchestrator stopped".to_string());
            }
            OrchestratorCommand::Status => {
                let state = app.state.orchestrator_state().await?;
                app.emit(
                    serde_json::to_value(&state).unwrap_or_default(),
                    format!(
                        "orchestrator is {} (pool {}, last reconcile {})",
                        state.status.as_str(),
                        state.pool_size,
                        state
                            .last_reconcile_at
                            .map(|ts| ts.to_rfc3339())
                            .unwrap_or_else(|| "never".to_string())
                    ),
                );
            }
        },
        Command::Worker(worker) => match worker {
            WorkerCommand::Run { agent } => {
                let worker = WorkerLoop::new(
                    app.state.clone(),
                    app.orchestrator.clone(),
                    app.kernel.clone(),
                    Arc::new(ShellExecutor),
                    agent,
                    app.clock.clone(),
                );
                let token = CancellationToken::new();
                let shutdown_token = token.clone();
                tokio::spawn(async move {
                    wait_for_shutdown().await;
                    shutdown_token.cancel();
                });
                worker.run(token).await?;
                app.emit(json!({"stopped": true}), "worker stopped".to_string());
            }
        },
        Command::Sync(sync) => match sync {
            SyncCommand::Export { path } => {
                SyncStream::new(app.state.clone()).export_to(&path).await?;
                app.emit(json!({"path": path}), format!("exported to {}", path.display()));
            }
            SyncCommand::Import { path } => {
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|err| CliError::general(err.to_string()))?;
                let report = SyncStream::new(app.state.clone()).import(&content).await?;
                app.emit(
                    json!({
                        "applied": report.applied,
                        "skipped_unknown_version": report.skipped_unknown_version,
                        "skipped_conflicts": report.skipped_conflicts,
                    }),
                    format!(
                        "applied {} op(s); skipped {} unknown-version, {} conflicting",
                        report.applied,
                        report.skipped_unknown_version,
                        report.skipped_conflicts
                    ),
                );
            }
        },
    }
    // Messages and stalled runs are housekeeping every invocation can do.
    if let Err(err) = app
        .state
        .gc_messages(
            chrono::Duration::seconds(app.config.acked_message_max_age_seconds),
            app.clock.now(),
        )
        .await
    {
        tracing::warn!("message GC failed: {err}");
    }
    if let Err(err) = app.monitor.sweep(false).await {
        tracing::warn!("stalled-run sweep failed: {err}");
    }
    Ok(())
}

fn emit_hits(app: &App, hits: &[RetrievalHit]) {
    let text = hits
        .iter()
        .map(|hit| {
            format!(
                "#{}  {:.4}  {}",
                hit.learning.id, hit.relevance_score, hit.learning.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let hits_json: Vec<_> = hits
        .iter()
        .map(|hit| {
            json!({
                "learning": hit.learning,
                "bm25_rank": hit.bm25_rank,
                "vector_rank": hit.vector_rank,
                "rrf_score": hit.rrf_score,
                "recency_score": hit.recency_score,
                "reranker_score": hit.reranker_score,
                "relevance_score": hit.relevance_score,
                "expansion_hops": hit.expansion_hops,
                "expansion_path": hit.expansion_path,
                "source_edge": hit.source_edge,
            })
        })
        .collect();
    app.emit(json!(hits_json), text);
}

fn parse_status(value: Option<&str>) -> Result<Option<TaskStatus>, CliError> {
    value
        .map(|value| {
            TaskStatus::parse(value).map_err(|err| CliError {
                code: "validation_error".to_string(),
                message: err,
                not_found: false,
            })
        })
        .transpose()
}

/// Accepts an RFC 3339 timestamp or a plain date.
fn parse_cutoff(value: &str) -> Result<DateTime<Utc>, CliError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(DateTime::from_naive_utc_and_offset(midnight, Utc));
    }
    Err(CliError {
        code: "validation_error".to_string(),
        message: format!("cannot parse cutoff timestamp: {value}"),
        not_found: false,
    })
}

/// Executes a task's `command` metadata entry through the shell; tasks
/// without one complete immediately.
struct ShellExecutor;

#[async_trait::async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, task: &Task, _ctx: &ExecContext) -> anyhow::Result<ExecOutcome> {
        let Some(command) = task.metadata.get("command").and_then(serde_json::Value::as_str)
        else {
            return Ok(ExecOutcome {
                exit_code: 0,
                summary: Some("no command attached".to_string()),
            });
        };
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await?;
        Ok(ExecOutcome {
            exit_code: i64::from(status.code().unwrap_or(-1)),
            summary: None,
        })
    }
}

async fn wait_for_shutdown() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {err}");
    }
}

fn parse_line_range(value: Option<&str>) -> Result<(Option<i64>, Option<i64>), CliError> {
    let Some(value) = value else {
        return Ok((None, None));
    };
    let invalid = || CliError {
        code: "validation_error".to_string(),
        message: format!("cannot parse line range: {value}"),
        not_found: false,
    };
    let (start, end) = value.split_once('-').ok_or_else(invalid)?;
    let start: i64 = start.trim().parse().map_err(|_| invalid())?;
    let end: i64 = end.trim().parse().map_err(|_| invalid())?;
    Ok((Some(start), Some(end)))
}
