use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use tx_state::DB_FILENAME;

pub const CONFIG_FILENAME: &str = ".txrc.json";
pub const DB_PATH_ENV: &str = "TX_DB_PATH";

/// Configuration loaded from `.txrc.json` in the tx home directory. Every
/// field has a default so an absent or partial file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TxConfig {
    pub db_path: Option<PathBuf>,
    pub pool_size: i64,
    pub lease_duration_seconds: i64,
    pub heartbeat_interval_seconds: i64,
    pub reconcile_interval_seconds: i64,
    pub max_renewals: i64,
    pub missed_heartbeats: i64,
    pub busy_timeout_ms: u64,
    pub shutdown_timeout_seconds: u64,
    pub stall_threshold_seconds: i64,
    pub acked_message_max_age_seconds: i64,
    pub retrieval: RetrievalConfig,
    pub llm: BackendConfig,
    pub embedding: EmbeddingBackendConfig,
    pub reranker: BackendConfig,
    pub compaction_export_path: Option<PathBuf>,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            pool_size: 4,
            lease_duration_seconds: 30 * 60,
            heartbeat_interval_seconds: 30,
            reconcile_interval_seconds: 60,
            max_renewals: 10,
            missed_heartbeats: 1,
            busy_timeout_ms: 5_000,
            shutdown_timeout_seconds: 300,
            stall_threshold_seconds: 300,
            acked_message_max_age_seconds: 24 * 60 * 60,
            retrieval: RetrievalConfig::default(),
            llm: BackendConfig {
                api_key_env: "TX_LLM_API_KEY".to_string(),
                ..BackendConfig::default()
            },
            embedding: EmbeddingBackendConfig::default(),
            reranker: BackendConfig {
                api_key_env: "TX_RERANKER_API_KEY".to_string(),
                ..BackendConfig::default()
            },
            compaction_export_path: None,
        }
    }
}

/// Fusion weights and curves; the shipped defaults are a baseline, not an
/// authority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RetrievalConfig {
    pub w_rrf: f64,
    pub w_recency: f64,
    pub w_reranker: f64,
    pub rrf_k: f64,
    pub half_life_days: f64,
    pub min_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            w_rrf: 1.0,
            w_recency: 0.1,
            w_reranker: 0.5,
            rrf_k: 60.0,
            half_life_days: 30.0,
            min_score: 0.0,
        }
    }
}

/// An optional HTTP backend; `base_url = None` means the Noop variant.
/// Secrets come from the named environment variable, never from the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BackendConfig {
    pub base_url: Option<String>,
    pub model: String,
    pub api_key_env: String,
    pub timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: String::new(),
            api_key_env: String::new(),
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EmbeddingBackendConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,
    /// Expected vector dimension; checked against the store when set.
    pub dimension: Option<usize>,
}

impl Default for EmbeddingBackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                api_key_env: "TX_EMBEDDING_API_KEY".to_string(),
                ..BackendConfig::default()
            },
            dimension: None,
        }
    }
}

impl TxConfig {
    /// Reads `.txrc.json` from the home directory; missing file means
    /// defaults.
    pub async fn load(home: &Path) -> anyhow::Result<Self> {
        let path = home.join(CONFIG_FILENAME);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let config: TxConfig = serde_json::from_str(&raw)
                    .map_err(|err| anyhow::anyhow!("invalid {}: {err}", path.display()))?;
                Ok(config)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Database path resolution order: `TX_DB_PATH` env, config `db_path`,
    /// then `<home>/tx.sqlite`.
    pub fn resolve_db_path(&self, home: &Path) -> PathBuf {
        if let Ok(from_env) = std::env::var(DB_PATH_ENV)
            && !from_env.is_empty()
        {
            return PathBuf::from(from_env);
        }
        self.db_path
            .clone()
            .unwrap_or_else(|| home.join(DB_FILENAME))
    }
}

/// Default tx home: `~/.tx`.
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tx")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn partial_config_file_fills_defaults() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        tokio::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"{"pool_size": 8, "retrieval": {"w_recency": 0.25}}"#,
        )
        .await
        .expect("write config");

        let config = TxConfig::load(dir.path()).await.expect("load");
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.retrieval.w_recency, 0.25);
        assert_eq!(config.retrieval.w_rrf, 1.0);
        assert_eq!(config.lease_duration_seconds, 1800);
    }

    #[tokio::test]
    async fn missing_config_file_is_defaults() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let config = TxConfig::load(dir.path()).await.expect("load");
        assert_eq!(config.max_renewals, 10);
        assert!(config.llm.base_url.is_none());
    }
}
