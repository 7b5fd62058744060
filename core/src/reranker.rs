use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tracing::warn;

use tx_protocol::RetrievalError;

use crate::config::BackendConfig;
use crate::http::post_json;
use crate::llm::read_api_key;

/// Second-pass reranking backend. When absent the retrieval engine keeps the
/// fusion ordering and decays scores slightly by position instead.
pub enum RerankerClient {
    Live(LiveReranker),
    Noop,
}

pub struct LiveReranker {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl RerankerClient {
    pub fn from_config(config: &BackendConfig) -> Self {
        let Some(base_url) = config.base_url.clone() else {
            return RerankerClient::Noop;
        };
        let http = match reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
        {
            Ok(http) => http,
            Err(err) => {
                warn!("failed to build reranker client, keeping fusion order: {err}");
                return RerankerClient::Noop;
            }
        };
        RerankerClient::Live(LiveReranker {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: read_api_key(&config.api_key_env),
        })
    }

    pub fn is_available(&self) -> bool {
        matches!(self, RerankerClient::Live(_))
    }

    /// Scores each document against the query; the result is indexed like
    /// the input.
    pub async fn rerank(
        &self,
        query: &str,
        documents: &[&str],
    ) -> Result<Vec<f64>, RetrievalError> {
        let RerankerClient::Live(live) = self else {
            return Err(RetrievalError::RerankerUnavailable);
        };
        let body = json!({
            "model": live.model,
            "query": query,
            "documents": documents,
        });
        let response = post_json(
            &live.http,
            &format!("{}/rerank", live.base_url),
            live.api_key.as_deref(),
            &body,
        )
        .await
        .map_err(|err| RetrievalError::Retrieval {
            message: format!("rerank call failed: {err}"),
        })?;
        let results = response
            .pointer("/results")
            .and_then(Value::as_array)
            .ok_or_else(|| RetrievalError::Retrieval {
                message: "rerank reply is missing results".to_string(),
            })?;
        let mut scores = vec![0.0_f64; documents.len()];
        for entry in results {
            let index = entry
                .pointer("/index")
                .and_then(Value::as_u64)
                .ok_or_else(|| RetrievalError::Retrieval {
                    message: "rerank result is missing the index".to_string(),
                })? as usize;
            let score = entry
                .pointer("/relevance_score")
                .and_then(Value::as_f64)
                .ok_or_else(|| RetrievalError::Retrieval {
                    message: "rerank result is missing the score".to_string(),
                })?;
            if index < scores.len() {
                scores[index] = score;
            }
        }
        Ok(scores)
    }
}
