use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tracing::warn;

use tx_protocol::RetrievalError;

use crate::config::EmbeddingBackendConfig;
use crate::http::post_json;
use crate::llm::read_api_key;

/// Dense-embedding backend. Noop when unconfigured; the retrieval engine
/// then runs keyword-only.
pub enum EmbeddingClient {
    Live(LiveEmbedding),
    Noop,
}

pub struct LiveEmbedding {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimension: Option<usize>,
}

impl EmbeddingClient {
    pub fn from_config(config: &EmbeddingBackendConfig) -> Self {
        let Some(base_url) = config.backend.base_url.clone() else {
            return EmbeddingClient::Noop;
        };
        let http = match reqwest::Client::builder()
            .timeout(Duration::from_secs(config.backend.timeout_seconds))
            .build()
        {
            Ok(http) => http,
            Err(err) => {
                warn!("failed to build embedding client, running keyword-only: {err}");
                return EmbeddingClient::Noop;
            }
        };
        EmbeddingClient::Live(LiveEmbedding {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.backend.model.clone(),
            api_key: read_api_key(&config.backend.api_key_env),
            dimension: config.dimension,
        })
    }

    pub fn is_available(&self) -> bool {
        matches!(self, EmbeddingClient::Live(_))
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let EmbeddingClient::Live(live) = self else {
            return Err(RetrievalError::EmbeddingUnavailable);
        };
        let body = json!({
            "model": live.model,
            "input": [text],
        });
        let response = post_json(
            &live.http,
            &format!("{}/embeddings", live.base_url),
            live.api_key.as_deref(),
            &body,
        )
        .await
        .map_err(|err| RetrievalError::Retrieval {
            message: format!("embedding call failed: {err}"),
        })?;
        let values = response
            .pointer("/data/0/embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| RetrievalError::Retrieval {
                message: "embedding reply is missing the vector".to_string(),
            })?;
        let vector: Vec<f32> = values
            .iter()
            .map(|value| {
                value
                    .as_f64()
                    .map(|v| v as f32)
                    .ok_or_else(|| RetrievalError::Retrieval {
                        message: "embedding vector holds a non-numeric entry".to_string(),
                    })
            })
            .collect::<Result<_, _>>()?;
        if let Some(expected) = live.dimension
            && vector.len() != expected
        {
            return Err(RetrievalError::EmbeddingDimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

/// Cosine similarity; dimensions must already agree.
pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    #[test]
    fn cosine_basics() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!(cosine(&[1.0, 1.0], &[-1.0, -1.0]) < -0.99);
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_loudly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3]}]
            })))
            .mount(&server)
            .await;

        let client = EmbeddingClient::from_config(&EmbeddingBackendConfig {
            backend: BackendConfig {
                base_url: Some(format!("{}/v1", server.uri())),
                model: "embed".to_string(),
                api_key_env: String::new(),
                timeout_seconds: 5,
            },
            dimension: Some(4),
        });
        let err = client.embed("hello").await.expect_err("wrong dimension");
        assert!(matches!(
            err,
            RetrievalError::EmbeddingDimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }
}
