use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;
use tracing::warn;

use crate::config::BackendConfig;
use crate::http::post_json;

/// Chat-completions backend used for compaction summaries and candidate
/// extraction. Probed at startup: a missing base URL (or an unusable client)
/// yields the Noop variant and callers degrade per their own rules.
pub enum LlmClient {
    Live(LiveLlm),
    Noop,
}

pub struct LiveLlm {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn from_config(config: &BackendConfig) -> Self {
        let Some(base_url) = config.base_url.clone() else {
            return LlmClient::Noop;
        };
        let api_key = read_api_key(&config.api_key_env);
        let http = match reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
        {
            Ok(http) => http,
            Err(err) => {
                warn!("failed to build LLM client, running without one: {err}");
                return LlmClient::Noop;
            }
        };
        LlmClient::Live(LiveLlm {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    pub fn is_available(&self) -> bool {
        matches!(self, LlmClient::Live(_))
    }

    /// Sends a prompt and parses the reply as JSON of the expected shape.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        system: &str,
        user: &str,
    ) -> anyhow::Result<T> {
        let LlmClient::Live(live) = self else {
            anyhow::bail!("no LLM backend configured");
        };
        let body = json!({
            "model": live.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "response_format": {"type": "json_object"},
        });
        let response = post_json(
            &live.http,
            &format!("{}/chat/completions", live.base_url),
            live.api_key.as_deref(),
            &body,
        )
        .await
        .map_err(|err| anyhow::anyhow!("LLM call failed: {err}"))?;
        let content = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("LLM reply is missing message content"))?;
        serde_json::from_str(content)
            .map_err(|err| anyhow::anyhow!("LLM reply failed schema validation: {err}"))
    }
}

pub(crate) fn read_api_key(env_var: &str) -> Option<String> {
    if env_var.is_empty() {
        return None;
    }
    std::env::var(env_var).ok().filter(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        summary: String,
    }

    fn config(base_url: Option<String>) -> BackendConfig {
        BackendConfig {
            base_url,
            model: "test-model".to_string(),
            api_key_env: String::new(),
            timeout_seconds: 5,
        }
    }

    #[tokio::test]
    async fn noop_without_base_url() {
        let client = LlmClient::from_config(&config(None));
        assert!(!client.is_available());
        let err = client
            .complete_json::<Reply>("sys", "user")
            .await
            .expect_err("noop has no backend");
        assert!(err.to_string().contains("no LLM backend"));
    }

    #[tokio::test]
    async fn parses_json_payload_from_chat_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "{\"summary\": \"done\"}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::from_config(&config(Some(format!("{}/v1", server.uri()))));
        assert!(client.is_available());
        let reply: Reply = client.complete_json("sys", "user").await.expect("reply");
        assert_eq!(
            reply,
            Reply {
                summary: "done".to_string()
            }
        );
    }

    #[tokio::test]
    async fn schema_violations_fail_loudly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "not json"}}]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::from_config(&config(Some(format!("{}/v1", server.uri()))));
        let err = client
            .complete_json::<Reply>("sys", "user")
            .await
            .expect_err("invalid payload");
        assert!(err.to_string().contains("schema validation"));
    }
}
