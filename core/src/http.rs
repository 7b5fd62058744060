use std::time::Duration;

use serde_json::Value;
use tracing::debug;

/// Errors from a capability backend call, split by retriability.
#[derive(Debug)]
pub(crate) enum HttpError {
    /// Connection-level failure; retriable.
    Network(reqwest::Error),
    /// Non-2xx response; 5xx retriable, 4xx surfaced immediately.
    Status { status: u16, body: String },
    /// Response arrived but did not match the expected shape.
    Malformed(String),
}

impl HttpError {
    fn is_retriable(&self) -> bool {
        match self {
            HttpError::Network(_) => true,
            HttpError::Status { status, .. } => *status >= 500,
            HttpError::Malformed(_) => false,
        }
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::Network(err) => write!(f, "network error: {err}"),
            HttpError::Status { status, body } => write!(f, "backend returned {status}: {body}"),
            HttpError::Malformed(detail) => write!(f, "malformed backend response: {detail}"),
        }
    }
}

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 3;

/// POSTs JSON with bounded exponential retry for retriable failures only.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &Value,
) -> Result<Value, HttpError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match post_json_once(client, url, api_key, body).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < MAX_ATTEMPTS => {
                let backoff = RETRY_BASE
                    .saturating_mul(2_u32.saturating_pow(attempt - 1))
                    .min(RETRY_CAP);
                debug!(url, attempt, "retrying backend call after {backoff:?}: {err}");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn post_json_once(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &Value,
) -> Result<Value, HttpError> {
    let mut request = client.post(url).json(body);
    if let Some(api_key) = api_key {
        request = request.bearer_auth(api_key);
    }
    let response = request.send().await.map_err(HttpError::Network)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(HttpError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json()
        .await
        .map_err(|err| HttpError::Malformed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    #[tokio::test]
    async fn retries_5xx_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/echo"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/echo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let value = post_json(
            &client,
            &format!("{}/v1/echo", server.uri()),
            None,
            &serde_json::json!({}),
        )
        .await
        .expect("retried to success");
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn does_not_retry_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/echo"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = post_json(
            &client,
            &format!("{}/v1/echo", server.uri()),
            None,
            &serde_json::json!({}),
        )
        .await
        .expect_err("4xx must surface immediately");
        assert!(matches!(err, HttpError::Status { status: 401, .. }));
    }
}
