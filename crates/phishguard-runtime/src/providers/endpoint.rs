//! Connection settings shared by the HTTP providers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::time::Duration;

use super::secrets::{ApiCredential, KeyRequirement};
use super::ProviderError;

/// Key, base URL, default model and HTTP client of one provider instance.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub credential: ApiCredential,
    pub base_url: String,
    pub model: String,
    pub client: reqwest::Client,
}

impl Endpoint {
    /// Read `api_key`, `base_url` and `model` from `config`.
    pub fn from_config(
        config: &JsonValue,
        key: &KeyRequirement,
        default_base_url: &str,
        default_model: &str,
    ) -> Result<Self, ProviderError> {
        check_base_url(config)?;
        let credential = key.resolve(config)?;
        let base_url = config["base_url"].as_str().unwrap_or(default_base_url);
        let model = config["model"].as_str().unwrap_or(default_model);
        Self::build(credential, base_url, model)
    }

    pub fn build(
        credential: ApiCredential,
        base_url: &str,
        model: &str,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            credential,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }

    /// Model for a request: the override when given, otherwise the default.
    pub fn model_for<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested.unwrap_or(&self.model)
    }

    /// Send `body` as JSON and decode a successful response.
    pub async fn send_json<Req, Resp>(
        &self,
        request: reqwest::RequestBuilder,
        body: &Req,
        timeout: Duration,
    ) -> Result<Resp, ProviderError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = request
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(timeout)
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

/// Reject a configured `base_url` that is not an http(s) URL.
pub(crate) fn check_base_url(config: &JsonValue) -> Result<(), ProviderError> {
    match config["base_url"].as_str() {
        Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
            Err(ProviderError::NotConfigured(format!(
                "base_url '{}' must start with http:// or https://",
                url
            )))
        }
        _ => Ok(()),
    }
}

/// Extract a provider error message from a JSON error body, falling back to
/// the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Map a non-success HTTP status to a provider error.
async fn status_error(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return ProviderError::RateLimited { retry_after };
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return ProviderError::Unauthorized;
    }

    let body = response.text().await.unwrap_or_default();
    ProviderError::Api {
        status: status.as_u16(),
        message: error_message(&body),
    }
}
