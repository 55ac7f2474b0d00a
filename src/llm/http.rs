//! OpenAI-compatible HTTP transport.
//!
//! The engine only needs "prompt in, text out"; this provider speaks the
//! chat-completions shape because every local and hosted gateway accepts it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::warn;

use super::LmProvider;

/// Classified transport error so the client can map timeouts to the right
/// error code.
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403 - bad API key or permissions.
    Auth,
    /// 429 - rate limited.
    RateLimit,
    /// 404 or "model not found".
    NotFound,
    /// 408 or transport-level timeout.
    Timeout,
    /// Connection refused, DNS failure, reset.
    Network,
    /// 5xx provider-side outage.
    ServerError,
    Unknown,
}

impl ProviderError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            404 => ProviderErrorKind::NotFound,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            500 | 502 | 503 | 504 => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::Unknown,
        };
        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "provider error ({}, {:?}): {}", status, self.kind, self.message),
            None => write!(f, "provider error ({:?}): {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

fn truncate_body(body: &str) -> String {
    if body.len() > 300 {
        format!("{}...", &body[..300])
    } else {
        body.to_string()
    }
}

/// HTTPS is required for remote URLs; plain HTTP is only allowed for
/// localhost (local inference servers).
fn validate_base_url(base_url: &str) -> anyhow::Result<()> {
    let parsed = reqwest::Url::parse(base_url)
        .map_err(|e| anyhow::anyhow!("invalid base_url '{}': {}", base_url, e))?;
    let host = parsed.host_str().unwrap_or("");
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let is_localhost =
                host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1";
            if is_localhost {
                warn!(
                    base_url,
                    "using unencrypted HTTP for a local LM server; the API key travels in cleartext"
                );
                Ok(())
            } else {
                anyhow::bail!(
                    "HTTP is not allowed for remote base_url '{}'; use HTTPS",
                    base_url
                )
            }
        }
        scheme => anyhow::bail!("unsupported URL scheme '{}' in base_url", scheme),
    }
}

pub struct HttpProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpProvider {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        validate_base_url(base_url)?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn extract_content(body: &Value) -> Option<String> {
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
    }
}

#[async_trait]
impl LmProvider for HttpProvider {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(ProviderError::network(&e)))?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            return Err(anyhow::anyhow!(ProviderError::from_status(status, &text)));
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|e| {
            anyhow::anyhow!(ProviderError {
                kind: ProviderErrorKind::Unknown,
                status: Some(status),
                message: format!("non-JSON completion body: {}", e),
            })
        })?;

        Self::extract_content(&parsed).ok_or_else(|| {
            anyhow::anyhow!(ProviderError {
                kind: ProviderErrorKind::Unknown,
                status: Some(status),
                message: "completion body missing choices[0].message.content".to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_rules() {
        assert!(validate_base_url("https://api.example.com/v1").is_ok());
        assert!(validate_base_url("http://127.0.0.1:8080/v1").is_ok());
        assert!(validate_base_url("http://api.example.com/v1").is_err());
        assert!(validate_base_url("ftp://example.com").is_err());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ProviderError::from_status(401, "").kind, ProviderErrorKind::Auth);
        assert_eq!(ProviderError::from_status(429, "").kind, ProviderErrorKind::RateLimit);
        assert_eq!(ProviderError::from_status(503, "").kind, ProviderErrorKind::ServerError);
        assert_eq!(ProviderError::from_status(408, "").kind, ProviderErrorKind::Timeout);
    }

    #[test]
    fn test_content_extraction() {
        let body = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(HttpProvider::extract_content(&body).unwrap(), "hello");
        assert!(HttpProvider::extract_content(&json!({})).is_none());
    }
}
