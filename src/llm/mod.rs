use std::{env, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use reqwest::Client;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_TOKENS: u32 = 1024;

// One retry before giving up; callers absorb the failure per the search
// fallback contract.
const MAX_ATTEMPTS: u32 = 2;
const RETRY_DELAY_MS: u64 = 500;

/// Single-prompt completion request against the text-completion provider.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub max_tokens: u32,
    pub prompt: String,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            prompt: prompt.into(),
        }
    }
}

/// Captures basic token usage metrics associated with a call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub token_usage: TokenUsage,
}

/// Main entry point for invoking the provider. The API key, base URL and
/// request timeout are environment-supplied; no literal appears in code.
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

#[derive(Clone)]
struct LlmConfig {
    api_key: Option<String>,
    base_url: String,
}

impl LlmClient {
    /// Build a client using environment variables: `ANTHROPIC_API_KEY`,
    /// optional `ANTHROPIC_BASE_URL`, optional `LLM_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY").ok();
        let base_url =
            env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let timeout_secs = env::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            config: LlmConfig { api_key, base_url },
        })
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// Execute a completion. Transport failures and 5xx responses are retried
    /// once; 4xx responses fail immediately.
    pub async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let Some(api_key) = self.config.api_key.as_ref() else {
            bail!("ANTHROPIC_API_KEY is not configured");
        };

        let payload = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": [
                { "role": "user", "content": request.prompt }
            ],
        });

        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = self
                .http
                .post(&url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&payload)
                .send()
                .await;

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .context("failed to read response body")?;

                    if status.is_success() {
                        return parse_message_body(&body, &request.model);
                    }

                    if status.is_server_error() && attempt < MAX_ATTEMPTS {
                        warn!(%status, attempt, "provider returned server error, retrying");
                        last_error = Some(anyhow!("provider call failed with status {status}"));
                    } else {
                        bail!("provider call failed with status {status}: {body}");
                    }
                }
                Err(err) if attempt < MAX_ATTEMPTS => {
                    warn!(?err, attempt, "provider request failed, retrying");
                    last_error = Some(err.into());
                }
                Err(err) => return Err(err).context("provider request failed"),
            }

            sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
        }

        Err(last_error.unwrap_or_else(|| anyhow!("provider call failed")))
    }
}

fn parse_message_body(body: &str, requested_model: &str) -> Result<LlmResponse> {
    let payload: AnthropicMessagePayload = serde_json::from_str(body).with_context(|| {
        let preview: String = body.chars().take(500).collect();
        format!("failed to parse provider response as JSON. Response body: {preview}")
    })?;

    let text = payload
        .content
        .iter()
        .filter(|block| block.block_type == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");

    if text.is_empty() {
        bail!("provider response contained no text content");
    }

    let token_usage = payload
        .usage
        .map(|usage| TokenUsage {
            input_tokens: usage.input_tokens.unwrap_or_default(),
            output_tokens: usage.output_tokens.unwrap_or_default(),
        })
        .unwrap_or_default();

    Ok(LlmResponse {
        text,
        model: payload.model.unwrap_or_else(|| requested_model.to_string()),
        token_usage,
    })
}

#[derive(Debug, Deserialize)]
struct AnthropicMessagePayload {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<usize>,
    #[serde(default)]
    output_tokens: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_payload() {
        let body = r#"{
            "model": "claude-3-haiku-20240307",
            "content": [
                {"type": "text", "text": "flora espacial microgravedad"}
            ],
            "usage": {"input_tokens": 42, "output_tokens": 7}
        }"#;

        let response = parse_message_body(body, "claude-3-haiku-20240307").expect("parse");
        assert_eq!(response.text, "flora espacial microgravedad");
        assert_eq!(response.model, "claude-3-haiku-20240307");
        assert_eq!(response.token_usage.input_tokens, 42);
        assert_eq!(response.token_usage.output_tokens, 7);
    }

    #[test]
    fn skips_non_text_blocks() {
        let body = r#"{
            "content": [
                {"type": "tool_use"},
                {"type": "text", "text": "respuesta"}
            ]
        }"#;

        let response = parse_message_body(body, "claude-3-haiku-20240307").expect("parse");
        assert_eq!(response.text, "respuesta");
        assert_eq!(response.model, "claude-3-haiku-20240307");
        assert_eq!(response.token_usage.input_tokens, 0);
    }

    #[test]
    fn rejects_empty_content() {
        let body = r#"{"content": []}"#;
        assert!(parse_message_body(body, "m").is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_message_body("not-json", "m").is_err());
    }
}
