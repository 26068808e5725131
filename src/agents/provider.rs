//! Generative capability backing the agent council.
//!
//! Agents are polymorphic over a single text-in/text-out method. The mock
//! implementation is first-class: it is the default when no external
//! provider is configured and drives every deterministic test.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::NodeConfig;
use crate::errors::ProviderError;

#[async_trait]
pub trait GenerativeCapability: Send + Sync {
    /// Produce a completion for the prompt. Blocking from the caller's view,
    /// cancellable by dropping the future.
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;

    fn name(&self) -> &'static str;
}

/// Select the provider from configuration. Mock unless explicitly external.
pub fn provider_from_config(config: &NodeConfig) -> Arc<dyn GenerativeCapability> {
    match config.provider {
        crate::config::ProviderKind::Mock => Arc::new(MockProvider::new()),
        crate::config::ProviderKind::External => Arc::new(ExternalProvider::new(
            config.provider_url.clone().unwrap_or_default(),
            config.provider_api_key.clone(),
        )),
    }
}

// --- Mock ------------------------------------------------------------------

/// Scripted behavior for prompts matching a substring.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Respond(String),
    Fail(ProviderError),
    /// Sleep, then fail as unavailable; used to exercise round deadlines.
    Stall { secs: u64 },
}

/// Deterministic canned provider. Scripts are checked in insertion order;
/// a pattern is one or more `&`-separated substrings that must all appear
/// in the prompt. Unmatched prompts get a fixed canned answer so unscripted
/// runs still complete.
#[derive(Debug, Default)]
pub struct MockProvider {
    scripts: Vec<(String, MockBehavior)>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, matches: impl Into<String>, behavior: MockBehavior) -> Self {
        self.scripts.push((matches.into(), behavior));
        self
    }

    /// Canned approval vote used for any unscripted evaluation prompt.
    pub fn canned_vote() -> String {
        serde_json::json!({
            "vote": "approve",
            "U": 0.7,
            "L": 0.7,
            "F": 0.7,
            "R": 0.7,
            "confidence": 0.6,
            "reasoning": "canned mock evaluation"
        })
        .to_string()
    }

    fn canned_refinement() -> String {
        serde_json::json!({
            "title": "Refined proposal",
            "description": "Narrowed scope with explicit safeguards."
        })
        .to_string()
    }
}

#[async_trait]
impl GenerativeCapability for MockProvider {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        for (pattern, behavior) in &self.scripts {
            if pattern.split('&').all(|part| prompt.contains(part)) {
                return match behavior {
                    MockBehavior::Respond(text) => Ok(text.clone()),
                    MockBehavior::Fail(err) => Err(err.clone()),
                    MockBehavior::Stall { secs } => {
                        tokio::time::sleep(Duration::from_secs(*secs)).await;
                        Err(ProviderError::Unavailable("stalled".into()))
                    }
                };
            }
        }
        if prompt.contains("refinement") {
            Ok(Self::canned_refinement())
        } else {
            Ok(Self::canned_vote())
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// --- External --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    text: String,
}

/// HTTP provider with capped exponential retry. 429 maps to `RateLimited`,
/// server and transport errors to `Unavailable`.
pub struct ExternalProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    retry_delay: Duration,
}

impl ExternalProvider {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(55))
            .build()
            .expect("reqwest client");
        Self { client, base_url, api_key, max_retries: 3, retry_delay: Duration::from_millis(500) }
    }
}

#[async_trait]
impl GenerativeCapability for ExternalProvider {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let url = format!("{}/generate", self.base_url.trim_end_matches('/'));
        let mut delay = self.retry_delay;

        for attempt in 1..=self.max_retries {
            let mut request = self.client.post(&url).json(&serde_json::json!({ "prompt": prompt }));
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }

            let outcome = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<CompletionResponse>()
                        .await
                        .map(|c| c.text)
                        .map_err(|e| ProviderError::Unavailable(format!("bad response body: {e}")));
                }
                Ok(response) if response.status().as_u16() == 429 => ProviderError::RateLimited,
                Ok(response) if response.status().is_server_error() => {
                    ProviderError::Unavailable(format!("http {}", response.status()))
                }
                Ok(response) => {
                    return Err(ProviderError::Unavailable(format!("http {}", response.status())))
                }
                Err(e) => ProviderError::Unavailable(e.to_string()),
            };

            if attempt < self.max_retries && outcome.retryable() {
                warn!(attempt, error = %outcome, "provider call failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            } else {
                return Err(outcome);
            }
        }
        Err(ProviderError::Unavailable("max retries exceeded".into()))
    }

    fn name(&self) -> &'static str {
        "external"
    }
}
