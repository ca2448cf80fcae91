//! LLM provider clients behind one trait.
//!
//! Providers only differ in endpoint shape; both take a single prompt and
//! return plain text. Responses are stored verbatim by the caller.
//! Failures are typed: rejected credentials and malformed response shapes
//! are permanent, everything network-ish is transient and retriable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::CoreError;
use crate::models::LlmProvider;

#[async_trait]
pub trait ExplanationBackend: Send + Sync {
    async fn explain(&self, prompt: &str) -> Result<String, CoreError>;
    fn name(&self) -> &'static str;
}

/// Shared status triage for both providers.
fn check_status(provider: &str, response: Response) -> Result<Response, CoreError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(CoreError::PermanentDependency(format!(
            "{provider} rejected credentials: {status}"
        )));
    }
    if !status.is_success() {
        return Err(CoreError::TransientDependency(format!(
            "{provider} returned {status}"
        )));
    }
    Ok(response)
}

pub struct GeminiBackend {
    http: Client,
    api_key: String,
    model: String,
}

#[async_trait]
impl ExplanationBackend for GeminiBackend {
    async fn explain(&self, prompt: &str) -> Result<String, CoreError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::TransientDependency(format!("gemini request failed: {e}")))?;
        let response = check_status("gemini", response)?;
        let value: Value = response.json().await.map_err(|e| {
            CoreError::PermanentDependency(format!("gemini response was not JSON: {e}"))
        })?;
        value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                CoreError::PermanentDependency("gemini response missing candidate text".into())
            })
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

pub struct OpenAiBackend {
    http: Client,
    api_key: String,
    model: String,
}

#[async_trait]
impl ExplanationBackend for OpenAiBackend {
    async fn explain(&self, prompt: &str) -> Result<String, CoreError> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.2,
        });
        let response = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::TransientDependency(format!("openai request failed: {e}")))?;
        let response = check_status("openai", response)?;
        let value: Value = response.json().await.map_err(|e| {
            CoreError::PermanentDependency(format!("openai response was not JSON: {e}"))
        })?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                CoreError::PermanentDependency("openai response missing message content".into())
            })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Build the configured backend. `none`, or a provider without an API key,
/// yields no backend: incidents then go straight to NOTIFIED unexplained.
pub fn backend_for(
    provider: LlmProvider,
    api_key: Option<&str>,
    attempt_timeout: Duration,
) -> Result<Option<Arc<dyn ExplanationBackend>>> {
    if provider == LlmProvider::None {
        return Ok(None);
    }
    let Some(api_key) = api_key else {
        warn!("LLM_API_KEY not set; enrichment disabled");
        return Ok(None);
    };

    let http = Client::builder()
        .timeout(attempt_timeout)
        .pool_max_idle_per_host(4)
        .user_agent("txwatch/0.1 (incident enrichment)")
        .build()
        .context("failed to build LLM HTTP client")?;

    let backend: Arc<dyn ExplanationBackend> = match provider {
        LlmProvider::Gemini => Arc::new(GeminiBackend {
            http,
            api_key: api_key.to_string(),
            model: "gemini-1.5-flash".to_string(),
        }),
        LlmProvider::Openai => Arc::new(OpenAiBackend {
            http,
            api_key: api_key.to_string(),
            model: "gpt-4o-mini".to_string(),
        }),
        LlmProvider::None => unreachable!(),
    };
    Ok(Some(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_and_keyless_configs_disable_enrichment() {
        let t = Duration::from_secs(15);
        assert!(backend_for(LlmProvider::None, Some("key"), t)
            .unwrap()
            .is_none());
        assert!(backend_for(LlmProvider::Gemini, None, t).unwrap().is_none());
        assert!(backend_for(LlmProvider::Gemini, Some("key"), t)
            .unwrap()
            .is_some());
        assert_eq!(
            backend_for(LlmProvider::Openai, Some("key"), t)
                .unwrap()
                .unwrap()
                .name(),
            "openai"
        );
    }
}
