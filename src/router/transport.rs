//! Backend transport.
//!
//! The single seam between the router and the outside world. The HTTP
//! implementation speaks two dialects: the local inference daemon's
//! `/api/generate` and the OpenAI-compatible chat-completions shape for
//! priced backends. Responses are returned whole; the router never
//! streams.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::types::{BackendProvider, BackendSpec};

/// One completed backend round trip. Token counts are reported when the
/// backend provides them; the router estimates the rest.
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub text: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn complete(
        &self,
        spec: &BackendSpec,
        prompt: &str,
        system_prompt: &str,
    ) -> Result<BackendReply>;
}

pub struct HttpTransport {
    http: Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
            api_key,
        }
    }

    async fn complete_local(
        &self,
        spec: &BackendSpec,
        prompt: &str,
        system_prompt: &str,
    ) -> Result<BackendReply> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": spec.model,
            "prompt": prompt,
            "system": system_prompt,
            "stream": false,
        });

        let resp = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(spec.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::model(&spec.id, format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::model(&spec.id, format!("{}: {}", status.as_u16(), text)).into());
        }

        let data: Value = resp
            .json()
            .await
            .context("failed to parse local backend response")?;

        Ok(BackendReply {
            text: data["response"].as_str().unwrap_or_default().to_string(),
            prompt_tokens: data["prompt_eval_count"].as_u64(),
            completion_tokens: data["eval_count"].as_u64(),
        })
    }

    async fn complete_priced(
        &self,
        spec: &BackendSpec,
        prompt: &str,
        system_prompt: &str,
    ) -> Result<BackendReply> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": spec.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": prompt },
            ],
            "stream": false,
        });

        let resp = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(spec.timeout_secs))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::model(&spec.id, format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::model(&spec.id, format!("{}: {}", status.as_u16(), text)).into());
        }

        let data: Value = resp
            .json()
            .await
            .context("failed to parse priced backend response")?;

        let text = data
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::model(&spec.id, "no completion choice returned"))?
            .to_string();

        Ok(BackendReply {
            text,
            prompt_tokens: data.pointer("/usage/prompt_tokens").and_then(Value::as_u64),
            completion_tokens: data
                .pointer("/usage/completion_tokens")
                .and_then(Value::as_u64),
        })
    }
}

#[async_trait]
impl BackendTransport for HttpTransport {
    async fn complete(
        &self,
        spec: &BackendSpec,
        prompt: &str,
        system_prompt: &str,
    ) -> Result<BackendReply> {
        match spec.provider {
            BackendProvider::Local => self.complete_local(spec, prompt, system_prompt).await,
            BackendProvider::Priced => self.complete_priced(spec, prompt, system_prompt).await,
        }
    }
}
