//! Completion backends and the backend registry.
//!
//! Each provider is one `CompletionBackend` implementation behind a single
//! `complete(prompt, options)` call; orchestration code never branches on
//! provider names. The registry owns the configured providers (stable
//! ordering for the UI) and the active `(provider, model)` pointer, which is
//! swapped atomically — an in-flight pipeline run keeps the backend it
//! captured at its start.

use crate::error::{InsightError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Knobs forwarded to the provider with each completion call.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.0,
        }
    }
}

impl CompletionOptions {
    pub fn short() -> Self {
        Self {
            max_tokens: 300,
            ..Self::default()
        }
    }
}

/// A text-completion provider. Transport failures, rate limits, and empty
/// responses all surface as `Completion` errors; retry decisions belong to
/// the caller.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String>;
}

/// Anthropic messages API.
pub struct AnthropicBackend {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: "https://api.anthropic.com/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": model,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "system": system_prompt,
            "messages": [
                {"role": "user", "content": prompt}
            ]
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| InsightError::Completion(format!("anthropic call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| InsightError::Completion(format!("bad anthropic response: {}", e)))?;

        if !status.is_success() {
            return Err(InsightError::Completion(format!(
                "anthropic returned {}: {}",
                status, response_json
            )));
        }

        let content = response_json["content"][0]["text"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                InsightError::Completion("empty completion from anthropic".to_string())
            })?;
        Ok(content)
    }
}

/// Groq's OpenAI-compatible chat completions API.
pub struct GroqBackend {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GroqBackend {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: "https://api.groq.com/openai/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionBackend for GroqBackend {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": model,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": prompt}
            ]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| InsightError::Completion(format!("groq call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| InsightError::Completion(format!("bad groq response: {}", e)))?;

        if !status.is_success() {
            return Err(InsightError::Completion(format!(
                "groq returned {}: {}",
                status, response_json
            )));
        }

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| InsightError::Completion("empty completion from groq".to_string()))?;
        Ok(content)
    }
}

/// The backend a pipeline run executes against, captured once at run start.
#[derive(Clone)]
pub struct ActiveBackend {
    pub provider: String,
    pub model: String,
    pub backend: Arc<dyn CompletionBackend>,
}

impl ActiveBackend {
    pub async fn complete(
        &self,
        system_prompt: &str,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String> {
        self.backend
            .complete(&self.model, system_prompt, prompt, options)
            .await
    }
}

struct Provider {
    name: String,
    models: Vec<String>,
    backend: Arc<dyn CompletionBackend>,
}

/// Configured providers plus the active `(provider, model)` pointer.
pub struct BackendRegistry {
    providers: Vec<Provider>,
    active: RwLock<Option<ActiveBackend>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendListing {
    pub provider: String,
    pub models: Vec<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            active: RwLock::new(None),
        }
    }

    /// Add or replace a provider. The first registered provider's first model
    /// becomes the default active backend.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn CompletionBackend>,
        models: Vec<String>,
    ) {
        let name = name.into();
        if let Some(existing) = self.providers.iter_mut().find(|p| p.name == name) {
            existing.models = models;
            existing.backend = backend;
            return;
        }
        self.providers.push(Provider {
            name: name.clone(),
            models: models.clone(),
            backend: Arc::clone(&backend),
        });

        let mut active = self.active.write().unwrap();
        if active.is_none() {
            if let Some(model) = models.first() {
                *active = Some(ActiveBackend {
                    provider: name,
                    model: model.clone(),
                    backend,
                });
            }
        }
    }

    /// Registration-ordered provider/model listing.
    pub fn list_available(&self) -> Vec<BackendListing> {
        self.providers
            .iter()
            .map(|p| BackendListing {
                provider: p.name.clone(),
                models: p.models.clone(),
            })
            .collect()
    }

    /// Atomically swap the active backend pointer.
    pub fn set_active(&self, provider: &str, model: &str) -> Result<()> {
        let entry = self
            .providers
            .iter()
            .find(|p| p.name == provider)
            .ok_or_else(|| InsightError::NotFound(format!("unknown provider: {}", provider)))?;
        if !entry.models.iter().any(|m| m == model) {
            return Err(InsightError::NotFound(format!(
                "unknown model for {}: {}",
                provider, model
            )));
        }
        *self.active.write().unwrap() = Some(ActiveBackend {
            provider: provider.to_string(),
            model: model.to_string(),
            backend: Arc::clone(&entry.backend),
        });
        Ok(())
    }

    /// Snapshot of the active backend for one pipeline run.
    pub fn active(&self) -> Result<ActiveBackend> {
        self.active
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| InsightError::NotFound("no completion backend configured".to_string()))
    }

    /// Resolve an explicit backend request. A named provider must exist; a
    /// named provider without a model gets that provider's first model. With
    /// no provider named, the active backend is used.
    pub fn resolve(&self, provider: Option<&str>, model: Option<&str>) -> Result<ActiveBackend> {
        let Some(p) = provider else {
            return self.active();
        };
        let entry = self
            .providers
            .iter()
            .find(|e| e.name == p)
            .ok_or_else(|| InsightError::NotFound(format!("unknown provider: {}", p)))?;
        let model = match model {
            Some(m) => {
                if !entry.models.iter().any(|known| known == m) {
                    return Err(InsightError::NotFound(format!(
                        "unknown model for {}: {}",
                        p, m
                    )));
                }
                m.to_string()
            }
            None => entry.models.first().cloned().ok_or_else(|| {
                InsightError::NotFound(format!("provider {} has no models", p))
            })?,
        };
        Ok(ActiveBackend {
            provider: p.to_string(),
            model,
            backend: Arc::clone(&entry.backend),
        })
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
