//! Ollama runtime client.
//!
//! A small trait over the three runtime operations the NLU layer needs
//! (inventory, generate, pull), with a blocking HTTP implementation and a
//! fake client for tests. Model-backed backends hold the client behind
//! `Arc<dyn OllamaApi>` so tests can inject scripted responses.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Errors from the model-serving runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OllamaError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("invalid runtime response: {0}")]
    InvalidResponse(String),

    #[error("runtime unreachable: {0}")]
    Unreachable(String),
}

/// One installed model as reported by the runtime inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

impl ModelEntry {
    /// Rounded size for status display, e.g. "2.3GB".
    pub fn size_display(&self) -> String {
        let gb = self.size as f64 / (1024.0 * 1024.0 * 1024.0);
        format!("{:.1}GB", (gb * 10.0).round() / 10.0)
    }
}

/// Sampling options for one generate call.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateOptions {
    pub temperature: f64,
    pub top_p: f64,
    /// Output token cap; command parses are short by construction.
    pub num_predict: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.9,
            num_predict: 100,
        }
    }
}

/// The runtime operations consumed by the NLU layer.
pub trait OllamaApi: Send + Sync {
    /// Inventory of installed models.
    fn list(&self) -> Result<Vec<ModelEntry>, OllamaError>;

    /// One non-streaming completion, bounded by `timeout`. Expiry is an
    /// `OllamaError::Timeout`, which callers treat as backend failure.
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
        timeout: Duration,
    ) -> Result<String, OllamaError>;

    /// Download a model. Setup-time only; never called on the request path.
    fn pull(&self, model: &str) -> Result<(), OllamaError>;
}

/// True when the inventory contains `tag`, matching on the base name so
/// "tinyllama:1.1b" is satisfied by any installed tinyllama variant.
pub fn model_available(models: &[ModelEntry], tag: &str) -> bool {
    let base = tag.split(':').next().unwrap_or(tag);
    models.iter().any(|m| m.name.starts_with(base))
}

/// Blocking HTTP client against a local Ollama endpoint.
pub struct HttpOllamaClient {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpOllamaClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, OllamaError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| OllamaError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    fn map_send_error(e: reqwest::Error, timeout_ms: u64) -> OllamaError {
        if e.is_timeout() {
            OllamaError::Timeout(timeout_ms)
        } else if e.is_connect() {
            OllamaError::Unreachable(e.to_string())
        } else {
            OllamaError::Http(e.to_string())
        }
    }
}

impl OllamaApi for HttpOllamaClient {
    fn list(&self) -> Result<Vec<ModelEntry>, OllamaError> {
        let url = format!("{}/api/tags", self.endpoint);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .map_err(|e| Self::map_send_error(e, 2_000))?;

        if !response.status().is_success() {
            return Err(OllamaError::Http(format!(
                "HTTP {} from inventory",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct Tags {
            #[serde(default)]
            models: Vec<ModelEntry>,
        }

        let tags: Tags = response
            .json()
            .map_err(|e| OllamaError::InvalidResponse(e.to_string()))?;
        Ok(tags.models)
    }

    fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
        timeout: Duration,
    ) -> Result<String, OllamaError> {
        let url = format!("{}/api/generate", self.endpoint);
        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": options,
        });

        debug!(model, timeout_ms = timeout.as_millis() as u64, "generate request");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .map_err(|e| Self::map_send_error(e, timeout.as_millis() as u64))?;

        if !response.status().is_success() {
            return Err(OllamaError::Http(format!(
                "HTTP {} from generate",
                response.status()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .map_err(|e| OllamaError::InvalidResponse(e.to_string()))?;

        json.get("response")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| OllamaError::InvalidResponse("missing response field".to_string()))
    }

    fn pull(&self, model: &str) -> Result<(), OllamaError> {
        let url = format!("{}/api/pull", self.endpoint);
        let body = serde_json::json!({ "name": model, "stream": false });

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(1800))
            .json(&body)
            .send()
            .map_err(|e| Self::map_send_error(e, 1_800_000))?;

        if !response.status().is_success() {
            return Err(OllamaError::Http(format!(
                "HTTP {} from pull",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Scripted runtime for tests: a fixed inventory and queued generate
/// responses (the last one repeats once the queue drains).
pub struct FakeOllamaClient {
    models: Vec<ModelEntry>,
    responses: Mutex<Vec<Result<String, OllamaError>>>,
    generate_calls: Mutex<usize>,
    list_error: Option<OllamaError>,
}

impl FakeOllamaClient {
    pub fn new(model_names: &[&str]) -> Self {
        Self {
            models: model_names
                .iter()
                .map(|n| ModelEntry {
                    name: n.to_string(),
                    size: 637 * 1024 * 1024,
                })
                .collect(),
            responses: Mutex::new(Vec::new()),
            generate_calls: Mutex::new(0),
            list_error: None,
        }
    }

    /// A runtime with no reachable endpoint at all.
    pub fn unreachable() -> Self {
        Self {
            models: Vec::new(),
            responses: Mutex::new(Vec::new()),
            generate_calls: Mutex::new(0),
            list_error: Some(OllamaError::Unreachable("connection refused".to_string())),
        }
    }

    pub fn with_responses(mut self, responses: Vec<Result<String, OllamaError>>) -> Self {
        self.responses = Mutex::new(responses);
        self
    }

    pub fn generate_calls(&self) -> usize {
        *self.generate_calls.lock().unwrap()
    }
}

impl OllamaApi for FakeOllamaClient {
    fn list(&self) -> Result<Vec<ModelEntry>, OllamaError> {
        match &self.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.models.clone()),
        }
    }

    fn generate(
        &self,
        _model: &str,
        _prompt: &str,
        _options: &GenerateOptions,
        _timeout: Duration,
    ) -> Result<String, OllamaError> {
        *self.generate_calls.lock().unwrap() += 1;

        let mut responses = self.responses.lock().unwrap();
        match responses.len() {
            0 => Err(OllamaError::InvalidResponse("no scripted response".to_string())),
            1 => responses[0].clone(),
            _ => responses.remove(0),
        }
    }

    fn pull(&self, _model: &str) -> Result<(), OllamaError> {
        Ok(())
    }
}
