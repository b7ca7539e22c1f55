//! The NLU layer: a closed set of backend tiers behind one capability
//! surface, orchestrated by the adaptive selector.

pub mod adaptive;
pub mod classifier;
pub mod model;

pub use adaptive::{AdaptiveNlu, PerfStats, SystemStatus};
pub use classifier::ClassifierBackend;
pub use model::ModelBackend;

use labvoice_common::config::BackendKind;
use labvoice_common::ollama::OllamaError;
use labvoice_common::types::NluResult;
use serde::Serialize;

/// NLU-layer failures. Everything except `Classifier` is recoverable:
/// the selector degrades to the deterministic classifier.
#[derive(Debug, thiserror::Error)]
pub enum NluError {
    #[error("backend {0} unavailable: {1}")]
    Unavailable(BackendKind, String),

    #[error("backend {0} disabled: {1}")]
    Disabled(BackendKind, String),

    #[error("model runtime error: {0}")]
    Runtime(#[from] OllamaError),

    /// Logic-error signal; the classifier has no failure modes in the
    /// steady state, so this should never be observed.
    #[error("classifier backend failed: {0}")]
    Classifier(String),
}

/// Availability and identity of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub available: bool,
    pub model_name: String,
    pub approach: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Tagged-enum dispatch over the backend tiers.
#[derive(Clone)]
pub enum NluBackend {
    Classifier(ClassifierBackend),
    Model(ModelBackend),
}

impl NluBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            NluBackend::Classifier(_) => BackendKind::Classification,
            NluBackend::Model(m) => m.kind(),
        }
    }

    pub fn parse(&self, text: &str) -> Result<NluResult, NluError> {
        match self {
            NluBackend::Classifier(c) => Ok(c.classify(text)),
            NluBackend::Model(m) => m.parse(text),
        }
    }

    pub fn model_info(&self) -> ModelInfo {
        match self {
            NluBackend::Classifier(_) => ModelInfo {
                available: true,
                model_name: "classification".to_string(),
                approach: "keyword-based",
                size: Some("<1MB".to_string()),
            },
            NluBackend::Model(m) => m.model_info(),
        }
    }
}
