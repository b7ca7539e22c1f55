//! Configuration for the labvoice daemon.
//!
//! Loads settings from a TOML file or uses defaults, with `LABVOICE_*`
//! environment overrides and named presets. The backend catalog (model
//! names, sizes, setup hints, timeouts) lives here so the selector and the
//! status report share one source of truth.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// Ollama model tags per tier.
pub const MODEL_OLLAMA_TINY: &str = "tinyllama:1.1b";
pub const MODEL_OLLAMA_LIGHT: &str = "phi3:mini";
pub const MODEL_OLLAMA_FULL: &str = "llama3.2:3b";
/// GGUF model the disabled llama.cpp tier would use.
pub const MODEL_LLAMACPP: &str = "phi-3-mini-4k-instruct.Q4_K_M.gguf";

/// One NLU implementation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Classification,
    OllamaTiny,
    OllamaLight,
    OllamaFull,
    Llamacpp,
}

impl BackendKind {
    /// Every known backend, in catalog order.
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Classification,
        BackendKind::OllamaTiny,
        BackendKind::OllamaLight,
        BackendKind::OllamaFull,
        BackendKind::Llamacpp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Classification => "classification",
            BackendKind::OllamaTiny => "ollama-tiny",
            BackendKind::OllamaLight => "ollama-light",
            BackendKind::OllamaFull => "ollama-full",
            BackendKind::Llamacpp => "llamacpp",
        }
    }

    /// The Ollama model tag this tier serves, if it is model-backed.
    pub fn model(&self) -> Option<&'static str> {
        match self {
            BackendKind::Classification => None,
            BackendKind::OllamaTiny => Some(MODEL_OLLAMA_TINY),
            BackendKind::OllamaLight => Some(MODEL_OLLAMA_LIGHT),
            BackendKind::OllamaFull => Some(MODEL_OLLAMA_FULL),
            BackendKind::Llamacpp => Some(MODEL_LLAMACPP),
        }
    }

    /// Human-readable catalog entry.
    pub fn info(&self) -> BackendInfo {
        match self {
            BackendKind::Classification => BackendInfo {
                name: "Pattern Matching",
                size: "0 MB",
                description: "Ultra-fast keyword parsing, no model needed",
                setup_command: None,
                inference_timeout_ms: 500,
            },
            BackendKind::OllamaTiny => BackendInfo {
                name: "TinyLlama 1.1B",
                size: "637 MB",
                description: "Smallest model, good for basic commands",
                setup_command: Some("labvoice-setup tiny"),
                inference_timeout_ms: 1_000,
            },
            BackendKind::OllamaLight => BackendInfo {
                name: "Phi-3 Mini",
                size: "2.3 GB",
                description: "Balanced accuracy vs size",
                setup_command: Some("labvoice-setup light"),
                inference_timeout_ms: 1_000,
            },
            BackendKind::OllamaFull => BackendInfo {
                name: "Llama 3.2 3B",
                size: "2+ GB",
                description: "High accuracy for paraphrased commands",
                setup_command: Some("labvoice-setup full"),
                inference_timeout_ms: 2_000,
            },
            BackendKind::Llamacpp => BackendInfo {
                name: "llama.cpp GGUF",
                size: "variable",
                description: "Native binding, currently disabled",
                setup_command: Some("labvoice-setup llama-cpp"),
                inference_timeout_ms: 500,
            },
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "classification" => Ok(BackendKind::Classification),
            "ollama-tiny" => Ok(BackendKind::OllamaTiny),
            "ollama-light" => Ok(BackendKind::OllamaLight),
            "ollama-full" => Ok(BackendKind::OllamaFull),
            "llamacpp" => Ok(BackendKind::Llamacpp),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Catalog entry for one backend tier.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub name: &'static str,
    pub size: &'static str,
    pub description: &'static str,
    pub setup_command: Option<&'static str>,
    pub inference_timeout_ms: u64,
}

/// NLU selector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_preferred_backend")]
    pub preferred_backend: BackendKind,

    /// Latency above this triggers the degradation check.
    #[serde(default = "default_max_inference_time_ms")]
    pub max_inference_time_ms: u64,

    /// Run the canonical benchmark suite after backend activation.
    #[serde(default = "default_enable_benchmarking")]
    pub enable_benchmarking: bool,

    /// Tried in order after the preferred backend during initialization.
    #[serde(default = "default_fallback_order")]
    pub fallback_order: Vec<BackendKind>,

    /// Commands below this combined confidence are never auto-executed.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_preferred_backend() -> BackendKind {
    BackendKind::OllamaTiny
}

fn default_max_inference_time_ms() -> u64 {
    1_000
}

fn default_enable_benchmarking() -> bool {
    true
}

fn default_fallback_order() -> Vec<BackendKind> {
    vec![
        BackendKind::OllamaTiny,
        BackendKind::Classification,
        BackendKind::OllamaLight,
        BackendKind::OllamaFull,
        BackendKind::Llamacpp,
    ]
}

fn default_confidence_threshold() -> f64 {
    0.7
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            preferred_backend: default_preferred_backend(),
            max_inference_time_ms: default_max_inference_time_ms(),
            enable_benchmarking: default_enable_benchmarking(),
            fallback_order: default_fallback_order(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

/// SQLite configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file; `None` selects the per-user default path.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_foreign_keys")]
    pub foreign_keys: bool,

    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,

    #[serde(default = "default_synchronous")]
    pub synchronous: String,
}

fn default_foreign_keys() -> bool {
    true
}

fn default_journal_mode() -> String {
    "WAL".to_string()
}

fn default_synchronous() -> String {
    "NORMAL".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            foreign_keys: default_foreign_keys(),
            journal_mode: default_journal_mode(),
            synchronous: default_synchronous(),
        }
    }
}

/// Ollama runtime endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_endpoint")]
    pub endpoint: String,
}

fn default_ollama_endpoint() -> String {
    "http://127.0.0.1:11434".to_string()
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ollama_endpoint(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
}

impl Config {
    /// Named presets trading accuracy against footprint.
    pub fn preset(name: &str) -> Option<Config> {
        let mut config = Config::default();
        match name {
            "minimal" => {
                config.ai.preferred_backend = BackendKind::Classification;
                config.ai.enable_benchmarking = false;
            }
            "tiny" => {
                config.ai.preferred_backend = BackendKind::OllamaTiny;
            }
            "balanced" => {
                config.ai.preferred_backend = BackendKind::OllamaLight;
            }
            "performance" => {
                config.ai.preferred_backend = BackendKind::Llamacpp;
                config.ai.fallback_order = vec![
                    BackendKind::Llamacpp,
                    BackendKind::OllamaFull,
                    BackendKind::OllamaLight,
                    BackendKind::OllamaTiny,
                    BackendKind::Classification,
                ];
            }
            _ => return None,
        }
        Some(config)
    }

    /// Load from a TOML file if present, otherwise defaults; then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                let parsed: Config = toml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", p.display()))?;
                info!(path = %p.display(), "loaded configuration");
                parsed
            }
            Some(p) => {
                warn!(path = %p.display(), "config file not found, using defaults");
                Config::default()
            }
            None => Config::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// `LABVOICE_*` environment overrides, applied after file/preset.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(backend) = std::env::var("LABVOICE_BACKEND") {
            match backend.parse() {
                Ok(kind) => self.ai.preferred_backend = kind,
                Err(e) => warn!("LABVOICE_BACKEND ignored: {e}"),
            }
        }
        if let Ok(ms) = std::env::var("LABVOICE_MAX_INFERENCE_TIME") {
            match ms.parse() {
                Ok(ms) => self.ai.max_inference_time_ms = ms,
                Err(_) => warn!("LABVOICE_MAX_INFERENCE_TIME ignored: not a number"),
            }
        }
        if let Ok(flag) = std::env::var("LABVOICE_ENABLE_BENCHMARKING") {
            self.ai.enable_benchmarking = flag.eq_ignore_ascii_case("true");
        }
        if let Ok(endpoint) = std::env::var("LABVOICE_OLLAMA_ENDPOINT") {
            self.ollama.endpoint = endpoint;
        }
        if let Ok(path) = std::env::var("LABVOICE_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
    }

    /// Returns human-readable problems; empty when the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.ai.max_inference_time_ms < 100 || self.ai.max_inference_time_ms > 30_000 {
            errors.push(format!(
                "invalid max inference time: {}ms (must be 100-30000ms)",
                self.ai.max_inference_time_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.ai.confidence_threshold) {
            errors.push(format!(
                "invalid confidence threshold: {} (must be 0-1)",
                self.ai.confidence_threshold
            ));
        }
        if self.ai.fallback_order.is_empty() {
            errors.push("fallback order must not be empty".to_string());
        }
        if !self
            .ai
            .fallback_order
            .contains(&BackendKind::Classification)
        {
            errors.push("fallback order must include the classification backend".to_string());
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.ai.preferred_backend, BackendKind::OllamaTiny);
        assert_eq!(config.ai.fallback_order.len(), 5);
    }

    #[test]
    fn presets() {
        let minimal = Config::preset("minimal").unwrap();
        assert_eq!(minimal.ai.preferred_backend, BackendKind::Classification);
        assert!(!minimal.ai.enable_benchmarking);

        let performance = Config::preset("performance").unwrap();
        assert_eq!(performance.ai.preferred_backend, BackendKind::Llamacpp);
        assert_eq!(performance.ai.fallback_order[0], BackendKind::Llamacpp);

        assert!(Config::preset("nonsense").is_none());
    }

    #[test]
    fn backend_round_trip() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("gpt-5".parse::<BackendKind>().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let raw = r#"
            [ai]
            preferred_backend = "ollama-light"
            confidence_threshold = 0.8
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.ai.preferred_backend, BackendKind::OllamaLight);
        assert!((config.ai.confidence_threshold - 0.8).abs() < f64::EPSILON);
        // Unset fields fall back to defaults.
        assert_eq!(config.ai.max_inference_time_ms, 1_000);
    }

    #[test]
    fn load_reads_file_and_survives_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labvoice.toml");
        std::fs::write(
            &path,
            "[ai]\npreferred_backend = \"classification\"\n\n[ollama]\nendpoint = \"http://10.0.0.2:11434\"\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.ai.preferred_backend, BackendKind::Classification);
        assert_eq!(config.ollama.endpoint, "http://10.0.0.2:11434");

        let missing = Config::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(missing.ai.preferred_backend, BackendKind::OllamaTiny);
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = Config::default();
        config.ai.max_inference_time_ms = 10;
        config.ai.confidence_threshold = 1.5;
        config.ai.fallback_order = vec![BackendKind::OllamaTiny];
        let errors = config.validate();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn catalog_covers_all_backends() {
        for kind in BackendKind::ALL {
            let info = kind.info();
            assert!(!info.name.is_empty());
            assert!(info.inference_timeout_ms >= 500);
        }
        assert!(BackendKind::Classification.model().is_none());
        assert_eq!(BackendKind::OllamaTiny.model(), Some(MODEL_OLLAMA_TINY));
    }
}
