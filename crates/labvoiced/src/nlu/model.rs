//! Model-backed NLU tiers.
//!
//! Each tier wraps the Ollama runtime with a fixed JSON-only prompt and
//! low sampling temperature. Response parsing is defensive: the first
//! well-formed JSON object in the raw output is used, and anything
//! unparseable degrades to the deterministic classifier on the same text.

use std::sync::Arc;
use std::time::Duration;

use labvoice_common::config::BackendKind;
use labvoice_common::numbers;
use labvoice_common::ollama::{model_available, GenerateOptions, OllamaApi};
use labvoice_common::types::{Entities, Intent, NluResult};
use tracing::{debug, warn};

use super::classifier::ClassifierBackend;
use super::{ModelInfo, NluError};

/// One Ollama-served tier.
#[derive(Clone)]
pub struct ModelBackend {
    kind: BackendKind,
    model: &'static str,
    client: Arc<dyn OllamaApi>,
    timeout: Duration,
    classifier: ClassifierBackend,
}

// The client is a trait object, so Debug is spelled out by hand.
impl std::fmt::Debug for ModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBackend")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ModelBackend {
    /// Construct a tier. The llama.cpp tier is permanently disabled (the
    /// native binding is crash-prone) and fails construction with the
    /// setup hint, exercising the same failover path as a missing model.
    pub fn new(kind: BackendKind, client: Arc<dyn OllamaApi>) -> Result<Self, NluError> {
        if kind == BackendKind::Llamacpp {
            return Err(NluError::Disabled(
                kind,
                "llama.cpp native binding is disabled; run `labvoice-setup llama-cpp` for manual setup"
                    .to_string(),
            ));
        }
        let model = kind.model().ok_or_else(|| {
            NluError::Unavailable(kind, "not a model-backed tier".to_string())
        })?;
        Ok(Self {
            kind,
            model,
            client,
            timeout: Duration::from_millis(kind.info().inference_timeout_ms),
            classifier: ClassifierBackend::new(),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Parse an utterance. Runtime/transport failures propagate (the
    /// selector handles them); malformed model output falls back to the
    /// classifier on the same text and never errors.
    pub fn parse(&self, text: &str) -> Result<NluResult, NluError> {
        let prompt = build_prompt(text);
        let options = GenerateOptions::default();

        let raw = self
            .client
            .generate(self.model, &prompt, &options, self.timeout)?;

        match parse_model_response(&raw) {
            Some(result) => Ok(result),
            None => {
                warn!(backend = %self.kind, "unparseable model output, using classifier");
                Ok(self.classifier.classify(text))
            }
        }
    }

    /// Availability means the tier's model is actually installed, not
    /// merely that the runtime answers.
    pub fn model_info(&self) -> ModelInfo {
        match self.client.list() {
            Ok(models) => {
                let entry = models.iter().find(|m| {
                    let base = self.model.split(':').next().unwrap_or(self.model);
                    m.name.starts_with(base)
                });
                ModelInfo {
                    available: model_available(&models, self.model),
                    model_name: self.model.to_string(),
                    approach: "ai-based",
                    size: entry.map(|e| e.size_display()),
                }
            }
            Err(e) => {
                debug!(backend = %self.kind, "inventory query failed: {e}");
                ModelInfo {
                    available: false,
                    model_name: self.model.to_string(),
                    approach: "ai-based",
                    size: None,
                }
            }
        }
    }
}

/// Minimal JSON-only prompt; commands are at most ~15 words, so the
/// interaction stays short.
fn build_prompt(text: &str) -> String {
    format!(
        r#"Parse lab command to JSON:
"{text}"

Return ONLY: {{"intent":"record|update|move|query|system","entities":{{"rat":5,"cage":3,"weight":280}}}}

Intents:
record: rat X cage Y weight Z
update: change weight to Z
move: move rat X to cage Y
query: show rats around Z
system: stop/start

JSON:"#
    )
}

/// The first balanced JSON object substring, tolerant of leading and
/// trailing prose around it.
fn first_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Numeric entity from model JSON: plain numbers, digit strings, or
/// number words all count.
fn entity_number(value: Option<&serde_json::Value>) -> Option<f64> {
    let value = value?;
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    value.as_str().and_then(numbers::parse_number)
}

/// Map a raw model response to an NLU result, or `None` when no
/// well-formed JSON object can be recovered.
fn parse_model_response(raw: &str) -> Option<NluResult> {
    let json: serde_json::Value = serde_json::from_str(first_json_object(raw)?).ok()?;

    let intent = match json.get("intent").and_then(|v| v.as_str()) {
        Some("record") => Intent::Record,
        Some("update") => Intent::Update,
        Some("move") => Intent::Move,
        Some("query") => Intent::Query,
        Some("system") => Intent::System,
        _ => Intent::Unknown,
    };

    let empty = serde_json::Value::Null;
    let entities_json = json.get("entities").unwrap_or(&empty);
    let entities = Entities {
        rat: entity_number(entities_json.get("rat")).map(|v| v as i64),
        cage: entity_number(entities_json.get("cage")).map(|v| v as i64),
        weight: entity_number(entities_json.get("weight")),
        action: entities_json
            .get("action")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        group: entities_json
            .get("group")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    };

    let confidence = json
        .get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.9)
        .clamp(0.0, 1.0);

    Some(NluResult {
        intent,
        entities,
        confidence,
        processing_time_ms: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use labvoice_common::config::MODEL_OLLAMA_TINY;
    use labvoice_common::ollama::FakeOllamaClient;

    fn tiny_backend(fake: FakeOllamaClient) -> ModelBackend {
        ModelBackend::new(BackendKind::OllamaTiny, Arc::new(fake)).unwrap()
    }

    #[test]
    fn llamacpp_tier_is_disabled() {
        let client = Arc::new(FakeOllamaClient::new(&[]));
        let err = ModelBackend::new(BackendKind::Llamacpp, client).unwrap_err();
        assert!(matches!(err, NluError::Disabled(BackendKind::Llamacpp, _)));
        assert!(err.to_string().contains("labvoice-setup"));
    }

    #[test]
    fn parses_clean_json_response() {
        let fake = FakeOllamaClient::new(&[MODEL_OLLAMA_TINY]).with_responses(vec![Ok(
            r#"{"intent":"record","entities":{"rat":5,"cage":3,"weight":280}}"#.to_string(),
        )]);
        let result = tiny_backend(fake).parse("rat 5 cage 3 weight 280 grams").unwrap();
        assert_eq!(result.intent, Intent::Record);
        assert_eq!(result.entities.rat, Some(5));
        assert_eq!(result.entities.weight, Some(280.0));
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn recovers_json_from_surrounding_prose() {
        let raw = r#"Sure! Here is the parse:
{"intent":"move","entities":{"rat":7,"cage":12}}
Hope that helps."#;
        let fake = FakeOllamaClient::new(&[MODEL_OLLAMA_TINY])
            .with_responses(vec![Ok(raw.to_string())]);
        let result = tiny_backend(fake).parse("move rat 7 to cage 12").unwrap();
        assert_eq!(result.intent, Intent::Move);
        assert_eq!(result.entities.cage, Some(12));
    }

    #[test]
    fn nested_object_extraction_is_balanced() {
        let raw = r#"{"intent":"update","entities":{"weight":300}} trailing"#;
        assert_eq!(
            first_json_object(raw),
            Some(r#"{"intent":"update","entities":{"weight":300}}"#)
        );
        assert_eq!(first_json_object("no json here"), None);
        // Braces inside strings do not unbalance the scan.
        let tricky = r#"{"note":"a } inside","entities":{}}"#;
        assert_eq!(first_json_object(tricky), Some(tricky));
    }

    #[test]
    fn garbage_output_falls_back_to_classifier() {
        let fake = FakeOllamaClient::new(&[MODEL_OLLAMA_TINY])
            .with_responses(vec![Ok("I could not understand that at all".to_string())]);
        let result = tiny_backend(fake).parse("rat 5 cage 3 weight 280 grams").unwrap();
        // Classifier result on the same input text.
        assert_eq!(result.intent, Intent::Record);
        assert_eq!(result.entities.weight, Some(280.0));
    }

    #[test]
    fn word_number_entities_are_parsed() {
        let raw = r#"{"intent":"record","entities":{"rat":"five","weight":"two-eighty"}}"#;
        let result = parse_model_response(raw).unwrap();
        assert_eq!(result.entities.rat, Some(5));
        assert_eq!(result.entities.weight, Some(280.0));
    }

    #[test]
    fn availability_requires_installed_model() {
        let present = tiny_backend(FakeOllamaClient::new(&[MODEL_OLLAMA_TINY]));
        assert!(present.model_info().available);

        // Runtime reachable but the tier's model is missing.
        let missing = tiny_backend(FakeOllamaClient::new(&["some-other-model:7b"]));
        assert!(!missing.model_info().available);

        let down = tiny_backend(FakeOllamaClient::unreachable());
        assert!(!down.model_info().available);
    }

    #[test]
    fn transport_errors_propagate() {
        use labvoice_common::ollama::OllamaError;
        let fake = FakeOllamaClient::new(&[MODEL_OLLAMA_TINY])
            .with_responses(vec![Err(OllamaError::Timeout(1000))]);
        let err = tiny_backend(fake).parse("rat 5 cage 3 weight 280 grams").unwrap_err();
        assert!(matches!(err, NluError::Runtime(_)));
    }
}
