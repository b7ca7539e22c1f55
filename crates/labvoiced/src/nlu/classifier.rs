//! Deterministic keyword classifier - the guaranteed NLU fallback.
//!
//! Zero dependencies on the model runtime: always constructible, always
//! available, lowest latency, lowest accuracy ceiling. Every other
//! backend's failure path degrades here.

use labvoice_common::numbers;
use labvoice_common::types::{Entities, Intent, NluResult};
use once_cell::sync::Lazy;
use regex::Regex;

/// Keyword sets per intent, scored by counting hits.
///
/// Enumeration order is the tie-break: verb-anchored intents come before
/// the noun-heavy `record`, so "change weight to 300 grams" (which
/// mentions weight nouns too) resolves to the explicit verb.
const INTENT_KEYWORDS: [(Intent, &[&str]); 5] = [
    (Intent::Update, &["change", "update", "set", "modify", "adjust", "weight to"]),
    (Intent::Move, &["move", "transfer", "relocate", "put", "place"]),
    (Intent::Query, &["show", "find", "what", "which", "around", "near"]),
    (Intent::System, &["stop", "start", "pause", "resume", "listen", "listening"]),
    (Intent::Record, &["weight", "gram", "weigh", "measure", "record", "log"]),
];

static WEIGHT_UNIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(?:grams?|g)\b").unwrap());
static WEIGHT_TO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"weight\s+(?:to\s+)?(\d+(?:\.\d+)?)").unwrap());

/// A keyword hits when it appears as a whole token (singular or plural),
/// or as a substring for multi-word phrases.
fn keyword_hit(keyword: &str, normalized: &str, words: &[&str]) -> bool {
    if keyword.contains(' ') {
        return normalized.contains(keyword);
    }
    words
        .iter()
        .any(|w| *w == keyword || w.strip_suffix('s') == Some(keyword))
}

#[derive(Debug, Clone, Default)]
pub struct ClassifierBackend;

impl ClassifierBackend {
    pub fn new() -> Self {
        Self
    }

    /// Classify normalized text into an intent, extract entities, and
    /// compute the heuristic confidence.
    pub fn classify(&self, text: &str) -> NluResult {
        let normalized = text.to_lowercase().trim().to_string();
        let words: Vec<&str> = normalized.split_whitespace().collect();

        // Strictly-highest keyword count wins; ties keep the first-seen
        // intent in INTENT_KEYWORDS order.
        let mut intent = Intent::Unknown;
        let mut max_score = 0usize;
        for (candidate, keywords) in INTENT_KEYWORDS {
            let score = keywords
                .iter()
                .filter(|kw| keyword_hit(kw, &normalized, &words))
                .count();
            if score > max_score {
                max_score = score;
                intent = candidate;
            }
        }

        let entities = extract_entities(intent, &normalized, &words);
        let confidence = confidence_for(intent, &entities, max_score, words.len());

        NluResult {
            intent,
            entities,
            confidence,
            processing_time_ms: None,
        }
    }
}

/// Anchor-keyword entity assignment. The number immediately after an
/// anchor wins; extracted-number positions are the fallback. Weight tries
/// explicit numeric+unit patterns before the magnitude heuristic (largest
/// extracted number above the ID range).
fn extract_entities(intent: Intent, normalized: &str, words: &[&str]) -> Entities {
    let mut entities = Entities::default();
    let all_numbers = numbers::extract_numbers(normalized);

    // The positional fallback only applies when the intent actually
    // operates on one rat. A query like "show rats around 250 grams"
    // mentions rats without naming one; grabbing the first number there
    // would turn the target weight into a rat id.
    let rat_is_operand = matches!(intent, Intent::Record | Intent::Update | Intent::Move);
    entities.rat = anchored_number(words, &["rat", "mouse", "animal", "mice"])
        .or_else(|| {
            if rat_is_operand {
                all_numbers.first().copied()
            } else {
                None
            }
        })
        .filter(|_| has_any(words, &["rat", "rats", "mouse", "mice", "animal", "animals"]))
        .map(|v| v as i64);

    entities.cage = anchored_number(words, &["cage"])
        .or_else(|| all_numbers.get(1).copied())
        .filter(|_| has_any(words, &["cage", "cages"]))
        .map(|v| v as i64);

    if ["weight", "gram", "weigh"].iter().any(|k| normalized.contains(k)) {
        entities.weight = WEIGHT_UNIT_RE
            .captures(normalized)
            .or_else(|| WEIGHT_TO_RE.captures(normalized))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .or_else(|| largest_weight_like(&all_numbers));
    }

    if normalized.contains("stop") || normalized.contains("pause") {
        entities.action = Some("stop".to_string());
    } else if ["start", "begin", "resume"].iter().any(|k| normalized.contains(k)) {
        entities.action = Some("start".to_string());
    }

    entities
}

fn has_any(words: &[&str], anchors: &[&str]) -> bool {
    words.iter().any(|w| anchors.contains(w))
}

/// The number token immediately following the first anchor word.
fn anchored_number(words: &[&str], anchors: &[&str]) -> Option<f64> {
    let idx = words
        .iter()
        .position(|w| anchors.iter().any(|a| w == a || w.strip_suffix('s') == Some(a)))?;
    numbers::parse_number(words.get(idx + 1)?)
}

/// Largest extracted number above 50 - the ID/weight disambiguator - else
/// the last number seen.
fn largest_weight_like(all_numbers: &[f64]) -> Option<f64> {
    all_numbers
        .iter()
        .copied()
        .filter(|n| *n > 50.0)
        .fold(None, |acc: Option<f64>, n| match acc {
            Some(best) if best >= n => Some(best),
            _ => Some(n),
        })
        .or_else(|| all_numbers.last().copied())
}

/// Base 0.5; +0.2 for a recognized intent; +0.1 per keyword hit capped at
/// +0.3; +0.1 per filled entity; -0.1 for very short or very long
/// utterances; clamped to [0.1, 1.0].
fn confidence_for(intent: Intent, entities: &Entities, keyword_score: usize, word_count: usize) -> f64 {
    let mut confidence = 0.5;
    if intent != Intent::Unknown {
        confidence += 0.2;
    }
    confidence += (keyword_score as f64 * 0.1).min(0.3);
    confidence += entities.filled_count() as f64 * 0.1;
    if word_count < 3 || word_count > 15 {
        confidence -= 0.1;
    }
    confidence.clamp(0.1, 1.0)
}
