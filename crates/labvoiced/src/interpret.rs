//! Interpretation: NLU results become executable commands.
//!
//! Combines backend and transcription confidence, applies the session
//! context to implicit references, and carries the legacy fixed-pattern
//! parser used when the adaptive selector fails outright.

use labvoice_common::types::{
    Command, CommandKind, Entities, Intent, NluResult, SessionContext, TranscriptionResult,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Threshold below which a command must be confirmed before execution.
pub const CONFIRMATION_THRESHOLD: f64 = 0.8;

/// Context substitution raises confidence by this much, capped at 1.0.
const CONTEXT_BOOST: f64 = 0.1;

/// Map a backend result onto an executable command. Combined confidence
/// is the product of backend and transcription confidence; `Unknown`
/// intents become low-confidence system commands so they still reach the
/// confirmation path instead of vanishing.
pub fn to_command(nlu: &NluResult, transcription: &TranscriptionResult) -> Command {
    let kind = match nlu.intent {
        Intent::Record => CommandKind::Record,
        Intent::Update => CommandKind::Update,
        Intent::Move => CommandKind::Move,
        Intent::Query => CommandKind::Query,
        Intent::System | Intent::Unknown => CommandKind::System,
    };

    let confidence = (nlu.confidence * transcription.confidence).clamp(0.0, 1.0);

    Command {
        kind,
        confidence,
        entities: nlu.entities.clone(),
        needs_confirmation: confidence < CONFIRMATION_THRESHOLD,
        context_used: false,
        raw_text: transcription.text.clone(),
    }
}

/// Fill implicit references from the session context.
///
/// `update` without a rat takes the last-mentioned rat and drops the
/// confirmation requirement (the operator just weighed that animal, a
/// correction right after is the expected flow). `move` without a rat
/// fills the slot but keeps whatever confirmation state the confidence
/// gate chose. Any substitution adds the boost.
pub fn apply_context(command: &mut Command, context: Option<&SessionContext>) {
    let Some(ctx) = context else { return };

    match command.kind {
        CommandKind::Update if command.entities.rat.is_none() => {
            if let Some(rat) = ctx.last_rat {
                command.entities.rat = Some(rat);
                command.context_used = true;
                command.needs_confirmation = false;
                debug!(rat, "context fill: update target");
            }
        }
        CommandKind::Move if command.entities.rat.is_none() => {
            if let Some(rat) = ctx.last_rat {
                command.entities.rat = Some(rat);
                command.context_used = true;
                debug!(rat, "context fill: move target");
            }
        }
        _ => {}
    }

    if command.context_used {
        command.confidence = (command.confidence + CONTEXT_BOOST).min(1.0);
    }
}

// Legacy fixed-pattern parser. Rigid phrasings only, no context merge;
// kept as the last-resort path when the selector itself errors.

static RECORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:rat|mouse)\s+(\d+)\s+cage\s+(\d+)\s+weight\s+(\d+(?:\.\d+)?)\s*(?:grams?|g)?")
        .unwrap()
});
static UPDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:change|update|set)\s+weight\s+to\s+(\d+(?:\.\d+)?)\s*(?:grams?|g)?").unwrap()
});
static MOVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"move\s+(?:rat|mouse)\s+(\d+)\s+to\s+cage\s+(\d+)").unwrap());
static QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:what|show|find)\s+(?:rats?|mice)\s+(?:are\s+)?around\s+(\d+(?:\.\d+)?)\s*(?:grams?|g)?")
        .unwrap()
});
static STOP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:stop|pause|end)\s+(?:listening|recording|session)").unwrap());
static START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:start|begin|resume)\s+(?:listening|recording|session)").unwrap());
static LAST_READING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:repeat|show)\s+(?:the\s+)?last\s+reading").unwrap());
static STATUS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:what|show)\s+(?:is\s+)?(?:the\s+)?(?:current\s+)?status").unwrap());

fn capture_i64(caps: &regex::Captures<'_>, idx: usize) -> Option<i64> {
    caps.get(idx)?.as_str().parse().ok()
}

fn capture_f64(caps: &regex::Captures<'_>, idx: usize) -> Option<f64> {
    caps.get(idx)?.as_str().parse().ok()
}

/// Fixed-pattern fallback parse. Each recognized shape carries a fixed
/// base confidence, scaled by transcription confidence; unmatched text
/// becomes a half-confidence system command that always confirms.
pub fn legacy_parse(transcription: &TranscriptionResult) -> Command {
    let text = transcription.text.to_lowercase();
    let text = text.trim();

    let (kind, entities, base) = if let Some(caps) = RECORD_RE.captures(text) {
        (
            CommandKind::Record,
            Entities {
                rat: capture_i64(&caps, 1),
                cage: capture_i64(&caps, 2),
                weight: capture_f64(&caps, 3),
                ..Entities::default()
            },
            0.95,
        )
    } else if let Some(caps) = UPDATE_RE.captures(text) {
        (
            CommandKind::Update,
            Entities {
                weight: capture_f64(&caps, 1),
                ..Entities::default()
            },
            0.9,
        )
    } else if let Some(caps) = MOVE_RE.captures(text) {
        (
            CommandKind::Move,
            Entities {
                rat: capture_i64(&caps, 1),
                cage: capture_i64(&caps, 2),
                ..Entities::default()
            },
            0.95,
        )
    } else if let Some(caps) = QUERY_RE.captures(text) {
        (
            CommandKind::Query,
            Entities {
                weight: capture_f64(&caps, 1),
                ..Entities::default()
            },
            0.85,
        )
    } else if STOP_RE.is_match(text) {
        (
            CommandKind::System,
            Entities {
                action: Some("stop".to_string()),
                ..Entities::default()
            },
            0.9,
        )
    } else if START_RE.is_match(text) {
        (
            CommandKind::System,
            Entities {
                action: Some("start".to_string()),
                ..Entities::default()
            },
            0.9,
        )
    } else if LAST_READING_RE.is_match(text) {
        (
            CommandKind::Query,
            Entities {
                action: Some("lastreading".to_string()),
                ..Entities::default()
            },
            0.8,
        )
    } else if STATUS_RE.is_match(text) {
        (
            CommandKind::Query,
            Entities {
                action: Some("currentstatus".to_string()),
                ..Entities::default()
            },
            0.8,
        )
    } else {
        let confidence = (transcription.confidence * 0.5).clamp(0.0, 1.0);
        return Command {
            kind: CommandKind::System,
            confidence,
            entities: Entities::default(),
            needs_confirmation: true,
            context_used: false,
            raw_text: transcription.text.clone(),
        };
    };

    let confidence = (base * transcription.confidence).clamp(0.0, 1.0);
    Command {
        kind,
        confidence,
        entities,
        needs_confirmation: confidence < CONFIRMATION_THRESHOLD,
        context_used: false,
        raw_text: transcription.text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn nlu(intent: Intent, confidence: f64, entities: Entities) -> NluResult {
        NluResult {
            intent,
            entities,
            confidence,
            processing_time_ms: None,
        }
    }

    fn ctx(last_rat: Option<i64>) -> SessionContext {
        SessionContext {
            session_id: 1,
            last_rat,
            last_cage: Some(3),
            last_weight: Some(280.0),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn confidence_is_product_of_backend_and_transcription() {
        let t = TranscriptionResult::new("rat 5 cage 3 weight 280 grams", 0.9);
        let cmd = to_command(&nlu(Intent::Record, 0.8, Entities::default()), &t);
        assert!((cmd.confidence - 0.72).abs() < 1e-9);
        assert!(cmd.needs_confirmation);
    }

    #[test]
    fn high_confidence_needs_no_confirmation() {
        let t = TranscriptionResult::new("rat 5 cage 3 weight 280 grams", 1.0);
        let cmd = to_command(&nlu(Intent::Record, 0.95, Entities::default()), &t);
        assert!(!cmd.needs_confirmation);
    }

    #[test]
    fn unknown_intent_becomes_system_command() {
        let t = TranscriptionResult::new("the quick brown fox", 0.9);
        let cmd = to_command(&nlu(Intent::Unknown, 0.5, Entities::default()), &t);
        assert_eq!(cmd.kind, CommandKind::System);
    }

    #[test]
    fn update_without_rat_takes_context_and_skips_confirmation() {
        let t = TranscriptionResult::new("change weight to 300 grams", 0.8);
        let mut cmd = to_command(
            &nlu(
                Intent::Update,
                0.9,
                Entities {
                    weight: Some(300.0),
                    ..Entities::default()
                },
            ),
            &t,
        );
        let before = cmd.confidence;
        assert!(cmd.needs_confirmation);

        apply_context(&mut cmd, Some(&ctx(Some(5))));
        assert_eq!(cmd.entities.rat, Some(5));
        assert!(cmd.context_used);
        assert!(!cmd.needs_confirmation);
        assert!((cmd.confidence - (before + 0.1)).abs() < 1e-9);
    }

    #[test]
    fn move_fill_keeps_confirmation_state() {
        let t = TranscriptionResult::new("move to cage 12", 0.7);
        let mut cmd = to_command(
            &nlu(
                Intent::Move,
                0.9,
                Entities {
                    cage: Some(12),
                    ..Entities::default()
                },
            ),
            &t,
        );
        assert!(cmd.needs_confirmation);
        apply_context(&mut cmd, Some(&ctx(Some(7))));
        assert_eq!(cmd.entities.rat, Some(7));
        assert!(cmd.context_used);
        // The move fill does not waive confirmation.
        assert!(cmd.needs_confirmation);
    }

    #[test]
    fn context_boost_caps_at_one() {
        let t = TranscriptionResult::new("change weight to 300", 1.0);
        let mut cmd = to_command(
            &nlu(
                Intent::Update,
                0.98,
                Entities {
                    weight: Some(300.0),
                    ..Entities::default()
                },
            ),
            &t,
        );
        apply_context(&mut cmd, Some(&ctx(Some(5))));
        assert!(cmd.confidence <= 1.0);
        assert!((cmd.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn no_context_means_no_substitution() {
        let t = TranscriptionResult::new("change weight to 300", 0.9);
        let mut cmd = to_command(
            &nlu(
                Intent::Update,
                0.9,
                Entities {
                    weight: Some(300.0),
                    ..Entities::default()
                },
            ),
            &t,
        );
        apply_context(&mut cmd, None);
        assert_eq!(cmd.entities.rat, None);
        assert!(!cmd.context_used);
    }

    #[test]
    fn explicit_rat_is_never_overwritten() {
        let t = TranscriptionResult::new("move rat 9 to cage 2", 1.0);
        let mut cmd = to_command(
            &nlu(
                Intent::Move,
                0.95,
                Entities {
                    rat: Some(9),
                    cage: Some(2),
                    ..Entities::default()
                },
            ),
            &t,
        );
        apply_context(&mut cmd, Some(&ctx(Some(5))));
        assert_eq!(cmd.entities.rat, Some(9));
        assert!(!cmd.context_used);
    }

    #[test]
    fn legacy_record_pattern() {
        let t = TranscriptionResult::new("rat 5 cage 3 weight 280 grams", 1.0);
        let cmd = legacy_parse(&t);
        assert_eq!(cmd.kind, CommandKind::Record);
        assert_eq!(cmd.entities.rat, Some(5));
        assert_eq!(cmd.entities.cage, Some(3));
        assert_eq!(cmd.entities.weight, Some(280.0));
        assert!((cmd.confidence - 0.95).abs() < 1e-9);
        assert!(!cmd.needs_confirmation);
    }

    #[test]
    fn legacy_update_and_move_patterns() {
        let upd = legacy_parse(&TranscriptionResult::new("change weight to 300 grams", 1.0));
        assert_eq!(upd.kind, CommandKind::Update);
        assert_eq!(upd.entities.weight, Some(300.0));

        let mv = legacy_parse(&TranscriptionResult::new("move rat 7 to cage 12", 1.0));
        assert_eq!(mv.kind, CommandKind::Move);
        assert_eq!(mv.entities.rat, Some(7));
        assert_eq!(mv.entities.cage, Some(12));
    }

    #[test]
    fn legacy_query_and_system_patterns() {
        let q = legacy_parse(&TranscriptionResult::new("show rats around 250 grams", 1.0));
        assert_eq!(q.kind, CommandKind::Query);
        assert_eq!(q.entities.weight, Some(250.0));

        let stop = legacy_parse(&TranscriptionResult::new("stop listening", 1.0));
        assert_eq!(stop.kind, CommandKind::System);
        assert_eq!(stop.entities.action.as_deref(), Some("stop"));

        let start = legacy_parse(&TranscriptionResult::new("resume recording", 1.0));
        assert_eq!(start.entities.action.as_deref(), Some("start"));
    }

    #[test]
    fn legacy_context_queries() {
        let last = legacy_parse(&TranscriptionResult::new("repeat the last reading", 1.0));
        assert_eq!(last.kind, CommandKind::Query);
        assert_eq!(last.entities.action.as_deref(), Some("lastreading"));

        let status = legacy_parse(&TranscriptionResult::new("what is the current status", 1.0));
        assert_eq!(status.entities.action.as_deref(), Some("currentstatus"));
    }

    #[test]
    fn legacy_unmatched_text_confirms_at_half_confidence() {
        let t = TranscriptionResult::new("the quick brown fox", 0.9);
        let cmd = legacy_parse(&t);
        assert_eq!(cmd.kind, CommandKind::System);
        assert!((cmd.confidence - 0.45).abs() < 1e-9);
        assert!(cmd.needs_confirmation);
    }

    #[test]
    fn legacy_scales_by_transcription_confidence() {
        let t = TranscriptionResult::new("rat 5 cage 3 weight 280 grams", 0.7);
        let cmd = legacy_parse(&t);
        assert!((cmd.confidence - 0.665).abs() < 1e-9);
        assert!(cmd.needs_confirmation);
    }
}
