//! Shared domain types for the labvoice pipeline.
//!
//! One utterance flows transcription -> NLU result -> command -> result;
//! these are the shapes exchanged between the speech collaborator, the NLU
//! backends, the interpreter and the executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Finished transcription handed over by the speech engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    /// Engine confidence in [0, 1].
    pub confidence: f64,
    pub processing_time_ms: u64,
}

impl TranscriptionResult {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence,
            processing_time_ms: 0,
        }
    }
}

/// The five recognized command categories, plus `Unknown` for text no
/// backend could classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Record,
    Update,
    Move,
    Query,
    System,
    Unknown,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Intent::Record => "record",
            Intent::Update => "update",
            Intent::Move => "move",
            Intent::Query => "query",
            Intent::System => "system",
            Intent::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Typed slots extracted from an utterance. Absence means "not spoken",
/// never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cage: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Entities {
    /// Number of filled slots, used by the classifier confidence formula.
    pub fn filled_count(&self) -> usize {
        let mut n = 0;
        if self.rat.is_some() {
            n += 1;
        }
        if self.cage.is_some() {
            n += 1;
        }
        if self.weight.is_some() {
            n += 1;
        }
        if self.action.is_some() {
            n += 1;
        }
        if self.group.is_some() {
            n += 1;
        }
        n
    }
}

/// Raw result produced by one NLU backend, before interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NluResult {
    pub intent: Intent,
    pub entities: Entities,
    /// Backend confidence in [0, 1].
    pub confidence: f64,
    /// Filled in by timed backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

/// Executable command categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Record,
    Update,
    Move,
    Query,
    System,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandKind::Record => "record",
            CommandKind::Update => "update",
            CommandKind::Move => "move",
            CommandKind::Query => "query",
            CommandKind::System => "system",
        };
        f.write_str(s)
    }
}

/// Interpreted command ready for the confidence gate and executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    /// Combined confidence: backend confidence x transcription confidence,
    /// plus the context-substitution boost, always in [0, 1].
    pub confidence: f64,
    pub entities: Entities,
    pub needs_confirmation: bool,
    pub context_used: bool,
    pub raw_text: String,
}

/// Terminal outcome of one processed utterance. Returned to the caller,
/// never persisted (the audit trail stores the command, not this).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub needs_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_prompt: Option<String>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            needs_confirmation: false,
            confirmation_prompt: None,
        }
    }

    pub fn ok_with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok(message)
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            needs_confirmation: false,
            confirmation_prompt: None,
        }
    }

    pub fn confirmation(message: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            needs_confirmation: true,
            confirmation_prompt: Some(prompt.into()),
        }
    }
}

/// Last-mentioned values within the active session, used for implicit
/// references ("change weight to 300" -> which rat?).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: i64,
    pub last_rat: Option<i64>,
    pub last_cage: Option<i64>,
    pub last_weight: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Partial context update; `None` fields keep their stored value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextUpdate {
    pub last_rat: Option<i64>,
    pub last_cage: Option<i64>,
    pub last_weight: Option<f64>,
}

// Storage rows.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Animal {
    pub id: i64,
    pub number: i64,
    pub current_cage: Option<i64>,
    pub current_weight: Option<f64>,
    pub group_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cage {
    pub id: i64,
    pub number: i64,
    pub group_name: Option<String>,
    pub capacity: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub id: i64,
    pub animal_id: i64,
    pub weight: f64,
    pub cage_id: i64,
    pub timestamp: DateTime<Utc>,
    pub notes: Option<String>,
    pub session_id: i64,
}

/// One audited command from the history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub raw_text: String,
    pub parsed_command: Option<String>,
    pub confidence: f64,
    pub executed: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entities_filled_count() {
        let mut e = Entities::default();
        assert_eq!(e.filled_count(), 0);
        e.rat = Some(5);
        e.weight = Some(280.0);
        assert_eq!(e.filled_count(), 2);
        e.action = Some("stop".into());
        assert_eq!(e.filled_count(), 3);
    }

    #[test]
    fn intent_serde_round_trip() {
        let json = serde_json::to_string(&Intent::Record).unwrap();
        assert_eq!(json, "\"record\"");
        let back: Intent = serde_json::from_str("\"unknown\"").unwrap();
        assert_eq!(back, Intent::Unknown);
    }

    #[test]
    fn command_result_constructors() {
        let ok = CommandResult::ok("done");
        assert!(ok.success && !ok.needs_confirmation);

        let confirm = CommandResult::confirmation("check", "Move rat 5 to cage 2?");
        assert!(!confirm.success);
        assert!(confirm.needs_confirmation);
        assert_eq!(confirm.confirmation_prompt.as_deref(), Some("Move rat 5 to cage 2?"));
    }
}
