//! labvoiced - voice-driven lab data entry.
//!
//! Transcribed utterances flow through the adaptive NLU selector, the
//! interpreter, the confidence gate and the executor, with SQLite
//! persistence for readings, sessions and the command audit trail.

pub mod db;
pub mod executor;
pub mod interpret;
pub mod nlu;
pub mod service;
