//! The command pipeline: transcription in, command result out.
//!
//! One service instance owns the database, the adaptive NLU selector and
//! the session state. Every parsed command is written to the audit trail
//! whether or not it executes; the confidence gate decides between
//! execution and a confirmation request, and a confirmed command is
//! replayed from the pending slot.

use labvoice_common::config::BackendKind;
use labvoice_common::types::{Command, CommandResult, SessionContext, TranscriptionResult};
use tracing::{debug, error, warn};

use crate::db::{LabDb, StorageError};
use crate::executor;
use crate::interpret;
use crate::nlu::{AdaptiveNlu, NluError, SystemStatus};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct CommandService {
    db: LabDb,
    nlu: AdaptiveNlu,
    confidence_threshold: f64,
    session_id: Option<i64>,
    context: Option<SessionContext>,
    /// Command held back by the gate, awaiting operator confirmation.
    pending: Option<Command>,
}

impl CommandService {
    pub fn new(db: LabDb, nlu: AdaptiveNlu, confidence_threshold: f64) -> Self {
        Self {
            db,
            nlu,
            confidence_threshold,
            session_id: None,
            context: None,
            pending: None,
        }
    }

    /// Process one transcription end to end. Storage trouble along the
    /// way comes back as a failure result, never as an error.
    pub fn process(&mut self, transcription: &TranscriptionResult) -> CommandResult {
        match self.try_process(transcription) {
            Ok(result) => result,
            Err(e) => {
                error!("command processing failed: {e}");
                CommandResult::failure(format!("Error processing command: {e}"))
            }
        }
    }

    fn try_process(
        &mut self,
        transcription: &TranscriptionResult,
    ) -> Result<CommandResult, ServiceError> {
        if transcription.text.trim().is_empty() {
            return Ok(CommandResult::failure("Empty transcription"));
        }

        self.ensure_active_session()?;
        let session_id = self.session_id.unwrap_or_default();

        let command = resolve_command(
            self.nlu.parse_command(transcription),
            transcription,
            self.context.as_ref(),
        );

        let auto_execute =
            command.confidence >= self.confidence_threshold && !command.needs_confirmation;

        self.db.log_command(
            session_id,
            &command.raw_text,
            &serde_json::to_string(&command).unwrap_or_default(),
            command.confidence,
            auto_execute,
        )?;

        if auto_execute {
            let result = executor::execute(&mut self.db, session_id, self.context.as_ref(), &command);
            self.refresh_context()?;
            Ok(result)
        } else {
            debug!(
                confidence = command.confidence,
                needs_confirmation = command.needs_confirmation,
                "holding command for confirmation"
            );
            let message = format!("Did you say: \"{}\"?", command.raw_text);
            let prompt = executor::confirmation_prompt(&command);
            self.pending = Some(command);
            Ok(CommandResult::confirmation(message, prompt))
        }
    }

    /// Execute the command held back by the last confirmation request.
    pub fn confirm_pending(&mut self) -> CommandResult {
        match self.try_confirm() {
            Ok(result) => result,
            Err(e) => {
                error!("confirmation failed: {e}");
                CommandResult::failure(format!("Error processing command: {e}"))
            }
        }
    }

    fn try_confirm(&mut self) -> Result<CommandResult, ServiceError> {
        let Some(command) = self.pending.take() else {
            return Ok(CommandResult::failure("Nothing awaiting confirmation"));
        };

        self.ensure_active_session()?;
        let session_id = self.session_id.unwrap_or_default();

        self.db.log_command(
            session_id,
            &command.raw_text,
            &serde_json::to_string(&command).unwrap_or_default(),
            command.confidence,
            true,
        )?;

        let result = executor::execute(&mut self.db, session_id, self.context.as_ref(), &command);
        self.refresh_context()?;
        Ok(result)
    }

    /// Drop the pending command. Returns whether one was pending.
    pub fn cancel_pending(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Forget last-mentioned rat, cage and weight for this session.
    pub fn reset_context(&mut self) -> Result<(), ServiceError> {
        if let Some(session_id) = self.session_id {
            self.db.clear_session_context(session_id)?;
        }
        self.context = None;
        Ok(())
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    pub fn session_id(&self) -> Option<i64> {
        self.session_id
    }

    pub fn nlu_status(&self) -> SystemStatus {
        self.nlu.system_status()
    }

    pub fn switch_backend(&self, kind: BackendKind) -> bool {
        self.nlu.switch_backend(kind)
    }

    pub fn db(&self) -> &LabDb {
        &self.db
    }

    /// Resume the active session or start a fresh one.
    fn ensure_active_session(&mut self) -> Result<(), ServiceError> {
        if self.session_id.is_some() {
            return Ok(());
        }
        let session = match self.db.current_session()? {
            Some(session) => session,
            None => self.db.start_session()?,
        };
        self.context = self.db.session_context(session.id)?;
        self.session_id = Some(session.id);
        debug!(session_id = session.id, "session active");
        Ok(())
    }

    fn refresh_context(&mut self) -> Result<(), ServiceError> {
        if let Some(session_id) = self.session_id {
            self.context = self.db.session_context(session_id)?;
        }
        Ok(())
    }
}

/// Turn the selector's output into the command to gate. A successful
/// parse gets the session-context merge; the fixed-pattern fallback is
/// used verbatim, with no merge.
fn resolve_command(
    parsed: Result<Command, NluError>,
    transcription: &TranscriptionResult,
    context: Option<&SessionContext>,
) -> Command {
    match parsed {
        Ok(mut command) => {
            interpret::apply_context(&mut command, context);
            command
        }
        Err(e) => {
            warn!("NLU parsing failed, falling back to fixed patterns: {e}");
            interpret::legacy_parse(transcription)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labvoice_common::config::AiConfig;
    use labvoice_common::ollama::FakeOllamaClient;
    use std::sync::Arc;

    fn service() -> CommandService {
        let ai = AiConfig {
            preferred_backend: BackendKind::Classification,
            enable_benchmarking: false,
            ..AiConfig::default()
        };
        let nlu = AdaptiveNlu::new(ai, Arc::new(FakeOllamaClient::unreachable()));
        nlu.initialize();
        CommandService::new(LabDb::open_in_memory().unwrap(), nlu, 0.7)
    }

    #[test]
    fn record_executes_and_seeds_context() {
        let mut svc = service();
        let result = svc.process(&TranscriptionResult::new("rat 5 cage 3 weight 280 grams", 1.0));
        assert!(result.success);
        assert_eq!(result.message, "Logged. Rat 5, cage 3, 280 grams");

        let ctx = svc.context().unwrap();
        assert_eq!(ctx.last_rat, Some(5));
        assert_eq!(ctx.last_weight, Some(280.0));
    }

    #[test]
    fn update_follows_record_through_context() {
        let mut svc = service();
        svc.process(&TranscriptionResult::new("rat 5 cage 3 weight 280 grams", 1.0));

        let result = svc.process(&TranscriptionResult::new("change weight to 300 grams", 1.0));
        assert!(result.success, "{}", result.message);
        assert_eq!(result.message, "Updated rat 5 weight to 300 grams");
        assert_eq!(svc.context().unwrap().last_weight, Some(300.0));
    }

    #[test]
    fn low_transcription_confidence_asks_for_confirmation() {
        let mut svc = service();
        let result = svc.process(&TranscriptionResult::new("move rat 7 to cage 12", 0.5));
        assert!(!result.success);
        assert!(result.needs_confirmation);
        assert_eq!(result.message, "Did you say: \"move rat 7 to cage 12\"?");
        assert_eq!(
            result.confirmation_prompt.as_deref(),
            Some("Move rat 7 to cage 12?")
        );
    }

    #[test]
    fn confirmed_command_executes() {
        let mut svc = service();
        svc.process(&TranscriptionResult::new("rat 7 cage 1 weight 250 grams", 1.0));
        svc.process(&TranscriptionResult::new("move rat 7 to cage 12", 0.5));

        let result = svc.confirm_pending();
        assert!(result.success);
        assert_eq!(result.message, "Moved rat 7 to cage 12");
        assert_eq!(svc.context().unwrap().last_cage, Some(12));

        // Nothing left pending.
        let again = svc.confirm_pending();
        assert!(!again.success);
    }

    #[test]
    fn cancel_drops_the_pending_command() {
        let mut svc = service();
        svc.process(&TranscriptionResult::new("move rat 7 to cage 12", 0.5));
        assert!(svc.cancel_pending());
        assert!(!svc.cancel_pending());
        assert!(!svc.confirm_pending().success);
    }

    #[test]
    fn empty_transcription_is_rejected_without_a_session() {
        let mut svc = service();
        let result = svc.process(&TranscriptionResult::new("   ", 1.0));
        assert!(!result.success);
        assert!(svc.session_id().is_none());
    }

    #[test]
    fn every_command_lands_in_the_audit_trail() {
        let mut svc = service();
        svc.process(&TranscriptionResult::new("rat 5 cage 3 weight 280 grams", 1.0));
        svc.process(&TranscriptionResult::new("move rat 5 to cage 9", 0.5));

        let session = svc.session_id().unwrap();
        let history = svc.db().command_history(session, 10).unwrap();
        assert_eq!(history.len(), 2);
        // Newest first: the held-back move, then the executed record.
        assert!(!history[0].executed);
        assert!(history[1].executed);
    }

    #[test]
    fn reset_context_clears_implicit_references() {
        let mut svc = service();
        svc.process(&TranscriptionResult::new("rat 5 cage 3 weight 280 grams", 1.0));
        assert!(svc.context().is_some());

        svc.reset_context().unwrap();
        assert!(svc.context().is_none());

        // Update now has no rat to borrow; the executor asks.
        let result = svc.process(&TranscriptionResult::new("update weight to 300 grams", 1.0));
        assert!(result.needs_confirmation || !result.success);
    }

    #[test]
    fn storage_errors_become_failure_results() {
        let mut svc = service();
        // A session id with no backing row makes the audit insert hit its
        // foreign key; the operator gets a failure result, not a crash.
        svc.session_id = Some(999);
        let result = svc.process(&TranscriptionResult::new("rat 5 cage 3 weight 280 grams", 1.0));
        assert!(!result.success);
        assert!(result.message.starts_with("Error processing command"));
    }

    #[test]
    fn fixed_pattern_fallback_skips_context_merge() {
        let context = SessionContext {
            session_id: 1,
            last_rat: Some(5),
            last_cage: Some(3),
            last_weight: Some(280.0),
            updated_at: chrono::Utc::now(),
        };
        let transcription = TranscriptionResult::new("update weight to 300 grams", 1.0);

        // Selector failure: the fixed patterns run and nothing is
        // borrowed from the session context.
        let fallback = resolve_command(
            Err(NluError::Classifier("scoring failed".to_string())),
            &transcription,
            Some(&context),
        );
        assert_eq!(fallback.entities.rat, None);
        assert!(!fallback.context_used);

        // The same context does merge into a successful parse.
        let parsed = interpret::legacy_parse(&transcription);
        let merged = resolve_command(Ok(parsed), &transcription, Some(&context));
        assert_eq!(merged.entities.rat, Some(5));
        assert!(merged.context_used);
    }

    #[test]
    fn session_resumes_across_service_instances() {
        let mut svc = service();
        svc.process(&TranscriptionResult::new("rat 5 cage 3 weight 280 grams", 1.0));
        let first = svc.session_id().unwrap();

        // A second process call reuses the same session.
        svc.process(&TranscriptionResult::new("rat 6 cage 4 weight 260 grams", 1.0));
        assert_eq!(svc.session_id().unwrap(), first);
    }
}
