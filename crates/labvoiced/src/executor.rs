//! Command execution against the database.
//!
//! Validation failures come back as unsuccessful results with operator
//! guidance, never as errors; storage errors are folded into the result
//! message the same way. Each mutating command is one database
//! transaction that also advances the session context, so follow-up
//! commands can use implicit references and a failed command leaves no
//! partial rows behind.

use labvoice_common::types::{Command, CommandKind, CommandResult, SessionContext};
use tracing::debug;

use crate::db::LabDb;

/// Tolerance for "around N grams" queries.
const WEIGHT_QUERY_TOLERANCE: f64 = 20.0;

/// Execute a gated command. `context` is the session context as of before
/// this command; context updates are persisted through `db`.
pub fn execute(
    db: &mut LabDb,
    session_id: i64,
    context: Option<&SessionContext>,
    command: &Command,
) -> CommandResult {
    debug!(kind = %command.kind, confidence = command.confidence, "executing command");
    match command.kind {
        CommandKind::Record => execute_record(db, session_id, command),
        CommandKind::Update => execute_update(db, session_id, context, command),
        CommandKind::Move => execute_move(db, session_id, command),
        CommandKind::Query => execute_query(db, context, command),
        CommandKind::System => execute_system(command),
    }
}

fn execute_record(db: &mut LabDb, session_id: i64, command: &Command) -> CommandResult {
    let (Some(rat), Some(cage), Some(weight)) = (
        command.entities.rat,
        command.entities.cage,
        command.entities.weight,
    ) else {
        return CommandResult::failure("Missing required information for recording");
    };

    match db.record_reading(rat, cage, weight, session_id) {
        Ok(reading) => CommandResult::ok_with_data(
            format!("Logged. Rat {rat}, cage {cage}, {weight} grams"),
            serde_json::to_value(reading).unwrap_or_default(),
        ),
        Err(e) => CommandResult::failure(format!("Failed to record reading: {e}")),
    }
}

fn execute_update(
    db: &mut LabDb,
    session_id: i64,
    context: Option<&SessionContext>,
    command: &Command,
) -> CommandResult {
    let Some(weight) = command.entities.weight else {
        return CommandResult::failure("Missing weight information");
    };
    let Some(rat) = command
        .entities
        .rat
        .or_else(|| context.and_then(|c| c.last_rat))
    else {
        return CommandResult::failure("Which rat? No recent rat mentioned");
    };

    match db.update_animal_weight(rat, weight, session_id) {
        Ok(()) => CommandResult::ok(format!("Updated rat {rat} weight to {weight} grams")),
        Err(e) => CommandResult::failure(format!("Failed to update weight: {e}")),
    }
}

fn execute_move(db: &mut LabDb, session_id: i64, command: &Command) -> CommandResult {
    let (Some(rat), Some(cage)) = (command.entities.rat, command.entities.cage) else {
        return CommandResult::failure("Missing rat or cage information");
    };

    match db.move_animal(rat, cage, session_id) {
        Ok(()) => CommandResult::ok(format!("Moved rat {rat} to cage {cage}")),
        Err(e) => CommandResult::failure(format!("Failed to move animal: {e}")),
    }
}

fn execute_query(
    db: &LabDb,
    context: Option<&SessionContext>,
    command: &Command,
) -> CommandResult {
    if let Some(weight) = command.entities.weight {
        return match db.animals_around_weight(weight, WEIGHT_QUERY_TOLERANCE) {
            Ok(animals) if animals.is_empty() => {
                CommandResult::ok(format!("No rats found around {weight} grams"))
            }
            Ok(animals) => {
                let results = animals
                    .iter()
                    .map(|a| {
                        let weight = a
                            .current_weight
                            .map(|w| w.to_string())
                            .unwrap_or_else(|| "?".to_string());
                        let cage = a
                            .current_cage
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        format!("Rat {} at {}g in cage {}", a.number, weight, cage)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                CommandResult::ok_with_data(
                    format!("Found {} rats: {}", animals.len(), results),
                    serde_json::to_value(&animals).unwrap_or_default(),
                )
            }
            Err(e) => CommandResult::failure(format!("Query failed: {e}")),
        };
    }

    match command.entities.action.as_deref() {
        Some("lastreading") => last_reading(context),
        Some("currentstatus") => current_status(context),
        _ => CommandResult::failure("Unknown query type"),
    }
}

fn execute_system(command: &Command) -> CommandResult {
    match command.entities.action.as_deref() {
        Some("stop") => CommandResult::ok_with_data(
            "Stopping listening mode",
            serde_json::json!({ "action": "stop_listening" }),
        ),
        Some("start") => CommandResult::ok_with_data(
            "Starting listening mode",
            serde_json::json!({ "action": "start_listening" }),
        ),
        _ => CommandResult::failure("Unknown system command"),
    }
}

fn last_reading(context: Option<&SessionContext>) -> CommandResult {
    if let Some(ctx) = context {
        if let (Some(rat), Some(weight)) = (ctx.last_rat, ctx.last_weight) {
            return CommandResult::ok(format!("Last reading: Rat {rat}, {weight} grams"));
        }
    }
    CommandResult::ok("No recent readings in this session")
}

fn current_status(context: Option<&SessionContext>) -> CommandResult {
    let mut status = Vec::new();
    if let Some(ctx) = context {
        if let Some(rat) = ctx.last_rat {
            status.push(format!("Current rat: {rat}"));
        }
        if let Some(cage) = ctx.last_cage {
            status.push(format!("Current cage: {cage}"));
        }
        if let Some(weight) = ctx.last_weight {
            status.push(format!("Last weight: {weight}g"));
        }
    }
    if status.is_empty() {
        CommandResult::ok("No current context")
    } else {
        CommandResult::ok(status.join(", "))
    }
}

/// Confirmation prompt for a command held back by the confidence gate.
pub fn confirmation_prompt(command: &Command) -> String {
    let e = &command.entities;
    match command.kind {
        CommandKind::Record => format!(
            "Record rat {} in cage {} with weight {} grams?",
            display_i64(e.rat),
            display_i64(e.cage),
            display_f64(e.weight)
        ),
        CommandKind::Update => {
            let rat = e
                .rat
                .map(|r| format!("rat {r}"))
                .unwrap_or_else(|| "current rat".to_string());
            format!("Update {} weight to {} grams?", rat, display_f64(e.weight))
        }
        CommandKind::Move => format!(
            "Move rat {} to cage {}?",
            display_i64(e.rat),
            display_i64(e.cage)
        ),
        _ => format!("Execute command: {}?", command.raw_text),
    }
}

fn display_i64(v: Option<i64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string())
}

fn display_f64(v: Option<f64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string())
}
