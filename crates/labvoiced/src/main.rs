//! labvoiced - voice-driven lab data entry daemon.
//!
//! Reads transcriptions line by line on stdin (a stand-in for the speech
//! engine), runs them through the command pipeline and prints results.
//! Colon commands control the daemon itself.

use std::io::{BufRead, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use labvoice_common::config::{BackendKind, Config};
use labvoice_common::ollama::HttpOllamaClient;
use labvoice_common::types::TranscriptionResult;
use labvoiced::db::{default_db_path, LabDb};
use labvoiced::nlu::AdaptiveNlu;
use labvoiced::service::CommandService;
use owo_colors::OwoColorize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "labvoiced", version, about = "Voice-driven lab data entry daemon")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Named preset: minimal, tiny, balanced, performance
    #[arg(long, conflicts_with = "config")]
    preset: Option<String>,

    /// Database file override
    #[arg(long)]
    db: Option<PathBuf>,

    /// Preferred NLU backend override
    #[arg(short, long)]
    backend: Option<BackendKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!("labvoiced v{} starting", env!("CARGO_PKG_VERSION"));

    // The pipeline is synchronous (blocking HTTP, blocking stdin); it
    // runs on a blocking thread while the async side waits for ctrl-c.
    let repl = tokio::task::spawn_blocking(move || run(config));

    tokio::select! {
        result = repl => result.context("pipeline thread panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.preset {
        Some(name) => Config::preset(name)
            .with_context(|| format!("unknown preset: {name}"))?,
        None => Config::load(args.config.as_deref())?,
    };
    if args.preset.is_some() {
        config.apply_env_overrides();
    }
    if let Some(backend) = args.backend {
        config.ai.preferred_backend = backend;
    }
    if let Some(db) = &args.db {
        config.database.path = Some(db.clone());
    }

    let problems = config.validate();
    if !problems.is_empty() {
        bail!("invalid configuration: {}", problems.join("; "));
    }
    Ok(config)
}

fn run(config: Config) -> Result<()> {
    let db_path = config
        .database
        .path
        .clone()
        .unwrap_or_else(default_db_path);
    let db = LabDb::open(&db_path, &config.database)?;

    let client = Arc::new(HttpOllamaClient::new(config.ollama.endpoint.clone())?);
    let nlu = AdaptiveNlu::new(config.ai.clone(), client);
    nlu.initialize();
    info!(backend = %nlu.active_backend(), "NLU ready");

    let mut service = CommandService::new(db, nlu, config.ai.confidence_threshold);

    println!(
        "{} type transcriptions, or {} for daemon commands",
        "ready.".green().bold(),
        ":help".cyan()
    );

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix(':') {
            if !handle_daemon_command(&mut service, rest) {
                break;
            }
            continue;
        }

        let transcription = TranscriptionResult::new(line, 1.0);
        let result = service.process(&transcription);
        print_result(&result.message, result.success, result.needs_confirmation);
        if let Some(prompt) = &result.confirmation_prompt {
            println!("  {} {}", prompt.yellow(), "(:yes / :no)".dimmed());
        }
        std::io::stdout().flush()?;
    }

    Ok(())
}

/// Returns false when the REPL should exit.
fn handle_daemon_command(service: &mut CommandService, command: &str) -> bool {
    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or_default() {
        "quit" | "q" | "exit" => return false,
        "yes" | "y" => {
            let result = service.confirm_pending();
            print_result(&result.message, result.success, false);
        }
        "no" | "n" => {
            if service.cancel_pending() {
                println!("{}", "cancelled".dimmed());
            } else {
                println!("{}", "nothing pending".dimmed());
            }
        }
        "reset" => match service.reset_context() {
            Ok(()) => println!("{}", "session context cleared".dimmed()),
            Err(e) => println!("{} {e}", "failed:".red()),
        },
        "switch" => match parts.next().map(str::parse::<BackendKind>) {
            Some(Ok(kind)) => {
                if service.switch_backend(kind) {
                    println!("{} {}", "switched to".green(), kind);
                } else {
                    println!("{} {kind} is not available", "cannot switch:".red());
                }
            }
            _ => println!("usage: :switch <classification|ollama-tiny|ollama-light|ollama-full>"),
        },
        "status" => print_status(service),
        "help" => {
            println!(":status            backend availability and performance");
            println!(":switch <backend>  change the active NLU backend");
            println!(":yes / :no         resolve a pending confirmation");
            println!(":reset             clear the session context");
            println!(":quit              exit");
        }
        other => println!("unknown daemon command: :{other} (try :help)"),
    }
    true
}

fn print_status(service: &CommandService) {
    let status = service.nlu_status();
    println!("active backend: {}", status.active_backend.to_string().bold());

    let available: Vec<String> = status
        .available_backends
        .iter()
        .map(|b| b.to_string())
        .collect();
    println!("available: {}", available.join(", "));

    for (backend, stats) in &status.performance {
        println!(
            "  {backend}: {:.0}ms avg, {:.0}% success ({} samples)",
            stats.avg_time_ms,
            stats.success_rate * 100.0,
            stats.samples
        );
    }
    for recommendation in &status.recommendations {
        println!("  {} {recommendation}", "hint:".cyan());
    }

    if let Some(ctx) = service.context() {
        println!(
            "context: rat {:?}, cage {:?}, weight {:?}",
            ctx.last_rat, ctx.last_cage, ctx.last_weight
        );
    }
}

fn print_result(message: &str, success: bool, needs_confirmation: bool) {
    if success {
        println!("{} {message}", "ok".green().bold());
    } else if needs_confirmation {
        println!("{} {message}", "?".yellow().bold());
    } else {
        println!("{} {message}", "failed".red().bold());
    }
}
