pub mod app;
pub mod checkpoint;
pub mod clock;
pub mod controller;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod machine;
pub mod models;
pub mod recovery;
pub mod store;

use crate::app::FocusApp;
use crate::dispatcher::TimerEvent;
use crate::errors::{AppError, AppResult};
use crate::models::{LinkedEntity, ListSessionsFilters, StartSessionPayload, TimerPhase};
use crate::recovery::RecoveryOutcome;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[derive(Debug, Parser)]
#[command(name = "focus", version, about = "Durable, drift-corrected focus session timer")]
struct Cli {
    /// Directory holding the database and logs. Defaults to the platform data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a focus session.
    Start(StartArgs),
    /// Pause the running session.
    Pause,
    /// Resume the paused session.
    Resume {
        #[arg(long)]
        watch: bool,
    },
    /// Stop the active session, recording it as interrupted.
    Stop,
    /// Show the current timer state.
    Status,
    /// Follow the countdown until the session ends or Ctrl-C.
    Watch,
    /// List past and current sessions.
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Task {
        #[command(subcommand)]
        action: EntityCommand,
    },
    Habit {
        #[command(subcommand)]
        action: EntityCommand,
    },
    /// List recorded notifications, newest first.
    Notifications {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct StartArgs {
    #[arg(long)]
    minutes: u32,
    #[arg(long, conflicts_with = "habit")]
    task: Option<String>,
    #[arg(long)]
    habit: Option<String>,
    #[arg(long)]
    watch: bool,
}

#[derive(Debug, Subcommand)]
enum EntityCommand {
    Add { title: String },
    List,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    /// Merge a JSON object into the stored settings, e.g. '{"reminderLeadSeconds":120}'.
    Set { json: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusView<'a> {
    recovery: &'a RecoveryOutcome,
    timer: models::TimerSnapshot,
    data_dir: &'a Path,
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "command failed");
            eprintln!("{}", to_client_error(&error));
            if error.is_actionable() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn execute(cli: Cli) -> AppResult<()> {
    let data_dir = resolve_data_dir(cli.data_dir)?;
    std::fs::create_dir_all(&data_dir)?;
    if let Err(error) = init_tracing(&data_dir) {
        eprintln!("logging disabled: {error}");
    }

    let app = FocusApp::new(data_dir)?;
    let recovery = app.recover().await?;
    let controller = app.controller();

    match cli.command {
        Command::Start(args) => {
            let linked_entity = match (args.task, args.habit) {
                (Some(id), _) => Some(LinkedEntity::Task { id }),
                (None, Some(id)) => Some(LinkedEntity::Habit { id }),
                (None, None) => None,
            };
            let session = controller
                .start(StartSessionPayload {
                    planned_minutes: args.minutes,
                    linked_entity,
                })
                .await?;
            print_json(&session)?;
            if args.watch {
                watch(&app).await?;
            }
        }
        Command::Pause => print_json(&controller.pause().await?)?,
        Command::Resume { watch: follow } => {
            print_json(&controller.resume().await?)?;
            if follow {
                watch(&app).await?;
            }
        }
        Command::Stop => {
            print_json(&controller.stop().await?)?;
            controller.flush().await?;
        }
        Command::Status => print_json(&StatusView {
            recovery: &recovery,
            timer: controller.snapshot()?,
            data_dir: app.data_dir(),
        })?,
        Command::Watch => watch(&app).await?,
        Command::History { limit } => print_json(&app.db().list_sessions(&ListSessionsFilters {
            user_id: Some(controller.settings().user_id.clone()),
            lifecycle_state: None,
            limit: Some(limit),
        })?)?,
        Command::Task { action } => match action {
            EntityCommand::Add { title } => print_json(&app.db().create_task(&title)?)?,
            EntityCommand::List => print_json(&app.db().list_tasks()?)?,
        },
        Command::Habit { action } => match action {
            EntityCommand::Add { title } => print_json(&app.db().create_habit(&title)?)?,
            EntityCommand::List => print_json(&app.db().list_habits()?)?,
        },
        Command::Notifications { limit } => print_json(&app.db().list_notifications(limit)?)?,
        Command::Config { action } => match action {
            ConfigCommand::Show => print_json(&app.db().get_timer_settings()?)?,
            ConfigCommand::Set { json } => {
                let update: serde_json::Value = serde_json::from_str(&json).map_err(|error| {
                    AppError::Validation(format!("settings must be a JSON object: {error}"))
                })?;
                if !update.is_object() {
                    return Err(AppError::Validation("settings must be a JSON object".to_string()));
                }
                print_json(&app.update_settings(update)?)?;
            }
        },
    }
    Ok(())
}

/// Streams timer events and a once-per-second status line until the session leaves Running.
/// Ctrl-C detaches without stopping the session; the next invocation recovers it.
async fn watch(app: &FocusApp) -> AppResult<()> {
    let controller = app.controller();
    let mut events = app.events().subscribe();
    let mut status = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                controller.checkpoint().await?;
                tracing::info!("watch detached; session keeps running");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_line(&event)?;
                    let finished = matches!(
                        event,
                        TimerEvent::Completed { .. } | TimerEvent::Interrupted { .. }
                    );
                    if finished {
                        controller.flush().await?;
                        controller.reset()?;
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "watch fell behind timer events");
                }
                Err(RecvError::Closed) => break,
            },
            _ = status.tick() => {
                let snapshot = controller.snapshot()?;
                if snapshot.phase != TimerPhase::Running {
                    print_line(&snapshot)?;
                    break;
                }
                print_line(&serde_json::json!({
                    "phase": snapshot.phase,
                    "remainingSeconds": snapshot.remaining_seconds,
                }))?;
            }
        }
    }
    Ok(())
}

fn resolve_data_dir(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    let dirs = directories::ProjectDirs::from("com", "kiingo", "focus-tracker")
        .context("unable to determine a data directory; pass --data-dir")?;
    Ok(dirs.data_dir().to_path_buf())
}

fn print_json(value: &impl Serialize) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_line(value: &impl Serialize) -> AppResult<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn init_tracing(app_data_dir: &Path) -> Result<(), String> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "focus.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

fn to_client_error(error: impl std::fmt::Display) -> String {
    error.to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command};
    use clap::Parser;

    #[test]
    fn start_accepts_one_linked_entity() {
        let cli = Cli::try_parse_from(["focus", "start", "--minutes", "25", "--task", "t-1"]).expect("parse");
        match cli.command {
            Command::Start(args) => {
                assert_eq!(args.minutes, 25);
                assert_eq!(args.task.as_deref(), Some("t-1"));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let both = Cli::try_parse_from(["focus", "start", "--minutes", "25", "--task", "t-1", "--habit", "h-1"]);
        assert!(both.is_err());
    }

    #[test]
    fn data_dir_is_global() {
        let cli = Cli::try_parse_from(["focus", "status", "--data-dir", "/tmp/focus"]).expect("parse");
        assert_eq!(cli.data_dir.as_deref(), Some(std::path::Path::new("/tmp/focus")));
    }
}
