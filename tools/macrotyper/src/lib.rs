pub mod buffers;
pub mod capture;
pub mod config;
pub mod document;
pub mod edit;
pub mod errors;
pub mod fsm;
pub mod hooks;
pub mod log_retention;
pub mod logging;
pub mod macro_store;
pub mod play;
pub mod record;
pub mod rehydrate;
pub mod runtime;
pub mod session;

use clap::{error::ErrorKind, Parser, Subcommand};
use config::{load_config, AppConfig, CliOverrides};
use errors::TyperError;
use fsm::{RunPhase, SessionState};
use hooks::StatusFeedback;
use logging::{append_run_log, init_run_logger, JsonlLogger};
use macro_store::{MacroStorage, MacroStore};
use runtime::{MemoryEditor, ProductionRuntime, ScriptedPrompter};
use serde_json::json;
use session::{spawn_typer, TyperDeps, TyperHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "macrotyper")]
#[command(about = "Record, store and replay editor typing macros")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
    #[arg(long = "interval-ms", global = true)]
    pub autoplay_interval_ms: Option<u64>,
    #[arg(long, global = true, default_value_t = false)]
    pub silent: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List stored macros.
    List,
    /// Describe every buffer of a macro.
    Show { name: String },
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },
    Export { name: String, path: PathBuf },
    /// Import macro files in the current or legacy format.
    Import {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print the document a macro ends with.
    FinalState { name: String },
    /// Play a macro into an in-memory document and print the result.
    Replay {
        name: String,
        /// Keys to type during playback, in order.
        #[arg(long)]
        keys: Option<String>,
        #[arg(long, default_value_t = false)]
        autoplay: bool,
    },
}

pub fn run() -> Result<i32, TyperError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| TyperError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, TyperError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(TyperError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        db_path: cli.db.clone(),
        autoplay_interval_ms: cli.autoplay_interval_ms,
        silent: cli.silent,
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    init_run_logger(JsonlLogger::from_config(&cfg.logging));
    append_run_log(
        "info",
        "cli.started",
        json!({ "command": format!("{:?}", cli.command) }),
    );

    let store: Arc<dyn MacroStorage> = Arc::new(MacroStore::open(&cfg.storage.db_path)?);

    // Direct store reads stay outside the async runtime.
    if let Command::Show { name } = &cli.command {
        let recorded = store
            .load(name)?
            .ok_or_else(|| TyperError::NoActiveRecording(name.clone()))?;
        runtime.terminal.write_line(&format!(
            "{} ({} buffers){}",
            recorded.name,
            recorded.buffers.len(),
            if recorded.description.is_empty() {
                String::new()
            } else {
                format!(": {}", recorded.description)
            }
        ))?;
        for (idx, buffer) in recorded.buffers.iter().enumerate() {
            runtime
                .terminal
                .write_line(&format!("{idx:>4}  {}", buffer.describe()))?;
        }
        return Ok(0);
    }

    let tokio_runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| TyperError::Io(e.to_string()))?;
    tokio_runtime.block_on(run_command(cli.command, &cfg, store, runtime))
}

async fn run_command(
    command: Command,
    cfg: &AppConfig,
    store: Arc<dyn MacroStorage>,
    runtime: &ProductionRuntime,
) -> Result<i32, TyperError> {
    let editor = MemoryEditor::new();
    let handle = spawn_typer(
        cfg,
        TyperDeps {
            editor: Arc::new(editor.clone()),
            storage: store,
            prompter: Arc::new(ScriptedPrompter::default()),
            feedback: Arc::new(StatusFeedback::new(
                cfg.feedback.app_name.clone(),
                cfg.feedback.silent,
                runtime.terminal.clone(),
            )),
            file_system: runtime.file_system.clone(),
        },
    );
    editor.echo_to(handle.capture());

    match command {
        Command::List => {
            let macros = handle.list().await?;
            if macros.is_empty() {
                runtime.terminal.write_line("no macros stored")?;
            }
            for summary in macros {
                runtime.terminal.write_line(&format!(
                    "{}\t{} buffers\t{}",
                    summary.name, summary.buffer_count, summary.description
                ))?;
            }
        }
        Command::Delete { names } => {
            let names = names.iter().map(String::as_str).collect::<Vec<_>>();
            let deleted = handle.delete(&names).await?;
            for name in names.iter().filter(|name| !deleted.iter().any(|d| d == *name)) {
                runtime
                    .terminal
                    .write_line(&format!("no macro named {name}"))?;
            }
        }
        Command::Export { name, path } => handle.export(&name, path).await?,
        Command::Import { paths } => {
            for path in paths {
                handle.import(path).await?;
            }
        }
        Command::FinalState { name } => {
            if handle.load_final_state(&name).await? {
                runtime
                    .terminal
                    .write_line(&editor.text().unwrap_or_default())?;
            }
        }
        Command::Replay {
            name,
            keys,
            autoplay,
        } => {
            handle.play(&name).await?;
            replay(&handle, cfg, keys.as_deref(), autoplay).await?;
            runtime
                .terminal
                .write_line(&editor.text().unwrap_or_default())?;
        }
        Command::Show { .. } => {}
    }
    Ok(0)
}

async fn replay(
    handle: &TyperHandle,
    cfg: &AppConfig,
    keys: Option<&str>,
    autoplay: bool,
) -> Result<(), TyperError> {
    let capture = handle.capture();
    let breakout = cfg.playback.breakout_char().to_string();

    if let Some(keys) = keys {
        for key in keys.chars() {
            if !capture.typed(&key.to_string()).await {
                break;
            }
        }
        let settle = Duration::from_millis(cfg.playback.autoplay_interval_ms.max(50) * 4);
        if tokio::time::timeout(settle, handle.wait_until(SessionState::is_idle))
            .await
            .is_err()
        {
            handle.cancel_playing().await?;
        }
        return Ok(());
    }

    if autoplay {
        capture
            .typed(&cfg.playback.autoplay_toggle_char().to_string())
            .await;
    }
    loop {
        let state = handle.state();
        match state {
            SessionState::Idle => return Ok(()),
            SessionState::Playing(playing) if matches!(playing.run, RunPhase::Paused { .. }) => {
                if !capture.typed(&breakout).await {
                    break;
                }
                handle.wait_until(|current| *current != state).await?;
            }
            _ if autoplay => {
                handle
                    .wait_until(|current| {
                        matches!(
                            current,
                            SessionState::Idle
                                | SessionState::Playing(fsm::PlayingState {
                                    run: RunPhase::Paused { .. },
                                    ..
                                })
                        )
                    })
                    .await?;
            }
            _ => {
                if !capture.typed(" ").await {
                    break;
                }
            }
        }
    }
    handle.wait_until(SessionState::is_idle).await?;
    Ok(())
}
