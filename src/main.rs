use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use narrative_engine::NarrativeError;
use narrative_engine::cli::{Cli, Command};
use narrative_engine::config::{NarrativeConfig, load_config};
use narrative_engine::events::LogSink;
use narrative_engine::orchestrator::NarrativeOrchestrator;
use narrative_engine::{admin, play, status};

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".narrative").join("narrative.db")
}

fn run_engine(db_path: &Path, config: &NarrativeConfig, command: Command) -> Result<(), NarrativeError> {
    let orch = NarrativeOrchestrator::open(db_path, config)?;
    let sink = LogSink;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(NarrativeError::Io)?;

    rt.block_on(async {
        let provider = narrative_engine::metrics::init_meter_provider(&config.metrics);

        let res = match command {
            Command::Import(args) => admin::handle_import(&orch, &args).await,
            Command::Deactivate(args) => admin::handle_deactivate(&orch, &args).await,
            Command::Validate => admin::handle_validate(&orch),
            Command::Start(args) => play::handle_start(&orch, &sink, &args).await,
            Command::Advance(args) => play::handle_advance(&orch, &sink, &args).await,
            Command::Finish(args) => play::handle_finish(&orch, &sink, &args).await,
            Command::Show(args) => play::handle_show(&orch, &args).await,
            Command::Progress(args) => play::handle_progress(&orch, &args).await,
            Command::Reset(args) => play::handle_reset(&orch, &sink, &args).await,
            Command::Status => status::handle_status(db_path),
        };

        if let Some(p) = provider {
            let _ = p.shutdown();
        }
        res
    })
}

fn run() -> Result<(), NarrativeError> {
    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let config = load_config()?;

    match cli.command {
        Command::Status => status::handle_status(&db_path),
        command => run_engine(&db_path, &config, command),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("narrative: {e}");
            ExitCode::from(1)
        }
    }
}
