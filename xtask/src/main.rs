use anyhow::{ensure, Result};
use clap::{Parser, Subcommand};
use parley_core::state::{AppState, MessageRole};
use parley_core::{telemetry, ClientSettings, FileStore, MockBackend, RenderChannel, ScriptedReply};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Parley")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a lightweight smoke test that exercises the Parley core logic.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let settings = ClientSettings {
        data_dir: temp_dir.path().to_path_buf(),
        ..ClientSettings::default()
    };
    let backend = MockBackend::new();

    let open = |backend: &MockBackend| -> Result<AppState> {
        let store = FileStore::new(settings.data_dir.clone())?;
        Ok(AppState::new(
            &settings,
            Arc::new(store),
            Arc::new(backend.clone()),
            RenderChannel::detached(),
        ))
    };

    let state = open(&backend)?;
    runtime.block_on(state.startup())?;
    runtime.block_on(state.send_message("ping from xtask"))?;
    backend.push_reply(ScriptedReply::Status {
        status: 429,
        body: r#"{"error":"rate limited"}"#.into(),
    });
    let rejected = runtime.block_on(state.send_message("second ping"));
    ensure!(rejected.is_err(), "scripted 429 should fail the turn");

    let reopened = open(&backend)?;
    runtime.block_on(reopened.startup())?;
    let session = reopened
        .registry()
        .current_session()
        .ok_or_else(|| anyhow::anyhow!("no chat after restart"))?;
    let replies = session
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::Model)
        .count();
    ensure!(session.messages.len() == 3, "expected 3 stored messages");
    ensure!(replies == 1, "expected a single stored reply");
    info!(
        "messages" = session.messages.len(),
        "title" = %session.title,
        "smoke test conversation saved"
    );

    Ok(())
}
