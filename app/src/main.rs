use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use console::style;
use parley::{AuthMode, ParleyApp};
use parley_core::telemetry;
use parley_core::ClientSettings;
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Terminal client for a conversational AI backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    /// Read settings from this file instead of the default locations.
    #[arg(long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive conversation (default).
    Chat,
    Login,
    Signup,
    Logout,
    /// List chats in the current mode.
    Chats,
    /// Send a single message and print the reply.
    Send {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Models advertised by the backend.
    Models,
}

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing(EnvFilter::from_default_env())?;
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => ClientSettings::from_path(path),
        None => ClientSettings::load(),
    }
    .map_err(|err| anyhow::anyhow!(err.user_message()))?;

    let runtime = Runtime::new()?;
    let result = runtime.block_on(run(cli.command.unwrap_or(Command::Chat), settings));
    // A stdin read may still be parked on a blocking thread.
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run(command: Command, settings: ClientSettings) -> anyhow::Result<()> {
    let mut app = ParleyApp::new(&settings)?;
    match command {
        Command::Chat => {
            if app.resume().await? {
                app.run_chat().await?;
            }
        }
        Command::Login => {
            app.start().await?;
            app.authenticate(AuthMode::SignIn).await?;
        }
        Command::Signup => {
            app.start().await?;
            app.authenticate(AuthMode::SignUp).await?;
        }
        Command::Logout => {
            app.state().auth().restore();
            app.logout().await;
            println!("{}", style("Signed out").dim());
        }
        Command::Chats => {
            ensure_conversation(&mut app).await?;
            app.print_chats();
        }
        Command::Send { text } => {
            ensure_conversation(&mut app).await?;
            let _listener = app.listen_for_interrupts();
            app.send(&text.join(" ")).await?;
        }
        Command::Models => {
            let models = app
                .state()
                .backend()
                .list_models()
                .await
                .context("failed to list models")?;
            for model in models {
                let label = model.display_name.as_deref().unwrap_or(&model.name);
                match model.description.as_deref() {
                    Some(description) => {
                        println!("{}  {}", style(label).bold(), style(description).dim())
                    }
                    None => println!("{}", style(label).bold()),
                }
            }
        }
    }
    Ok(())
}

async fn ensure_conversation(app: &mut ParleyApp) -> anyhow::Result<()> {
    if !app.start().await? {
        bail!("not signed in, run `parley login` first");
    }
    Ok(())
}
