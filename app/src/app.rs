use crate::commands::{self, ChatCommand};
use crate::ui::TerminalRenderer;
use anyhow::{bail, Context, Result};
use console::style;
use dialoguer::{theme::ColorfulTheme, Input, Password, Select};
use parking_lot::Mutex;
use parley_core::state::ChatSummary;
use parley_core::{
    AppState, AuthOutcome, ClientSettings, FileStore, HttpBackend, RenderChannel, RenderEvent,
    StartupView,
};
use std::io::Stdout;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    SignIn,
    SignUp,
}

/// What a Ctrl+C press ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// A reply was in flight and has been cancelled.
    Turn,
    /// Nothing was in flight, so the chat loop should stop.
    Session,
}

/// Routes Ctrl+C presses for the lifetime of a terminal session.
#[derive(Clone, Default)]
pub struct InterruptRouter {
    in_flight: Arc<Mutex<Option<CancellationToken>>>,
    quit: CancellationToken,
}

impl InterruptRouter {
    pub fn interrupt(&self) -> Interrupted {
        match self.in_flight.lock().take() {
            Some(turn) => {
                turn.cancel();
                Interrupted::Turn
            }
            None => {
                self.quit.cancel();
                Interrupted::Session
            }
        }
    }

    /// Registers the token the next interrupt should cancel.
    pub fn begin_turn(&self) -> CancellationToken {
        let turn = CancellationToken::new();
        *self.in_flight.lock() = Some(turn.clone());
        turn
    }

    pub fn end_turn(&self) {
        self.in_flight.lock().take();
    }

    /// Cancelled once an interrupt arrives with nothing in flight.
    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    /// Installs one SIGINT listener that routes every press until the guard drops.
    pub fn listen(&self) -> InterruptListener {
        let router = self.clone();
        InterruptListener(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                let outcome = router.interrupt();
                tracing::debug!(?outcome, "interrupt received");
            }
        }))
    }
}

pub struct InterruptListener(JoinHandle<()>);

impl Drop for InterruptListener {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Terminal session: the shared state plus the printer draining its render channel.
pub struct ParleyApp {
    state: AppState,
    events: UnboundedReceiver<RenderEvent>,
    renderer: TerminalRenderer<Stdout>,
    interrupts: InterruptRouter,
}

impl ParleyApp {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let store = FileStore::new(settings.data_dir.clone())
            .with_context(|| format!("failed to open {}", settings.data_dir.display()))?;
        let backend = HttpBackend::new(&settings.base_url, settings.streaming)?;
        let (render, events) = RenderChannel::new();
        let state = AppState::new(settings, Arc::new(store), Arc::new(backend), render);
        let renderer = TerminalRenderer::stdout(state.theme());
        Ok(Self {
            state,
            events,
            renderer,
            interrupts: InterruptRouter::default(),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Restores the session and loads chats; `false` means the user must authenticate first.
    pub async fn start(&mut self) -> Result<bool> {
        let state = self.state.clone();
        let view = self
            .renderer
            .drive(&mut self.events, state.startup())
            .await?;
        Ok(view == StartupView::Conversation)
    }

    /// Start-up, falling back to the authentication prompt when a session is required.
    pub async fn resume(&mut self) -> Result<bool> {
        if self.start().await? {
            return Ok(true);
        }
        if !self.authenticate_interactively().await? {
            return Ok(false);
        }
        self.start().await
    }

    pub async fn authenticate(&mut self, mode: AuthMode) -> Result<bool> {
        let (email, password) = tokio::task::spawn_blocking(move || prompt_credentials(mode))
            .await
            .context("credential prompt failed")??;
        let state = self.state.clone();
        let outcome = match mode {
            AuthMode::SignIn => {
                self.renderer
                    .drive(&mut self.events, state.sign_in(&email, &password))
                    .await
            }
            AuthMode::SignUp => {
                self.renderer
                    .drive(&mut self.events, state.sign_up(&email, &password))
                    .await
            }
        }?;
        match outcome {
            AuthOutcome::SignedIn(user) => {
                println!("{} {}", style("Signed in as").green(), user.email);
                Ok(true)
            }
            AuthOutcome::ConfirmationPending(message) => {
                println!("{}", style(message).yellow());
                Ok(false)
            }
        }
    }

    /// Loops on the sign-in / sign-up choice until a session exists or the user gives up.
    pub async fn authenticate_interactively(&mut self) -> Result<bool> {
        loop {
            let choice = tokio::task::spawn_blocking(|| {
                Select::with_theme(&ColorfulTheme::default())
                    .with_prompt("Authentication required")
                    .items(&["Sign in", "Sign up", "Quit"])
                    .default(0)
                    .interact()
            })
            .await??;
            let mode = match choice {
                0 => AuthMode::SignIn,
                1 => AuthMode::SignUp,
                _ => return Ok(false),
            };
            match self.authenticate(mode).await {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(err) => println!("{} {err}", style("✗").red()),
            }
        }
    }

    pub async fn logout(&mut self) {
        let state = self.state.clone();
        self.renderer.drive(&mut self.events, state.logout()).await;
    }

    pub fn print_chats(&self) {
        print_summaries(&self.state.registry().summaries());
    }

    pub fn listen_for_interrupts(&self) -> InterruptListener {
        self.interrupts.listen()
    }

    /// Sends one message. An interrupt while it is in flight cancels it.
    pub async fn send(&mut self, text: &str) -> Result<()> {
        let cancel = self.interrupts.begin_turn();
        let state = self.state.clone();
        let result = self
            .renderer
            .drive(&mut self.events, state.send_message_cancellable(text, cancel))
            .await;
        self.interrupts.end_turn();
        if let Err(err) = &result {
            error!(%err, "message not delivered");
        }
        result.map(|_| ())?;
        Ok(())
    }

    pub async fn run_chat(&mut self) -> Result<()> {
        println!(
            "{}",
            style("Type a message, or /help for commands.").dim()
        );
        let _listener = self.listen_for_interrupts();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let quit = self.interrupts.quit_token();
        loop {
            print_prompt();
            let line = tokio::select! {
                biased;
                _ = quit.cancelled() => None,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                println!();
                break;
            };
            match commands::parse(&line) {
                None => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    // Failures are already shown as an error bubble.
                    let _ = self.send(&line).await;
                }
                Some(ChatCommand::Quit) => break,
                Some(command) => {
                    let signed_out = command == ChatCommand::Logout;
                    if let Err(err) = self.run_command(command).await {
                        println!("{} {err}", style("✗").red());
                    }
                    if signed_out && !self.resume().await? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_command(&mut self, command: ChatCommand) -> Result<()> {
        let state = self.state.clone();
        let registry = state.registry();
        match command {
            ChatCommand::Help => commands::print_help(),
            ChatCommand::New => {
                self.renderer
                    .drive(&mut self.events, registry.create_session(None))
                    .await?;
            }
            ChatCommand::List => self.print_chats(),
            ChatCommand::Select(n) => {
                let id = chat_at(&registry.summaries(), n)?;
                self.renderer
                    .drive(&mut self.events, async { registry.select_session(&id) })
                    .await?;
            }
            ChatCommand::Delete(n) => {
                let id = chat_at(&registry.summaries(), n)?;
                self.renderer
                    .drive(&mut self.events, registry.delete_session(&id))
                    .await?;
                println!("{}", style("Chat deleted").dim());
            }
            ChatCommand::Theme(theme) => {
                state.set_theme(theme)?;
                self.renderer.set_theme(theme);
                println!("Theme set to {theme}");
            }
            ChatCommand::Refresh => {
                self.renderer
                    .drive(&mut self.events, registry.refresh_remote())
                    .await?;
                self.print_chats();
            }
            ChatCommand::Logout => {
                self.logout().await;
                println!("{}", style("Signed out").dim());
            }
            ChatCommand::Invalid(message) => bail!(message),
            ChatCommand::Quit => {}
        }
        Ok(())
    }
}

fn chat_at(summaries: &[ChatSummary], n: usize) -> Result<String> {
    summaries
        .get(n.saturating_sub(1))
        .map(|summary| summary.id.clone())
        .with_context(|| format!("there is no chat {n}, see /list"))
}

fn print_summaries(summaries: &[ChatSummary]) {
    if summaries.is_empty() {
        println!("{}", style("No chats yet").dim());
        return;
    }
    for (index, summary) in summaries.iter().enumerate() {
        let marker = if summary.active { "*" } else { " " };
        println!(
            "{marker} {:>2}. {}  {}",
            index + 1,
            summary.title,
            style(format!(
                "{} messages · {}",
                summary.message_count,
                summary.created_at.format("%Y-%m-%d %H:%M")
            ))
            .dim()
        );
    }
}

fn print_prompt() {
    use std::io::Write;
    print!("{} ", style(">").cyan().bold());
    let _ = std::io::stdout().flush();
}

fn prompt_credentials(mode: AuthMode) -> Result<(String, String)> {
    let theme = ColorfulTheme::default();
    let email: String = Input::with_theme(&theme)
        .with_prompt("Email")
        .interact_text()?;
    let mut password = Password::with_theme(&theme).with_prompt("Password");
    if mode == AuthMode::SignUp {
        password = password.with_confirmation("Confirm password", "Passwords do not match");
    }
    Ok((email.trim().to_string(), password.interact()?))
}
