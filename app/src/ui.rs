//! Terminal presentation of render events.

use console::Style;
use parley_core::{DisplayRole, RenderEvent, ThemeMode};
use std::future::Future;
use std::io::{self, Stdout, Write};
use tokio::sync::mpsc::UnboundedReceiver;

const CLEAR_LINE: &str = "\r\x1b[2K";

#[derive(Debug, Clone)]
pub struct Palette {
    pub accent: Style,
    pub user: Style,
    pub muted: Style,
    pub error: Style,
}

impl Palette {
    pub fn for_theme(theme: ThemeMode) -> Self {
        let accent = match theme {
            ThemeMode::Light => Style::new().blue().bold(),
            ThemeMode::Dark | ThemeMode::System => Style::new().cyan().bold(),
        };
        let user = match theme {
            ThemeMode::Light => Style::new().magenta().bold(),
            ThemeMode::Dark | ThemeMode::System => Style::new().green().bold(),
        };
        Self {
            accent,
            user,
            muted: Style::new().dim(),
            error: Style::new().red(),
        }
    }
}

/// Prints events as they arrive. Streaming updates carry the whole text so far,
/// so only the unseen suffix is written.
pub struct TerminalRenderer<W: Write> {
    out: W,
    palette: Palette,
    shown: String,
    loading: bool,
}

impl TerminalRenderer<Stdout> {
    pub fn stdout(theme: ThemeMode) -> Self {
        Self::new(io::stdout(), theme)
    }
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W, theme: ThemeMode) -> Self {
        Self {
            out,
            palette: Palette::for_theme(theme),
            shown: String::new(),
            loading: false,
        }
    }

    pub fn set_theme(&mut self, theme: ThemeMode) {
        self.palette = Palette::for_theme(theme);
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn show(&mut self, event: RenderEvent) {
        if let Err(err) = self.write_event(event) {
            tracing::warn!(%err, "failed to write to terminal");
        }
    }

    /// Prints everything already queued without waiting.
    pub fn drain(&mut self, rx: &mut UnboundedReceiver<RenderEvent>) {
        while let Ok(event) = rx.try_recv() {
            self.show(event);
        }
    }

    /// Runs `fut` to completion while printing events it produces.
    pub async fn drive<F: Future>(
        &mut self,
        rx: &mut UnboundedReceiver<RenderEvent>,
        fut: F,
    ) -> F::Output {
        tokio::pin!(fut);
        let output = loop {
            tokio::select! {
                output = &mut fut => break output,
                Some(event) = rx.recv() => self.show(event),
            }
        };
        self.drain(rx);
        output
    }

    fn label(&self, role: DisplayRole) -> String {
        match role {
            DisplayRole::System => self.palette.muted.apply_to("system ▸").to_string(),
            DisplayRole::User => self.palette.user.apply_to("you ▸").to_string(),
            DisplayRole::Ai => self.palette.accent.apply_to("ai ▸").to_string(),
        }
    }

    fn write_event(&mut self, event: RenderEvent) -> io::Result<()> {
        match event {
            RenderEvent::ConversationCleared => {
                self.shown.clear();
                writeln!(self.out)?;
                writeln!(self.out, "{}", self.palette.muted.apply_to("────────"))?;
            }
            RenderEvent::MessageAppended { role, content } => {
                writeln!(self.out, "{} {content}", self.label(role))?;
            }
            RenderEvent::TurnFailed { message } => {
                writeln!(
                    self.out,
                    "{} {}",
                    self.label(DisplayRole::Ai),
                    self.palette.error.apply_to(format!("Error: {message}"))
                )?;
            }
            RenderEvent::LoadingStarted => {
                self.loading = true;
                write!(
                    self.out,
                    "{} {}",
                    self.label(DisplayRole::Ai),
                    self.palette.muted.apply_to("thinking...")
                )?;
            }
            RenderEvent::LoadingCleared => {
                if self.loading {
                    self.loading = false;
                    write!(self.out, "{CLEAR_LINE}")?;
                }
            }
            RenderEvent::ResponseStarted => {
                self.shown.clear();
                write!(self.out, "{} ", self.label(DisplayRole::Ai))?;
            }
            RenderEvent::ResponseUpdated { text } => self.write_suffix(text)?,
            RenderEvent::ResponseCompleted { text } => {
                self.write_suffix(text)?;
                self.shown.clear();
                writeln!(self.out)?;
            }
            RenderEvent::ChatListChanged => {}
        }
        self.out.flush()
    }

    fn write_suffix(&mut self, text: String) -> io::Result<()> {
        match text.strip_prefix(self.shown.as_str()) {
            Some(suffix) => write!(self.out, "{suffix}")?,
            None => write!(self.out, "\n{text}")?,
        }
        self.shown = text;
        Ok(())
    }
}
