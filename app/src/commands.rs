//! Slash commands understood by the interactive chat loop.

use console::style;
use parley_core::ThemeMode;

#[derive(Debug, PartialEq)]
pub enum ChatCommand {
    Help,
    New,
    List,
    /// One-based position in the `/list` output.
    Select(usize),
    Delete(usize),
    Theme(ThemeMode),
    Refresh,
    Logout,
    Quit,
    /// Unknown command or bad argument, with the text to show.
    Invalid(String),
}

/// Returns `None` when `input` is a chat message rather than a command.
pub fn parse(input: &str) -> Option<ChatCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or_default().to_lowercase();
    let arg = parts.next().map(str::trim).filter(|arg| !arg.is_empty());

    let command = match cmd.as_str() {
        "/help" | "/h" | "/?" => ChatCommand::Help,
        "/new" => ChatCommand::New,
        "/list" | "/ls" => ChatCommand::List,
        "/select" | "/open" => {
            position(arg, "/select").map_or_else(ChatCommand::Invalid, ChatCommand::Select)
        }
        "/delete" | "/rm" => {
            position(arg, "/delete").map_or_else(ChatCommand::Invalid, ChatCommand::Delete)
        }
        "/theme" => match arg.map(str::parse::<ThemeMode>) {
            Some(Ok(theme)) => ChatCommand::Theme(theme),
            Some(Err(reason)) => ChatCommand::Invalid(reason),
            None => ChatCommand::Invalid("/theme requires system, light or dark".to_string()),
        },
        "/refresh" => ChatCommand::Refresh,
        "/logout" => ChatCommand::Logout,
        "/quit" | "/exit" | "/q" => ChatCommand::Quit,
        other => ChatCommand::Invalid(format!("unknown command {other}, try /help")),
    };
    Some(command)
}

fn position(arg: Option<&str>, name: &str) -> Result<usize, String> {
    match arg.map(str::parse::<usize>) {
        Some(Ok(n)) if n > 0 => Ok(n),
        _ => Err(format!("{name} requires a chat number from /list")),
    }
}

pub fn print_help() {
    let rows = [
        ("/help", "Show this help message"),
        ("/new", "Start a new chat"),
        ("/list", "List chats"),
        ("/select <n>", "Switch to chat n"),
        ("/delete <n>", "Delete chat n"),
        ("/theme <mode>", "Set theme: system, light or dark"),
        ("/refresh", "Reload chats from the server"),
        ("/logout", "Sign out and forget local chats"),
        ("/quit", "Leave the chat"),
    ];
    println!();
    println!("  {}", style("Available commands:").bold());
    println!();
    for (command, description) in rows {
        println!("  {:<15} {}", style(command).cyan(), description);
    }
    println!();
    println!("  {}", style("Ctrl+C cancels a reply in flight or leaves when idle, Ctrl+D leaves").dim());
    println!();
}
