pub mod app;
pub mod commands;
pub mod ui;

pub use app::{AuthMode, InterruptRouter, Interrupted, ParleyApp};
pub use commands::{parse, ChatCommand};
pub use ui::TerminalRenderer;
