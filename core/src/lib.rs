pub mod api;
pub mod auth;
pub mod config;
pub mod exchange;
pub mod mock;
pub mod registry;
pub mod render;
pub mod reveal;
pub mod state;
pub mod store;
pub mod stream;
pub mod telemetry;

pub use api::{ChatBackend, HttpBackend, TransportError};
pub use auth::{AuthError, AuthOutcome, AuthSessionManager, AuthState};
pub use config::{ClientSettings, ConfigError};
pub use exchange::{Delivery, ExchangeError, InputError, MessageExchange, TurnReply};
pub use mock::{MockBackend, ScriptedReply};
pub use registry::{ChatRegistry, RegistryError, RegistryMode};
pub use render::{DisplayRole, RenderChannel, RenderEvent};
pub use state::{AppState, ChatSession, Message, MessageRole, StartupView, ThemeMode};
pub use store::{FileStore, KeyValueStore, MemoryStore, SharedStore};
