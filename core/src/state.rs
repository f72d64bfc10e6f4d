use crate::api::ChatBackend;
use crate::auth::{AuthError, AuthOutcome, AuthSessionManager};
use crate::config::ClientSettings;
use crate::exchange::{ExchangeError, ExchangeOptions, MessageExchange, TurnReply};
use crate::registry::{ChatRegistry, RegistryError, RegistryOptions};
use crate::render::{RenderChannel, RenderEvent};
use crate::store::{load_or_warn, SharedStore, THEME_KEY};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Model,
    System,
}

/// `Pending` marks an optimistically appended user message whose reply has not been committed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    #[default]
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            status: MessageStatus::Confirmed,
        }
    }

    pub fn pending_user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            status: MessageStatus::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(rename = "createdAt", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(generate_chat_id(), title)
    }

    pub fn with_id(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            messages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn has_user_message(&self) -> bool {
        self.messages.iter().any(|m| m.role == MessageRole::User)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub active: bool,
}

/// Base-36 millisecond timestamp followed by a random suffix.
pub fn generate_chat_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let random = Uuid::new_v4().as_u128() as u64;
    format!("{}{}", to_base36(millis), to_base36(random))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    #[default]
    System,
    Light,
    Dark,
}

impl fmt::Display for ThemeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::System => "system",
            Self::Light => "light",
            Self::Dark => "dark",
        };
        f.write_str(name)
    }
}

impl FromStr for ThemeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            other => Err(format!("unknown theme '{other}'")),
        }
    }
}

/// What the front end should show after start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupView {
    Authenticate,
    Conversation,
}

/// Single owner of the auth manager, chat registry and message exchange.
#[derive(Clone)]
pub struct AppState {
    store: SharedStore,
    backend: Arc<dyn ChatBackend>,
    auth: AuthSessionManager,
    registry: ChatRegistry,
    exchange: MessageExchange,
    render: RenderChannel,
    require_auth: bool,
}

impl AppState {
    pub fn new(
        settings: &ClientSettings,
        store: SharedStore,
        backend: Arc<dyn ChatBackend>,
        render: RenderChannel,
    ) -> Self {
        let auth = AuthSessionManager::new(store.clone(), backend.clone());
        let registry = ChatRegistry::load(
            store.clone(),
            backend.clone(),
            auth.clone(),
            render.clone(),
            RegistryOptions {
                mode: settings.mode,
                welcome_message: settings.welcome_message.clone(),
                default_title: settings.default_title.clone(),
            },
        );
        let exchange = MessageExchange::new(
            registry.clone(),
            auth.clone(),
            backend.clone(),
            render.clone(),
            ExchangeOptions {
                request_timeout: settings.request_timeout,
                reveal: settings.reveal,
            },
        );
        Self {
            store,
            backend,
            auth,
            registry,
            exchange,
            render,
            require_auth: settings.require_auth,
        }
    }

    pub fn auth(&self) -> &AuthSessionManager {
        &self.auth
    }

    pub fn registry(&self) -> &ChatRegistry {
        &self.registry
    }

    pub fn exchange(&self) -> &MessageExchange {
        &self.exchange
    }

    pub fn backend(&self) -> Arc<dyn ChatBackend> {
        self.backend.clone()
    }

    pub fn requires_auth(&self) -> bool {
        self.require_auth
    }

    /// Restores the persisted session and decides between the auth flow and the conversation.
    pub async fn startup(&self) -> Result<StartupView, RegistryError> {
        self.auth.restore();
        if self.require_auth && !self.auth.is_signed_in() {
            return Ok(StartupView::Authenticate);
        }
        self.registry.bootstrap().await?;
        Ok(StartupView::Conversation)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthOutcome, AuthError> {
        let outcome = self.auth.sign_in(email, password).await?;
        self.after_authentication(&outcome).await;
        Ok(outcome)
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<AuthOutcome, AuthError> {
        let outcome = self.auth.sign_up(email, password).await?;
        self.after_authentication(&outcome).await;
        Ok(outcome)
    }

    async fn after_authentication(&self, outcome: &AuthOutcome) {
        if let AuthOutcome::SignedIn(_) = outcome {
            if let Err(err) = self.registry.bootstrap().await {
                tracing::warn!(%err, "failed to load chats after sign-in");
            }
        }
    }

    /// Clears identity, tokens and the identity-scoped chat registry.
    pub async fn logout(&self) {
        self.auth.sign_out().await;
        self.registry.clear();
        self.render.emit(RenderEvent::ConversationCleared);
    }

    pub async fn send_message(&self, text: &str) -> Result<TurnReply, ExchangeError> {
        self.exchange.send(text).await
    }

    pub async fn send_message_cancellable(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<TurnReply, ExchangeError> {
        self.exchange.send_with_cancel(text, cancel).await
    }

    pub fn theme(&self) -> ThemeMode {
        load_or_warn(self.store.as_ref(), THEME_KEY)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_theme(&self, theme: ThemeMode) -> Result<()> {
        self.store.save(THEME_KEY, &theme.to_string())
    }
}
