use crate::api::{ChatBackend, HistoryEntry, RemoteChat, TransportError};
use crate::auth::AuthSessionManager;
use crate::render::{DisplayRole, RenderChannel, RenderEvent};
use crate::state::{ChatSession, ChatSummary, Message, MessageRole, MessageStatus};
use crate::store::{load_or_warn, SharedStore, CHATS_KEY, CURRENT_CHAT_KEY};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const LOCAL_TITLE_LIMIT: usize = 40;
pub const REMOTE_TITLE_LIMIT: usize = 50;

/// Whether chats live only in local persistence or behind the remote CRUD endpoints.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    #[default]
    Local,
    Remote,
}

impl RegistryMode {
    pub fn title_limit(self) -> usize {
        match self {
            Self::Local => LOCAL_TITLE_LIMIT,
            Self::Remote => REMOTE_TITLE_LIMIT,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("chat {0} does not exist")]
    UnknownChat(String),
    #[error("sign in to manage chats")]
    NotSignedIn,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub mode: RegistryMode,
    pub welcome_message: String,
    pub default_title: String,
}

/// First `limit` characters of `message`, with `...` when something was cut.
pub fn derive_title(message: &str, limit: usize) -> String {
    let trimmed = message.trim();
    let mut chars = trimmed.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// State captured when a user message is optimistically appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTurn {
    pub chat_id: String,
    pub history: Vec<HistoryEntry>,
    pub title_changed: bool,
}

#[derive(Default)]
struct RegistryInner {
    sessions: Vec<ChatSession>,
    current: Option<String>,
}

impl RegistryInner {
    fn position(&self, id: &str) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }

    fn current_mut(&mut self) -> Option<&mut ChatSession> {
        let id = self.current.clone()?;
        self.sessions.iter_mut().find(|s| s.id == id)
    }
}

/// Ordered (most recent first) collection of chat sessions plus the current selection.
#[derive(Clone)]
pub struct ChatRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    store: SharedStore,
    backend: Arc<dyn ChatBackend>,
    auth: AuthSessionManager,
    render: RenderChannel,
    options: Arc<RegistryOptions>,
}

impl ChatRegistry {
    pub fn load(
        store: SharedStore,
        backend: Arc<dyn ChatBackend>,
        auth: AuthSessionManager,
        render: RenderChannel,
        options: RegistryOptions,
    ) -> Self {
        let sessions = match options.mode {
            RegistryMode::Local => load_or_warn(store.as_ref(), CHATS_KEY)
                .and_then(|raw| {
                    serde_json::from_str::<Vec<ChatSession>>(&raw)
                        .map_err(|err| tracing::warn!(%err, "discarding unreadable chat collection"))
                        .ok()
                })
                .unwrap_or_default(),
            RegistryMode::Remote => Vec::new(),
        };
        let current = load_or_warn(store.as_ref(), CURRENT_CHAT_KEY)
            .filter(|id| sessions.iter().any(|s| &s.id == id));
        tracing::debug!(sessions = sessions.len(), mode = ?options.mode, "chat registry loaded");
        Self {
            inner: Arc::new(RwLock::new(RegistryInner { sessions, current })),
            store,
            backend,
            auth,
            render,
            options: Arc::new(options),
        }
    }

    pub fn mode(&self) -> RegistryMode {
        self.options.mode
    }

    pub fn default_title(&self) -> &str {
        &self.options.default_title
    }

    pub fn current_id(&self) -> Option<String> {
        self.inner.read().current.clone()
    }

    pub fn current_session(&self) -> Option<ChatSession> {
        let inner = self.inner.read();
        let id = inner.current.as_ref()?;
        inner.sessions.iter().find(|s| &s.id == id).cloned()
    }

    pub fn session(&self, id: &str) -> Option<ChatSession> {
        self.inner.read().sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summaries(&self) -> Vec<ChatSummary> {
        let inner = self.inner.read();
        inner
            .sessions
            .iter()
            .map(|s| ChatSummary {
                id: s.id.clone(),
                title: s.title.clone(),
                created_at: s.created_at,
                message_count: s.messages.len(),
                active: inner.current.as_deref() == Some(s.id.as_str()),
            })
            .collect()
    }

    /// Loads the collection and picks a selection, creating a chat when there is none.
    pub async fn bootstrap(&self) -> Result<(), RegistryError> {
        if self.mode() == RegistryMode::Remote {
            self.refresh_remote().await?;
        }
        if self.is_empty() {
            self.create_session(None).await?;
            return Ok(());
        }
        let target = {
            let inner = self.inner.read();
            inner
                .current
                .clone()
                .filter(|id| inner.position(id).is_some())
                .or_else(|| inner.sessions.first().map(|s| s.id.clone()))
        };
        match target {
            Some(id) => self.select_session(&id),
            None => Ok(()),
        }
    }

    /// Replaces the local collection with the server's, keeping messages already held.
    pub async fn refresh_remote(&self) -> Result<(), RegistryError> {
        if self.mode() != RegistryMode::Remote {
            return Ok(());
        }
        let token = self.bearer()?;
        let mut remote = self.backend.list_chats(&token).await?;
        remote.sort_by_key(|chat| std::cmp::Reverse(chat.updated_at_utc()));
        {
            let mut inner = self.inner.write();
            let sessions = remote
                .into_iter()
                .map(|chat| {
                    let messages = inner
                        .sessions
                        .iter()
                        .find(|s| s.id == chat.id)
                        .map(|s| s.messages.clone())
                        .unwrap_or_default();
                    let mut session = session_from_remote(chat);
                    session.messages = messages;
                    session
                })
                .collect::<Vec<_>>();
            inner.sessions = sessions;
            if let Some(current) = inner.current.clone() {
                if inner.position(&current).is_none() {
                    inner.current = None;
                }
            }
            self.persist(&inner);
        }
        self.render.emit(RenderEvent::ChatListChanged);
        Ok(())
    }

    /// Inserts a new session at the head and selects it. Remote mode waits for the server id.
    pub async fn create_session(&self, title: Option<&str>) -> Result<String, RegistryError> {
        let title = title.unwrap_or(&self.options.default_title).to_owned();
        let session = match self.mode() {
            RegistryMode::Local => ChatSession::new(title),
            RegistryMode::Remote => {
                let token = self.bearer()?;
                let created = self.backend.create_chat(&token, &title).await?;
                let mut session = session_from_remote(created);
                if session.title.is_empty() {
                    session.title = title;
                }
                session
            }
        };
        let id = session.id.clone();
        {
            let mut inner = self.inner.write();
            inner.sessions.insert(0, session);
            inner.current = Some(id.clone());
            self.persist(&inner);
        }
        tracing::debug!(chat_id = %id, "chat created");
        self.render.emit(RenderEvent::ChatListChanged);
        self.select_session(&id)?;
        Ok(id)
    }

    /// Removes a session. Deleting the last one creates a replacement.
    pub async fn delete_session(&self, id: &str) -> Result<bool, RegistryError> {
        if self.inner.read().position(id).is_none() {
            return Ok(false);
        }
        if self.mode() == RegistryMode::Remote {
            let token = self.bearer()?;
            self.backend.delete_chat(&token, id).await?;
        }
        let next = {
            let mut inner = self.inner.write();
            let Some(position) = inner.position(id) else {
                return Ok(false);
            };
            inner.sessions.remove(position);
            if inner.current.as_deref() == Some(id) {
                inner.current = inner.sessions.first().map(|s| s.id.clone());
            }
            self.persist(&inner);
            inner.current.clone()
        };
        tracing::debug!(chat_id = %id, "chat deleted");
        self.render.emit(RenderEvent::ChatListChanged);
        match next {
            Some(current) => self.select_session(&current)?,
            None => {
                self.create_session(None).await?;
            }
        }
        Ok(true)
    }

    /// Makes `id` current and replays its conversation from the start.
    pub fn select_session(&self, id: &str) -> Result<(), RegistryError> {
        let messages = {
            let mut inner = self.inner.write();
            let position = inner
                .position(id)
                .ok_or_else(|| RegistryError::UnknownChat(id.to_owned()))?;
            inner.current = Some(id.to_owned());
            self.persist_current(&inner);
            inner.sessions[position].messages.clone()
        };
        self.render.emit(RenderEvent::ConversationCleared);
        self.render.emit(RenderEvent::MessageAppended {
            role: DisplayRole::System,
            content: self.options.welcome_message.clone(),
        });
        for message in messages {
            let role = match message.role {
                MessageRole::User => DisplayRole::User,
                MessageRole::Model => DisplayRole::Ai,
                MessageRole::System => continue,
            };
            self.render.emit(RenderEvent::MessageAppended {
                role,
                content: message.content,
            });
        }
        Ok(())
    }

    /// Forgets every session and the selection, in memory and in persistence.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.write();
            inner.sessions.clear();
            inner.current = None;
        }
        for key in [CHATS_KEY, CURRENT_CHAT_KEY] {
            if let Err(err) = self.store.remove(key) {
                tracing::warn!(%err, key, "failed to remove persisted chat state");
            }
        }
        self.render.emit(RenderEvent::ChatListChanged);
    }

    /// Appends `text` to the current session as a pending user message.
    pub(crate) fn begin_turn(&self, text: &str) -> Option<PendingTurn> {
        let limit = self.mode().title_limit();
        let turn = {
            let mut inner = self.inner.write();
            let session = inner.current_mut()?;
            let history = session
                .messages
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .map(|m| HistoryEntry {
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect();
            let title_changed = !session.has_user_message();
            if title_changed {
                session.title = derive_title(text, limit);
            }
            session.messages.push(Message::pending_user(text));
            let turn = PendingTurn {
                chat_id: session.id.clone(),
                history,
                title_changed,
            };
            self.persist(&inner);
            turn
        };
        if turn.title_changed {
            self.render.emit(RenderEvent::ChatListChanged);
        }
        Some(turn)
    }

    /// Commits the model reply and confirms the pending user messages before it.
    pub(crate) fn commit_reply(&self, chat_id: &str, content: &str) {
        let mut inner = self.inner.write();
        let Some(position) = inner.position(chat_id) else {
            tracing::warn!(chat_id, "reply arrived for a chat that no longer exists");
            return;
        };
        let session = &mut inner.sessions[position];
        for message in session.messages.iter_mut().filter(|m| m.is_pending()) {
            message.status = MessageStatus::Confirmed;
        }
        session.messages.push(Message::new(MessageRole::Model, content));
        self.persist(&inner);
    }

    fn bearer(&self) -> Result<String, RegistryError> {
        self.auth.bearer().ok_or(RegistryError::NotSignedIn)
    }

    /// Local mode stores the whole collection; remote mode only the selection pointer.
    fn persist(&self, inner: &RegistryInner) {
        if self.mode() == RegistryMode::Local {
            match serde_json::to_string(&inner.sessions) {
                Ok(serialized) => {
                    if let Err(err) = self.store.save(CHATS_KEY, &serialized) {
                        tracing::warn!(%err, "failed to persist chats");
                    }
                }
                Err(err) => tracing::warn!(%err, "failed to serialize chats"),
            }
        }
        self.persist_current(inner);
    }

    fn persist_current(&self, inner: &RegistryInner) {
        let result = match &inner.current {
            Some(id) => self.store.save(CURRENT_CHAT_KEY, id),
            None => self.store.remove(CURRENT_CHAT_KEY),
        };
        if let Err(err) = result {
            tracing::warn!(%err, "failed to persist current chat");
        }
    }
}

fn session_from_remote(chat: RemoteChat) -> ChatSession {
    let created_at = chat.created_at_utc().unwrap_or_else(Utc::now);
    ChatSession {
        id: chat.id,
        title: chat.title,
        messages: Vec::new(),
        created_at,
    }
}
