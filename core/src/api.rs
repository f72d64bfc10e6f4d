use crate::state::MessageRole;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

pub const CHAT_PATH: &str = "api/chat";
pub const AUTH_PATH: &str = "api/auth";
pub const CHATS_PATH: &str = "api/chats";
pub const MODELS_PATH: &str = "api/models";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Backend(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// One `{role, content}` pair of upstream history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub message: String,
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuthAction {
    #[serde(rename = "signin")]
    SignIn,
    #[serde(rename = "signup")]
    SignUp,
    #[serde(rename = "refresh")]
    Refresh,
    #[serde(rename = "signout")]
    SignOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthRequest {
    pub action: AuthAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl AuthRequest {
    pub fn credentials(action: AuthAction, email: &str, password: &str) -> Self {
        Self {
            action,
            email: Some(email.to_owned()),
            password: Some(password.to_owned()),
            refresh_token: None,
        }
    }

    pub fn refresh(refresh_token: &str) -> Self {
        Self {
            action: AuthAction::Refresh,
            email: None,
            password: None,
            refresh_token: Some(refresh_token.to_owned()),
        }
    }

    pub fn sign_out() -> Self {
        Self {
            action: AuthAction::SignOut,
            email: None,
            password: None,
            refresh_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    #[serde(default)]
    pub email: String,
    pub id: String,
}

/// Successful body of `/api/auth`. Which fields are present depends on the action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthReply {
    #[serde(default)]
    pub session: Option<TokenPair>,
    #[serde(default)]
    pub user: Option<UserRecord>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteChat {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl RemoteChat {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.created_at.as_deref())
    }

    pub fn updated_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.updated_at.as_deref())
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// How the body of a `/api/chat` reply has to be consumed.
pub enum ResponseTransport {
    /// Non-success status; `body` is the raw error body.
    Rejected { status: u16, body: String },
    /// Raw assistant text delivered incrementally.
    Streamed(ByteStream),
    /// `{response}` envelope. `value` is `None` when the body was not valid JSON.
    LegacyJson { raw: String, value: Option<Value> },
    /// Complete plain-text body, no incremental reader.
    Buffered(String),
}

impl std::fmt::Debug for ResponseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { status, body } => f
                .debug_struct("Rejected")
                .field("status", status)
                .field("body", body)
                .finish(),
            Self::Streamed(_) => f.write_str("Streamed(..)"),
            Self::LegacyJson { raw, .. } => f.debug_struct("LegacyJson").field("raw", raw).finish(),
            Self::Buffered(text) => f.debug_tuple("Buffered").field(text).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Rejected,
    Streamed,
    LegacyJson,
    Buffered,
}

impl TransportKind {
    /// Status wins over headers; a JSON content type wins over streaming.
    pub fn classify(status: u16, content_type: Option<&str>, incremental: bool) -> Self {
        if !(200..300).contains(&status) {
            return Self::Rejected;
        }
        if content_type.map(is_json_content_type).unwrap_or(false) {
            return Self::LegacyJson;
        }
        if incremental {
            Self::Streamed
        } else {
            Self::Buffered
        }
    }
}

fn is_json_content_type(value: &str) -> bool {
    let essence = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// Error text of a rejected body: its JSON `error` field, else the raw body.
pub fn error_message_from_body(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return message.to_owned();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {status}")
    } else {
        trimmed.to_owned()
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthReply, TransportError>;

    async fn send_message(
        &self,
        request: &ChatRequest,
        bearer: Option<&str>,
    ) -> Result<ResponseTransport, TransportError>;

    async fn list_chats(&self, bearer: &str) -> Result<Vec<RemoteChat>, TransportError>;

    async fn create_chat(&self, bearer: &str, title: &str) -> Result<RemoteChat, TransportError>;

    async fn delete_chat(&self, bearer: &str, chat_id: &str) -> Result<(), TransportError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError>;
}

/// `reqwest` implementation of [`ChatBackend`].
#[derive(Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base: Url,
    streaming: bool,
}

#[derive(Deserialize)]
struct ChatsEnvelope {
    #[serde(default)]
    chats: Vec<RemoteChat>,
}

#[derive(Deserialize)]
struct ChatEnvelope {
    chat: RemoteChat,
}

#[derive(Deserialize)]
struct ModelsEnvelope {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

/// Servers list models either as bare names or as described objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum ModelEntry {
    Name(String),
    Detailed(ModelInfo),
}

impl From<ModelEntry> for ModelInfo {
    fn from(entry: ModelEntry) -> Self {
        match entry {
            ModelEntry::Name(name) => ModelInfo {
                name,
                display_name: None,
                description: None,
            },
            ModelEntry::Detailed(info) => info,
        }
    }
}

impl HttpBackend {
    pub fn new(base_url: &str, streaming: bool) -> Result<Self, TransportError> {
        let mut base =
            Url::parse(base_url).map_err(|err| TransportError::Endpoint(err.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base,
            streaming,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|err| TransportError::Endpoint(err.to_string()))
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(TransportError::Status {
            status: status.as_u16(),
            message: error_message_from_body(status.as_u16(), &body),
        });
    }
    serde_json::from_str(&body).map_err(|err| TransportError::Malformed(err.to_string()))
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthReply, TransportError> {
        let response = self
            .http
            .post(self.endpoint(AUTH_PATH)?)
            .json(request)
            .send()
            .await?;
        read_json(response).await
    }

    async fn send_message(
        &self,
        request: &ChatRequest,
        bearer: Option<&str>,
    ) -> Result<ResponseTransport, TransportError> {
        let mut builder = self.http.post(self.endpoint(CHAT_PATH)?).json(request);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let kind = TransportKind::classify(status, content_type.as_deref(), self.streaming);
        tracing::debug!(status, content_type = ?content_type, ?kind, "chat reply received");

        let transport = match kind {
            TransportKind::Rejected => ResponseTransport::Rejected {
                status,
                body: response.text().await?,
            },
            TransportKind::Streamed => ResponseTransport::Streamed(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(TransportError::from))
                    .boxed(),
            ),
            TransportKind::LegacyJson => {
                let raw = response.text().await?;
                let value = serde_json::from_str(&raw).ok();
                ResponseTransport::LegacyJson { raw, value }
            }
            TransportKind::Buffered => ResponseTransport::Buffered(response.text().await?),
        };
        Ok(transport)
    }

    async fn list_chats(&self, bearer: &str) -> Result<Vec<RemoteChat>, TransportError> {
        let response = self
            .http
            .get(self.endpoint(CHATS_PATH)?)
            .bearer_auth(bearer)
            .send()
            .await?;
        let envelope: ChatsEnvelope = read_json(response).await?;
        Ok(envelope.chats)
    }

    async fn create_chat(&self, bearer: &str, title: &str) -> Result<RemoteChat, TransportError> {
        let response = self
            .http
            .post(self.endpoint(CHATS_PATH)?)
            .bearer_auth(bearer)
            .json(&json!({ "title": title }))
            .send()
            .await?;
        let envelope: ChatEnvelope = read_json(response).await?;
        Ok(envelope.chat)
    }

    async fn delete_chat(&self, bearer: &str, chat_id: &str) -> Result<(), TransportError> {
        let response = self
            .http
            .delete(self.endpoint(CHATS_PATH)?)
            .bearer_auth(bearer)
            .json(&json!({ "chat_id": chat_id }))
            .send()
            .await?;
        let _: Value = read_json(response).await?;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
        let response = self.http.get(self.endpoint(MODELS_PATH)?).send().await?;
        let envelope: ModelsEnvelope = read_json(response).await?;
        Ok(envelope.models.into_iter().map(ModelInfo::from).collect())
    }
}
