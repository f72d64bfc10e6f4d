//! In-process backend used by tests and the xtask smoke run.

use crate::api::{
    AuthAction, AuthReply, AuthRequest, ChatBackend, ChatRequest, ModelInfo, RemoteChat,
    ResponseTransport, TokenPair, TransportError, UserRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Next reply the mock hands out for `/api/chat`.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Streamed raw text, one item per chunk.
    Stream(Vec<String>),
    /// Legacy `{response}` JSON body.
    Json(String),
    /// Complete plain body without an incremental reader.
    Plain(String),
    /// Non-success status with the given raw body.
    Status { status: u16, body: String },
    /// Connection-level failure before any status.
    NetworkFailure(String),
    /// Never answers.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedChat {
    pub request: ChatRequest,
    pub bearer: Option<String>,
}

#[derive(Default)]
struct MockInner {
    replies: VecDeque<ScriptedReply>,
    chat_log: Vec<RecordedChat>,
    accounts: HashMap<String, (String, String)>,
    refresh_tokens: HashMap<String, String>,
    require_confirmation: bool,
    sign_out_calls: usize,
    remote_chats: Vec<RemoteChat>,
    crud_tokens: Vec<String>,
    next_chat: usize,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<MockInner>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        self.inner.lock().replies.push_back(reply);
    }

    pub fn register_account(&self, email: &str, password: &str) {
        let id = format!("user-{}", Uuid::new_v4().simple());
        self.inner
            .lock()
            .accounts
            .insert(email.to_owned(), (password.to_owned(), id));
    }

    pub fn require_confirmation(&self, enabled: bool) {
        self.inner.lock().require_confirmation = enabled;
    }

    pub fn chat_log(&self) -> Vec<RecordedChat> {
        self.inner.lock().chat_log.clone()
    }

    pub fn chat_calls(&self) -> usize {
        self.inner.lock().chat_log.len()
    }

    pub fn sign_out_calls(&self) -> usize {
        self.inner.lock().sign_out_calls
    }

    pub fn remote_chats(&self) -> Vec<RemoteChat> {
        self.inner.lock().remote_chats.clone()
    }

    /// Bearer tokens seen by the chat CRUD endpoints, in call order.
    pub fn crud_tokens(&self) -> Vec<String> {
        self.inner.lock().crud_tokens.clone()
    }

    pub fn seed_remote_chat(&self, id: &str, title: &str) {
        self.inner.lock().remote_chats.push(RemoteChat {
            id: id.to_owned(),
            title: title.to_owned(),
            created_at: Some(Utc::now().to_rfc3339()),
            updated_at: Some(Utc::now().to_rfc3339()),
        });
    }

    fn issue_tokens(inner: &mut MockInner, user_id: &str) -> TokenPair {
        let pair = TokenPair {
            access_token: format!("access-{}", Uuid::new_v4().simple()),
            refresh_token: format!("refresh-{}", Uuid::new_v4().simple()),
        };
        inner
            .refresh_tokens
            .insert(pair.refresh_token.clone(), user_id.to_owned());
        pair
    }

    fn unauthorized() -> TransportError {
        TransportError::Status {
            status: 401,
            message: "Unauthorized".into(),
        }
    }
}

fn synthetic_reply(message: &str) -> Vec<String> {
    let reply = format!("[Mock] received '{message}'.");
    let chars: Vec<char> = reply.chars().collect();
    chars
        .chunks(8)
        .map(|piece| piece.iter().collect())
        .collect()
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthReply, TransportError> {
        let mut inner = self.inner.lock();
        let email = request.email.clone().unwrap_or_default();
        let password = request.password.clone().unwrap_or_default();
        match request.action {
            AuthAction::SignUp => {
                if inner.accounts.contains_key(&email) {
                    return Err(TransportError::Status {
                        status: 400,
                        message: "Signup failed".into(),
                    });
                }
                let id = format!("user-{}", Uuid::new_v4().simple());
                inner
                    .accounts
                    .insert(email.clone(), (password, id.clone()));
                if inner.require_confirmation {
                    return Ok(AuthReply {
                        session: None,
                        user: Some(UserRecord { email, id }),
                        message: Some("Check email for confirmation".into()),
                    });
                }
                let tokens = Self::issue_tokens(&mut inner, &id);
                Ok(AuthReply {
                    session: Some(tokens),
                    user: Some(UserRecord { email, id }),
                    message: Some("Signed up successfully".into()),
                })
            }
            AuthAction::SignIn => {
                let account = inner.accounts.get(&email).cloned();
                match account {
                    Some((expected, id)) if expected == password => {
                        let tokens = Self::issue_tokens(&mut inner, &id);
                        Ok(AuthReply {
                            session: Some(tokens),
                            user: Some(UserRecord { email, id }),
                            message: None,
                        })
                    }
                    _ => Err(TransportError::Status {
                        status: 401,
                        message: "Invalid credentials".into(),
                    }),
                }
            }
            AuthAction::Refresh => {
                let token = request.refresh_token.clone().unwrap_or_default();
                let owner = inner.refresh_tokens.remove(&token);
                match owner {
                    Some(user_id) => {
                        let tokens = Self::issue_tokens(&mut inner, &user_id);
                        Ok(AuthReply {
                            session: Some(tokens),
                            user: None,
                            message: None,
                        })
                    }
                    None => Err(TransportError::Status {
                        status: 401,
                        message: "Invalid refresh token".into(),
                    }),
                }
            }
            AuthAction::SignOut => {
                inner.sign_out_calls += 1;
                Ok(AuthReply {
                    message: Some("Signed out".into()),
                    ..AuthReply::default()
                })
            }
        }
    }

    async fn send_message(
        &self,
        request: &ChatRequest,
        bearer: Option<&str>,
    ) -> Result<ResponseTransport, TransportError> {
        let reply = {
            let mut inner = self.inner.lock();
            inner.chat_log.push(RecordedChat {
                request: request.clone(),
                bearer: bearer.map(str::to_owned),
            });
            inner.replies.pop_front()
        };
        let reply = reply.unwrap_or_else(|| ScriptedReply::Stream(synthetic_reply(&request.message)));
        match reply {
            ScriptedReply::Stream(chunks) => Ok(ResponseTransport::Streamed(
                stream::iter(chunks.into_iter().map(|chunk| Ok(chunk.into_bytes()))).boxed(),
            )),
            ScriptedReply::Json(response) => {
                let value = json!({ "response": response });
                Ok(ResponseTransport::LegacyJson {
                    raw: value.to_string(),
                    value: Some(value),
                })
            }
            ScriptedReply::Plain(text) => Ok(ResponseTransport::Buffered(text)),
            ScriptedReply::Status { status, body } => {
                Ok(ResponseTransport::Rejected { status, body })
            }
            ScriptedReply::NetworkFailure(reason) => Err(TransportError::Network(reason)),
            ScriptedReply::Hang => {
                futures::future::pending::<()>().await;
                Err(TransportError::Cancelled)
            }
        }
    }

    async fn list_chats(&self, bearer: &str) -> Result<Vec<RemoteChat>, TransportError> {
        if bearer.is_empty() {
            return Err(Self::unauthorized());
        }
        let mut inner = self.inner.lock();
        inner.crud_tokens.push(bearer.to_owned());
        let mut chats = inner.remote_chats.clone();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn create_chat(&self, bearer: &str, title: &str) -> Result<RemoteChat, TransportError> {
        if bearer.is_empty() {
            return Err(Self::unauthorized());
        }
        let mut inner = self.inner.lock();
        inner.crud_tokens.push(bearer.to_owned());
        inner.next_chat += 1;
        let now = Utc::now().to_rfc3339();
        let chat = RemoteChat {
            id: format!("remote-{}", inner.next_chat),
            title: title.to_owned(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
        };
        inner.remote_chats.push(chat.clone());
        Ok(chat)
    }

    async fn delete_chat(&self, bearer: &str, chat_id: &str) -> Result<(), TransportError> {
        if bearer.is_empty() {
            return Err(Self::unauthorized());
        }
        let mut inner = self.inner.lock();
        inner.crud_tokens.push(bearer.to_owned());
        let before = inner.remote_chats.len();
        inner.remote_chats.retain(|chat| chat.id != chat_id);
        if inner.remote_chats.len() == before {
            return Err(TransportError::Status {
                status: 404,
                message: "Chat not found".into(),
            });
        }
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
        Ok(vec![ModelInfo {
            name: "mock".into(),
            display_name: Some("Mock".into()),
            description: Some("Scripted in-process replies".into()),
        }])
    }
}
