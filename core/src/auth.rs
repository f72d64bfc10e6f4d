use crate::api::{AuthAction, AuthReply, AuthRequest, ChatBackend, TransportError, UserRecord};
use crate::store::{
    load_or_warn, SharedStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    Authenticating,
    LoggedIn,
}

/// Bearer token pair plus the identity it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    SignedIn(UserRecord),
    /// Sign-up accepted but the account needs confirmation; no token was issued.
    ConfirmationPending(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    Rejected(String),
    #[error("authentication request failed: {0}")]
    Transport(TransportError),
    #[error("an authentication request is already in progress")]
    Busy,
    #[error("not signed in")]
    NotSignedIn,
    #[error("authentication reply did not contain a session")]
    IncompleteReply,
    #[error("failed to persist session: {0}")]
    Persistence(String),
}

impl From<TransportError> for AuthError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Status { message, .. } => Self::Rejected(message),
            TransportError::Backend(message) => Self::Rejected(message),
            other => Self::Transport(other),
        }
    }
}

struct AuthInner {
    state: AuthState,
    session: Option<AuthSession>,
}

/// Owns the signed-in identity and its tokens.
#[derive(Clone)]
pub struct AuthSessionManager {
    inner: Arc<RwLock<AuthInner>>,
    store: SharedStore,
    backend: Arc<dyn ChatBackend>,
}

impl AuthSessionManager {
    pub fn new(store: SharedStore, backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(AuthInner {
                state: AuthState::LoggedOut,
                session: None,
            })),
            store,
            backend,
        }
    }

    pub fn state(&self) -> AuthState {
        self.inner.read().state
    }

    pub fn is_signed_in(&self) -> bool {
        self.state() == AuthState::LoggedIn
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.inner.read().session.clone()
    }

    pub fn user(&self) -> Option<UserRecord> {
        self.inner.read().session.as_ref().map(|s| s.user.clone())
    }

    pub fn bearer(&self) -> Option<String> {
        let inner = self.inner.read();
        match inner.state {
            AuthState::LoggedIn => inner.session.as_ref().map(|s| s.access_token.clone()),
            _ => None,
        }
    }

    /// Optimistic restore: persisted tokens are trusted until a request fails.
    pub fn restore(&self) -> AuthState {
        let store = self.store.as_ref();
        let access_token = load_or_warn(store, ACCESS_TOKEN_KEY);
        let refresh_token = load_or_warn(store, REFRESH_TOKEN_KEY).unwrap_or_default();
        let user = load_or_warn(store, USER_KEY).and_then(|raw| {
            serde_json::from_str::<UserRecord>(&raw)
                .map_err(|err| tracing::warn!(%err, "ignoring corrupt persisted user record"))
                .ok()
        });

        let mut inner = self.inner.write();
        match (access_token, user) {
            (Some(access_token), Some(user)) if !access_token.is_empty() => {
                inner.session = Some(AuthSession {
                    access_token,
                    refresh_token,
                    user,
                });
                inner.state = AuthState::LoggedIn;
            }
            _ => {
                inner.session = None;
                inner.state = AuthState::LoggedOut;
            }
        }
        inner.state
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthOutcome, AuthError> {
        self.authenticate(AuthAction::SignIn, email, password).await
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<AuthOutcome, AuthError> {
        self.authenticate(AuthAction::SignUp, email, password).await
    }

    async fn authenticate(
        &self,
        action: AuthAction,
        email: &str,
        password: &str,
    ) -> Result<AuthOutcome, AuthError> {
        let previous = {
            let mut inner = self.inner.write();
            if inner.state == AuthState::Authenticating {
                return Err(AuthError::Busy);
            }
            std::mem::replace(&mut inner.state, AuthState::Authenticating)
        };

        let request = AuthRequest::credentials(action, email.trim(), password);
        let result = match self.backend.authenticate(&request).await {
            Ok(reply) => self.apply_reply(reply),
            Err(err) => Err(AuthError::from(err)),
        };

        if !matches!(result, Ok(AuthOutcome::SignedIn(_))) {
            self.inner.write().state = previous;
        }
        match &result {
            Ok(AuthOutcome::SignedIn(user)) => {
                tracing::info!(user_id = %user.id, ?action, "signed in")
            }
            Ok(AuthOutcome::ConfirmationPending(_)) => {
                tracing::info!(?action, "sign-up awaiting confirmation")
            }
            Err(err) => tracing::warn!(%err, ?action, "authentication failed"),
        }
        result
    }

    fn apply_reply(&self, reply: AuthReply) -> Result<AuthOutcome, AuthError> {
        match reply {
            AuthReply {
                session: Some(tokens),
                user: Some(user),
                ..
            } => {
                let session = AuthSession {
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token,
                    user: user.clone(),
                };
                self.persist(&session)?;
                let mut inner = self.inner.write();
                inner.session = Some(session);
                inner.state = AuthState::LoggedIn;
                Ok(AuthOutcome::SignedIn(user))
            }
            AuthReply {
                message: Some(message),
                ..
            } => Ok(AuthOutcome::ConfirmationPending(message)),
            _ => Err(AuthError::IncompleteReply),
        }
    }

    /// Exchanges the stored refresh token for a new pair. Never called implicitly.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let current = self.session().ok_or(AuthError::NotSignedIn)?;
        if current.refresh_token.is_empty() {
            return Err(AuthError::NotSignedIn);
        }
        let reply = self
            .backend
            .authenticate(&AuthRequest::refresh(&current.refresh_token))
            .await?;
        let tokens = reply.session.ok_or(AuthError::IncompleteReply)?;
        let session = AuthSession {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            user: reply.user.unwrap_or(current.user),
        };
        self.persist(&session)?;
        let mut inner = self.inner.write();
        inner.session = Some(session);
        inner.state = AuthState::LoggedIn;
        tracing::debug!("access token refreshed");
        Ok(())
    }

    /// Tells the server (best effort) and then forgets every persisted credential.
    pub async fn sign_out(&self) {
        if self.session().is_some() {
            if let Err(err) = self.backend.authenticate(&AuthRequest::sign_out()).await {
                tracing::warn!(%err, "server sign-out failed; clearing local session anyway");
            }
        }
        self.clear_tokens();
    }

    pub fn clear_tokens(&self) {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY] {
            if let Err(err) = self.store.remove(key) {
                tracing::warn!(%err, key, "failed to remove persisted credential");
            }
        }
        let mut inner = self.inner.write();
        inner.session = None;
        inner.state = AuthState::LoggedOut;
    }

    /// Writes the three credential keys as a set; a partial write is rolled back.
    fn persist(&self, session: &AuthSession) -> Result<(), AuthError> {
        let user = serde_json::to_string(&session.user)
            .map_err(|err| AuthError::Persistence(err.to_string()))?;
        let writes = [
            (ACCESS_TOKEN_KEY, session.access_token.as_str()),
            (REFRESH_TOKEN_KEY, session.refresh_token.as_str()),
            (USER_KEY, user.as_str()),
        ];
        for (key, value) in writes {
            if let Err(err) = self.store.save(key, value) {
                for (written, _) in writes {
                    let _ = self.store.remove(written);
                }
                return Err(AuthError::Persistence(err.to_string()));
            }
        }
        Ok(())
    }
}
