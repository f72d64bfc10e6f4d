use parley_core::store::{ACCESS_TOKEN_KEY, CHATS_KEY, USER_KEY};
use parley_core::{
    AppState, AuthOutcome, ClientSettings, ExchangeError, FileStore, KeyValueStore, MessageRole,
    MockBackend, RegistryMode, RenderChannel, ScriptedReply, StartupView, ThemeMode,
    TransportError,
};
use parley_core::reveal::RevealCadence;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn settings(mode: RegistryMode, require_auth: bool) -> ClientSettings {
    ClientSettings {
        mode,
        require_auth: require_auth || mode == RegistryMode::Remote,
        request_timeout: Duration::from_secs(5),
        reveal: RevealCadence {
            chunk_chars: 3,
            tick: Duration::ZERO,
        },
        ..ClientSettings::default()
    }
}

fn open_store(dir: &TempDir) -> Arc<FileStore> {
    Arc::new(FileStore::new(dir.path().to_path_buf()).expect("file store"))
}

fn app(settings: &ClientSettings, store: Arc<FileStore>, backend: &MockBackend) -> AppState {
    AppState::new(
        settings,
        store,
        Arc::new(backend.clone()),
        RenderChannel::detached(),
    )
}

#[tokio::test]
async fn local_conversation_survives_restart() {
    let dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    let config = settings(RegistryMode::Local, false);

    let first = app(&config, open_store(&dir), &backend);
    assert_eq!(first.startup().await.unwrap(), StartupView::Conversation);
    backend.push_reply(ScriptedReply::Stream(vec!["Hi ".into(), "there".into()]));
    first.send_message("Hello there").await.expect("send");
    let chat_id = first.registry().current_id().expect("current chat");

    let second = app(&config, open_store(&dir), &backend);
    assert_eq!(second.startup().await.unwrap(), StartupView::Conversation);
    assert_eq!(second.registry().current_id().as_deref(), Some(chat_id.as_str()));
    let session = second.registry().current_session().expect("session");
    assert_eq!(session.title, "Hello there");
    let roles: Vec<MessageRole> = session.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Model]);
    assert_eq!(session.messages[1].content, "Hi there");
}

#[tokio::test]
async fn rate_limited_turn_keeps_only_the_user_message() {
    let dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    let config = settings(RegistryMode::Local, false);

    let first = app(&config, open_store(&dir), &backend);
    first.startup().await.unwrap();
    backend.push_reply(ScriptedReply::Status {
        status: 429,
        body: r#"{"error":"rate limited"}"#.into(),
    });
    let err = first.send_message("too fast").await.unwrap_err();
    assert_eq!(
        err,
        ExchangeError::Transport(TransportError::Status {
            status: 429,
            message: "rate limited".into()
        })
    );

    let second = app(&config, open_store(&dir), &backend);
    second.startup().await.unwrap();
    let messages = second.registry().current_session().unwrap().messages;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "too fast");
    assert_eq!(messages[0].role, MessageRole::User);
}

#[tokio::test]
async fn logout_clears_identity_and_chats() {
    let dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    backend.register_account("ada@example.com", "secret");
    let config = settings(RegistryMode::Local, true);

    let state = app(&config, open_store(&dir), &backend);
    assert_eq!(state.startup().await.unwrap(), StartupView::Authenticate);
    let outcome = state.sign_in("ada@example.com", "secret").await.unwrap();
    assert!(matches!(outcome, AuthOutcome::SignedIn(ref user) if user.email == "ada@example.com"));
    assert!(!state.registry().is_empty());
    state.send_message("remember me").await.expect("send");
    assert!(backend.chat_log()[0].bearer.is_some());

    state.logout().await;
    assert_eq!(backend.sign_out_calls(), 1);
    assert!(state.registry().is_empty());

    let store = open_store(&dir);
    for key in [CHATS_KEY, ACCESS_TOKEN_KEY, USER_KEY] {
        assert_eq!(store.load(key).unwrap(), None, "{key} should be cleared");
    }
    let restarted = app(&config, store, &backend);
    assert_eq!(restarted.startup().await.unwrap(), StartupView::Authenticate);
}

#[tokio::test]
async fn signed_in_session_is_restored_on_restart() {
    let dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    backend.register_account("ada@example.com", "secret");
    let config = settings(RegistryMode::Local, true);

    let first = app(&config, open_store(&dir), &backend);
    first.startup().await.unwrap();
    first.sign_in("ada@example.com", "secret").await.unwrap();

    let second = app(&config, open_store(&dir), &backend);
    assert_eq!(second.startup().await.unwrap(), StartupView::Conversation);
    assert_eq!(second.auth().user().unwrap().email, "ada@example.com");
}

#[tokio::test]
async fn wrong_password_keeps_user_signed_out() {
    let dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    backend.register_account("ada@example.com", "secret");
    let state = app(&settings(RegistryMode::Local, true), open_store(&dir), &backend);

    state.startup().await.unwrap();
    let err = state.sign_in("ada@example.com", "nope").await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid credentials");
    assert!(!state.auth().is_signed_in());
}

#[tokio::test]
async fn signup_awaiting_confirmation_issues_no_session() {
    let dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    backend.require_confirmation(true);
    let state = app(&settings(RegistryMode::Local, true), open_store(&dir), &backend);

    let outcome = state.sign_up("new@example.com", "pw").await.unwrap();
    assert_eq!(
        outcome,
        AuthOutcome::ConfirmationPending("Check email for confirmation".into())
    );
    assert!(!state.auth().is_signed_in());
    assert_eq!(state.startup().await.unwrap(), StartupView::Authenticate);
}

#[tokio::test]
async fn remote_mode_sends_chat_id_and_server_titles() {
    let dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    backend.register_account("ada@example.com", "secret");
    let state = app(&settings(RegistryMode::Remote, false), open_store(&dir), &backend);

    assert_eq!(state.startup().await.unwrap(), StartupView::Authenticate);
    state.sign_in("ada@example.com", "secret").await.unwrap();
    let chat_id = state.registry().current_id().expect("remote chat");
    assert_eq!(chat_id, "remote-1");

    let long = "a".repeat(60);
    state.send_message(&long).await.expect("send");
    let recorded = &backend.chat_log()[0];
    assert_eq!(recorded.request.chat_id.as_deref(), Some("remote-1"));
    assert!(recorded
        .bearer
        .as_deref()
        .is_some_and(|token| token.starts_with("access-")));
    let title = state.registry().current_session().unwrap().title;
    assert_eq!(title, format!("{}...", "a".repeat(50)));
}

#[tokio::test]
async fn theme_preference_persists() {
    let dir = TempDir::new().expect("temp dir");
    let backend = MockBackend::new();
    let config = settings(RegistryMode::Local, false);

    let first = app(&config, open_store(&dir), &backend);
    assert_eq!(first.theme(), ThemeMode::System);
    first.set_theme(ThemeMode::Dark).unwrap();

    let second = app(&config, open_store(&dir), &backend);
    assert_eq!(second.theme(), ThemeMode::Dark);
}
