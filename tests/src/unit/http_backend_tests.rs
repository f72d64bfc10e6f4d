//! Drives the real HTTP backend against an in-process server.

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream;
use parley_core::api::{AuthAction, AuthRequest};
use parley_core::reveal::RevealCadence;
use parley_core::{
    AppState, ChatBackend, ClientSettings, Delivery, ExchangeError, HttpBackend, MemoryStore,
    RegistryMode, RenderChannel, RenderEvent, StartupView, TransportError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

async fn chat(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let message = body["message"].as_str().unwrap_or_default();
    match message {
        "legacy" => Json(json!({ "response": "legacy hi" })).into_response(),
        "legacy-error" => Json(json!({ "error": "quota exhausted" })).into_response(),
        "limit" => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate limited" })),
        )
            .into_response(),
        "whoami" => {
            let bearer = headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("anonymous")
                .to_string();
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], bearer).into_response()
        }
        _ => {
            let history = body["history"].as_array().map(Vec::len).unwrap_or(0);
            let chunks = vec!["Hel".to_string(), "lo w".to_string(), format!("orld {history}")];
            let body = Body::from_stream(stream::iter(
                chunks.into_iter().map(Ok::<_, std::io::Error>),
            ));
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
        }
    }
}

async fn auth(Json(body): Json<Value>) -> Response {
    match body["action"].as_str() {
        Some("signin") if body["email"] == "ada@example.com" && body["password"] == "pw" => {
            Json(json!({
                "session": { "access_token": "tok-1", "refresh_token": "ref-1" },
                "user": { "id": "u1", "email": "ada@example.com" }
            }))
            .into_response()
        }
        Some("signout") => Json(json!({ "message": "Signed out" })).into_response(),
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid credentials" })),
        )
            .into_response(),
    }
}

async fn list_chats() -> Json<Value> {
    Json(json!({
        "chats": [
            { "id": "old", "title": "Older", "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-01-01T00:00:00Z" },
            { "id": "new", "title": "Newer", "created_at": "2024-02-01T00:00:00Z", "updated_at": "2024-03-01T00:00:00Z" }
        ]
    }))
}

async fn create_chat(Json(body): Json<Value>) -> Response {
    (
        StatusCode::CREATED,
        Json(json!({ "chat": { "id": "created", "title": body["title"] } })),
    )
        .into_response()
}

async fn delete_chat(Json(body): Json<Value>) -> Response {
    if body["chat_id"] == "missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Chat not found" })),
        )
            .into_response();
    }
    Json(json!({ "success": true })).into_response()
}

async fn models() -> Json<Value> {
    Json(json!({
        "models": [{
            "name": "gemini",
            "full_name": "models/gemini",
            "display_name": "Gemini",
            "description": "General purpose"
        }]
    }))
}

async fn model_names() -> Json<Value> {
    Json(json!({ "models": ["gemini-pro", "gemini-flash"] }))
}

async fn spawn_server() -> String {
    let router = Router::new()
        .route("/api/chat", post(chat))
        .route("/api/auth", post(auth))
        .route(
            "/api/chats",
            get(list_chats).post(create_chat).delete(delete_chat),
        )
        .route("/api/models", get(models))
        .route("/names/api/models", get(model_names));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server");
    });
    format!("http://{addr}")
}

fn local_state(base_url: &str) -> (AppState, tokio::sync::mpsc::UnboundedReceiver<RenderEvent>) {
    let settings = ClientSettings {
        base_url: base_url.to_string(),
        mode: RegistryMode::Local,
        reveal: RevealCadence {
            chunk_chars: 4,
            tick: Duration::ZERO,
        },
        ..ClientSettings::default()
    };
    let backend = HttpBackend::new(base_url, settings.streaming).expect("backend");
    let (render, rx) = RenderChannel::new();
    let state = AppState::new(
        &settings,
        Arc::new(MemoryStore::new()),
        Arc::new(backend),
        render,
    );
    (state, rx)
}

#[tokio::test]
async fn streamed_plain_text_is_assembled() {
    let base = spawn_server().await;
    let (state, mut rx) = local_state(&base);
    assert_eq!(state.startup().await.unwrap(), StartupView::Conversation);

    let reply = state.send_message("hello").await.expect("reply");
    assert_eq!(reply.delivery, Delivery::Streamed);
    assert_eq!(reply.content, "Hello world 0");

    let mut completed = None;
    while let Ok(event) = rx.try_recv() {
        if let RenderEvent::ResponseCompleted { text } = event {
            completed = Some(text);
        }
    }
    assert_eq!(completed.as_deref(), Some("Hello world 0"));

    let second = state.send_message("again").await.expect("reply");
    assert_eq!(second.content, "Hello world 2");
}

#[tokio::test]
async fn json_reply_takes_the_legacy_path() {
    let base = spawn_server().await;
    let (state, _rx) = local_state(&base);
    state.startup().await.unwrap();

    let reply = state.send_message("legacy").await.expect("reply");
    assert_eq!(reply.delivery, Delivery::LegacyJson);
    assert_eq!(reply.content, "legacy hi");

    let err = state.send_message("legacy-error").await.unwrap_err();
    assert_eq!(
        err,
        ExchangeError::Transport(TransportError::Backend("quota exhausted".into()))
    );
}

#[tokio::test]
async fn rate_limit_surfaces_server_message() {
    let base = spawn_server().await;
    let (state, _rx) = local_state(&base);
    state.startup().await.unwrap();

    let err = state.send_message("limit").await.unwrap_err();
    assert_eq!(
        err,
        ExchangeError::Transport(TransportError::Status {
            status: 429,
            message: "rate limited".into()
        })
    );
    let messages = state.registry().current_session().unwrap().messages;
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn bearer_token_follows_sign_in() {
    let base = spawn_server().await;
    let (state, _rx) = local_state(&base);
    state.startup().await.unwrap();

    let anonymous = state.send_message("whoami").await.expect("reply");
    assert_eq!(anonymous.content, "anonymous");

    assert!(state.sign_in("ada@example.com", "wrong").await.is_err());
    state.sign_in("ada@example.com", "pw").await.expect("sign in");
    let signed = state.send_message("whoami").await.expect("reply");
    assert_eq!(signed.content, "Bearer tok-1");
}

#[tokio::test]
async fn buffered_reply_is_revealed_when_streaming_is_off() {
    let base = spawn_server().await;
    let backend = HttpBackend::new(&base, false).expect("backend");
    let settings = ClientSettings {
        base_url: base.clone(),
        streaming: false,
        reveal: RevealCadence {
            chunk_chars: 4,
            tick: Duration::ZERO,
        },
        ..ClientSettings::default()
    };
    let state = AppState::new(
        &settings,
        Arc::new(MemoryStore::new()),
        Arc::new(backend),
        RenderChannel::detached(),
    );
    state.startup().await.unwrap();

    let reply = state.send_message("hello").await.expect("reply");
    assert_eq!(reply.delivery, Delivery::Revealed);
    assert_eq!(reply.content, "Hello world 0");
}

#[tokio::test]
async fn chat_crud_and_models_round_trip() {
    let base = spawn_server().await;
    let backend = HttpBackend::new(&base, true).expect("backend");

    let chats = backend.list_chats("tok-1").await.expect("list");
    assert_eq!(chats.len(), 2);
    assert!(chats[1].updated_at_utc() > chats[0].updated_at_utc());

    let created = backend.create_chat("tok-1", "Fresh").await.expect("create");
    assert_eq!(created.id, "created");
    assert_eq!(created.title, "Fresh");

    backend.delete_chat("tok-1", "old").await.expect("delete");
    let err = backend.delete_chat("tok-1", "missing").await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(err.to_string(), "Chat not found");

    let models = backend.list_models().await.expect("models");
    assert_eq!(models[0].name, "gemini");
    assert_eq!(models[0].display_name.as_deref(), Some("Gemini"));

    let reply = backend
        .authenticate(&AuthRequest::credentials(
            AuthAction::SignIn,
            "ada@example.com",
            "pw",
        ))
        .await
        .expect("auth");
    assert_eq!(reply.session.unwrap().access_token, "tok-1");
}

#[tokio::test]
async fn models_listed_by_name_are_accepted() {
    let base = spawn_server().await;
    let backend = HttpBackend::new(&format!("{base}/names"), true).expect("backend");

    let models = backend.list_models().await.expect("models");
    let names: Vec<_> = models.iter().map(|model| model.name.as_str()).collect();
    assert_eq!(names, vec!["gemini-pro", "gemini-flash"]);
    assert!(models[0].description.is_none());
}
