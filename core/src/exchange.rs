use crate::api::{
    error_message_from_body, ChatBackend, ChatRequest, ResponseTransport, TransportError,
};
use crate::auth::AuthSessionManager;
use crate::registry::{ChatRegistry, RegistryMode};
use crate::render::{DisplayRole, LoadingPlaceholder, RenderChannel, RenderEvent};
use crate::reveal::{RevealCadence, RevealScheduler};
use crate::stream::StreamConsumer;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    pub request_timeout: Duration,
    pub reveal: RevealCadence,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reveal: RevealCadence::default(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("no chat is selected")]
    NoChatSelected,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Which path delivered the reply text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Streamed,
    LegacyJson,
    Revealed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    pub chat_id: String,
    pub content: String,
    pub delivery: Delivery,
}

/// Sends one user message and reconciles the reply into the registry.
#[derive(Clone)]
pub struct MessageExchange {
    registry: ChatRegistry,
    auth: AuthSessionManager,
    backend: Arc<dyn ChatBackend>,
    render: RenderChannel,
    options: ExchangeOptions,
}

impl MessageExchange {
    pub fn new(
        registry: ChatRegistry,
        auth: AuthSessionManager,
        backend: Arc<dyn ChatBackend>,
        render: RenderChannel,
        options: ExchangeOptions,
    ) -> Self {
        Self {
            registry,
            auth,
            backend,
            render,
            options,
        }
    }

    pub async fn send(&self, input: &str) -> Result<TurnReply, ExchangeError> {
        self.send_with_cancel(input, CancellationToken::new()).await
    }

    pub async fn send_with_cancel(
        &self,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<TurnReply, ExchangeError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(InputError::EmptyMessage.into());
        }
        let turn = self
            .registry
            .begin_turn(text)
            .ok_or(InputError::NoChatSelected)?;
        self.render.emit(RenderEvent::MessageAppended {
            role: DisplayRole::User,
            content: text.to_owned(),
        });

        let request = ChatRequest {
            message: text.to_owned(),
            history: turn.history,
            chat_id: (self.registry.mode() == RegistryMode::Remote).then(|| turn.chat_id.clone()),
        };
        let mut placeholder = LoadingPlaceholder::show(&self.render);
        let outcome = self.run_turn(&request, &mut placeholder, &cancel).await;
        placeholder.remove();

        match outcome {
            Ok((content, delivery)) => {
                self.registry.commit_reply(&turn.chat_id, &content);
                tracing::debug!(chat_id = %turn.chat_id, ?delivery, chars = content.len(), "turn committed");
                Ok(TurnReply {
                    chat_id: turn.chat_id,
                    content,
                    delivery,
                })
            }
            Err(err) => {
                tracing::warn!(%err, chat_id = %turn.chat_id, "turn failed");
                self.render.emit(RenderEvent::TurnFailed {
                    message: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    /// The request timeout bounds the backend call only. Stream bodies are
    /// bounded per chunk and a reveal is bounded by cancellation alone.
    async fn run_turn(
        &self,
        request: &ChatRequest,
        placeholder: &mut LoadingPlaceholder,
        cancel: &CancellationToken,
    ) -> Result<(String, Delivery), TransportError> {
        let bearer = self.auth.bearer();
        let timeout = self.options.request_timeout;
        let exchange = async {
            let transport =
                tokio::time::timeout(timeout, self.backend.send_message(request, bearer.as_deref()))
                    .await
                    .unwrap_or(Err(TransportError::Timeout(timeout)))?;
            self.deliver(transport, placeholder).await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = exchange => result,
        }
    }

    async fn deliver(
        &self,
        transport: ResponseTransport,
        placeholder: &mut LoadingPlaceholder,
    ) -> Result<(String, Delivery), TransportError> {
        match transport {
            ResponseTransport::Rejected { status, body } => Err(TransportError::Status {
                status,
                message: error_message_from_body(status, &body),
            }),
            ResponseTransport::Streamed(stream) => {
                placeholder.remove();
                let text = StreamConsumer::new(&self.render)
                    .with_idle_timeout(self.options.request_timeout)
                    .consume(stream)
                    .await?;
                Ok((text, Delivery::Streamed))
            }
            ResponseTransport::LegacyJson { raw, value } => {
                let text = legacy_reply_text(&raw, value.as_ref())?;
                placeholder.remove();
                self.render.emit(RenderEvent::MessageAppended {
                    role: DisplayRole::Ai,
                    content: text.clone(),
                });
                Ok((text, Delivery::LegacyJson))
            }
            ResponseTransport::Buffered(text) => {
                placeholder.remove();
                RevealScheduler::new(self.options.reveal)
                    .reveal(&text, &self.render)
                    .await;
                Ok((text, Delivery::Revealed))
            }
        }
    }
}

/// `response` field of a legacy body; an `error` field without it fails the turn.
fn legacy_reply_text(raw: &str, value: Option<&Value>) -> Result<String, TransportError> {
    let Some(value) = value else {
        return Ok(raw.to_owned());
    };
    if let Some(response) = value.get("response").and_then(Value::as_str) {
        return Ok(response.to_owned());
    }
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(TransportError::Backend(error.to_owned()));
    }
    Ok(raw.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, ScriptedReply};
    use crate::registry::RegistryOptions;
    use crate::render::drain;
    use crate::state::{MessageRole, MessageStatus};
    use crate::store::{MemoryStore, SharedStore};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        exchange: MessageExchange,
        registry: ChatRegistry,
        backend: MockBackend,
        rx: UnboundedReceiver<RenderEvent>,
    }

    async fn harness(options: ExchangeOptions) -> Harness {
        let backend = MockBackend::new();
        let backend_dyn: Arc<dyn ChatBackend> = Arc::new(backend.clone());
        let store: SharedStore = Arc::new(MemoryStore::new());
        let auth = AuthSessionManager::new(store.clone(), backend_dyn.clone());
        let (render, rx) = RenderChannel::new();
        let registry = ChatRegistry::load(
            store,
            backend_dyn.clone(),
            auth.clone(),
            render.clone(),
            RegistryOptions {
                mode: RegistryMode::Local,
                welcome_message: "Welcome.".into(),
                default_title: "New chat".into(),
            },
        );
        registry.create_session(None).await.unwrap();
        let exchange = MessageExchange::new(registry.clone(), auth, backend_dyn, render, options);
        let mut harness = Harness {
            exchange,
            registry,
            backend,
            rx,
        };
        drain(&mut harness.rx);
        harness
    }

    fn fast() -> ExchangeOptions {
        ExchangeOptions {
            request_timeout: Duration::from_secs(5),
            reveal: RevealCadence {
                chunk_chars: 3,
                tick: Duration::ZERO,
            },
        }
    }

    fn count(events: &[RenderEvent], wanted: &RenderEvent) -> usize {
        events.iter().filter(|event| *event == wanted).count()
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let mut h = harness(fast()).await;
        let err = h.exchange.send("   \n\t").await.unwrap_err();
        assert_eq!(err, ExchangeError::Input(InputError::EmptyMessage));
        assert_eq!(h.backend.chat_calls(), 0);
        assert!(h.registry.current_session().unwrap().messages.is_empty());
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn streamed_reply_is_concatenated_and_persisted() {
        let mut h = harness(fast()).await;
        h.backend.push_reply(ScriptedReply::Stream(vec![
            "Hel".into(),
            "lo w".into(),
            "orld".into(),
        ]));

        let reply = h.exchange.send("greet me").await.unwrap();
        assert_eq!(reply.content, "Hello world");
        assert_eq!(reply.delivery, Delivery::Streamed);

        let messages = h.registry.current_session().unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].status, MessageStatus::Confirmed);
        assert_eq!(messages[1].role, MessageRole::Model);
        assert_eq!(messages[1].content, "Hello world");

        let events = drain(&mut h.rx);
        let updates = events
            .iter()
            .filter(|e| matches!(e, RenderEvent::ResponseUpdated { .. }))
            .count();
        assert_eq!(updates, 3);
        assert_eq!(count(&events, &RenderEvent::LoadingCleared), 1);
    }

    #[tokio::test]
    async fn rejected_reply_is_shown_but_not_persisted() {
        let mut h = harness(fast()).await;
        h.backend.push_reply(ScriptedReply::Status {
            status: 429,
            body: r#"{"error":"rate limited"}"#.into(),
        });

        let err = h.exchange.send("hello").await.unwrap_err();
        assert_eq!(
            err,
            ExchangeError::Transport(TransportError::Status {
                status: 429,
                message: "rate limited".into()
            })
        );

        let messages = h.registry.current_session().unwrap().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
        assert!(messages[0].is_pending());

        let events = drain(&mut h.rx);
        assert_eq!(count(&events, &RenderEvent::LoadingCleared), 1);
        assert_eq!(
            events.last(),
            Some(&RenderEvent::TurnFailed {
                message: "rate limited".into()
            })
        );
        assert!(!events.iter().any(|event| matches!(
            event,
            RenderEvent::MessageAppended {
                role: DisplayRole::Ai,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn legacy_json_reply_uses_response_field() {
        let mut h = harness(fast()).await;
        h.backend
            .push_reply(ScriptedReply::Json("Legacy answer".into()));

        let reply = h.exchange.send("old server?").await.unwrap();
        assert_eq!(reply.content, "Legacy answer");
        assert_eq!(reply.delivery, Delivery::LegacyJson);
        assert!(drain(&mut h.rx).contains(&RenderEvent::MessageAppended {
            role: DisplayRole::Ai,
            content: "Legacy answer".into()
        }));
    }

    #[test]
    fn legacy_body_falls_back_to_raw_text() {
        let value: Value = serde_json::from_str(r#"{"other":1}"#).unwrap();
        assert_eq!(
            legacy_reply_text(r#"{"other":1}"#, Some(&value)).unwrap(),
            r#"{"other":1}"#
        );
        assert_eq!(legacy_reply_text("not json", None).unwrap(), "not json");
        let error: Value = serde_json::from_str(r#"{"error":"quota"}"#).unwrap();
        assert_eq!(
            legacy_reply_text("", Some(&error)).unwrap_err(),
            TransportError::Backend("quota".into())
        );
    }

    #[tokio::test]
    async fn buffered_reply_is_revealed_before_commit() {
        let mut h = harness(fast()).await;
        h.backend.push_reply(ScriptedReply::Plain("abcdefg".into()));

        let reply = h.exchange.send("plain please").await.unwrap();
        assert_eq!(reply.delivery, Delivery::Revealed);
        let updates: Vec<String> = drain(&mut h.rx)
            .into_iter()
            .filter_map(|e| match e {
                RenderEvent::ResponseUpdated { text } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec!["abc", "abcdef", "abcdefg"]);
        assert_eq!(
            h.registry.current_session().unwrap().messages[1].content,
            "abcdefg"
        );
    }

    #[tokio::test]
    async fn history_excludes_current_message() {
        let h = harness(fast()).await;
        h.exchange.send("first").await.unwrap();
        h.exchange.send("second").await.unwrap();

        let log = h.backend.chat_log();
        assert!(log[0].request.history.is_empty());
        assert_eq!(log[1].request.message, "second");
        assert_eq!(log[1].request.history.len(), 2);
        assert_eq!(log[1].request.history[0].content, "first");
        assert!(log[1].request.chat_id.is_none());
        assert!(log[1].bearer.is_none());
    }

    #[tokio::test]
    async fn network_failure_removes_placeholder_once() {
        let mut h = harness(fast()).await;
        h.backend
            .push_reply(ScriptedReply::NetworkFailure("connection refused".into()));

        let err = h.exchange.send("anyone there?").await.unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Transport(TransportError::Network(_))
        ));
        let events = drain(&mut h.rx);
        assert_eq!(count(&events, &RenderEvent::LoadingStarted), 1);
        assert_eq!(count(&events, &RenderEvent::LoadingCleared), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_request_times_out() {
        let h = harness(ExchangeOptions {
            request_timeout: Duration::from_secs(2),
            ..fast()
        })
        .await;
        h.backend.push_reply(ScriptedReply::Hang);

        let err = h.exchange.send("slow").await.unwrap_err();
        assert_eq!(
            err,
            ExchangeError::Transport(TransportError::Timeout(Duration::from_secs(2)))
        );
        assert_eq!(h.registry.current_session().unwrap().messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_reveal_outlasts_request_timeout() {
        let mut h = harness(ExchangeOptions::default()).await;
        let body = "x".repeat(15_000);
        h.backend.push_reply(ScriptedReply::Plain(body.clone()));

        let started = tokio::time::Instant::now();
        let reply = h.exchange.send("tell me everything").await.unwrap();
        assert!(started.elapsed() > DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(reply.delivery, Delivery::Revealed);
        assert_eq!(reply.content, body);

        let messages = h.registry.current_session().unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content.len(), 15_000);
        assert!(!drain(&mut h.rx)
            .iter()
            .any(|event| matches!(event, RenderEvent::TurnFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn reveal_still_honours_cancellation() {
        let h = harness(ExchangeOptions::default()).await;
        h.backend.push_reply(ScriptedReply::Plain("y".repeat(3_000)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = h
            .exchange
            .send_with_cancel("long one", cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ExchangeError::Transport(TransportError::Cancelled));
        assert_eq!(h.registry.current_session().unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_turn_is_not_committed() {
        let h = harness(fast()).await;
        h.backend.push_reply(ScriptedReply::Hang);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .exchange
            .send_with_cancel("never mind", cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ExchangeError::Transport(TransportError::Cancelled));
        assert_eq!(h.registry.current_session().unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn no_selection_is_an_input_error() {
        let h = harness(fast()).await;
        h.registry.clear();
        let err = h.exchange.send("hello?").await.unwrap_err();
        assert_eq!(err, ExchangeError::Input(InputError::NoChatSelected));
        assert_eq!(h.backend.chat_calls(), 0);
    }
}
